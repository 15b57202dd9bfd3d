use crate::error::{ServiceWorkerError, ServiceWorkerResult};

/// Serialized origin (`scheme://host[:port]`) of an http(s) URL.
///
/// Default ports are dropped and scheme/host are lowercased. Returns `None`
/// for anything that is not an absolute http(s) URL with a host.
pub fn origin_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let scheme = scheme.to_ascii_lowercase();
    let default_port = match scheme.as_str() {
        "http" => "80",
        "https" => "443",
        _ => return None,
    };

    let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
    let authority = &rest[..end];
    // Userinfo never contributes to the origin.
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    if host_port.is_empty() {
        return None;
    }

    let (host, port) = if let Some(stripped) = host_port.strip_prefix('[') {
        // IPv6 literal.
        let (inner, after) = stripped.split_once(']')?;
        (format!("[{inner}]"), after.strip_prefix(':'))
    } else {
        match host_port.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), Some(p)),
            None => (host_port.to_string(), None),
        }
    };
    if host.is_empty() || host == "[]" {
        return None;
    }
    if let Some(p) = port
        && !p.chars().all(|c| c.is_ascii_digit())
    {
        return None;
    }

    let host = host.to_ascii_lowercase();
    match port {
        Some(p) if !p.is_empty() && p != default_port => Some(format!("{scheme}://{host}:{p}")),
        _ => Some(format!("{scheme}://{host}")),
    }
}

/// Whether `url` falls under `scope`.
pub fn scope_matches(scope: &str, url: &str) -> bool {
    if scope.is_empty() {
        return false;
    }
    match (origin_of(scope), origin_of(url)) {
        (Some(a), Some(b)) if a == b => url.starts_with(scope),
        _ => false,
    }
}

/// Picks the longest scope that matches `url`.
pub fn longest_matching_scope<'a, I>(scopes: I, url: &str) -> Option<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    scopes
        .into_iter()
        .filter(|scope| scope_matches(scope, url))
        .max_by_key(|scope| scope.len())
}

fn path_of(url: &str) -> &str {
    let after_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path_start = after_scheme.find('/').unwrap_or(after_scheme.len());
    let path = &after_scheme[path_start..];
    let end = path.find(['?', '#']).unwrap_or(path.len());
    &path[..end]
}

/// Checks a `(scope, script_url)` pair before a register job is queued.
pub fn validate_registration(scope: &str, script_url: &str) -> ServiceWorkerResult<()> {
    let Some(scope_origin) = origin_of(scope) else {
        return Err(ServiceWorkerError::Disallowed(format!(
            "scope is not an http(s) url: {scope}"
        )));
    };
    let Some(script_origin) = origin_of(script_url) else {
        return Err(ServiceWorkerError::Disallowed(format!(
            "script is not an http(s) url: {script_url}"
        )));
    };
    if scope_origin != script_origin {
        return Err(ServiceWorkerError::Disallowed(format!(
            "scope origin {scope_origin} does not match script origin {script_origin}"
        )));
    }

    let lower = path_of(scope).to_ascii_lowercase();
    if lower.contains("%2f") || lower.contains("%5c") {
        return Err(ServiceWorkerError::Disallowed(
            "scope path contains an escaped slash".to_string(),
        ));
    }
    let lower = path_of(script_url).to_ascii_lowercase();
    if lower.contains("%2f") || lower.contains("%5c") {
        return Err(ServiceWorkerError::Disallowed(
            "script path contains an escaped slash".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_drops_default_port_and_path() {
        assert_eq!(
            origin_of("https://Example.com:443/app/sw.js").as_deref(),
            Some("https://example.com")
        );
        assert_eq!(
            origin_of("http://example.com:8080/app/").as_deref(),
            Some("http://example.com:8080")
        );
        assert_eq!(
            origin_of("http://user:pw@example.com/x").as_deref(),
            Some("http://example.com")
        );
    }

    #[test]
    fn origin_rejects_non_http() {
        assert_eq!(origin_of("file:///tmp/sw.js"), None);
        assert_eq!(origin_of("example.com/app"), None);
        assert_eq!(origin_of("https:///nohost"), None);
    }

    #[test]
    fn scope_match_is_prefix_within_origin() {
        assert!(scope_matches("https://a.test/app/", "https://a.test/app/page.html"));
        assert!(!scope_matches("https://a.test/app/", "https://a.test/other"));
        assert!(!scope_matches("https://a.test/app/", "https://b.test/app/page.html"));
    }

    #[test]
    fn longest_scope_wins() {
        let scopes = ["https://a.test/", "https://a.test/app/", "https://a.test/app/deep/"];
        assert_eq!(
            longest_matching_scope(scopes, "https://a.test/app/page"),
            Some("https://a.test/app/")
        );
        assert_eq!(
            longest_matching_scope(scopes, "https://a.test/app/deep/x"),
            Some("https://a.test/app/deep/")
        );
        assert_eq!(longest_matching_scope(scopes, "https://b.test/"), None);
    }

    #[test]
    fn cross_origin_script_is_disallowed() {
        let err = validate_registration("https://a.test/app/", "https://b.test/sw.js").unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Disallowed(_)));
        validate_registration("https://a.test/app/", "https://a.test/app/sw.js").unwrap();
    }

    #[test]
    fn escaped_slash_in_scope_is_disallowed() {
        let err = validate_registration("https://a.test/app%2Fx/", "https://a.test/sw.js").unwrap_err();
        assert!(matches!(err, ServiceWorkerError::Disallowed(_)));
    }
}
