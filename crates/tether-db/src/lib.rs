pub use sea_orm;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};

pub mod entities;

pub async fn connect(database_url: &str) -> Result<DatabaseConnection, sea_orm::DbErr> {
    let mut options = ConnectOptions::new(database_url.to_string());
    // The store expects one writer; sqlite serializes anyway.
    options.max_connections(1).sqlx_logging(false);
    Database::connect(options).await
}
