pub mod config;
pub mod context;
pub mod host;
pub mod observer;
pub mod registration;
pub mod request_table;
pub mod script_cache;
pub mod storage;
pub mod storage_worker;
pub mod worker_instance;
pub mod worker_registry;

mod job_coordinator;
mod register_job;
mod unregister_job;
mod version;

#[cfg(test)]
mod test_support;
