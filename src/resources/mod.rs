pub mod instance;
pub mod postgres_client;
pub mod source_credentials;
pub mod sql;

pub use instance::{InstanceCommander, InstanceError, InstanceResult, PostgresInstanceClient};
