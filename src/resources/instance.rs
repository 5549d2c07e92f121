//! Outbound commands against individual PostgreSQL instances
//!
//! `InstanceCommander` is the narrow interface the switchover controller uses
//! to observe and reconfigure instances. `PostgresInstanceClient` implements
//! it with direct SQL connections plus a pod exec for demotion.

use std::future::Future;
use std::time::Duration;

use k8s_openapi::api::core::v1::Pod;
use kube::{Api, Client};
use thiserror::Error;
use tracing::{debug, info};

use crate::resources::postgres_client::{self, PostgresClientError, PostgresCredentials};
use crate::resources::sql::{self, ExecError};
use crate::topology::{InstanceAddressing, InstanceId, ObservedReplication};

/// Errors from instance observation or reconfiguration
#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Connection to {instance} failed: {source}")]
    Connection {
        instance: String,
        #[source]
        source: PostgresClientError,
    },

    #[error("Query failed: {0}")]
    Query(#[from] tokio_postgres::Error),

    #[error("Pod exec failed: {0}")]
    Exec(#[from] ExecError),

    #[error("Instance {instance} rejected {operation}")]
    Rejected { instance: String, operation: String },

    #[error("Instance {0} is unreachable")]
    Unreachable(String),
}

pub type InstanceResult<T> = std::result::Result<T, InstanceError>;

/// Observe and reconfigure instances of one cluster
pub trait InstanceCommander: Send + Sync {
    /// Read recovery state, upstream sender and connected followers
    fn observe(
        &self,
        instance: &InstanceId,
    ) -> impl Future<Output = InstanceResult<ObservedReplication>> + Send;

    /// Point the instance at an upstream, or clear its upstream with `None`
    fn set_upstream(
        &self,
        instance: &InstanceId,
        conninfo: Option<&str>,
    ) -> impl Future<Output = InstanceResult<()>> + Send;

    /// Leave recovery and become writable
    fn promote(&self, instance: &InstanceId) -> impl Future<Output = InstanceResult<()>> + Send;

    /// Restart the instance in recovery, streaming from `conninfo`
    fn demote(
        &self,
        instance: &InstanceId,
        conninfo: &str,
    ) -> impl Future<Output = InstanceResult<()>> + Send;
}

const OBSERVE_QUERY: &str = "SELECT pg_is_in_recovery(), \
     COALESCE((SELECT sender_host FROM pg_stat_wal_receiver LIMIT 1), ''), \
     ARRAY(SELECT application_name::text FROM pg_stat_replication ORDER BY application_name)";

/// `InstanceCommander` backed by tokio-postgres and the Kubernetes exec API
pub struct PostgresInstanceClient {
    pods: Api<Pod>,
    addressing: InstanceAddressing,
    port: u16,
    credentials: PostgresCredentials,
    connect_timeout: Duration,
    promote_wait: Duration,
}

impl PostgresInstanceClient {
    pub fn new(
        client: Client,
        namespace: &str,
        addressing: InstanceAddressing,
        port: u16,
        credentials: PostgresCredentials,
        timeout: Duration,
    ) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            addressing,
            port,
            credentials,
            connect_timeout: timeout.min(Duration::from_secs(10)),
            promote_wait: timeout,
        }
    }

    /// Build a client for a cluster, reading its superuser credentials
    pub async fn for_cluster(
        client: Client,
        namespace: &str,
        cluster_name: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, PostgresClientError> {
        let secret_name = postgres_client::credentials_secret_name(cluster_name);
        let credentials =
            postgres_client::fetch_credentials(&client, namespace, &secret_name).await?;
        Ok(Self::new(
            client,
            namespace,
            InstanceAddressing::new(cluster_name, namespace),
            port,
            credentials,
            timeout,
        ))
    }

    async fn connect(&self, instance: &InstanceId) -> InstanceResult<tokio_postgres::Client> {
        let host = self.addressing.host_for(instance);
        postgres_client::connect(&host, self.port, &self.credentials, self.connect_timeout)
            .await
            .map_err(|source| InstanceError::Connection {
                instance: instance.to_string(),
                source,
            })
    }
}

impl InstanceCommander for PostgresInstanceClient {
    async fn observe(&self, instance: &InstanceId) -> InstanceResult<ObservedReplication> {
        let client = self.connect(instance).await?;
        let row = client.query_one(OBSERVE_QUERY, &[]).await?;

        Ok(ObservedReplication {
            in_recovery: row.try_get(0)?,
            sender_host: row.try_get(1)?,
            followers: row.try_get(2)?,
        })
    }

    async fn set_upstream(&self, instance: &InstanceId, conninfo: Option<&str>) -> InstanceResult<()> {
        let client = self.connect(instance).await?;

        // ALTER SYSTEM cannot run inside a transaction block
        let statement = match conninfo {
            Some(conninfo) => format!(
                "ALTER SYSTEM SET primary_conninfo = {}",
                sql_literal(conninfo)
            ),
            None => "ALTER SYSTEM RESET primary_conninfo".to_string(),
        };
        client.batch_execute(&statement).await?;
        client.batch_execute("SELECT pg_reload_conf()").await?;

        debug!(instance = %instance, clear = conninfo.is_none(), "Updated primary_conninfo");
        Ok(())
    }

    async fn promote(&self, instance: &InstanceId) -> InstanceResult<()> {
        let client = self.connect(instance).await?;
        let wait_seconds = i32::try_from(self.promote_wait.as_secs()).unwrap_or(i32::MAX);
        let row = client
            .query_one("SELECT pg_promote(true, $1)", &[&wait_seconds])
            .await?;
        let promoted: bool = row.try_get(0)?;

        if !promoted {
            return Err(InstanceError::Rejected {
                instance: instance.to_string(),
                operation: "promotion".to_string(),
            });
        }
        info!(instance = %instance, "Instance promoted");
        Ok(())
    }

    async fn demote(&self, instance: &InstanceId, conninfo: &str) -> InstanceResult<()> {
        self.set_upstream(instance, Some(conninfo)).await?;
        sql::exec_demote(&self.pods, instance.as_str()).await?;
        info!(instance = %instance, "Instance restarting in recovery");
        Ok(())
    }
}

/// Quote a string as a SQL literal
fn sql_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
