//! PostgreSQL client for direct SQL connections to cluster instances
//!
//! The operator runs inside the Kubernetes cluster and reaches every instance
//! through its stable DNS name behind the headless service, so no port
//! forwarding is involved.

use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use thiserror::Error;
use tokio_postgres::NoTls;

/// Errors that can occur while connecting to PostgreSQL
#[derive(Error, Debug)]
pub enum PostgresClientError {
    #[error("Connection failed: {0}")]
    Connection(#[from] tokio_postgres::Error),

    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Credentials secret not found: {0}")]
    SecretNotFound(String),

    #[error("Secret missing required key: {0}")]
    SecretMissingKey(String),

    #[error("Invalid UTF-8 in secret data")]
    InvalidUtf8,

    #[error("Connection timeout")]
    Timeout,
}

/// Result type for PostgreSQL client operations
pub type PostgresClientResult<T> = Result<T, PostgresClientError>;

/// PostgreSQL connection credentials
#[derive(Clone)]
pub struct PostgresCredentials {
    pub username: String,
    pub password: String,
    pub database: String,
}

// Keep the password out of logs
impl std::fmt::Debug for PostgresCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresCredentials")
            .field("username", &self.username)
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl PostgresCredentials {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        database: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            database: database.into(),
        }
    }

    /// Extract superuser credentials from a cluster credentials Secret
    ///
    /// Expects the secret to contain the `POSTGRES_PASSWORD` key.
    pub fn from_cluster_secret(secret: &Secret) -> PostgresClientResult<Self> {
        let data = secret
            .data
            .as_ref()
            .ok_or_else(|| PostgresClientError::SecretMissingKey("no data in secret".into()))?;

        let password_bytes = data
            .get("POSTGRES_PASSWORD")
            .ok_or_else(|| PostgresClientError::SecretMissingKey("POSTGRES_PASSWORD".into()))?;

        let password = String::from_utf8(password_bytes.0.clone())
            .map_err(|_| PostgresClientError::InvalidUtf8)?;

        Ok(Self::new("postgres", password, "postgres"))
    }
}

/// Name of the secret holding a cluster's superuser credentials
pub fn credentials_secret_name(cluster_name: &str) -> String {
    format!("{}-credentials", cluster_name)
}

/// Fetch credentials from a cluster credentials Kubernetes secret
pub async fn fetch_credentials(
    client: &Client,
    namespace: &str,
    secret_name: &str,
) -> PostgresClientResult<PostgresCredentials> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), namespace);

    let secret = secrets.get(secret_name).await.map_err(|e| match &e {
        kube::Error::Api(api_err) if api_err.code == 404 => {
            PostgresClientError::SecretNotFound(secret_name.to_string())
        }
        _ => PostgresClientError::Kube(e),
    })?;

    PostgresCredentials::from_cluster_secret(&secret)
}

/// Open a connection to a single instance
///
/// The connection task is spawned onto the runtime and ends when the
/// returned client is dropped.
pub async fn connect(
    host: &str,
    port: u16,
    credentials: &PostgresCredentials,
    connect_timeout: Duration,
) -> PostgresClientResult<tokio_postgres::Client> {
    let mut config = tokio_postgres::Config::new();
    config
        .host(host)
        .port(port)
        .user(&credentials.username)
        .password(&credentials.password)
        .dbname(&credentials.database)
        .application_name("replica-switch-operator")
        .connect_timeout(connect_timeout);

    let (client, connection) = tokio::time::timeout(connect_timeout, config.connect(NoTls))
        .await
        .map_err(|_| PostgresClientError::Timeout)??;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            tracing::trace!(error = %e, "PostgreSQL connection closed");
        }
    });

    tracing::trace!(host, port, "PostgreSQL connection established");
    Ok(client)
}
