//! Validation logic for PostgresCluster specs
//!
//! Validation failures are configuration errors: they are surfaced on the
//! switch condition and wait for corrected intent.

use std::collections::BTreeSet;

use crate::controller::error::{Error, Result};
use crate::crd::{ExternalCluster, PostgresCluster};

/// Minimum number of instances
pub const MIN_INSTANCES: i32 = 1;

/// Maximum number of instances (arbitrary limit for safety)
pub const MAX_INSTANCES: i32 = 100;

/// Validate the cluster spec
pub fn validate_spec(cluster: &PostgresCluster) -> Result<()> {
    validate_instances(cluster)?;
    validate_external_clusters(cluster)?;
    validate_replica_source(cluster)?;
    Ok(())
}

/// Validate instance count
fn validate_instances(cluster: &PostgresCluster) -> Result<()> {
    let instances = cluster.spec.instances;

    if instances < MIN_INSTANCES {
        return Err(Error::ConfigurationError(format!(
            "instance count {} is below minimum {}",
            instances, MIN_INSTANCES
        )));
    }

    if instances > MAX_INSTANCES {
        return Err(Error::ConfigurationError(format!(
            "instance count {} exceeds maximum {}",
            instances, MAX_INSTANCES
        )));
    }

    Ok(())
}

/// External cluster names must be unique and non-empty
fn validate_external_clusters(cluster: &PostgresCluster) -> Result<()> {
    let mut seen = BTreeSet::new();
    for external in &cluster.spec.external_clusters {
        if external.name.trim().is_empty() {
            return Err(Error::ConfigurationError(
                "externalClusters entries must have a name".to_string(),
            ));
        }
        if !seen.insert(external.name.as_str()) {
            return Err(Error::ConfigurationError(format!(
                "external cluster {} is defined more than once",
                external.name
            )));
        }
        validate_secret_refs(external)?;
    }
    Ok(())
}

/// Secret references must be complete, and a client certificate needs its key
fn validate_secret_refs(external: &ExternalCluster) -> Result<()> {
    let refs = [
        ("password", &external.password),
        ("sslCert", &external.ssl_cert),
        ("sslKey", &external.ssl_key),
        ("sslRootCert", &external.ssl_root_cert),
    ];
    for (field, secret_ref) in refs {
        if let Some(secret_ref) = secret_ref
            && (secret_ref.name.trim().is_empty() || secret_ref.key.trim().is_empty())
        {
            return Err(Error::ConfigurationError(format!(
                "external cluster {} {} needs a secret name and key",
                external.name, field
            )));
        }
    }

    if external.ssl_cert.is_some() != external.ssl_key.is_some() {
        return Err(Error::ConfigurationError(format!(
            "external cluster {} must set sslCert and sslKey together",
            external.name
        )));
    }
    Ok(())
}

/// A declared replica source must exist and carry a host
///
/// Checked even while `replica.enabled` is false, so a later demotion never
/// starts against a source that cannot be reached.
fn validate_replica_source(cluster: &PostgresCluster) -> Result<()> {
    let Some(replica) = cluster.spec.replica.as_ref() else {
        return Ok(());
    };

    let external = cluster
        .spec
        .external_cluster(&replica.source)
        .ok_or_else(|| {
            Error::ConfigurationError(format!(
                "replica source {} is not defined in externalClusters",
                replica.source
            ))
        })?;

    let has_host = external
        .connection_parameters
        .get("host")
        .is_some_and(|h| !h.trim().is_empty());
    if !has_host {
        return Err(Error::ConfigurationError(format!(
            "external cluster {} has no host in connectionParameters",
            external.name
        )));
    }

    Ok(())
}
