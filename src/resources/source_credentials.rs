//! Secret-backed credentials for external sources
//!
//! The password is read from its Secret and rendered into
//! `primary_conninfo`. Certificates stay on disk: instances mount each
//! referenced Secret under [`SOURCE_SECRETS_MOUNT`], and only the key's
//! presence is checked here.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};

use crate::crd::{ExternalCluster, SecretKeyRef};
use crate::resources::postgres_client::{PostgresClientError, PostgresClientResult};
use crate::topology::SourceCredentials;

/// Directory under which instances mount external source Secrets
pub const SOURCE_SECRETS_MOUNT: &str = "/etc/replica-sources";

/// Path of a secret key as mounted on every instance
pub fn mounted_path(secret_ref: &SecretKeyRef) -> String {
    format!("{}/{}/{}", SOURCE_SECRETS_MOUNT, secret_ref.name, secret_ref.key)
}

/// Every secret an external cluster references, deduplicated
fn referenced_secrets(external: &ExternalCluster) -> Vec<&str> {
    let mut names: Vec<&str> = [
        &external.password,
        &external.ssl_cert,
        &external.ssl_key,
        &external.ssl_root_cert,
    ]
    .into_iter()
    .flatten()
    .map(|r| r.name.as_str())
    .collect();
    names.sort_unstable();
    names.dedup();
    names
}

/// Fetch the referenced secrets and resolve the credentials
pub async fn fetch_source_credentials(
    client: &Client,
    namespace: &str,
    external: &ExternalCluster,
) -> PostgresClientResult<SourceCredentials> {
    let api: Api<Secret> = Api::namespaced(client.clone(), namespace);
    let mut secrets = BTreeMap::new();

    for name in referenced_secrets(external) {
        let secret = api.get(name).await.map_err(|e| match &e {
            kube::Error::Api(api_err) if api_err.code == 404 => {
                PostgresClientError::SecretNotFound(name.to_string())
            }
            _ => PostgresClientError::Kube(e),
        })?;
        secrets.insert(name.to_string(), secret);
    }

    resolve_credentials(external, &secrets)
}

/// Resolve credentials from already fetched secrets, by name
pub fn resolve_credentials(
    external: &ExternalCluster,
    secrets: &BTreeMap<String, Secret>,
) -> PostgresClientResult<SourceCredentials> {
    let password = match &external.password {
        Some(secret_ref) => {
            let bytes = secret_value(secrets, secret_ref)?;
            let password =
                String::from_utf8(bytes).map_err(|_| PostgresClientError::InvalidUtf8)?;
            Some(password)
        }
        None => None,
    };

    let mounted = |secret_ref: &Option<SecretKeyRef>| -> PostgresClientResult<Option<String>> {
        match secret_ref {
            Some(secret_ref) => {
                secret_value(secrets, secret_ref)?;
                Ok(Some(mounted_path(secret_ref)))
            }
            None => Ok(None),
        }
    };

    Ok(SourceCredentials {
        password,
        ssl_cert: mounted(&external.ssl_cert)?,
        ssl_key: mounted(&external.ssl_key)?,
        ssl_root_cert: mounted(&external.ssl_root_cert)?,
    })
}

fn secret_value(
    secrets: &BTreeMap<String, Secret>,
    secret_ref: &SecretKeyRef,
) -> PostgresClientResult<Vec<u8>> {
    let secret = secrets
        .get(&secret_ref.name)
        .ok_or_else(|| PostgresClientError::SecretNotFound(secret_ref.name.clone()))?;

    let from_data = secret
        .data
        .as_ref()
        .and_then(|data| data.get(&secret_ref.key))
        .map(|value| value.0.clone());
    let from_string_data = || {
        secret
            .string_data
            .as_ref()
            .and_then(|data| data.get(&secret_ref.key))
            .map(|value| value.clone().into_bytes())
    };

    from_data.or_else(from_string_data).ok_or_else(|| {
        PostgresClientError::SecretMissingKey(format!("{}/{}", secret_ref.name, secret_ref.key))
    })
}
