//! Cluster topology: role intent, external source and instance membership

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use kube::ResourceExt;
use tracing::warn;

use super::{TopologyError, TopologyResult};
use crate::crd::PostgresCluster;

/// Declared role of a cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleIntent {
    /// The cluster owns its data and has a write leader
    Primary,
    /// The cluster follows an external source through a designated primary
    Replica,
}

impl fmt::Display for RoleIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoleIntent::Primary => write!(f, "Primary"),
            RoleIntent::Replica => write!(f, "Replica"),
        }
    }
}

/// Identifier of a PostgreSQL instance (the pod name)
///
/// Ordering follows the trailing ordinal first so that `db-2` sorts before
/// `db-10`; names without an ordinal sort after all numbered ones.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Trailing `-<n>` ordinal, if any
    pub fn ordinal(&self) -> Option<u32> {
        let (_, suffix) = self.0.rsplit_once('-')?;
        if suffix.is_empty() || !suffix.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        suffix.parse().ok()
    }
}

impl Ord for InstanceId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.ordinal(), other.ordinal()) {
            (Some(a), Some(b)) => a.cmp(&b).then_with(|| self.0.cmp(&other.0)),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for InstanceId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Upstream cluster a replica cluster streams from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalSource {
    name: String,
    connection_parameters: BTreeMap<String, String>,
    credentials: SourceCredentials,
}

impl ExternalSource {
    /// Create a source; the `host` connection parameter is mandatory
    pub fn new(
        name: impl Into<String>,
        connection_parameters: BTreeMap<String, String>,
    ) -> TopologyResult<Self> {
        let name = name.into();
        match connection_parameters.get("host") {
            Some(host) if !host.trim().is_empty() => Ok(Self {
                name,
                connection_parameters,
                credentials: SourceCredentials::default(),
            }),
            _ => Err(TopologyError::Configuration(format!(
                "external cluster {} has no host connection parameter",
                name
            ))),
        }
    }

    /// Attach secret-backed credentials
    pub fn with_credentials(mut self, credentials: SourceCredentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &str {
        self.connection_parameters
            .get("host")
            .map(String::as_str)
            .unwrap_or_default()
    }

    pub fn connection_parameters(&self) -> &BTreeMap<String, String> {
        &self.connection_parameters
    }

    pub fn credentials(&self) -> &SourceCredentials {
        &self.credentials
    }

    /// Render a libpq `primary_conninfo` string for the given standby
    ///
    /// Credentials override same-named connection parameters. A CA bundle
    /// without an explicit `sslmode` verifies the server fully.
    pub fn conninfo(&self, application_name: &str) -> String {
        let mut params = self.connection_parameters.clone();
        let c = &self.credentials;
        for (key, value) in [
            ("password", &c.password),
            ("sslcert", &c.ssl_cert),
            ("sslkey", &c.ssl_key),
            ("sslrootcert", &c.ssl_root_cert),
        ] {
            if let Some(value) = value {
                params.insert(key.to_string(), value.clone());
            }
        }
        if c.ssl_root_cert.is_some() {
            params
                .entry("sslmode".to_string())
                .or_insert_with(|| "verify-full".to_string());
        }
        render_conninfo(&params, application_name)
    }
}

/// Resolved authentication material for an external source
///
/// The password is the secret value itself; the certificate fields are file
/// paths on the instance.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SourceCredentials {
    pub password: Option<String>,
    pub ssl_cert: Option<String>,
    pub ssl_key: Option<String>,
    pub ssl_root_cert: Option<String>,
}

impl fmt::Debug for SourceCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCredentials")
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_cert", &self.ssl_cert)
            .field("ssl_key", &self.ssl_key)
            .field("ssl_root_cert", &self.ssl_root_cert)
            .finish()
    }
}

/// Render connection parameters as a libpq connection string
///
/// Any `application_name` in `params` is replaced by the given one, which
/// is how the upstream reports the standby in `pg_stat_replication`.
pub fn render_conninfo(params: &BTreeMap<String, String>, application_name: &str) -> String {
    let mut parts: Vec<String> = params
        .iter()
        .filter(|(k, _)| k.as_str() != "application_name")
        .map(|(k, v)| format!("{}={}", k, quote_conninfo_value(v)))
        .collect();
    parts.push(format!(
        "application_name={}",
        quote_conninfo_value(application_name)
    ));
    parts.join(" ")
}

/// Quote a libpq connection string value
pub fn quote_conninfo_value(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Maps instance ids to the host names standbys connect to, and back
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceAddressing {
    cluster: String,
    namespace: String,
}

impl InstanceAddressing {
    pub fn new(cluster: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            namespace: namespace.into(),
        }
    }

    /// Stable DNS name of an instance behind the headless service
    pub fn host_for(&self, id: &InstanceId) -> String {
        format!("{}.{}-headless.{}.svc", id, self.cluster, self.namespace)
    }

    /// Resolve an observed `sender_host` to one of the given instances
    pub fn resolve<'a>(&self, host: &str, instances: &'a [InstanceId]) -> Option<&'a InstanceId> {
        instances.iter().find(|id| {
            host == id.as_str()
                || host == self.host_for(id)
                || host.starts_with(&format!("{}.", id))
        })
    }
}

/// One managed PostgreSQL cluster as seen by the switchover controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterTopology {
    name: String,
    intent: RoleIntent,
    external_source: Option<ExternalSource>,
    instances: Vec<InstanceId>,
    current_primary: Option<InstanceId>,
    ready_instances: usize,
}

impl ClusterTopology {
    /// Build a topology, rejecting inconsistent intent/source pairs,
    /// duplicate instances and a primary that is not a member
    pub fn new(
        name: impl Into<String>,
        intent: RoleIntent,
        external_source: Option<ExternalSource>,
        instances: Vec<InstanceId>,
        current_primary: Option<InstanceId>,
        ready_instances: usize,
    ) -> TopologyResult<Self> {
        let name = name.into();
        check_intent(&name, intent, external_source.as_ref())?;

        let unique: BTreeSet<&InstanceId> = instances.iter().collect();
        if unique.len() != instances.len() {
            return Err(TopologyError::Configuration(format!(
                "cluster {} lists duplicate instances",
                name
            )));
        }

        let mut instances = instances;
        instances.sort();

        if let Some(primary) = &current_primary
            && !instances.contains(primary)
        {
            return Err(TopologyError::Configuration(format!(
                "current primary {} is not a member of cluster {}",
                primary, name
            )));
        }

        Ok(Self {
            name,
            intent,
            external_source,
            instances,
            current_primary,
            ready_instances,
        })
    }

    /// Build the topology from a PostgresCluster resource and its observed instances
    pub fn from_cluster(
        cluster: &PostgresCluster,
        instances: Vec<InstanceId>,
        ready_instances: usize,
    ) -> TopologyResult<Self> {
        let name = cluster.name_any();
        let (intent, external_source) = intent_from_spec(cluster)?;

        let current_primary = cluster
            .status
            .as_ref()
            .and_then(|s| s.current_primary.as_deref())
            .map(InstanceId::from)
            .filter(|primary| {
                let member = instances.contains(primary);
                if !member {
                    warn!(
                        cluster = %name,
                        primary = %primary,
                        "Recorded primary is no longer a member, re-electing"
                    );
                }
                member
            });

        Self::new(
            name,
            intent,
            external_source,
            instances,
            current_primary,
            ready_instances,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn intent(&self) -> RoleIntent {
        self.intent
    }

    pub fn external_source(&self) -> Option<&ExternalSource> {
        self.external_source.as_ref()
    }

    pub fn instances(&self) -> &[InstanceId] {
        &self.instances
    }

    pub fn current_primary(&self) -> Option<&InstanceId> {
        self.current_primary.as_ref()
    }

    pub fn ready_instances(&self) -> usize {
        self.ready_instances
    }

    pub fn is_member(&self, id: &InstanceId) -> bool {
        self.instances.contains(id)
    }

    /// Every member except the current primary
    pub fn standbys(&self) -> impl Iterator<Item = &InstanceId> {
        self.instances
            .iter()
            .filter(move |id| Some(*id) != self.current_primary.as_ref())
    }

    /// Change the declared role; the source must be given exactly when the intent is Replica
    pub fn set_intent(
        &mut self,
        intent: RoleIntent,
        external_source: Option<ExternalSource>,
    ) -> TopologyResult<()> {
        check_intent(&self.name, intent, external_source.as_ref())?;
        self.intent = intent;
        self.external_source = external_source;
        Ok(())
    }

    /// Replace the credentials of the external source, if there is one
    pub fn set_source_credentials(&mut self, credentials: SourceCredentials) {
        if let Some(source) = &mut self.external_source {
            source.credentials = credentials;
        }
    }

    /// Record the designated primary, which must be a member
    pub(crate) fn set_current_primary(&mut self, id: InstanceId) -> TopologyResult<()> {
        if !self.is_member(&id) {
            return Err(TopologyError::Configuration(format!(
                "cannot elect {}: not a member of cluster {}",
                id, self.name
            )));
        }
        self.current_primary = Some(id);
        Ok(())
    }
}

fn check_intent(
    cluster: &str,
    intent: RoleIntent,
    external_source: Option<&ExternalSource>,
) -> TopologyResult<()> {
    match (intent, external_source) {
        (RoleIntent::Primary, Some(source)) => Err(TopologyError::Configuration(format!(
            "cluster {} is declared primary but has external source {}",
            cluster,
            source.name()
        ))),
        (RoleIntent::Replica, None) => Err(TopologyError::Configuration(format!(
            "cluster {} is declared replica but has no external source",
            cluster
        ))),
        _ => Ok(()),
    }
}

/// Derive the role intent and the external source from the resource spec
pub fn intent_from_spec(
    cluster: &PostgresCluster,
) -> TopologyResult<(RoleIntent, Option<ExternalSource>)> {
    let spec = &cluster.spec;
    let Some(replica) = spec.replica.as_ref().filter(|r| r.enabled) else {
        return Ok((RoleIntent::Primary, None));
    };

    let external = spec.external_cluster(&replica.source).ok_or_else(|| {
        TopologyError::Configuration(format!(
            "replica source {} is not defined in externalClusters",
            replica.source
        ))
    })?;

    let source = ExternalSource::new(&external.name, external.connection_parameters.clone())?;
    Ok((RoleIntent::Replica, Some(source)))
}
