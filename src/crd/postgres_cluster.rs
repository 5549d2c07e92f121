use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// PostgresCluster is the Schema for the postgresclusters API
#[derive(CustomResource, Serialize, Deserialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "postgres.example.com",
    version = "v1alpha1",
    kind = "PostgresCluster",
    plural = "postgresclusters",
    shortname = "pgc",
    namespaced,
    status = "PostgresClusterStatus",
    printcolumn = r#"{"name":"Instances", "type":"integer", "jsonPath":".spec.instances"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.switch.phase"}"#,
    printcolumn = r#"{"name":"Primary", "type":"string", "jsonPath":".status.currentPrimary"}"#,
    printcolumn = r#"{"name":"Ready", "type":"integer", "jsonPath":".status.readyInstances"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterSpec {
    /// Number of PostgreSQL instances in the cluster
    #[serde(default = "default_instances")]
    pub instances: i32,

    /// Replica cluster configuration
    ///
    /// When present and enabled, the cluster streams from the named external
    /// cluster through a single designated primary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replica: Option<ReplicaClusterSpec>,

    /// Clusters living outside this resource that can act as a streaming source
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub external_clusters: Vec<ExternalCluster>,

    /// Streaming replication settings used inside the cluster
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming: Option<StreamingSpec>,
}

fn default_instances() -> i32 {
    1
}

impl PostgresClusterSpec {
    /// Whether the owner has declared the cluster as a replica of an external source
    pub fn replica_enabled(&self) -> bool {
        self.replica.as_ref().is_some_and(|r| r.enabled)
    }

    /// Look up an external cluster by name
    pub fn external_cluster(&self, name: &str) -> Option<&ExternalCluster> {
        self.external_clusters.iter().find(|c| c.name == name)
    }

    /// Replication user for intra-cluster streaming
    pub fn replication_user(&self) -> &str {
        self.streaming
            .as_ref()
            .map(|s| s.replication_user.as_str())
            .unwrap_or(DEFAULT_REPLICATION_USER)
    }

    /// PostgreSQL port used by every instance
    pub fn port(&self) -> u16 {
        self.streaming
            .as_ref()
            .map(|s| s.port)
            .unwrap_or(DEFAULT_POSTGRES_PORT)
    }
}

/// Label carrying the owning cluster name on every instance pod
pub const CLUSTER_LABEL: &str = "postgres.example.com/cluster";

/// Default user for streaming replication connections
pub const DEFAULT_REPLICATION_USER: &str = "streaming_replica";

/// Default PostgreSQL port
pub const DEFAULT_POSTGRES_PORT: u16 = 5432;

/// Replica cluster intent
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaClusterSpec {
    /// Whether the cluster acts as a replica of `source`
    pub enabled: bool,

    /// Name of the entry in `externalClusters` to stream from
    pub source: String,
}

/// An external cluster reachable through libpq connection parameters
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExternalCluster {
    /// Name referenced by `replica.source`
    pub name: String,

    /// libpq connection parameters (e.g. host, port, user, dbname, sslmode)
    #[serde(default)]
    pub connection_parameters: BTreeMap<String, String>,

    /// Password of the connecting user, for basic authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<SecretKeyRef>,

    /// PEM client certificate, for TLS client authentication
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_cert: Option<SecretKeyRef>,

    /// PEM private key matching `sslCert`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_key: Option<SecretKeyRef>,

    /// PEM CA bundle used to verify the external server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl_root_cert: Option<SecretKeyRef>,
}

/// A key inside a Secret in the cluster's namespace
///
/// Certificate keys are read by the instances from the Secret mounted at
/// `/etc/replica-sources/<name>/<key>`; only the password is read by the
/// operator.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeyRef {
    /// Secret name
    pub name: String,

    /// Key within the secret
    pub key: String,
}

/// Intra-cluster streaming settings
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct StreamingSpec {
    /// User the standbys authenticate as
    #[serde(default = "default_replication_user")]
    pub replication_user: String,

    /// PostgreSQL port of every instance
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_replication_user() -> String {
    DEFAULT_REPLICATION_USER.to_string()
}

fn default_port() -> u16 {
    DEFAULT_POSTGRES_PORT
}

/// Status of the PostgresCluster
///
/// Status is written as a JSON merge patch, where an omitted key keeps the
/// stored value. Optional fields therefore always serialize, as `null` when
/// unset, so clearing them reaches the API server.
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostgresClusterStatus {
    /// Persisted switchover state machine record
    #[serde(default)]
    pub switch: Option<SwitchStatus>,

    /// Instance currently acting as write leader or designated primary
    #[serde(default)]
    pub current_primary: Option<String>,

    /// Names of the instances observed on the last pass
    #[serde(default)]
    pub instance_names: Vec<String>,

    /// Number of instances passing health checks
    #[serde(default)]
    pub ready_instances: i32,

    /// Observed generation of the resource
    #[serde(default)]
    pub observed_generation: Option<i64>,

    /// Kubernetes-style conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Persisted state of the switchover state machine
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SwitchStatus {
    /// Current phase
    pub phase: SwitchPhase,

    /// Transition that was in flight when the cluster entered `Failed`
    #[serde(default)]
    pub failed_during: Option<SwitchPhase>,

    /// Consecutive failed attempts in the current phase
    #[serde(default)]
    pub attempts: u32,

    /// Consecutive passes that ended with unresolved streaming drift
    #[serde(default)]
    pub drift_passes: u32,

    /// Name of the external source the cluster streams from (replica phases only)
    #[serde(default)]
    pub source: Option<String>,

    /// Instance a promotion or demotion acts on
    ///
    /// Pinned when the transition starts and kept until it completes, including
    /// through `Failed`, so an in-flight switch never moves to another instance.
    #[serde(default)]
    pub target: Option<String>,

    /// When the current promotion or demotion started
    #[serde(default)]
    pub transition_started_at: Option<String>,
}

/// Replica cluster switchover phase
#[derive(Serialize, Deserialize, Clone, Copy, Debug, JsonSchema, Default, PartialEq, Eq, Hash)]
pub enum SwitchPhase {
    /// Designated primary streams from the external source
    #[default]
    SteadyReplica,
    /// Current primary is the write leader
    SteadyPrimary,
    /// Designated primary is being promoted
    PromotingToPrimary,
    /// Write leader is being pointed at the external source
    DemotingToReplica,
    /// Retry checkpoint after an exhausted retry budget
    Failed,
}

impl SwitchPhase {
    /// Whether a promotion or demotion is in flight
    pub fn is_transitioning(&self) -> bool {
        matches!(
            self,
            SwitchPhase::PromotingToPrimary | SwitchPhase::DemotingToReplica
        )
    }
}

impl std::fmt::Display for SwitchPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SwitchPhase::SteadyReplica => write!(f, "SteadyReplica"),
            SwitchPhase::SteadyPrimary => write!(f, "SteadyPrimary"),
            SwitchPhase::PromotingToPrimary => write!(f, "PromotingToPrimary"),
            SwitchPhase::DemotingToReplica => write!(f, "DemotingToReplica"),
            SwitchPhase::Failed => write!(f, "Failed"),
        }
    }
}

/// Kubernetes-style condition
#[derive(Serialize, Deserialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    #[serde(rename = "type")]
    pub type_: String,

    /// Status of the condition: True, False, or Unknown
    pub status: String,

    /// Reason for the condition's last transition
    pub reason: String,

    /// Human-readable message
    pub message: String,

    /// Last time the condition transitioned
    pub last_transition_time: String,

    /// Generation observed when condition was set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}
