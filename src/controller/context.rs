use std::sync::Arc;

use kube::Client;

use crate::config::OperatorConfig;
use crate::controller::events::KubeEventNotifier;
use crate::health::HealthState;

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Operator settings read at startup
    pub config: OperatorConfig,
    /// Publishes promotion and demotion events
    pub notifier: Arc<KubeEventNotifier>,
    /// Health state for metrics, absent in tests
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    pub fn new(
        client: Client,
        config: OperatorConfig,
        reporter_instance: Option<String>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        let notifier = Arc::new(KubeEventNotifier::new(client.clone(), reporter_instance));
        Self {
            client,
            config,
            notifier,
            health_state,
        }
    }
}
