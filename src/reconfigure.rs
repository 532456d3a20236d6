//! Reconfigure controller (C5): the seam the external management layer
//! calls through after mutating peripherals or automations. Trivial by
//! design -- it exists so that "a configuration changed" is a single,
//! auditable call site rather than callers reaching into the supervisor
//! directly, and so that bursts of mutations collapse into one rebuild
//! cycle instead of one per mutation.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::store::ConfigStore;
use crate::supervisor::BrokerSupervisor;

pub struct ReconfigureController {
    supervisor: Arc<BrokerSupervisor>,
    store: Arc<ConfigStore>,
    requests_seen: AtomicUsize,
}

impl ReconfigureController {
    pub fn new(supervisor: Arc<BrokerSupervisor>, store: Arc<ConfigStore>) -> Self {
        ReconfigureController { supervisor, store, requests_seen: AtomicUsize::new(0) }
    }

    /// Called by the management layer after peripherals or automations are
    /// mutated. `BrokerSupervisor::reconnect_now` is a single idempotent
    /// flag, so any number of calls landing before the supervisor picks up
    /// the pending cycle serialize into exactly one tear-down/rebuild --
    /// this method never blocks waiting for that cycle to finish.
    pub fn notify_configuration_changed(&self, reason: &str) {
        self.requests_seen.fetch_add(1, Ordering::SeqCst);
        self.store.log_operation("RECONFIGURE", "requested", reason);
        self.supervisor.reconnect_now();
    }

    /// Number of configuration-change notifications observed so far.
    /// Exposed for tests and for any management-layer status endpoint.
    pub fn requests_seen(&self) -> usize {
        self.requests_seen.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BrokerConfig;

    #[test]
    fn repeated_notifications_coalesce_into_one_pending_cycle() {
        let store = Arc::new(ConfigStore::open(":memory:").expect("open store"));
        let supervisor = Arc::new(BrokerSupervisor::new(BrokerConfig::default(), store.clone()));
        let controller = ReconfigureController::new(supervisor.clone(), store);

        controller.notify_configuration_changed("peripheral added");
        controller.notify_configuration_changed("peripheral removed");
        controller.notify_configuration_changed("automation edited");

        assert_eq!(controller.requests_seen(), 3);
        assert!(supervisor.reconnect_pending());
    }

    #[test]
    fn single_notification_sets_pending_cycle() {
        let store = Arc::new(ConfigStore::open(":memory:").expect("open store"));
        let supervisor = Arc::new(BrokerSupervisor::new(BrokerConfig::default(), store.clone()));
        let controller = ReconfigureController::new(supervisor.clone(), store);

        assert!(!supervisor.reconnect_pending());
        controller.notify_configuration_changed("peripheral added");
        assert!(supervisor.reconnect_pending());
        assert_eq!(controller.requests_seen(), 1);
    }
}
