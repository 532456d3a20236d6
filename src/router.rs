//! Automation routing (C3): matches an inbound trigger-queue delivery
//! against the configured automations and fans it out according to each
//! action's `ActionKind`. Synchronous and side-effect-free beyond the
//! `ReplySink`/`Sender<Message>` handles it is given -- the supervisor owns
//! when `route` is called and what queue it was called for.

use std::collections::HashMap;

use crossbeam_channel::Sender;

use crate::broker::ReplySink;
use crate::model::{ActionKind, Automation, Message};

/// One trigger queue bound to the actions of the automation that declared
/// it. Built once from `ConfigStore::get_automations` at topology-build
/// time; a configuration reload rebuilds the whole router rather than
/// patching it in place.
struct TriggerBinding {
    queue_name: String,
    actions: Vec<ActionKind>,
}

pub struct AutomationRouter {
    bindings: Vec<TriggerBinding>,
}

impl AutomationRouter {
    pub fn build(automations: &[Automation]) -> Self {
        let bindings = automations
            .iter()
            .flat_map(|automation| {
                let actions: Vec<ActionKind> =
                    automation.actions.iter().filter_map(ActionKind::parse).collect();
                automation.triggers.iter().map(move |trigger| TriggerBinding {
                    queue_name: trigger.queue_name.clone(),
                    actions: actions.clone(),
                })
            })
            .collect();
        AutomationRouter { bindings }
    }

    /// True if any trigger binds this queue name -- lets the supervisor
    /// decide whether a queue needs a router-backed consumer at all.
    pub fn handles(&self, queue_name: &str) -> bool {
        self.bindings.iter().any(|b| b.queue_name == queue_name)
    }

    /// Routes one delivery body received on `queue_name`, per the four-step
    /// evaluation in §4.3: parse the body into a `Message`; if it carries an
    /// `index` matching a configured peripheral's virtual index, enqueue it
    /// on that peripheral's command channel directly (step 2, independent of
    /// any automation action); then run the trigger's declared actions --
    /// `ForwardToRabbitmq` re-publishes the body verbatim to each target
    /// queue through `sink`, `MultiplexPeripherals` hands a clone of the same
    /// `Message` to each named peripheral's command channel. A target
    /// peripheral with a closed or unknown channel is logged and skipped --
    /// one unreachable peripheral must not stop delivery to the others.
    pub fn route(
        &self,
        queue_name: &str,
        body: &[u8],
        sink: &dyn ReplySink,
        peripheral_channels: &HashMap<i64, Sender<Message>>,
        index_channels: &HashMap<String, Sender<Message>>,
    ) {
        let msg = Message::from_bytes(body);

        if let Some(index) = msg.index.as_deref() {
            if let Some(tx) = index_channels.get(index) {
                if tx.send(msg.clone()).is_err() {
                    tracing::warn!(index, "command channel closed; dropping index-routed message");
                }
            }
        }

        for binding in self.bindings.iter().filter(|b| b.queue_name == queue_name) {
            for action in &binding.actions {
                match action {
                    ActionKind::ForwardToRabbitmq { targets } => {
                        for target in targets {
                            sink.publish(target, body.to_vec());
                        }
                    }
                    ActionKind::MultiplexPeripherals { peripheral_ids } => {
                        for id in peripheral_ids {
                            match peripheral_channels.get(id) {
                                Some(tx) => {
                                    if tx.send(msg.clone()).is_err() {
                                        tracing::warn!(
                                            peripheral_id = id,
                                            "command channel closed; dropping multiplexed message"
                                        );
                                    }
                                }
                                None => {
                                    tracing::warn!(peripheral_id = id, "multiplex target peripheral not configured");
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::RecordingSink;
    use crate::model::{Action, Trigger};
    use crossbeam_channel::unbounded;

    fn automation_forwarding(queue: &str, targets: &[&str]) -> Automation {
        Automation {
            id: 1,
            name: "forward".into(),
            triggers: vec![Trigger {
                id: 1,
                automation_id: 1,
                description: "t".into(),
                queue_name: queue.into(),
            }],
            actions: vec![Action {
                id: 1,
                automation_id: 1,
                description: "forward_to_rabbitmq".into(),
                action_config: serde_json::json!(
                    targets.iter().map(|t| serde_json::json!({"sent_to": t})).collect::<Vec<_>>()
                ),
            }],
        }
    }

    fn automation_multiplexing(queue: &str, peripheral_ids: &[i64]) -> Automation {
        Automation {
            id: 2,
            name: "multiplex".into(),
            triggers: vec![Trigger {
                id: 2,
                automation_id: 2,
                description: "t".into(),
                queue_name: queue.into(),
            }],
            actions: vec![Action {
                id: 2,
                automation_id: 2,
                description: "multiplex_peripherals".into(),
                action_config: serde_json::json!({ "peripheral_ids": peripheral_ids }),
            }],
        }
    }

    #[test]
    fn forward_to_rabbitmq_fans_out_to_every_target() {
        let router = AutomationRouter::build(&[automation_forwarding("entrada_casa", &["q_out_a", "q_out_b"])]);
        let sink = RecordingSink::default();
        router.route("entrada_casa", b"{\"cmd\":\"ativar\"}", &sink, &HashMap::new(), &HashMap::new());
        assert_eq!(sink.queues(), vec!["q_out_a".to_string(), "q_out_b".to_string()]);
    }

    #[test]
    fn unrelated_queue_does_not_match_binding() {
        let router = AutomationRouter::build(&[automation_forwarding("entrada_casa", &["q_out_a"])]);
        let sink = RecordingSink::default();
        router.route("outra_fila", b"{}", &sink, &HashMap::new(), &HashMap::new());
        assert!(sink.queues().is_empty());
        assert!(!router.handles("outra_fila"));
        assert!(router.handles("entrada_casa"));
    }

    #[test]
    fn multiplex_delivers_to_every_named_peripheral() {
        let router = AutomationRouter::build(&[automation_multiplexing("fan_trigger", &[10, 11])]);
        let sink = RecordingSink::default();
        let (tx10, rx10) = unbounded();
        let (tx11, rx11) = unbounded();
        let mut channels = HashMap::new();
        channels.insert(10, tx10);
        channels.insert(11, tx11);
        router.route("fan_trigger", br#"{"cmd":"ativar","index":"3"}"#, &sink, &channels, &HashMap::new());
        let m10 = rx10.try_recv().expect("peripheral 10 should receive");
        let m11 = rx11.try_recv().expect("peripheral 11 should receive");
        assert_eq!(m10.cmd, "ativar");
        assert_eq!(m11.cmd, "ativar");
    }

    #[test]
    fn multiplex_skips_unknown_peripheral_without_panicking() {
        let router = AutomationRouter::build(&[automation_multiplexing("fan_trigger", &[99])]);
        let sink = RecordingSink::default();
        router.route("fan_trigger", b"{}", &sink, &HashMap::new(), &HashMap::new());
        assert!(sink.queues().is_empty());
    }

    #[test]
    fn index_matched_message_reaches_its_peripheral_directly() {
        // §4.3 step 2: an `index`-carrying message is delivered to the
        // owning peripheral's command channel regardless of whether any
        // automation action also fires for this queue.
        let router = AutomationRouter::build(&[automation_forwarding("q_in", &["q_out"])]);
        let sink = RecordingSink::default();
        let (tx7, rx7) = unbounded();
        let mut index_channels = HashMap::new();
        index_channels.insert("7".to_string(), tx7);
        router.route(
            "q_in",
            br#"{"cmd":"STREAM_FILE","index":"7"}"#,
            &sink,
            &HashMap::new(),
            &index_channels,
        );
        let delivered = rx7.try_recv().expect("peripheral with matching index should receive");
        assert_eq!(delivered.cmd, "STREAM_FILE");
        assert_eq!(sink.queues(), vec!["q_out".to_string()]);
    }

    #[test]
    fn unmatched_index_is_ignored_without_panicking() {
        let router = AutomationRouter::build(&[automation_forwarding("q_in", &["q_out"])]);
        let sink = RecordingSink::default();
        router.route("q_in", br#"{"cmd":"x","index":"no-such-index"}"#, &sink, &HashMap::new(), &HashMap::new());
        assert_eq!(sink.queues(), vec!["q_out".to_string()]);
    }
}
