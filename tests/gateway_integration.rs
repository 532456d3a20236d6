//! Cross-module integration tests exercising the router, worker, and
//! reconfigure controller together through their public APIs, without a
//! live broker or remote server -- the broker boundary is the `ReplySink`
//! trait and the remote-transport boundary is the local filesystem, both of
//! which are exercised directly by unit tests inside their own modules.

use std::collections::HashMap;
use std::sync::Arc;

use crossbeam_channel::unbounded;
use edge_gateway::broker::RecordingSink;
use edge_gateway::config::BrokerConfig;
use edge_gateway::model::{Action, Automation, ConnectionParams, Peripheral, Protocol, Trigger};
use edge_gateway::reconfigure::ReconfigureController;
use edge_gateway::router::AutomationRouter;
use edge_gateway::store::ConfigStore;
use edge_gateway::supervisor::BrokerSupervisor;
use edge_gateway::worker::{CommandOutcome, PeripheralWorker};
use tempfile::tempdir;

fn peripheral(id: i64, vi: &str, server_side_path: &str) -> Peripheral {
    let mut channel_to_virtual_index = HashMap::new();
    channel_to_virtual_index.insert("main_index".to_string(), vi.to_string());
    Peripheral {
        id,
        name: format!("peripheral-{id}"),
        interface: "eth0".into(),
        connection_params: ConnectionParams {
            host: "127.0.0.1".into(),
            port: 21,
            user: "anon".into(),
            password: String::new(),
            protocol: Protocol::Ftp,
            timeout: 30,
            passive: true,
            local_path: None,
        },
        channel_to_virtual_index,
        server_side_path: server_side_path.to_string(),
        remote_side_path: "/remote".into(),
    }
}

/// Scenario 1: a multiplex_peripherals trigger fans a Message out to every
/// named peripheral's command channel, leaving unrelated queues untouched.
#[test]
fn fan_out_trigger_reaches_every_multiplexed_peripheral() {
    let automation = Automation {
        id: 1,
        name: "porta".into(),
        triggers: vec![Trigger { id: 1, automation_id: 1, description: "t".into(), queue_name: "entrada_casa".into() }],
        actions: vec![Action {
            id: 1,
            automation_id: 1,
            description: "multiplex_peripherals".into(),
            action_config: serde_json::json!({ "peripheral_ids": [1, 2] }),
        }],
    };
    let router = AutomationRouter::build(&[automation]);
    let sink = RecordingSink::default();
    let (tx1, rx1) = unbounded();
    let (tx2, rx2) = unbounded();
    let mut channels = HashMap::new();
    channels.insert(1, tx1);
    channels.insert(2, tx2);

    router.route("entrada_casa", br#"{"cmd":"ativar"}"#, &sink, &channels, &HashMap::new());

    assert_eq!(rx1.try_recv().expect("peripheral 1 receives").cmd, "ativar");
    assert_eq!(rx2.try_recv().expect("peripheral 2 receives").cmd, "ativar");
    assert!(sink.queues().is_empty(), "multiplex alone should not publish anywhere");
}

/// Scenario 2: a forward_to_rabbitmq action republishes the raw body
/// verbatim to every declared forward target.
#[test]
fn forward_action_republishes_verbatim_to_every_target() {
    let automation = Automation {
        id: 2,
        name: "espelho".into(),
        triggers: vec![Trigger { id: 2, automation_id: 2, description: "t".into(), queue_name: "q_in".into() }],
        actions: vec![Action {
            id: 2,
            automation_id: 2,
            description: "forward_to_rabbitmq".into(),
            action_config: serde_json::json!([{"sent_to": "q_out_a"}, {"sent_to": "q_out_b"}]),
        }],
    };
    let router = AutomationRouter::build(&[automation]);
    let sink = RecordingSink::default();
    let body = br#"{"hello":"world"}"#.to_vec();

    router.route("q_in", &body, &sink, &HashMap::new(), &HashMap::new());

    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|r| r.body == body));
    assert_eq!(sent[0].queue, "q_out_a");
    assert_eq!(sent[1].queue, "q_out_b");
}

/// Scenario 5: an unknown action tag always yields an ERROR reply on the
/// peripheral's outbound queue and acks rather than nacks the delivery.
#[test]
fn unknown_action_yields_error_reply_and_acks() {
    let dir = tempdir().unwrap();
    let store = Arc::new(ConfigStore::open(":memory:").unwrap());
    let worker = PeripheralWorker::new(peripheral(1, "7", dir.path().to_str().unwrap()), store);
    let sink = RecordingSink::default();

    let outcome = worker.handle(br#"{"action":"WAT","data":{"value":null}}"#, &sink);

    assert_eq!(outcome, CommandOutcome::Ack);
    let sent = sink.sent.lock().unwrap();
    assert_eq!(sent.len(), 1);
    let reply: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(reply["action"], "ERROR");
    assert_eq!(sent[0].queue, "send_queue_index_7");
}

/// A peripheral's GET_SERVER_FILE_TREE reaches all the way through the
/// worker to a real local directory, with no broker or remote server
/// involved -- local filesystem listing is in scope even without a
/// configured remote transport being reachable.
#[test]
fn get_server_file_tree_end_to_end_through_worker_handle() {
    let dir = tempdir().unwrap();
    std::fs::write(dir.path().join("readme.txt"), b"hi").unwrap();
    let store = Arc::new(ConfigStore::open(":memory:").unwrap());
    let worker = PeripheralWorker::new(peripheral(1, "3", dir.path().to_str().unwrap()), store);
    let sink = RecordingSink::default();

    let outcome = worker.handle(br#"{"action":"GET_SERVER_FILE_TREE","data":{"value":{}}}"#, &sink);

    assert_eq!(outcome, CommandOutcome::Ack);
    let sent = sink.sent.lock().unwrap();
    let reply: serde_json::Value = serde_json::from_slice(&sent[0].body).unwrap();
    assert_eq!(reply["action"], "SERVER_FILE_TREE");
    let entries = reply["data"]["value"]["entries"].as_array().unwrap();
    assert!(entries.iter().any(|e| e["name"] == "readme.txt"));
}

/// Reconfigure requests issued while a cycle is already pending coalesce:
/// the supervisor only ever observes one pending reconnect regardless of
/// how many configuration mutations were reported.
#[test]
fn reconfigure_requests_coalesce_into_one_pending_cycle() {
    let store = Arc::new(ConfigStore::open(":memory:").unwrap());
    let supervisor = Arc::new(BrokerSupervisor::new(BrokerConfig::default(), store.clone()));
    let controller = ReconfigureController::new(supervisor.clone(), store);

    assert!(!supervisor.reconnect_pending());
    for reason in ["peripheral added", "peripheral removed", "automation edited"] {
        controller.notify_configuration_changed(reason);
    }

    assert_eq!(controller.requests_seen(), 3);
    assert!(supervisor.reconnect_pending());
}

/// Stopping the supervisor clears its running flag so `run`'s outer loop
/// exits instead of attempting a further reconnect.
#[test]
fn stop_is_observable_before_any_connection_attempt() {
    let store = Arc::new(ConfigStore::open(":memory:").unwrap());
    let supervisor = Arc::new(BrokerSupervisor::new(BrokerConfig::default(), store));
    supervisor.stop();
    supervisor.reconnect_now();
    assert!(supervisor.reconnect_pending());
}
