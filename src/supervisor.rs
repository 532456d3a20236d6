//! Broker connection lifecycle (C4): owns the `lapin` connection and
//! channel, declares the full topology for one configuration generation,
//! binds peripheral and trigger-queue consumers, and recovers from
//! connection loss. Driven from a dedicated current-thread Tokio runtime on
//! its own OS thread -- remote transfers stay on blocking threads exactly as
//! the teacher's upload/download workers do, and only this context ever
//! touches the broker channel. Grounded on the reconnect-with-backoff
//! pattern from the retrieval pack's RabbitMQ consumer reference
//! (`backoff::future::retry_notify` wrapping a connect-and-consume future).

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backoff::ExponentialBackoff;
use crossbeam_channel::Sender;
use futures::StreamExt;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties, Consumer};

use crate::broker::{ChannelPublisher, ReplySink};
use crate::config::BrokerConfig;
use crate::error::{ConfigError, GatewayError, TransportError};
use crate::model::Message;
use crate::router::AutomationRouter;
use crate::store::ConfigStore;
use crate::worker::{CommandOutcome, PeripheralWorker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SupervisorState {
    Stopped,
    Connecting,
    Declaring,
    Consuming,
    Draining,
}

pub struct BrokerSupervisor {
    config: BrokerConfig,
    store: Arc<ConfigStore>,
    running: Arc<AtomicBool>,
    reconnect_requested: Arc<AtomicBool>,
    state: Mutex<SupervisorState>,
}

impl BrokerSupervisor {
    pub fn new(config: BrokerConfig, store: Arc<ConfigStore>) -> Self {
        BrokerSupervisor {
            config,
            store,
            running: Arc::new(AtomicBool::new(true)),
            reconnect_requested: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(SupervisorState::Stopped),
        }
    }

    /// Forces one tear-down/rebuild cycle. Idempotent while a cycle is
    /// already pending or in flight -- the flag collapses any number of
    /// calls landing before it is consumed into exactly one follow-up
    /// cycle, which is what `ReconfigureController` relies on to serialize
    /// bursts of configuration mutations.
    pub fn reconnect_now(&self) {
        self.reconnect_requested.store(true, Ordering::SeqCst);
    }

    /// Requests a graceful stop: the current consuming loop (if any) drains
    /// and the supervisor thread returns instead of reconnecting.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    fn set_state(&self, s: SupervisorState) {
        *self.state.lock().expect("supervisor state mutex poisoned") = s;
        tracing::debug!(?s, "supervisor state transition");
    }

    /// Spawns the dedicated OS thread running this supervisor's current-
    /// thread Tokio runtime to completion.
    pub fn run_blocking(self: Arc<Self>) -> std::thread::JoinHandle<()> {
        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build supervisor tokio runtime");
            runtime.block_on(self.run());
        })
    }

    /// Runs the supervisor to completion on the calling (async) context.
    /// STOPPED -> CONNECTING on entry; CONNECTING <-> DECLARING <->
    /// CONSUMING per a normal cycle; a broker error returns to CONNECTING, a
    /// stop/reconnect request or an exhausted `running` flag moves to
    /// STOPPED. A `ConfigError` raised while building the topology (§7: "at
    /// topology-build time -> supervisor stops rather than silently running
    /// with a partial topology") also moves straight to STOPPED rather than
    /// retrying -- the configuration won't fix itself on a timer.
    pub async fn run(&self) {
        while self.running.load(Ordering::SeqCst) {
            self.reconnect_requested.store(false, Ordering::SeqCst);
            match self.connect_and_consume().await {
                Ok(()) => {}
                Err(GatewayError::Config(e)) => {
                    tracing::error!(error = %e, "invalid peripheral/automation configuration; supervisor stopping");
                    self.running.store(false, Ordering::SeqCst);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "broker connection lost; will retry");
                }
            }
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            self.set_state(SupervisorState::Connecting);
            tokio::time::sleep(Duration::from_secs(self.config.retry_delay_secs)).await;
        }
        self.set_state(SupervisorState::Stopped);
    }

    async fn connect_and_consume(&self) -> Result<(), GatewayError> {
        let peripherals = self.store.get_peripherals();
        let automations = self.store.get_automations();
        validate_peripheral_topology(&peripherals)?;

        let connection = self.connect().await?;
        self.set_state(SupervisorState::Declaring);
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| TransportError::BrokerChannel(e.to_string()))?;
        channel
            .basic_qos(1, BasicQosOptions::default())
            .await
            .map_err(|e| TransportError::BrokerChannel(e.to_string()))?;

        let router = Arc::new(AutomationRouter::build(&automations));

        let (publisher, mut publish_rx) = ChannelPublisher::new();
        let publisher: Arc<dyn ReplySink> = Arc::new(publisher);

        let mut workers: HashMap<i64, Arc<PeripheralWorker>> = HashMap::new();
        let mut peripheral_channels: HashMap<i64, Sender<Message>> = HashMap::new();
        let mut index_channels: HashMap<String, Sender<Message>> = HashMap::new();
        let mut drain_handles = Vec::new();

        for peripheral in peripherals {
            let vi = peripheral.virtual_index().expect("validated above").to_string();
            let recv_queue = format!("recv_queue_index_{vi}");
            let send_queue = format!("send_queue_index_{vi}");
            self.declare_queue(&channel, &recv_queue).await?;
            self.declare_queue(&channel, &send_queue).await?;

            let id = peripheral.id;
            let worker = Arc::new(PeripheralWorker::new(peripheral, self.store.clone()));
            peripheral_channels.insert(id, worker.command_channel());
            index_channels.insert(vi.clone(), worker.command_channel());
            drain_handles.push(worker.clone().spawn_drainer(publisher.clone()));

            let consumer = channel
                .basic_consume(&recv_queue, &format!("worker-{vi}"), BasicConsumeOptions::default(), FieldTable::default())
                .await
                .map_err(|e| TransportError::BrokerChannel(e.to_string()))?;
            tokio::spawn(consume_worker_queue(consumer, worker.clone(), publisher.clone()));
            workers.insert(id, worker);
        }

        for automation in &automations {
            for trigger in &automation.triggers {
                self.declare_queue(&channel, &trigger.queue_name).await?;
                let consumer = channel
                    .basic_consume(
                        &trigger.queue_name,
                        &format!("router-{}", trigger.id),
                        BasicConsumeOptions::default(),
                        FieldTable::default(),
                    )
                    .await
                    .map_err(|e| TransportError::BrokerChannel(e.to_string()))?;
                tokio::spawn(consume_trigger_queue(
                    consumer,
                    trigger.queue_name.clone(),
                    router.clone(),
                    publisher.clone(),
                    peripheral_channels.clone(),
                    index_channels.clone(),
                ));
            }
        }

        let publish_channel = channel.clone();
        let publish_task = tokio::spawn(async move {
            while let Some(req) = publish_rx.recv().await {
                if let Err(e) = publish_channel
                    .basic_publish("", &req.queue, BasicPublishOptions::default(), &req.body, BasicProperties::default())
                    .await
                {
                    tracing::warn!(queue = %req.queue, error = %e, "failed to publish reply");
                }
            }
        });

        tracing::info!(workers = workers.len(), automations = automations.len(), "topology declared");
        self.set_state(SupervisorState::Consuming);

        while self.running.load(Ordering::SeqCst) && !self.reconnect_requested.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        self.set_state(SupervisorState::Draining);
        publish_task.abort();
        drop(workers);
        drop(peripheral_channels);
        for handle in drain_handles {
            let _ = handle.join();
        }
        let _ = channel.close(200, "supervisor draining").await;
        let _ = connection.close(200, "supervisor draining").await;
        Ok(())
    }

    async fn declare_queue(&self, channel: &lapin::Channel, name: &str) -> Result<(), TransportError> {
        channel
            .queue_declare(name, QueueDeclareOptions { durable: true, ..Default::default() }, FieldTable::default())
            .await
            .map_err(|e| TransportError::BrokerChannel(e.to_string()))?;
        Ok(())
    }

    async fn connect(&self) -> Result<Connection, TransportError> {
        self.set_state(SupervisorState::Connecting);
        let url = self.config.amqp_url();
        let policy = ExponentialBackoff { max_elapsed_time: Some(Duration::from_secs(5)), ..ExponentialBackoff::default() };
        backoff::future::retry_notify(
            policy,
            || {
                let url = url.clone();
                async move {
                    let props = ConnectionProperties::default()
                        .with_executor(tokio_executor_trait::Tokio::current())
                        .with_reactor(tokio_reactor_trait::Tokio);
                    Connection::connect(&url, props)
                        .await
                        .map_err(|e| backoff::Error::transient(TransportError::BrokerConnect(e.to_string())))
                }
            },
            |err, dur| tracing::warn!(error = %err, retry_in = ?dur, "broker connect attempt failed"),
        )
        .await
    }

    /// Whether a reconnect cycle is currently pending. Exposed for tests and
    /// for any management-layer status endpoint that wants to report it.
    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_requested.load(Ordering::SeqCst)
    }
}

/// §3 invariant / §8 boundary property: a peripheral lacking a virtual index
/// is rejected before any connection attempt or queue is declared, so a
/// misconfigured peripheral never leaves the topology half-built and the
/// supervisor never opens a broker connection it is about to abort anyway.
fn validate_peripheral_topology(peripherals: &[crate::model::Peripheral]) -> Result<(), ConfigError> {
    for peripheral in peripherals {
        if peripheral.virtual_index().is_none() {
            return Err(ConfigError::MissingVirtualIndex(peripheral.name.clone()));
        }
    }
    Ok(())
}

async fn consume_worker_queue(mut consumer: Consumer, worker: Arc<PeripheralWorker>, sink: Arc<dyn ReplySink>) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "consumer error on peripheral queue");
                continue;
            }
        };
        let body = delivery.data.clone();
        let worker_for_task = worker.clone();
        let sink_for_task = sink.clone();
        let outcome = tokio::task::spawn_blocking(move || worker_for_task.handle(&body, sink_for_task.as_ref())).await;
        let nack = BasicNackOptions { requeue: false, ..Default::default() };
        match outcome {
            Ok(CommandOutcome::Ack) => {
                if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                    tracing::warn!(error = %e, "failed to ack delivery");
                }
            }
            Ok(CommandOutcome::Nack) => {
                if let Err(e) = delivery.nack(nack).await {
                    tracing::warn!(error = %e, "failed to nack delivery");
                }
            }
            Err(join_err) => {
                tracing::error!(error = %join_err, "worker handler panicked");
                let _ = delivery.nack(nack).await;
            }
        }
    }
}

async fn consume_trigger_queue(
    mut consumer: Consumer,
    queue_name: String,
    router: Arc<AutomationRouter>,
    sink: Arc<dyn ReplySink>,
    channels: HashMap<i64, Sender<Message>>,
    index_channels: HashMap<String, Sender<Message>>,
) {
    while let Some(delivery) = consumer.next().await {
        let delivery = match delivery {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "consumer error on trigger queue");
                continue;
            }
        };
        router.route(&queue_name, &delivery.data, sink.as_ref(), &channels, &index_channels);
        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
            tracing::warn!(error = %e, "failed to ack trigger delivery");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionParams, Peripheral, Protocol};
    use std::collections::HashMap;

    fn peripheral_with_channels(channel_to_virtual_index: HashMap<String, String>) -> Peripheral {
        Peripheral {
            id: 1,
            name: "door".into(),
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
            server_side_path: "/srv".into(),
            remote_side_path: "/".into(),
        }
    }

    #[test]
    fn topology_validation_accepts_peripheral_with_virtual_index() {
        let mut channels = HashMap::new();
        channels.insert("main_index".to_string(), "7".to_string());
        let peripherals = vec![peripheral_with_channels(channels)];
        assert!(validate_peripheral_topology(&peripherals).is_ok());
    }

    #[test]
    fn topology_validation_rejects_peripheral_missing_virtual_index() {
        let peripherals = vec![peripheral_with_channels(HashMap::new())];
        let err = validate_peripheral_topology(&peripherals).expect_err("must reject");
        assert!(matches!(err, ConfigError::MissingVirtualIndex(name) if name == "door"));
    }

    #[test]
    fn reconnect_now_sets_pending_flag() {
        let store = Arc::new(ConfigStore::open(":memory:").expect("open store"));
        let supervisor = BrokerSupervisor::new(BrokerConfig::default(), store);
        assert!(!supervisor.reconnect_pending());
        supervisor.reconnect_now();
        assert!(supervisor.reconnect_pending());
    }

    #[test]
    fn stop_clears_running_flag() {
        let store = Arc::new(ConfigStore::open(":memory:").expect("open store"));
        let supervisor = BrokerSupervisor::new(BrokerConfig::default(), store);
        assert!(supervisor.running.load(Ordering::SeqCst));
        supervisor.stop();
        assert!(!supervisor.running.load(Ordering::SeqCst));
    }
}
