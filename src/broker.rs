//! The publish side of the broker capability, bridged across the sync/async
//! boundary: peripheral workers run on blocking OS threads (remote transfers
//! block on network I/O) but the only safe way to use a `lapin::Channel` is
//! from the supervisor's async context. Workers never touch the channel
//! directly -- they hand outbound bodies to a `ReplySink`, which for the
//! production path is a `ChannelPublisher` backed by an unbounded
//! `tokio::sync::mpsc` channel drained by a dedicated publish task. This
//! keeps the "never publish while holding a remote transport resource" rule
//! structural rather than a convention to remember.

use std::sync::Mutex;

use tokio::sync::mpsc;

/// One outbound publish: a queue name and a raw JSON body.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub queue: String,
    pub body: Vec<u8>,
}

/// Capability workers and the router use to emit messages without owning
/// the broker channel themselves. `publish` is synchronous and non-blocking
/// so it can be called from worker threads and the command-channel drainer.
pub trait ReplySink: Send + Sync {
    fn publish(&self, queue: &str, body: Vec<u8>);
}

/// Production `ReplySink`: forwards onto an unbounded channel read by the
/// supervisor's publish-drain task, which performs the actual
/// `basic_publish` on its single shared `lapin::Channel`.
#[derive(Clone)]
pub struct ChannelPublisher {
    tx: mpsc::UnboundedSender<PublishRequest>,
}

impl ChannelPublisher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<PublishRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelPublisher { tx }, rx)
    }
}

impl ReplySink for ChannelPublisher {
    fn publish(&self, queue: &str, body: Vec<u8>) {
        if self.tx.send(PublishRequest { queue: queue.to_string(), body }).is_err() {
            tracing::warn!(queue, "publish bridge closed; dropping message");
        }
    }
}

/// In-memory `ReplySink` used by tests to assert on what was published
/// without a running broker.
#[derive(Default)]
pub struct RecordingSink {
    pub sent: Mutex<Vec<PublishRequest>>,
}

impl ReplySink for RecordingSink {
    fn publish(&self, queue: &str, body: Vec<u8>) {
        self.sent.lock().expect("recording sink mutex poisoned").push(PublishRequest {
            queue: queue.to_string(),
            body,
        });
    }
}

impl RecordingSink {
    pub fn queues(&self) -> Vec<String> {
        self.sent.lock().expect("recording sink mutex poisoned").iter().map(|r| r.queue.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_sink_collects_publishes() {
        let sink = RecordingSink::default();
        sink.publish("send_queue_index_1", b"{}".to_vec());
        sink.publish("q_out_a", b"hi".to_vec());
        assert_eq!(sink.queues(), vec!["send_queue_index_1", "q_out_a"]);
    }
}
