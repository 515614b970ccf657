use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Sender or receiver of a bus message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Endpoint {
    Agent(String),
    Dispatcher,
    /// Every listener, written as `*`.
    Broadcast,
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Endpoint::Agent(id) => f.write_str(id),
            Endpoint::Dispatcher => f.write_str("dispatcher"),
            Endpoint::Broadcast => f.write_str("*"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Assignment,
    StatusUpdate,
    Completion,
    Failure,
    Query,
}

/// One entry of the bus log. `seq` is the total order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub seq: u64,
    pub run_id: Option<Uuid>,
    pub from: Endpoint,
    pub to: Endpoint,
    pub kind: MessageKind,
    pub payload: serde_json::Value,
    /// Never earlier than the timestamp of the previous message.
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct BusState {
    log: Vec<Message>,
    next_seq: u64,
    last_timestamp: Option<DateTime<Utc>>,
}

/// Append-only, totally ordered message log with a live broadcast feed.
///
/// The bus only records what the dispatcher reports; it never touches task
/// or agent state.
pub struct MessageBus {
    state: Mutex<BusState>,
    feed: broadcast::Sender<Message>,
}

impl MessageBus {
    /// `capacity` bounds how far a feed subscriber may lag before it misses
    /// messages. The log itself is unbounded.
    pub fn new(capacity: usize) -> Self {
        let (feed, _) = broadcast::channel(capacity.max(1));
        Self {
            state: Mutex::new(BusState::default()),
            feed,
        }
    }

    /// Append a message and return its sequence number.
    pub fn publish(
        &self,
        run_id: Option<Uuid>,
        from: Endpoint,
        to: Endpoint,
        kind: MessageKind,
        payload: serde_json::Value,
    ) -> u64 {
        let mut state = self.state.lock();
        let now = Utc::now();
        let timestamp = state.last_timestamp.map_or(now, |last| last.max(now));
        let seq = state.next_seq;
        state.next_seq += 1;
        state.last_timestamp = Some(timestamp);

        let message = Message {
            seq,
            run_id,
            from,
            to,
            kind,
            payload,
            timestamp,
        };
        debug!(seq, kind = ?message.kind, from = %message.from, to = %message.to, "bus");
        // Sent under the lock so the feed sees the same order as the log.
        // No receivers is not an error.
        let _ = self.feed.send(message.clone());
        state.log.push(message);
        seq
    }

    /// The last `limit` messages, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<Message> {
        let state = self.state.lock();
        let start = state.log.len().saturating_sub(limit);
        state.log[start..].to_vec()
    }

    /// Messages with `seq > after`, oldest first.
    pub fn since(&self, after: u64) -> Vec<Message> {
        let state = self.state.lock();
        let start = state.log.partition_point(|m| m.seq <= after);
        state.log[start..].to_vec()
    }

    /// Messages belonging to one run, oldest first.
    pub fn for_run(&self, run_id: Uuid) -> Vec<Message> {
        self.state
            .lock()
            .log
            .iter()
            .filter(|m| m.run_id == Some(run_id))
            .cloned()
            .collect()
    }

    /// Number of messages stamped at or after `timestamp`.
    pub fn count_since(&self, timestamp: DateTime<Utc>) -> usize {
        let state = self.state.lock();
        let start = state.log.partition_point(|m| m.timestamp < timestamp);
        state.log.len() - start
    }

    pub fn len(&self) -> usize {
        self.state.lock().log.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live feed of messages published after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.feed.subscribe()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new(256)
    }
}
