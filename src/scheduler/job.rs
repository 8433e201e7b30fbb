//! The caller-visible job handle.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use uuid::Uuid;

use crate::error::{Error, SharedError};
use crate::multicast::{Multicast, Replay, Subscription};
use crate::protocol::{InboundMessage, JobDescription, JobState, OutboundMessage};

/// Stream of validated output values (replay depth 1 for late observers).
pub type OutputStream = Subscription<Value>;
/// Stream of raw protocol messages.
pub type MessageStream = Subscription<OutboundMessage>;
/// Stream of one channel's validated values.
pub type ChannelStream = Subscription<Value>;

/// Handle to one scheduled job.
///
/// Created once per `schedule()` call; the handle is the job's identity
/// even when an execution strategy shares the underlying execution across
/// several handles. Cloning shares the same handle.
#[derive(Clone)]
pub struct Job {
    pub(crate) inner: Arc<JobInner>,
}

#[derive(Debug, Default)]
pub(crate) struct LifecycleTimes {
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) ended_at: Option<DateTime<Utc>>,
}

pub(crate) struct JobInner {
    pub(crate) name: String,
    pub(crate) argument: Value,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) times: Mutex<LifecycleTimes>,
    pub(crate) state_rx: watch::Receiver<JobState>,
    pub(crate) description_rx: watch::Receiver<Option<Arc<JobDescription>>>,
    pub(crate) inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    pub(crate) input_tx: mpsc::UnboundedSender<Value>,
    pub(crate) outbound: Multicast<OutboundMessage>,
    pub(crate) output: Multicast<Value>,
    pub(crate) channels: ChannelTable,
    pub(crate) pings: Mutex<HashMap<Uuid, oneshot::Sender<()>>>,
    pub(crate) ping_timeout: Option<Duration>,
}

impl JobInner {
    pub(crate) fn take_ping(&self, id: &Uuid) -> Option<oneshot::Sender<()>> {
        self.pings.lock().expect("ping table lock poisoned").remove(id)
    }

    pub(crate) fn clear_pings(&self) {
        self.pings.lock().expect("ping table lock poisoned").clear();
    }

    pub(crate) fn mark_started(&self) {
        let mut times = self.times.lock().expect("times lock poisoned");
        if times.started_at.is_none() {
            times.started_at = Some(Utc::now());
        }
    }

    pub(crate) fn mark_ended(&self) {
        let mut times = self.times.lock().expect("times lock poisoned");
        if times.ended_at.is_none() {
            times.ended_at = Some(Utc::now());
        }
    }
}

impl Job {
    /// The name this job was scheduled under.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The argument as passed to `schedule` (before validator coercion).
    pub fn argument(&self) -> &Value {
        &self.inner.argument
    }

    /// Current state.
    pub fn state(&self) -> JobState {
        *self.inner.state_rx.borrow()
    }

    /// Watch for state transitions.
    pub fn state_watch(&self) -> watch::Receiver<JobState> {
        self.inner.state_rx.clone()
    }

    /// When the job was scheduled.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.inner.created_at
    }

    /// When the handler started executing, if it has.
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.inner.times.lock().expect("times lock poisoned").started_at
    }

    /// When the job reached a terminal state, if it has.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        self.inner.times.lock().expect("times lock poisoned").ended_at
    }

    /// The job's description, once the handler has been resolved.
    ///
    /// Returns `None` if the job terminates without a resolution (e.g. the
    /// name does not exist).
    pub async fn description(&self) -> Option<Arc<JobDescription>> {
        let mut desc_rx = self.inner.description_rx.clone();
        let mut state_rx = self.inner.state_rx.clone();
        loop {
            if let Some(description) = &*desc_rx.borrow_and_update() {
                return Some(Arc::clone(description));
            }
            if state_rx.borrow_and_update().is_terminal() {
                return desc_rx.borrow().clone();
            }
            tokio::select! {
                changed = desc_rx.changed() => {
                    if changed.is_err() {
                        return desc_rx.borrow().clone();
                    }
                }
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        return desc_rx.borrow().clone();
                    }
                }
            }
        }
    }

    /// Subscribe to the validated output values.
    ///
    /// The underlying execution runs at most once no matter how many
    /// observers attach; a late observer receives the most recent value,
    /// then only future ones.
    pub fn output(&self) -> OutputStream {
        self.inner.output.subscribe()
    }

    /// Subscribe to the raw protocol message stream.
    pub fn outbound(&self) -> MessageStream {
        self.inner.outbound.subscribe()
    }

    /// Subscribe to a named channel, validated against the schema declared
    /// in the job's description.
    pub fn get_channel(&self, name: &str) -> ChannelStream {
        self.inner.channels.entry(name, None).subscribe()
    }

    /// Subscribe to a named channel, supplying the schema to validate its
    /// messages against. The schema is only used if this call creates the
    /// channel; an already-open channel keeps its schema.
    pub fn get_channel_with_schema(&self, name: &str, schema: Value) -> ChannelStream {
        self.inner.channels.entry(name, Some(schema)).subscribe()
    }

    /// Send a value into the job's input stream.
    ///
    /// Values failing the input schema are dropped before they reach the
    /// handler; sending after termination is a no-op. Input never errors.
    pub fn send_input(&self, value: Value) {
        let _ = self.inner.input_tx.send(value);
    }

    /// Send a ping and wait for the matching pong.
    pub async fn ping(&self) -> Result<(), SharedError> {
        if self.state().is_terminal() {
            return Err(Error::Handler(anyhow::anyhow!("job already terminated")).shared());
        }
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.inner
            .pings
            .lock()
            .expect("ping table lock poisoned")
            .insert(id, tx);
        if self
            .inner
            .inbound_tx
            .send(InboundMessage::Ping { id })
            .is_err()
        {
            self.inner.take_ping(&id);
            return Err(Error::Handler(anyhow::anyhow!("job inbound bus closed")).shared());
        }
        // The pong resolves the oneshot; job termination drops it. The
        // state watch covers the window where termination races the
        // registration above.
        let mut state_rx = self.inner.state_rx.clone();
        let answered = async move {
            tokio::select! {
                biased;
                result = rx => result.is_ok(),
                _ = state_rx.wait_for(|state| state.is_terminal()) => false,
            }
        };
        let answered = match self.inner.ping_timeout {
            Some(limit) => match tokio::time::timeout(limit, answered).await {
                Ok(answered) => answered,
                Err(_) => {
                    self.inner.take_ping(&id);
                    return Err(
                        Error::Handler(anyhow::anyhow!("ping timed out after {limit:?}")).shared(),
                    );
                }
            },
            None => answered.await,
        };
        if answered {
            Ok(())
        } else {
            self.inner.take_ping(&id);
            Err(Error::Handler(anyhow::anyhow!("job terminated before answering ping")).shared())
        }
    }

    /// Request a cooperative stop. The outbound stream will eventually
    /// complete or error; an uncooperative handler is never killed.
    pub fn stop(&self) {
        tracing::info!(job = %self.inner.name, "stop requested");
        let _ = self.inner.inbound_tx.send(InboundMessage::Stop);
    }

    /// Drain the outbound stream until the job terminates, ignoring
    /// messages. Used for dependency gating.
    pub async fn join(&self) {
        let mut outbound = self.inner.outbound.subscribe();
        while outbound.next().await.is_some() {}
    }
}

/// Per-job table of named channel multicasts.
///
/// Channels are scoped to one job invocation: once the table is closed by
/// the job's termination, late `get_channel` calls receive streams that
/// are already terminated instead of streams that would never end.
pub(crate) struct ChannelTable {
    inner: Mutex<TableInner>,
}

struct TableInner {
    entries: HashMap<String, ChannelEntry>,
    closed: Option<ClosedWith>,
}

#[derive(Clone)]
enum ClosedWith {
    Completion,
    Error(SharedError),
}

#[derive(Clone)]
pub(crate) struct ChannelEntry {
    pub(crate) multicast: Multicast<Value>,
    /// Schema supplied by the observer that created the entry, if any;
    /// otherwise the description's channel schema applies.
    pub(crate) schema_override: Option<Value>,
}

impl ChannelTable {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(TableInner {
                entries: HashMap::new(),
                closed: None,
            }),
        }
    }

    /// The multicast for a channel name, created lazily.
    pub(crate) fn entry(&self, name: &str, schema: Option<Value>) -> Multicast<Value> {
        let mut inner = self.inner.lock().expect("channel table lock poisoned");
        if let Some(closed) = &inner.closed {
            let terminated = Multicast::new(Replay::None);
            match closed {
                ClosedWith::Completion => terminated.complete(),
                ClosedWith::Error(error) => terminated.fail(Arc::clone(error)),
            }
            return terminated;
        }
        inner
            .entries
            .entry(name.to_string())
            .or_insert_with(|| ChannelEntry {
                multicast: Multicast::new(Replay::None),
                schema_override: schema,
            })
            .multicast
            .clone()
    }

    pub(crate) fn schema_override(&self, name: &str) -> Option<Value> {
        self.inner
            .lock()
            .expect("channel table lock poisoned")
            .entries
            .get(name)
            .and_then(|entry| entry.schema_override.clone())
    }

    /// Remove a channel entry, so the name can be recreated fresh.
    pub(crate) fn take(&self, name: &str) -> Option<ChannelEntry> {
        self.inner
            .lock()
            .expect("channel table lock poisoned")
            .entries
            .remove(name)
    }

    /// Close the table: complete every remaining channel (or error them
    /// with the job's error) and make future entries born terminated.
    pub(crate) fn close(&self, error: Option<SharedError>) {
        let (entries, closed) = {
            let mut inner = self.inner.lock().expect("channel table lock poisoned");
            let closed = match &error {
                None => ClosedWith::Completion,
                Some(error) => ClosedWith::Error(Arc::clone(error)),
            };
            inner.closed = Some(closed.clone());
            let entries: Vec<ChannelEntry> = inner.entries.drain().map(|(_, e)| e).collect();
            (entries, closed)
        };
        for entry in entries {
            match &closed {
                ClosedWith::Completion => entry.multicast.complete(),
                ClosedWith::Error(error) => entry.multicast.fail(Arc::clone(error)),
            }
        }
    }
}
