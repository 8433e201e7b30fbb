//! Job handlers and the adapter that wraps plain work functions.
//!
//! A [`JobHandler`] is the resolved implementation behind a job name: given
//! an argument and a per-invocation context, it produces a stream of
//! protocol messages. [`FnJobHandler`] adapts an ordinary work function
//! (synchronous, future-returning, or stream-returning) into a handler that
//! speaks the full protocol: it announces `Start`, echoes pings, honors
//! stop requests, forwards input values, maps channel sinks onto channel
//! messages, and closes with `End` on natural completion.

use std::collections::HashSet;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use futures::{Future, FutureExt, Stream, StreamExt};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{Error, Result, SharedError};
use crate::protocol::{InboundMessage, JobDescription, OutboundMessage};
use crate::scheduler::{Job, Scheduler};

/// Buffered message capacity of one invocation's outbound channel.
const OUTBOUND_CAPACITY: usize = 64;

/// The message stream produced by one job invocation.
///
/// An `Err` item is terminal: it carries the handler failure and no `End`
/// follows it.
pub type OutboundStream =
    Pin<Box<dyn Stream<Item = std::result::Result<OutboundMessage, SharedError>> + Send>>;

/// The value stream produced by a wrapped work function.
pub type WorkStream = Pin<Box<dyn Stream<Item = anyhow::Result<Value>> + Send>>;

/// The resolved, callable implementation behind a job name.
pub trait JobHandler: Send + Sync {
    /// The immutable description this handler was registered with.
    fn description(&self) -> Arc<JobDescription>;

    /// Start one invocation. The returned stream is the invocation.
    fn call(&self, argument: Value, ctx: HandlerContext) -> OutboundStream;
}

/// Per-invocation context handed to a handler by the scheduler.
pub struct HandlerContext {
    /// The resolved description.
    pub description: Arc<JobDescription>,
    /// Jobs whose completion gated this invocation.
    pub dependencies: Vec<Job>,
    /// Messages from the caller. Owned so that strategies can replace it
    /// when merging several callers into one execution.
    pub inbound: mpsc::UnboundedReceiver<InboundMessage>,
    /// The scheduler that invoked the handler, for scheduling sub-jobs.
    pub scheduler: Option<Scheduler>,
}

impl HandlerContext {
    /// A detached context, for invoking a handler outside a scheduler.
    pub fn detached(description: Arc<JobDescription>) -> (Self, mpsc::UnboundedSender<InboundMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                description,
                dependencies: Vec::new(),
                inbound: rx,
                scheduler: None,
            },
            tx,
        )
    }
}

/// Extended context handed to the wrapped work function.
pub struct WorkContext {
    /// The job's description.
    pub description: Arc<JobDescription>,
    /// Validated input values from the caller. Closing only stops
    /// delivery; it never signals failure.
    pub input: mpsc::UnboundedReceiver<Value>,
    /// Dependency handles, in scheduling order.
    pub dependencies: Vec<Job>,
    /// The scheduler, for scheduling sub-jobs.
    pub scheduler: Option<Scheduler>,
    channels: ChannelHub,
}

impl WorkContext {
    /// Open a named channel.
    ///
    /// The first call for a name creates the channel; calling again while
    /// the prior instance is open fails with a channel conflict. A name
    /// may be reopened after its sink completed or failed.
    pub async fn create_channel(&self, name: &str) -> Result<ChannelSink> {
        self.channels.create(name).await
    }
}

/// Bookkeeping shared between a work context and its channel sinks.
#[derive(Clone)]
struct ChannelHub {
    job: Arc<str>,
    open: Arc<Mutex<HashSet<String>>>,
    outbound: mpsc::Sender<std::result::Result<OutboundMessage, SharedError>>,
}

impl ChannelHub {
    async fn create(&self, name: &str) -> Result<ChannelSink> {
        {
            let mut open = self.open.lock().expect("channel set lock poisoned");
            if !open.insert(name.to_string()) {
                return Err(Error::ChannelConflict {
                    job: self.job.to_string(),
                    channel: name.to_string(),
                });
            }
        }
        let _ = self
            .outbound
            .send(Ok(OutboundMessage::ChannelCreate {
                name: name.to_string(),
            }))
            .await;
        Ok(ChannelSink {
            name: name.to_string(),
            hub: self.clone(),
            closed: false,
        })
    }

    fn release(&self, name: &str) {
        self.open
            .lock()
            .expect("channel set lock poisoned")
            .remove(name);
    }

    fn drain_open(&self) -> Vec<String> {
        self.open
            .lock()
            .expect("channel set lock poisoned")
            .drain()
            .collect()
    }
}

/// Producer side of one named channel.
pub struct ChannelSink {
    name: String,
    hub: ChannelHub,
    closed: bool,
}

impl ChannelSink {
    /// The channel's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Publish a value on the channel.
    pub async fn send(&self, value: Value) {
        let _ = self
            .hub
            .outbound
            .send(Ok(OutboundMessage::ChannelMessage {
                name: self.name.clone(),
                value,
            }))
            .await;
    }

    /// Complete the channel, allowing the name to be reused.
    pub async fn complete(mut self) {
        self.closed = true;
        let _ = self
            .hub
            .outbound
            .send(Ok(OutboundMessage::ChannelComplete {
                name: self.name.clone(),
            }))
            .await;
        self.hub.release(&self.name);
    }

    /// Fail the channel with an error payload, allowing the name to be
    /// reused.
    pub async fn fail(mut self, error: Value) {
        self.closed = true;
        let _ = self
            .hub
            .outbound
            .send(Ok(OutboundMessage::ChannelError {
                name: self.name.clone(),
                error,
            }))
            .await;
        self.hub.release(&self.name);
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        // Best effort: a dropped sink completes its channel. If the
        // outbound buffer is full the name stays open and the invocation's
        // final sweep completes it instead.
        let message = Ok(OutboundMessage::ChannelComplete {
            name: self.name.clone(),
        });
        if self.hub.outbound.try_send(message).is_ok() {
            self.hub.release(&self.name);
        }
    }
}

/// Work function signature: argument plus extended context in, value
/// stream out.
pub type WorkFn = dyn Fn(Value, WorkContext) -> WorkStream + Send + Sync;

/// Adapts a plain work function into a [`JobHandler`].
pub struct FnJobHandler {
    description: Arc<JobDescription>,
    work: Arc<WorkFn>,
}

impl FnJobHandler {
    /// Wrap a stream-producing work function.
    pub fn new(
        description: JobDescription,
        work: impl Fn(Value, WorkContext) -> WorkStream + Send + Sync + 'static,
    ) -> Self {
        Self {
            description: Arc::new(description),
            work: Arc::new(work),
        }
    }

    /// Wrap a work function producing a stream of values.
    pub fn from_stream_fn(
        description: JobDescription,
        work: impl Fn(Value, WorkContext) -> WorkStream + Send + Sync + 'static,
    ) -> Self {
        Self::new(description, work)
    }

    /// Wrap an async work function producing a single value.
    pub fn from_future_fn<F, Fut>(description: JobDescription, work: F) -> Self
    where
        F: Fn(Value, WorkContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        Self::new(description, move |argument, ctx| {
            work(argument, ctx).into_stream().boxed()
        })
    }

    /// Wrap a synchronous work function producing a single value.
    pub fn from_value_fn(
        description: JobDescription,
        work: impl Fn(Value, WorkContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    ) -> Self {
        Self::new(description, move |argument, ctx| {
            let result = work(argument, ctx);
            futures::stream::once(async move { result }).boxed()
        })
    }
}

impl JobHandler for FnJobHandler {
    fn description(&self) -> Arc<JobDescription> {
        Arc::clone(&self.description)
    }

    fn call(&self, argument: Value, ctx: HandlerContext) -> OutboundStream {
        let (tx, rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let description = Arc::clone(&self.description);
        let work = Arc::clone(&self.work);
        tokio::spawn(run_invocation(description, work, argument, ctx, tx));
        Box::pin(ReceiverStream::new(rx))
    }
}

/// How one invocation's select loop ended.
enum InvocationEnd {
    Stopped,
    Finished,
    Failed(anyhow::Error),
    OutboundClosed,
}

async fn run_invocation(
    description: Arc<JobDescription>,
    work: Arc<WorkFn>,
    argument: Value,
    mut ctx: HandlerContext,
    tx: mpsc::Sender<std::result::Result<OutboundMessage, SharedError>>,
) {
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let hub = ChannelHub {
        job: Arc::from(description.name.as_str()),
        open: Arc::new(Mutex::new(HashSet::new())),
        outbound: tx.clone(),
    };
    let work_ctx = WorkContext {
        description: Arc::clone(&description),
        input: input_rx,
        dependencies: std::mem::take(&mut ctx.dependencies),
        scheduler: ctx.scheduler.take(),
        channels: hub.clone(),
    };

    if tx
        .send(Ok(OutboundMessage::Start {
            description: Arc::clone(&description),
        }))
        .await
        .is_err()
    {
        return;
    }

    let mut work_stream = (work)(argument, work_ctx);
    let mut inbound_open = true;
    let end = loop {
        tokio::select! {
            message = ctx.inbound.recv(), if inbound_open => match message {
                Some(InboundMessage::Ping { id }) => {
                    if tx.send(Ok(OutboundMessage::Pong { id })).await.is_err() {
                        break InvocationEnd::OutboundClosed;
                    }
                }
                Some(InboundMessage::Stop) => break InvocationEnd::Stopped,
                Some(InboundMessage::Input { value }) => {
                    let _ = input_tx.send(value);
                }
                None => inbound_open = false,
            },
            item = work_stream.next() => match item {
                Some(Ok(value)) => {
                    if tx.send(Ok(OutboundMessage::Output { value })).await.is_err() {
                        break InvocationEnd::OutboundClosed;
                    }
                }
                Some(Err(error)) => break InvocationEnd::Failed(error),
                None => break InvocationEnd::Finished,
            },
        }
    };

    // A stop request tears the work down immediately.
    drop(work_stream);

    match end {
        InvocationEnd::Stopped | InvocationEnd::Finished => {
            for name in hub.drain_open() {
                let _ = tx
                    .send(Ok(OutboundMessage::ChannelComplete { name }))
                    .await;
            }
            let _ = tx
                .send(Ok(OutboundMessage::End { description }))
                .await;
        }
        InvocationEnd::Failed(error) => {
            // Termination is the error itself; no End is sent.
            let _ = tx.send(Err(Error::Handler(error).shared())).await;
        }
        InvocationEnd::OutboundClosed => {}
    }
}
