//! The scheduling engine.
//!
//! `schedule()` is synchronous and infallible: it builds the job handle and
//! spawns a driver task. Everything that can fail (resolution, validation,
//! the handler itself) surfaces on the handle's streams once the job is
//! driven, never as a `schedule` return value.

mod job;
mod pause;

pub use job::{ChannelStream, Job, MessageStream, OutputStream};
pub use pause::ResumeHandle;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, watch};

use crate::config::SchedulerConfig;
use crate::error::{Error, Result, SharedError, ValidationBoundary};
use crate::handler::{HandlerContext, JobHandler};
use crate::multicast::{Multicast, Replay};
use crate::protocol::{InboundMessage, JobDescription, JobState, OutboundMessage};
use crate::registry::Registry;
use crate::schema::{AcceptAll, SchemaCompiler, ValidationOutcome, Validator};

use self::job::{ChannelTable, JobInner, LifecycleTimes};
use self::pause::PauseGate;

/// A handler resolved from the registry, with its compiled validators.
#[derive(Clone)]
struct ResolvedHandler {
    handler: Arc<dyn JobHandler>,
    description: Arc<JobDescription>,
    argument_validator: Arc<dyn Validator>,
    input_validator: Arc<dyn Validator>,
    output_validator: Arc<dyn Validator>,
}

/// Options for scheduling a job.
#[derive(Default)]
pub struct ScheduleOptions {
    /// Jobs whose outbound streams must fully drain before this job's
    /// argument is validated and `OnReady` is emitted. Dependencies gate
    /// readiness; they do not share this job's message stream.
    pub dependencies: Vec<Job>,
}

/// The job scheduler. Cheap to clone; all clones share the engine.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    config: SchedulerConfig,
    registry: Arc<dyn Registry>,
    compiler: Arc<dyn SchemaCompiler>,
    /// Resolution cache: registries are queried once per name, and the
    /// compiled validators are kept alongside the handler.
    cache: Mutex<HashMap<String, ResolvedHandler>>,
    pause: Arc<PauseGate>,
}

impl Scheduler {
    /// Create a scheduler with permissive validation and defaults.
    pub fn new(registry: Arc<dyn Registry>) -> Self {
        Self::with_config(registry, Arc::new(AcceptAll), SchedulerConfig::default())
    }

    /// Create a scheduler with an injected schema compiler.
    pub fn with_compiler(registry: Arc<dyn Registry>, compiler: Arc<dyn SchemaCompiler>) -> Self {
        Self::with_config(registry, compiler, SchedulerConfig::default())
    }

    /// Create a fully configured scheduler.
    pub fn with_config(
        registry: Arc<dyn Registry>,
        compiler: Arc<dyn SchemaCompiler>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                config,
                registry,
                compiler,
                cache: Mutex::new(HashMap::new()),
                pause: Arc::new(PauseGate::new()),
            }),
        }
    }

    /// Whether a registry in the chain can resolve this name.
    pub async fn has(&self, name: &str) -> bool {
        if self.inner.cache.lock().await.contains_key(name) {
            return true;
        }
        self.inner.registry.get(name).await.is_some()
    }

    /// Resolve and cache a job's description without scheduling it.
    pub async fn describe(&self, name: &str) -> Option<Arc<JobDescription>> {
        match self.resolve(name).await {
            Ok(Some(resolved)) => Some(resolved.description),
            _ => None,
        }
    }

    /// Pause admission of new job starts. Already-running jobs are
    /// unaffected. Starts resume once every outstanding handle has
    /// resumed.
    pub fn pause(&self) -> ResumeHandle {
        tracing::debug!(scheduler = %self.inner.config.name, "pause");
        PauseGate::pause(&self.inner.pause)
    }

    /// Schedule a job by name.
    pub fn schedule(&self, name: &str, argument: Value) -> Job {
        self.schedule_with(name, argument, ScheduleOptions::default())
    }

    /// Schedule a job by name, with options.
    pub fn schedule_with(&self, name: &str, argument: Value, options: ScheduleOptions) -> Job {
        let (state_tx, state_rx) = watch::channel(JobState::Queued);
        let (description_tx, description_rx) = watch::channel(None);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (input_tx, input_rx) = mpsc::unbounded_channel();

        let job = Job {
            inner: Arc::new(JobInner {
                name: name.to_string(),
                argument: argument.clone(),
                created_at: Utc::now(),
                times: StdMutex::new(LifecycleTimes::default()),
                state_rx,
                description_rx,
                inbound_tx: inbound_tx.clone(),
                input_tx,
                outbound: Multicast::new(Replay::None),
                output: Multicast::new(Replay::Latest),
                channels: ChannelTable::new(),
                pings: StdMutex::new(HashMap::new()),
                ping_timeout: self.inner.config.ping_timeout,
            }),
        };

        tracing::debug!(
            scheduler = %self.inner.config.name,
            job = %name,
            "scheduled job"
        );

        let driver = Driver {
            scheduler: self.clone(),
            job: job.clone(),
            argument,
            state_tx,
            description_tx,
            inbound_rx,
            inbound_tx,
            input_rx,
            dependencies: options.dependencies,
            // Admission is sampled now: a job scheduled before `pause()`
            // is unaffected by it, even if its driver runs later.
            admitted: self.inner.pause.count() == 0,
        };
        tokio::spawn(driver.run());

        job
    }

    async fn resolve(&self, name: &str) -> Result<Option<ResolvedHandler>> {
        {
            let cache = self.inner.cache.lock().await;
            if let Some(resolved) = cache.get(name) {
                tracing::debug!(job = %name, "resolution cache hit");
                return Ok(Some(resolved.clone()));
            }
        }
        let Some(handler) = self.inner.registry.get(name).await else {
            return Ok(None);
        };
        let description = handler.description();
        let argument_validator = self.compile(&description.argument_schema).await?;
        let input_validator = self.compile(&description.input_schema).await?;
        let output_validator = self.compile(&description.output_schema).await?;
        let resolved = ResolvedHandler {
            handler,
            description,
            argument_validator,
            input_validator,
            output_validator,
        };
        // Two first resolutions may race; last write wins. Handlers and
        // validators are immutable, so either copy drives correctly.
        self.inner
            .cache
            .lock()
            .await
            .insert(name.to_string(), resolved.clone());
        Ok(Some(resolved))
    }

    pub(crate) async fn compile(&self, schema: &Value) -> Result<Arc<dyn Validator>> {
        self.inner.compiler.compile(schema).await
    }
}

/// Drives one scheduled job from resolution to termination.
struct Driver {
    scheduler: Scheduler,
    job: Job,
    argument: Value,
    state_tx: watch::Sender<JobState>,
    description_tx: watch::Sender<Option<Arc<JobDescription>>>,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    input_rx: mpsc::UnboundedReceiver<Value>,
    dependencies: Vec<Job>,
    admitted: bool,
}

impl Driver {
    async fn run(self) {
        let Driver {
            scheduler,
            job,
            argument,
            state_tx,
            description_tx,
            inbound_rx,
            inbound_tx,
            input_rx,
            dependencies,
            admitted,
        } = self;

        // Resolution failures surface here, when the job is first driven.
        let resolved = match scheduler.resolve(job.name()).await {
            Ok(Some(resolved)) => resolved,
            Ok(None) => {
                return fail(
                    &job,
                    &state_tx,
                    Error::JobNotFound {
                        name: job.name().to_string(),
                    }
                    .shared(),
                );
            }
            Err(error) => return fail(&job, &state_tx, error.shared()),
        };
        let _ = description_tx.send(Some(Arc::clone(&resolved.description)));

        // Input values are validated in order; failures are dropped
        // silently so bad input never kills a long-running job.
        let input_pump = tokio::spawn(pump_input(
            input_rx,
            Arc::clone(&resolved.input_validator),
            inbound_tx,
            job.name().to_string(),
        ));

        drive(
            &scheduler,
            &job,
            argument,
            &state_tx,
            resolved,
            inbound_rx,
            dependencies,
            admitted,
        )
        .await;

        input_pump.abort();
    }
}

#[allow(clippy::too_many_arguments)]
async fn drive(
    scheduler: &Scheduler,
    job: &Job,
    argument: Value,
    state_tx: &watch::Sender<JobState>,
    resolved: ResolvedHandler,
    inbound_rx: mpsc::UnboundedReceiver<InboundMessage>,
    dependencies: Vec<Job>,
    admitted: bool,
) {
    // Starts scheduled under a pause wait for the counter to return to
    // zero; already-admitted jobs proceed immediately.
    if !admitted {
        scheduler.inner.pause.ready().await;
    }

    // Dependencies run concurrently; only their completion is observed.
    if !dependencies.is_empty() {
        futures::future::join_all(dependencies.iter().map(|dependency| dependency.join())).await;
    }

    let argument = match resolved.argument_validator.validate(argument).await {
        ValidationOutcome::Valid(value) => value,
        ValidationOutcome::Invalid(faults) => {
            return fail(
                job,
                state_tx,
                Error::validation(ValidationBoundary::Argument, job.name(), faults).shared(),
            );
        }
    };

    publish(job, state_tx, OutboundMessage::OnReady {
        description: Arc::clone(&resolved.description),
    });

    let ctx = HandlerContext {
        description: Arc::clone(&resolved.description),
        dependencies,
        inbound: inbound_rx,
        scheduler: Some(scheduler.clone()),
    };
    let mut stream = resolved.handler.call(argument, ctx);
    let mut channel_validators: HashMap<String, Arc<dyn Validator>> = HashMap::new();

    while let Some(item) = stream.next().await {
        let message = match item {
            Ok(message) => message,
            Err(error) => return fail(job, state_tx, error),
        };
        let current = *state_tx.borrow();
        if !current.accepts(&message) {
            tracing::warn!(
                job = %job.name(),
                kind = message.kind(),
                state = %current,
                "dropping out-of-order message"
            );
            continue;
        }
        publish(job, state_tx, message.clone());

        match message {
            OutboundMessage::Output { value } => {
                // Output validation is sequenced with the relay, so values
                // are never reordered even when validation is async.
                match resolved.output_validator.validate(value).await {
                    ValidationOutcome::Valid(value) => job.inner.output.send(value),
                    ValidationOutcome::Invalid(faults) => {
                        return fail(
                            job,
                            state_tx,
                            Error::validation(ValidationBoundary::Output, job.name(), faults)
                                .shared(),
                        );
                    }
                }
            }
            OutboundMessage::Pong { id } => {
                if let Some(waiter) = job.inner.take_ping(&id) {
                    let _ = waiter.send(());
                }
            }
            OutboundMessage::ChannelCreate { name } => {
                job.inner.channels.entry(&name, None);
            }
            OutboundMessage::ChannelMessage { name, value } => {
                relay_channel_message(
                    scheduler,
                    job,
                    &resolved.description,
                    &mut channel_validators,
                    name,
                    value,
                )
                .await;
            }
            OutboundMessage::ChannelError { name, error } => {
                channel_validators.remove(&name);
                if let Some(entry) = job.inner.channels.take(&name) {
                    entry.multicast.fail(
                        Error::Handler(anyhow::anyhow!("channel {name:?} errored: {error}"))
                            .shared(),
                    );
                }
            }
            OutboundMessage::ChannelComplete { name } => {
                channel_validators.remove(&name);
                if let Some(entry) = job.inner.channels.take(&name) {
                    entry.multicast.complete();
                }
            }
            OutboundMessage::OnReady { .. }
            | OutboundMessage::Start { .. }
            | OutboundMessage::End { .. } => {}
        }
    }

    finish(job, state_tx);
}

/// Deliver one channel message: resolve the channel's validator, validate
/// in arrival order, and either forward the value or error the channel.
/// Channel failures stay local to the channel; the job keeps running.
async fn relay_channel_message(
    scheduler: &Scheduler,
    job: &Job,
    description: &JobDescription,
    validators: &mut HashMap<String, Arc<dyn Validator>>,
    name: String,
    value: Value,
) {
    let validator = if let Some(validator) = validators.get(&name) {
        Arc::clone(validator)
    } else {
        let schema = job
            .inner
            .channels
            .schema_override(&name)
            .unwrap_or_else(|| description.channel_schema(&name));
        match scheduler.compile(&schema).await {
            Ok(validator) => {
                validators.insert(name.clone(), Arc::clone(&validator));
                validator
            }
            Err(error) => {
                tracing::warn!(job = %job.name(), channel = %name, error = %error, "channel schema compilation failed");
                if let Some(entry) = job.inner.channels.take(&name) {
                    entry.multicast.fail(error.shared());
                }
                return;
            }
        }
    };
    match validator.validate(value).await {
        ValidationOutcome::Valid(value) => {
            job.inner.channels.entry(&name, None).send(value);
        }
        ValidationOutcome::Invalid(faults) => {
            tracing::warn!(
                job = %job.name(),
                channel = %name,
                faults = faults.len(),
                "channel message failed validation"
            );
            validators.remove(&name);
            if let Some(entry) = job.inner.channels.take(&name) {
                entry.multicast.fail(
                    Error::validation(ValidationBoundary::Channel, job.name(), faults).shared(),
                );
            }
        }
    }
}

/// Update tracked state for a message, then relay it on the raw bus.
fn publish(job: &Job, state_tx: &watch::Sender<JobState>, message: OutboundMessage) {
    let current = *state_tx.borrow();
    if let Some(next) = current.transition_for(&message) {
        set_state(job, state_tx, next);
    }
    job.inner.outbound.send(message);
}

fn set_state(job: &Job, state_tx: &watch::Sender<JobState>, next: JobState) {
    state_tx.send_replace(next);
    if next == JobState::Started {
        job.inner.mark_started();
    } else if next.is_terminal() {
        job.inner.mark_ended();
    }
}

/// Natural termination: the handler's stream completed.
fn finish(job: &Job, state_tx: &watch::Sender<JobState>) {
    if !state_tx.borrow().is_terminal() {
        set_state(job, state_tx, JobState::Ended);
    }
    job.inner.channels.close(None);
    job.inner.output.complete();
    job.inner.outbound.complete();
    job.inner.clear_pings();
    tracing::info!(job = %job.name(), "job ended");
}

/// Fatal termination: validation failure, resolution failure, or handler
/// error. Fatal to this job only; the scheduler and other jobs are
/// unaffected.
fn fail(job: &Job, state_tx: &watch::Sender<JobState>, error: SharedError) {
    tracing::info!(job = %job.name(), error = %error, "job errored");
    set_state(job, state_tx, JobState::Errored);
    job.inner.channels.close(Some(Arc::clone(&error)));
    job.inner.output.fail(Arc::clone(&error));
    job.inner.outbound.fail(error);
    job.inner.clear_pings();
}

async fn pump_input(
    mut input_rx: mpsc::UnboundedReceiver<Value>,
    validator: Arc<dyn Validator>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    job: String,
) {
    while let Some(value) = input_rx.recv().await {
        match validator.validate(value).await {
            ValidationOutcome::Valid(value) => {
                if inbound_tx.send(InboundMessage::Input { value }).is_err() {
                    break;
                }
            }
            ValidationOutcome::Invalid(faults) => {
                tracing::warn!(job = %job, faults = faults.len(), "dropping invalid input value");
            }
        }
    }
}
