//! Message protocol shared by jobs, handlers, and the scheduler.
//!
//! Pure data: the inbound/outbound message vocabulary, the job state
//! machine, and the immutable job description. Message kinds double as the
//! scheduler's state-transition triggers and as the filter that drops
//! out-of-order lifecycle messages.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Conventional prefix for private job names (e.g. `..resolve-options`).
pub const PRIVATE_PREFIX: &str = "..";

/// Whether a job name is private by convention.
pub fn is_private_name(name: &str) -> bool {
    name.starts_with(PRIVATE_PREFIX)
}

/// Immutable description of a registered job.
///
/// Schemas are opaque values owned by the injected schema compiler; the
/// engine only ever hands them to [`crate::schema::SchemaCompiler`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescription {
    /// Job name, unique within a registry.
    pub name: String,
    /// Schema for the scheduling argument.
    pub argument_schema: Value,
    /// Schema for values sent through the job's input stream.
    pub input_schema: Value,
    /// Schema for values the job outputs.
    pub output_schema: Value,
    /// Schemas for named channels. Channels without an entry validate
    /// permissively.
    #[serde(default)]
    pub channel_schemas: HashMap<String, Value>,
}

impl JobDescription {
    /// Create a description with permissive schemas at every boundary.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            argument_schema: Value::Bool(true),
            input_schema: Value::Bool(true),
            output_schema: Value::Bool(true),
            channel_schemas: HashMap::new(),
        }
    }

    /// Set the argument schema.
    pub fn with_argument_schema(mut self, schema: Value) -> Self {
        self.argument_schema = schema;
        self
    }

    /// Set the input schema.
    pub fn with_input_schema(mut self, schema: Value) -> Self {
        self.input_schema = schema;
        self
    }

    /// Set the output schema.
    pub fn with_output_schema(mut self, schema: Value) -> Self {
        self.output_schema = schema;
        self
    }

    /// Declare a named channel and its schema.
    pub fn with_channel_schema(mut self, name: impl Into<String>, schema: Value) -> Self {
        self.channel_schemas.insert(name.into(), schema);
        self
    }

    /// Schema for a named channel, permissive if undeclared.
    pub fn channel_schema(&self, name: &str) -> Value {
        self.channel_schemas
            .get(name)
            .cloned()
            .unwrap_or(Value::Bool(true))
    }
}

/// Messages a caller sends into a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundMessage {
    /// Liveness probe; the job answers with a pong carrying the same id.
    Ping { id: Uuid },
    /// Cooperative stop request.
    Stop,
    /// A value for the job's input stream. Input cannot error; closing the
    /// input side only stops delivery.
    Input { value: Value },
}

/// Messages a job emits to its observers.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// The job's argument validated; the job is about to start.
    OnReady { description: Arc<JobDescription> },
    /// The handler began executing.
    Start { description: Arc<JobDescription> },
    /// The handler finished naturally or honored a stop request.
    End { description: Arc<JobDescription> },
    /// Answer to a ping, correlated by id.
    Pong { id: Uuid },
    /// A produced output value.
    Output { value: Value },
    /// A named channel was opened.
    ChannelCreate { name: String },
    /// A value on a named channel.
    ChannelMessage { name: String, value: Value },
    /// A named channel terminated with an error payload.
    ChannelError { name: String, error: Value },
    /// A named channel completed.
    ChannelComplete { name: String },
}

impl OutboundMessage {
    /// Kind tag, for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::OnReady { .. } => "on_ready",
            Self::Start { .. } => "start",
            Self::End { .. } => "end",
            Self::Pong { .. } => "pong",
            Self::Output { .. } => "output",
            Self::ChannelCreate { .. } => "channel_create",
            Self::ChannelMessage { .. } => "channel_message",
            Self::ChannelError { .. } => "channel_error",
            Self::ChannelComplete { .. } => "channel_complete",
        }
    }

    /// Channel name, for the channel-scoped variants.
    pub fn channel_name(&self) -> Option<&str> {
        match self {
            Self::ChannelCreate { name }
            | Self::ChannelMessage { name, .. }
            | Self::ChannelError { name, .. }
            | Self::ChannelComplete { name } => Some(name),
            _ => None,
        }
    }
}

/// State of a job, driven exclusively by observed outbound messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Scheduled, not yet ready (resolution, pause gate, dependencies).
    Queued,
    /// Argument validated, start announced.
    Ready,
    /// Handler is executing.
    Started,
    /// Finished normally.
    Ended,
    /// Terminated by a validation failure or handler error.
    Errored,
}

impl JobState {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Ended | Self::Errored)
    }

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: JobState) -> bool {
        use JobState::*;

        matches!(
            (self, target),
            (Queued, Ready) | (Ready, Started) | (Started, Ended)
        ) || (!self.is_terminal() && target == Errored)
    }

    /// State implied by an observed message, if this state expects it.
    ///
    /// Returns `None` both for non-lifecycle messages and for lifecycle
    /// messages arriving out of order.
    pub fn transition_for(&self, message: &OutboundMessage) -> Option<JobState> {
        let target = match message {
            OutboundMessage::OnReady { .. } => JobState::Ready,
            OutboundMessage::Start { .. } => JobState::Started,
            OutboundMessage::End { .. } => JobState::Ended,
            _ => return None,
        };
        self.can_transition_to(target).then_some(target)
    }

    /// Whether a message observed in this state should be relayed.
    ///
    /// Lifecycle messages that would be invalid transitions are dropped,
    /// as is everything after a terminal state.
    pub fn accepts(&self, message: &OutboundMessage) -> bool {
        if self.is_terminal() {
            return false;
        }
        match message {
            OutboundMessage::OnReady { .. } => self.can_transition_to(JobState::Ready),
            OutboundMessage::Start { .. } => self.can_transition_to(JobState::Started),
            OutboundMessage::End { .. } => self.can_transition_to(JobState::Ended),
            _ => true,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::Ready => "ready",
            Self::Started => "started",
            Self::Ended => "ended",
            Self::Errored => "errored",
        };
        write!(f, "{s}")
    }
}
