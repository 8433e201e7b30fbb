//! Execution-sharing strategies.
//!
//! Each strategy is a handler-transforming combinator
//! `Arc<dyn JobHandler> -> Arc<dyn JobHandler>` that preserves the
//! description contract but changes how many concurrent executions are
//! allowed and whether a running execution is shared across callers:
//!
//! - [`serialize`] runs executions strictly one after another.
//! - [`reuse`] attaches concurrent callers to one in-flight execution.
//! - [`memoize`] shares executions between identical arguments.

mod memoize;
mod reuse;
mod serialize;

pub use memoize::memoize;
pub use reuse::reuse;
pub use serialize::serialize;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::handler::{HandlerContext, JobHandler, OutboundStream};
use crate::multicast::{Multicast, Replay};
use crate::protocol::{InboundMessage, JobDescription, OutboundMessage};
use crate::scheduler::{Job, Scheduler};

/// One shared execution of a wrapped handler.
///
/// The execution's messages fan out through a multicast; every attached
/// caller's inbound messages merge into the one running invocation.
#[derive(Clone)]
pub(crate) struct SharedRun {
    multicast: Multicast<OutboundMessage>,
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
}

impl SharedRun {
    /// Start the wrapped handler once and relay its stream into a shared
    /// multicast.
    pub(crate) fn start(
        inner: Arc<dyn JobHandler>,
        argument: Value,
        description: Arc<JobDescription>,
        dependencies: Vec<Job>,
        scheduler: Option<Scheduler>,
        replay: Replay,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let multicast = Multicast::new(replay);
        let ctx = HandlerContext {
            description,
            dependencies,
            inbound: inbound_rx,
            scheduler,
        };
        let mut stream = inner.call(argument, ctx);
        let relay = multicast.clone();
        tokio::spawn(async move {
            while let Some(item) = stream.next().await {
                match item {
                    Ok(message) => relay.send(message),
                    Err(error) => {
                        relay.fail(error);
                        return;
                    }
                }
            }
            relay.complete();
        });
        Self {
            multicast,
            inbound_tx,
        }
    }

    /// Whether the execution has completed or errored.
    pub(crate) fn is_finished(&self) -> bool {
        self.multicast.is_terminated()
    }

    /// Attach a caller: merge its inbound messages into the running
    /// execution and return its view of the shared message stream.
    pub(crate) fn attach(
        &self,
        mut inbound: mpsc::UnboundedReceiver<InboundMessage>,
    ) -> OutboundStream {
        let merged = self.inbound_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = inbound.recv().await {
                if merged.send(message).is_err() {
                    break;
                }
            }
        });
        Box::pin(self.multicast.subscribe())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared fixtures for strategy tests.

    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use crate::handler::FnJobHandler;
    use crate::protocol::JobDescription;

    /// A handler that counts invocations and runs until it receives one
    /// input value, which it echoes as its output.
    pub(crate) fn counting_handler(name: &str) -> (Arc<FnJobHandler>, Arc<AtomicUsize>) {
        let invocations = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&invocations);
        let handler = FnJobHandler::from_future_fn(JobDescription::new(name), move |_argument, mut ctx| {
            counter.fetch_add(1, Ordering::SeqCst);
            async move {
                let value = ctx.input.recv().await.unwrap_or(Value::Null);
                Ok(json!({ "echo": value }))
            }
        });
        (Arc::new(handler), invocations)
    }
}
