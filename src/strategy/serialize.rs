//! The serialize strategy: at most one execution at a time.

use std::sync::{Arc, Mutex};

use futures::future::{BoxFuture, Shared};
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;

use crate::handler::{HandlerContext, JobHandler, OutboundStream};
use crate::protocol::JobDescription;

/// Buffered message capacity between an execution and its caller.
const RELAY_CAPACITY: usize = 64;

/// Wrap a handler so each new call waits for the previous execution to
/// fully finish (its messages ignored) before starting its own. Calls
/// through the same wrapped handler never run concurrently.
pub fn serialize(inner: Arc<dyn JobHandler>) -> Arc<dyn JobHandler> {
    Arc::new(Serialized {
        inner,
        latest: Mutex::new(None),
    })
}

struct Serialized {
    inner: Arc<dyn JobHandler>,
    /// Completion future of the most recently queued execution.
    latest: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
}

/// Signals execution completion on drop, so an abandoned execution can
/// never wedge the queue behind it.
struct DoneGuard(Option<oneshot::Sender<()>>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        if let Some(done) = self.0.take() {
            let _ = done.send(());
        }
    }
}

impl JobHandler for Serialized {
    fn description(&self) -> Arc<JobDescription> {
        self.inner.description()
    }

    fn call(&self, argument: Value, ctx: HandlerContext) -> OutboundStream {
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done = done_rx.map(|_| ()).boxed().shared();
        let previous = self
            .latest
            .lock()
            .expect("serialize queue lock poisoned")
            .replace(done);

        let inner = Arc::clone(&self.inner);
        let (tx, rx) = mpsc::channel(RELAY_CAPACITY);
        tokio::spawn(async move {
            let _guard = DoneGuard(Some(done_tx));
            if let Some(previous) = previous {
                previous.await;
            }
            let mut stream = inner.call(argument, ctx);
            while let Some(item) = stream.next().await {
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });
        Box::pin(ReceiverStream::new(rx))
    }
}
