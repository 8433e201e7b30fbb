//! The reuse strategy: concurrent callers share one in-flight execution.

use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::handler::{HandlerContext, JobHandler, OutboundStream};
use crate::multicast::Replay;
use crate::protocol::JobDescription;

use super::SharedRun;

/// Wrap a handler so calls made while an execution is in flight attach to
/// it instead of starting a new one. With `replay_messages` a late caller
/// first receives every message since the shared execution started;
/// otherwise it only sees future ones. Inbound messages from every
/// attached caller merge into the one running execution. Once the shared
/// execution ends, the next call starts fresh.
pub fn reuse(inner: Arc<dyn JobHandler>, replay_messages: bool) -> Arc<dyn JobHandler> {
    Arc::new(Reused {
        inner,
        replay: if replay_messages {
            Replay::All
        } else {
            Replay::None
        },
        current: Mutex::new(None),
    })
}

struct Reused {
    inner: Arc<dyn JobHandler>,
    replay: Replay,
    current: Mutex<Option<SharedRun>>,
}

impl JobHandler for Reused {
    fn description(&self) -> Arc<JobDescription> {
        self.inner.description()
    }

    fn call(&self, argument: Value, ctx: HandlerContext) -> OutboundStream {
        let HandlerContext {
            description,
            dependencies,
            inbound,
            scheduler,
        } = ctx;
        let run = {
            let mut current = self.current.lock().expect("reuse state lock poisoned");
            match current.as_ref() {
                Some(run) if !run.is_finished() => run.clone(),
                _ => {
                    let run = SharedRun::start(
                        Arc::clone(&self.inner),
                        argument,
                        description,
                        dependencies,
                        scheduler,
                        self.replay,
                    );
                    *current = Some(run.clone());
                    run
                }
            }
        };
        run.attach(inbound)
    }
}
