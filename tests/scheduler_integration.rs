//! Integration tests for the job engine.
//!
//! Each test drives the public API end-to-end: registries, the scheduler,
//! job handles, strategies, and the target wiring, with a stub schema
//! compiler standing in for the injected validation capability.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{Value, json};
use tokio::time::timeout;

use jobflow::error::{Error, ValidationBoundary, ValidationFault};
use jobflow::handler::{FnJobHandler, JobHandler};
use jobflow::protocol::{JobDescription, JobState, OutboundMessage};
use jobflow::registry::{Registry, SimpleRegistry};
use jobflow::scheduler::{Job, ScheduleOptions, Scheduler};
use jobflow::schema::{SchemaCompiler, ValidationOutcome, Validator};
use jobflow::strategy::{memoize, reuse};

/// Maximum time any await is allowed to take before the test is
/// considered hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a tracing subscriber once, honoring `RUST_LOG`.
fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Stub compiler: a schema `{"required": [...]}` demands those keys on an
/// object; any other schema is permissive.
struct StubCompiler;

struct StubValidator {
    required: Vec<String>,
}

#[async_trait]
impl Validator for StubValidator {
    async fn validate(&self, value: Value) -> ValidationOutcome {
        let faults: Vec<ValidationFault> = self
            .required
            .iter()
            .filter(|key| value.get(key.as_str()).is_none())
            .map(|key| ValidationFault::new(key.clone(), "missing required key"))
            .collect();
        if faults.is_empty() {
            ValidationOutcome::Valid(value)
        } else {
            ValidationOutcome::Invalid(faults)
        }
    }
}

#[async_trait]
impl SchemaCompiler for StubCompiler {
    async fn compile(&self, schema: &Value) -> jobflow::error::Result<Arc<dyn Validator>> {
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|keys| {
                keys.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(Arc::new(StubValidator { required }))
    }
}

/// Handler that echoes its argument as a single output.
fn echo_handler(name: &str) -> Arc<dyn JobHandler> {
    Arc::new(FnJobHandler::from_value_fn(
        JobDescription::new(name),
        |argument, _ctx| Ok(argument),
    ))
}

/// Handler that runs until it receives an input value, then echoes it.
/// Also counts invocations.
fn gated_handler(name: &str) -> (Arc<dyn JobHandler>, Arc<AtomicUsize>) {
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

async fn scheduler_with(handlers: Vec<Arc<dyn JobHandler>>) -> Scheduler {
    init_tracing();
    let registry = Arc::new(SimpleRegistry::new());
    for handler in handlers {
        registry.register(handler).await.unwrap();
    }
    Scheduler::with_compiler(registry, Arc::new(StubCompiler))
}

/// Drain a job's output into collected values, expecting completion.
async fn collect_output(job: &Job) -> Vec<Value> {
    let mut output = job.output();
    let mut values = Vec::new();
    while let Some(item) = timeout(TEST_TIMEOUT, output.next()).await.unwrap() {
        values.push(item.expect("output errored"));
    }
    values
}

// ── Registry properties ─────────────────────────────────────────────

#[tokio::test]
async fn registering_the_same_name_twice_conflicts() {
    let registry = SimpleRegistry::new();
    registry.register(echo_handler("build")).await.unwrap();
    let err = registry.register(echo_handler("build")).await.unwrap_err();
    assert!(matches!(err, Error::NameConflict { name } if name == "build"));

    // Distinct names register and retrieve the exact handler.
    let lint = echo_handler("lint");
    registry.register(Arc::clone(&lint)).await.unwrap();
    let retrieved = registry.get("lint").await.unwrap();
    assert!(Arc::ptr_eq(&lint, &retrieved));
}

#[tokio::test]
async fn scheduling_an_unknown_name_fails_with_job_not_found() {
    let scheduler = scheduler_with(vec![]).await;
    let job = scheduler.schedule("nope", json!({}));

    let mut output = job.output();
    let error = timeout(TEST_TIMEOUT, output.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap_err();
    assert!(matches!(&*error, Error::JobNotFound { name } if name == "nope"));
    assert_eq!(job.state(), JobState::Errored);
}

// ── Identity echo ───────────────────────────────────────────────────

#[tokio::test]
async fn identity_echo_yields_one_output_then_completion() {
    let scheduler = scheduler_with(vec![echo_handler("echo")]).await;
    let job = scheduler.schedule("echo", json!({"x": 5}));

    let values = collect_output(&job).await;
    assert_eq!(values, vec![json!({"x": 5})]);
    timeout(TEST_TIMEOUT, job.join()).await.unwrap();
    assert_eq!(job.state(), JobState::Ended);
}

// ── Strategy sharing ────────────────────────────────────────────────

#[tokio::test]
async fn reuse_shares_one_execution_between_quick_callers() {
    let (handler, invocations) = gated_handler("serve");
    let scheduler = scheduler_with(vec![reuse(handler, true)]).await;

    let first = scheduler.schedule("serve", json!({}));
    let second = scheduler.schedule("serve", json!({}));
    let mut first_messages = first.outbound();
    let mut second_messages = second.outbound();

    // Unblock the shared execution through one caller's input.
    first.send_input(json!(42));

    let mut starts = [0usize, 0usize];
    let mut outputs: Vec<Value> = Vec::new();
    for (index, stream) in [&mut first_messages, &mut second_messages].into_iter().enumerate() {
        while let Some(item) = timeout(TEST_TIMEOUT, stream.next()).await.unwrap() {
            match item.expect("outbound errored") {
                OutboundMessage::Start { .. } => starts[index] += 1,
                OutboundMessage::Output { value } => outputs.push(value),
                _ => {}
            }
        }
    }

    // One underlying execution, one Start observed by each caller, and
    // both outputs terminated together with the same value.
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
    assert_eq!(starts, [1, 1]);
    for value in outputs {
        assert_eq!(value, json!({"echo": 42}));
    }
    timeout(TEST_TIMEOUT, first.join()).await.unwrap();
    timeout(TEST_TIMEOUT, second.join()).await.unwrap();
}

#[tokio::test]
async fn memoize_keys_by_canonical_argument() {
    let (handler, invocations) = gated_handler("expensive");
    let scheduler = scheduler_with(vec![memoize(handler)]).await;

    let first = scheduler.schedule("expensive", json!({"a": 1, "b": 2}));
    let second = scheduler.schedule("expensive", json!({"b": 2, "a": 1}));
    second.send_input(json!(1));

    let first_values = collect_output(&first).await;
    let second_values = collect_output(&second).await;
    assert_eq!(first_values, second_values);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // A different argument starts an independent execution.
    let third = scheduler.schedule("expensive", json!({"a": 1, "b": 3}));
    third.send_input(json!(2));
    let third_values = collect_output(&third).await;
    assert_eq!(third_values, vec![json!({"echo": 2})]);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
}

// ── Pause ordering ──────────────────────────────────────────────────

#[tokio::test]
async fn paused_scheduler_queues_new_starts_only() {
    let (gated, _invocations) = gated_handler("running");
    let scheduler = scheduler_with(vec![echo_handler("echo"), gated]).await;

    // A job scheduled before pause is unaffected.
    let running = scheduler.schedule("running", json!({}));
    let first_resume = scheduler.pause();
    let second_resume = scheduler.pause();
    running.send_input(json!("still alive"));
    timeout(TEST_TIMEOUT, running.join()).await.unwrap();
    assert_eq!(running.state(), JobState::Ended);

    // A job scheduled under pause must not start until both resumes.
    let queued = scheduler.schedule("echo", json!({"x": 1}));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queued.state(), JobState::Queued);

    first_resume.resume();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(queued.state(), JobState::Queued);

    second_resume.resume();
    timeout(TEST_TIMEOUT, queued.join()).await.unwrap();
    assert_eq!(queued.state(), JobState::Ended);
}

// ── Channels ────────────────────────────────────────────────────────

#[tokio::test]
async fn channel_names_can_be_reopened_but_not_doubled() {
    let handler = Arc::new(FnJobHandler::from_future_fn(
        JobDescription::new("logger"),
        |_argument, ctx| async move {
            let log = ctx.create_channel("log").await?;
            log.send(json!("one")).await;
            log.complete().await;

            // Recreating after completion succeeds.
            let log = ctx.create_channel("log").await?;
            log.send(json!("two")).await;

            // Creating again while open is a conflict.
            let doubled = matches!(
                ctx.create_channel("log").await,
                Err(Error::ChannelConflict { .. })
            );
            log.complete().await;
            Ok(json!({ "doubled_rejected": doubled }))
        },
    ));
    let scheduler = scheduler_with(vec![handler as Arc<dyn JobHandler>]).await;

    let job = scheduler.schedule("logger", json!({}));
    let mut log = job.get_channel("log");

    let values = collect_output(&job).await;
    assert_eq!(values, vec![json!({"doubled_rejected": true})]);

    // The first channel instance delivered its value and completed.
    let first = timeout(TEST_TIMEOUT, log.next()).await.unwrap().unwrap();
    assert_eq!(first.unwrap(), json!("one"));
    assert!(timeout(TEST_TIMEOUT, log.next()).await.unwrap().is_none());
    timeout(TEST_TIMEOUT, job.join()).await.unwrap();
    assert_eq!(job.state(), JobState::Ended);
}

// ── Output validation ───────────────────────────────────────────────

#[tokio::test]
async fn invalid_output_errors_the_job_without_emitting() {
    let handler = Arc::new(FnJobHandler::from_value_fn(
        JobDescription::new("broken").with_output_schema(json!({"required": ["ok"]})),
        |_argument, _ctx| Ok(json!({"unexpected": true})),
    ));
    let scheduler = scheduler_with(vec![handler as Arc<dyn JobHandler>]).await;

    let job = scheduler.schedule("broken", json!({}));
    let mut output = job.output();
    let item = timeout(TEST_TIMEOUT, output.next()).await.unwrap().unwrap();
    let error = item.unwrap_err();
    match &*error {
        Error::Validation(failure) => {
            assert_eq!(failure.boundary, ValidationBoundary::Output);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(timeout(TEST_TIMEOUT, output.next()).await.unwrap().is_none());
    assert_eq!(job.state(), JobState::Errored);
}

// ── Dependencies, ping, stop ────────────────────────────────────────

#[tokio::test]
async fn dependencies_gate_readiness() {
    let (gated, _invocations) = gated_handler("dependency");
    let scheduler = scheduler_with(vec![echo_handler("dependent"), gated]).await;

    let dependency = scheduler.schedule("dependency", json!({}));
    let dependent = scheduler.schedule_with(
        "dependent",
        json!({"after": true}),
        ScheduleOptions {
            dependencies: vec![dependency.clone()],
        },
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(dependent.state(), JobState::Queued);
    assert_eq!(dependency.state(), JobState::Started);

    dependency.send_input(json!("go"));
    timeout(TEST_TIMEOUT, dependency.join()).await.unwrap();

    let values = collect_output(&dependent).await;
    assert_eq!(values, vec![json!({"after": true})]);
}

#[tokio::test]
async fn ping_resolves_without_touching_output() {
    let (gated, _invocations) = gated_handler("pingable");
    let scheduler = scheduler_with(vec![gated]).await;

    let job = scheduler.schedule("pingable", json!({}));
    timeout(TEST_TIMEOUT, job.ping())
        .await
        .unwrap()
        .expect("pong expected");

    job.send_input(json!("done"));
    let values = collect_output(&job).await;
    // Only the real output value; the pong never surfaces here.
    assert_eq!(values, vec![json!({"echo": "done"})]);
}

#[tokio::test]
async fn stop_is_cooperative_and_drains() {
    let (gated, _invocations) = gated_handler("stoppable");
    let scheduler = scheduler_with(vec![gated]).await;

    let job = scheduler.schedule("stoppable", json!({}));
    let mut messages = job.outbound();
    // Wait until the job is started, then request a stop.
    loop {
        let message = timeout(TEST_TIMEOUT, messages.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if matches!(message, OutboundMessage::Start { .. }) {
            break;
        }
    }
    job.stop();
    timeout(TEST_TIMEOUT, job.join()).await.unwrap();
    assert_eq!(job.state(), JobState::Ended);
}
