//! Integration tests for idempotent pipelines and dispatch
//!
//! Drives pipelines with scripted effects on a paused clock and checks the
//! guarantees callers rely on: one execution per key, cancellation that
//! suppresses output, failures that release the key, and retries.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use command_flow_core::command::{Command, CommandKey};
use command_flow_core::error::{EffectError, KeyError};
use command_flow_core::reducer::FnReducer;
use command_flow_core::state::ReactiveState;
use command_flow_runtime::retry::RetryPolicy;
use command_flow_runtime::{
    CommandDispatcher, CommandPipeline, ExecutionHandle, IdempotentPipeline, PipelineConfig,
    PipelineError, PipelineFailure,
};
use command_flow_testing::{
    RecordingObserver, Script, ScriptedEffect, init_test_tracing, wait_until,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct LoadOrder {
    id: u32,
}

impl Command for LoadOrder {
    fn name(&self) -> &'static str {
        "order.load"
    }
}

type OrderEffect = ScriptedEffect<LoadOrder, u32>;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn order_key(cmd: &LoadOrder) -> String {
    format!("order:{}", cmd.id)
}

/// Pipeline summing every output into `total`.
fn summing_pipeline(
    config: PipelineConfig,
    effect: &OrderEffect,
    total: &ReactiveState<u32>,
) -> IdempotentPipeline<OrderEffect> {
    IdempotentPipeline::with_reducer(
        config,
        effect.clone(),
        order_key,
        total.clone(),
        FnReducer::new(|sum: &u32, _: &LoadOrder, n: &u32| sum + n),
    )
}

async fn settle(pipeline: &IdempotentPipeline<OrderEffect>) {
    assert!(wait_until(Duration::from_secs(30), || pipeline.in_flight() == 0).await);
}

// ============================================================================
// Deduplication
// ============================================================================

#[tokio::test(start_paused = true)]
async fn duplicate_key_runs_effect_once() {
    let effect = OrderEffect::new().always(Script::new().delay(ms(100)).value(1));
    let total = ReactiveState::new(0);
    let pipeline = summing_pipeline(PipelineConfig::new("orders"), &effect, &total);

    let first = pipeline.execute(LoadOrder { id: 1 }).unwrap();
    let second = pipeline.execute(LoadOrder { id: 1 }).unwrap();
    let other = pipeline.execute(LoadOrder { id: 2 }).unwrap();

    assert!(first.is_started());
    assert!(!second.is_started());
    assert!(other.is_started());
    assert_eq!(pipeline.in_flight_keys(), vec!["order:1", "order:2"]);

    settle(&pipeline).await;
    assert_eq!(effect.invocations(), 2);
    assert_eq!(total.value(), 2);
}

#[tokio::test(start_paused = true)]
async fn key_is_free_again_after_completion() {
    let effect = OrderEffect::new().always(Script::new().delay(ms(10)).value(5));
    let total = ReactiveState::new(0);
    let pipeline = summing_pipeline(PipelineConfig::new("orders"), &effect, &total);

    pipeline.execute(LoadOrder { id: 1 }).unwrap();
    settle(&pipeline).await;
    let again = pipeline.execute(LoadOrder { id: 1 }).unwrap();
    assert!(again.is_started());
    settle(&pipeline).await;

    assert_eq!(effect.invocations(), 2);
    assert_eq!(total.value(), 10);
}

#[tokio::test(start_paused = true)]
async fn every_emission_is_reduced_in_order() {
    let effect = OrderEffect::new().always(Script::new().value(1).delay(ms(5)).value(2).value(3));
    let seen = ReactiveState::new(Vec::<u32>::new());
    let pipeline = IdempotentPipeline::with_reducer(
        PipelineConfig::new("orders"),
        effect,
        order_key,
        seen.clone(),
        FnReducer::new(|acc: &Vec<u32>, _: &LoadOrder, n: &u32| {
            let mut next = acc.clone();
            next.push(*n);
            next
        }),
    );

    pipeline.execute(LoadOrder { id: 7 }).unwrap();
    assert!(wait_until(Duration::from_secs(1), || pipeline.in_flight() == 0).await);

    assert_eq!(seen.value(), vec![1, 2, 3]);
}

// ============================================================================
// Cancellation
// ============================================================================

#[tokio::test(start_paused = true)]
async fn cancel_suppresses_late_output() {
    let effect = OrderEffect::new().always(Script::new().delay(ms(50)).value(9));
    let total = ReactiveState::new(0);
    let pipeline = summing_pipeline(PipelineConfig::new("orders"), &effect, &total);

    let handle = pipeline.execute(LoadOrder { id: 3 }).unwrap();
    tokio::time::sleep(ms(10)).await;

    assert!(pipeline.cancel("order:3"));
    assert!(!pipeline.cancel("order:3"));
    assert!(!handle.is_running());
    assert!(!pipeline.is_running("order:3"));

    tokio::time::sleep(ms(200)).await;
    assert_eq!(total.value(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancel_unknown_key_is_noop() {
    let effect = OrderEffect::new();
    let total = ReactiveState::new(0);
    let pipeline = summing_pipeline(PipelineConfig::new("orders"), &effect, &total);

    assert!(!pipeline.cancel("order:404"));
    assert_eq!(pipeline.cancel_all(), 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_key_can_run_again() {
    let effect = OrderEffect::new().then(Script::pending()).always(Script::ok(4));
    let total = ReactiveState::new(0);
    let pipeline = summing_pipeline(PipelineConfig::new("orders"), &effect, &total);

    let first = pipeline.execute(LoadOrder { id: 1 }).unwrap();
    tokio::time::sleep(ms(1)).await;
    assert!(first.cancel());

    let second = pipeline.execute(LoadOrder { id: 1 }).unwrap();
    assert!(second.is_started());
    settle(&pipeline).await;

    assert!(!first.cancel());
    assert_eq!(total.value(), 4);
}

// ============================================================================
// Failures and retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn failure_releases_key_and_leaves_state_untouched() {
    init_test_tracing();
    let effect = OrderEffect::new()
        .then(Script::err(EffectError::http(404, "no such order")))
        .always(Script::ok(6));
    let total = ReactiveState::new(0);
    let pipeline = summing_pipeline(PipelineConfig::new("orders"), &effect, &total);
    let failures = RecordingObserver::<PipelineFailure>::new();
    let _sub = pipeline.on_failure(failures.observer());

    pipeline.execute(LoadOrder { id: 8 }).unwrap();
    assert!(failures.wait_for_len(1, ms(100)).await);

    let failure = failures.last().unwrap();
    assert_eq!(failure.pipeline, "orders");
    assert_eq!(failure.key, "order:8");
    assert_eq!(failure.command, "order.load");
    assert_eq!(failure.error, EffectError::http(404, "no such order"));
    assert!(!pipeline.is_running("order:8"));
    assert_eq!(total.value(), 0);

    pipeline.execute(LoadOrder { id: 8 }).unwrap();
    settle(&pipeline).await;
    assert_eq!(total.value(), 6);
}

#[tokio::test(start_paused = true)]
async fn retry_policy_recovers_from_transient_failures() {
    init_test_tracing();
    let effect = OrderEffect::new()
        .then(Script::err(EffectError::http(503, "unavailable")))
        .then(Script::err(EffectError::Timeout("slow".into())))
        .always(Script::ok(7));
    let total = ReactiveState::new(0);
    let policy = RetryPolicy::builder()
        .max_retries(3)
        .initial_delay(ms(500))
        .multiplier(2.0)
        .build();
    let pipeline = summing_pipeline(
        PipelineConfig::new("orders").with_retry_policy(policy),
        &effect,
        &total,
    );
    let failures = RecordingObserver::<PipelineFailure>::new();
    let _sub = pipeline.on_failure(failures.observer());

    let started = tokio::time::Instant::now();
    pipeline.execute(LoadOrder { id: 1 }).unwrap();
    settle(&pipeline).await;

    assert_eq!(effect.invocations(), 3);
    assert_eq!(total.value(), 7);
    assert!(failures.is_empty());
    assert!(started.elapsed() >= ms(1500));
}

#[tokio::test(start_paused = true)]
async fn retry_policy_gives_up_on_terminal_error() {
    init_test_tracing();
    let effect = OrderEffect::new().always(Script::err(EffectError::AuthenticationUnavailable(
        "no token".into(),
    )));
    let total = ReactiveState::new(0);
    let pipeline = summing_pipeline(
        PipelineConfig::new("orders").with_retry_policy(RetryPolicy::default()),
        &effect,
        &total,
    );
    let failures = RecordingObserver::<PipelineFailure>::new();
    let _sub = pipeline.on_failure(failures.observer());

    pipeline.execute(LoadOrder { id: 1 }).unwrap();
    assert!(failures.wait_for_len(1, ms(100)).await);

    assert_eq!(effect.invocations(), 1);
    assert_eq!(total.value(), 0);
}

// ============================================================================
// Keys
// ============================================================================

/// Key scoped to the signed-in user, remembering the last claimed key.
#[derive(Clone, Default)]
struct UserScopedKey {
    user: Arc<Mutex<Option<String>>>,
    current: Arc<Mutex<Option<String>>>,
}

impl CommandKey<LoadOrder> for UserScopedKey {
    fn key(&self, command: &LoadOrder) -> Result<String, KeyError> {
        let user = self
            .user
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| KeyError::Unavailable("no signed-in user".into()))?;
        Ok(format!("{user}:order:{}", command.id))
    }

    fn current_key(&self) -> Option<String> {
        self.current.lock().unwrap().clone()
    }

    fn claimed(&self, key: &str) {
        *self.current.lock().unwrap() = Some(key.to_string());
    }
}

#[tokio::test(start_paused = true)]
async fn missing_key_context_rejects_command() {
    let effect = OrderEffect::new().always(Script::pending());
    let keys = UserScopedKey::default();
    let pipeline = IdempotentPipeline::new(
        PipelineConfig::new("orders"),
        effect.clone(),
        keys.clone(),
        |_: &LoadOrder, _: u32| {},
    );

    let error = pipeline.execute(LoadOrder { id: 1 }).unwrap_err();
    assert!(matches!(error, PipelineError::Key(KeyError::Unavailable(_))));
    assert_eq!(pipeline.in_flight(), 0);
    assert_eq!(keys.current_key(), None);

    *keys.user.lock().unwrap() = Some("ada".into());
    let handle = pipeline.execute(LoadOrder { id: 1 }).unwrap();
    assert_eq!(handle.key(), Some("ada:order:1"));
    assert_eq!(keys.current_key(), Some("ada:order:1".to_string()));

    // A dropped duplicate does not move the current key
    assert!(!pipeline.execute(LoadOrder { id: 1 }).unwrap().is_started());
    assert_eq!(keys.current_key(), Some("ada:order:1".to_string()));

    assert!(pipeline.cancel_current());
    assert!(!pipeline.cancel_current());
    assert_eq!(pipeline.in_flight(), 0);
}

// ============================================================================
// Dispatch
// ============================================================================

#[tokio::test(start_paused = true)]
async fn dispatcher_fans_out_and_deduplicates_per_pipeline() {
    let primary = OrderEffect::new().always(Script::new().delay(ms(20)).value(1));
    let audit = OrderEffect::new().always(Script::new().delay(ms(20)).value(100));
    let total = ReactiveState::new(0);

    let primary_pipeline = Arc::new(summing_pipeline(
        PipelineConfig::new("primary"),
        &primary,
        &total,
    ));
    let audit_pipeline = Arc::new(summing_pipeline(
        PipelineConfig::new("audit"),
        &audit,
        &total,
    ));

    let dispatcher = CommandDispatcher::new();
    dispatcher.register(Arc::clone(&primary_pipeline)).unwrap();
    dispatcher.register(Arc::clone(&audit_pipeline)).unwrap();
    assert_eq!(dispatcher.pipeline_count(), 2);

    let first = dispatcher.dispatch(LoadOrder { id: 1 }).unwrap();
    let second = dispatcher.dispatch(LoadOrder { id: 1 }).unwrap();
    assert!(first.iter().all(ExecutionHandle::is_started));
    assert!(second.iter().all(|h| !h.is_started()));

    settle(&primary_pipeline).await;
    settle(&audit_pipeline).await;
    assert_eq!(primary.invocations(), 1);
    assert_eq!(audit.invocations(), 1);
    assert_eq!(total.value(), 101);

    dispatcher.dispose();
    assert_eq!(
        dispatcher.dispatch(LoadOrder { id: 2 }).unwrap_err(),
        PipelineError::Disposed
    );
}
