//! Integration tests for reactive commands
//!
//! Checks status transitions seen by observers of an `AsyncState`, result
//! sharing, error isolation and retry behaviour of commands built with the
//! reactive command builder.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use command_flow_core::async_state::{AsyncState, AsyncStatus};
use command_flow_core::command::Command;
use command_flow_core::error::EffectError;
use command_flow_core::reducer::FnReducer;
use command_flow_runtime::retry::RetryPolicy;
use command_flow_runtime::{PipelineError, ReactiveCommand};
use command_flow_testing::{RecordingObserver, Script, ScriptedEffect, wait_until};
use std::time::Duration;

// ============================================================================
// Test Fixtures
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
enum ProfileCommand {
    Load,
}

impl Command for ProfileCommand {
    fn name(&self) -> &'static str {
        "profile.load"
    }
}

type ProfileEffect = ScriptedEffect<ProfileCommand, String>;

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn profile_command(
    state: &AsyncState<Option<String>>,
    effect: &ProfileEffect,
) -> ReactiveCommand<ProfileEffect> {
    ReactiveCommand::with_reducer(
        state,
        effect.clone(),
        FnReducer::new(|_: &Option<String>, _: &ProfileCommand, name: &String| {
            Some(name.clone())
        }),
    )
}

async fn idle(command: &ReactiveCommand<ProfileEffect>) {
    assert!(wait_until(Duration::from_secs(30), || command.running() == 0).await);
}

// ============================================================================
// Status transitions
// ============================================================================

#[tokio::test(start_paused = true)]
async fn success_goes_loading_then_idle() {
    let effect = ProfileEffect::new().always(Script::new().delay(ms(20)).value("ada".into()));
    let state = AsyncState::new(None);
    let statuses = RecordingObserver::new();
    let _sub = statuses.attach_state(state.status());
    let command = profile_command(&state, &effect);

    command.execute(ProfileCommand::Load).unwrap();
    assert!(statuses.wait_for_len(1, ms(5)).await);
    assert_eq!(state.status().value(), AsyncStatus::Loading);
    idle(&command).await;

    assert_eq!(statuses.values(), vec![AsyncStatus::Loading, AsyncStatus::Idle]);
    assert_eq!(state.data().value(), Some("ada".to_string()));
}

#[tokio::test(start_paused = true)]
async fn failure_surfaces_error_status_and_keeps_data() {
    let cause = EffectError::http(404, "no profile");
    let effect = ProfileEffect::new()
        .then(Script::err(cause.clone()))
        .always(Script::ok("grace".into()));
    let state = AsyncState::new(Some("previous".to_string()));
    let statuses = RecordingObserver::new();
    let _sub = statuses.attach_state(state.status());
    let command = profile_command(&state, &effect);
    let errors = RecordingObserver::<EffectError>::new();
    let _errors = command.errors(errors.observer());

    command.execute(ProfileCommand::Load).unwrap();
    idle(&command).await;

    assert_eq!(
        statuses.values(),
        vec![AsyncStatus::Loading, AsyncStatus::Error(cause.clone())]
    );
    assert_eq!(errors.values(), vec![cause]);
    assert_eq!(state.data().value(), Some("previous".to_string()));

    command.execute(ProfileCommand::Load).unwrap();
    idle(&command).await;
    assert_eq!(state.status().value(), AsyncStatus::Idle);
    assert_eq!(state.data().value(), Some("grace".to_string()));
}

#[tokio::test(start_paused = true)]
async fn overlapping_executions_stay_loading_until_last_finishes() {
    let effect = ProfileEffect::new()
        .then(Script::new().delay(ms(10)).value("fast".into()))
        .then(Script::new().delay(ms(50)).value("slow".into()));
    let state = AsyncState::new(None);
    let statuses = RecordingObserver::new();
    let _sub = statuses.attach_state(state.status());
    let command = profile_command(&state, &effect);

    command.execute(ProfileCommand::Load).unwrap();
    command.execute(ProfileCommand::Load).unwrap();

    tokio::time::sleep(ms(20)).await;
    assert_eq!(state.status().value(), AsyncStatus::Loading);
    assert_eq!(state.data().value(), Some("fast".to_string()));

    idle(&command).await;
    assert_eq!(statuses.values(), vec![AsyncStatus::Loading, AsyncStatus::Idle]);
    assert_eq!(state.data().value(), Some("slow".to_string()));
    assert_eq!(effect.invocations(), 2);
}

// ============================================================================
// Results and retries
// ============================================================================

#[tokio::test(start_paused = true)]
async fn results_are_shared_without_rerunning_effect() {
    let effect = ProfileEffect::new().always(Script::ok("ada".into()));
    let command = ReactiveCommand::builder(effect.clone()).name("profile").build();
    let first = RecordingObserver::<String>::new();
    let second = RecordingObserver::<String>::new();
    let _a = command.results(first.observer());
    let _b = command.results(second.observer());

    command.execute(ProfileCommand::Load).unwrap();
    assert!(first.wait_for_len(1, ms(100)).await);

    assert_eq!(command.name(), "profile");
    assert_eq!(first.values(), vec!["ada".to_string()]);
    assert_eq!(second.values(), vec!["ada".to_string()]);
    assert_eq!(effect.invocations(), 1);
}

#[tokio::test(start_paused = true)]
async fn retry_policy_retries_transient_errors_with_backoff() {
    let effect = ProfileEffect::new()
        .then(Script::err(EffectError::http(500, "boom")))
        .then(Script::err(EffectError::http(502, "bad gateway")))
        .then(Script::err(EffectError::http(503, "unavailable")))
        .always(Script::ok("never".into()));
    let state = AsyncState::new(None::<String>);
    let command = ReactiveCommand::builder(effect.clone())
        .tracker(state.tracker().clone())
        .retry_policy(RetryPolicy::builder().max_retries(3).build())
        .build();
    let errors = RecordingObserver::<EffectError>::new();
    let _sub = command.errors(errors.observer());

    let started = tokio::time::Instant::now();
    command.execute(ProfileCommand::Load).unwrap();
    assert!(errors.wait_for_len(1, Duration::from_secs(10)).await);

    assert_eq!(effect.invocations(), 3);
    assert_eq!(errors.values(), vec![EffectError::http(503, "unavailable")]);
    assert!(started.elapsed() >= ms(1500));
    assert!(wait_until(ms(10), || state.status().value().error().is_some()).await);
}

// ============================================================================
// Disposal
// ============================================================================

#[tokio::test(start_paused = true)]
async fn dispose_cancels_and_completes_feeds() {
    let effect = ProfileEffect::new().always(Script::pending());
    let state = AsyncState::new(None);
    let command = profile_command(&state, &effect);
    let results = RecordingObserver::<String>::new();
    let _sub = command.results(results.observer());

    command.execute(ProfileCommand::Load).unwrap();
    tokio::time::sleep(ms(1)).await;
    assert_eq!(command.running(), 1);

    command.dispose();
    command.dispose();
    idle(&command).await;

    assert!(command.is_disposed());
    assert_eq!(state.status().value(), AsyncStatus::Idle);
    assert!(results.is_empty());
    assert_eq!(
        command.execute(ProfileCommand::Load).unwrap_err(),
        PipelineError::Disposed
    );
}
