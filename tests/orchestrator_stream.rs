mod common;

use std::sync::Arc;

use common::{Outcome, StubProvider, collect, orchestrator, orchestrator_with, reply, text_of};
use futures_util::StreamExt;
use llm_relay::error::ErrorKind;
use llm_relay::orchestrator::UNROUTED_BACKEND;
use llm_relay::ratelimit::ManualClock;
use llm_relay::{FinishReason, ProcessOptions, StreamFallbackMode, SwitchReason};

fn cut(partial: &[&str]) -> Outcome {
    Outcome::StreamCut(
        partial.iter().map(|piece| piece.to_string()).collect(),
        ErrorKind::ApiError,
    )
}

#[tokio::test]
async fn successful_stream_has_exactly_one_terminal_chunk() {
    let clock = ManualClock::new();
    let alpha =
        Arc::new(StubProvider::new("alpha", &clock).always(reply("the quick brown fox jumps")));
    let orchestrator = orchestrator(&[alpha]);

    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        None,
        None,
        ProcessOptions::default(),
    ))
    .await;

    let finished: Vec<usize> = chunks
        .iter()
        .enumerate()
        .filter(|(_, chunk)| chunk.finished)
        .map(|(index, _)| index)
        .collect();
    assert_eq!(finished, vec![chunks.len() - 1]);
    let terminal = chunks.last().expect("terminal");
    assert_eq!(terminal.finish_reason, Some(FinishReason::Stop));
    assert!(terminal.usage.is_some());
    assert!(chunks.iter().all(|chunk| !chunk.is_error() && !chunk.restart));
    assert!(chunks.iter().all(|chunk| chunk.id == chunks[0].id));
}

#[tokio::test]
async fn streamed_content_matches_blocking_content() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock).always(reply("Rust is a systems language")));
    let orchestrator = orchestrator(&[alpha.clone()]);

    let blocking = orchestrator
        .process("hello", "main", None, None, ProcessOptions::default())
        .await
        .expect("blocking");
    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        None,
        None,
        ProcessOptions::default(),
    ))
    .await;

    assert_eq!(text_of(&chunks), blocking.content);
    assert_eq!(alpha.open_streams(), 0);
    assert_eq!(chunks.last().and_then(|c| c.usage), Some(blocking.usage));
}

#[tokio::test]
async fn mid_stream_failure_restarts_on_the_next_backend() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock).always(cut(&["par", "tial "])));
    let beta = Arc::new(StubProvider::new("beta", &clock).always(reply("full answer")));
    let orchestrator = orchestrator(&[alpha.clone(), beta.clone()]);

    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        Some("alpha"),
        None,
        ProcessOptions::default(),
    ))
    .await;

    let backends: Vec<&str> = chunks.iter().map(|c| c.backend.as_str()).collect();
    assert_eq!(backends, vec!["alpha", "alpha", "beta", "beta", "beta"]);
    let restarts: Vec<bool> = chunks.iter().map(|c| c.restart).collect();
    assert_eq!(restarts, vec![false, false, true, false, false]);

    let restart_at = chunks.iter().position(|c| c.restart).expect("restart marker");
    assert_eq!(text_of(&chunks[restart_at..]), "full answer");
    assert_eq!(chunks.iter().filter(|c| c.finished).count(), 1);
    assert!(!chunks.iter().any(|c| c.is_error()));

    let history = orchestrator.switch_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].reason, SwitchReason::Fallback);
    assert_eq!(orchestrator.metrics("alpha").failed_requests, 1);
    assert_eq!(orchestrator.metrics("beta").successful_requests, 1);
}

#[tokio::test]
async fn append_mode_forwards_without_restart_marker() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock).always(cut(&["partial "])));
    let beta = Arc::new(StubProvider::new("beta", &clock).always(reply("rest")));
    let orchestrator = orchestrator_with(&[alpha, beta], |b| {
        b.stream_fallback_mode(StreamFallbackMode::Append)
    });

    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        Some("alpha"),
        None,
        ProcessOptions::default(),
    ))
    .await;

    assert_eq!(text_of(&chunks), "partial rest");
    assert!(chunks.iter().all(|c| !c.restart));
}

#[tokio::test]
async fn failure_to_open_falls_back_without_restart() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock).always(Outcome::Fail(ErrorKind::Timeout)));
    let beta = Arc::new(StubProvider::new("beta", &clock).always(reply("hi there")));
    let orchestrator = orchestrator(&[alpha.clone(), beta]);

    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        Some("alpha"),
        None,
        ProcessOptions::default(),
    ))
    .await;

    assert_eq!(text_of(&chunks), "hi there");
    assert!(chunks.iter().all(|c| c.backend == "beta" && !c.restart));
    assert_eq!(alpha.calls(), 1);
}

#[tokio::test]
async fn exhausted_stream_ends_with_a_terminal_error_chunk() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock).always(cut(&["a "])));
    let beta = Arc::new(StubProvider::new("beta", &clock).always(cut(&["b "])));
    let orchestrator = orchestrator(&[alpha.clone(), beta.clone()]);

    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        Some("alpha"),
        None,
        ProcessOptions::default(),
    ))
    .await;

    assert_eq!(chunks.iter().filter(|c| c.finished).count(), 1);
    let terminal = chunks.last().expect("terminal");
    assert!(terminal.finished);
    assert_eq!(terminal.finish_reason, Some(FinishReason::Error));
    let error = terminal.error.as_ref().expect("error payload");
    assert!(error.exhausted);
    assert_eq!(error.kind, ErrorKind::ApiError);
    assert_eq!(alpha.calls() + beta.calls(), 3);
    assert_eq!(text_of(&chunks), "a b a ");
}

#[tokio::test]
async fn content_errors_end_the_stream_without_fallback() {
    let clock = ManualClock::new();
    let alpha = Arc::new(
        StubProvider::new("alpha", &clock).always(Outcome::StreamCut(
            vec!["so ".to_string()],
            ErrorKind::ContentFilter,
        )),
    );
    let beta = Arc::new(StubProvider::new("beta", &clock));
    let orchestrator = orchestrator(&[alpha, beta.clone()]);

    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        Some("alpha"),
        None,
        ProcessOptions::default(),
    ))
    .await;

    let terminal = chunks.last().expect("terminal");
    let error = terminal.error.as_ref().expect("error payload");
    assert_eq!(error.kind, ErrorKind::ContentFilter);
    assert!(!error.exhausted);
    assert_eq!(beta.calls(), 0);
}

#[tokio::test]
async fn no_backend_is_reported_as_a_chunk() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock).disabled());
    let orchestrator = orchestrator(&[alpha.clone()]);

    let chunks = collect(orchestrator.stream_process(
        "hello",
        "main",
        None,
        None,
        ProcessOptions::default(),
    ))
    .await;

    assert_eq!(chunks.len(), 1);
    assert!(chunks[0].is_error());
    assert!(chunks[0].error.as_ref().is_some_and(|e| e.exhausted));
    assert_eq!(chunks[0].backend, UNROUTED_BACKEND);
    assert_eq!(alpha.calls(), 0);
}

#[tokio::test]
async fn rejected_request_names_the_default_backend() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock));
    let orchestrator = orchestrator_with(&[alpha.clone()], |b| b.default_backend("alpha"));

    let chunks = collect(orchestrator.stream_process(
        "   ",
        "main",
        None,
        None,
        ProcessOptions::default(),
    ))
    .await;

    assert_eq!(chunks.len(), 1);
    assert_eq!(chunks[0].backend, "alpha");
    assert_eq!(
        chunks[0].error.as_ref().map(|e| e.kind),
        Some(ErrorKind::InvalidRequest)
    );
    assert_eq!(alpha.calls(), 0);
}

#[tokio::test]
async fn dropping_the_stream_early_stops_forwarding() {
    let clock = ManualClock::new();
    let alpha = Arc::new(StubProvider::new("alpha", &clock).always(reply("one two three four")));
    let orchestrator = orchestrator(&[alpha.clone()]);

    let mut stream = orchestrator.stream_process(
        "hello",
        "main",
        None,
        None,
        ProcessOptions::default(),
    );
    let first = stream.next().await.expect("first chunk");
    assert_eq!(first.delta, "one ");
    assert_eq!(alpha.open_streams(), 1);
    drop(stream);

    assert_eq!(alpha.open_streams(), 0);
    assert_eq!(alpha.calls(), 1);
    assert_eq!(orchestrator.metrics("alpha").total_requests, 0);
}
