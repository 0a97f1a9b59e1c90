//! Watchdog timing, run on a paused clock.

mod common;

use common::*;
use rh205_lib::watchdog::{Exchange, Outcome, RetryPolicy, Watchdog, WatchdogExit};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::time::{Instant, sleep};

fn counting_action(counter: &Arc<AtomicUsize>) -> impl FnMut() -> std::future::Ready<Result<(), SensorError>> + Send + 'static {
    let counter = Arc::clone(counter);
    move || {
        counter.fetch_add(1, Ordering::SeqCst);
        std::future::ready(Ok(()))
    }
}

#[tokio::test(start_paused = true)]
async fn test_silent_peer_times_out_exactly_once() {
    let actions = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let exchange = Exchange::new();
    let policy = RetryPolicy::millis(0, 0, 2, 500);

    let started = Instant::now();
    let timeouts_cb = Arc::clone(&timeouts);
    let mut handle = Watchdog::new(policy, counting_action(&actions))
        .on_timeout(move || {
            timeouts_cb.fetch_add(1, Ordering::SeqCst);
        })
        .spawn(&exchange);

    let exit = handle.expired().await;
    assert!(matches!(exit, WatchdogExit::TimedOut), "got {exit:?}");
    assert_eq!(actions.load(Ordering::SeqCst), 3, "one send plus two retries");
    assert_eq!(timeouts.load(Ordering::SeqCst), 1);
    assert!(started.elapsed() >= Duration::from_millis(2 * 500));
    assert_eq!(exchange.outcome(), Outcome::TimedOut);
    assert!(!exchange.succeed(), "late response must not flip a timed out exchange");
}

#[tokio::test(start_paused = true)]
async fn test_response_inside_first_window_stops_silently() {
    let actions = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let exchange = Exchange::new();

    let timeouts_cb = Arc::clone(&timeouts);
    let mut handle = Watchdog::new(RetryPolicy::millis(0, 0, 2, 500), counting_action(&actions))
        .on_timeout(move || {
            timeouts_cb.fetch_add(1, Ordering::SeqCst);
        })
        .spawn(&exchange);

    let responder = exchange.clone();
    tokio::spawn(async move {
        sleep(Duration::from_millis(120)).await;
        assert!(responder.succeed());
    });

    let exit = handle.expired().await;
    assert!(matches!(exit, WatchdogExit::Received));
    assert_eq!(actions.load(Ordering::SeqCst), 1);
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_handle_never_fires() {
    let actions = Arc::new(AtomicUsize::new(0));
    let timeouts = Arc::new(AtomicUsize::new(0));
    let exchange = Exchange::new();

    let timeouts_cb = Arc::clone(&timeouts);
    let handle = Watchdog::new(RetryPolicy::millis(0, 0, 1, 100), counting_action(&actions))
        .on_timeout(move || {
            timeouts_cb.fetch_add(1, Ordering::SeqCst);
        })
        .spawn(&exchange);

    sleep(Duration::from_millis(50)).await;
    drop(handle);
    sleep(Duration::from_secs(5)).await;

    assert_eq!(actions.load(Ordering::SeqCst), 1);
    assert_eq!(timeouts.load(Ordering::SeqCst), 0);
    assert_eq!(exchange.outcome(), Outcome::Pending);
}

#[tokio::test(start_paused = true)]
async fn test_delays_bracket_the_first_action() {
    let fired_at = Arc::new(std::sync::Mutex::new(None));
    let exchange = Exchange::new();
    let started = Instant::now();

    let slot = Arc::clone(&fired_at);
    let mut handle = Watchdog::new(RetryPolicy::millis(100, 300, 0, 200), move || {
        *slot.lock().unwrap() = Some(Instant::now());
        std::future::ready(Ok(()))
    })
    .spawn(&exchange);

    let exit = handle.expired().await;
    assert!(matches!(exit, WatchdogExit::TimedOut));
    let fired = fired_at.lock().unwrap().expect("action never ran");
    let waited = fired - started;
    assert!(waited >= Duration::from_millis(100) && waited < Duration::from_millis(110), "{waited:?}");
    // initial + post-action delay + one window
    assert!(started.elapsed() >= Duration::from_millis(600));
}

#[tokio::test(start_paused = true)]
async fn test_action_failure_ends_watchdog() {
    let exchange = Exchange::new();
    let mut handle = Watchdog::new(RetryPolicy::millis(0, 0, 3, 100), || {
        std::future::ready(Err(SensorError::Link(LinkError::Write("radio off".to_string()))))
    })
    .spawn(&exchange);

    match handle.expired().await {
        WatchdogExit::ActionFailed(SensorError::Link(LinkError::Write(reason))) => assert_eq!(reason, "radio off"),
        other => panic!("Expected ActionFailed, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn test_spawn_resets_a_settled_exchange() {
    let exchange = Exchange::new();
    assert!(exchange.succeed());
    let mut handle = Watchdog::idle(RetryPolicy::millis(0, 0, 0, 50)).spawn(&exchange);
    assert_eq!(exchange.outcome(), Outcome::Pending);
    assert!(matches!(handle.expired().await, WatchdogExit::TimedOut));
}

#[test]
fn test_exit_maps_to_operation_result() {
    assert!(WatchdogExit::Received.into_result(Command::SelfCheck, "x").is_ok());
    match WatchdogExit::TimedOut.into_result(Command::SelfCheck, "no report") {
        Err(SensorError::ResponseTimeout { command, reason }) => {
            assert_eq!(command, Command::SelfCheck);
            assert_eq!(reason, "no report");
        }
        other => panic!("Expected ResponseTimeout, got {other:?}"),
    }
    assert!(matches!(
        WatchdogExit::Cancelled.into_result(Command::SelfCheck, "x"),
        Err(SensorError::Superseded)
    ));
}
