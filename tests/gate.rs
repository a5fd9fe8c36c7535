//! Behavior of the polling gate against scripted status checks.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use xray_load::error::LoadError;
use xray_load::gate::{
    Classification, PollAttempt, PollConfig, PollOutcome, PollRequest, PollingGate, StatusCheck,
};

#[derive(Clone, Copy, Debug)]
enum Reply {
    Pending,
    Done,
    Error,
    Transport,
    Fatal,
}

/// Replays a fixed list of replies, then answers Pending forever.
struct ScriptedCheck {
    script: Mutex<VecDeque<Reply>>,
    calls: AtomicU32,
    call_times: Mutex<Vec<Instant>>,
}

impl ScriptedCheck {
    fn new(replies: &[Reply]) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(replies.iter().copied().collect()),
            calls: AtomicU32::new(0),
            call_times: Mutex::new(Vec::new()),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn gaps(&self) -> Vec<Duration> {
        let times = self.call_times.lock().unwrap();
        times.windows(2).map(|w| w[1] - w[0]).collect()
    }
}

impl StatusCheck for ScriptedCheck {
    async fn check_status(&self, _request: &PollRequest) -> Result<PollAttempt, LoadError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        let reply = self.script.lock().unwrap().pop_front().unwrap_or(Reply::Pending);
        match reply {
            Reply::Pending => Ok(PollAttempt::pending(r#"{"overall":{"status":"PENDING"}}"#)),
            Reply::Done => Ok(PollAttempt::done(r#"{"overall":{"status":"DONE"}}"#)),
            Reply::Error => Ok(PollAttempt::error("not json")),
            Reply::Transport => Err(LoadError::Upstream {
                step: "Check Scan Status".into(),
                message: "502 Bad Gateway".into(),
                status: Some(502),
            }),
            Reply::Fatal => Err(LoadError::AuthFailed {
                step: "Check Scan Status".into(),
                message: "HTTP 401 Unauthorized".into(),
            }),
        }
    }
}

fn request(label: &str) -> PollRequest {
    PollRequest::for_image("docker-local", "alpine", "3.9", label)
}

fn config(max_attempts: u32, interval_ms: u64) -> PollConfig {
    PollConfig::new(max_attempts, Duration::from_millis(interval_ms)).unwrap()
}

#[tokio::test]
async fn all_pending_times_out_after_exactly_n_queries() {
    for n in [1, 2, 5] {
        let check = ScriptedCheck::new(&[]);
        let gate = PollingGate::new(check.clone(), config(n, 0));

        let outcome = gate.await_completion(&request("pending")).await;

        assert_eq!(outcome, PollOutcome::TimedOut { attempts: n });
        assert_eq!(check.calls(), n);
    }
}

#[tokio::test]
async fn done_on_kth_query_completes_without_further_queries() {
    let check = ScriptedCheck::new(&[Reply::Pending, Reply::Pending, Reply::Done]);
    let gate = PollingGate::new(check.clone(), config(6, 0));

    let outcome = gate.await_completion(&request("kth")).await;

    assert_eq!(outcome, PollOutcome::Completed { attempts: 3 });
    assert_eq!(check.calls(), 3);
}

#[tokio::test]
async fn done_on_first_query_does_not_sleep() {
    let check = ScriptedCheck::new(&[Reply::Done]);
    let gate = PollingGate::new(check.clone(), config(3, 500));

    let start = Instant::now();
    let outcome = gate.await_completion(&request("first")).await;

    assert!(outcome.is_completed());
    assert!(
        start.elapsed() < Duration::from_millis(400),
        "gate slept after a terminal Done: {:?}",
        start.elapsed()
    );
}

#[tokio::test]
async fn fatal_error_fails_immediately() {
    let check = ScriptedCheck::new(&[Reply::Pending, Reply::Fatal, Reply::Done]);
    let gate = PollingGate::new(check.clone(), config(10, 0));

    let outcome = gate.await_completion(&request("fatal")).await;

    match outcome {
        PollOutcome::Failed { attempts, reason } => {
            assert_eq!(attempts, 2);
            assert!(reason.contains("auth failed"), "reason: {reason}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    assert_eq!(check.calls(), 2);
}

#[tokio::test]
async fn transient_errors_do_not_end_polling() {
    let check = ScriptedCheck::new(&[Reply::Error, Reply::Pending, Reply::Error, Reply::Done]);
    let gate = PollingGate::new(check.clone(), config(5, 0));

    let trace = gate.await_completion_traced(&request("transient")).await;

    assert_eq!(trace.outcome, PollOutcome::Completed { attempts: 4 });
    assert_eq!(check.calls(), 4);
    let kinds: Vec<Classification> = trace.attempts.iter().map(|a| a.classification).collect();
    assert_eq!(
        kinds,
        [
            Classification::Error,
            Classification::Pending,
            Classification::Error,
            Classification::Done
        ]
    );
}

#[tokio::test]
async fn transport_errors_are_recorded_as_error_attempts() {
    let check = ScriptedCheck::new(&[Reply::Transport, Reply::Transport, Reply::Transport]);
    let gate = PollingGate::new(check.clone(), config(3, 0));

    let trace = gate.await_completion_traced(&request("transport")).await;

    assert_eq!(trace.outcome, PollOutcome::TimedOut { attempts: 3 });
    assert_eq!(trace.attempts.len(), 3);
    assert!(trace.attempts.iter().all(|a| a.classification == Classification::Error));
    assert!(trace.attempts[0].payload.contains("502"));
}

#[tokio::test]
async fn error_on_last_attempt_times_out_without_sleeping() {
    let check = ScriptedCheck::new(&[Reply::Pending, Reply::Transport]);
    let gate = PollingGate::new(check.clone(), config(2, 200));

    let start = Instant::now();
    let trace = gate.await_completion_traced(&request("last-error")).await;

    assert_eq!(trace.outcome, PollOutcome::TimedOut { attempts: 2 });
    assert_eq!(check.calls(), 2);
    let last = trace.attempts.last().unwrap();
    assert_eq!(last.classification, Classification::Error);
    assert!(last.payload.contains("502"));
    assert!(start.elapsed() < Duration::from_millis(400), "slept after the final attempt");
}

#[tokio::test]
async fn interval_separates_attempts() {
    let interval = Duration::from_millis(40);
    let check = ScriptedCheck::new(&[]);
    let gate = PollingGate::new(check.clone(), config(4, 40));

    let start = Instant::now();
    let outcome = gate.await_completion(&request("interval")).await;
    let elapsed = start.elapsed();

    assert_eq!(outcome, PollOutcome::TimedOut { attempts: 4 });
    assert!(elapsed >= interval * 3, "elapsed {elapsed:?}");
    for gap in check.gaps() {
        assert!(gap >= interval, "gap {gap:?} shorter than interval");
    }
}

#[tokio::test]
async fn initial_delay_precedes_first_query() {
    let check = ScriptedCheck::new(&[Reply::Done]);
    let cfg = config(2, 0).with_initial_delay(Duration::from_millis(60));
    let gate = PollingGate::new(check.clone(), cfg);

    let start = Instant::now();
    let outcome = gate.await_completion(&request("settle")).await;

    assert!(outcome.is_completed());
    let first = check.call_times.lock().unwrap()[0];
    assert!(first - start >= Duration::from_millis(60));
}

#[tokio::test]
async fn concurrent_gates_are_independent() {
    let fast = ScriptedCheck::new(&[Reply::Pending, Reply::Done]);
    let slow = ScriptedCheck::new(&[Reply::Pending, Reply::Error, Reply::Pending]);
    let gate_a = PollingGate::new(fast.clone(), config(5, 10));
    let gate_b = PollingGate::new(slow.clone(), config(5, 10));

    let req_a = request("user-0-iter-0");
    let req_b = request("user-1-iter-0");
    let (a, b) = tokio::join!(gate_a.await_completion(&req_a), gate_b.await_completion(&req_b));

    assert_eq!(a, PollOutcome::Completed { attempts: 2 });
    assert_eq!(b, PollOutcome::TimedOut { attempts: 5 });
    assert_eq!(fast.calls(), 2);
    assert_eq!(slow.calls(), 5);
}

#[tokio::test]
async fn gates_run_in_spawned_tasks() {
    let mut handles = Vec::new();
    for user in 0..4u32 {
        let mut replies = vec![Reply::Pending; user as usize];
        replies.push(Reply::Done);
        let check = ScriptedCheck::new(&replies);
        handles.push(tokio::spawn(async move {
            let gate = PollingGate::new(check.clone(), config(3, 5));
            let outcome = gate.await_completion(&request(&format!("user-{user}"))).await;
            (user, outcome, check.calls())
        }));
    }

    for handle in handles {
        let (user, outcome, calls) = handle.await.unwrap();
        if user < 3 {
            assert_eq!(outcome, PollOutcome::Completed { attempts: user + 1 });
            assert_eq!(calls, user + 1);
        } else {
            // Done would be the 4th reply, past the budget
            assert_eq!(outcome, PollOutcome::TimedOut { attempts: 3 });
            assert_eq!(calls, 3);
        }
    }
}
