use parking_lot::Mutex;
use portable_atomic::{AtomicUsize, Ordering};
use rand::Rng;
use std::{collections::HashMap, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};
use volley::{
    CancelCause, CancellationToken, DispatchError, DispatchOptions, Dispatcher, Executor,
    TaskToken, dispatch, executor_fn,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Succeed,
    Fail,
    Panic,
}

#[derive(Debug, Clone)]
struct Job {
    label: String,
    delay: Duration,
    outcome: Outcome,
}

fn ok(label: &str, ms: u64) -> Job {
    Job {
        label: label.to_owned(),
        delay: Duration::from_millis(ms),
        outcome: Outcome::Succeed,
    }
}

fn failing(label: &str, ms: u64) -> Job {
    Job {
        outcome: Outcome::Fail,
        ..ok(label, ms)
    }
}

#[derive(Error, Debug)]
#[error("{0} failed")]
struct Boom(String);

#[derive(Debug, Clone, PartialEq, Eq)]
enum Event {
    Start(String),
    End(String),
}

/// Records what the dispatcher did with each job.
#[derive(Debug, Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    started_at: Mutex<HashMap<String, Duration>>,
    tokens: Mutex<HashMap<String, TaskToken>>,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Recorder {
    fn starts(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                Event::Start(label) => Some(label.clone()),
                Event::End(_) => None,
            })
            .collect()
    }

    fn started_at_ms(&self, label: &str) -> u128 {
        self.started_at.lock()[label].as_millis()
    }

    fn token(&self, label: &str) -> TaskToken {
        self.tokens.lock()[label].clone()
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

struct InFlight<'a>(&'a Recorder);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Sleeps for the job's delay and then resolves as the job says. Ignores its
/// token, so cancellation is entirely up to the dispatcher.
struct Scripted {
    recorder: Arc<Recorder>,
    origin: Instant,
}

impl Scripted {
    fn new() -> (Self, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let executor = Self {
            recorder: Arc::clone(&recorder),
            origin: Instant::now(),
        };
        (executor, recorder)
    }
}

impl Executor for Scripted {
    type Input = Job;
    type Output = String;
    type Error = Boom;

    async fn execute(&self, job: &Job, token: TaskToken) -> Result<String, Boom> {
        let rec = &*self.recorder;
        rec.calls.fetch_add(1, Ordering::SeqCst);
        let now = rec.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        rec.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _in_flight = InFlight(rec);

        rec.events.lock().push(Event::Start(job.label.clone()));
        rec.started_at
            .lock()
            .insert(job.label.clone(), self.origin.elapsed());
        rec.tokens.lock().insert(job.label.clone(), token);

        sleep(job.delay).await;
        rec.events.lock().push(Event::End(job.label.clone()));

        match job.outcome {
            Outcome::Succeed => Ok(job.label.clone()),
            Outcome::Fail => Err(Boom(job.label.clone())),
            Outcome::Panic => panic!("kaboom"),
        }
    }
}

async fn settled(token: TaskToken) -> CancelCause {
    timeout(Duration::from_secs(1), token.cancelled())
        .await
        .expect("token never fired")
}

fn labels(jobs: &[Job]) -> Vec<String> {
    jobs.iter().map(|job| job.label.clone()).collect()
}

#[tokio::test(start_paused = true)]
async fn caps_concurrency_and_preserves_input_order() {
    let jobs = vec![
        ok("A", 80),
        ok("B", 20),
        ok("C", 35),
        ok("D", 10),
        ok("E", 60),
        ok("F", 25),
    ];
    let (executor, rec) = Scripted::new();

    let out = dispatch(jobs.clone(), 2, DispatchOptions::new(executor))
        .await
        .unwrap();

    assert_eq!(out, labels(&jobs));
    assert!(rec.max_in_flight() <= 2);
    assert_eq!(rec.calls(), 6);

    // A holds one worker until 80. C, D and E run back to back on the other
    // worker, and F takes over A's worker.
    for (label, expected) in [("A", 0), ("B", 0), ("C", 20), ("D", 55), ("E", 65), ("F", 80)] {
        let actual = rec.started_at_ms(label);
        assert!(
            actual.abs_diff(expected) <= 1,
            "{label} started at {actual}ms, expected {expected}ms"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn fail_fast_cancels_in_flight_peers() {
    let jobs = vec![ok("OK1", 100), failing("FAIL", 20), ok("OK2", 100)];
    let (executor, rec) = Scripted::new();

    let err = dispatch(jobs, 2, DispatchOptions::new(executor))
        .await
        .unwrap_err();

    match err {
        DispatchError::Task { index, source } => {
            assert_eq!(index, 1);
            assert_eq!(source.to_string(), "FAIL failed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(settled(rec.token("OK1")).await, CancelCause::FailFast);
    assert!(!rec.token("FAIL").is_cancelled());

    // OK2 was never claimed: the batch halted before a worker freed up.
    sleep(Duration::from_millis(500)).await;
    assert_eq!(rec.starts(), ["OK1", "FAIL"]);
    assert!(!rec.events.lock().contains(&Event::End("OK1".into())));
}

#[tokio::test(start_paused = true)]
async fn fail_fast_reaches_every_in_flight_task() {
    let jobs = vec![ok("OK1", 100), failing("FAIL", 20), ok("OK2", 100)];
    let (executor, rec) = Scripted::new();

    let err = dispatch(jobs, 3, DispatchOptions::new(executor))
        .await
        .unwrap_err();

    assert_eq!(err.index(), Some(1));
    assert!(!err.is_cancellation());
    assert_eq!(settled(rec.token("OK1")).await, CancelCause::FailFast);
    assert_eq!(settled(rec.token("OK2")).await, CancelCause::FailFast);
}

#[tokio::test(start_paused = true)]
async fn single_worker_runs_strictly_sequentially() {
    let jobs = vec![ok("A", 30), ok("B", 10), ok("C", 20)];
    let (executor, rec) = Scripted::new();

    let out = dispatch(jobs.clone(), 1, DispatchOptions::new(executor))
        .await
        .unwrap();

    assert_eq!(out, labels(&jobs));
    assert_eq!(rec.max_in_flight(), 1);
    assert_eq!(
        *rec.events.lock(),
        [
            Event::Start("A".into()),
            Event::End("A".into()),
            Event::Start("B".into()),
            Event::End("B".into()),
            Event::Start("C".into()),
            Event::End("C".into()),
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn cap_above_task_count_runs_one_worker_per_task() {
    let jobs = vec![ok("A", 50), ok("B", 50)];
    let (executor, rec) = Scripted::new();

    let out = dispatch(jobs.clone(), 10, DispatchOptions::new(executor))
        .await
        .unwrap();

    assert_eq!(out, labels(&jobs));
    assert_eq!(rec.max_in_flight(), 2);
    assert_eq!(rec.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn timeout_fires_only_the_slow_task() {
    let jobs = vec![ok("slow", 1_000), ok("fast", 50)];
    let (executor, rec) = Scripted::new();
    let options = DispatchOptions::new(executor).with_timeout_per_task(Duration::from_millis(100));

    let started = Instant::now();
    let err = dispatch(jobs, 2, options).await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Cancelled {
            index: 0,
            cause: CancelCause::Timeout
        }
    ));
    assert_eq!(err.to_string(), "task 0 cancelled (timeout)");
    assert!(started.elapsed() < Duration::from_millis(200));
    assert_eq!(rec.token("slow").cause(), Some(CancelCause::Timeout));
    assert!(!rec.token("fast").is_cancelled());
}

#[tokio::test(start_paused = true)]
async fn timeout_longer_than_tasks_is_harmless() {
    let jobs = vec![ok("A", 10), ok("B", 20), ok("C", 30)];
    let (executor, rec) = Scripted::new();
    let options = DispatchOptions::new(executor).with_timeout_per_task(Duration::from_millis(100));

    let out = dispatch(jobs.clone(), 2, options).await.unwrap();

    assert_eq!(out, labels(&jobs));
    sleep(Duration::from_millis(500)).await;
    assert!(labels(&jobs).iter().all(|label| !rec.token(label).is_cancelled()));
}

#[tokio::test(start_paused = true)]
async fn caller_cancellation_stops_the_batch() {
    let jobs: Vec<_> = ["A", "B", "C", "D"].iter().map(|l| ok(l, 100)).collect();
    let (executor, rec) = Scripted::new();
    let caller = CancellationToken::new();
    let options = DispatchOptions::new(executor).with_caller_token(caller.clone());

    tokio::spawn(async move {
        sleep(Duration::from_millis(50)).await;
        caller.cancel();
    });
    let err = dispatch(jobs, 2, options).await.unwrap_err();

    assert_eq!(err.cause(), Some(CancelCause::Caller));
    assert!(err.index().is_some_and(|index| index < 2));
    assert_eq!(rec.calls(), 2);
    assert_eq!(rec.token("A").cause(), Some(CancelCause::Caller));
}

#[tokio::test(start_paused = true)]
async fn cancelled_caller_token_runs_nothing() {
    let (executor, rec) = Scripted::new();
    let caller = CancellationToken::new();
    caller.cancel();
    let options = DispatchOptions::new(executor).with_caller_token(caller);

    let err = dispatch(vec![ok("A", 10), ok("B", 10)], 2, options)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Cancelled {
            index: 0,
            cause: CancelCause::Caller
        }
    ));
    assert_eq!(rec.calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn without_fail_fast_every_task_runs_before_rejecting() {
    let jobs = vec![
        ok("OK1", 50),
        failing("FAIL", 10),
        ok("OK2", 30),
        failing("LATE", 40),
    ];
    let (executor, rec) = Scripted::new();
    let options = DispatchOptions::new(executor).with_fail_fast(false);

    let err = dispatch(jobs.clone(), 2, options).await.unwrap_err();

    // FAIL fails at t=10, LATE only at t=80.
    assert_eq!(err.index(), Some(1));
    assert_eq!(rec.calls(), 4);
    for label in labels(&jobs) {
        assert!(rec.events.lock().contains(&Event::End(label.clone())));
        assert!(!rec.token(&label).is_cancelled());
    }
}

#[tokio::test(start_paused = true)]
async fn randomized_batch_keeps_order_under_cap() {
    let mut rng = rand::rng();
    let jobs: Vec<_> = (0..50)
        .map(|i| ok(&format!("job-{i}"), rng.random_range(1..50)))
        .collect();
    let (executor, rec) = Scripted::new();

    let out = dispatch(jobs.clone(), 10, DispatchOptions::new(executor))
        .await
        .unwrap();

    assert_eq!(out, labels(&jobs));
    assert!(rec.max_in_flight() <= 10);
    assert_eq!(rec.calls(), 50);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn multi_threaded_runtime_respects_cap() {
    let jobs: Vec<_> = (0..40).map(|i| ok(&format!("job-{i}"), 2)).collect();
    let (executor, rec) = Scripted::new();
    let dispatcher = Dispatcher::new(4, DispatchOptions::new(executor));

    let out = dispatcher.dispatch(jobs.clone()).await.unwrap();

    assert_eq!(out, labels(&jobs));
    assert!(rec.max_in_flight() <= 4);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn fail_fast_surfaces_the_originating_error_across_threads() {
    // Every peer fails as soon as it sees the fail-fast token, so many of
    // them finish before the worker that failed first.
    let executor = executor_fn(|index: usize, token: TaskToken| async move {
        if index == 0 {
            sleep(Duration::from_millis(5)).await;
            return Err(Boom(format!("task {index}")));
        }
        let cause = token.cancelled().await;
        Err::<usize, _>(Boom(format!("task {index} after {cause}")))
    });
    let dispatcher = Dispatcher::new(256, DispatchOptions::new(executor));

    for round in 0..100 {
        match dispatcher.dispatch(0..256_usize).await.unwrap_err() {
            DispatchError::Task { index: 0, source } => {
                assert_eq!(source.to_string(), "task 0 failed");
            }
            other => panic!("round {round}: surfaced {other}"),
        }
    }
}

#[tokio::test]
async fn timeout_includes_work_done_before_the_first_yield() {
    let executor = executor_fn(|n: u32, _token: TaskToken| async move {
        std::thread::sleep(Duration::from_millis(100));
        sleep(Duration::from_millis(20)).await;
        Ok::<_, Boom>(n)
    });
    let options =
        DispatchOptions::new(executor).with_timeout_per_task(Duration::from_millis(50));

    let err = dispatch(vec![1_u32], 1, options).await.unwrap_err();

    assert!(matches!(
        err,
        DispatchError::Cancelled {
            index: 0,
            cause: CancelCause::Timeout
        }
    ));
}

#[tokio::test]
async fn missing_input_is_named_and_nothing_runs() {
    let (executor, rec) = Scripted::new();
    let jobs = vec![Some(ok("A", 1)), Some(ok("B", 1)), None];

    let err = dispatch(jobs, 2, DispatchOptions::new(executor))
        .await
        .unwrap_err();

    assert!(err.is_validation());
    assert_eq!(err.index(), Some(2));
    assert_eq!(err.to_string(), "invalid input at index 2: input is missing");
    assert_eq!(rec.calls(), 0);
}

#[tokio::test]
async fn zero_cap_is_rejected() {
    let (executor, rec) = Scripted::new();

    let err = dispatch(vec![ok("A", 1)], 0, DispatchOptions::new(executor))
        .await
        .unwrap_err();

    assert_eq!(err.to_string(), "max_concurrency must be a positive integer");
    assert_eq!(rec.calls(), 0);
}

#[tokio::test]
async fn empty_batch_never_touches_the_executor() {
    let (executor, rec) = Scripted::new();

    let out = dispatch(Vec::<Job>::new(), 3, DispatchOptions::new(executor))
        .await
        .unwrap();

    assert!(out.is_empty());
    assert_eq!(rec.calls(), 0);
}

#[tokio::test(start_paused = true)]
#[should_panic(expected = "kaboom")]
async fn executor_panic_reaches_the_caller() {
    let (executor, _rec) = Scripted::new();
    let jobs = vec![
        ok("A", 100),
        Job {
            outcome: Outcome::Panic,
            ..ok("B", 10)
        },
    ];

    let _ = dispatch(jobs, 2, DispatchOptions::new(executor)).await;
}
