//! Retrying transport. One logical call is a sequence of physical attempts
//! separated by exponential backoff. The call holds a cancel token in the
//! active request registry from its first attempt until it settles, so it can
//! be cancelled on the wire or while it waits to retry. Each attempt runs on
//! its own worker thread and is timed out independently of the others.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use crate::backoff::{ExponentialBackoff, RetryPolicy};
use crate::error::ApiError;
use crate::http::throttle::Throttle;
use crate::http::Request;
use crate::io::HttpRunner;
use crate::metrics::PerformanceMetrics;
use crate::registry::{ActiveRequests, AttemptOutcome, CancelToken};
use crate::time::Milliseconds;
use crate::{log_debug, log_info};

pub struct RetryingTransport {
    runner: Arc<dyn HttpRunner>,
    registry: Arc<ActiveRequests>,
    metrics: Arc<PerformanceMetrics>,
    throttle: Arc<dyn Throttle>,
    timeout: Milliseconds,
    policy: RetryPolicy,
}

impl RetryingTransport {
    pub fn new(
        runner: Arc<dyn HttpRunner>,
        registry: Arc<ActiveRequests>,
        metrics: Arc<PerformanceMetrics>,
        throttle: Arc<dyn Throttle>,
        timeout: Milliseconds,
        policy: RetryPolicy,
    ) -> Self {
        RetryingTransport {
            runner,
            registry,
            metrics,
            throttle,
            timeout,
            policy,
        }
    }

    /// Execute one logical call. The request's own timeout, retries and
    /// retry delay override the transport defaults.
    ///
    /// HTTP statuses come back as `Ok(Response)`: 4xx immediately, 5xx once
    /// the retry budget is spent. Errors are reserved for calls that never
    /// produced a response (transport failure, timeout, abort).
    pub fn execute(&self, request: &Request) -> AttemptOutcome {
        let policy = RetryPolicy {
            retries: request.retries().unwrap_or(self.policy.retries),
            base_delay: request.retry_delay().unwrap_or(self.policy.base_delay),
            jitter: self.policy.jitter,
        };
        let mut request = request.clone();
        request.set_timeout(request.timeout().unwrap_or(self.timeout));

        let id = self.registry.next_id(request.url());
        let token = self.registry.register(&id);
        log_debug!("Request {} registered as {}", request.url(), id);

        let mut last_duration = Milliseconds::default();
        let mut backoff =
            ExponentialBackoff::new(policy, self.throttle.as_ref()).with_cancel(&token);
        let outcome = backoff.retry(|attempt| {
            if let Some(reason) = token.reason() {
                log_info!("Not starting attempt {} for {}: {}", attempt, request.url(), reason);
                return Err(ApiError::Aborted(reason));
            }
            let started = Instant::now();
            let outcome = self.attempt(&request, &token, attempt);
            last_duration = started.elapsed().into();
            outcome
        });
        self.registry.remove(&id);

        let status = outcome.as_ref().ok().map(|response| response.status);
        self.metrics.record(request.url(), last_duration, status);
        outcome
    }

    fn attempt(&self, request: &Request, token: &CancelToken, attempt: u32) -> AttemptOutcome {
        let timeout = request.timeout().unwrap_or(self.timeout);
        let (tx, rx) = mpsc::channel();
        token.arm(tx.clone());

        let runner = self.runner.clone();
        let worker_request = request.clone();
        let spawned = thread::Builder::new()
            .name("afetch-attempt".to_string())
            .spawn(move || {
                // The token holds a sender too, so the channel never
                // disconnects on its own. A panic has to be reported.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| runner.run(&worker_request)))
                    .unwrap_or_else(|_| {
                        Err(ApiError::Transport("request worker panicked".to_string()).into())
                    })
                    .map_err(ApiError::from_anyhow);
                // Nobody listens anymore if the attempt was cancelled or
                // timed out.
                let _ = tx.send(outcome);
            });

        let outcome = match spawned {
            Err(err) => Err(ApiError::Transport(format!(
                "could not start request worker: {err}"
            ))),
            Ok(_) if *timeout == 0 => rx.recv().unwrap_or_else(|_| {
                Err(ApiError::Transport(
                    "request worker exited without a response".to_string(),
                ))
            }),
            Ok(_) => match rx.recv_timeout(timeout.as_duration()) {
                Ok(outcome) => outcome,
                Err(RecvTimeoutError::Timeout) => Err(ApiError::Timeout(format!(
                    "no response from {} within {} ms",
                    request.url(),
                    timeout
                ))),
                Err(RecvTimeoutError::Disconnected) => Err(ApiError::Transport(
                    "request worker exited without a response".to_string(),
                )),
            },
        };
        token.disarm();

        match &outcome {
            Ok(response) if response.is_server_error() => log_info!(
                "Attempt {} for {} got status {}",
                attempt,
                request.url(),
                response.status
            ),
            Err(err) => log_info!("Attempt {} for {} failed: {}", attempt, request.url(), err),
            Ok(_) => {}
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::throttle::DynamicFixed;
    use crate::http::Method;
    use crate::io::Response;
    use crate::test::utils::{MockClock, MockRunner, MockThrottler};
    use std::time::Duration;

    fn response(status: u16) -> Response {
        Response::builder().status(status).build().unwrap()
    }

    struct Fixture {
        runner: Arc<MockRunner>,
        registry: Arc<ActiveRequests>,
        metrics: Arc<PerformanceMetrics>,
        throttler: Arc<MockThrottler>,
        transport: RetryingTransport,
    }

    fn fixture(runner: MockRunner, timeout: u64, retries: u32) -> Fixture {
        let runner = Arc::new(runner);
        let registry = Arc::new(ActiveRequests::new());
        let metrics = Arc::new(PerformanceMetrics::new(Arc::new(MockClock::new(0))));
        let throttler = Arc::new(MockThrottler::new());
        let transport = RetryingTransport::new(
            runner.clone(),
            registry.clone(),
            metrics.clone(),
            throttler.clone(),
            Milliseconds::new(timeout),
            RetryPolicy::new(retries, Milliseconds::new(100)),
        );
        Fixture {
            runner,
            registry,
            metrics,
            throttler,
            transport,
        }
    }

    fn get(url: &str) -> Request {
        Request::new(url, Method::GET)
    }

    #[test]
    fn test_success_on_first_attempt() {
        let f = fixture(MockRunner::new(vec![response(200)]), 1000, 3);
        let outcome = f.transport.execute(&get("http://localhost/api/a"));
        assert_eq!(200, outcome.unwrap().status);
        assert_eq!(1, f.runner.run_count());
        assert!(f.registry.is_empty());
        let samples = f.metrics.samples(Some("http://localhost/api/a"));
        assert_eq!(1, samples.len());
        assert_eq!(Some(200), samples[0].status);
    }

    #[test]
    fn test_retries_server_errors_with_exponential_backoff() {
        let runner = MockRunner::with_outcomes(vec![
            Ok(response(200)),
            Err(ApiError::Transport("connection reset".to_string())),
            Ok(response(503)),
        ]);
        let f = fixture(runner, 1000, 3);
        let outcome = f.transport.execute(&get("http://localhost/api/a"));
        assert_eq!(200, outcome.unwrap().status);
        assert_eq!(3, f.runner.run_count());
        assert_eq!(
            vec![Milliseconds::new(100), Milliseconds::new(200)],
            f.throttler.delays()
        );
        // one sample per logical call
        assert_eq!(1, f.metrics.len());
    }

    #[test]
    fn test_client_error_is_not_retried() {
        let f = fixture(MockRunner::new(vec![response(404)]), 1000, 3);
        let outcome = f.transport.execute(&get("http://localhost/api/missing"));
        assert_eq!(404, outcome.unwrap().status);
        assert_eq!(1, f.runner.run_count());
        assert_eq!(0, f.throttler.throttled());
    }

    #[test]
    fn test_exhausted_retries_return_last_outcome() {
        let runner = MockRunner::new(vec![response(502), response(500), response(503)]);
        let f = fixture(runner, 1000, 2);
        let outcome = f.transport.execute(&get("http://localhost/api/a"));
        assert_eq!(502, outcome.unwrap().status);
        assert_eq!(3, f.runner.run_count());
        assert_eq!(Some(502), f.metrics.samples(None)[0].status);
    }

    #[test]
    fn test_request_overrides_retry_budget() {
        let runner = MockRunner::new(vec![response(200), response(503), response(503)]);
        let f = fixture(runner, 1000, 3);
        let mut request = get("http://localhost/api/a");
        request.set_retries(0);
        let outcome = f.transport.execute(&request);
        assert_eq!(503, outcome.unwrap().status);
        assert_eq!(1, f.runner.run_count());
    }

    #[test]
    fn test_attempt_timeout_counts_towards_retries() {
        let runner = MockRunner::new(vec![response(200), response(200)])
            .with_latency(Duration::from_millis(300));
        let f = fixture(runner, 50, 1);
        let err = f
            .transport
            .execute(&get("http://localhost/api/slow"))
            .unwrap_err();
        match err {
            ApiError::Timeout(msg) => assert!(msg.contains("http://localhost/api/slow")),
            other => panic!("Expected timeout, got {other:?}"),
        }
        assert_eq!(1, f.throttler.throttled());
        assert!(f.registry.is_empty());
        assert_eq!(None, f.metrics.samples(None)[0].status);
    }

    #[test]
    fn test_worker_receives_per_attempt_timeout() {
        let f = fixture(MockRunner::new(vec![response(200)]), 750, 0);
        f.transport.execute(&get("http://localhost/api/a")).unwrap();
        assert_eq!(
            Some(Milliseconds::new(750)),
            f.runner.last_request().unwrap().timeout()
        );
    }

    #[test]
    fn test_cancel_all_aborts_pending_attempt_without_retry() {
        let runner = MockRunner::new(vec![response(200), response(200)])
            .with_latency(Duration::from_millis(2000));
        let f = Arc::new(fixture(runner, 10_000, 3));
        let caller = {
            let f = f.clone();
            thread::spawn(move || f.transport.execute(&get("http://localhost/api/devices")))
        };
        while f.registry.is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        let started = Instant::now();
        assert_eq!(1, f.registry.cancel_all());
        let err = caller.join().unwrap().unwrap_err();
        assert!(err.is_aborted());
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(f.registry.is_empty());
        assert_eq!(0, f.throttler.throttled());
    }

    #[test]
    fn test_cancel_during_backoff_aborts_without_new_attempt() {
        let runner = Arc::new(MockRunner::new(vec![response(200), response(503)]));
        let registry = Arc::new(ActiveRequests::new());
        let transport = Arc::new(RetryingTransport::new(
            runner.clone(),
            registry.clone(),
            Arc::new(PerformanceMetrics::new(Arc::new(MockClock::new(0)))),
            Arc::new(DynamicFixed),
            Milliseconds::new(1000),
            RetryPolicy::new(3, Milliseconds::new(2_000)),
        ));
        let caller = {
            let transport = transport.clone();
            thread::spawn(move || transport.execute(&get("http://localhost/api/devices")))
        };
        while runner.run_count() == 0 {
            thread::sleep(Duration::from_millis(5));
        }
        // first attempt answered 503, the call now sleeps before retrying
        thread::sleep(Duration::from_millis(100));
        let started = Instant::now();
        assert_eq!(1, registry.cancel_by_pattern("/api/devices"));
        let err = caller.join().unwrap().unwrap_err();
        assert!(err.is_aborted(), "{err:?}");
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert_eq!(1, runner.run_count());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_closed_registry_rejects_new_calls() {
        let f = fixture(MockRunner::new(vec![response(200)]), 1000, 3);
        f.registry.close();
        let err = f
            .transport
            .execute(&get("http://localhost/api/a"))
            .unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(0, f.runner.run_count());
    }

    struct PanickingRunner;

    impl HttpRunner for PanickingRunner {
        fn run(&self, _request: &Request) -> crate::Result<Response> {
            panic!("runner blew up");
        }
    }

    #[test]
    fn test_panicking_runner_without_timeout_settles_the_call() {
        let transport = RetryingTransport::new(
            Arc::new(PanickingRunner),
            Arc::new(ActiveRequests::new()),
            Arc::new(PerformanceMetrics::new(Arc::new(MockClock::new(0)))),
            Arc::new(MockThrottler::new()),
            Milliseconds::new(0),
            RetryPolicy::new(1, Milliseconds::new(10)),
        );
        match transport.execute(&get("http://localhost/api/a")) {
            Err(ApiError::Transport(msg)) => assert!(msg.contains("panicked")),
            other => panic!("Expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn test_backoff_timing_between_attempt_starts() {
        let runner = Arc::new(MockRunner::with_outcomes(vec![
            Ok(response(200)),
            Ok(response(500)),
            Err(ApiError::Transport("connection refused".to_string())),
        ]));
        let metrics = Arc::new(PerformanceMetrics::new(Arc::new(MockClock::new(0))));
        let transport = RetryingTransport::new(
            runner.clone(),
            Arc::new(ActiveRequests::new()),
            metrics,
            Arc::new(DynamicFixed),
            Milliseconds::new(1000),
            RetryPolicy::new(3, Milliseconds::new(100)),
        );
        let outcome = transport.execute(&get("http://localhost/api/a"));
        assert_eq!(200, outcome.unwrap().status);
        let starts = runner.attempt_starts();
        assert_eq!(3, starts.len());
        let first_gap = starts[1].duration_since(starts[0]);
        let second_gap = starts[2].duration_since(starts[1]);
        assert!(first_gap >= Duration::from_millis(100), "{first_gap:?}");
        assert!(first_gap < Duration::from_millis(190), "{first_gap:?}");
        assert!(second_gap >= Duration::from_millis(200), "{second_gap:?}");
        assert!(second_gap < Duration::from_millis(350), "{second_gap:?}");
    }
}
