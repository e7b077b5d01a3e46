//! Outer probe loop: run attempts through the escalation policy, sleep a
//! fixed interval between resolved iterations, and hand back a
//! [`FatalEscalation`] when an iteration fails on every attempt.
use crate::attempt::{AttemptError, AttemptRunner};
use crate::retry::{Decision, EscalationPolicy};
use chrono::{DateTime, Local};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Source of the inter-iteration pause, injectable for tests.
pub trait Sleeper {
    fn sleep(&mut self, duration: Duration) -> impl Future<Output = ()> + Send;
}

/// Real sleep on the tokio timer.
pub struct TokioSleeper;

impl Sleeper for TokioSleeper {
    fn sleep(&mut self, duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}

/// One failed attempt with enough context to report it.
#[derive(Debug)]
pub struct AttemptFailure {
    /// 1-based attempt number within the iteration.
    pub attempt: u32,
    pub started_at: DateTime<Local>,
    pub elapsed: Duration,
    pub error: AttemptError,
}

impl std::fmt::Display for AttemptFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "attempt {} started {} ran {}s: {}",
            self.attempt,
            self.started_at.format("%Y-%m-%d %H:%M:%S"),
            self.elapsed.as_secs(),
            self.error
        )
    }
}

/// Every attempt of one iteration failed. The process should exit non-zero.
#[derive(Debug)]
pub struct FatalEscalation {
    pub addr: String,
    pub user: String,
    pub iteration: u64,
    pub failures: Vec<AttemptFailure>,
}

impl std::fmt::Display for FatalEscalation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "peer down: {}@{} failed {} consecutive attempts in iteration {}",
            self.user,
            self.addr,
            self.failures.len(),
            self.iteration
        )?;
        for failure in &self.failures {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for FatalEscalation {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.failures
            .last()
            .map(|failure| &failure.error as &(dyn std::error::Error + 'static))
    }
}

/// How one outer iteration resolved.
#[derive(Debug)]
pub enum Iteration {
    /// First attempt succeeded.
    Healthy,
    /// First attempt failed, the immediate retry succeeded.
    Recovered,
    Fatal(FatalEscalation),
}

pub struct Supervisor {
    addr: String,
    user: String,
    interval: Duration,
    iteration: u64,
}

impl Supervisor {
    pub fn new(addr: String, user: String, interval: Duration) -> Self {
        Self {
            addr,
            user,
            interval,
            iteration: 0,
        }
    }

    /// Run one outer iteration: attempt, and on failure retry immediately
    /// until the policy resolves.
    pub async fn run_iteration<R: AttemptRunner>(
        &mut self,
        runner: &mut R,
        policy: &mut EscalationPolicy,
    ) -> Iteration {
        self.iteration += 1;
        let mut failures = Vec::new();
        let mut attempt = 1;

        loop {
            let started_at = Local::now();
            let clock = Instant::now();
            let result = runner.run_attempt().await;
            let elapsed = clock.elapsed();

            let decision = policy.evaluate(result.is_ok());
            if let Err(error) = result {
                tracing::warn!(
                    iteration = self.iteration,
                    attempt,
                    kind = error.kind(),
                    error = %error,
                    elapsed_secs = elapsed.as_secs(),
                    "probe attempt failed"
                );
                failures.push(AttemptFailure {
                    attempt,
                    started_at,
                    elapsed,
                    error,
                });
            }

            match decision {
                Decision::Sleep { recovered: false } => return Iteration::Healthy,
                Decision::Sleep { recovered: true } => {
                    tracing::info!(
                        iteration = self.iteration,
                        attempt,
                        "probe recovered on retry"
                    );
                    return Iteration::Recovered;
                }
                Decision::RetryNow { attempt: next } => attempt = next,
                Decision::Fatal => {
                    return Iteration::Fatal(FatalEscalation {
                        addr: self.addr.clone(),
                        user: self.user.clone(),
                        iteration: self.iteration,
                        failures,
                    })
                }
            }
        }
    }

    /// Probe forever. Returns only when an iteration escalates.
    pub async fn run<R: AttemptRunner, S: Sleeper>(
        &mut self,
        runner: &mut R,
        sleeper: &mut S,
    ) -> FatalEscalation {
        let mut policy = EscalationPolicy::default();
        loop {
            match self.run_iteration(runner, &mut policy).await {
                Iteration::Fatal(fatal) => {
                    tracing::error!(
                        addr = %fatal.addr,
                        user = %fatal.user,
                        iteration = fatal.iteration,
                        "{fatal}"
                    );
                    return fatal;
                }
                Iteration::Healthy | Iteration::Recovered => {
                    tracing::debug!(
                        iteration = self.iteration,
                        sleep_secs = self.interval.as_secs(),
                        "iteration resolved, sleeping"
                    );
                    sleeper.sleep(self.interval).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attempt::tests::{test_config, FakeTransport, Remote};
    use crate::attempt::Prober;
    use std::collections::VecDeque;

    /// Replays scripted outcomes; panics if the script runs out.
    struct ScriptedRunner {
        script: VecDeque<bool>,
        calls: u32,
    }

    impl ScriptedRunner {
        fn new(script: &[bool]) -> Self {
            Self {
                script: script.iter().copied().collect(),
                calls: 0,
            }
        }
    }

    impl AttemptRunner for ScriptedRunner {
        async fn run_attempt(&mut self) -> Result<(), AttemptError> {
            self.calls += 1;
            match self.script.pop_front() {
                Some(true) => Ok(()),
                Some(false) => Err(AttemptError::StreamError { healthy_signals: 0 }),
                None => panic!("runner called more times than scripted"),
            }
        }
    }

    /// Always succeeds.
    struct HealthyRunner {
        calls: u64,
    }

    impl AttemptRunner for HealthyRunner {
        async fn run_attempt(&mut self) -> Result<(), AttemptError> {
            self.calls += 1;
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingSleeper {
        sleeps: Vec<Duration>,
    }

    impl Sleeper for RecordingSleeper {
        async fn sleep(&mut self, duration: Duration) {
            self.sleeps.push(duration);
        }
    }

    fn supervisor() -> Supervisor {
        Supervisor::new(
            "db1.internal:22".to_string(),
            "sshealth".to_string(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn test_always_healthy_never_fatal() {
        let mut sup = supervisor();
        let mut runner = HealthyRunner { calls: 0 };
        let mut policy = EscalationPolicy::default();
        for _ in 0..1_000 {
            let outcome = sup.run_iteration(&mut runner, &mut policy).await;
            assert!(matches!(outcome, Iteration::Healthy));
        }
        assert_eq!(runner.calls, 1_000);
    }

    #[tokio::test]
    async fn test_two_failures_in_a_row_escalate() {
        let mut sup = supervisor();
        let mut runner = ScriptedRunner::new(&[false, false]);
        let mut sleeper = RecordingSleeper::default();

        let fatal = sup.run(&mut runner, &mut sleeper).await;

        assert_eq!(runner.calls, 2);
        assert!(sleeper.sleeps.is_empty());
        assert_eq!(fatal.failures.len(), 2);
        assert_eq!(fatal.failures[0].attempt, 1);
        assert_eq!(fatal.failures[1].attempt, 2);
        assert_eq!(fatal.iteration, 1);
    }

    #[tokio::test]
    async fn test_failures_separated_by_success_do_not_escalate() {
        let mut sup = supervisor();
        // fail, recover | ok | fail, recover | fail, fail -> fatal
        let mut runner = ScriptedRunner::new(&[false, true, true, false, true, false, false]);
        let mut sleeper = RecordingSleeper::default();

        let fatal = sup.run(&mut runner, &mut sleeper).await;

        assert_eq!(runner.calls, 7);
        assert_eq!(sleeper.sleeps, vec![Duration::from_secs(60); 3]);
        assert_eq!(fatal.iteration, 4);
        assert_eq!(fatal.failures.len(), 2);
    }

    #[tokio::test]
    async fn test_recovered_iteration_sleeps_normally() {
        let mut sup = supervisor();
        let mut runner = ScriptedRunner::new(&[false, true]);
        let mut policy = EscalationPolicy::default();
        let outcome = sup.run_iteration(&mut runner, &mut policy).await;
        assert!(matches!(outcome, Iteration::Recovered));
        assert_eq!(policy.current_attempt(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failing_twice_is_fatal_with_both_errors() {
        let transport = FakeTransport::new(Remote::RefuseConnect);
        let counters = std::sync::Arc::clone(&transport.counters);
        let mut prober = Prober::new(transport, test_config());
        let mut sup = supervisor();
        let mut sleeper = RecordingSleeper::default();

        let fatal = sup.run(&mut prober, &mut sleeper).await;

        assert_eq!(counters.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert!(sleeper.sleeps.is_empty());
        assert!(fatal
            .failures
            .iter()
            .all(|f| matches!(f.error, AttemptError::Connect(_))));
        let message = fatal.to_string();
        assert!(message.contains("sshealth@db1.internal:22"));
        assert!(message.contains("attempt 1"));
        assert!(message.contains("attempt 2"));
        assert!(message.contains("connection refused"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_activity_iteration_is_healthy() {
        let transport = FakeTransport::new(Remote::Heartbeat {
            every: Duration::from_secs(10),
        });
        let mut prober = Prober::new(transport, test_config());
        let mut sup = supervisor();
        let mut policy = EscalationPolicy::default();
        let outcome = sup.run_iteration(&mut prober, &mut policy).await;
        assert!(matches!(outcome, Iteration::Healthy));
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_failure_then_healthy_retry_recovers() {
        let transport = FakeTransport::new(Remote::Heartbeat {
            every: Duration::from_secs(10),
        })
        .refusing_first(1);
        let counters = std::sync::Arc::clone(&transport.counters);
        let mut prober = Prober::new(transport, test_config());
        let mut sup = supervisor();
        let mut policy = EscalationPolicy::default();

        let outcome = sup.run_iteration(&mut prober, &mut policy).await;

        assert!(matches!(outcome, Iteration::Recovered));
        assert_eq!(counters.connects.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(counters.closes.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_remote_counts_as_failure() {
        let transport = FakeTransport::new(Remote::Silent);
        let mut prober = Prober::new(transport, test_config());
        let mut sup = supervisor();
        let mut sleeper = RecordingSleeper::default();

        let fatal = sup.run(&mut prober, &mut sleeper).await;
        assert!(fatal
            .failures
            .iter()
            .all(|f| matches!(f.error, AttemptError::Timeout { .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_output_then_exit_sleeps_and_runs_next_iteration() {
        // Remote prints once and exits; the host disappears after three sessions.
        let transport = FakeTransport::new(Remote::BeatsThenExit {
            beats: 1,
            every: Duration::from_secs(1),
        })
        .refusing_after(3);
        let counters = std::sync::Arc::clone(&transport.counters);
        let config = crate::config::MonitorConfig {
            max_attempt: None,
            ..test_config()
        };
        let mut prober = Prober::new(transport, config);
        let mut sup = supervisor();
        let mut sleeper = RecordingSleeper::default();

        let fatal = sup.run(&mut prober, &mut sleeper).await;

        assert_eq!(sleeper.sleeps, vec![Duration::from_secs(60); 3]);
        assert_eq!(fatal.iteration, 4);
        assert_eq!(counters.connects.load(std::sync::atomic::Ordering::SeqCst), 5);
        assert_eq!(counters.closes.load(std::sync::atomic::Ordering::SeqCst), 3);
        assert!(fatal
            .failures
            .iter()
            .all(|f| matches!(f.error, AttemptError::Connect(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_without_output_is_fatal() {
        let transport = FakeTransport::new(Remote::BeatsThenExit {
            beats: 0,
            every: Duration::from_secs(1),
        });
        let mut prober = Prober::new(transport, test_config());
        let mut sup = supervisor();
        let mut sleeper = RecordingSleeper::default();

        let fatal = sup.run(&mut prober, &mut sleeper).await;

        assert!(sleeper.sleeps.is_empty());
        assert!(fatal
            .failures
            .iter()
            .all(|f| matches!(f.error, AttemptError::StreamError { healthy_signals: 0 })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_sleeper_waits_interval() {
        let start = Instant::now();
        TokioSleeper.sleep(Duration::from_secs(60)).await;
        assert!(start.elapsed() >= Duration::from_secs(60));
    }
}
