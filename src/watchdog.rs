//! Output-activity monitor for a remote command.
//!
//! A background reader turns every read on the remote output into a
//! [`LivenessSignal`]. The [`Watchdog`] races those signals against an idle
//! timer that is re-armed on each healthy signal.
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Bytes requested per read. Content is discarded; only the fact of data matters.
pub const READ_BUFFER_SIZE: usize = 10;

/// Capacity of the reader → watchdog hand-off.
pub const SIGNAL_CHANNEL_CAPACITY: usize = 16;

/// One read outcome from the remote output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessSignal {
    /// `true` when bytes arrived, `false` when the stream ended or errored.
    pub healthy: bool,
}

/// Why the watch loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchExit {
    /// No healthy signal within the idle timeout.
    IdleTimeout,
    /// The reader reported end-of-stream or a read error.
    StreamEnded,
    /// The optional attempt budget ran out while the stream was still live.
    BudgetElapsed,
}

/// Summary of one watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchReport {
    pub exit: WatchExit,
    pub healthy_signals: u64,
    /// Time from loop start to loop exit.
    pub elapsed: Duration,
}

impl WatchReport {
    pub fn observed_any_healthy(&self) -> bool {
        self.healthy_signals > 0
    }
}

/// Spawn the reader task for `stream`.
///
/// Emits one signal per read: healthy for `n > 0`, unhealthy exactly once on
/// EOF or error, after which the task ends. It also ends quietly if the
/// watchdog has dropped its receiver.
pub fn spawn_reader<R>(mut stream: R, signals: mpsc::Sender<LivenessSignal>) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            let healthy = match stream.read(&mut buf).await {
                Ok(0) => {
                    tracing::debug!("remote output closed");
                    false
                }
                Ok(n) => {
                    tracing::trace!(bytes = n, "remote output");
                    true
                }
                Err(e) => {
                    tracing::debug!(error = %e, "remote output read failed");
                    false
                }
            };
            if signals.send(LivenessSignal { healthy }).await.is_err() || !healthy {
                return;
            }
        }
    })
}

/// Idle-timeout watch loop.
#[derive(Debug, Clone, Copy)]
pub struct Watchdog {
    idle_timeout: Duration,
    budget: Option<Duration>,
}

impl Watchdog {
    pub fn new(idle_timeout: Duration, budget: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            budget,
        }
    }

    /// Consume signals until the idle timer fires, the stream ends, or the
    /// budget elapses.
    ///
    /// When a signal and the timer are ready together, the signal is taken
    /// first. A healthy signal re-arms the timer before the next wait.
    pub async fn watch(&self, signals: &mut mpsc::Receiver<LivenessSignal>) -> WatchReport {
        let started = Instant::now();
        let idle = tokio::time::sleep(self.idle_timeout);
        tokio::pin!(idle);
        let budget = wait_until(self.budget.map(|b| started + b));
        tokio::pin!(budget);

        let mut healthy_signals: u64 = 0;
        let exit = loop {
            tokio::select! {
                biased;
                signal = signals.recv() => match signal {
                    Some(LivenessSignal { healthy: true }) => {
                        healthy_signals += 1;
                        idle.as_mut().reset(Instant::now() + self.idle_timeout);
                    }
                    Some(LivenessSignal { healthy: false }) | None => break WatchExit::StreamEnded,
                },
                () = &mut idle => break WatchExit::IdleTimeout,
                () = &mut budget => break WatchExit::BudgetElapsed,
            }
        };

        let report = WatchReport {
            exit,
            healthy_signals,
            elapsed: started.elapsed(),
        };
        tracing::debug!(
            exit = ?report.exit,
            healthy_signals,
            elapsed_secs = report.elapsed.as_secs(),
            "watch loop finished"
        );
        report
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    const IDLE: Duration = Duration::from_secs(60);

    fn channel() -> (mpsc::Sender<LivenessSignal>, mpsc::Receiver<LivenessSignal>) {
        mpsc::channel(SIGNAL_CHANNEL_CAPACITY)
    }

    #[tokio::test(start_paused = true)]
    async fn test_silence_times_out() {
        let (_tx, mut rx) = channel();
        let report = Watchdog::new(IDLE, None).watch(&mut rx).await;
        assert_eq!(report.exit, WatchExit::IdleTimeout);
        assert_eq!(report.healthy_signals, 0);
        assert!(report.elapsed >= IDLE);
        assert!(report.elapsed < IDLE + Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_then_unhealthy_is_stream_end() {
        let (tx, mut rx) = channel();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(5)).await;
            tx.send(LivenessSignal { healthy: true }).await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
            tx.send(LivenessSignal { healthy: false }).await.unwrap();
        });
        let report = Watchdog::new(IDLE, None).watch(&mut rx).await;
        assert_eq!(report.exit, WatchExit::StreamEnded);
        assert_eq!(report.healthy_signals, 1);
        assert!(report.observed_any_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_is_stream_end() {
        let (tx, mut rx) = channel();
        drop(tx);
        let report = Watchdog::new(IDLE, None).watch(&mut rx).await;
        assert_eq!(report.exit, WatchExit::StreamEnded);
        assert!(!report.observed_any_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sustained_activity_never_times_out() {
        let (tx, mut rx) = channel();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(Duration::from_secs(59)).await;
                if tx.send(LivenessSignal { healthy: true }).await.is_err() {
                    return;
                }
            }
        });
        // Only the budget can end the loop while signals keep coming.
        let budget = Duration::from_secs(60 * 60);
        let report = Watchdog::new(IDLE, Some(budget)).watch(&mut rx).await;
        assert_eq!(report.exit, WatchExit::BudgetElapsed);
        assert!(report.elapsed >= budget);
        assert_eq!(report.healthy_signals, 61);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_activity_stops() {
        let (tx, mut rx) = channel();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(10)).await;
                tx.send(LivenessSignal { healthy: true }).await.unwrap();
            }
            // Keep the sender alive but silent.
            tokio::time::sleep(Duration::from_secs(3600)).await;
            drop(tx);
        });
        let report = Watchdog::new(IDLE, None).watch(&mut rx).await;
        assert_eq!(report.exit, WatchExit::IdleTimeout);
        assert_eq!(report.healthy_signals, 3);
        // Last signal at 30s, so the window closes at 90s.
        assert!(report.elapsed >= Duration::from_secs(90));
        assert!(report.elapsed < Duration::from_secs(91));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_emits_one_signal_per_read_then_eof() {
        let (mut remote, local) = tokio::io::duplex(64);
        let (tx, mut rx) = channel();
        let reader = spawn_reader(local, tx);

        remote.write_all(b".").await.unwrap();
        assert_eq!(rx.recv().await, Some(LivenessSignal { healthy: true }));
        remote.write_all(b"heartbeat").await.unwrap();
        assert_eq!(rx.recv().await, Some(LivenessSignal { healthy: true }));
        drop(remote);
        assert_eq!(rx.recv().await, Some(LivenessSignal { healthy: false }));
        assert_eq!(rx.recv().await, None);
        reader.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_splits_large_writes_into_small_reads() {
        let (mut remote, local) = tokio::io::duplex(64);
        let (tx, mut rx) = channel();
        let _reader = spawn_reader(local, tx);

        remote.write_all(&[b'x'; 25]).await.unwrap();
        drop(remote);

        let mut healthy = 0;
        while let Some(signal) = rx.recv().await {
            if signal.healthy {
                healthy += 1;
            }
        }
        assert_eq!(healthy, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reader_stops_when_watchdog_gone() {
        let (mut remote, local) = tokio::io::duplex(64);
        let (tx, rx) = channel();
        let reader = spawn_reader(local, tx);
        drop(rx);
        remote.write_all(b"ping").await.unwrap();
        reader.await.unwrap();
    }
}
