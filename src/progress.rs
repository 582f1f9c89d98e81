use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Where a sideload run currently is. Stages advance monotonically except for
/// the two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    Extracting,
    Signing,
    Packaging,
    PublishingManifest,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProgressUpdate {
    pub stage: Stage,
    pub percent: f64,
    pub message: String,
}

impl ProgressUpdate {
    fn idle() -> Self {
        Self {
            stage: Stage::Idle,
            percent: 0.0,
            message: String::new(),
        }
    }
}

/// Progress state for one signing run, shared through a watch channel so any
/// number of observers (CLI printer, timer) see the latest update without
/// polling shared globals.
#[derive(Clone)]
pub struct SigningSession {
    tx: watch::Sender<ProgressUpdate>,
}

impl SigningSession {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(ProgressUpdate::idle());
        Self { tx }
    }

    pub fn subscribe(&self) -> watch::Receiver<ProgressUpdate> {
        self.tx.subscribe()
    }

    pub fn update(&self, stage: Stage, percent: f64, message: impl Into<String>) {
        let update = ProgressUpdate {
            stage,
            percent: percent.clamp(0.0, 100.0),
            message: message.into(),
        };
        log::debug!("progress {:.0}% [{:?}] {}", update.percent, stage, update.message);
        // send_replace never fails even with no subscribers
        self.tx.send_replace(update);
    }

    pub fn fail(&self, message: impl Into<String>) {
        self.update(Stage::Failed, 0.0, message);
    }

    pub fn current(&self) -> ProgressUpdate {
        self.tx.borrow().clone()
    }
}

impl Default for SigningSession {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps per-item signer callbacks into the 15..=85 band of the overall run,
/// between the extraction and packaging milestones.
pub fn tweak_percent(signed: usize, total: usize) -> f64 {
    if total == 0 {
        return 15.0;
    }
    (signed as f64 / total as f64) * 70.0 + 15.0
}

/// Signing time scales roughly linearly with archive size on device-class
/// hardware; the constants come from measured runs.
pub fn estimate_signing_time(ipa_size_bytes: u64) -> Duration {
    let megabytes = ipa_size_bytes as f64 / (1024.0 * 1024.0);
    Duration::from_secs_f64(0.0126 * megabytes + 0.5)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerSample {
    pub elapsed: Duration,
    pub estimate: Duration,
    /// Current size of the tracked source archive, refreshed every tick.
    /// A rough heartbeat for live display, not a completion measure.
    pub tracked_bytes: u64,
}

/// Wall-clock timer for the signing stage. Samples elapsed time and the
/// tracked file's size once a second so the UI side can show progress
/// against the estimate.
pub struct SigningTimer {
    started: Instant,
    estimate: Duration,
    tx: watch::Sender<TimerSample>,
    cancel: CancellationToken,
}

impl SigningTimer {
    pub fn start<P: AsRef<std::path::Path>>(tracked: P) -> Self {
        let tracked = tracked.as_ref().to_path_buf();
        let initial_size = file_size(&tracked);
        let estimate = estimate_signing_time(initial_size);
        let started = Instant::now();
        let (tx, _) = watch::channel(TimerSample {
            elapsed: Duration::ZERO,
            estimate,
            tracked_bytes: initial_size,
        });
        let cancel = CancellationToken::new();

        let tick_tx = tx.clone();
        let tick_cancel = cancel.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await; // first tick completes immediately
            loop {
                tokio::select! {
                    _ = tick_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let size = file_size(&tracked);
                        tick_tx.send_modify(|sample| {
                            sample.elapsed = started.elapsed();
                            sample.tracked_bytes = size;
                        });
                    }
                }
            }
        });

        Self {
            started,
            estimate,
            tx,
            cancel,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<TimerSample> {
        self.tx.subscribe()
    }

    pub fn estimate(&self) -> Duration {
        self.estimate
    }

    /// Stops sampling and returns the total elapsed time.
    pub fn stop(&self) -> Duration {
        self.cancel.cancel();
        self.started.elapsed()
    }
}

impl Drop for SigningTimer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn file_size(path: &std::path::Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_reach_subscribers_and_clamp() {
        let session = SigningSession::new();
        let rx = session.subscribe();

        session.update(Stage::Extracting, 30.0, "extracting app");
        assert_eq!(rx.borrow().stage, Stage::Extracting);
        assert_eq!(rx.borrow().percent, 30.0);

        session.update(Stage::Signing, 250.0, "");
        assert_eq!(rx.borrow().percent, 100.0);

        session.fail("signing failed");
        assert_eq!(session.current().stage, Stage::Failed);
        assert_eq!(session.current().message, "signing failed");
    }

    #[test]
    fn per_item_progress_spans_the_signing_band() {
        assert_eq!(tweak_percent(0, 4), 15.0);
        assert_eq!(tweak_percent(2, 4), 50.0);
        assert_eq!(tweak_percent(4, 4), 85.0);
        // an empty bundle never divides by zero
        assert_eq!(tweak_percent(0, 0), 15.0);
    }

    #[test]
    fn time_estimate_scales_with_archive_size() {
        let empty = estimate_signing_time(0);
        assert!((empty.as_secs_f64() - 0.5).abs() < 1e-9);

        let hundred_mb = estimate_signing_time(100 * 1024 * 1024);
        assert!((hundred_mb.as_secs_f64() - 1.76).abs() < 1e-9);
        assert!(hundred_mb > empty);
    }

    #[tokio::test(start_paused = true)]
    async fn timer_resamples_elapsed_and_file_size_until_stopped() {
        let dir = tempfile::TempDir::new().unwrap();
        let ipa = dir.path().join("in.ipa");
        std::fs::write(&ipa, vec![0u8; 1024]).unwrap();

        let timer = SigningTimer::start(&ipa);
        // Let the sampler task register its interval at t=0 before the
        // paused clock is advanced.
        tokio::task::yield_now().await;
        let rx = timer.subscribe();
        assert_eq!(rx.borrow().elapsed, Duration::ZERO);
        assert_eq!(rx.borrow().tracked_bytes, 1024);

        // size changes on disk show up at the next tick
        std::fs::write(&ipa, vec![0u8; 4096]).unwrap();
        tokio::time::advance(Duration::from_millis(2500)).await;
        tokio::task::yield_now().await;
        assert!(rx.borrow().elapsed >= Duration::from_secs(2));
        assert_eq!(rx.borrow().tracked_bytes, 4096);

        timer.stop();
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        let frozen = *rx.borrow();
        tokio::time::advance(Duration::from_secs(5)).await;
        tokio::task::yield_now().await;
        assert_eq!(*rx.borrow(), frozen);
    }
}
