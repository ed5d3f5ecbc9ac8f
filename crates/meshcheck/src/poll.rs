//! Bounded polling: exponential backoff, an explicit deadline and a
//! cancellation token on every wait.
//!
//! Each probe is raced against the time left, so a probe that hangs (a frozen
//! node, a stuck connection) cannot stretch a wait past its deadline.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::HarnessError;

/// Backoff parameters (config section `[poll]`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_initial_ms")]
    pub initial_ms: u64,
    #[serde(default = "default_max_ms")]
    pub max_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of random extra delay added to each sleep (0.0 - 1.0).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
}

fn default_initial_ms() -> u64 {
    10
}
fn default_max_ms() -> u64 {
    500
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            initial_ms: default_initial_ms(),
            max_ms: default_max_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl PollSettings {
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_ms == 0 {
            return Err("poll.initial_ms must be > 0".into());
        }
        if self.max_ms < self.initial_ms {
            return Err("poll.max_ms must be >= poll.initial_ms".into());
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err("poll.multiplier must be >= 1.0".into());
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return Err("poll.jitter must be within 0.0..=1.0".into());
        }
        Ok(())
    }
}

/// Exponential delay sequence: initial, initial*m, ... capped at max.
pub struct Backoff {
    current: Duration,
    max: Duration,
    multiplier: f64,
    jitter: f64,
}

impl Backoff {
    pub fn new(settings: &PollSettings) -> Self {
        Self {
            current: Duration::from_millis(settings.initial_ms),
            max: Duration::from_millis(settings.max_ms),
            multiplier: settings.multiplier,
            jitter: settings.jitter,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = base.mul_f64(self.multiplier).min(self.max);
        if self.jitter > 0.0 {
            let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
            base.mul_f64(1.0 + extra)
        } else {
            base
        }
    }
}

/// Why a wait ended without its condition holding.
#[derive(Debug)]
pub enum WaitError {
    Timeout {
        waited: Duration,
        /// Last probe error, if the probe was failing rather than unsatisfied.
        last_error: Option<String>,
    },
    Cancelled,
}

/// Poll `probe` until it yields `Some`, the deadline passes, or `cancel`
/// fires. Probe errors are treated as "not yet" and remembered for the
/// timeout report.
pub async fn wait_for<T, F, Fut>(
    settings: &PollSettings,
    timeout: Duration,
    cancel: &CancellationToken,
    mut probe: F,
) -> Result<T, WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, HarnessError>>,
{
    let start = Instant::now();
    let deadline = start + timeout;
    let mut backoff = Backoff::new(settings);
    let mut last_error = None;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            outcome = tokio::time::timeout(remaining, probe()) => match outcome {
                Ok(Ok(Some(value))) => return Ok(value),
                Ok(Ok(None)) => {}
                Ok(Err(e)) => last_error = Some(e.to_string()),
                Err(_) => {
                    return Err(WaitError::Timeout {
                        waited: start.elapsed(),
                        last_error: last_error.or_else(|| Some("probe did not answer in time".into())),
                    })
                }
            },
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(WaitError::Timeout {
                waited: start.elapsed(),
                last_error,
            });
        }
        let delay = backoff.next_delay().min(deadline - now);
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(WaitError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn no_jitter() -> PollSettings {
        PollSettings {
            initial_ms: 10,
            max_ms: 80,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let mut b = Backoff::new(&no_jitter());
        let delays: Vec<u64> = (0..6).map(|_| b.next_delay().as_millis() as u64).collect();
        assert_eq!(delays, vec![10, 20, 40, 80, 80, 80]);
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let settings = PollSettings {
            jitter: 0.5,
            ..no_jitter()
        };
        let mut b = Backoff::new(&settings);
        let d = b.next_delay();
        assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(15));
    }

    #[test]
    fn test_validate() {
        assert!(PollSettings::default().validate().is_ok());
        assert!(PollSettings { initial_ms: 0, ..no_jitter() }.validate().is_err());
        assert!(PollSettings { max_ms: 5, ..no_jitter() }.validate().is_err());
        assert!(PollSettings { multiplier: 0.5, ..no_jitter() }.validate().is_err());
        assert!(PollSettings { jitter: 2.0, ..no_jitter() }.validate().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_retries() {
        let calls = Cell::new(0);
        let cancel = CancellationToken::new();
        let value = wait_for(&no_jitter(), Duration::from_secs(5), &cancel, || {
            calls.set(calls.get() + 1);
            let n = calls.get();
            async move { Ok((n >= 3).then_some(n)) }
        })
        .await
        .unwrap();
        assert_eq!(value, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_times_out_within_deadline() {
        let cancel = CancellationToken::new();
        let timeout = Duration::from_millis(300);
        let start = Instant::now();
        let res: Result<(), _> = wait_for(&no_jitter(), timeout, &cancel, || async {
            Err(HarnessError::command("replica-2", "info.lsn", "connection refused"))
        })
        .await;
        let elapsed = start.elapsed();

        match res {
            Err(WaitError::Timeout { last_error, .. }) => {
                assert!(last_error.unwrap().contains("connection refused"));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert!(elapsed >= timeout);
        assert!(elapsed <= timeout + Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hanging_probe_cannot_outlive_deadline() {
        let cancel = CancellationToken::new();
        let timeout = Duration::from_secs(2);
        let start = Instant::now();
        let res: Result<(), _> = wait_for(&no_jitter(), timeout, &cancel, || {
            std::future::pending::<Result<Option<()>, HarnessError>>()
        })
        .await;
        assert!(matches!(res, Err(WaitError::Timeout { .. })));
        assert!(start.elapsed() <= timeout + Duration::from_millis(20));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_interrupts_wait() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });
        let res: Result<(), _> = wait_for(&no_jitter(), Duration::from_secs(60), &cancel, || async {
            Ok(None)
        })
        .await;
        assert!(matches!(res, Err(WaitError::Cancelled)));
    }
}
