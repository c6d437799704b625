//! Retry schedule and the sleep seam it runs on.

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use crate::config::PollingConfig;

/// Exponential backoff: `min(base * 2^attempt, max_delay)`, then ± `jitter`
/// as a fraction of that delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub max_delay: Duration,
    /// 0.0 disables jitter. Clamped to 0.0..=1.0.
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn from_config(polling: &PollingConfig) -> Self {
        Self {
            max_attempts: polling.retry_attempts.max(1),
            base: Duration::from_millis(polling.backoff_base_ms),
            max_delay: Duration::from_millis(polling.backoff_max_ms),
            jitter: 0.1,
        }
    }

    /// Delay before retry number `attempt` (0-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.base
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base_delay(attempt);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 || delay.is_zero() {
            return delay;
        }
        let factor = rand::thread_rng().gen_range(1.0 - jitter..=1.0 + jitter);
        delay.mul_f64(factor)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_config(&PollingConfig::default())
    }
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Records requested delays and returns immediately.
#[derive(Default)]
pub struct VirtualSleeper {
    slept: Mutex<Vec<Duration>>,
}

impl VirtualSleeper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn delays(&self) -> Vec<Duration> {
        self.slept.lock().map(|s| s.clone()).unwrap_or_default()
    }

    pub fn total(&self) -> Duration {
        self.delays().iter().sum()
    }
}

#[async_trait]
impl Sleeper for VirtualSleeper {
    async fn sleep(&self, duration: Duration) {
        if let Ok(mut slept) = self.slept.lock() {
            slept.push(duration);
        }
    }
}
