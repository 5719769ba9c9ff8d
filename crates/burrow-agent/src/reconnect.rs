//! Reconnection logic with exponential backoff

use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnection configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Initial backoff duration
    pub initial_backoff: Duration,
    /// Maximum backoff duration
    pub max_backoff: Duration,
    /// Backoff multiplier
    pub multiplier: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<usize>,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Reconnection errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconnectError {
    #[error("Max reconnection attempts reached ({0})")]
    MaxAttemptsReached(usize),

    #[error("Reconnection cancelled")]
    Cancelled,
}

/// Reconnection manager with exponential backoff
///
/// Owned by the supervisor loop; nothing else reads or mutates the backoff
/// state.
#[derive(Debug)]
pub struct ReconnectManager {
    config: ReconnectConfig,
    current_backoff: Duration,
    attempt: usize,
}

impl ReconnectManager {
    pub fn new(config: ReconnectConfig) -> Self {
        Self {
            current_backoff: config.initial_backoff,
            config,
            attempt: 0,
        }
    }

    /// Record a failure and return how long to wait before the next attempt
    pub fn next_delay(&mut self) -> Result<Duration, ReconnectError> {
        self.attempt += 1;

        if let Some(max_attempts) = self.config.max_attempts {
            if self.attempt > max_attempts {
                return Err(ReconnectError::MaxAttemptsReached(max_attempts));
            }
        }

        let delay = self.current_backoff;

        // Increase backoff; anything past Duration's range saturates at the cap
        let max_backoff = self.config.max_backoff;
        self.current_backoff =
            Duration::try_from_secs_f64(self.current_backoff.as_secs_f64() * self.config.multiplier)
                .map_or(max_backoff, |next| next.min(max_backoff));

        Ok(delay)
    }

    /// Wait before next reconnection attempt
    ///
    /// Returns early with `Cancelled` when `cancel` fires during the sleep.
    pub async fn wait(&mut self, cancel: &CancellationToken) -> Result<Duration, ReconnectError> {
        let delay = self.next_delay()?;

        debug!(
            "Waiting {:?} before reconnection attempt {}",
            delay,
            self.attempt + 1
        );

        tokio::select! {
            _ = sleep(delay) => Ok(delay),
            _ = cancel.cancelled() => Err(ReconnectError::Cancelled),
        }
    }

    /// Reset backoff (call after successful handshake)
    pub fn reset(&mut self) {
        debug!("Resetting reconnection backoff");
        self.current_backoff = self.config.initial_backoff;
        self.attempt = 0;
    }

    /// Get current attempt number
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    /// Get the delay the next failure will wait
    pub fn current_backoff(&self) -> Duration {
        self.current_backoff
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_backoff_schedule() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());

        let delays: Vec<u64> = (0..8)
            .map(|_| manager.next_delay().unwrap().as_secs())
            .collect();

        assert_eq!(delays, vec![5, 10, 20, 40, 60, 60, 60, 60]);
    }

    #[test]
    fn test_reconnect_reset() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());

        manager.next_delay().unwrap();
        manager.next_delay().unwrap();
        manager.next_delay().unwrap();
        assert_eq!(manager.attempt(), 3);
        assert_eq!(manager.current_backoff(), Duration::from_secs(40));

        manager.reset();

        assert_eq!(manager.attempt(), 0);
        assert_eq!(manager.next_delay().unwrap(), Duration::from_secs(5));
    }

    #[test]
    fn test_max_attempts() {
        let config = ReconnectConfig {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(10),
            multiplier: 2.0,
            max_attempts: Some(3),
        };

        let mut manager = ReconnectManager::new(config);

        assert!(manager.next_delay().is_ok());
        assert!(manager.next_delay().is_ok());
        assert!(manager.next_delay().is_ok());

        assert_eq!(
            manager.next_delay(),
            Err(ReconnectError::MaxAttemptsReached(3))
        );
    }

    #[test]
    fn test_huge_multiplier_saturates_at_max_backoff() {
        let config = ReconnectConfig {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::MAX,
            multiplier: f64::INFINITY,
            max_attempts: None,
        };

        let mut manager = ReconnectManager::new(config);

        assert_eq!(manager.next_delay().unwrap(), Duration::from_secs(5));
        assert_eq!(manager.next_delay().unwrap(), Duration::MAX);
        assert_eq!(manager.next_delay().unwrap(), Duration::MAX);
    }

    #[test]
    fn test_overflowing_backoff_saturates() {
        let config = ReconnectConfig {
            initial_backoff: Duration::from_secs(u64::MAX / 2),
            max_backoff: Duration::from_secs(u64::MAX / 2),
            multiplier: 1e12,
            max_attempts: None,
        };

        let mut manager = ReconnectManager::new(config);
        manager.next_delay().unwrap();

        assert_eq!(manager.current_backoff(), Duration::from_secs(u64::MAX / 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_sleeps_for_backoff() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        let cancel = CancellationToken::new();

        let start = tokio::time::Instant::now();
        assert_eq!(manager.wait(&cancel).await, Ok(Duration::from_secs(5)));
        assert_eq!(manager.wait(&cancel).await, Ok(Duration::from_secs(10)));
        assert_eq!(start.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_unblocks_wait() {
        let mut manager = ReconnectManager::new(ReconnectConfig::default());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let start = tokio::time::Instant::now();
        assert_eq!(manager.wait(&cancel).await, Err(ReconnectError::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(5));
    }
}
