//! Health probes for daemon services.
//!
//! A probe answers one question: is the service healthy right now. The
//! lifecycle polls each probe with exponential backoff until it passes
//! once, or abandons the poll when the service leaves the starting
//! state.

mod command;
mod http;

pub use command::CommandProbe;
pub use http::HttpProbe;

use async_trait::async_trait;
use std::time::Duration;

/// Base poll interval.
const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Backoff never sleeps longer than this between attempts.
const MAX_POLL_DELAY: Duration = Duration::from_millis(500);

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// One attempt; true means healthy.
    async fn check(&self) -> bool;

    /// Human-readable description for log lines.
    fn describe(&self) -> String;
}

/// Sleep for `min(500ms, 10ms * 1.1^attempt)`.
pub async fn backoff(attempt: u32) {
    let delay = POLL_INTERVAL.as_secs_f64() * 1.1f64.powi(attempt as i32);
    let delay = Duration::from_secs_f64(delay.min(MAX_POLL_DELAY.as_secs_f64()));
    tokio::time::sleep(delay).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_delay_is_capped() {
        // The computed delay saturates at 500ms no matter the attempt.
        let delay = POLL_INTERVAL.as_secs_f64() * 1.1f64.powi(200);
        assert!(delay.min(MAX_POLL_DELAY.as_secs_f64()) <= 0.5);
    }

    #[tokio::test]
    async fn early_attempts_sleep_close_to_base_interval() {
        let start = std::time::Instant::now();
        backoff(0).await;
        // Generous upper bound; the point is that attempt zero is on the
        // order of the base interval, not the cap.
        assert!(start.elapsed() < Duration::from_millis(250));
    }
}
