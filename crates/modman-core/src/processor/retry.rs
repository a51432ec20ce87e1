//! Retry with exponential backoff for transient store failures.

use std::time::Duration;

use tracing::warn;

use crate::store::StoreError;

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    attempts: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, base_delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            base_delay,
        }
    }

    /// No retries at all.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Run `f` until it succeeds, fails permanently, or attempts run out.
    /// Blocks the calling thread between attempts.
    pub fn run<T>(
        &self,
        what: &str,
        mut f: impl FnMut() -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut attempt = 1;
        loop {
            match f() {
                Err(err) if err.is_transient() && attempt < self.attempts => {
                    let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                    warn!(what, attempt, error = %err, delay_ms = delay.as_millis() as u64, "Transient store failure, retrying");
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100))
    }
}
