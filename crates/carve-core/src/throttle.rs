//! Per-source request spacing.
//!
//! Every fetch for a source (first page, pagination step, retry) first
//! reserves a start slot here. Reservation is atomic, so two workers can
//! never both pass within one `rate_limit_delay` window: the second one
//! gets the slot `last + delay` and sleeps until then.
//!
//! The slot book lives in process memory and is shared by the pools of one
//! `Dispatcher`. Run a single `carve worker` process per database to keep
//! the per-source spacing; separate processes do not see each other's
//! slots.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use carve_core::throttle::SourceRateLimiter;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), carve_core::AppError> {
//! let limiter = SourceRateLimiter::new().with_jitter(Duration::from_millis(250));
//! let cancel = CancellationToken::new();
//! limiter.acquire("shop", Duration::from_secs(2), &cancel).await?;
//! // fetch...
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::util::rand_jitter_ms;

/// Shared, cloneable slot book keyed by `source_id`.
#[derive(Clone, Default)]
pub struct SourceRateLimiter {
    /// Start time of the latest reserved fetch per source.
    slots: Arc<Mutex<HashMap<String, Instant>>>,
    /// Maximum random extra spacing (uniform `[0, jitter)`).
    jitter: Duration,
}

impl SourceRateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait for this source's next fetch slot.
    ///
    /// Returns `Err(Cancelled)` if `cancel` fires while waiting. A zero
    /// `delay` never waits.
    pub async fn acquire(
        &self,
        source_id: &str,
        delay: Duration,
        cancel: &CancellationToken,
    ) -> Result<(), AppError> {
        if delay.is_zero() {
            return Ok(());
        }
        let slot = self.reserve(source_id, delay);
        let now = Instant::now();
        if slot <= now {
            return Ok(());
        }

        tracing::debug!(
            source_id = %source_id,
            wait_ms = %(slot - now).as_millis(),
            "Rate limiting fetch"
        );
        tokio::select! {
            () = tokio::time::sleep_until(slot) => Ok(()),
            () = cancel.cancelled() => Err(AppError::Cancelled),
        }
    }

    fn reserve(&self, source_id: &str, delay: Duration) -> Instant {
        let spacing = if self.jitter.is_zero() {
            delay
        } else {
            delay + Duration::from_millis(rand_jitter_ms(self.jitter.as_millis() as u64))
        };
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        let now = Instant::now();
        let slot = match slots.get(source_id) {
            Some(&last) => std::cmp::max(now, last + spacing),
            None => now,
        };
        slots.insert(source_id.to_string(), slot);
        slot
    }
}
