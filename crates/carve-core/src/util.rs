use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Derive a schema id from a file path.
///
/// Extracts the file stem (name without extension).
/// Example: `"schemas/shop_listing.json"` → `"shop_listing"`
pub fn derive_schema_id(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("default")
        .to_string()
}

/// Sleep for `duration` unless `cancel` fires first.
pub async fn sleep_cancellable(
    duration: Duration,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    if cancel.is_cancelled() {
        return Err(AppError::Cancelled);
    }
    if duration.is_zero() {
        return Ok(());
    }
    tokio::select! {
        () = tokio::time::sleep(duration) => Ok(()),
        () = cancel.cancelled() => Err(AppError::Cancelled),
    }
}

// Jitter from a time-seeded xorshift, good enough for spreading retries.
pub(crate) fn rand_jitter_ms(max_ms: u64) -> u64 {
    if max_ms == 0 {
        return 0;
    }
    let mut x = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max_ms
}
