/// Utility functions for formatting and retrying fallible operations
use log::error;
use std::future::Future;
use time::{format_description, OffsetDateTime};
use tokio::time::{sleep, Duration};

use crate::error::{Error, Result};

/// Format a timestamp for human-readable logging
///
/// Converts an OffsetDateTime to DD.MM.YYYY - HH:MM:SS format
/// Falls back to default string representation if formatting fails.
pub fn format_datetime(dt: &OffsetDateTime) -> String {
    match format_description::parse("[day].[month].[year] - [hour]:[minute]:[second]") {
        Ok(format) => dt.format(&format).unwrap_or_else(|_| dt.to_string()),
        Err(_) => dt.to_string(),
    }
}

/// Run `operation` up to `attempts` times, sleeping `delay` between tries
///
/// Every failure is logged with its attempt number. When all attempts fail,
/// the result is [`Error::RetriesExhausted`] naming `what` was attempted.
pub async fn execute_with_retry<T, F, Fut>(
    what: &str,
    attempts: usize,
    delay: Duration,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);

    for attempt in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => error!("Attempt {}: {} failed: {}", attempt + 1, what, e),
        }

        if attempt < attempts - 1 {
            sleep(delay).await;
        }
    }

    Err(Error::RetriesExhausted(what.to_string()))
}
