use backoff::{retry, ExponentialBackoff};
use slog::{debug, warn, Logger};
use std::{fmt::Debug, time::Duration};

/// Backoff schedule for a retried network action.
///
/// The defaults are sized for the bulk uploader, its only consumer today:
/// the first retry comes quickly because most upload failures are
/// transient connection resets, the pause doubles up to ten seconds, and
/// the whole attempt is abandoned after a minute because the next flush
/// interval will carry fresh data anyway.
#[derive(Clone, Copy, Debug)]
pub(crate) struct RetryPolicy {
    /// Pause before the first retry.
    pub first_retry_after: Duration,
    /// Longest pause between consecutive retries.
    pub longest_pause: Duration,
    /// Total time budget; once exceeded, the last error is returned.
    pub give_up_after: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            first_retry_after: Duration::from_millis(500),
            longest_pause: Duration::from_secs(10),
            give_up_after: Duration::from_secs(60),
        }
    }
}

/// Runs `attempt` until it succeeds, `is_transient` declares an error
/// permanent, or the policy's time budget runs out. Each transient failure
/// is reported through the diagnostic logger under the action's name; the
/// final error is handed back to the caller unchanged, so transport-level
/// delegates see the real failure and not a retry wrapper.
pub(crate) fn with_retries<T, E, F, P>(
    logger: &Logger,
    policy: RetryPolicy,
    action: &'static str,
    mut attempt: F,
    mut is_transient: P,
) -> Result<T, E>
where
    F: FnMut() -> Result<T, E>,
    P: FnMut(&E) -> bool,
    E: Debug,
{
    let schedule = ExponentialBackoff {
        initial_interval: policy.first_retry_after,
        max_interval: policy.longest_pause,
        multiplier: 2.0,
        max_elapsed_time: Some(policy.give_up_after),
        ..Default::default()
    };

    retry(schedule, || {
        attempt().map_err(|error| {
            if is_transient(&error) {
                warn!(
                    logger, "retrying failed action";
                    "action" => action,
                    "error" => format!("{:?}", error),
                );
                backoff::Error::transient(error)
            } else {
                debug!(logger, "action failed permanently"; "action" => action);
                backoff::Error::permanent(error)
            }
        })
    })
    .map_err(|error| match error {
        backoff::Error::Permanent(inner) => inner,
        backoff::Error::Transient { err, .. } => err,
    })
}
