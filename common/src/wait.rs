use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Exponential backoff w/ "full jitter":
/// sleep for a random duration in [0, min(cap, base * 2^attempt)].
///
/// Used by the executor agent's result-post retry loop (capped at 10s)
/// and by long-poll callers that want to avoid lockstep retries against
/// the store.
pub async fn wait_with_backoff(cancel: &CancellationToken, attempt: usize, cap: Duration) {
    let base = Duration::from_millis(250);
    let delay = backoff_full_jitter(base, cap, attempt);

    tokio::select! {
        _ = cancel.cancelled() => {}
        _ = tokio::time::sleep(delay) => {}
    }
}

pub fn backoff_full_jitter(base: Duration, cap: Duration, attempt: usize) -> Duration {
    // Exponential term: base * 2^attempt, capped.
    // Use millis math to avoid Duration overflow footguns.
    let base_ms = base.as_millis() as u64;
    let cap_ms = cap.as_millis() as u64;

    // 2^attempt, saturating if attempt is huge.
    let pow = if attempt >= 63 {
        u64::MAX
    } else {
        1u64 << attempt
    };

    let exp_ms = base_ms.saturating_mul(pow);
    let upper = exp_ms.min(cap_ms).max(1); // avoid 0ms upper bound

    // Full jitter: uniform random in [0, upper]
    let jitter_ms = rand::random_range(0..=upper);
    Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_never_exceeds_cap() {
        let cap = Duration::from_secs(10);
        for attempt in 0..20 {
            let d = backoff_full_jitter(Duration::from_millis(250), cap, attempt);
            assert!(d <= cap, "attempt {attempt} produced {d:?} > cap {cap:?}");
        }
    }

    #[test]
    fn backoff_grows_with_attempt_before_capping() {
        let cap = Duration::from_secs(100);
        // Upper bounds should be non-decreasing as attempt increases (the
        // jitter sample itself may be smaller, so compare the deterministic
        // upper bound via the formula directly).
        let base = Duration::from_millis(250);
        let upper = |attempt: usize| {
            let pow = 1u64 << attempt;
            (base.as_millis() as u64 * pow).min(cap.as_millis() as u64)
        };
        assert!(upper(1) > upper(0));
        assert!(upper(2) > upper(1));
    }
}
