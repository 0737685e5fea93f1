use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::time::Instant;

/// Roughly 30 years; stands in for "never" when a duration overflows the clock.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `now + duration`, saturating at a far-future instant instead of panicking.
pub fn instant_after(now: Instant, duration: Duration) -> Instant {
    now.checked_add(duration)
        .unwrap_or_else(|| now + FAR_FUTURE)
}

// ---------------------------------------------------------------------------
// Jitter based on std. Uses xorshift64 seeded from the wall clock and a
// call counter so back-to-back calls within one clock tick still differ.
// Good enough for pacing noise, not for anything security related.
// ---------------------------------------------------------------------------

static CALLS: AtomicU64 = AtomicU64::new(0x9E37_79B9_7F4A_7C15);

/// Uniform-ish random number in `[0, max)`. Returns 0 when `max` is 0.
pub fn rand_below(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let counter = CALLS.fetch_add(0x9E37_79B9_7F4A_7C15, Ordering::Relaxed);
    let mut x = nanos ^ counter;
    if x == 0 {
        x = 0x2545_F491_4F6C_DD1D;
    }
    x ^= x << 13;
    x ^= x >> 7;
    x ^= x << 17;
    x % max
}

/// Random jitter in `[0, max)`.
pub fn jitter(max: Duration) -> Duration {
    Duration::from_millis(rand_below(max.as_millis() as u64))
}

/// Random duration in `[min, max]`. Collapses to `min` if the range is empty.
pub fn between(min: Duration, max: Duration) -> Duration {
    if max <= min {
        return min;
    }
    let span = (max - min).as_millis() as u64;
    min + Duration::from_millis(rand_below(span + 1))
}

/// Picks a random element from a slice.
pub fn pick<T>(items: &[T]) -> Option<&T> {
    if items.is_empty() {
        return None;
    }
    items.get(rand_below(items.len() as u64) as usize)
}
