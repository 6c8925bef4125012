use std::sync::OnceLock;
use std::time::Instant;

/// Monotonic milliseconds since an arbitrary process-local origin.
///
/// Timer deadlines, fiber deadlines and throttling decisions all compare
/// points on this clock; it never jumps with wall-clock adjustments.
pub fn monotonic_ms() -> i64 {
    static ORIGIN: OnceLock<Instant> = OnceLock::new();
    let origin = *ORIGIN.get_or_init(Instant::now);
    Instant::now().duration_since(origin).as_millis() as i64
}
