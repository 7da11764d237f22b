//! Exponential confidence decay
//!
//! `confidence(t) = stored * exp(-λ * elapsed)`. Evaluated lazily at merge
//! and sweep time; nothing runs per device in the background.

use rolewatch_common::Timestamp;

/// Decay `confidence` over `elapsed_secs`
#[inline]
pub fn decay(confidence: f32, lambda: f64, elapsed_secs: f64) -> f32 {
    if elapsed_secs <= 0.0 || lambda <= 0.0 {
        return confidence;
    }
    (confidence as f64 * (-lambda * elapsed_secs).exp()) as f32
}

/// Decay a confidence stored at `stored_at`, evaluated at `now`
///
/// A `now` earlier than `stored_at` counts as zero elapsed time.
#[inline]
pub fn decayed_at(confidence: f32, stored_at: Timestamp, now: Timestamp, lambda: f64) -> f32 {
    decay(confidence, lambda, now.secs_since(stored_at))
}
