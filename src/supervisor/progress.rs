//! Weighted progress across the task sequence.

/// Overall fraction done when `completed` tasks have finished and the
/// current one reports `current_fraction`.
///
/// `(Σ_{i<k} w_i + f·w_k) / Σ w_i`, clamped to `[0, 1]`. The task's own
/// fraction is clamped first so a misbehaving task cannot pull the total
/// outside its own share.
#[must_use]
pub fn overall_fraction(weights: &[f64], completed: usize, current_fraction: f64) -> f64 {
    let total: f64 = weights.iter().sum();
    if total <= 0.0 {
        return if completed >= weights.len() { 1.0 } else { 0.0 };
    }
    let done: f64 = weights.iter().take(completed).sum();
    let current = weights.get(completed).copied().unwrap_or(0.0);
    let f = if current_fraction.is_finite() {
        current_fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    ((done + f * current) / total).clamp(0.0, 1.0)
}

/// Parse a task's fraction-done file: the first whitespace-separated token
/// as a float.
#[must_use]
pub fn parse_fraction_file(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}
