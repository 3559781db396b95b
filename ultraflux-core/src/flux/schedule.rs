/// Flow-matching timesteps with a static time shift.
///
/// A linear grid from 1 to 0 with `steps + 1` points, each mapped through
/// `s * t / (1 + (s - 1) * t)`. A shift of 1 leaves the grid unchanged;
/// larger shifts spend more of the steps at high noise levels.
pub(crate) fn shifted_schedule(steps: usize, shift: f64) -> Vec<f64> {
    (0..=steps)
        .map(|i| {
            let t = 1.0 - i as f64 / steps as f64;
            shift * t / (1.0 + (shift - 1.0) * t)
        })
        .collect()
}
