//! A moving success rate over the most recent trial outcomes.

use std::collections::VecDeque;

/// Number of trials the rolling success rate looks back over.
pub const DEFAULT_WINDOW: usize = 10;

/// Keeps the last `size` trial outcomes (`true` for correct).
#[derive(Debug, Clone, PartialEq)]
pub struct RollingWindow {
    size: usize,
    recent: VecDeque<bool>,
}

impl Default for RollingWindow {
    fn default() -> Self {
        Self::new(DEFAULT_WINDOW)
    }
}

impl RollingWindow {
    /// A window over the last `size` trials. A size of zero is bumped to one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            recent: VecDeque::with_capacity(size),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn push(&mut self, correct: bool) {
        self.recent.push_back(correct);
        if self.recent.len() > self.size {
            self.recent.pop_front();
        }
    }

    /// Outcomes currently in the window, oldest first.
    pub fn outcomes(&self) -> impl Iterator<Item = bool> + '_ {
        self.recent.iter().copied()
    }

    /// Percentage of correct trials in the window. While fewer than `size`
    /// trials have been seen, the rate is over the trials there are. `None`
    /// before the first trial.
    pub fn success_rate(&self) -> Option<f64> {
        rate(self.recent.iter().copied())
    }
}

/// The rolling success rate after each trial, as `(trial_number, percent)`
/// points for plotting. The window is `min(window, outcomes.len())`, so the
/// series starts at the first trial where a full window is available.
pub fn success_rate_series(outcomes: &[bool], window: usize) -> Vec<(usize, f64)> {
    let window = window.max(1).min(outcomes.len());
    if window == 0 {
        return Vec::new();
    }

    outcomes
        .windows(window)
        .enumerate()
        .filter_map(|(i, w)| rate(w.iter().copied()).map(|r| (i + window, r)))
        .collect()
}

fn rate(outcomes: impl Iterator<Item = bool>) -> Option<f64> {
    let (correct, total) = outcomes.fold((0usize, 0usize), |(c, t), o| (c + o as usize, t + 1));
    (total > 0).then(|| correct as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_window_has_no_rate() {
        let window = RollingWindow::new(5);
        assert_eq!(window.success_rate(), None);
    }

    #[test]
    fn rate_over_partial_window() {
        let mut window = RollingWindow::new(10);
        window.push(true);
        window.push(false);
        window.push(true);
        // three trials seen, window of ten: no out of range reads
        let rate = window.success_rate().unwrap();
        assert!((rate - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn old_outcomes_fall_out() {
        let mut window = RollingWindow::new(4);
        for correct in [false, false, true, true, true, false] {
            window.push(correct);
        }
        assert_eq!(window.outcomes().collect::<Vec<_>>(), vec![true, true, true, false]);
        assert_eq!(window.success_rate(), Some(75.0));
    }

    #[test]
    fn zero_size_is_bumped() {
        let mut window = RollingWindow::new(0);
        window.push(false);
        window.push(true);
        assert_eq!(window.size(), 1);
        assert_eq!(window.success_rate(), Some(100.0));
    }

    #[test]
    fn series_matches_windows() {
        let outcomes = [true, false, true, true];
        assert_eq!(
            success_rate_series(&outcomes, 2),
            vec![(2, 50.0), (3, 50.0), (4, 100.0)]
        );
        // window larger than history collapses to the history length
        assert_eq!(success_rate_series(&outcomes, 10), vec![(4, 75.0)]);
        assert!(success_rate_series(&[], 10).is_empty());
    }
}
