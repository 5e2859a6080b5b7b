use crate::Score;

/// Running average/extrema over per-frame observations.
#[derive(Debug, Clone, Copy, Default)]
pub struct Accumulator {
    n: u64,
    sum: f64,
    min: f64,
    max: f64,
}

impl Accumulator {
    pub fn add(&mut self, value: f64) {
        if self.n == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.n += 1;
        self.sum += value;
    }

    pub fn count(&self) -> u64 {
        self.n
    }

    pub fn average(&self) -> f64 {
        if self.n == 0 {
            0.0
        } else {
            self.sum / self.n as f64
        }
    }

    pub fn min(&self) -> f64 {
        self.min
    }

    pub fn max(&self) -> f64 {
        self.max
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Counters behind the pruning-health snapshot and the per-segment log
/// output.
#[derive(Debug, Default)]
pub struct SearchStatistics {
    pub states_after_pruning: Accumulator,
    pub word_ends_after_pruning: Accumulator,
    pub lemmas_after_recombination: Accumulator,
    pub acoustic_pruning_saturated_frames: u64,
    pub frames: u64,
    pub best_scores: Accumulator,
}

impl SearchStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn frame(
        &mut self,
        n_states: usize,
        n_word_ends: usize,
        n_lemmas: usize,
        acoustic_saturated: bool,
        best_score: Score,
    ) {
        self.frames += 1;
        self.states_after_pruning.add(n_states as f64);
        self.word_ends_after_pruning.add(n_word_ends as f64);
        self.lemmas_after_recombination.add(n_lemmas as f64);
        if acoustic_saturated {
            self.acoustic_pruning_saturated_frames += 1;
        }
        if best_score != crate::INVALID_SCORE {
            self.best_scores.add(best_score as f64);
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }

    pub fn log_summary(&self) {
        log::info!(
            "search: {} frames, avg states {:.1}, avg word ends {:.1}, avg lemmas {:.1}, acoustic saturation {}/{}, avg best score {:.2}",
            self.frames,
            self.states_after_pruning.average(),
            self.word_ends_after_pruning.average(),
            self.lemmas_after_recombination.average(),
            self.acoustic_pruning_saturated_frames,
            self.frames,
            self.best_scores.average()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulator_tracks_extrema_and_average() {
        let mut a = Accumulator::default();
        a.add(2.0);
        a.add(6.0);
        a.add(1.0);
        assert_eq!(a.count(), 3);
        assert_eq!(a.average(), 3.0);
        assert_eq!(a.min(), 1.0);
        assert_eq!(a.max(), 6.0);
    }

    #[test]
    fn frames_without_a_best_score_stay_out_of_the_average() {
        let mut stats = SearchStatistics::new();
        stats.frame(10, 2, 1, false, crate::INVALID_SCORE);
        stats.frame(12, 3, 2, true, 4.0);
        assert_eq!(stats.frames, 2);
        assert_eq!(stats.best_scores.count(), 1);
        assert_eq!(stats.best_scores.average(), 4.0);
        assert_eq!(stats.acoustic_pruning_saturated_frames, 1);
    }
}
