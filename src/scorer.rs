use crate::{MixtureId, Score, StateId};

/// Emission scorer for one time frame: negative log-likelihood of the
/// current feature vector under a mixture.
pub trait AcousticScorer {
    fn score(&self, mixture: MixtureId) -> Score;
}

/// Cheap acoustic estimate of upcoming frames, consulted per state during
/// pruning. Disabled by default.
pub trait AcousticLookahead {
    fn is_enabled(&self) -> bool;
    fn score_for_state(&self, state: StateId, mixture: MixtureId) -> Score;
}

#[derive(Debug, Default)]
pub struct NoAcousticLookahead;

impl AcousticLookahead for NoAcousticLookahead {
    fn is_enabled(&self) -> bool {
        false
    }

    fn score_for_state(&self, _state: StateId, _mixture: MixtureId) -> Score {
        0.0
    }
}

/// Scorer over a precomputed frame-by-mixture score matrix. The usual way
/// of driving the search in tests and offline decoding.
#[derive(Debug, Clone)]
pub struct FrameScorer {
    scores: Vec<Score>,
    n_mixtures: usize,
    frame: usize,
}

impl FrameScorer {
    /// `scores` is row-major, one row of `n_mixtures` scores per frame.
    pub fn new(scores: Vec<Score>, n_mixtures: usize) -> Self {
        assert!(n_mixtures > 0 && scores.len() % n_mixtures == 0);
        Self {
            scores,
            n_mixtures,
            frame: 0,
        }
    }

    pub fn n_frames(&self) -> usize {
        self.scores.len() / self.n_mixtures
    }

    pub fn at_frame(&self, frame: usize) -> FrameView<'_> {
        assert!(frame < self.n_frames());
        FrameView {
            scorer: self,
            frame,
        }
    }
}

impl AcousticScorer for FrameScorer {
    fn score(&self, mixture: MixtureId) -> Score {
        self.scores[self.frame * self.n_mixtures + mixture as usize]
    }
}

/// Borrowed view of a [`FrameScorer`] pinned to one frame.
pub struct FrameView<'a> {
    scorer: &'a FrameScorer,
    frame: usize,
}

impl AcousticScorer for FrameView<'_> {
    fn score(&self, mixture: MixtureId) -> Score {
        self.scorer.scores[self.frame * self.scorer.n_mixtures + mixture as usize]
    }
}
