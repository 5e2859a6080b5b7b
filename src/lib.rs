mod lexicon;
mod lm;
mod network;
mod scorer;
mod search;
mod trace;

pub use lexicon::{Lexicon, LexiconError, Pronunciation};
pub use lm::{BackOffLM, History, LanguageModel, ZeroLM};
pub use network::{
    Network, NetworkBuilder, NetworkError, StateDesc, SuccessorBatch, TransitionModel,
};
pub use scorer::{AcousticLookahead, AcousticScorer, FrameScorer, FrameView, NoAcousticLookahead};
pub use search::stats::{Accumulator, SearchStatistics};
pub use search::{
    LatticeMode, PruningDesc, RecognitionContext, RecognitionResult, Recognizer, SearchError,
    SearchOptions, SearchSpace, WordEndHypothesis,
};
pub use trace::{traceback, Trace, TraceId, TraceManager, TraceRef, TracebackItem};

use std::ops::{Add, AddAssign, Sub, SubAssign};

/// Negative log-probability; lower is better.
pub type Score = f32;

/// Sentinel for "cannot happen". A hypothesis whose score reaches this value
/// is silently dropped, never expanded.
pub const INVALID_SCORE: Score = f32::MAX;

pub type TimeframeIndex = u32;

/// Index of a state in the compiled network. 0 is reserved as invalid.
pub type StateId = u32;

pub type MixtureId = u32;

/// Syntactic token (word) id, as interned by the [`Lexicon`].
pub type Token = u32;

pub type Phoneme = u32;

/// Phoneme value meaning "no context" at a word boundary.
pub const TERM_PHONEME: Phoneme = u32::MAX;

/// Pronunciation id within the [`Lexicon`].
pub type PronId = u32;

/// Word-boundary coarticulation description: (final phoneme of the previous
/// word, initial phoneme of the following word).
pub type Transit = (Phoneme, Phoneme);

pub const NO_TRANSIT: Transit = (TERM_PHONEME, TERM_PHONEME);

/// A path score split into its acoustic and language-model components.
/// Ordering and thresholds always apply to the total.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ScoreVector {
    pub acoustic: Score,
    pub lm: Score,
}

impl ScoreVector {
    pub fn new(acoustic: Score, lm: Score) -> Self {
        Self { acoustic, lm }
    }

    pub fn total(&self) -> Score {
        self.acoustic + self.lm
    }
}

impl Add<Score> for ScoreVector {
    type Output = ScoreVector;
    fn add(self, rhs: Score) -> ScoreVector {
        ScoreVector::new(self.acoustic + rhs, self.lm)
    }
}

impl Sub for ScoreVector {
    type Output = ScoreVector;
    fn sub(self, rhs: ScoreVector) -> ScoreVector {
        ScoreVector::new(self.acoustic - rhs.acoustic, self.lm - rhs.lm)
    }
}

impl AddAssign for ScoreVector {
    fn add_assign(&mut self, rhs: ScoreVector) {
        self.acoustic += rhs.acoustic;
        self.lm += rhs.lm;
    }
}

impl SubAssign for ScoreVector {
    fn sub_assign(&mut self, rhs: ScoreVector) {
        self.acoustic -= rhs.acoustic;
        self.lm -= rhs.lm;
    }
}

impl PartialOrd for ScoreVector {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        self.total().partial_cmp(&other.total())
    }
}
