use std::cell::RefCell;

use rustc_hash::FxHashMap;

use crate::lexicon::Pronunciation;
use crate::{Score, Token};

/// A reference to a language-model history (word context). Histories are
/// interned by the model; equal handles mean equal contexts, so they can be
/// used directly as hash keys for recombination and instance lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct History(pub(crate) u32);

/// Language model as consumed by the search: histories, word scores, and the
/// back-off queries needed for sparse lookahead. All scores are expected to
/// be pre-scaled (the model applies its own scale factor).
pub trait LanguageModel {
    fn start_history(&self) -> History;

    /// The history obtained by appending `token`, truncated to the model
    /// order.
    fn extended_history(&self, h: History, token: Token) -> History;

    /// The history truncated to at most `limit` words.
    fn reduced_history(&self, h: History, limit: u32) -> History;

    fn history_length(&self, h: History) -> u32;

    /// Scaled score of `token` in context `h`.
    fn score(&self, h: History, token: Token) -> Score;

    fn sentence_end_score(&self, h: History) -> Score;

    /// Word score plus the scaled pronunciation weight.
    fn pronunciation_score(&self, h: History, pron: &Pronunciation, pron_scale: Score) -> Score {
        self.score(h, pron.lemma) + pron_scale * pron.weight
    }

    /// Scaled penalty applied when a context is dropped by one order.
    /// Only meaningful for backing-off models.
    fn back_off_score(&self, h: History) -> Score {
        let _ = h;
        0.0
    }

    /// Accumulated back-off penalty for dropping `h` down to length `limit`.
    fn accumulated_back_off_score(&self, h: History, limit: u32) -> Score {
        let mut h = h;
        let mut total = 0.0;
        while self.history_length(h) > limit {
            total += self.back_off_score(h);
            let len = self.history_length(h);
            h = self.reduced_history(h, len - 1);
        }
        total
    }

    fn is_backing_off(&self) -> bool {
        false
    }

    fn scale(&self) -> Score {
        1.0
    }

    /// The tokens that have an explicit (non-backed-off) score in context
    /// `h`, for sparse lookahead table construction. `None` means the model
    /// scores every token directly and lookahead tables should be dense.
    fn words_with_scores(&self, h: History) -> Option<Vec<(Token, Score)>> {
        let _ = h;
        None
    }
}

/// A language model that always returns 0 and keeps no context.
/// Stub implementation for interface consistency and tests.
#[derive(Debug, Default)]
pub struct ZeroLM;

impl ZeroLM {
    pub fn new() -> Self {
        ZeroLM
    }
}

impl LanguageModel for ZeroLM {
    fn start_history(&self) -> History {
        History(0)
    }

    fn extended_history(&self, _h: History, _token: Token) -> History {
        History(0)
    }

    fn reduced_history(&self, _h: History, _limit: u32) -> History {
        History(0)
    }

    fn history_length(&self, _h: History) -> u32 {
        0
    }

    fn score(&self, _h: History, _token: Token) -> Score {
        0.0
    }

    fn sentence_end_score(&self, _h: History) -> Score {
        0.0
    }
}

#[derive(Debug, Default)]
struct HistoryIntern {
    by_seq: FxHashMap<Vec<Token>, u32>,
    seqs: Vec<Vec<Token>>,
}

impl HistoryIntern {
    fn intern(&mut self, seq: Vec<Token>) -> History {
        if let Some(&id) = self.by_seq.get(&seq) {
            return History(id);
        }
        let id = self.seqs.len() as u32;
        self.by_seq.insert(seq.clone(), id);
        self.seqs.push(seq);
        History(id)
    }
}

/// A programmable backing-off n-gram model. Word scores are explicit per
/// (context, token) entry; absent entries back off to the shortened context
/// with a per-context penalty. Histories are interned token sequences.
pub struct BackOffLM {
    order: u32,
    scale: Score,
    word_scores: FxHashMap<(Vec<Token>, Token), Score>,
    back_off_scores: FxHashMap<Vec<Token>, Score>,
    sentence_end_scores: FxHashMap<Vec<Token>, Score>,
    default_word_score: Score,
    default_back_off_score: Score,
    default_sentence_end_score: Score,
    intern: RefCell<HistoryIntern>,
}

impl BackOffLM {
    pub fn new(order: u32) -> Self {
        let lm = Self {
            order,
            scale: 1.0,
            word_scores: FxHashMap::default(),
            back_off_scores: FxHashMap::default(),
            sentence_end_scores: FxHashMap::default(),
            default_word_score: 0.0,
            default_back_off_score: 0.0,
            default_sentence_end_score: 0.0,
            intern: RefCell::new(HistoryIntern::default()),
        };
        // History 0 is the empty (unigram) context.
        lm.intern.borrow_mut().intern(Vec::new());
        lm
    }

    pub fn with_scale(mut self, scale: Score) -> Self {
        self.scale = scale;
        self
    }

    pub fn with_default_word_score(mut self, score: Score) -> Self {
        self.default_word_score = score;
        self
    }

    pub fn with_default_back_off_score(mut self, score: Score) -> Self {
        self.default_back_off_score = score;
        self
    }

    pub fn with_default_sentence_end_score(mut self, score: Score) -> Self {
        self.default_sentence_end_score = score;
        self
    }

    /// Unscaled explicit score of `token` after `context`.
    pub fn set_word_score(&mut self, context: &[Token], token: Token, score: Score) {
        self.word_scores.insert((context.to_vec(), token), score);
    }

    pub fn set_back_off_score(&mut self, context: &[Token], score: Score) {
        self.back_off_scores.insert(context.to_vec(), score);
    }

    pub fn set_sentence_end_score(&mut self, context: &[Token], score: Score) {
        self.sentence_end_scores.insert(context.to_vec(), score);
    }

    fn seq(&self, h: History) -> Vec<Token> {
        self.intern.borrow().seqs[h.0 as usize].clone()
    }

    fn raw_back_off(&self, seq: &[Token]) -> Score {
        self.back_off_scores
            .get(seq)
            .copied()
            .unwrap_or(self.default_back_off_score)
    }

    fn raw_score(&self, mut seq: &[Token], token: Token) -> Score {
        let mut backed_off = 0.0;
        loop {
            if let Some(&s) = self.word_scores.get(&(seq.to_vec(), token)) {
                return backed_off + s;
            }
            if seq.is_empty() {
                return backed_off + self.default_word_score;
            }
            backed_off += self.raw_back_off(seq);
            seq = &seq[1..];
        }
    }
}

impl LanguageModel for BackOffLM {
    fn start_history(&self) -> History {
        History(0)
    }

    fn extended_history(&self, h: History, token: Token) -> History {
        let mut seq = self.seq(h);
        seq.push(token);
        let max = self.order as usize;
        if seq.len() > max {
            seq.drain(..seq.len() - max);
        }
        self.intern.borrow_mut().intern(seq)
    }

    fn reduced_history(&self, h: History, limit: u32) -> History {
        let seq = self.seq(h);
        if seq.len() <= limit as usize {
            return h;
        }
        let reduced = seq[seq.len() - limit as usize..].to_vec();
        self.intern.borrow_mut().intern(reduced)
    }

    fn history_length(&self, h: History) -> u32 {
        self.intern.borrow().seqs[h.0 as usize].len() as u32
    }

    fn score(&self, h: History, token: Token) -> Score {
        self.raw_score(&self.seq(h), token) * self.scale
    }

    fn sentence_end_score(&self, h: History) -> Score {
        let mut seq = self.seq(h);
        loop {
            if let Some(&s) = self.sentence_end_scores.get(&seq) {
                return s * self.scale;
            }
            if seq.is_empty() {
                return self.default_sentence_end_score * self.scale;
            }
            seq.remove(0);
        }
    }

    fn back_off_score(&self, h: History) -> Score {
        self.raw_back_off(&self.seq(h)) * self.scale
    }

    fn is_backing_off(&self) -> bool {
        true
    }

    fn scale(&self) -> Score {
        self.scale
    }

    fn words_with_scores(&self, h: History) -> Option<Vec<(Token, Score)>> {
        let seq = self.seq(h);
        let mut words: Vec<(Token, Score)> = self
            .word_scores
            .iter()
            .filter(|((ctx, _), _)| *ctx == seq)
            .map(|((_, token), &s)| (*token, s * self.scale))
            .collect();
        words.sort_by_key(|&(token, _)| token);
        Some(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn histories_are_interned_and_truncated() {
        let lm = BackOffLM::new(2);
        let h0 = lm.start_history();
        let h1 = lm.extended_history(h0, 7);
        let h2 = lm.extended_history(h1, 8);
        let h3 = lm.extended_history(h2, 9);
        assert_eq!(lm.history_length(h0), 0);
        assert_eq!(lm.history_length(h2), 2);
        // Truncated to order 2: [8, 9].
        assert_eq!(lm.history_length(h3), 2);
        assert_ne!(h2, h3);
        assert_eq!(lm.extended_history(lm.extended_history(h0, 8), 9), h3);
        assert_eq!(lm.reduced_history(h3, 1), lm.extended_history(h0, 9));
        assert_eq!(lm.reduced_history(h3, 0), h0);
    }

    #[test]
    fn backs_off_with_penalty() {
        let mut lm = BackOffLM::new(1).with_default_word_score(10.0);
        lm.set_word_score(&[], 5, 1.0);
        lm.set_word_score(&[5], 6, 0.5);
        lm.set_back_off_score(&[5], 2.0);
        let h0 = lm.start_history();
        let h5 = lm.extended_history(h0, 5);
        assert_eq!(lm.score(h5, 6), 0.5);
        // 6 -> 5 unseen after [5]: back-off 2.0 + unigram 1.0.
        assert_eq!(lm.score(h5, 5), 3.0);
        // Unseen everywhere: back-off 2.0 + default 10.0.
        assert_eq!(lm.score(h5, 7), 12.0);
        assert_eq!(lm.words_with_scores(h5).unwrap(), vec![(6, 0.5)]);
    }

    #[test]
    fn accumulated_back_off_terminates_at_unigram() {
        let mut lm = BackOffLM::new(3);
        lm.set_back_off_score(&[1, 2, 3], 0.5);
        lm.set_back_off_score(&[2, 3], 0.25);
        lm.set_back_off_score(&[3], 0.125);
        let mut h = lm.start_history();
        for t in [1, 2, 3] {
            h = lm.extended_history(h, t);
        }
        assert_eq!(lm.accumulated_back_off_score(h, 0), 0.875);
        assert_eq!(lm.accumulated_back_off_score(h, 2), 0.5);
    }
}
