use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::{Phoneme, PronId, Score, Token};

#[derive(Error, Debug)]
pub enum LexiconError {
    #[error("duplicate lemma in lexicon: {0}")]
    DuplicateLemma(String),
    #[error("missing lemma in lexicon: {0}")]
    MissingLemma(String),
    #[error("missing lemma id in lexicon: {0}")]
    MissingToken(Token),
    #[error("pronunciation {0} refers to unknown lemma {1}")]
    UnknownLemma(PronId, Token),
}

/// A single pronunciation of a lemma: its phoneme sequence and an additive
/// pronunciation weight (scaled by the word penalty at scoring time).
#[derive(Debug, Clone, PartialEq)]
pub struct Pronunciation {
    pub lemma: Token,
    pub phonemes: Vec<Phoneme>,
    pub weight: Score,
}

impl Pronunciation {
    pub fn initial_phoneme(&self) -> Option<Phoneme> {
        self.phonemes.first().copied()
    }

    pub fn final_phoneme(&self) -> Option<Phoneme> {
        self.phonemes.last().copied()
    }

    /// The last `n` phonemes, or all of them for a negative `n`.
    /// Used as the coarse recombination context in mesh-lattice mode.
    pub fn phoneme_suffix(&self, n: i32) -> &[Phoneme] {
        if n < 0 {
            &self.phonemes
        } else {
            let n = (n as usize).min(self.phonemes.len());
            &self.phonemes[self.phonemes.len() - n..]
        }
    }
}

/// Pronunciation lexicon: interns lemma names and owns the pronunciation
/// table referenced by the network's exits.
#[derive(Debug, Clone, Default)]
pub struct Lexicon {
    lemma2token: FxHashMap<String, Token>,
    token2lemma: FxHashMap<Token, String>,
    pronunciations: Vec<Pronunciation>,
    n_phonemes: u32,
}

impl Lexicon {
    pub fn new(n_phonemes: u32) -> Self {
        Self {
            n_phonemes,
            ..Self::default()
        }
    }

    pub fn n_phonemes(&self) -> u32 {
        self.n_phonemes
    }

    pub fn n_lemmas(&self) -> usize {
        debug_assert!(self.lemma2token.len() == self.token2lemma.len());
        self.lemma2token.len()
    }

    pub fn n_pronunciations(&self) -> usize {
        self.pronunciations.len()
    }

    pub fn add_lemma(&mut self, name: impl Into<String>) -> Result<Token, LexiconError> {
        let name = name.into();
        if self.lemma2token.contains_key(&name) {
            return Err(LexiconError::DuplicateLemma(name));
        }
        let token = self.lemma2token.len() as Token;
        self.lemma2token.insert(name.clone(), token);
        self.token2lemma.insert(token, name);
        Ok(token)
    }

    pub fn add_pronunciation(
        &mut self,
        lemma: Token,
        phonemes: Vec<Phoneme>,
        weight: Score,
    ) -> Result<PronId, LexiconError> {
        let id = self.pronunciations.len() as PronId;
        if !self.token2lemma.contains_key(&lemma) {
            return Err(LexiconError::UnknownLemma(id, lemma));
        }
        self.pronunciations.push(Pronunciation {
            lemma,
            phonemes,
            weight,
        });
        Ok(id)
    }

    pub fn pronunciation(&self, id: PronId) -> &Pronunciation {
        &self.pronunciations[id as usize]
    }

    pub fn token(&self, lemma: &str) -> Result<Token, LexiconError> {
        self.lemma2token
            .get(lemma)
            .copied()
            .ok_or_else(|| LexiconError::MissingLemma(lemma.to_owned()))
    }

    pub fn lemma(&self, token: Token) -> Result<&String, LexiconError> {
        self.token2lemma
            .get(&token)
            .ok_or(LexiconError::MissingToken(token))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interns_lemmas_and_pronunciations() {
        let mut lexicon = Lexicon::new(5);
        let hello = lexicon.add_lemma("hello").unwrap();
        let world = lexicon.add_lemma("world").unwrap();
        assert!(lexicon.add_lemma("hello").is_err());
        assert_eq!(lexicon.token("world").unwrap(), world);
        assert_eq!(lexicon.lemma(hello).unwrap(), "hello");

        let p = lexicon.add_pronunciation(hello, vec![0, 1, 2], 0.0).unwrap();
        assert_eq!(lexicon.pronunciation(p).initial_phoneme(), Some(0));
        assert_eq!(lexicon.pronunciation(p).final_phoneme(), Some(2));
        assert!(lexicon.add_pronunciation(99, vec![0], 0.0).is_err());
    }

    #[test]
    fn phoneme_suffix_is_bounded() {
        let pron = Pronunciation {
            lemma: 0,
            phonemes: vec![3, 1, 4, 1],
            weight: 0.0,
        };
        assert_eq!(pron.phoneme_suffix(-1), &[3, 1, 4, 1]);
        assert_eq!(pron.phoneme_suffix(2), &[4, 1]);
        assert_eq!(pron.phoneme_suffix(0), &[] as &[Phoneme]);
        assert_eq!(pron.phoneme_suffix(9), &[3, 1, 4, 1]);
    }
}
