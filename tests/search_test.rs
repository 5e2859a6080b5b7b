use std::rc::Rc;

use treesearch::{
    BackOffLM, FrameScorer, LatticeMode, Lexicon, Network, NetworkBuilder, Recognizer,
    RecognitionContext, SearchError, SearchOptions, Token, TransitionModel, ZeroLM,
};

fn zero_tdp(b: &mut NetworkBuilder) -> u32 {
    b.add_transition_model(TransitionModel {
        loop_: 0.0,
        forward: 0.0,
        skip: 0.0,
        exit: 0.0,
    })
}

/// Root plus two two-state words. Mixtures: root 0, a1 1, a2 2, b1 3, b2 4.
fn two_word_network() -> (Network, Lexicon, Token, Token) {
    let mut lexicon = Lexicon::new(4);
    let a = lexicon.add_lemma("a").unwrap();
    let b = lexicon.add_lemma("b").unwrap();
    let pron_a = lexicon.add_pronunciation(a, vec![0, 1], 0.0).unwrap();
    let pron_b = lexicon.add_pronunciation(b, vec![2, 3], 0.0).unwrap();

    let mut builder = NetworkBuilder::new();
    let tm = zero_tdp(&mut builder);
    let root = builder.add_state(0, tm);
    let a1 = builder.add_state(1, tm);
    let a2 = builder.add_state(2, tm);
    let b1 = builder.add_state(3, tm);
    let b2 = builder.add_state(4, tm);
    builder.set_root(root).unwrap();
    builder.add_transition(root, a1).unwrap();
    builder.add_transition(root, b1).unwrap();
    builder.add_transition(a1, a2).unwrap();
    builder.add_transition(b1, b2).unwrap();
    builder.add_exit(a2, Some(pron_a), root).unwrap();
    builder.add_exit(b2, Some(pron_b), root).unwrap();
    (builder.build().unwrap(), lexicon, a, b)
}

/// Root plus single-state words, one per entry in `mixtures`.
fn flat_network(names: &[&str]) -> (Network, Lexicon, Vec<Token>) {
    let mut lexicon = Lexicon::new(names.len() as u32);
    let mut builder = NetworkBuilder::new();
    let tm = zero_tdp(&mut builder);
    let root = builder.add_state(0, tm);
    builder.set_root(root).unwrap();
    let mut tokens = Vec::new();
    for (i, name) in names.iter().enumerate() {
        let token = lexicon.add_lemma(*name).unwrap();
        let pron = lexicon
            .add_pronunciation(token, vec![i as u32], 0.0)
            .unwrap();
        let state = builder.add_state(i as u32 + 1, tm);
        builder.add_transition(root, state).unwrap();
        builder.add_exit(state, Some(pron), root).unwrap();
        tokens.push(token);
    }
    (builder.build().unwrap(), lexicon, tokens)
}

#[test]
fn decodes_the_best_word_sequence() {
    let (network, lexicon, a, b) = two_word_network();
    let mut recognizer = Recognizer::new(
        network,
        lexicon,
        Rc::new(ZeroLM::new()),
        SearchOptions::default(),
    );
    let scorer = FrameScorer::new(
        vec![
            5.0, 0.0, 5.0, 5.0, 5.0, // a1
            5.0, 5.0, 0.0, 5.0, 5.0, // a2
            5.0, 5.0, 5.0, 0.0, 5.0, // b1
            5.0, 5.0, 5.0, 5.0, 0.0, // b2
        ],
        5,
    );
    let result = recognizer.decode(&scorer).unwrap();
    assert_eq!(result.words, vec![a, b]);
    assert!(result.score.total().abs() < 1e-3, "{:?}", result.score);
}

#[test]
fn recombined_word_ends_become_lattice_siblings() {
    let (network, lexicon, tokens) = flat_network(&["a", "b"]);
    let mut recognizer = Recognizer::new(
        network,
        lexicon,
        Rc::new(ZeroLM::new()),
        SearchOptions::default(),
    );
    let scorer = FrameScorer::new(vec![5.0, 0.0, 1.0], 3);
    let result = recognizer.decode(&scorer).unwrap();
    assert_eq!(result.words, vec![tokens[0]]);

    // The losing word "b" hangs off the winning word's trace node.
    let word_trace = result.trace.borrow().predecessor.clone().unwrap();
    let sibling = word_trace.borrow().sibling.clone().unwrap();
    let sibling_pron = sibling.borrow().pronunciation.unwrap();
    assert_eq!(
        recognizer.search().lexicon().pronunciation(sibling_pron).lemma,
        tokens[1]
    );
    assert!((sibling.borrow().score.total() - 1.0).abs() < 1e-3);
}

#[test]
fn single_best_mode_drops_recombined_alternatives() {
    let (network, lexicon, tokens) = flat_network(&["a", "b"]);
    let options = SearchOptions {
        lattice_mode: LatticeMode::SingleBest,
        ..SearchOptions::default()
    };
    let mut recognizer = Recognizer::new(network, lexicon, Rc::new(ZeroLM::new()), options);
    let scorer = FrameScorer::new(vec![5.0, 0.0, 1.0], 3);
    let result = recognizer.decode(&scorer).unwrap();
    assert_eq!(result.words, vec![tokens[0]]);
    let word_trace = result.trace.borrow().predecessor.clone().unwrap();
    assert!(word_trace.borrow().sibling.is_none());
}

#[test]
fn loop_and_forward_scores_follow_the_transition_models() {
    let mut lexicon = Lexicon::new(2);
    let w = lexicon.add_lemma("w").unwrap();
    let pron = lexicon.add_pronunciation(w, vec![0, 1], 0.0).unwrap();

    let mut builder = NetworkBuilder::new();
    let tm = builder.add_transition_model(TransitionModel {
        loop_: 1.0,
        forward: 2.0,
        skip: 10.0,
        exit: 0.5,
    });
    let root = builder.add_state(0, tm);
    let s1 = builder.add_state(0, tm);
    let s2 = builder.add_state(0, tm);
    builder.set_root(root).unwrap();
    builder.add_transition(root, s1).unwrap();
    builder.add_transition(s1, s2).unwrap();
    builder.add_exit(s2, Some(pron), root).unwrap();
    let network = builder.build().unwrap();

    let mut recognizer = Recognizer::new(
        network,
        lexicon,
        Rc::new(ZeroLM::new()),
        SearchOptions::default(),
    );
    // All emissions free: only transition scores separate the paths. Two
    // forwards plus one loop plus the exit penalty.
    let scorer = FrameScorer::new(vec![0.0, 0.0, 0.0], 1);
    let result = recognizer.decode(&scorer).unwrap();
    assert_eq!(result.words, vec![w]);
    assert!((result.score.total() - 5.5).abs() < 1e-3, "{:?}", result.score);
}

#[test]
fn a_wider_beam_never_worsens_the_result() {
    let (_, _, a, b) = two_word_network();
    // Frame 0 makes "b" look best, but only "a" can finish cheaply.
    let scorer = FrameScorer::new(
        vec![
            9.0, 2.0, 9.0, 0.0, 9.0, //
            9.0, 9.0, 0.0, 9.0, 5.0, //
        ],
        5,
    );
    let run = |beam: f32| {
        let (network, lexicon, _, _) = two_word_network();
        let options = SearchOptions {
            beam_pruning: beam,
            ..SearchOptions::default()
        };
        let mut recognizer = Recognizer::new(network, lexicon, Rc::new(ZeroLM::new()), options);
        recognizer.decode(&scorer).unwrap()
    };
    // The tight beam drops the "a" branch after the first frame.
    let tight = run(1.5);
    let wide = run(SearchOptions::default().beam_pruning);
    assert_eq!(tight.words, vec![b]);
    assert_eq!(wide.words, vec![a]);
    assert!(wide.score.total() <= tight.score.total() + 1e-3);
}

#[test]
fn histogram_pruning_caps_the_state_count() {
    let (network, lexicon, _tokens) = flat_network(&["w0", "w1", "w2", "w3", "w4", "w5"]);
    let options = SearchOptions {
        beam_pruning: 97.0,
        beam_pruning_limit: 2,
        ..SearchOptions::default()
    };
    let mut recognizer = Recognizer::new(network, lexicon, Rc::new(ZeroLM::new()), options);
    let row = vec![50.0, 0.0, 1.0, 2.0, 3.0, 4.0, 5.0];
    let mut scores = Vec::new();
    for _ in 0..3 {
        scores.extend_from_slice(&row);
    }
    let scorer = FrameScorer::new(scores, 7);
    let result = recognizer.decode(&scorer).unwrap();
    assert!(!result.words.is_empty());
    assert!(recognizer.search().statistics().states_after_pruning.max() <= 2.0);
}

#[test]
fn sparse_lookahead_hands_misses_to_the_back_off_tree() {
    let (network, lexicon, tokens) = flat_network(&["a", "b"]);
    let (a, b) = (tokens[0], tokens[1]);

    let mut lm = BackOffLM::new(2);
    lm.set_word_score(&[], a, 1.0);
    lm.set_word_score(&[], b, 0.5);
    lm.set_word_score(&[a], a, 0.9);
    lm.set_back_off_score(&[a], 2.0);

    let options = SearchOptions {
        sparse_lookahead: true,
        ..SearchOptions::default()
    };
    let mut recognizer = Recognizer::new(network, lexicon, Rc::new(lm), options);
    // Frame 0 forces "a", frame 1 forces "b". The bigram table after "a"
    // has no entry for "b", so its hypothesis survives only through the
    // backed-off tree and pays the back-off penalty.
    let scorer = FrameScorer::new(vec![5.0, 0.0, 5.0, 5.0, 5.0, 0.0], 3);
    let result = recognizer.decode(&scorer).unwrap();
    assert_eq!(result.words, vec![a, b]);
    // 1.0 for "a", then back-off 2.0 plus unigram 0.5 for "b".
    assert!((result.score.total() - 3.5).abs() < 1e-3, "{:?}", result.score);
}

#[test]
fn startup_requires_a_matching_root() {
    let (network, lexicon, _tokens) = flat_network(&["a"]);
    let mut recognizer = Recognizer::new(
        network,
        lexicon,
        Rc::new(ZeroLM::new()),
        SearchOptions::default(),
    );
    let scorer = FrameScorer::new(vec![0.0, 0.0], 2);
    let context = RecognitionContext {
        initial_transit: (9, 9),
        ..RecognitionContext::new()
    };
    let result = recognizer.decode_with_context(&scorer, context);
    assert!(matches!(
        result,
        Err(SearchError::NoRootForCoarticulation(9, 9))
    ));
}

#[test]
fn suffix_words_are_scored_at_the_segment_end() {
    let (network, lexicon, tokens) = flat_network(&["a", "b"]);
    let (a, b) = (tokens[0], tokens[1]);

    let mut lm = BackOffLM::new(1).with_default_sentence_end_score(0.3);
    lm.set_word_score(&[], a, 0.4);
    lm.set_word_score(&[], b, 0.7);

    let mut recognizer = Recognizer::new(network, lexicon, Rc::new(lm), SearchOptions::default());
    let scorer = FrameScorer::new(vec![5.0, 0.0, 5.0], 3);
    let context = RecognitionContext {
        suffix_words: vec![b],
        ..RecognitionContext::new()
    };
    let result = recognizer.decode_with_context(&scorer, context).unwrap();
    // The suffix word is scored but never part of the traceback.
    assert_eq!(result.words, vec![a]);
    assert!((result.score.lm - 1.4).abs() < 1e-3, "{:?}", result.score);
}
