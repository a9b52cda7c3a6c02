//! # Answer Evaluation
//!
//! Deciding whether a candidate's answer is correct is pluggable. A question
//! either carries an exact answer that can be compared after normalization,
//! or it is handed back to the conversational model for a semantic judgement
//! which then arrives through the `record_quiz_result` tool.

use serde::{Deserialize, Serialize};

/// How a question's answers are judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerPolicy {
    /// Compare the normalized answer against the expected answer and its
    /// accepted alternatives.
    ExactNormalizedCompare,
    /// Let the conversational model judge the answer semantically.
    DelegatedSemanticCompare,
}

/// The result of asking an evaluator about one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Evaluation {
    Decided(bool),
    /// The evaluator cannot decide locally; the verdict must be supplied
    /// by the caller later.
    Delegated,
}

/// The pieces of a question an evaluator needs.
#[derive(Debug, Clone, Copy)]
pub struct AnswerKey<'a> {
    pub expected: &'a str,
    pub accepted: &'a [String],
}

pub trait AnswerEvaluator: Send + Sync {
    fn evaluate(&self, policy: AnswerPolicy, key: AnswerKey<'_>, answer: &str) -> Evaluation;
}

/// The default evaluator: exact comparison for exact questions, delegation
/// for everything else.
#[derive(Debug, Default, Clone, Copy)]
pub struct NormalizedEvaluator;

impl AnswerEvaluator for NormalizedEvaluator {
    fn evaluate(&self, policy: AnswerPolicy, key: AnswerKey<'_>, answer: &str) -> Evaluation {
        match policy {
            AnswerPolicy::ExactNormalizedCompare => Evaluation::Decided(matches_exact(key, answer)),
            AnswerPolicy::DelegatedSemanticCompare => Evaluation::Delegated,
        }
    }
}

/// Lowercases, trims and strips option decoration ("Option (B)." -> "b"),
/// then collapses runs of whitespace. Only trailing periods are dropped, so
/// decimal quantities such as "1.5 kg" keep their point.
pub fn normalize_answer(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let stripped = lowered
        .strip_prefix("option ")
        .unwrap_or(&lowered)
        .replace(['(', ')'], "");
    stripped
        .trim_end()
        .trim_end_matches('.')
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when the answer equals the expected answer, any of its `/`-separated
/// alternatives, or one of the accepted answers, after normalization.
pub fn matches_exact(key: AnswerKey<'_>, answer: &str) -> bool {
    let given = normalize_answer(answer);
    if given.is_empty() {
        return false;
    }
    let expected = key.expected.split('/').map(normalize_answer);
    let accepted = key.accepted.iter().map(|a| normalize_answer(a));
    expected
        .chain(accepted)
        .filter(|candidate| !candidate.is_empty())
        .any(|candidate| candidate == given)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key<'a>(expected: &'a str, accepted: &'a [String]) -> AnswerKey<'a> {
        AnswerKey { expected, accepted }
    }

    #[test]
    fn test_normalize_strips_option_decoration() {
        assert_eq!(normalize_answer("  Option (B). "), "b");
        assert_eq!(normalize_answer("UNSAFE"), "unsafe");
        assert_eq!(normalize_answer("Tighten   it\timmediately"), "tighten it immediately");
    }

    #[test]
    fn test_exact_match_ignores_case_and_whitespace() {
        let none: [String; 0] = [];
        assert!(matches_exact(key("Tata Salt", &none), "  tata salt "));
        assert!(!matches_exact(key("Tata Salt", &none), "tata"));
        assert!(!matches_exact(key("Tata Salt", &none), "   "));
    }

    #[test]
    fn test_decimal_quantities_keep_their_point() {
        let none: [String; 0] = [];
        assert_eq!(normalize_answer("1.5 KG."), "1.5 kg");
        assert!(matches_exact(key("1.5 kg", &none), "1.5 KG"));
        assert!(!matches_exact(key("1.5 kg", &none), "15 kg"));
        assert!(!matches_exact(key("15 kg", &none), "1.5 kg"));
    }

    #[test]
    fn test_exact_match_accepts_alternatives() {
        let accepted = vec!["Tighten it immediately with the proper tool".to_string()];
        assert!(matches_exact(key("b", &accepted), "B"));
        assert!(matches_exact(
            key("b", &accepted),
            "tighten it immediately with the proper tool."
        ));
        assert!(matches_exact(key("Multimeter/Tester", &[]), "tester"));
    }

    #[test]
    fn test_default_evaluator_delegates_semantic_questions() {
        let evaluator = NormalizedEvaluator;
        assert_eq!(
            evaluator.evaluate(AnswerPolicy::DelegatedSemanticCompare, key("Ohm", &[]), "ohm"),
            Evaluation::Delegated
        );
        assert_eq!(
            evaluator.evaluate(AnswerPolicy::ExactNormalizedCompare, key("Ohm", &[]), "OHM"),
            Evaluation::Decided(true)
        );
    }
}
