//! Consensus voting over candidate outputs.
//!
//! Outputs are compared by a signature of their normalized text so that
//! whitespace-only differences do not split the vote.

use std::collections::HashMap;

use sha2::{Digest, Sha256};

use crate::core::types::StepId;

/// One participant's output in a consensus round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub step_id: StepId,
    pub output: String,
}

/// Normalize line endings, strip trailing whitespace per line, collapse runs
/// of blank lines and trim the whole text.
pub fn normalize_output(output: &str) -> String {
    let mut lines: Vec<&str> = Vec::new();
    let mut previous_blank = false;
    for line in output.lines() {
        let line = line.trim_end();
        let blank = line.is_empty();
        if blank && previous_blank {
            continue;
        }
        lines.push(line);
        previous_blank = blank;
    }
    lines.join("\n").trim().to_string()
}

pub fn signature(output: &str) -> String {
    hex::encode(Sha256::digest(normalize_output(output).as_bytes()))
}

/// Winner by strict majority of `participants` (not just of the candidates
/// that produced output). Ties between equal signatures resolve to the first
/// candidate carrying the winning signature.
pub fn select_majority(candidates: &[Candidate], participants: usize) -> Option<&Candidate> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    for (index, candidate) in candidates.iter().enumerate() {
        let entry = counts
            .entry(signature(&candidate.output))
            .or_insert((0, index));
        entry.0 += 1;
    }
    counts
        .into_values()
        .find(|(count, _)| *count * 2 > participants)
        .map(|(_, first)| &candidates[first])
}

/// Prompt for an arbiter run listing the candidates with 1-based labels.
pub fn arbiter_prompt(task_input: &str, candidates: &[Candidate]) -> String {
    let mut prompt = String::new();
    prompt.push_str("Several agents answered the same task. Pick the best answer.\n");
    prompt.push_str("Reply with the number of the chosen candidate.\n\n## Task\n");
    prompt.push_str(task_input.trim());
    for (i, candidate) in candidates.iter().enumerate() {
        prompt.push_str(&format!(
            "\n\n## Candidate {} (step {})\n{}",
            i + 1,
            candidate.step_id,
            candidate.output.trim()
        ));
    }
    prompt
}

/// The arbiter's choice: the first integer in its output, as a 1-based index.
pub fn parse_arbiter_choice(output: &str, candidates: usize) -> Option<usize> {
    let digits: String = output
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .take_while(char::is_ascii_digit)
        .collect();
    let choice: usize = digits.parse().ok()?;
    (1..=candidates).contains(&choice).then(|| choice - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, output: &str) -> Candidate {
        Candidate {
            step_id: StepId::from(id),
            output: output.to_string(),
        }
    }

    #[test]
    fn normalization_ignores_whitespace_noise() {
        assert_eq!(
            signature("fn main() {}  \r\n\n\n\nok\n"),
            signature("fn main() {}\n\nok")
        );
        assert_ne!(signature("a b"), signature("a  b"));
    }

    #[test]
    fn majority_picks_duplicated_output() {
        let candidates = vec![
            candidate("a", "answer: 42\n"),
            candidate("b", "answer: 41"),
            candidate("c", "answer: 42"),
        ];
        let winner = select_majority(&candidates, 3).expect("majority");
        assert_eq!(winner.step_id.as_str(), "a");
    }

    #[test]
    fn no_strict_majority_without_enough_votes() {
        let split = vec![candidate("a", "x"), candidate("b", "y")];
        assert_eq!(select_majority(&split, 2), None);

        // Two agreeing answers out of four participants is not a strict majority.
        let half = vec![candidate("a", "x"), candidate("b", "x")];
        assert_eq!(select_majority(&half, 4), None);
    }

    #[test]
    fn arbiter_choice_is_first_integer_in_range() {
        assert_eq!(parse_arbiter_choice("I pick candidate 2.", 3), Some(1));
        assert_eq!(parse_arbiter_choice("3", 3), Some(2));
        assert_eq!(parse_arbiter_choice("candidate 4", 3), None);
        assert_eq!(parse_arbiter_choice("0", 3), None);
        assert_eq!(parse_arbiter_choice("none of them", 3), None);
    }

    #[test]
    fn arbiter_prompt_labels_candidates() {
        let prompt = arbiter_prompt("sum 1..3", &[candidate("a", "6"), candidate("b", "7")]);
        assert!(prompt.contains("## Candidate 1 (step a)\n6"));
        assert!(prompt.contains("## Candidate 2 (step b)\n7"));
    }
}
