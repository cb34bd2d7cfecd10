use crate::message_pattern::majority_support;
use crate::oracle::{AskOptions, Prompt, TextOracle};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Items (protocol states, message types) that survived majority voting.
pub type ConsensusSet = BTreeSet<String>;

/// Token tallies for one voting round.
///
/// Short-lived: created per round, fed one response per sample, then resolved into a
/// [`ConsensusSet`].
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    samples: u32,
    counts: BTreeMap<String, u32>,
}

impl VoteTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tallies every token of one successful response. Repeats inside a response
    /// are counted each time they occur.
    pub fn record_response(&mut self, response: &str) {
        self.samples += 1;
        for token in tokenize(response) {
            *self.counts.entry(token).or_insert(0) += 1;
        }
    }

    /// Number of successful responses recorded.
    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn count(&self, token: &str) -> u32 {
        self.counts.get(token).copied().unwrap_or(0)
    }

    /// Every token seen in at least half of `sample_count` samples.
    pub fn majority(&self, sample_count: u32) -> ConsensusSet {
        let min_support = majority_support(sample_count);
        self.counts
            .iter()
            .filter(|(_, count)| **count >= min_support)
            .map(|(token, _)| token.clone())
            .collect()
    }
}

fn is_trimmable(c: char) -> bool {
    c.is_whitespace() || (c.is_ascii_punctuation() && c != '_')
}

/// Splits a comma-separated answer into trimmed, non-empty tokens.
pub fn tokenize(response: &str) -> impl Iterator<Item = String> + '_ {
    response
        .split(',')
        .map(|token| token.trim_matches(is_trimmable))
        .filter(|token| !token.is_empty())
        .map(str::to_string)
}

/// Asks `oracle` the same question `sample_count` times and keeps every token that
/// appears in at least half of the samples.
///
/// A failed sample is skipped rather than retried; the remaining samples still vote
/// and the threshold stays relative to `sample_count`.
pub fn collect_majority(
    prompt: &Prompt,
    sample_count: u32,
    oracle: &dyn TextOracle,
    options: &AskOptions,
) -> ConsensusSet {
    let mut tally = VoteTally::new();
    for sample in 0..sample_count {
        match oracle.ask(prompt, options) {
            Ok(answer) if !answer.trim().is_empty() => {
                debug!(sample, answer = %answer, "Consensus sample");
                tally.record_response(&answer);
            }
            Ok(_) => warn!(sample, "Oracle returned an empty consensus sample, skipping"),
            Err(e) => warn!(sample, error = %e, "Consensus sample failed, skipping"),
        }
    }

    let consensus = tally.majority(sample_count);
    info!(
        samples = sample_count,
        answered = tally.samples(),
        kept = consensus.len(),
        "Majority vote finished"
    );
    consensus
}
