//! Per-protocol grammar: the compiled patterns for every message type the oracle
//! agreed on, and the whole-message range partition built from them.

use crate::message_pattern::{CompiledMessagePattern, FieldFrequencyTable, build};
use crate::oracle::{AskOptions, Prompt, TextOracle};
use crate::range::{Range, RangeList, RangeTagging, extract_fields_tagged, locate_header};
use crate::template::message_type_of;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Pulls every bracketed JSON string array out of a free-form answer.
///
/// Each array is one message type: the header template first, then its field
/// templates. Arrays that do not parse are logged and skipped.
pub fn parse_template_groups(answer: &str) -> Vec<Vec<String>> {
    let mut groups = Vec::new();
    let mut rest = answer;
    while let Some(open) = rest.find('[') {
        let candidate = &rest[open..];
        // A template may itself contain `]`, so try each closing bracket in turn.
        let parsed = candidate.match_indices(']').find_map(|(close, _)| {
            serde_json::from_str::<Vec<String>>(&candidate[..=close])
                .ok()
                .map(|group| (close, group))
        });
        match parsed {
            Some((close, group)) => {
                groups.push(group);
                rest = &candidate[close + 1..];
            }
            None => {
                warn!(text = ?candidate, "Unparseable template array, skipping");
                match candidate.find(']') {
                    Some(close) => rest = &candidate[close + 1..],
                    None => break,
                }
            }
        }
    }
    groups
}

/// Template observations accumulated over several oracle samples.
///
/// Counts are per sample: a template repeated within one answer is counted once.
#[derive(Debug, Clone, Default)]
pub struct TemplateTally {
    samples: u32,
    headers: BTreeMap<String, BTreeMap<String, u32>>,
    fields: BTreeMap<String, FieldFrequencyTable>,
}

impl TemplateTally {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the template groups of one sample.
    pub fn record_sample<I>(&mut self, groups: I)
    where
        I: IntoIterator<Item = Vec<String>>,
    {
        self.samples += 1;
        let mut seen_headers = BTreeSet::new();
        let mut seen_fields = BTreeSet::new();

        for group in groups {
            let Some((header, fields)) = group.split_first() else {
                continue;
            };
            let message_type = message_type_of(header);
            if message_type.is_empty() {
                warn!(header = ?header, "Header template names no message type, skipping");
                continue;
            }

            if seen_headers.insert((message_type.to_string(), header.clone())) {
                *self
                    .headers
                    .entry(message_type.to_string())
                    .or_default()
                    .entry(header.clone())
                    .or_insert(0) += 1;
            }
            for field in fields {
                if seen_fields.insert((message_type.to_string(), field.clone())) {
                    self.fields
                        .entry(message_type.to_string())
                        .or_default()
                        .record(field);
                }
            }
        }
    }

    /// Parses and records one raw answer. Returns the number of groups found.
    pub fn record_answer(&mut self, answer: &str) -> usize {
        let groups = parse_template_groups(answer);
        let found = groups.len();
        self.record_sample(groups);
        found
    }

    /// Counts a sample that produced no answer. It still raises the majority bar.
    pub fn skip_sample(&mut self) {
        self.samples += 1;
    }

    pub fn samples(&self) -> u32 {
        self.samples
    }

    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.headers.keys().map(String::as_str)
    }

    /// The most frequently sampled header template for `message_type`. Ties go to
    /// the template that sorts first.
    pub fn header_template(&self, message_type: &str) -> Option<&str> {
        self.headers
            .get(message_type)?
            .iter()
            .fold(None, |best: Option<(&String, u32)>, (template, &count)| match best {
                Some((_, best_count)) if best_count >= count => best,
                _ => Some((template, count)),
            })
            .map(|(template, _)| template.as_str())
    }

    pub fn field_table(&self, message_type: &str) -> Option<&FieldFrequencyTable> {
        self.fields.get(message_type)
    }
}

/// Samples the oracle `samples` times with the same template prompt.
pub fn collect_templates(
    oracle: &dyn TextOracle,
    prompt: &Prompt,
    samples: u32,
    options: &AskOptions,
) -> TemplateTally {
    let mut tally = TemplateTally::new();
    for sample in 0..samples {
        match oracle.ask(prompt, options) {
            Ok(answer) => {
                let groups = tally.record_answer(&answer);
                debug!(sample, groups, "Template sample");
            }
            Err(e) => {
                warn!(sample, error = %e, "Template sample failed, skipping");
                tally.skip_sample();
            }
        }
    }
    info!(
        samples,
        message_types = tally.headers.len(),
        "Template sampling finished"
    );
    tally
}

/// Compiled patterns for every message type of one protocol, in message-type order.
///
/// Immutable once built; a shared reference serves any number of concurrent
/// extraction calls.
#[derive(Debug, Clone, Default)]
pub struct GrammarSet {
    patterns: Vec<CompiledMessagePattern>,
}

impl GrammarSet {
    /// Compiles one pattern per message type in `tally`. Message types whose
    /// templates fail to compile are dropped.
    pub fn build(tally: &TemplateTally) -> Self {
        let empty = FieldFrequencyTable::new();
        let mut patterns = Vec::new();

        for message_type in tally.message_types() {
            let Some(header) = tally.header_template(message_type) else {
                continue;
            };
            let fields = tally.field_table(message_type).unwrap_or(&empty);
            match build(header, fields, tally.samples()) {
                Ok(pattern) => {
                    debug!(
                        message_type,
                        fields = pattern.field_count(),
                        "Compiled message pattern"
                    );
                    patterns.push(pattern);
                }
                Err(e) => {
                    warn!(message_type, error = %e, "Dropping message type");
                }
            }
        }

        info!(message_types = patterns.len(), "Grammar built");
        Self { patterns }
    }

    pub fn from_patterns(patterns: Vec<CompiledMessagePattern>) -> Self {
        Self { patterns }
    }

    pub fn get(&self, message_type: &str) -> Option<&CompiledMessagePattern> {
        self.patterns
            .iter()
            .find(|pattern| pattern.message_type() == message_type)
    }

    pub fn message_types(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(CompiledMessagePattern::message_type)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CompiledMessagePattern> {
        self.patterns.iter()
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Identifies `message` by the first header pattern that matches it and extracts
    /// its field ranges. `None` when no message type matches.
    pub fn ranges_for(&self, message: &[u8], tagging: RangeTagging) -> Option<MessageRanges> {
        self.patterns.iter().find_map(|pattern| {
            let header = locate_header(message, pattern.header_pattern());
            let header_end = header.last()?.end();
            let fields =
                extract_fields_tagged(message, header_end, pattern.fields_pattern(), tagging);
            Some(MessageRanges {
                message_type: pattern.message_type().to_string(),
                header,
                fields,
                tagging,
            })
        })
    }
}

/// Ranges of one identified message.
///
/// `header` is what [`locate_header`] returns (captures, then the global range);
/// `fields` tiles the message from the end of the header onwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageRanges {
    pub message_type: String,
    pub header: RangeList,
    pub fields: RangeList,
    #[serde(skip)]
    tagging: RangeTagging,
}

impl MessageRanges {
    /// One gapless partition of the whole message: the header split into its
    /// captures and fixed text, followed by the field ranges.
    pub fn tiled(&self) -> RangeList {
        let Some((global, captures)) = self.header.as_slice().split_last() else {
            return self.fields.clone();
        };
        let fixed = self.tagging.fixed();
        let mut tiles = RangeList::new();
        let mut cursor = 0;

        for capture in captures {
            if capture.start < cursor {
                continue;
            }
            if capture.start > cursor {
                tiles.push(Range {
                    start: cursor,
                    len: capture.start - cursor,
                    mutable: fixed,
                });
            }
            tiles.push(*capture);
            cursor = capture.end();
        }
        if global.end() > cursor {
            tiles.push(Range {
                start: cursor,
                len: global.end() - cursor,
                mutable: fixed,
            });
        }
        for range in &self.fields {
            tiles.push(*range);
        }
        tiles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::test_utils::ScriptedOracle;
    use std::thread;

    const SAMPLE_A: &str = r#"Templates:
["PLAY <<VALUE>>\r\n", "CSeq: <<VALUE>>\r\n", "Range: <<VALUE>>\r\n"]"#;
    const SAMPLE_B: &str = concat!(
        r#"["PLAY <<VALUE>>\r\n", "CSeq: <<VALUE>>\r\n", "Session: <<VALUE>>\r\n"]"#,
        "\n",
        r#"["PAUSE <<VALUE>>\r\n", "CSeq: <<VALUE>>\r\n"]"#,
    );

    const PLAY: &[u8] = b"PLAY rtsp://h/s RTSP/1.0\r\nCSeq: 4\r\nRange: npt=0-\r\n\r\n";

    fn rtsp_tally() -> TemplateTally {
        let mut tally = TemplateTally::new();
        tally.record_answer(SAMPLE_A);
        tally.record_answer(SAMPLE_B);
        tally.record_answer(SAMPLE_A);
        tally
    }

    fn texts(message: &[u8], ranges: &RangeList) -> Vec<String> {
        ranges
            .iter()
            .filter(|r| r.mutable)
            .map(|r| String::from_utf8_lossy(&message[r.start..r.end()]).into_owned())
            .collect()
    }

    #[test]
    fn parse_groups_from_free_text() {
        let groups = parse_template_groups(SAMPLE_B);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0][0], "PLAY <<VALUE>>\r\n");
        assert_eq!(groups[1], vec!["PAUSE <<VALUE>>\r\n", "CSeq: <<VALUE>>\r\n"]);
    }

    #[test]
    fn parse_groups_skips_broken_arrays() {
        let answer = r#"[not json] then ["QUIT\r\n"] and [1, 2] and ["[x]", "a]b"]"#;
        let groups = parse_template_groups(answer);
        assert_eq!(groups, vec![vec!["QUIT\r\n".to_string()], vec!["[x]".into(), "a]b".into()]]);
    }

    #[test]
    fn tally_counts_once_per_sample() {
        let mut tally = TemplateTally::new();
        tally.record_answer(r#"["NOOP\r\n", "X: <<V>>"] ["NOOP\r\n", "X: <<V>>"]"#);
        assert_eq!(tally.samples(), 1);
        assert_eq!(tally.field_table("NOOP").unwrap().count("X: <<V>>"), 1);
    }

    #[test]
    fn header_template_prefers_most_frequent_then_first() {
        let mut tally = TemplateTally::new();
        tally.record_answer(r#"["USER <<NAME>>\r\n"]"#);
        tally.record_answer(r#"["USER <<ID>>\r\n"]"#);
        assert_eq!(tally.header_template("USER"), Some("USER <<ID>>\r\n"));
        tally.record_answer(r#"["USER <<NAME>>\r\n"]"#);
        assert_eq!(tally.header_template("USER"), Some("USER <<NAME>>\r\n"));
        assert_eq!(tally.header_template("PASS"), None);
    }

    #[test]
    fn grammar_keeps_majority_fields_per_message_type() {
        let grammar = GrammarSet::build(&rtsp_tally());
        assert_eq!(grammar.message_types().collect::<Vec<_>>(), vec!["PAUSE", "PLAY"]);
        assert_eq!(grammar.get("PLAY").unwrap().field_count(), 2);
        assert_eq!(grammar.get("PAUSE").unwrap().field_count(), 0);
    }

    #[test]
    fn ranges_for_identifies_and_tiles_message() {
        let grammar = GrammarSet::build(&rtsp_tally());
        let ranges = grammar.ranges_for(PLAY, RangeTagging::Precise).unwrap();
        assert_eq!(ranges.message_type, "PLAY");
        let global = ranges.header.last().unwrap();
        assert_eq!((global.start, global.len, global.mutable), (0, 26, true));

        let tiled = ranges.tiled();
        assert!(tiled.tiles(0, PLAY.len()));
        assert_eq!(texts(PLAY, &tiled), vec!["rtsp://h/s RTSP/1.0", "4", "npt=0-"]);
    }

    #[test]
    fn uniform_tiling_marks_everything_mutable() {
        let grammar = GrammarSet::build(&rtsp_tally());
        let tiled = grammar.ranges_for(PLAY, RangeTagging::Uniform).unwrap().tiled();
        assert!(tiled.tiles(0, PLAY.len()));
        assert!(tiled.iter().all(|r| r.mutable));
    }

    #[test]
    fn header_only_message_has_no_fields() {
        let grammar = GrammarSet::build(&rtsp_tally());
        let message = b"PAUSE rtsp://h/s RTSP/1.0\r\n";
        let ranges = grammar.ranges_for(message, RangeTagging::Uniform).unwrap();
        assert_eq!(ranges.message_type, "PAUSE");
        assert!(ranges.fields.is_empty());
        assert!(ranges.tiled().tiles(0, message.len()));
    }

    #[test]
    fn unknown_message_type_yields_none() {
        let grammar = GrammarSet::build(&rtsp_tally());
        assert!(grammar.ranges_for(b"TEARDOWN x\r\n", RangeTagging::Uniform).is_none());
        assert!(GrammarSet::default().ranges_for(PLAY, RangeTagging::Uniform).is_none());
    }

    #[test]
    fn uncompilable_message_type_is_dropped() {
        let mut tally = TemplateTally::new();
        tally.record_answer(r#"["QUIT\r\n", ""] ["NOOP\r\n"]"#);
        let grammar = GrammarSet::build(&tally);
        assert_eq!(grammar.message_types().collect::<Vec<_>>(), vec!["NOOP"]);
    }

    #[test]
    fn collect_templates_counts_failed_samples() {
        let oracle = ScriptedOracle::new(vec![Some(SAMPLE_A), None, Some(SAMPLE_B)]);
        let prompt = Prompt::Instruct("RTSP templates".to_string());
        let tally = collect_templates(&oracle, &prompt, 3, &AskOptions::default());
        assert_eq!(tally.samples(), 3);
        assert_eq!(tally.field_table("PLAY").unwrap().count("CSeq: <<VALUE>>\r\n"), 2);

        // Range: seen once out of three samples, below the majority bar.
        let grammar = GrammarSet::build(&tally);
        assert_eq!(grammar.get("PLAY").unwrap().field_count(), 1);
    }

    #[test]
    fn grammar_serves_concurrent_extraction() {
        let grammar = GrammarSet::build(&rtsp_tally());
        let expected = grammar.ranges_for(PLAY, RangeTagging::Precise);
        thread::scope(|scope| {
            let workers: Vec<_> = (0..4)
                .map(|_| scope.spawn(|| grammar.ranges_for(PLAY, RangeTagging::Precise)))
                .collect();
            for worker in workers {
                assert_eq!(worker.join().unwrap(), expected);
            }
        });
    }
}
