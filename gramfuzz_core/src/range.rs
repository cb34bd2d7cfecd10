use crate::pattern::CompiledPattern;
use serde::{Deserialize, Serialize};

/// A contiguous span of a message instance that the mutation engine may perturb.
///
/// `start` and `len` are character offsets for text messages and byte offsets for
/// binary messages (never hex-digit offsets).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Range {
    pub start: usize,
    pub len: usize,
    pub mutable: bool,
}

impl Range {
    pub fn end(&self) -> usize {
        self.start + self.len
    }
}

/// How extraction tags the mutability of emitted ranges.
///
/// `Uniform` marks every range mutable and is what downstream consumers currently
/// expect. `Precise` marks unmatched gaps and the fixed text of a template as
/// non-mutable and only captured values as mutable.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum RangeTagging {
    #[default]
    Uniform,
    Precise,
}

impl RangeTagging {
    pub(crate) fn fixed(self) -> bool {
        self == RangeTagging::Uniform
    }
}

/// The ranges extracted from one message instance, in increasing offset order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct RangeList {
    ranges: Vec<Range>,
}

impl RangeList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, range: Range) {
        self.ranges.push(range);
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Range> {
        self.ranges.iter()
    }

    pub fn as_slice(&self) -> &[Range] {
        &self.ranges
    }

    pub fn first(&self) -> Option<&Range> {
        self.ranges.first()
    }

    pub fn last(&self) -> Option<&Range> {
        self.ranges.last()
    }

    pub fn into_vec(self) -> Vec<Range> {
        self.ranges
    }

    /// Whether the ranges tile `[start, end)` exactly once, without gaps or overlap.
    pub fn tiles(&self, start: usize, end: usize) -> bool {
        let mut cursor = start;
        for range in &self.ranges {
            if range.start != cursor {
                return false;
            }
            cursor = range.end();
        }
        cursor == end
    }
}

impl IntoIterator for RangeList {
    type Item = Range;
    type IntoIter = std::vec::IntoIter<Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.into_iter()
    }
}

impl<'a> IntoIterator for &'a RangeList {
    type Item = &'a Range;
    type IntoIter = std::slice::Iter<'a, Range>;

    fn into_iter(self) -> Self::IntoIter {
        self.ranges.iter()
    }
}

impl From<Vec<Range>> for RangeList {
    fn from(ranges: Vec<Range>) -> Self {
        Self { ranges }
    }
}

/// Converts a half-open span of hex-digit coordinates into a byte `(start, len)`.
///
/// Both endpoints are halved before the length is taken, so adjacent hex spans stay
/// adjacent in byte units even when a span boundary falls between two digits.
pub fn hex_span_to_bytes(start: usize, end: usize) -> (usize, usize) {
    let byte_start = start / 2;
    let byte_end = end / 2;
    (byte_start, byte_end - byte_start)
}

/// The coordinate system of the haystack being scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Unit {
    Text,
    HexPairs,
}

impl Unit {
    /// Whether a match may start at `index`. Hex matches must start on a byte.
    fn aligned(self, index: usize) -> bool {
        match self {
            Unit::Text => true,
            Unit::HexPairs => index % 2 == 0,
        }
    }

    fn range(self, start: usize, end: usize, mutable: bool) -> Range {
        let (start, len) = match self {
            Unit::Text => (start, end - start),
            Unit::HexPairs => hex_span_to_bytes(start, end),
        };
        Range {
            start,
            len,
            mutable,
        }
    }
}

/// Matches `header_pattern` once at the start of `message`.
///
/// On success the list holds every participating capture group followed by the
/// whole match span (the global range, always last). An empty list means the header
/// did not match and the caller should try the next message type.
pub fn locate_header(message: &[u8], header_pattern: &CompiledPattern) -> RangeList {
    let mut ranges = RangeList::new();
    let regex = header_pattern.regex();
    let mut locations = regex.capture_locations();
    let Some(found) = regex.captures_read_at(&mut locations, message, 0) else {
        return ranges;
    };

    for group in 1..locations.len() {
        if let Some((start, end)) = locations.get(group) {
            ranges.push(Unit::Text.range(start, end, true));
        }
    }
    ranges.push(Unit::Text.range(found.start(), found.end(), true));
    ranges
}

/// Tiles `message[start_offset..]` with ranges in character units, every range
/// tagged mutable.
pub fn extract_fields(
    message: &[u8],
    start_offset: usize,
    fields_pattern: &CompiledPattern,
) -> RangeList {
    scan(message, start_offset, fields_pattern, Unit::Text, RangeTagging::Uniform)
}

/// Same as [`extract_fields`] over a hex-digit-pair encoding of a binary message;
/// offsets and lengths come back in bytes.
pub fn extract_fields_binary(
    hex_text: &[u8],
    start_offset: usize,
    fields_pattern: &CompiledPattern,
) -> RangeList {
    scan(hex_text, start_offset, fields_pattern, Unit::HexPairs, RangeTagging::Uniform)
}

/// [`extract_fields`] with an explicit mutability tagging policy.
pub fn extract_fields_tagged(
    message: &[u8],
    start_offset: usize,
    fields_pattern: &CompiledPattern,
    tagging: RangeTagging,
) -> RangeList {
    scan(message, start_offset, fields_pattern, Unit::Text, tagging)
}

/// [`extract_fields_binary`] with an explicit mutability tagging policy.
pub fn extract_fields_binary_tagged(
    hex_text: &[u8],
    start_offset: usize,
    fields_pattern: &CompiledPattern,
    tagging: RangeTagging,
) -> RangeList {
    scan(hex_text, start_offset, fields_pattern, Unit::HexPairs, tagging)
}

fn scan(
    haystack: &[u8],
    start_offset: usize,
    pattern: &CompiledPattern,
    unit: Unit,
    tagging: RangeTagging,
) -> RangeList {
    let mut ranges = RangeList::new();
    let length = haystack.len();
    if start_offset >= length {
        return ranges;
    }

    let regex = pattern.regex();
    let mut locations = regex.capture_locations();
    // `covered` is the end of the last emitted range; `offset` is where the next
    // search starts. They differ only after a zero-length match.
    let mut covered = start_offset;
    let mut offset = start_offset;

    while offset <= length {
        let Some(found) = regex.captures_read_at(&mut locations, haystack, offset) else {
            break;
        };
        if !unit.aligned(found.start()) {
            offset = found.start() + 1;
            continue;
        }

        if found.start() > covered {
            ranges.push(unit.range(covered, found.start(), tagging.fixed()));
        }

        let mut cursor = found.start();
        for group in 1..locations.len() {
            let Some((start, end)) = locations.get(group) else {
                continue;
            };
            if start < cursor {
                continue;
            }
            if start > cursor {
                ranges.push(unit.range(cursor, start, tagging.fixed()));
            }
            ranges.push(unit.range(start, end, true));
            cursor = end;
        }
        if found.end() > cursor {
            ranges.push(unit.range(cursor, found.end(), tagging.fixed()));
        }
        covered = covered.max(found.end());

        offset = if found.end() == offset {
            offset + 1
        } else {
            found.end()
        };
    }

    if covered < length {
        ranges.push(unit.range(covered, length, tagging.fixed()));
    }
    ranges
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message_pattern::{FieldFrequencyTable, build};
    use crate::pattern::{PatternFragment, compile_fragment};
    use proptest::prelude::*;

    fn fields(templates: &[&str]) -> CompiledPattern {
        let fragments: Vec<PatternFragment> = templates
            .iter()
            .map(|t| compile_fragment(t).unwrap())
            .collect();
        PatternFragment::any_of(&fragments).compile().unwrap()
    }

    fn spans(list: &RangeList) -> Vec<(usize, usize)> {
        list.iter().map(|r| (r.start, r.len)).collect()
    }

    #[test]
    fn header_round_trip_yields_value_and_global_range() {
        let compiled = build("PLAY <<VALUE>>", &FieldFrequencyTable::new(), 3).unwrap();
        let message = b"PLAY rtsp://host/stream";
        let ranges = locate_header(message, compiled.header_pattern());
        assert_eq!(ranges.len(), 2);
        assert_eq!(spans(&ranges), vec![(5, 18), (0, 23)]);
        assert!(ranges.iter().all(|r| r.mutable));
    }

    #[test]
    fn header_mismatch_returns_empty_list() {
        let compiled = build("PLAY <<VALUE>>", &FieldFrequencyTable::new(), 3).unwrap();
        assert!(locate_header(b"SETUP rtsp://host", compiled.header_pattern()).is_empty());
        assert!(locate_header(b" PLAY rtsp://host", compiled.header_pattern()).is_empty());
    }

    #[test]
    fn literal_header_yields_group_and_global() {
        let compiled = build("QUIT\r\n", &FieldFrequencyTable::new(), 3).unwrap();
        let ranges = locate_header(b"QUIT\r\n", compiled.header_pattern());
        assert_eq!(spans(&ranges), vec![(0, 6), (0, 6)]);
    }

    #[test]
    fn extract_fields_tiles_rtsp_request() {
        let message: &[u8] = b"PLAY rtsp://h/s RTSP/1.0\r\nCSeq: 4\r\nSession: 22B8\r\n\r\n";
        let header_end = 26;
        let pattern = fields(&["CSeq: <<VALUE>>\r\n", "Session: <<VALUE>>\r\n", "\r\n"]);
        let ranges = extract_fields(message, header_end, &pattern);

        assert!(ranges.tiles(header_end, message.len()), "{:?}", ranges);
        assert_eq!(
            spans(&ranges),
            vec![
                (26, 6),  // "CSeq: "
                (32, 1),  // "4"
                (33, 2),  // "\r\n"
                (35, 9),  // "Session: "
                (44, 4),  // "22B8"
                (48, 2),  // "\r\n"
                (50, 2),  // "\r\n"
            ]
        );
        assert!(ranges.iter().all(|r| r.mutable));
    }

    #[test]
    fn extract_fields_emits_gaps_and_tail() {
        let message: &[u8] = b"junk CSeq: 1\r\ntrailing";
        let pattern = fields(&["CSeq: <<VALUE>>\r\n"]);
        let ranges = extract_fields(message, 0, &pattern);
        assert_eq!(
            spans(&ranges),
            vec![(0, 5), (5, 6), (11, 1), (12, 2), (14, 8)]
        );
        assert!(ranges.tiles(0, message.len()));
    }

    #[test]
    fn extract_fields_without_match_is_single_tail() {
        let pattern = fields(&["CSeq: <<VALUE>>\r\n"]);
        let ranges = extract_fields(b"nothing here", 3, &pattern);
        assert_eq!(spans(&ranges), vec![(3, 9)]);
    }

    #[test]
    fn extract_fields_at_end_is_empty() {
        let pattern = fields(&["CSeq: <<VALUE>>\r\n"]);
        assert!(extract_fields(b"abc", 3, &pattern).is_empty());
        assert!(extract_fields(b"abc", 10, &pattern).is_empty());
    }

    #[test]
    fn zero_length_matches_do_not_drop_characters() {
        // A bare placeholder matches the empty string at every newline.
        let pattern = fields(&["<<VALUE>>"]);
        let message: &[u8] = b"ab\ncd\n";
        let ranges = extract_fields(message, 0, &pattern);
        assert!(ranges.tiles(0, message.len()), "{:?}", ranges);
    }

    #[test]
    fn catch_all_fields_cover_each_line() {
        let pattern = PatternFragment::any_of(&[]).compile().unwrap();
        let message: &[u8] = b"a\r\nb";
        let ranges = extract_fields(message, 0, &pattern);
        assert_eq!(spans(&ranges), vec![(0, 2), (2, 1), (3, 1)]);
    }

    #[test]
    fn precise_tagging_marks_only_captures_mutable() {
        let message: &[u8] = b"x CSeq: 9\r\n";
        let pattern = fields(&["CSeq: <<VALUE>>\r\n"]);
        let ranges = extract_fields_tagged(message, 0, &pattern, RangeTagging::Precise);
        let flags: Vec<bool> = ranges.iter().map(|r| r.mutable).collect();
        assert_eq!(flags, vec![false, false, true, false]);
        assert!(ranges.tiles(0, message.len()));
    }

    #[test]
    fn binary_extraction_halves_coordinates() {
        let hex: &[u8] = b"0a0bff01020c";
        let pattern = fields(&["0a0b<<LEN>>0c"]);
        let ranges = extract_fields_binary(hex, 0, &pattern);
        assert_eq!(spans(&ranges), vec![(0, 2), (2, 3), (5, 1)]);
        assert!(ranges.tiles(0, hex.len() / 2));
    }

    #[test]
    fn binary_extraction_skips_matches_inside_a_byte() {
        // Bytes 10 ab 0c: "0ab" straddles the first two bytes.
        let hex: &[u8] = b"10ab0c";
        let pattern = fields(&["0a<<V>>0c"]);
        let ranges = extract_fields_binary(hex, 0, &pattern);
        assert_eq!(spans(&ranges), vec![(0, 3)]);

        let text = extract_fields(hex, 0, &pattern);
        assert_eq!(spans(&text), vec![(0, 1), (1, 2), (3, 1), (4, 2)]);
    }

    #[test]
    fn hex_span_conversion_keeps_adjacency() {
        assert_eq!(hex_span_to_bytes(0, 4), (0, 2));
        assert_eq!(hex_span_to_bytes(4, 10), (2, 3));
        let (a_start, a_len) = hex_span_to_bytes(2, 7);
        let (b_start, _) = hex_span_to_bytes(7, 12);
        assert_eq!(a_start + a_len, b_start);
    }

    #[test]
    fn tiles_detects_gaps_and_overlaps() {
        let list = |spans: &[(usize, usize)]| {
            spans
                .iter()
                .map(|&(start, len)| Range {
                    start,
                    len,
                    mutable: true,
                })
                .collect::<Vec<_>>()
        };
        let gap = RangeList::from(list(&[(0, 2), (3, 1)]));
        assert!(!gap.tiles(0, 4));
        let overlap = RangeList::from(list(&[(0, 3), (2, 2)]));
        assert!(!overlap.tiles(0, 4));
        assert!(RangeList::new().tiles(5, 5));
    }

    fn to_hex(bytes: &[u8]) -> Vec<u8> {
        hex::encode(bytes).into_bytes()
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn prop_extract_fields_is_gapless(
            message in proptest::collection::vec(any::<u8>(), 0..64),
            start in 0usize..64,
        ) {
            let pattern = fields(&["A<<V>>;", "\r\n", "<<W>>=x"]);
            let start = start.min(message.len());
            let ranges = extract_fields(&message, start, &pattern);
            prop_assert!(ranges.tiles(start, message.len()), "{:?}", ranges);
        }

        #[test]
        fn prop_binary_ranges_are_text_ranges_halved(
            head in proptest::collection::vec(any::<u8>(), 0..8),
            value in proptest::collection::vec(any::<u8>(), 0..8),
            tail in proptest::collection::vec(any::<u8>(), 0..8),
        ) {
            let mut message = head.clone();
            message.extend_from_slice(&[0xde, 0xad]);
            message.extend_from_slice(&value);
            message.extend_from_slice(&[0xbe, 0xef]);
            message.extend_from_slice(&tail);
            let hex_text = to_hex(&message);

            let pattern = fields(&["dead<<V>>beef"]);
            let text_ranges = extract_fields(&hex_text, 0, &pattern);
            let byte_ranges = extract_fields_binary(&hex_text, 0, &pattern);

            prop_assert!(byte_ranges.tiles(0, message.len()));
            let all_even = text_ranges.iter().all(|r| r.start % 2 == 0 && r.len % 2 == 0);
            if all_even {
                let halved: Vec<(usize, usize)> =
                    text_ranges.iter().map(|r| (r.start / 2, r.len / 2)).collect();
                prop_assert_eq!(halved, spans(&byte_ranges));
            }
        }
    }
}
