use crate::pattern::PatternError;
use regex::Regex;
use std::sync::LazyLock;

/// Recognises the two template shapes: `prefix<<value>>suffix` (group 1..=3) or an
/// opaque non-empty literal (group 4). Prefix and value are greedy, so the last
/// `<<...>>` pair wins when the oracle emits more than one.
static TEMPLATE_SPLITTER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?s)^(?:(.*)<<(.*)>>(.*)|(.+))$").unwrap_or_else(|e| {
        unreachable!("template splitter expression failed to compile: {e}")
    })
});

/// An oracle-provided example of a protocol header or field.
///
/// A template either marks one variable span with a `<<NAME>>` placeholder
/// (`"CSeq: <<VALUE>>\r\n"`) or is an opaque literal (`"\r\n"`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Template {
    Placeholder {
        prefix: String,
        name: String,
        suffix: String,
    },
    Literal(String),
}

impl Template {
    /// Splits `text` into one of the two template shapes.
    ///
    /// Returns `PatternError::NoMatch` for empty input. The template source is
    /// static, so callers drop the message type rather than retry.
    pub fn parse(text: &str) -> Result<Self, PatternError> {
        let captures = TEMPLATE_SPLITTER
            .captures(text)
            .ok_or_else(|| PatternError::NoMatch(text.to_string()))?;

        match (
            captures.get(1),
            captures.get(2),
            captures.get(3),
            captures.get(4),
        ) {
            (Some(prefix), Some(name), Some(suffix), None) => Ok(Template::Placeholder {
                prefix: prefix.as_str().to_string(),
                name: name.as_str().to_string(),
                suffix: suffix.as_str().to_string(),
            }),
            (None, None, None, Some(literal)) => {
                Ok(Template::Literal(literal.as_str().to_string()))
            }
            _ => unreachable!("template splitter groups changed without updating Template::parse"),
        }
    }

    pub fn has_placeholder(&self) -> bool {
        matches!(self, Template::Placeholder { .. })
    }
}

/// Derives the message type name from a header template: the leading run up to the
/// first space, newline, carriage return or backslash.
///
/// One leading `"` is skipped; oracle answers that were re-escaped upstream keep
/// their opening quote.
pub fn message_type_of(header_template: &str) -> &str {
    let text = header_template
        .strip_prefix('"')
        .unwrap_or(header_template);
    let end = text
        .find([' ', '\n', '\r', '\\'])
        .unwrap_or(text.len());
    &text[..end]
}

/// Removes one pair of surrounding quotes left over from upstream string escaping.
pub fn strip_quotes(text: &str) -> &str {
    match text.strip_prefix('"') {
        Some(inner) => inner.strip_suffix('"').unwrap_or(inner),
        None => text,
    }
}
