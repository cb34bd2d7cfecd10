use crate::template::Template;
use regex::bytes::{Regex, RegexBuilder};
use std::fmt;
use thiserror::Error;

/// Matches any byte except `\n`. Unicode mode is disabled for the wildcard only, so
/// protocol bytes that are not valid UTF-8 can still be captured.
const WILDCARD: &str = "(?-u:.)*";

/// Capturing catch-all used when a message type has no trusted field templates.
const CATCH_ALL: &str = "((?-u:.)+)";

/// Upper bound on the compiled program size of one synthesized pattern.
const PATTERN_SIZE_LIMIT: usize = 1 << 22;

/// Errors raised while turning templates into compiled patterns.
///
/// Both variants are local failures: the affected message type is dropped from the
/// active pattern set and never participates in later matching.
#[derive(Error, Debug)]
pub enum PatternError {
    /// The template matched neither the placeholder shape nor the literal shape.
    #[error("Template {0:?} matches neither a placeholder nor a literal shape")]
    NoMatch(String),

    /// The regex engine rejected a synthesized pattern.
    #[error("Failed to compile pattern {pattern:?}: {reason}")]
    Compile { pattern: String, reason: String },
}

/// A pattern fragment with exactly one capturing group, not yet compiled.
///
/// Fragments are composed with [`PatternFragment::anchored`] and
/// [`PatternFragment::any_of`]; the literal text inside a fragment is already
/// escaped, so composition never needs to re-escape anything.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternFragment {
    source: String,
}

impl PatternFragment {
    fn from_template(template: &Template) -> Self {
        let source = match template {
            Template::Placeholder { prefix, suffix, .. } => format!(
                "(?:{}({}){})",
                regex::escape(prefix),
                WILDCARD,
                regex::escape(suffix)
            ),
            // The whole literal is captured so every fragment carries one group.
            Template::Literal(text) => format!("(?:({}))", regex::escape(text)),
        };
        Self { source }
    }

    /// Anchors the fragment at the start of the haystack.
    pub fn anchored(&self) -> Self {
        Self {
            source: format!("^{}", self.source),
        }
    }

    /// Joins fragments into one alternation. Exactly one alternative participates in
    /// any match, so exactly one capture group is set per match.
    ///
    /// An empty list yields the capturing catch-all.
    pub fn any_of(fragments: &[PatternFragment]) -> Self {
        if fragments.is_empty() {
            return Self {
                source: CATCH_ALL.to_string(),
            };
        }
        let alternatives: Vec<&str> = fragments.iter().map(|f| f.source.as_str()).collect();
        Self {
            source: format!("(?:{})", alternatives.join("|")),
        }
    }

    /// Concatenates escaped literal pieces and wildcard captures into one fragment.
    pub(crate) fn from_parts<'a>(parts: impl IntoIterator<Item = FragmentPart<'a>>) -> Self {
        let mut source = String::from("(?:");
        for part in parts {
            match part {
                FragmentPart::Literal(text) => source.push_str(&regex::escape(text)),
                FragmentPart::Capture => {
                    source.push('(');
                    source.push_str(WILDCARD);
                    source.push(')');
                }
            }
        }
        source.push(')');
        Self { source }
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Compiles the fragment into a reusable matcher.
    pub fn compile(&self) -> Result<CompiledPattern, PatternError> {
        let regex = RegexBuilder::new(&self.source)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
            .map_err(|e| PatternError::Compile {
                pattern: self.source.clone(),
                reason: e.to_string(),
            })?;
        Ok(CompiledPattern { regex })
    }
}

impl fmt::Display for PatternFragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

pub(crate) enum FragmentPart<'a> {
    Literal(&'a str),
    Capture,
}

/// Converts a single template into a pattern fragment with exactly one capturing
/// group.
pub fn compile_fragment(template: &str) -> Result<PatternFragment, PatternError> {
    let parsed = Template::parse(template)?;
    Ok(PatternFragment::from_template(&parsed))
}

/// A compiled matcher over raw message bytes.
///
/// Immutable once built and safe to share across threads; each extraction call keeps
/// its own capture buffer.
#[derive(Debug, Clone)]
pub struct CompiledPattern {
    regex: Regex,
}

impl CompiledPattern {
    pub fn as_str(&self) -> &str {
        self.regex.as_str()
    }

    pub(crate) fn regex(&self) -> &Regex {
        &self.regex
    }

    pub fn is_match(&self, haystack: &[u8]) -> bool {
        self.regex.is_match(haystack)
    }
}
