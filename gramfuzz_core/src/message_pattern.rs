use crate::pattern::{CompiledPattern, PatternError, PatternFragment, compile_fragment};
use crate::template::{message_type_of, strip_quotes};
use std::collections::BTreeMap;
use tracing::debug;

/// Observed counts of field templates for one message type.
///
/// Built while sampling the oracle, consumed once by [`build`], then discarded.
/// Iteration is in template-text order so the synthesized alternation is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldFrequencyTable {
    counts: BTreeMap<String, u32>,
}

impl FieldFrequencyTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one observation of `template`.
    pub fn record(&mut self, template: &str) {
        *self.counts.entry(template.to_string()).or_insert(0) += 1;
    }

    pub fn count(&self, template: &str) -> u32 {
        self.counts.get(template).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.counts.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }
}

impl<S: Into<String>> FromIterator<(S, u32)> for FieldFrequencyTable {
    fn from_iter<T: IntoIterator<Item = (S, u32)>>(iter: T) -> Self {
        Self {
            counts: iter.into_iter().map(|(k, v)| (k.into(), v)).collect(),
        }
    }
}

/// Minimum number of samples a template must appear in, given `samples` independent
/// samples: at least half of them, rounded up.
pub fn majority_support(samples: u32) -> u32 {
    samples.div_ceil(2)
}

/// The compiled matchers for one message type.
///
/// Created once per protocol/message-type pair and never mutated afterwards, so a
/// single instance can serve concurrent extraction calls.
#[derive(Debug, Clone)]
pub struct CompiledMessagePattern {
    message_type: String,
    header_pattern: CompiledPattern,
    fields_pattern: CompiledPattern,
    field_count: usize,
}

impl CompiledMessagePattern {
    pub fn message_type(&self) -> &str {
        &self.message_type
    }

    pub fn header_pattern(&self) -> &CompiledPattern {
        &self.header_pattern
    }

    pub fn fields_pattern(&self) -> &CompiledPattern {
        &self.fields_pattern
    }

    /// Number of majority-supported field templates in the alternation. Zero means
    /// the fields pattern is the catch-all.
    pub fn field_count(&self) -> usize {
        self.field_count
    }
}

/// Compiles the header and fields patterns for one message type.
///
/// Field templates seen in fewer than half of `majority_threshold` samples are
/// skipped. Any retained template that fails to compile fails the whole build.
pub fn build(
    header_template: &str,
    field_table: &FieldFrequencyTable,
    majority_threshold: u32,
) -> Result<CompiledMessagePattern, PatternError> {
    let message_type = message_type_of(header_template).to_string();
    let header_fragment = compile_fragment(strip_quotes(header_template))?.anchored();

    let min_support = majority_support(majority_threshold);
    let mut field_fragments = Vec::new();
    for (template, count) in field_table.iter() {
        if count < min_support {
            debug!(
                message_type = %message_type,
                template = ?template,
                count,
                min_support,
                "Skipping field template without majority support"
            );
            continue;
        }
        field_fragments.push(compile_fragment(strip_quotes(template))?);
    }
    let fields_fragment = PatternFragment::any_of(&field_fragments);

    debug!(message_type = %message_type, pattern = %header_fragment, "Header pattern");
    debug!(message_type = %message_type, pattern = %fields_fragment, "Fields pattern");

    Ok(CompiledMessagePattern {
        message_type,
        header_pattern: header_fragment.compile()?,
        fields_pattern: fields_fragment.compile()?,
        field_count: field_fragments.len(),
    })
}
