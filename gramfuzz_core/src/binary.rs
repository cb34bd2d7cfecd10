use crate::pattern::{CompiledPattern, FragmentPart, PatternError, PatternFragment};
use crate::range::{RangeList, RangeTagging, extract_fields_binary_tagged};
use tracing::debug;

/// One field of a binary message as split by the oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StructuredHexChunk {
    pub hex_text: String,
    pub is_mutable: bool,
}

impl StructuredHexChunk {
    pub fn new(hex_text: impl Into<String>, is_mutable: bool) -> Self {
        Self {
            hex_text: hex_text.into(),
            is_mutable,
        }
    }

    /// The chunk in canonical form: no whitespace, lowercase digits.
    pub fn canonical_hex(&self) -> String {
        self.hex_text
            .chars()
            .filter(|c| !c.is_whitespace())
            .map(|c| c.to_ascii_lowercase())
            .collect()
    }
}

/// Emits one pattern per mutable chunk. In the pattern for chunk `k`, chunk `k` is a
/// wildcard capture and every other chunk, mutable or not, is literal hex.
///
/// No mutable chunks means no patterns.
pub fn compile_variants(
    chunks: &[StructuredHexChunk],
) -> Result<Vec<CompiledPattern>, PatternError> {
    let canonical: Vec<String> = chunks.iter().map(StructuredHexChunk::canonical_hex).collect();

    chunks
        .iter()
        .enumerate()
        .filter(|(_, chunk)| chunk.is_mutable)
        .map(|(wildcard_index, _)| {
            let parts = canonical.iter().enumerate().map(|(index, hex)| {
                if index == wildcard_index {
                    FragmentPart::Capture
                } else {
                    FragmentPart::Literal(hex)
                }
            });
            let fragment = PatternFragment::from_parts(parts);
            debug!(chunk = wildcard_index, pattern = %fragment, "Binary variant pattern");
            fragment.compile()
        })
        .collect()
}

/// The per-field variant patterns of one binary message shape.
#[derive(Debug, Clone, Default)]
pub struct BinaryGrammar {
    variants: Vec<CompiledPattern>,
}

impl BinaryGrammar {
    pub fn from_chunks(chunks: &[StructuredHexChunk]) -> Result<Self, PatternError> {
        Ok(Self {
            variants: compile_variants(chunks)?,
        })
    }

    pub fn variants(&self) -> &[CompiledPattern] {
        &self.variants
    }

    pub fn is_empty(&self) -> bool {
        self.variants.is_empty()
    }

    /// Runs every variant over `hex_text`, one byte-unit range list per variant.
    pub fn extract(&self, hex_text: &str, tagging: RangeTagging) -> Vec<RangeList> {
        self.variants
            .iter()
            .map(|variant| extract_fields_binary_tagged(hex_text.as_bytes(), 0, variant, tagging))
            .collect()
    }
}
