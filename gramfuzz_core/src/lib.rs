pub mod binary;
pub mod config;
pub mod consensus;
pub mod grammar;
pub mod message_pattern;
pub mod oracle;
pub mod pattern;
pub mod persist;
pub mod range;
pub mod response;
pub mod subset;
pub mod template;

pub use binary::{BinaryGrammar, StructuredHexChunk, compile_variants};
pub use config::GramfuzzConfig;
pub use consensus::{ConsensusSet, VoteTally, collect_majority};
pub use grammar::{GrammarSet, MessageRanges, TemplateTally, collect_templates};
pub use message_pattern::{CompiledMessagePattern, FieldFrequencyTable, build};
pub use oracle::{AskOptions, OracleError, OracleMode, Prompt, RetryingOracle, TextOracle};
pub use pattern::{CompiledPattern, PatternError, PatternFragment, compile_fragment};
pub use persist::{PersistError, SeedStore};
pub use range::{
    Range, RangeList, RangeTagging, extract_fields, extract_fields_binary, locate_header,
};
pub use subset::{EnrichmentPlanner, enumerate_subsets};
pub use template::Template;
