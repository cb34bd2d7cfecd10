use gramfuzz_core::binary::BinaryGrammar;
use gramfuzz_core::config::GramfuzzConfig;
use gramfuzz_core::consensus::{ConsensusSet, collect_majority};
use gramfuzz_core::grammar::{GrammarSet, collect_templates};
use gramfuzz_core::oracle::{AskOptions, OracleError, OracleMode, Prompt, TextOracle};
use gramfuzz_core::persist::{SeedStore, format_request_message, hex_decode, read_file_as_hex};
use gramfuzz_core::range::RangeTagging;
use gramfuzz_core::response::parse_mutable_fields;
use gramfuzz_core::subset::missing_message_types;

use clap::{Parser, Subcommand, ValueEnum};
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::collections::{BTreeSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Raise log verbosity to debug.
    #[clap(short, long)]
    verbose: bool,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a grammar from sampled template answers and print its patterns.
    Compile {
        /// One file per sampled oracle answer.
        #[clap(required = true)]
        answers: Vec<PathBuf>,
    },
    /// Identify a message and print its ranges as JSON.
    Extract {
        #[clap(short, long, required = true, num_args = 1..)]
        answers: Vec<PathBuf>,
        #[clap(short, long)]
        message: PathBuf,
        /// Message terminators are bare `\n` and must be padded to `\r\n`.
        #[clap(long)]
        format_request: bool,
        #[clap(long, value_enum)]
        tagging: Option<Tagging>,
    },
    /// Compile a structured binary decomposition and run it over a message.
    Binary {
        /// A `structured_hex_dump_message` JSON answer.
        #[clap(short, long)]
        response: PathBuf,
        #[clap(short, long)]
        message: PathBuf,
        /// The message file holds hex text rather than raw bytes.
        #[clap(long)]
        hex: bool,
        #[clap(long, value_enum)]
        tagging: Option<Tagging>,
    },
    /// Majority-vote comma-separated answers (message types, states).
    Vote {
        #[clap(required = true)]
        answers: Vec<PathBuf>,
    },
    /// Plan which missing message types to ask the oracle to insert.
    Subsets {
        /// Comma-separated message types the grammar knows.
        #[clap(long, value_delimiter = ',')]
        known: Vec<String>,
        /// Comma-separated message types already present in the seed.
        #[clap(long, value_delimiter = ',')]
        present: Vec<String>,
        #[clap(long, default_value_t = 0)]
        seed: u64,
        #[clap(long)]
        max_message_types: Option<usize>,
    },
    /// Normalise seed files into the content-addressed seed directory.
    StoreSeeds {
        #[clap(required = true)]
        inputs: Vec<PathBuf>,
        #[clap(short, long)]
        output_dir: Option<PathBuf>,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Tagging {
    Uniform,
    Precise,
}

impl From<Tagging> for RangeTagging {
    fn from(tagging: Tagging) -> Self {
        match tagging {
            Tagging::Uniform => RangeTagging::Uniform,
            Tagging::Precise => RangeTagging::Precise,
        }
    }
}

/// Replays answers recorded on disk, one per call.
struct ReplayOracle {
    answers: Mutex<VecDeque<String>>,
}

impl ReplayOracle {
    fn new(answers: Vec<String>) -> Self {
        Self {
            answers: Mutex::new(answers.into()),
        }
    }

    fn from_files(paths: &[PathBuf]) -> Result<Self, anyhow::Error> {
        let answers = paths
            .iter()
            .map(|path| {
                std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("Failed to read answer file {:?}: {}", path, e))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(answers))
    }
}

impl TextOracle for ReplayOracle {
    fn ask(&self, _prompt: &Prompt, _options: &AskOptions) -> Result<String, OracleError> {
        self.answers
            .lock()
            .map_err(|e| OracleError::Transport(e.to_string()))?
            .pop_front()
            .ok_or_else(|| OracleError::NoAnswer {
                attempts: 1,
                last_error: "no recorded answers left".to_string(),
            })
    }
}

fn init_tracing(verbose: bool) {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_writer(std::io::stderr)
        .init();
}

fn load_config(config_file: Option<PathBuf>) -> Result<GramfuzzConfig, anyhow::Error> {
    match config_file {
        Some(config_path) => {
            info!(path = ?config_path, "Loading configuration");
            GramfuzzConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("gramfuzz.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "Loading default configuration");
                GramfuzzConfig::load_from_file(&default_config_path)
            } else {
                info!("No configuration file found, using built-in defaults");
                Ok(GramfuzzConfig::default())
            }
        }
    }
}

/// Answers beyond `samples` are never asked for; missing ones count as failed samples.
fn check_answer_count(answers: usize, samples: u32) {
    let samples = samples as usize;
    if answers > samples {
        warn!(answers, samples, "More answer files than samples, ignoring the rest");
    } else if answers < samples {
        warn!(answers, samples, "Fewer answer files than samples, missing ones count as failed");
    }
}

fn build_grammar(oracle: &ReplayOracle, samples: u32, options: &AskOptions) -> GrammarSet {
    let tally = collect_templates(oracle, &Prompt::Instruct(String::new()), samples, options);
    GrammarSet::build(&tally)
}

fn vote(oracle: &ReplayOracle, samples: u32, options: &AskOptions) -> ConsensusSet {
    collect_majority(&Prompt::Instruct(String::new()), samples, oracle, options)
}

fn grammar_from_files(
    answers: &[PathBuf],
    config: &GramfuzzConfig,
    options: &AskOptions,
) -> Result<GrammarSet, anyhow::Error> {
    let samples = config.grammar.template_samples;
    check_answer_count(answers.len(), samples);
    Ok(build_grammar(&ReplayOracle::from_files(answers)?, samples, options))
}

fn read_message(path: &Path, format_request: bool) -> Result<Vec<u8>, anyhow::Error> {
    let bytes = std::fs::read(path)
        .map_err(|e| anyhow::anyhow!("Failed to read message file {:?}: {}", path, e))?;
    if !format_request {
        return Ok(bytes);
    }
    let text = String::from_utf8(bytes)
        .map_err(|e| anyhow::anyhow!("Message file {:?} is not UTF-8: {}", path, e))?;
    Ok(format_request_message(&text).into_bytes())
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(cli.config_file)?;
    let options = config.oracle.ask_options(OracleMode::Instruct);

    match cli.command {
        Command::Compile { answers } => {
            let grammar = grammar_from_files(&answers, &config, &options)?;
            for pattern in grammar.iter() {
                println!("{}", pattern.message_type());
                println!("  header: {}", pattern.header_pattern().as_str());
                println!("  fields: {}", pattern.fields_pattern().as_str());
            }
        }
        Command::Extract {
            answers,
            message,
            format_request,
            tagging,
        } => {
            let tagging = tagging.map_or(config.grammar.range_tagging, RangeTagging::from);
            let grammar = grammar_from_files(&answers, &config, &options)?;
            let bytes = read_message(&message, format_request)?;
            match grammar.ranges_for(&bytes, tagging) {
                Some(ranges) => {
                    let output = serde_json::json!({
                        "message_type": &ranges.message_type,
                        "ranges": ranges.tiled(),
                    });
                    println!("{}", serde_json::to_string_pretty(&output)?);
                }
                None => {
                    warn!(path = ?message, "No message type matches the message");
                }
            }
        }
        Command::Binary {
            response,
            message,
            hex,
            tagging,
        } => {
            let tagging = tagging.map_or(config.grammar.range_tagging, RangeTagging::from);
            let response_text = std::fs::read_to_string(&response)
                .map_err(|e| anyhow::anyhow!("Failed to read response {:?}: {}", response, e))?;
            let chunks = parse_mutable_fields(&response_text);
            let grammar = BinaryGrammar::from_chunks(&chunks)?;
            if grammar.is_empty() {
                warn!("Decomposition has no mutable chunks");
                return Ok(());
            }

            let hex_text = if hex {
                let text = std::fs::read_to_string(&message)?;
                // Round-trip through the codec to validate and canonicalise.
                gramfuzz_core::persist::hex_encode(&hex_decode(&text)?)
            } else {
                read_file_as_hex(&message)?
            };
            let lists = grammar.extract(&hex_text, tagging);
            println!("{}", serde_json::to_string_pretty(&lists)?);
        }
        Command::Vote { answers } => {
            let samples = config.oracle.consensus_samples;
            check_answer_count(answers.len(), samples);
            let oracle = ReplayOracle::from_files(&answers)?;
            for item in vote(&oracle, samples, &options) {
                println!("{item}");
            }
        }
        Command::Subsets {
            known,
            present,
            seed,
            max_message_types,
        } => {
            let mut enrichment = config.enrichment.clone();
            if let Some(max) = max_message_types {
                enrichment.max_message_types = max;
            }
            let planner = enrichment.planner();
            let known: BTreeSet<String> = known.into_iter().collect();
            let present: BTreeSet<String> = present.into_iter().collect();
            let missing = missing_message_types(&known, &present);

            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            for subset in planner.sample(&missing, &mut rng) {
                println!("{}", subset.into_iter().collect::<Vec<_>>().join(","));
            }
        }
        Command::StoreSeeds { inputs, output_dir } => {
            let dir = output_dir.unwrap_or(config.seeds.output_dir);
            let mut store = SeedStore::open(&dir)?;
            let mut written = 0;
            for input in &inputs {
                let contents = std::fs::read_to_string(input)
                    .map_err(|e| anyhow::anyhow!("Failed to read seed {:?}: {}", input, e))?;
                if store.write(&contents)?.is_some() {
                    written += 1;
                }
            }
            info!(written, total = store.len(), dir = ?store.dir(), "Seeds stored");
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(answers: &[&str]) -> ReplayOracle {
        ReplayOracle::new(answers.iter().map(|a| a.to_string()).collect())
    }

    #[test]
    fn vote_threshold_follows_configured_samples() {
        let answers = ["PLAY, PAUSE", "PLAY, SETUP"];
        let options = AskOptions::default();

        let consensus = vote(&replay(&answers), 3, &options);
        assert_eq!(consensus, BTreeSet::from(["PLAY".to_string()]));

        // With the threshold at the answer count, single votes would pass.
        assert_eq!(vote(&replay(&answers), 2, &options).len(), 3);
    }

    #[test]
    fn grammar_threshold_follows_configured_samples() {
        let answers = [
            r#"["PLAY <<VALUE>>\r\n", "CSeq: <<VALUE>>\r\n", "Range: <<VALUE>>\r\n"]"#,
            r#"["PLAY <<VALUE>>\r\n", "CSeq: <<VALUE>>\r\n"]"#,
        ];
        let grammar = build_grammar(&replay(&answers), 3, &AskOptions::default());
        let play = grammar.get("PLAY").unwrap();
        assert!(play.fields_pattern().as_str().contains("CSeq"));
        assert!(!play.fields_pattern().as_str().contains("Range"));
    }

    #[test]
    fn replay_oracle_fails_once_exhausted() {
        let oracle = replay(&["only"]);
        let prompt = Prompt::Instruct(String::new());
        let options = AskOptions::default();
        assert_eq!(oracle.ask(&prompt, &options).unwrap(), "only");
        assert!(matches!(
            oracle.ask(&prompt, &options),
            Err(OracleError::NoAnswer { .. })
        ));
    }
}
