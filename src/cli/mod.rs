//! CLI command definitions and parsing
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "ragfuse",
    version,
    about = "Hybrid vector + keyword retrieval with RRF fusion and reranking",
    long_about = "ragfuse answers questions over a local document index by searching several query \
                  variants through vector and keyword backends at once, fusing the ranked lists with \
                  Reciprocal Rank Fusion and reranking the top candidates."
)]
pub struct Cli {
    /// Global config file path (defaults to ~/.config/ragfuse/config.toml)
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Configuration profile to apply
    #[arg(short, long, global = true)]
    pub profile: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Retrieve the chunks most relevant to a question
    Query {
        /// Question text
        query: String,

        /// Index to search (defaults to index.default_index)
        #[arg(short, long)]
        index: Option<String>,

        /// Number of chunks to return
        #[arg(short = 'k', long)]
        top_k: Option<usize>,

        /// JSON file with prior turns: [{"role": "user", "content": "..."}]
        #[arg(long, value_name = "FILE")]
        history: Option<PathBuf>,

        /// Add LLM paraphrases of the question
        #[arg(long)]
        multi_query: bool,

        /// Split compound questions into sub-questions
        #[arg(long)]
        decompose: bool,

        /// Skip the rerank pass
        #[arg(long)]
        no_rerank: bool,

        /// Show results in JSON format
        #[arg(long)]
        json: bool,
    },

    /// Load pre-chunked records (JSON lines) into the local index
    Ingest {
        /// JSONL file, one {"doc_id", "text", "chunk_id"?, "content_type"?} per line
        file: PathBuf,

        /// Target index (defaults to index.default_index)
        #[arg(short, long)]
        index: Option<String>,
    },

    /// List local indexes
    Indexes,

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigAction {
    /// Show current configuration
    Show {
        /// Show only a specific section
        #[arg(short, long)]
        section: Option<String>,
    },

    /// Validate configuration file
    Validate {
        /// Path to config file (defaults to standard location)
        #[arg(short, long)]
        file: Option<PathBuf>,
    },

    /// Initialize default configuration
    Init {
        /// Force overwrite existing config
        #[arg(short, long)]
        force: bool,
    },
}

impl Cli {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
