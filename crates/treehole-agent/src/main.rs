//! # Treehole CLI (`treehole`)
//!
//! ## Usage
//!
//! ```bash
//! treehole --config ./config/treehole.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `treehole ask "<question>"` | LLM-directed iterative search, then answer |
//! | `treehole search "<keyword>" "<question>"` | Single keyword search, then answer |
//! | `treehole review "<course>" [teachers]` | Aggregate course reviews, compare teachers |
//! | `treehole serve` | Start the SSE web server |
//!
//! ## Examples
//!
//! ```bash
//! # Let the model pick the keywords
//! treehole ask "计算机网络这门课给分怎么样"
//!
//! # Search one keyword yourself
//! treehole search "计网" "期末考试难吗"
//!
//! # Course review, comparing two teachers
//! treehole review "计算机网络" "zhx, yyx"
//!
//! # Web front-end
//! treehole serve --config ./config/treehole.toml
//! ```
//!
//! Credentials come from the environment: `TREEHOLE_TOKEN` for the
//! forum, `DEEPSEEK_API_KEY` for the LLM.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use treehole_agent::{agent, config, server};

/// Treehole assistant — retrieval-augmented Q&A over an anonymous
/// campus forum.
///
/// All commands accept a `--config` flag pointing to a TOML
/// configuration file. See `config/treehole.example.toml` for a full
/// example.
#[derive(Parser)]
#[command(
    name = "treehole",
    about = "Treehole assistant — retrieval-augmented Q&A over an anonymous campus forum",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/treehole.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question with LLM-directed iterative search.
    ///
    /// The model proposes keywords, judges after each pass whether the
    /// retrieved posts suffice, and refines until the iteration budget
    /// runs out.
    Ask {
        /// The question to answer.
        question: String,
    },

    /// Answer a question from a single keyword search.
    Search {
        /// The forum search keyword.
        keyword: String,

        /// The question to answer; defaults to the keyword itself.
        question: Option<String>,
    },

    /// Analyze course reviews, optionally comparing teachers.
    ///
    /// With more than one teacher the assistant searches per teacher
    /// and produces a side-by-side comparison.
    Review {
        /// Course name as it appears in forum posts.
        course: String,

        /// Teacher names, separated by commas or spaces.
        #[arg(default_value = "")]
        teachers: String,
    },

    /// Start the SSE web server.
    ///
    /// Exposes `POST /api/query` streaming answers as server-sent
    /// events, for browser front-ends.
    Serve,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "warn".into()))
        .init();

    let cli = Cli::parse();
    let config = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Ask { question } => agent::run_ask(&config, &question).await,
        Commands::Search { keyword, question } => {
            let question = question.unwrap_or_else(|| keyword.clone());
            agent::run_search(&config, &keyword, &question).await
        }
        Commands::Review { course, teachers } => {
            agent::run_review(&config, &course, &teachers).await
        }
        Commands::Serve => server::run_server(&config).await,
    }
}
