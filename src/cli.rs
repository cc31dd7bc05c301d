use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "knowbase",
    about = "Chunk, embed and search your documents, and answer questions from them"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the embedding provider (hashing, colbert, openai)
    #[arg(long, global = true)]
    pub embedder: Option<String>,

    /// Override the embedding model id
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Add files, or every supported file under a directory
    Add(AddArgs),
    /// Add a document from literal text (or stdin with `-`)
    AddText(AddTextArgs),
    /// Remove a document and rebuild the index
    Remove(RemoveArgs),
    /// List documents
    List(ListArgs),
    /// Show a document and its chunks
    Show(ShowArgs),
    /// Find the passages closest to a query
    Search(SearchArgs),
    /// Answer a question from the closest passages
    Ask(AskArgs),
    /// Re-embed every stored chunk and rebuild the index
    Rebuild,
    /// Show knowledge base statistics
    Status(StatusArgs),
    /// Manage persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Start MCP server for AI agent integration
    Mcp,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ingestion --

#[derive(Debug, Parser)]
pub struct AddArgs {
    /// Files or directories to add
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// Document name (only with a single file)
    #[arg(long)]
    pub name: Option<String>,

    /// Only add files whose path relative to a directory matches this glob
    #[arg(long)]
    pub glob: Option<String>,
}

#[derive(Debug, Parser)]
pub struct AddTextArgs {
    /// Document name
    pub name: String,

    /// Document text, or `-` to read stdin
    pub text: String,
}

#[derive(Debug, Parser)]
pub struct RemoveArgs {
    /// Document id (e.g. #00002a)
    pub doc_id: String,
}

// -- Inspection --

#[derive(Debug, Parser)]
pub struct ListArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct ShowArgs {
    /// Document id (e.g. #00002a)
    pub doc_id: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Retrieval --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of results to return (defaults to the top_k setting)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Only search these documents (repeatable)
    #[arg(long = "doc")]
    pub docs: Vec<String>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question
    pub query: String,

    /// Number of passages to answer from (defaults to the top_k setting)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Only use these documents (repeatable)
    #[arg(long = "doc")]
    pub docs: Vec<String>,

    /// Output the answer and its sources as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show the resolved settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting
    Set {
        /// Setting key
        key: String,
        /// Setting value
        value: String,
    },
    /// Clear a stored setting (revert to default)
    Unset {
        /// Setting key
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(
            self.shell,
            &mut cmd,
            "knowbase",
            &mut std::io::stdout(),
        );
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn parse_search_defaults() {
        let cli = Cli::parse_from(["knowbase", "search", "hello"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.query, "hello");
                assert_eq!(args.count, None);
                assert!(args.docs.is_empty());
                assert!(!args.json);
            }
            _ => panic!("expected search command"),
        }
    }

    #[test]
    fn parse_repeated_doc_filters() {
        let cli = Cli::parse_from([
            "knowbase", "ask", "why?", "-n", "5", "--doc", "#000001", "--doc", "2",
        ]);
        match cli.command {
            Command::Ask(args) => {
                assert_eq!(args.count, Some(5));
                assert_eq!(args.docs, vec!["#000001", "2"]);
            }
            _ => panic!("expected ask command"),
        }
    }

    #[test]
    fn add_requires_a_path() {
        assert!(Cli::try_parse_from(["knowbase", "add"]).is_err());
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::parse_from([
            "knowbase", "list", "--embedder", "hashing", "--data-dir", "/tmp/kb", "-vv",
        ]);
        assert_eq!(cli.embedder.as_deref(), Some("hashing"));
        assert_eq!(cli.data_dir, Some(PathBuf::from("/tmp/kb")));
        assert_eq!(cli.verbose, 2);
        assert!(matches!(cli.command, Command::List(_)));
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }
}
