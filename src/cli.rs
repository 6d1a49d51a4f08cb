use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::model::SymbolKind;

#[derive(Debug, Clone, Parser)]
#[command(name = "rb-finder", version)]
#[command(about = "Index Ruby definitions and search them by exact name or prefix")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Corpus root (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub root: Option<PathBuf>,

    /// Index directory (defaults to <root>/.rb-finder)
    #[arg(long, global = true, value_name = "DIR")]
    pub index_dir: Option<PathBuf>,

    #[arg(long, global = true, value_name = "N")]
    pub workers: Option<usize>,

    /// Per-file extraction timeout
    #[arg(long, global = true, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Compare content hashes even when mtime and size are unchanged
    #[arg(long, global = true)]
    pub always_hash: bool,

    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Rebuild the whole index
    Build,
    /// Re-index only files that changed since the last snapshot
    Update,
    Search {
        query: String,

        #[arg(short = 't', long = "type", value_enum)]
        kind: Option<KindFilter>,

        #[arg(short = 'n', long, value_name = "N")]
        limit: Option<usize>,

        #[arg(short = 'f', long, value_enum, default_value_t = OutputFormat::Json)]
        format: OutputFormat,

        /// Open the first hit in $VISUAL / $EDITOR
        #[arg(long)]
        open: bool,
    },
    Status,
    /// Keep the index updated while files change
    Watch {
        #[arg(long, value_name = "MS", default_value_t = 300)]
        debounce_ms: u64,
    },
    Clear,
}

#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum OutputFormat {
    Json,
    Text,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum KindFilter {
    Class,
    Module,
    Method,
    Constant,
    Scope,
}

impl From<KindFilter> for SymbolKind {
    fn from(value: KindFilter) -> Self {
        match value {
            KindFilter::Class => SymbolKind::Class,
            KindFilter::Module => SymbolKind::Module,
            KindFilter::Method => SymbolKind::Method,
            KindFilter::Constant => SymbolKind::Constant,
            KindFilter::Scope => SymbolKind::Scope,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_options_parse_after_subcommand() {
        let cli = Cli::parse_from([
            "rb-finder",
            "search",
            "Us",
            "--type",
            "class",
            "--index-dir",
            "/tmp/idx",
        ]);
        assert_eq!(cli.index_dir, Some(PathBuf::from("/tmp/idx")));
        match cli.command {
            Commands::Search { query, kind, .. } => {
                assert_eq!(query, "Us");
                assert_eq!(kind, Some(KindFilter::Class));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
