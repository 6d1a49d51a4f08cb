use anyhow::{Context, Result};
use clap::Parser;
use rb_finder::cli::{Cli, Commands, OutputFormat};
use rb_finder::config::{EngineConfig, resolve_index_dir, resolve_root};
use rb_finder::editor::open_in_editor;
use rb_finder::engine::Engine;
use rb_finder::error::{IndexError, is_index_missing};
use rb_finder::model::SymbolKind;
use rb_finder::query::{MatchKind, SearchHit};
use rb_finder::watch::{LockState, WatchLock, install_shutdown_handler, watch_until_cancelled};
use serde::Serialize;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let cli = parse_cli();
    init_tracing(&cli);

    match cli.command.clone() {
        Commands::Build => {
            let engine = open_engine(&cli)?;
            ensure_no_watcher(&engine)?;
            print_json(&engine.build()?)?;
        }
        Commands::Update => {
            let engine = open_engine(&cli)?;
            ensure_no_watcher(&engine)?;
            print_json(&engine.update()?)?;
        }
        Commands::Search {
            query,
            kind,
            limit,
            format,
            open,
        } => {
            let engine = open_engine(&cli)?;
            let hits = search(&engine, &query, kind.map(SymbolKind::from), limit)?;
            write_search_output(&hits, format)?;
            if open && let Some(first) = hits.first() {
                open_in_editor(&engine.root().join(&first.record.file), first.record.line)?;
            }
        }
        Commands::Status => {
            let engine = open_engine(&cli)?;
            print_json(&engine.status()?)?;
        }
        Commands::Watch { debounce_ms } => {
            let engine = open_engine(&cli)?;
            let cancel = install_shutdown_handler()?;
            let stats = watch_until_cancelled(
                &engine,
                Duration::from_millis(debounce_ms),
                cancel,
                |initial| print_json(initial),
            )?;
            print_json(&stats)?;
        }
        Commands::Clear => {
            let engine = open_engine(&cli)?;
            ensure_no_watcher(&engine)?;
            engine.clear()?;
            print_json(&serde_json::json!({
                "cleared": engine.store().layout().dir().to_string_lossy(),
            }))?;
        }
    }

    Ok(())
}

fn parse_cli() -> Cli {
    let args: Vec<String> = std::env::args().collect();
    Cli::parse_from(rewrite_args_for_implicit_search(args))
}

/// `rb-finder User` is shorthand for `rb-finder search User`.
fn rewrite_args_for_implicit_search(mut args: Vec<String>) -> Vec<String> {
    if args.len() <= 1 {
        return args;
    }

    let subcommands = ["build", "update", "search", "status", "watch", "clear", "help"];
    let valued = ["--root", "--index-dir", "--workers", "--timeout-ms"];

    let mut idx = 1usize;
    while idx < args.len() {
        let a = args[idx].as_str();
        if a == "--" {
            idx += 1;
            break;
        }
        if valued.contains(&a) {
            idx += 2;
            continue;
        }
        if a.starts_with('-') {
            idx += 1;
            continue;
        }
        break;
    }

    if idx < args.len() && !subcommands.contains(&args[idx].as_str()) {
        args.insert(idx, "search".to_string());
    }

    args
}

fn init_tracing(cli: &Cli) {
    let default = if cli.verbose {
        "warn,rb_finder=debug"
    } else if cli.quiet {
        "error"
    } else {
        "warn,rb_finder=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn open_engine(cli: &Cli) -> Result<Engine> {
    let root = resolve_root(cli)?;
    let index_dir = resolve_index_dir(cli, &root);
    Engine::open(root, index_dir, EngineConfig::resolve(cli))
}

/// Writers refuse to run while a live watcher owns the index directory.
fn ensure_no_watcher(engine: &Engine) -> Result<()> {
    let lock = engine.store().layout().lock_path();
    match WatchLock::probe(&lock)? {
        LockState::Held { pid } => Err(IndexError::WatcherActive { pid, lock }.into()),
        LockState::Stale { .. } => {
            WatchLock::remove_stale(&lock)?;
            Ok(())
        }
        LockState::Free => Ok(()),
    }
}

fn search(
    engine: &Engine,
    query: &str,
    kind: Option<SymbolKind>,
    limit: Option<usize>,
) -> Result<Vec<SearchHit>> {
    let mut hits = match engine.search(query, kind) {
        Ok(hits) => hits,
        Err(e) if is_index_missing(&e) => {
            warn!("{e}");
            Vec::new()
        }
        Err(e) => return Err(e),
    };
    if let Some(n) = limit {
        hits.truncate(n);
    }
    Ok(hits)
}

fn write_search_output(hits: &[SearchHit], format: OutputFormat) -> Result<()> {
    let content = match format {
        OutputFormat::Json => serde_json::to_string_pretty(hits)?,
        OutputFormat::Text => {
            let mut out = String::new();
            for hit in hits {
                let tag = match hit.match_kind {
                    MatchKind::Exact => "exact",
                    MatchKind::Prefix => "prefix",
                };
                out.push_str(&format!(
                    "{}:{}\t{}\t{}\t{tag}\n",
                    hit.record.file,
                    hit.record.line,
                    hit.record.kind,
                    hit.record.display_name()
                ));
            }
            out
        }
    };

    print!("{content}");
    if !content.ends_with('\n') {
        println!();
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("Failed to serialise output")?;
    println!("{json}");
    Ok(())
}
