//! # rb-finder
//!
//! Incremental symbol index for Ruby codebases: classes, modules, methods,
//! constants and Rails scopes, searchable by exact name or prefix.
//!
//! ## Architecture
//!
//! - **scan**: corpus enumeration under the root
//! - **extract**: tree-sitter based symbol extraction, one file at a time
//! - **cache**: in-memory extraction cache keyed by path, mtime and size
//! - **pipeline**: bounded worker pool with per-file timeouts
//! - **store**: JSON snapshots of the index, file table and build metadata
//! - **incremental**: change detection and merge of partial rebuilds
//! - **query**: exact and prefix lookup
//! - **engine**: one instance per root, tying the pieces together
//! - **watch**: watch lock, debounced file watcher and the update loop
//! - **editor**: jump to a hit in `$VISUAL` / `$EDITOR`

pub mod cache;
pub mod cli;
pub mod config;
pub mod editor;
pub mod engine;
pub mod error;
pub mod extract;
pub mod fingerprint;
pub mod incremental;
pub mod model;
pub mod pipeline;
pub mod query;
pub mod scan;
pub mod store;
pub mod watch;
