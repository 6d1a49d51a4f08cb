//! Data model shared by the extractor, the store and the query engine.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const INDEX_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolKind {
    Class,
    Module,
    Method,
    Constant,
    Scope,
}

impl SymbolKind {
    pub fn as_str(self) -> &'static str {
        match self {
            SymbolKind::Class => "class",
            SymbolKind::Module => "module",
            SymbolKind::Method => "method",
            SymbolKind::Constant => "constant",
            SymbolKind::Scope => "scope",
        }
    }
}

impl fmt::Display for SymbolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One definition site. Records are never patched: a changed file replaces
/// all of its records at once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SymbolRecord {
    pub kind: SymbolKind,
    pub name: String,
    /// Path relative to the indexed root, `/`-separated.
    pub file: String,
    pub line: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enclosing: Option<String>,
    /// Only ever true for `SymbolKind::Method`.
    #[serde(default)]
    pub class_level: bool,
}

impl SymbolRecord {
    pub fn display_name(&self) -> String {
        match (&self.enclosing, self.kind) {
            (Some(owner), SymbolKind::Method) if self.class_level => {
                format!("{owner}.{}", self.name)
            }
            (Some(owner), SymbolKind::Method) => format!("{owner}#{}", self.name),
            (Some(owner), _) => format!("{owner}::{}", self.name),
            (None, _) => self.name.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    /// Seconds since the Unix epoch.
    pub modified_at: u64,
    pub size_bytes: u64,
    pub content_hash: String,
}

pub type FileTable = BTreeMap<String, FileMetadata>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolIndex {
    pub version: u32,
    pub built_at: chrono::DateTime<chrono::Utc>,
    pub total_files: usize,
    pub total_symbols: usize,
    pub symbols: BTreeMap<String, Vec<SymbolRecord>>,
}

impl SymbolIndex {
    pub fn empty() -> Self {
        Self {
            version: INDEX_FORMAT_VERSION,
            built_at: chrono::Utc::now(),
            total_files: 0,
            total_symbols: 0,
            symbols: BTreeMap::new(),
        }
    }

    pub fn from_records(records: Vec<SymbolRecord>, total_files: usize) -> Self {
        let mut index = Self::empty();
        index.total_files = total_files;
        for record in records {
            index.symbols.entry(record.name.clone()).or_default().push(record);
        }
        index.normalize();
        index
    }

    pub fn records(&self) -> impl Iterator<Item = &SymbolRecord> {
        self.symbols.values().flatten()
    }

    pub fn normalize(&mut self) {
        self.symbols.retain(|_, bucket| !bucket.is_empty());
        for bucket in self.symbols.values_mut() {
            bucket.sort_by(|a, b| {
                a.file
                    .cmp(&b.file)
                    .then(a.line.cmp(&b.line))
                    .then(a.kind.cmp(&b.kind))
            });
            bucket.dedup();
        }
        self.total_symbols = self.symbols.values().map(Vec::len).sum();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileTableSnapshot {
    pub version: u32,
    pub files: FileTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildMetadata {
    pub last_built: chrono::DateTime<chrono::Utc>,
    pub tool_version: String,
    pub parser: String,
    pub parser_version: String,
}

impl BuildMetadata {
    pub fn current() -> Self {
        Self {
            last_built: chrono::Utc::now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            parser: "tree-sitter-ruby".to_string(),
            parser_version: format!("abi-{}", tree_sitter::LANGUAGE_VERSION),
        }
    }
}
