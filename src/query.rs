use serde::Serialize;
use std::collections::HashSet;
use std::ops::Bound;

use crate::model::{SymbolIndex, SymbolKind, SymbolRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Prefix,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub record: SymbolRecord,
    #[serde(rename = "match")]
    pub match_kind: MatchKind,
}

pub struct QueryEngine<'a> {
    index: &'a SymbolIndex,
}

impl<'a> QueryEngine<'a> {
    pub fn new(index: &'a SymbolIndex) -> Self {
        Self { index }
    }

    /// Exact bucket first, then every bucket whose name starts with `query`;
    /// filtered by kind, de-duplicated on `(file, line)` keeping the first
    /// occurrence, and sorted by `(file, line)`.
    pub fn search(&self, query: &str, kind: Option<SymbolKind>) -> Vec<SearchHit> {
        let exact = self
            .index
            .symbols
            .get(query)
            .into_iter()
            .flatten()
            .map(|r| (r, MatchKind::Exact));

        // names are kept sorted, so the prefix matches form one contiguous run
        let prefixed = self
            .index
            .symbols
            .range::<str, _>((Bound::Excluded(query), Bound::Unbounded))
            .take_while(|(name, _)| name.starts_with(query))
            .flat_map(|(_, bucket)| bucket.iter())
            .map(|r| (r, MatchKind::Prefix));

        let mut seen: HashSet<(&str, u32)> = HashSet::new();
        let mut hits: Vec<SearchHit> = exact
            .chain(prefixed)
            .filter(|(r, _)| kind.is_none_or(|k| r.kind == k))
            .filter(|(r, _)| seen.insert((r.file.as_str(), r.line)))
            .map(|(r, match_kind)| SearchHit {
                record: r.clone(),
                match_kind,
            })
            .collect();

        hits.sort_by(|a, b| {
            a.record
                .file
                .cmp(&b.record.file)
                .then(a.record.line.cmp(&b.record.line))
        });
        hits
    }
}
