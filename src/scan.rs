use anyhow::Result;
use ignore::WalkBuilder;
use std::path::{Component, Path};
use std::sync::mpsc;

pub const SOURCE_EXTENSION: &str = "rb";

const IGNORED_PREFIXES: [&str; 2] = ["vendor/", "tmp/"];

pub fn scan_sources(root: &Path) -> Result<Vec<String>> {
    let (tx, rx) = mpsc::channel();

    let filter_root = root.to_path_buf();
    let walker = WalkBuilder::new(root)
        .hidden(true)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .filter_entry(move |entry| match relative_path(&filter_root, entry.path()) {
            Some(rel) if !rel.is_empty() => !is_ignored_dir(&format!("{rel}/")),
            _ => true,
        })
        .build_parallel();

    walker.run(|| {
        let tx = tx.clone();
        let root = root.to_path_buf();
        Box::new(move |entry| {
            if let Ok(entry) = entry
                && entry.file_type().is_some_and(|t| t.is_file())
                && let Some(rel) = relative_path(&root, entry.path())
                && is_indexable(&rel)
            {
                let _ = tx.send(rel);
            }
            ignore::WalkState::Continue
        })
    });

    drop(tx);
    let mut files: Vec<String> = rx.iter().collect();
    files.sort();
    files.dedup();
    Ok(files)
}

pub fn is_indexable(rel: &str) -> bool {
    if rel.is_empty() || is_ignored_dir(rel) {
        return false;
    }
    if rel.split('/').any(|segment| segment.starts_with('.')) {
        return false;
    }
    Path::new(rel)
        .extension()
        .is_some_and(|e| e == SOURCE_EXTENSION)
}

fn is_ignored_dir(rel: &str) -> bool {
    let lower = rel.to_ascii_lowercase();
    IGNORED_PREFIXES.iter().any(|p| lower.starts_with(p))
}

/// `path` relative to `root` with `/` separators. Accepts already-relative
/// paths; returns `None` for paths outside `root` or containing `..`.
pub fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = if path.is_absolute() {
        path.strip_prefix(root).ok()?
    } else {
        path
    };

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn touch(root: &Path, rel: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, "class A; end\n").unwrap();
    }

    #[test]
    fn scan_skips_hidden_vendor_and_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(root, "app/models/user.rb");
        touch(root, "lib/tasks/seed.rb");
        touch(root, "README.md");
        touch(root, ".hidden/x.rb");
        touch(root, "app/.secret.rb");
        touch(root, "Vendor/bundle/gem.rb");
        touch(root, "TMP/cache.rb");
        touch(root, "lib/vendor/kept.rb");

        let files = scan_sources(root).unwrap();
        assert_eq!(
            files,
            vec![
                "app/models/user.rb".to_string(),
                "lib/tasks/seed.rb".to_string(),
                "lib/vendor/kept.rb".to_string(),
            ]
        );
    }

    #[test]
    fn is_indexable_filters_batches() {
        assert!(is_indexable("app/models/user.rb"));
        assert!(!is_indexable("app/models/user.erb"));
        assert!(!is_indexable("vendor/x.rb"));
        assert!(!is_indexable("tmp/x.rb"));
        assert!(!is_indexable(".git/x.rb"));
    }

    #[test]
    fn relative_path_rejects_outside_root() {
        let root = Path::new("/srv/app");
        assert_eq!(
            relative_path(root, Path::new("/srv/app/lib/a.rb")).as_deref(),
            Some("lib/a.rb")
        );
        assert_eq!(relative_path(root, Path::new("/etc/passwd")), None);
        assert_eq!(
            relative_path(root, Path::new("./lib/a.rb")).as_deref(),
            Some("lib/a.rb")
        );
        assert_eq!(relative_path(root, Path::new("../a.rb")), None);
    }
}
