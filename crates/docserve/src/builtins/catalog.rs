use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use moka::sync::Cache;
use serde::Serialize;

use crate::error::{CoreError, CoreResult};

use super::search::fuzzy_score;

const BODY_CACHE_CAPACITY: u64 = 256;
const BODY_CACHE_TTL: Duration = Duration::from_secs(300);

/// One markdown document in the docs directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocEntry {
    /// Path relative to the docs root, without extension, `/`-separated.
    pub name: String,
    pub title: String,
    #[serde(skip)]
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    #[serde(flatten)]
    pub entry: DocEntry,
    pub score: i64,
}

/// Index of the markdown files under a docs directory.
pub struct DocCatalog {
    root: PathBuf,
    entries: Vec<DocEntry>,
    bodies: Cache<String, Arc<String>>,
}

impl DocCatalog {
    pub fn empty() -> Self {
        Self::with_entries(PathBuf::new(), Vec::new())
    }

    fn with_entries(root: PathBuf, entries: Vec<DocEntry>) -> Self {
        let bodies = Cache::builder()
            .max_capacity(BODY_CACHE_CAPACITY)
            .time_to_live(BODY_CACHE_TTL)
            .build();
        Self {
            root,
            entries,
            bodies,
        }
    }

    /// Scans `root` recursively for `*.md` files. A missing directory yields
    /// an empty catalog.
    pub fn scan(root: impl Into<PathBuf>) -> CoreResult<Self> {
        let root = root.into();
        if !root.is_dir() {
            tracing::warn!("docs directory {} not found, serving no documents", root.display());
            return Ok(Self::with_entries(root, Vec::new()));
        }

        let pattern = root.join("**").join("*.md");
        let pattern = pattern.to_str().ok_or_else(|| {
            CoreError::Config(format!("docs directory is not valid UTF-8: {}", root.display()))
        })?;
        let paths = glob::glob(pattern)
            .map_err(|error| CoreError::Config(format!("invalid docs pattern: {error}")))?;

        let mut entries = Vec::new();
        for path in paths {
            let path = match path {
                Ok(path) => path,
                Err(error) => {
                    tracing::warn!("skipping unreadable docs entry: {}", error);
                    continue;
                }
            };
            let Some(name) = doc_name(&root, &path) else {
                continue;
            };
            let title = std::fs::read_to_string(&path)
                .ok()
                .and_then(|content| first_heading(&content))
                .unwrap_or_else(|| name.clone());
            entries.push(DocEntry { name, title, path });
        }
        entries.sort_by(|left, right| left.name.cmp(&right.name));
        tracing::info!(documents = entries.len(), "scanned {}", root.display());
        Ok(Self::with_entries(root, entries))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn entries(&self) -> &[DocEntry] {
        &self.entries
    }

    /// Looks a document up by name, falling back to a case-insensitive match.
    pub fn find(&self, name: &str) -> Option<&DocEntry> {
        let name = name.trim().trim_end_matches(".md");
        self.entries
            .iter()
            .find(|entry| entry.name == name)
            .or_else(|| {
                self.entries
                    .iter()
                    .find(|entry| entry.name.eq_ignore_ascii_case(name))
            })
    }

    /// Markdown body of a document, memoized.
    pub fn read(&self, entry: &DocEntry) -> CoreResult<Arc<String>> {
        if let Some(body) = self.bodies.get(&entry.name) {
            return Ok(body);
        }
        let body = Arc::new(std::fs::read_to_string(&entry.path)?);
        self.bodies.insert(entry.name.clone(), body.clone());
        Ok(body)
    }

    /// Fuzzy search over names and titles, best match first.
    pub fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        let mut hits: Vec<SearchHit> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let by_name = fuzzy_score(query, &entry.name);
                let by_title = fuzzy_score(query, &entry.title);
                let score = by_name.max(by_title)?;
                Some(SearchHit {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|left, right| {
            right
                .score
                .cmp(&left.score)
                .then_with(|| left.entry.name.cmp(&right.entry.name))
        });
        hits.truncate(limit);
        hits
    }
}

fn doc_name(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?.with_extension("");
    let parts: Vec<String> = relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect();
    (!parts.is_empty()).then(|| parts.join("/"))
}

fn first_heading(content: &str) -> Option<String> {
    content
        .lines()
        .map(str::trim)
        .find_map(|line| line.strip_prefix("# "))
        .map(|title| title.trim().to_string())
        .filter(|title| !title.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn write_docs(root: &Path) {
        std::fs::create_dir_all(root.join("forms")).unwrap();
        std::fs::write(root.join("button.md"), "# Button\n\nClickable control.\n").unwrap();
        std::fs::write(root.join("forms/text-field.md"), "intro\n# Text Field\nSingle line input.\n").unwrap();
        std::fs::write(root.join("notes.txt"), "not markdown").unwrap();
        std::fs::write(root.join("untitled.md"), "no heading here").unwrap();
    }

    #[test]
    fn scans_markdown_with_titles() {
        let dir = tempdir().unwrap();
        write_docs(dir.path());
        let catalog = DocCatalog::scan(dir.path()).unwrap();

        let names: Vec<&str> = catalog.entries().iter().map(|entry| entry.name.as_str()).collect();
        assert_eq!(names, vec!["button", "forms/text-field", "untitled"]);
        assert_eq!(catalog.entries()[1].title, "Text Field");
        assert_eq!(catalog.entries()[2].title, "untitled");
    }

    #[test]
    fn missing_directory_is_empty() {
        let dir = tempdir().unwrap();
        let catalog = DocCatalog::scan(dir.path().join("nope")).unwrap();
        assert!(catalog.entries().is_empty());
    }

    #[test]
    fn read_is_cached_after_first_load() {
        let dir = tempdir().unwrap();
        write_docs(dir.path());
        let catalog = DocCatalog::scan(dir.path()).unwrap();
        let entry = catalog.find("Button.md").unwrap().clone();

        let first = catalog.read(&entry).unwrap();
        std::fs::write(dir.path().join("button.md"), "# Changed").unwrap();
        let second = catalog.read(&entry).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(second.contains("Clickable control"));
    }

    #[test]
    fn search_ranks_and_limits() {
        let dir = tempdir().unwrap();
        write_docs(dir.path());
        let catalog = DocCatalog::scan(dir.path()).unwrap();

        let hits = catalog.search("textfield", 10);
        assert_eq!(hits[0].entry.name, "forms/text-field");

        let hits = catalog.search("t", 1);
        assert_eq!(hits.len(), 1);
        assert!(catalog.search("zzz", 10).is_empty());
    }
}
