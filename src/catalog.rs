//! Where template files come from.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use walkdir::WalkDir;

/// Resolves and reads template files. Shared by every invocation, so
/// implementations must be safe to call from many tasks at once.
pub trait Catalog: Send + Sync {
    /// Expand `paths` (files or directories, relative to the catalog root
    /// unless absolute) into template files. An empty slice means
    /// everything the catalog holds.
    fn resolve(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>>;

    fn read(&self, path: &Path) -> Result<String>;
}

/// A directory tree of `.yaml`/`.yml` files.
#[derive(Debug, Clone)]
pub struct DirCatalog {
    root: PathBuf,
}

impl DirCatalog {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn is_template(path: &Path) -> bool {
        matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml" | "yml")
        )
    }

    fn walk(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
        for entry in WalkDir::new(dir).follow_links(true).sort_by_file_name() {
            let entry = entry.with_context(|| format!("failed to walk {}", dir.display()))?;
            if entry.file_type().is_file() && Self::is_template(entry.path()) {
                out.push(entry.into_path());
            }
        }
        Ok(())
    }
}

impl Catalog for DirCatalog {
    fn resolve(&self, paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        if paths.is_empty() {
            Self::walk(&self.root, &mut files)?;
            return Ok(files);
        }

        for path in paths {
            let full = if path.is_absolute() {
                path.clone()
            } else {
                self.root.join(path)
            };
            if full.is_dir() {
                Self::walk(&full, &mut files)?;
            } else if full.is_file() {
                files.push(full);
            } else {
                bail!("template path not found: {}", full.display());
            }
        }
        files.sort();
        files.dedup();
        Ok(files)
    }

    fn read(&self, path: &Path) -> Result<String> {
        std::fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog_with(files: &[&str]) -> (tempfile::TempDir, DirCatalog) {
        let dir = tempfile::tempdir().unwrap();
        for name in files {
            let path = dir.path().join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, "id: x").unwrap();
        }
        let catalog = DirCatalog::new(dir.path());
        (dir, catalog)
    }

    #[test]
    fn resolves_everything_when_no_paths_given() {
        let (_dir, catalog) = catalog_with(&["a.yaml", "nested/b.yml", "README.md"]);
        let files = catalog.resolve(&[]).unwrap();
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|f| DirCatalog::is_template(f)));
    }

    #[test]
    fn resolves_relative_dirs_and_files() {
        let (_dir, catalog) = catalog_with(&["cves/one.yaml", "cves/two.yaml", "misc/three.yaml"]);
        let files = catalog
            .resolve(&[PathBuf::from("cves"), PathBuf::from("misc/three.yaml")])
            .unwrap();
        assert_eq!(files.len(), 3);
    }

    #[test]
    fn overlapping_paths_are_deduplicated() {
        let (_dir, catalog) = catalog_with(&["cves/one.yaml"]);
        let files = catalog
            .resolve(&[PathBuf::from("cves"), PathBuf::from("cves/one.yaml")])
            .unwrap();
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn missing_path_is_an_error() {
        let (_dir, catalog) = catalog_with(&[]);
        let err = catalog.resolve(&[PathBuf::from("nope")]).unwrap_err();
        assert!(err.to_string().contains("template path not found"));
    }

    #[test]
    fn read_returns_contents() {
        let (dir, catalog) = catalog_with(&["a.yaml"]);
        let body = catalog.read(&dir.path().join("a.yaml")).unwrap();
        assert_eq!(body, "id: x");
    }
}
