//! Removal of generated build and deploy artifacts.

use crate::error::Result;
use crate::paths;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Delete recipes, output directories, generated proxy sources, caches and
/// deploy files from `root`. Registry documents and the work directory are
/// left alone. Returns what was removed, sorted.
pub fn clean(root: &Path) -> Result<Vec<PathBuf>> {
    let mut targets: Vec<PathBuf> = [
        paths::PROXY_SOURCE_DIR,
        paths::CACHE_DIR,
        paths::CHART_VALUES_FILE,
        paths::BOOTSTRAP_FILE,
        paths::INSTALL_FILE,
    ]
    .iter()
    .map(|name| root.join(name))
    .collect();

    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let is_dir = entry.file_type()?.is_dir();
        if is_recipe(name) && !is_dir || is_output_dir(name) && is_dir {
            targets.push(entry.path());
        }
    }

    let mut removed = Vec::new();
    for path in targets {
        if crate::io::remove_path(&path)? {
            debug!(path = %path.display(), "removed");
            removed.push(path);
        }
    }
    removed.sort();
    Ok(removed)
}

fn is_recipe(name: &str) -> bool {
    name.strip_prefix("build-")
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|component| !component.is_empty())
}

fn is_output_dir(name: &str) -> bool {
    name.strip_suffix("-out").is_some_and(|c| !c.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn removes_generated_files_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        for file in [
            "build-proxy.json",
            "build-control-plane.json",
            "chart-values.yaml",
            "bootstrap.yaml",
            "install.yaml",
            "features.json",
            "repositories.json",
            "plugforge.json",
            "notes-out",
        ] {
            std::fs::write(root.join(file), "{}").unwrap();
        }
        for d in ["proxy-out", "control-plane-out", "proxy", "cache/proxy", "repositories/gloo"] {
            std::fs::create_dir_all(root.join(d)).unwrap();
        }

        let removed = clean(root).unwrap();
        assert_eq!(removed.len(), 9);

        for kept in ["features.json", "repositories.json", "plugforge.json", "repositories/gloo", "notes-out"] {
            assert!(root.join(kept).exists(), "{kept} should survive");
        }
        for gone in ["build-proxy.json", "proxy-out", "proxy", "cache", "install.yaml"] {
            assert!(!root.join(gone).exists(), "{gone} should be removed");
        }
    }

    #[test]
    fn clean_on_clean_root_is_noop() {
        let dir = TempDir::new().unwrap();
        assert!(clean(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn name_matching() {
        assert!(is_recipe("build-proxy.json"));
        assert!(!is_recipe("build-.json"));
        assert!(!is_recipe("features.json"));
        assert!(is_output_dir("proxy-out"));
        assert!(!is_output_dir("-out"));
    }
}
