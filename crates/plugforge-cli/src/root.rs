use plugforge_core::paths;
use std::path::{Path, PathBuf};

/// Resolve the project root.
///
/// An explicit `--root` / `PLUGFORGE_ROOT` wins. Otherwise walk upward from
/// the working directory to the first directory holding `plugforge.json`,
/// falling back to the working directory itself (where `init` creates one).
pub fn resolve_root(explicit: Option<&Path>) -> PathBuf {
    if let Some(p) = explicit {
        return p.to_path_buf();
    }
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
    find_project(&cwd).unwrap_or(cwd)
}

fn find_project(start: &Path) -> Option<PathBuf> {
    start
        .ancestors()
        .find(|dir| dir.join(paths::CONFIG_FILE).is_file())
        .map(Path::to_path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn explicit_root_wins() {
        let dir = TempDir::new().unwrap();
        assert_eq!(resolve_root(Some(dir.path())), dir.path());
    }

    #[test]
    fn finds_config_in_ancestor() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(paths::CONFIG_FILE), "{}").unwrap();
        let nested = dir.path().join("a/b");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project(&nested).as_deref(), Some(dir.path()));
    }

    #[test]
    fn no_config_anywhere() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("x");
        std::fs::create_dir_all(&nested).unwrap();
        // A stray plugforge.json above the temp dir would be found; the temp
        // dir itself has none.
        let found = find_project(&nested);
        assert!(found.map_or(true, |p| !p.starts_with(dir.path())));
    }
}
