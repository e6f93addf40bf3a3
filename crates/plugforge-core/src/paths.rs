use crate::error::{ForgeError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// File and directory constants
// ---------------------------------------------------------------------------

pub const TOOL_NAME: &str = "plugforge";

pub const CONFIG_FILE: &str = "plugforge.json";
pub const REPOSITORIES_FILE: &str = "repositories.json";
pub const FEATURES_FILE: &str = "features.json";
pub const ADDONS_FILE: &str = "addons.json";
pub const LOCK_FILE: &str = ".plugforge.lock";

/// Feature manifest shipped at the root of every plugin repository.
pub const MANIFEST_FILE: &str = "plugforge-features.json";

pub const DEFAULT_WORK_DIR: &str = "repositories";
pub const CACHE_DIR: &str = "cache";
pub const PROXY_SOURCE_DIR: &str = "proxy";

pub const CHART_VALUES_FILE: &str = "chart-values.yaml";
pub const BOOTSTRAP_FILE: &str = "bootstrap.yaml";
pub const INSTALL_FILE: &str = "install.yaml";

/// Mount point of the project root inside build containers.
pub const CONTAINER_ROOT: &str = "/plugforge";

// ---------------------------------------------------------------------------
// Path helpers
// ---------------------------------------------------------------------------

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

pub fn repositories_path(root: &Path) -> PathBuf {
    root.join(REPOSITORIES_FILE)
}

pub fn features_path(root: &Path) -> PathBuf {
    root.join(FEATURES_FILE)
}

pub fn addons_path(root: &Path) -> PathBuf {
    root.join(ADDONS_FILE)
}

pub fn lock_path(root: &Path) -> PathBuf {
    root.join(LOCK_FILE)
}

pub fn cache_dir(root: &Path, component: &str) -> PathBuf {
    root.join(CACHE_DIR).join(component)
}

pub fn output_dir(root: &Path, component: &str) -> PathBuf {
    root.join(format!("{component}-out"))
}

pub fn recipe_path(root: &Path, component: &str) -> PathBuf {
    root.join(format!("build-{component}.json"))
}

/// Translate a path under the project root into its location inside a build
/// container. Relative paths are taken to be relative to the root.
pub fn in_container(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    let rel = rel.to_string_lossy().replace('\\', "/");
    let rel = rel.trim_start_matches('/');
    if rel.is_empty() {
        CONTAINER_ROOT.to_string()
    } else {
        format!("{CONTAINER_ROOT}/{rel}")
    }
}

// ---------------------------------------------------------------------------
// Name validation
// ---------------------------------------------------------------------------

static NAME_RE: OnceLock<Regex> = OnceLock::new();

fn name_re() -> &'static Regex {
    NAME_RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._\-]*$").expect("name pattern is a valid regex")
    })
}

/// Feature, addon and component names end up in file names, container names
/// and image references, so they are restricted to a conservative alphabet.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > 64 || !name_re().is_match(name) {
        return Err(ForgeError::InvalidName(name.to_string()));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
