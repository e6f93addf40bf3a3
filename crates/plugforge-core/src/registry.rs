//! The feature/repository registry and its file-backed store.
//!
//! Repositories and features live in two independent documents
//! (`repositories.json`, `features.json`). Mutations run as a
//! read-modify-write under an advisory lock on `.plugforge.lock`; documents
//! touched by one mutation are staged and renamed together, and nothing is
//! written until the updated registry has passed validation.

use crate::document;
use crate::error::{ForgeError, Result};
use crate::feature::Feature;
use crate::paths;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Repository {
    pub url: String,
    pub commit: String,
}

impl Repository {
    pub fn new(url: impl Into<String>, commit: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            commit: commit.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegisterOutcome {
    Added,
    Updated,
}

#[derive(Serialize, Deserialize)]
struct RepositoriesDoc {
    repositories: Vec<Repository>,
}

#[derive(Serialize, Deserialize)]
struct FeaturesDoc {
    features: Vec<Feature>,
}

// ---------------------------------------------------------------------------
// Registry (in-memory aggregate)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registry {
    pub repositories: Vec<Repository>,
    pub features: Vec<Feature>,
}

impl Registry {
    /// Check the uniqueness and ownership invariants.
    pub fn validate(&self) -> Result<()> {
        let mut urls = HashSet::new();
        for repo in &self.repositories {
            if !urls.insert(repo.url.as_str()) {
                return Err(ForgeError::DuplicateRepository(repo.url.clone()));
            }
        }
        let mut names = HashSet::new();
        for feature in &self.features {
            if !names.insert(feature.name.as_str()) {
                return Err(ForgeError::DuplicateName(feature.name.clone()));
            }
            if !urls.contains(feature.source_repo.as_str()) {
                return Err(ForgeError::DanglingFeature {
                    name: feature.name.clone(),
                    repo: feature.source_repo.clone(),
                });
            }
        }
        Ok(())
    }

    pub fn repository(&self, url: &str) -> Option<&Repository> {
        self.repositories.iter().find(|r| r.url == url)
    }

    pub fn feature(&self, name: &str) -> Option<&Feature> {
        self.features.iter().find(|f| f.name == name)
    }

    /// Insert `repo`, or move an existing record with the same URL to the new
    /// commit. Returns true when an existing record was updated.
    pub fn upsert_repository(&mut self, repo: Repository) -> bool {
        match self.repositories.iter_mut().find(|r| r.url == repo.url) {
            Some(existing) => {
                existing.commit = repo.commit;
                true
            }
            None => {
                self.repositories.push(repo);
                false
            }
        }
    }

    /// Remove a repository and every feature it owns. Returns the removed
    /// features.
    pub fn remove_repository(&mut self, url: &str) -> Result<Vec<Feature>> {
        let before = self.repositories.len();
        self.repositories.retain(|r| r.url != url);
        if self.repositories.len() == before {
            return Err(ForgeError::RepositoryNotFound(url.to_string()));
        }
        let (removed, kept): (Vec<Feature>, Vec<Feature>) = std::mem::take(&mut self.features)
            .into_iter()
            .partition(|f| f.source_repo == url);
        self.features = kept;
        Ok(removed)
    }

    /// Replace every feature owned by `repo_url` with `features`.
    ///
    /// The new features take the position of the first feature the repository
    /// previously owned so the registry order (and the image tag derived from
    /// it) stays stable across updates.
    pub fn replace_features_for_repo(
        &mut self,
        repo_url: &str,
        mut features: Vec<Feature>,
    ) -> Result<()> {
        let owners: HashMap<&str, &str> = self
            .features
            .iter()
            .map(|f| (f.name.as_str(), f.source_repo.as_str()))
            .collect();

        let mut incoming = HashSet::new();
        for feature in &mut features {
            paths::validate_name(&feature.name)?;
            if !incoming.insert(feature.name.clone()) {
                return Err(ForgeError::DuplicateName(feature.name.clone()));
            }
            if let Some(owner) = owners.get(feature.name.as_str()) {
                if *owner != repo_url {
                    return Err(ForgeError::Conflict {
                        name: feature.name.clone(),
                        owner: owner.to_string(),
                    });
                }
            }
            feature.source_repo = repo_url.to_string();
        }

        let insert_at = self
            .features
            .iter()
            .position(|f| f.source_repo == repo_url)
            .unwrap_or(self.features.len());
        let before_count = self.features[..insert_at]
            .iter()
            .filter(|f| f.source_repo != repo_url)
            .count();
        self.features.retain(|f| f.source_repo != repo_url);
        let tail = self.features.split_off(before_count);
        self.features.extend(features);
        self.features.extend(tail);
        Ok(())
    }

    /// Set a feature's enabled flag. Returns true when the flag changed.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> Result<bool> {
        let feature = self
            .features
            .iter_mut()
            .find(|f| f.name == name)
            .ok_or_else(|| ForgeError::FeatureNotFound(name.to_string()))?;
        let changed = feature.enabled != enabled;
        feature.enabled = enabled;
        Ok(changed)
    }

    /// Enabled features in registry order.
    pub fn enabled_features(&self) -> Vec<Feature> {
        self.features.iter().filter(|f| f.enabled).cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// RegistryStore
// ---------------------------------------------------------------------------

/// File-backed registry rooted at a project directory.
#[derive(Debug, Clone)]
pub struct RegistryStore {
    root: PathBuf,
}

/// Held for the duration of a registry read or mutation; the advisory lock is
/// released when the file handle is dropped.
struct RegistryLock {
    _file: File,
}

impl RegistryStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create empty registry documents. Refuses to overwrite an existing
    /// registry.
    pub fn init(&self) -> Result<()> {
        let _lock = self.lock_exclusive()?;
        let repos = paths::repositories_path(&self.root);
        if repos.exists() {
            return Err(ForgeError::AlreadyInitialized(
                paths::REPOSITORIES_FILE.to_string(),
            ));
        }
        self.write(&Registry::default(), true, true)
    }

    // -- raw document access ------------------------------------------------

    pub fn load_repositories(&self) -> Result<Vec<Repository>> {
        let doc: document::Envelope<RepositoriesDoc> =
            document::read(&paths::repositories_path(&self.root))?;
        Ok(doc.payload.repositories)
    }

    /// Overwrite the repositories document.
    pub fn save_repositories(&self, repositories: &[Repository]) -> Result<()> {
        document::write(
            &paths::repositories_path(&self.root),
            RepositoriesDoc {
                repositories: repositories.to_vec(),
            },
        )
    }

    pub fn load_features(&self) -> Result<Vec<Feature>> {
        let doc: document::Envelope<FeaturesDoc> =
            document::read(&paths::features_path(&self.root))?;
        Ok(doc.payload.features)
    }

    /// Overwrite the features document.
    pub fn save_features(&self, features: &[Feature]) -> Result<()> {
        document::write(
            &paths::features_path(&self.root),
            FeaturesDoc {
                features: features.to_vec(),
            },
        )
    }

    // -- aggregate access ---------------------------------------------------

    /// Load and validate the whole registry.
    pub fn load(&self) -> Result<Registry> {
        let _lock = self.lock_shared()?;
        self.load_unlocked()
    }

    pub fn enabled_features(&self) -> Result<Vec<Feature>> {
        Ok(self.load()?.enabled_features())
    }

    pub fn upsert_repository(&self, repo: Repository) -> Result<bool> {
        self.mutate(true, false, |reg| Ok(reg.upsert_repository(repo)))
    }

    /// Delete a repository and cascade to its features. Returns the names of
    /// the removed features.
    pub fn remove_repository(&self, url: &str) -> Result<Vec<String>> {
        self.mutate(true, true, |reg| {
            let removed = reg.remove_repository(url)?;
            Ok(removed.into_iter().map(|f| f.name).collect())
        })
    }

    pub fn add_or_replace_features_for_repo(
        &self,
        repo_url: &str,
        features: Vec<Feature>,
    ) -> Result<()> {
        self.mutate(false, true, |reg| {
            reg.replace_features_for_repo(repo_url, features)
        })
    }

    /// Register (or re-register) a repository together with the features
    /// parsed from its manifest.
    pub fn register_repository(
        &self,
        repo: Repository,
        features: Vec<Feature>,
    ) -> Result<RegisterOutcome> {
        self.mutate(true, true, |reg| {
            let url = repo.url.clone();
            let updated = reg.upsert_repository(repo);
            reg.replace_features_for_repo(&url, features)?;
            Ok(if updated {
                RegisterOutcome::Updated
            } else {
                RegisterOutcome::Added
            })
        })
    }

    pub fn set_enabled(&self, name: &str, enabled: bool) -> Result<bool> {
        self.mutate(false, true, |reg| reg.set_enabled(name, enabled))
    }

    // -- internals ----------------------------------------------------------

    fn load_unlocked(&self) -> Result<Registry> {
        let registry = Registry {
            repositories: self.load_repositories()?,
            features: self.load_features()?,
        };
        registry.validate()?;
        Ok(registry)
    }

    fn mutate<T>(
        &self,
        repositories: bool,
        features: bool,
        f: impl FnOnce(&mut Registry) -> Result<T>,
    ) -> Result<T> {
        let _lock = self.lock_exclusive()?;
        let mut registry = self.load_unlocked()?;
        let out = f(&mut registry)?;
        registry.validate()?;
        self.write(&registry, repositories, features)?;
        Ok(out)
    }

    fn write(&self, registry: &Registry, repositories: bool, features: bool) -> Result<()> {
        let repos_path = paths::repositories_path(&self.root);
        let features_path = paths::features_path(&self.root);
        let repos_data = document::encode(RepositoriesDoc {
            repositories: registry.repositories.clone(),
        })?;
        let features_data = document::encode(FeaturesDoc {
            features: registry.features.clone(),
        })?;

        let mut files: Vec<(&Path, &[u8])> = Vec::with_capacity(2);
        if repositories {
            files.push((&repos_path, &repos_data));
        }
        if features {
            files.push((&features_path, &features_data));
        }
        debug!(files = files.len(), "writing registry");
        crate::io::atomic_write_all(&files)
    }

    fn lock_file(&self) -> Result<File> {
        crate::io::ensure_dir(&self.root)?;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(paths::lock_path(&self.root))?;
        Ok(file)
    }

    fn lock_exclusive(&self) -> Result<RegistryLock> {
        let file = self.lock_file()?;
        file.lock_exclusive()?;
        Ok(RegistryLock { _file: file })
    }

    fn lock_shared(&self) -> Result<RegistryLock> {
        let file = self.lock_file()?;
        file.lock_shared()?;
        Ok(RegistryLock { _file: file })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
