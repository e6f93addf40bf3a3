//! Fetching repositories into the work directory.
//!
//! URLs ending in `.git` are cloned with git and pinned to the requested
//! revision; other HTTP(S) URLs are downloaded as zip archives and expanded.

use crate::error::{ForgeError, Result};
use crate::runner::{CommandSpec, Runner};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

static GITHUB_RE: OnceLock<Regex> = OnceLock::new();

fn github_re() -> &'static Regex {
    GITHUB_RE.get_or_init(|| {
        Regex::new(r"^https://github\.com/([^/]+)/(.+)$").expect("github pattern is a valid regex")
    })
}

/// True when the URL can be fetched by either strategy.
pub fn supported_url(url: &str) -> bool {
    url.ends_with(".git") || url.starts_with("http://") || url.starts_with("https://")
}

/// Directory name a repository is checked out under: the last path segment
/// with its extension removed.
pub fn repo_dir(url: &str) -> String {
    let last = url.trim_end_matches('/').rsplit('/').next().unwrap_or(url);
    match last.rfind('.') {
        Some(idx) if idx > 0 => last[..idx].to_string(),
        _ => last.to_string(),
    }
}

/// Import path of a repository: scheme, credentials and `.git` removed.
pub fn package_path(url: &str) -> String {
    let mut pkg = url
        .strip_prefix("https://")
        .or_else(|| url.strip_prefix("http://"))
        .unwrap_or(url);
    if let Some(idx) = pkg.find('@') {
        pkg = &pkg[idx + 1..];
    }
    let pkg = pkg.strip_suffix(".git").unwrap_or(pkg);
    // scp-style `host:owner/repo`
    match pkg.split_once(':') {
        Some((host, rest)) if !host.contains('/') => format!("{host}/{rest}"),
        _ => pkg.to_string(),
    }
}

/// Archive location for an HTTP repository. GitHub web URLs are rewritten to
/// the zip archive of `revision`; anything else is used as-is.
pub fn archive_url(url: &str, revision: &str) -> String {
    match github_re().captures(url) {
        Some(caps) => {
            let repo = caps[2].trim_end_matches('/');
            let repo = repo.strip_suffix(".git").unwrap_or(repo);
            format!("https://github.com/{}/{repo}/archive/{revision}.zip", &caps[1])
        }
        None => url.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Downloader
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Downloader {
    runner: Runner,
    client: reqwest::Client,
}

impl Downloader {
    pub fn new(runner: Runner) -> Self {
        Self {
            runner,
            client: reqwest::Client::new(),
        }
    }

    /// Fetch `url` at `revision` into `destination`. Returns the directory
    /// holding the checked-out tree.
    pub async fn fetch(&self, url: &str, revision: &str, destination: &Path) -> Result<PathBuf> {
        if url.ends_with(".git") {
            self.with_git(url, revision, destination).await
        } else if url.starts_with("http://") || url.starts_with("https://") {
            self.with_http(url, revision, destination).await
        } else {
            Err(ForgeError::UnsupportedScheme(url.to_string()))
        }
    }

    async fn with_git(&self, url: &str, revision: &str, destination: &Path) -> Result<PathBuf> {
        let dir = repo_dir(url);
        let checkout = destination.join(&dir);
        info!(url, revision, "fetching repository with git");

        if !self.runner.is_dry_run() {
            crate::io::ensure_dir(destination)?;
            crate::io::remove_path(&checkout)?;
        }

        let vcs = |e: ForgeError| match e {
            ForgeError::Cancelled { .. } | ForgeError::BinaryNotFound { .. } => e,
            other => ForgeError::Vcs {
                url: url.to_string(),
                reason: other.to_string(),
            },
        };
        let git = |args: &[&str], cwd: &Path| -> CommandSpec {
            CommandSpec::new("git")
                .args(args.iter().copied())
                .current_dir(cwd)
        };

        self.runner
            .run(&git(&["clone", url, dir.as_str()], destination))
            .await
            .map_err(vcs)?;

        let reset = git(&["reset", "--hard", revision], &checkout);
        if let Err(e) = self.runner.run(&reset).await {
            if matches!(e, ForgeError::Cancelled { .. }) {
                return Err(e);
            }
            debug!(revision, "revision not reachable from clone, fetching it");
            let refspec = format!("{revision}:{revision}");
            self.runner
                .run(&git(&["fetch", "origin", refspec.as_str()], &checkout))
                .await
                .map_err(vcs)?;
            self.runner.run(&reset).await.map_err(vcs)?;
        }

        self.runner
            .run(&git(&["clean", "-xdf"], &checkout))
            .await
            .map_err(vcs)?;
        self.runner
            .run(&git(
                &["submodule", "update", "--init", "--checkout", "--force", "--recursive"],
                &checkout,
            ))
            .await
            .map_err(vcs)?;
        Ok(checkout)
    }

    async fn with_http(&self, url: &str, revision: &str, destination: &Path) -> Result<PathBuf> {
        let source = archive_url(url, revision);
        let parsed = reqwest::Url::parse(&source).map_err(|e| ForgeError::Download {
            url: source.clone(),
            reason: e.to_string(),
        })?;
        let filename = parsed
            .path_segments()
            .and_then(|mut s| s.next_back())
            .filter(|s| !s.is_empty())
            .unwrap_or("download.zip")
            .to_string();

        if self.runner.is_dry_run() {
            info!("[dry-run] download {source} into {}", destination.display());
            return Ok(destination.join(repo_dir(url)));
        }

        info!(url = %source, "downloading archive");
        crate::io::ensure_dir(destination)?;
        let archive = destination.join(&filename);

        let download = async {
            let fail = |e: reqwest::Error| ForgeError::Download {
                url: source.clone(),
                reason: e.to_string(),
            };
            let mut resp = self
                .client
                .get(parsed.clone())
                .send()
                .await
                .map_err(fail)?
                .error_for_status()
                .map_err(fail)?;
            let mut file = tokio::fs::File::create(&archive).await?;
            while let Some(chunk) = resp.chunk().await.map_err(fail)? {
                file.write_all(&chunk).await?;
            }
            file.flush().await?;
            Ok::<_, ForgeError>(())
        };
        tokio::select! {
            r = download => r?,
            _ = self.runner.cancel_token().cancelled() => {
                return Err(ForgeError::Cancelled { binary: "download".into() });
            }
        }

        let dest = destination.to_path_buf();
        let checkout = destination.join(repo_dir(url));
        tokio::task::spawn_blocking(move || unpack(&archive, &dest, &checkout))
            .await
            .map_err(|e| ForgeError::Download {
                url: source.clone(),
                reason: format!("archive expansion aborted: {e}"),
            })?
    }
}

/// Expand `archive` and move its contents to `checkout`, the same directory
/// a git checkout of the repository would use.
fn unpack(archive: &Path, destination: &Path, checkout: &Path) -> Result<PathBuf> {
    let name = checkout
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let staging = destination.join(format!(".{name}.unpack"));
    crate::io::remove_path(&staging)?;
    crate::io::remove_path(checkout)?;

    let root = expand_zip(archive, &staging)?;
    std::fs::rename(&root, checkout)?;
    if root != staging {
        crate::io::remove_path(&staging)?;
    }
    Ok(checkout.to_path_buf())
}

/// Expand a zip archive under `destination`, preserving unix modes.
///
/// Entries that would land outside `destination` are rejected. Returns the
/// archive's single top-level directory when it has one, else `destination`.
pub fn expand_zip(archive: &Path, destination: &Path) -> Result<PathBuf> {
    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    let mut top: Option<Option<PathBuf>> = None;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i)?;
        let rel = entry.enclosed_name().ok_or_else(|| ForgeError::Download {
            url: archive.display().to_string(),
            reason: format!("entry '{}' escapes the destination", entry.name()),
        })?;

        let first = rel.components().next().map(|c| PathBuf::from(c.as_os_str()));
        let nested = rel.components().count() > 1 || entry.is_dir();
        top = match top {
            None if nested => Some(first),
            Some(Some(t)) if nested && first.as_ref() == Some(&t) => Some(Some(t)),
            _ => Some(None),
        };

        let out = destination.join(&rel);
        if entry.is_dir() {
            std::fs::create_dir_all(&out)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut f = std::fs::File::create(&out)?;
        std::io::copy(&mut entry, &mut f)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode & 0o7777))?;
        }
    }

    Ok(match top.flatten() {
        Some(dir) => destination.join(dir),
        None => destination.to_path_buf(),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;
    use zip::write::SimpleFileOptions;

    fn downloader(dry_run: bool) -> Downloader {
        Downloader::new(Runner::new(false, dry_run, CancellationToken::new()))
    }

    fn zip_bytes(entries: &[(&str, &[u8], u32)]) -> Vec<u8> {
        let mut buf = std::io::Cursor::new(Vec::new());
        {
            let mut w = zip::ZipWriter::new(&mut buf);
            for (name, data, mode) in entries {
                let opts = SimpleFileOptions::default().unix_permissions(*mode);
                w.start_file(*name, opts).unwrap();
                w.write_all(data).unwrap();
            }
            w.finish().unwrap();
        }
        buf.into_inner()
    }

    #[test]
    fn url_helpers() {
        assert!(supported_url("git@github.com:acme/plugins.git"));
        assert!(supported_url("https://example.com/plugins.zip"));
        assert!(!supported_url("ftp://example.com/plugins"));

        assert_eq!(repo_dir("https://github.com/solo-io/gloo.git"), "gloo");
        assert_eq!(repo_dir("https://example.com/archive/plugins.zip"), "plugins");
        assert_eq!(repo_dir("https://example.com/plugins"), "plugins");

        assert_eq!(
            package_path("https://user@github.com/acme/plugins.git"),
            "github.com/acme/plugins"
        );
        assert_eq!(
            package_path("git@github.com:acme/plugins.git"),
            "github.com/acme/plugins"
        );
        assert_eq!(package_path("http://example.com/x"), "example.com/x");
    }

    #[test]
    fn github_urls_become_archives() {
        assert_eq!(
            archive_url("https://github.com/acme/plugins", "abc"),
            "https://github.com/acme/plugins/archive/abc.zip"
        );
        assert_eq!(
            archive_url("https://example.com/p.zip", "abc"),
            "https://example.com/p.zip"
        );
    }

    #[tokio::test]
    async fn unsupported_scheme_is_rejected() {
        let dir = TempDir::new().unwrap();
        let err = downloader(false)
            .fetch("ftp://example.com/plugins", "r1", dir.path())
            .await
            .unwrap_err();
        assert!(matches!(err, ForgeError::UnsupportedScheme(_)));
    }

    #[tokio::test]
    async fn http_archive_is_downloaded_and_expanded() {
        let body = zip_bytes(&[
            ("plugins-r1/plugforge-features.json", b"{\"features\": []}", 0o644),
            ("plugins-r1/bin/run.sh", b"#!/bin/sh\n", 0o755),
        ]);
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/plugins.zip")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let url = format!("{}/plugins.zip", server.url());
        let root = downloader(false).fetch(&url, "r1", dir.path()).await.unwrap();

        mock.assert_async().await;
        assert_eq!(root, dir.path().join("plugins"));
        assert!(!dir.path().join("plugins-r1").exists());
        assert!(root.join("plugforge-features.json").exists());
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(root.join("bin/run.sh")).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o755);
        }
    }

    #[tokio::test]
    async fn flat_archive_lands_in_checkout_dir() {
        let body = zip_bytes(&[
            ("plugforge-features.json", b"{\"features\": []}", 0o644),
            ("README.md", b"hi", 0o644),
        ]);
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/flat.zip")
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path().join("flat")).unwrap();
        std::fs::write(dir.path().join("flat/stale.txt"), "old").unwrap();
        let url = format!("{}/flat.zip", server.url());
        let root = downloader(false).fetch(&url, "r1", dir.path()).await.unwrap();

        assert_eq!(root, dir.path().join("flat"));
        assert!(root.join("plugforge-features.json").exists());
        assert!(!root.join("stale.txt").exists());
        assert!(!dir.path().join(".flat.unpack").exists());
    }

    #[tokio::test]
    async fn http_error_status_is_download_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/missing.zip")
            .with_status(404)
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let url = format!("{}/missing.zip", server.url());
        let err = downloader(false).fetch(&url, "r1", dir.path()).await.unwrap_err();
        assert!(matches!(err, ForgeError::Download { .. }));
    }

    #[tokio::test]
    async fn dry_run_makes_no_network_call() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/plugins.zip")
            .expect(0)
            .create_async()
            .await;
        let dir = TempDir::new().unwrap();
        let url = format!("{}/plugins.zip", server.url());
        let planned = downloader(true).fetch(&url, "r1", dir.path()).await.unwrap();
        mock.assert_async().await;
        assert_eq!(planned, dir.path().join("plugins"));

        let checkout = downloader(true)
            .fetch("https://github.com/acme/plugins.git", "r1", dir.path())
            .await
            .unwrap();
        assert_eq!(checkout, dir.path().join("plugins"));
        assert!(!checkout.exists());
    }

    #[test]
    fn escaping_entries_are_rejected() {
        let dir = TempDir::new().unwrap();
        let archive = dir.path().join("evil.zip");
        std::fs::write(&archive, zip_bytes(&[("../evil.txt", b"x", 0o644)])).unwrap();
        let dest = dir.path().join("out");
        assert!(expand_zip(&archive, &dest).is_err());
        assert!(!dir.path().join("evil.txt").exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn git_checkout_pins_revision() {
        use std::process::Command;
        if which::which("git").is_err() {
            return;
        }
        let git = |cwd: &Path, args: &[&str]| {
            let out = Command::new("git")
                .args(["-c", "user.name=test", "-c", "user.email=test@example.com"])
                .args(args)
                .current_dir(cwd)
                .output()
                .unwrap();
            assert!(out.status.success(), "git {args:?} failed");
            String::from_utf8(out.stdout).unwrap().trim().to_string()
        };

        let dir = TempDir::new().unwrap();
        let src = dir.path().join("plugins.git");
        std::fs::create_dir_all(&src).unwrap();
        git(&src, &["init", "-q"]);
        std::fs::write(src.join("file.txt"), "one").unwrap();
        git(&src, &["add", "."]);
        git(&src, &["commit", "-q", "-m", "one"]);
        let first = git(&src, &["rev-parse", "HEAD"]);
        std::fs::write(src.join("file.txt"), "two").unwrap();
        git(&src, &["commit", "-q", "-am", "two"]);

        let work = dir.path().join("work");
        let checkout = downloader(false)
            .fetch(src.to_str().unwrap(), &first, &work)
            .await
            .unwrap();
        assert_eq!(checkout, work.join("plugins"));
        assert_eq!(std::fs::read_to_string(checkout.join("file.txt")).unwrap(), "one");
    }
}
