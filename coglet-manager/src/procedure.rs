//! Procedure source fetching.
//!
//! A procedure source URL names the working tree a runner executes from.
//! `file://` sources are copied; `http(s)://` sources are downloaded and
//! extracted. The destination is keyed by the source digest and the runner
//! id so concurrent runners never share a tree.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Materialise `source_url` into a fresh working tree under `parent`.
pub async fn materialize(
    source_url: &str,
    runner_id: &str,
    parent: &Path,
    client: &reqwest::Client,
) -> Result<PathBuf> {
    let digest = hex_digest(source_url);
    let dest = parent.join(format!("procedure-{digest}-{runner_id}"));
    tokio::fs::create_dir_all(&dest).await?;

    if let Some(path) = source_url.strip_prefix("file://") {
        copy_tree(Path::new(path), &dest)?;
    } else if source_url.starts_with("http://") || source_url.starts_with("https://") {
        download_and_extract(source_url, &dest, client).await?;
    } else {
        let scheme = source_url.split(':').next().unwrap_or(source_url);
        return Err(Error::UnsupportedScheme(scheme.to_string()));
    }

    Ok(dest)
}

fn hex_digest(source_url: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_url.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Recursively copy a directory tree. Symlinks are not followed.
fn copy_tree(src: &Path, dest: &Path) -> Result<()> {
    if !src.is_dir() {
        return Err(Error::Config(format!(
            "procedure source {} is not a directory",
            src.display()
        )));
    }

    for entry in walkdir::WalkDir::new(src).min_depth(1) {
        let entry = entry.map_err(|e| Error::Config(format!("walking procedure source: {e}")))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .expect("walkdir yields paths under its root");
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            std::fs::create_dir_all(&target)?;
        } else if entry.file_type().is_file() {
            if let Some(dir) = target.parent() {
                std::fs::create_dir_all(dir)?;
            }
            std::fs::copy(entry.path(), &target)?;
        } else {
            tracing::debug!(path = %entry.path().display(), "skipping non-regular file");
        }
    }
    Ok(())
}

/// Download a tarball to a temp file and extract it with `tar -xf`.
async fn download_and_extract(url: &str, dest: &Path, client: &reqwest::Client) -> Result<()> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(Error::Config(format!(
            "fetching procedure source {url}: status {}",
            response.status().as_u16()
        )));
    }
    let bytes = response.bytes().await?;

    let archive = tempfile::NamedTempFile::new()?;
    tokio::fs::write(archive.path(), &bytes).await?;

    let status = tokio::process::Command::new("tar")
        .arg("-xf")
        .arg(archive.path())
        .arg("-C")
        .arg(dest)
        .status()
        .await?;
    if !status.success() {
        return Err(Error::Config(format!(
            "tar extraction of {url} failed with {status}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn file_source_copies_tree() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("cog.yaml"), "predict: p.py:P\n").unwrap();
        std::fs::create_dir(src.path().join("lib")).unwrap();
        std::fs::write(src.path().join("lib/util.py"), "x = 1\n").unwrap();

        let parent = tempfile::tempdir().unwrap();
        let url = format!("file://{}", src.path().display());
        let dest = materialize(&url, "runner01", parent.path(), &reqwest::Client::new())
            .await
            .unwrap();

        assert!(dest.file_name().unwrap().to_str().unwrap().ends_with("-runner01"));
        assert_eq!(
            std::fs::read_to_string(dest.join("cog.yaml")).unwrap(),
            "predict: p.py:P\n"
        );
        assert_eq!(std::fs::read_to_string(dest.join("lib/util.py")).unwrap(), "x = 1\n");
    }

    #[tokio::test]
    async fn same_source_different_runner_gets_distinct_trees() {
        let src = tempfile::tempdir().unwrap();
        std::fs::write(src.path().join("cog.yaml"), "predict: p.py:P\n").unwrap();

        let parent = tempfile::tempdir().unwrap();
        let url = format!("file://{}", src.path().display());
        let client = reqwest::Client::new();

        let a = materialize(&url, "runner01", parent.path(), &client).await.unwrap();
        let b = materialize(&url, "runner02", parent.path(), &client).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn missing_file_source_is_an_error() {
        let parent = tempfile::tempdir().unwrap();
        let err = materialize(
            "file:///definitely/not/here",
            "runner01",
            parent.path(),
            &reqwest::Client::new(),
        )
        .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let parent = tempfile::tempdir().unwrap();
        let err = materialize(
            "git://example.com/repo",
            "runner01",
            parent.path(),
            &reqwest::Client::new(),
        )
        .await;
        assert!(matches!(err, Err(Error::UnsupportedScheme(s)) if s == "git"));
    }

    #[test]
    fn digest_is_stable_hex() {
        let a = hex_digest("file:///src");
        let b = hex_digest("file:///src");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.bytes().all(|c| c.is_ascii_hexdigit()));
    }
}
