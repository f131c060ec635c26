// src/backup.rs
//! Point-in-time archive of the project tree plus a consistent store snapshot.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::process::Command;

use crate::error::{AtlasError, Result};
use crate::store::Store;

/// Directories never included in an archive.
pub const EXCLUDED_DIRS: &[&str] = &["logs", "target", ".venv", "venv", "__pycache__", ".git"];

/// What to leave out of the tree pass. Paths are relative to the tree root.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Exclusions {
    pub dirs: Vec<String>,
    pub files: Vec<PathBuf>,
}

#[async_trait]
pub trait Archiver: Send + Sync {
    /// Archive everything under `root` into `archive`, minus `exclude`.
    async fn archive_tree(&self, root: &Path, archive: &Path, exclude: &Exclusions) -> Result<()>;

    /// Append `base/rel` to `archive`, stored under the name `rel`.
    async fn add_file(&self, archive: &Path, base: &Path, rel: &Path) -> Result<()>;
}

/// Drives the system `zip` tool.
pub struct ZipCli;

impl ZipCli {
    fn patterns(exclude: &Exclusions) -> Vec<String> {
        let mut out = Vec::new();
        for d in &exclude.dirs {
            out.push(format!("{d}/*"));
            out.push(format!("*/{d}/*"));
        }
        for f in &exclude.files {
            out.push(f.to_string_lossy().to_string());
        }
        out
    }

    async fn run(cwd: &Path, args: &[String]) -> Result<()> {
        let out = Command::new("zip")
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !out.status.success() {
            return Err(AtlasError::Io(std::io::Error::other(format!(
                "zip exited with {}: {}",
                out.status,
                String::from_utf8_lossy(&out.stderr).trim()
            ))));
        }
        Ok(())
    }
}

#[async_trait]
impl Archiver for ZipCli {
    async fn archive_tree(&self, root: &Path, archive: &Path, exclude: &Exclusions) -> Result<()> {
        let mut args = vec![
            "-r".to_string(),
            "-q".to_string(),
            archive.to_string_lossy().to_string(),
            ".".to_string(),
        ];
        let patterns = Self::patterns(exclude);
        if !patterns.is_empty() {
            args.push("-x".into());
            args.extend(patterns);
        }
        Self::run(root, &args).await
    }

    async fn add_file(&self, archive: &Path, base: &Path, rel: &Path) -> Result<()> {
        let args = vec![
            "-q".to_string(),
            archive.to_string_lossy().to_string(),
            rel.to_string_lossy().to_string(),
        ];
        Self::run(base, &args).await
    }
}

/// Records calls and writes a placeholder archive; for tests.
#[derive(Default)]
pub struct MockArchiver {
    pub trees: std::sync::Mutex<Vec<(PathBuf, Exclusions)>>,
    /// `(rel, size of base/rel at call time)`
    pub added: std::sync::Mutex<Vec<(PathBuf, u64)>>,
}

#[async_trait]
impl Archiver for MockArchiver {
    async fn archive_tree(&self, root: &Path, archive: &Path, exclude: &Exclusions) -> Result<()> {
        std::fs::write(archive, format!("tree:{}", root.display()))?;
        if let Ok(mut g) = self.trees.lock() {
            g.push((root.to_path_buf(), exclude.clone()));
        }
        Ok(())
    }

    async fn add_file(&self, _archive: &Path, base: &Path, rel: &Path) -> Result<()> {
        let size = std::fs::metadata(base.join(rel))?.len();
        if let Ok(mut g) = self.added.lock() {
            g.push((rel.to_path_buf(), size));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupOutcome {
    pub archive: PathBuf,
    pub sha256: String,
    pub snapshot_bytes: u64,
}

/// Tree exclusions for one run: the fixed dirs, the live database files and the
/// destination dir when it sits inside the tree.
pub fn exclusions_for(root: &Path, db_path: &Path, dest_dir: &Path) -> Exclusions {
    let mut ex = Exclusions {
        dirs: EXCLUDED_DIRS.iter().map(|s| s.to_string()).collect(),
        files: Vec::new(),
    };
    if let Some(rel) = relative_to(root, db_path) {
        let s = rel.to_string_lossy().to_string();
        ex.files.push(rel);
        ex.files.push(PathBuf::from(format!("{s}-wal")));
        ex.files.push(PathBuf::from(format!("{s}-shm")));
        ex.files.push(PathBuf::from(format!("{s}-journal")));
    }
    if let Some(rel) = relative_to(root, dest_dir).filter(|r| !r.as_os_str().is_empty()) {
        ex.dirs.push(rel.to_string_lossy().to_string());
    }
    ex
}

fn relative_to(root: &Path, p: &Path) -> Option<PathBuf> {
    absolute(p)
        .strip_prefix(absolute(root))
        .ok()
        .map(Path::to_path_buf)
}

pub fn sha256_file(path: &Path) -> Result<String> {
    use std::io::Read;

    let mut f = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = f.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

/// Snapshot the store, archive the tree, append the snapshot as `data/<db name>`.
pub async fn run_backup(
    root: &Path,
    db_path: &Path,
    dest_dir: &Path,
    archiver: &dyn Archiver,
) -> Result<BackupOutcome> {
    std::fs::create_dir_all(dest_dir)?;
    let ts = Utc::now().format("%Y%m%d_%H%M%S").to_string();
    let archive = dest_dir.join(format!("atlas_backup_{ts}.zip"));
    let staging = dest_dir.join(format!(".staging_{ts}"));
    let db_name = db_path
        .file_name()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("atlas.db"));
    let rel = Path::new("data").join(&db_name);

    let result = async {
        std::fs::create_dir_all(staging.join("data"))?;
        let snap_path = staging.join(&rel);
        let db = db_path.to_path_buf();
        let snap = snap_path.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let store = Store::open_existing(&db, std::time::Duration::from_secs(5))?;
            store.snapshot_to(&snap)
        })
        .await
        .map_err(|e| AtlasError::Io(std::io::Error::other(e)))??;
        let snapshot_bytes = std::fs::metadata(&snap_path)?.len();
        tracing::info!(target: "backup", bytes = snapshot_bytes, "store snapshot taken");

        let exclude = exclusions_for(root, db_path, dest_dir);
        archiver.archive_tree(root, &absolute(&archive), &exclude).await?;
        archiver.add_file(&absolute(&archive), &staging, &rel).await?;
        Ok::<_, AtlasError>(snapshot_bytes)
    }
    .await;

    if let Err(e) = std::fs::remove_dir_all(&staging) {
        tracing::debug!(target: "backup", error = %e, "staging cleanup");
    }
    let snapshot_bytes = result?;

    let sha256 = sha256_file(&archive)?;
    tracing::info!(target: "backup", archive = %archive.display(), %sha256, "backup written");
    Ok(BackupOutcome {
        archive,
        sha256,
        snapshot_bytes,
    })
}

fn absolute(p: &Path) -> PathBuf {
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        std::env::current_dir().unwrap_or_default().join(p)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zip_patterns_cover_nested_dirs() {
        let ex = Exclusions {
            dirs: vec!["__pycache__".into()],
            files: vec![PathBuf::from("data/atlas.db")],
        };
        assert_eq!(
            ZipCli::patterns(&ex),
            vec!["__pycache__/*", "*/__pycache__/*", "data/atlas.db"]
        );
    }

    #[test]
    fn exclusions_include_live_db_and_dest() {
        let ex = exclusions_for(
            Path::new("/srv/atlas"),
            Path::new("/srv/atlas/data/atlas.db"),
            Path::new("/srv/atlas/backups"),
        );
        assert!(ex.files.contains(&PathBuf::from("data/atlas.db")));
        assert!(ex.files.contains(&PathBuf::from("data/atlas.db-wal")));
        assert!(ex.dirs.contains(&"backups".to_string()));
        assert!(ex.dirs.contains(&".git".to_string()));
    }

    #[test]
    fn db_outside_tree_is_not_excluded() {
        let ex = exclusions_for(Path::new("/srv/atlas"), Path::new("/var/db/atlas.db"), Path::new("/tmp/b"));
        assert!(ex.files.is_empty());
        assert_eq!(ex.dirs.len(), EXCLUDED_DIRS.len());
    }

    #[test]
    fn sha256_of_known_content() {
        let dir = tempfile::tempdir().unwrap();
        let p = dir.path().join("f");
        std::fs::write(&p, "abc").unwrap();
        assert_eq!(
            sha256_file(&p).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
