//! Upload backing storage: destination-confined paths and collision-safe
//! filename allocation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Strip any path components from a client-supplied filename, leaving a bare
/// basename. Empty or dot-only names fall back to a placeholder.
pub fn sanitize_filename(raw: &str) -> String {
    let name = Path::new(raw)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        "unnamed".to_string()
    } else {
        name.to_string()
    }
}

/// Pick a filename that does not collide with an existing file in `dir`.
/// `foo.txt` becomes `foo-2.txt`, then `foo-3.txt`; extensionless `foo`
/// becomes `foo-2`.
pub async fn find_available_name(dir: &Path, filename: &str) -> String {
    if !dir.join(filename).exists() {
        return filename.to_string();
    }

    let (stem, ext) = match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem.to_string(), Some(ext.to_string())),
        _ => (filename.to_string(), None),
    };

    let mut i = 2u32;
    loop {
        let candidate = match &ext {
            Some(ext) => format!("{stem}-{i}.{ext}"),
            None => format!("{stem}-{i}"),
        };
        if !dir.join(&candidate).exists() {
            return candidate;
        }
        i += 1;
    }
}

struct OpenFile {
    file: File,
    saved_name: String,
}

/// Streaming append-only storage for one upload transfer. Files are written
/// one at a time into a per-transfer directory under the destination.
pub struct UploadStorage {
    dir: PathBuf,
    current: Option<OpenFile>,
    saved_names: Vec<String>,
}

/// Result of opening a stream slot: the name the file was saved under, and
/// whether a collision forced a rename.
pub struct OpenedFile {
    pub saved_name: String,
    pub renamed_from: Option<String>,
}

impl UploadStorage {
    /// Create the per-transfer directory.
    pub async fn create(destination: &Path, transfer_id: &str) -> Result<Self> {
        let dir = destination.join(transfer_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("create upload dir {}", dir.display()))?;
        Ok(Self {
            dir,
            current: None,
            saved_names: Vec::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Names the files have been saved under so far, in stream order.
    pub fn saved_names(&self) -> &[String] {
        &self.saved_names
    }

    /// Finish the current file (if any) and start the next named stream.
    pub async fn open_file(&mut self, raw_name: &str) -> Result<OpenedFile> {
        self.finish_current().await?;

        let wanted = sanitize_filename(raw_name);
        let saved_name = find_available_name(&self.dir, &wanted).await;
        let renamed_from = (saved_name != wanted).then(|| wanted.clone());

        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(self.dir.join(&saved_name))
            .await
            .with_context(|| format!("open upload file {saved_name}"))?;

        self.saved_names.push(saved_name.clone());
        self.current = Some(OpenFile {
            file,
            saved_name: saved_name.clone(),
        });
        Ok(OpenedFile {
            saved_name,
            renamed_from,
        })
    }

    /// Append bytes to the currently open stream.
    pub async fn append(&mut self, bytes: &[u8]) -> Result<()> {
        let open = self
            .current
            .as_mut()
            .context("no file stream open for this transfer")?;
        open.file
            .write_all(bytes)
            .await
            .with_context(|| format!("append to {}", open.saved_name))?;
        Ok(())
    }

    pub fn has_open_file(&self) -> bool {
        self.current.is_some()
    }

    async fn finish_current(&mut self) -> Result<()> {
        if let Some(mut open) = self.current.take() {
            open.file
                .flush()
                .await
                .with_context(|| format!("flush {}", open.saved_name))?;
        }
        Ok(())
    }

    /// Flush and close everything; the files stay on disk.
    pub async fn finalize(&mut self) -> Result<()> {
        self.finish_current().await
    }

    /// Release partial data: drop open handles and remove the transfer dir.
    pub async fn discard(&mut self) {
        self.current = None;
        self.saved_names.clear();
        if let Err(err) = tokio::fs::remove_dir_all(&self.dir).await {
            tracing::warn!(dir = %self.dir.display(), error = %err, "failed to remove partial upload");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn sanitize_strips_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_filename("dir/report.pdf"), "report.pdf");
        assert_eq!(sanitize_filename(""), "unnamed");
        assert_eq!(sanitize_filename(".."), "unnamed");
        assert_eq!(sanitize_filename("plain.txt"), "plain.txt");
    }

    #[tokio::test]
    async fn collision_suffixes_count_up() {
        let tmp = TempDir::new().expect("tempdir");
        std::fs::write(tmp.path().join("foo.txt"), b"x").expect("seed");
        std::fs::write(tmp.path().join("foo-2.txt"), b"x").expect("seed");
        std::fs::write(tmp.path().join("bare"), b"x").expect("seed");

        assert_eq!(find_available_name(tmp.path(), "foo.txt").await, "foo-3.txt");
        assert_eq!(find_available_name(tmp.path(), "bare").await, "bare-2");
        assert_eq!(
            find_available_name(tmp.path(), "fresh.bin").await,
            "fresh.bin"
        );
    }

    #[tokio::test]
    async fn streams_write_sequentially_and_discard_removes_all() {
        let tmp = TempDir::new().expect("tempdir");
        let mut storage = UploadStorage::create(tmp.path(), "t1")
            .await
            .expect("create");

        storage.open_file("a.txt").await.expect("open a");
        storage.append(b"hello ").await.expect("append");
        storage.append(b"world").await.expect("append");
        storage.open_file("b.txt").await.expect("open b");
        storage.append(b"second").await.expect("append");
        storage.finalize().await.expect("finalize");

        let a = std::fs::read(storage.dir().join("a.txt")).expect("read a");
        assert_eq!(a, b"hello world");
        assert_eq!(storage.saved_names(), ["a.txt", "b.txt"]);

        storage.discard().await;
        assert!(!storage.dir().exists());
    }

    #[tokio::test]
    async fn duplicate_names_within_one_transfer_get_suffixed() {
        let tmp = TempDir::new().expect("tempdir");
        let mut storage = UploadStorage::create(tmp.path(), "t2")
            .await
            .expect("create");

        let first = storage.open_file("log.txt").await.expect("open");
        assert!(first.renamed_from.is_none());
        let second = storage.open_file("log.txt").await.expect("open again");
        assert_eq!(second.saved_name, "log-2.txt");
        assert_eq!(second.renamed_from.as_deref(), Some("log.txt"));
    }
}
