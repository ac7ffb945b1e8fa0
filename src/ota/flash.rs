//! Flash-update sinks used by the receiving side of a transfer.
//!
//! A sink sees `begin(total)` once, then `write` per decoded chunk, then
//! either `finish` (image complete) or `abort` (discard everything written).
//! After a commit the receiver records the image version so a restarted
//! node announces what it actually runs.
use std::path::{Path, PathBuf};

use log::{debug, info, warn};

use super::manifest::sha256_hex;
use crate::errors::{QuakeError, QuakeResult};

pub trait FlashSink: Send {
    /// Prepare for an image of `total` bytes.
    fn begin(&mut self, total: u64) -> QuakeResult<()>;
    /// Append bytes; returns the number written.
    fn write(&mut self, data: &[u8]) -> QuakeResult<usize>;
    /// Validate and commit the staged image.
    fn finish(&mut self) -> QuakeResult<()>;
    /// Discard partial writes. Safe to call when nothing is staged.
    fn abort(&mut self);
    /// True between `begin` and `finish`/`abort`.
    fn in_progress(&self) -> bool;
    /// Persist the version of the committed image.
    fn record_version(&mut self, _version: &str) -> QuakeResult<()> {
        Ok(())
    }
    /// Version recorded by the last successful commit, if any.
    fn stored_version(&self) -> Option<String> {
        None
    }
}

/// Stages into `<target>.part` and renames over `target` on finish. The
/// committed version lives next to the image in `<target>.version`.
pub struct FileFlashSink {
    target: PathBuf,
    staging: PathBuf,
    version_file: PathBuf,
    file: Option<std::fs::File>,
    expected: u64,
    written: u64,
}

impl FileFlashSink {
    pub fn new(target: impl AsRef<Path>) -> Self {
        let target = target.as_ref().to_path_buf();
        let mut staging = target.clone().into_os_string();
        staging.push(".part");
        let mut version_file = target.clone().into_os_string();
        version_file.push(".version");
        Self {
            target,
            staging: PathBuf::from(staging),
            version_file: PathBuf::from(version_file),
            file: None,
            expected: 0,
            written: 0,
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }
}

impl FlashSink for FileFlashSink {
    fn begin(&mut self, total: u64) -> QuakeResult<()> {
        if total == 0 {
            return Err(QuakeError::Flash("empty image".into()));
        }
        if let Some(parent) = self.staging.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = std::fs::File::create(&self.staging)?;
        self.file = Some(file);
        self.expected = total;
        self.written = 0;
        debug!("flash staging {} ({} bytes)", self.staging.display(), total);
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> QuakeResult<usize> {
        use std::io::Write;
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| QuakeError::Flash("write before begin".into()))?;
        if self.written + data.len() as u64 > self.expected {
            return Err(QuakeError::Flash(format!(
                "image overflow: {} + {} > {}",
                self.written,
                data.len(),
                self.expected
            )));
        }
        file.write_all(data)?;
        self.written += data.len() as u64;
        Ok(data.len())
    }

    fn finish(&mut self) -> QuakeResult<()> {
        use std::io::Write;
        let mut file = self
            .file
            .take()
            .ok_or_else(|| QuakeError::Flash("finish before begin".into()))?;
        if self.written != self.expected {
            drop(file);
            let _ = std::fs::remove_file(&self.staging);
            return Err(QuakeError::Flash(format!(
                "short image: {} of {} bytes",
                self.written, self.expected
            )));
        }
        file.flush()?;
        file.sync_all()?;
        drop(file);
        std::fs::rename(&self.staging, &self.target)?;
        info!("flash image committed to {}", self.target.display());
        Ok(())
    }

    fn abort(&mut self) {
        if self.file.take().is_some() {
            if let Err(e) = std::fs::remove_file(&self.staging) {
                warn!("could not remove {}: {}", self.staging.display(), e);
            }
        }
        self.written = 0;
        self.expected = 0;
    }

    fn in_progress(&self) -> bool {
        self.file.is_some()
    }

    fn record_version(&mut self, version: &str) -> QuakeResult<()> {
        std::fs::write(&self.version_file, format!("{}\n", version))?;
        debug!("recorded firmware {} in {}", version, self.version_file.display());
        Ok(())
    }

    fn stored_version(&self) -> Option<String> {
        let text = std::fs::read_to_string(&self.version_file).ok()?;
        let version = text.trim();
        (!version.is_empty()).then(|| version.to_string())
    }
}

/// In-memory sink. Completed images are kept for inspection.
#[derive(Debug, Default)]
pub struct MemoryFlashSink {
    staged: Option<Vec<u8>>,
    expected: u64,
    committed: Option<Vec<u8>>,
    /// Fail the write at this zero-based call index (test hook).
    pub fail_write_at: Option<usize>,
    /// Accept only half the bytes at this call index (test hook).
    pub short_write_at: Option<usize>,
    writes: usize,
    version: Option<String>,
}

impl MemoryFlashSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn committed(&self) -> Option<&[u8]> {
        self.committed.as_deref()
    }

    /// Hex SHA-256 of the committed image.
    pub fn committed_digest(&self) -> Option<String> {
        self.committed.as_deref().map(sha256_hex)
    }

    pub fn staged_len(&self) -> usize {
        self.staged.as_ref().map(Vec::len).unwrap_or(0)
    }
}

impl FlashSink for MemoryFlashSink {
    fn begin(&mut self, total: u64) -> QuakeResult<()> {
        if total == 0 {
            return Err(QuakeError::Flash("empty image".into()));
        }
        self.staged = Some(Vec::with_capacity(total as usize));
        self.expected = total;
        self.writes = 0;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> QuakeResult<usize> {
        let call = self.writes;
        self.writes += 1;
        if self.fail_write_at == Some(call) {
            return Err(QuakeError::Flash("injected write failure".into()));
        }
        let staged = self
            .staged
            .as_mut()
            .ok_or_else(|| QuakeError::Flash("write before begin".into()))?;
        if staged.len() as u64 + data.len() as u64 > self.expected {
            return Err(QuakeError::Flash("image overflow".into()));
        }
        let accepted = if self.short_write_at == Some(call) {
            data.len() / 2
        } else {
            data.len()
        };
        staged.extend_from_slice(&data[..accepted]);
        Ok(accepted)
    }

    fn finish(&mut self) -> QuakeResult<()> {
        let staged = self
            .staged
            .take()
            .ok_or_else(|| QuakeError::Flash("finish before begin".into()))?;
        if staged.len() as u64 != self.expected {
            return Err(QuakeError::Flash(format!(
                "short image: {} of {} bytes",
                staged.len(),
                self.expected
            )));
        }
        self.committed = Some(staged);
        Ok(())
    }

    fn abort(&mut self) {
        self.staged = None;
        self.expected = 0;
    }

    fn in_progress(&self) -> bool {
        self.staged.is_some()
    }

    fn record_version(&mut self, version: &str) -> QuakeResult<()> {
        self.version = Some(version.to_string());
        Ok(())
    }

    fn stored_version(&self) -> Option<String> {
        self.version.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_sink_commits_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("firmware.bin");
        let mut sink = FileFlashSink::new(&target);
        sink.begin(6).unwrap();
        sink.write(b"abc").unwrap();
        assert!(!target.exists());
        sink.write(b"def").unwrap();
        assert!(sink.write(b"g").is_err());
        sink.finish().unwrap();
        assert_eq!(std::fs::read(&target).unwrap(), b"abcdef");
        assert!(!sink.in_progress());
    }

    #[test]
    fn file_sink_version_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("firmware.bin");
        let mut sink = FileFlashSink::new(&target);
        assert_eq!(sink.stored_version(), None);
        sink.begin(3).unwrap();
        sink.write(b"abc").unwrap();
        sink.finish().unwrap();
        sink.record_version("2.2.0").unwrap();

        let reopened = FileFlashSink::new(&target);
        assert_eq!(reopened.stored_version().as_deref(), Some("2.2.0"));
    }

    #[test]
    fn file_sink_abort_discards_staging() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("fw.bin");
        let mut sink = FileFlashSink::new(&target);
        sink.begin(4).unwrap();
        sink.write(b"ab").unwrap();
        sink.abort();
        assert!(!target.exists());
        assert!(!dir.path().join("fw.bin.part").exists());
        // abort twice is harmless
        sink.abort();
    }

    #[test]
    fn memory_sink_rejects_short_image() {
        let mut sink = MemoryFlashSink::new();
        sink.begin(4).unwrap();
        sink.write(b"ab").unwrap();
        assert!(sink.finish().is_err());
        assert!(sink.committed().is_none());
    }
}
