//! Scratch directory for one engine invocation.
//!
//! A [`Workspace`] owns a temporary directory that holds everything the
//! engine produces along the way, including the sandbox backend's copy of the
//! input. The directory is removed when the workspace is dropped, whatever
//! the outcome of the invocation.

use std::io;
use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// File name of the engine's output inside the workspace.
pub const OUTPUT_FILE: &str = "output.mp4";

pub struct Workspace {
    temp_dir: TempDir,
}

impl Workspace {
    /// Create a workspace under `parent`, or under the system temp dir.
    pub fn new(parent: Option<&Path>) -> io::Result<Self> {
        let builder = {
            let mut b = tempfile::Builder::new();
            b.prefix("webmforge-");
            b
        };
        let temp_dir = match parent {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };
        Ok(Self { temp_dir })
    }

    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Path for a named file inside the workspace.
    pub fn file(&self, name: &str) -> PathBuf {
        self.temp_dir.path().join(name)
    }

    /// Where the engine writes its output.
    pub fn output(&self) -> PathBuf {
        self.file(OUTPUT_FILE)
    }

    /// Move the engine output to `dest`, returning its length.
    ///
    /// A missing output yields 0 and leaves `dest` untouched.
    pub fn deliver_output(&self, dest: &Path) -> io::Result<u64> {
        let output = self.output();
        let len = match std::fs::metadata(&output) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };

        // Try rename first (same filesystem), fall back to copy+remove.
        if let Err(e) = std::fs::rename(&output, dest) {
            tracing::debug!(error = %e, dest = %dest.display(), "Rename failed, copying output");
            std::fs::copy(&output, dest)?;
            if let Err(e) = std::fs::remove_file(&output) {
                tracing::warn!(path = %output.display(), error = %e, "Failed to remove copied engine output");
            }
        }
        Ok(len)
    }
}
