// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Atomic file creation.

A file written through [AtomicFile] is only ever visible at its final path once all of
its content has been written: writes land in a temporary file which is renamed into
place by [AtomicFile::commit()]. The temporary directory must be on the same filesystem
as the target, otherwise the rename fails.

If an [AtomicFile] is dropped without being committed, the temporary file is removed.
If the process dies instead, the temporary file is left behind in the temporary
directory and the target path never exists.
*/

use {
    crate::error::{PublisherError, Result},
    std::{
        io::Write,
        os::unix::fs::PermissionsExt,
        path::{Path, PathBuf},
    },
    tempfile::NamedTempFile,
};

/// Mode of files published to the pool.
pub const POOL_FILE_MODE: u32 = 0o644;

const TEMP_PREFIX: &str = "temp-download.";

/// A file that appears at its target path only when complete.
#[derive(Debug)]
pub struct AtomicFile {
    target: PathBuf,
    temp: NamedTempFile,
    bytes_written: u64,
}

impl AtomicFile {
    /// Begin writing a new file destined for `target`.
    ///
    /// The temporary file is created in `temp_dir`. `target` must not exist.
    pub fn create(target: impl AsRef<Path>, temp_dir: impl AsRef<Path>) -> Result<Self> {
        let target = target.as_ref().to_path_buf();
        let temp_dir = temp_dir.as_ref();

        if target.symlink_metadata().is_ok() {
            return Err(PublisherError::PoolTargetExists(format!(
                "{}",
                target.display()
            )));
        }

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(temp_dir)
            .map_err(|e| PublisherError::PoolIoPath(format!("{}", temp_dir.display()), e))?;

        Ok(Self {
            target,
            temp,
            bytes_written: 0,
        })
    }

    /// The path the file will have once committed.
    pub fn target(&self) -> &Path {
        &self.target
    }

    /// The path of the temporary file holding content written so far.
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    /// Flush content to disk and move the file into place.
    ///
    /// Returns the number of bytes in the file.
    pub fn commit(mut self) -> Result<u64> {
        let temp_path = format!("{}", self.temp.path().display());

        self.temp
            .flush()
            .and_then(|_| self.temp.as_file().sync_all())
            .and_then(|_| {
                self.temp
                    .as_file()
                    .set_permissions(std::fs::Permissions::from_mode(POOL_FILE_MODE))
            })
            .map_err(|e| PublisherError::PoolIoPath(temp_path, e))?;

        // Refuses to replace a target that appeared since creation.
        self.temp.persist_noclobber(&self.target).map_err(|e| {
            if e.error.kind() == std::io::ErrorKind::AlreadyExists {
                PublisherError::PoolTargetExists(format!("{}", self.target.display()))
            } else {
                PublisherError::PoolIoPath(format!("{}", self.target.display()), e.error)
            }
        })?;

        Ok(self.bytes_written)
    }
}

impl Write for AtomicFile {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let size = self.temp.write(buf)?;
        self.bytes_written += size as u64;

        Ok(size)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.temp.flush()
    }
}
