// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

/*! Run-level mutual exclusion.

Pool and publication state assume a single writer. [RunLock] holds an exclusive
advisory lock on a lock file for the duration of a run. The kernel releases the lock
when the holding process exits, so a crashed publisher never blocks the next run.
The lock file itself is left in place and records the pid of the last holder.
*/

use {
    crate::error::{PublisherError, Result},
    fs2::FileExt,
    log::{debug, warn},
    std::{
        fs::File,
        io::Write,
        path::{Path, PathBuf},
    },
};

/// A held run lock. Released on drop or when the process exits.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    file: File,
}

impl RunLock {
    /// Take the lock, failing immediately if another process holds it.
    pub fn acquire(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let io_error = |e| PublisherError::PoolIoPath(format!("{}", path.display()), e);

        // Not truncated on open: that would clobber the pid of a live holder.
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .open(&path)
            .map_err(io_error)?;

        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                PublisherError::LockHeld(format!("{}", path.display()))
            } else {
                io_error(e)
            }
        })?;

        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .map_err(io_error)?;

        debug!("acquired run lock {}", path.display());

        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.unlock() {
            warn!("unable to release run lock {}: {}", self.path.display(), e);
        }
    }
}
