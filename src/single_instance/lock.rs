// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Machine-global launch lock.
//!
//! Windows uses a named mutex in the `Global\` namespace so that launches
//! from different user sessions exclude each other. Unix uses an advisory
//! `flock` on a file in `/tmp`, which every user shares regardless of a
//! per-user `TMPDIR`. In both cases the
//! create-or-detect step is a single OS call, and the OS drops the lock if
//! the owner dies.

use std::io;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to create launch lock {name}: {source}")]
    Create {
        name: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipState {
    Unowned,
    OwnedByThisProcess,
    HeldByOther,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// This process is the first instance.
    Acquired,
    /// Another process holds the lock: this is a duplicate launch.
    AlreadyHeld,
}

/// A named, machine-wide mutual exclusion primitive.
pub trait ExclusiveLock {
    fn try_acquire(&mut self) -> Result<AcquireOutcome, LockError>;

    /// Release ownership. Safe to call when not owned.
    fn release(&mut self);

    fn state(&self) -> OwnershipState;
}

/// The launch lock of this machine.
pub struct LaunchLock {
    name: String,
    state: OwnershipState,
    handle: Option<imp::Handle>,
    #[cfg(unix)]
    dir: std::path::PathBuf,
}

impl LaunchLock {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: OwnershipState::Unowned,
            handle: None,
            #[cfg(unix)]
            dir: std::path::PathBuf::from(imp::SHARED_DIR),
        }
    }

    /// Lock whose backing file lives in `dir` instead of `/tmp`.
    #[cfg(unix)]
    #[allow(dead_code)]
    pub fn in_dir(name: impl Into<String>, dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            name: name.into(),
            state: OwnershipState::Unowned,
            handle: None,
            dir: dir.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ExclusiveLock for LaunchLock {
    fn try_acquire(&mut self) -> Result<AcquireOutcome, LockError> {
        if self.state == OwnershipState::OwnedByThisProcess {
            return Ok(AcquireOutcome::Acquired);
        }

        #[cfg(unix)]
        let attempt = imp::try_create(&self.dir, &self.name);
        #[cfg(not(unix))]
        let attempt = imp::try_create(&self.name);

        match attempt {
            Ok(Some(handle)) => {
                info!("Acquired launch lock {}", self.name);
                self.handle = Some(handle);
                self.state = OwnershipState::OwnedByThisProcess;
                Ok(AcquireOutcome::Acquired)
            }
            Ok(None) => {
                info!("Launch lock {} is held by another process", self.name);
                self.state = OwnershipState::HeldByOther;
                Ok(AcquireOutcome::AlreadyHeld)
            }
            Err(source) => Err(LockError::Create {
                name: self.name.clone(),
                source,
            }),
        }
    }

    fn release(&mut self) {
        if let Some(handle) = self.handle.take() {
            imp::release(handle);
            debug!("Released launch lock {}", self.name);
        }
        self.state = OwnershipState::Unowned;
    }

    fn state(&self) -> OwnershipState {
        self.state
    }
}

impl Drop for LaunchLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(unix)]
mod imp {
    use fs2::FileExt;
    use std::fs::{File, OpenOptions};
    use std::io;
    use std::os::unix::fs::OpenOptionsExt;
    use std::path::Path;

    pub type Handle = File;

    /// Lock file directory common to all users and sessions.
    pub const SHARED_DIR: &str = "/tmp";

    fn file_name(name: &str) -> String {
        let safe: String = name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        format!("{}.lock", safe)
    }

    fn open(path: &Path) -> io::Result<File> {
        // World-writable so launches by other users can open the same file.
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .mode(0o666)
            .open(path)
        {
            // Created by another user under a restrictive umask; flock
            // works on a read-only descriptor too.
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => File::open(path),
            other => other,
        }
    }

    pub fn try_create(dir: &Path, name: &str) -> io::Result<Option<File>> {
        let file = open(&dir.join(file_name(name)))?;
        match file.try_lock_exclusive() {
            Ok(()) => Ok(Some(file)),
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.raw_os_error() == fs2::lock_contended_error().raw_os_error() =>
            {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn release(file: File) {
        // The file itself stays: unlinking it would let a racing launch lock
        // an orphaned inode while a third one creates a fresh file.
        let _ = FileExt::unlock(&file);
    }

    #[cfg(test)]
    pub fn lock_path(dir: &Path, name: &str) -> std::path::PathBuf {
        dir.join(file_name(name))
    }
}

#[cfg(windows)]
mod imp {
    use std::io;
    use windows::core::HSTRING;
    use windows::Win32::Foundation::{
        CloseHandle, GetLastError, ERROR_ACCESS_DENIED, ERROR_ALREADY_EXISTS, HANDLE,
    };
    use windows::Win32::System::Threading::{CreateMutexW, ReleaseMutex};

    pub struct Handle(HANDLE);

    // SAFETY: a kernel object handle is a plain value that may move between threads.
    unsafe impl Send for Handle {}

    pub fn try_create(name: &str) -> io::Result<Option<Handle>> {
        let name = HSTRING::from(format!("Global\\{}", name));
        unsafe {
            match CreateMutexW(None, true, &name) {
                Ok(handle) => {
                    // Must be read before any other call overwrites the last error.
                    if GetLastError() == ERROR_ALREADY_EXISTS {
                        let _ = CloseHandle(handle);
                        Ok(None)
                    } else {
                        Ok(Some(Handle(handle)))
                    }
                }
                // The mutex exists but was created by another user's session.
                Err(e) if e.code() == ERROR_ACCESS_DENIED.to_hresult() => Ok(None),
                Err(e) => Err(io::Error::from_raw_os_error(e.code().0 & 0xFFFF)),
            }
        }
    }

    pub fn release(handle: Handle) {
        unsafe {
            let _ = ReleaseMutex(handle.0);
            let _ = CloseHandle(handle.0);
        }
    }
}
