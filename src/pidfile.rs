//! Scoped single-instance enforcement through a locked pidfile.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process;

use crate::error::PidfileError;

/// An exclusively locked pidfile, removed when dropped.
///
/// The lock rides on the open file description, so it survives the
/// fork performed while daemonising and disappears with the process no
/// matter how it exits.
pub struct Pidfile {
    file: File,
    path: PathBuf,
}

impl Pidfile {
    /// Create (mode `0600`) and lock the pidfile.
    ///
    /// If another process holds the lock, its PID is read back and
    /// reported through [`PidfileError::Conflict`].
    pub fn open(path: &Path, mode: u32) -> Result<Self, PidfileError> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .mode(mode)
            .open(path)?;
        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
                let mut contents = String::new();
                let _ = file.read_to_string(&mut contents);
                let other = contents.trim().parse().unwrap_or(0);
                return Err(PidfileError::Conflict(other));
            }
            return Err(PidfileError::Io(err));
        }
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Record our PID; call after daemonising, the fork changes it.
    pub fn write(&mut self) -> Result<(), PidfileError> {
        self.file.set_len(0)?;
        self.file.seek(SeekFrom::Start(0))?;
        writeln!(self.file, "{}", process::id())?;
        Ok(())
    }
}

impl Drop for Pidfile {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}
