//! Error taxonomy and exit codes.
//!
//! Everything that can terminate the daemon funnels into [`Fatal`],
//! which pairs an [`Exit`] code with the `errno` observed at the time
//! and a human readable message.

use std::fmt;

use thiserror::Error;

/// Exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// Regular termination.
    Ok = 0,
    /// Unexpected command line argument.
    ClArg,
    /// A user provided value is out of range.
    OutOfRange,
    /// The provided value is not a valid load.
    Load,
    /// The provided value is not a valid frequency.
    Freq,
    /// The provided value is not a valid mode.
    Mode,
    /// The provided value is not a valid interval.
    Ival,
    /// The provided value is not a valid sample count.
    Samples,
    /// A sysctl operation failed.
    Sysctl,
    /// The system does not support changing core frequencies.
    NoFreq,
    /// Another frequency daemon instance is running.
    Conflict,
    /// A pidfile could not be created or written.
    Pid,
    /// Insufficient privileges to change a sysctl.
    Forbidden,
    /// Unable to detach from the terminal.
    Daemon,
    /// Failed to install a signal handler.
    Signal,
    /// The provided value is not a valid temperature.
    Temperature,
}

impl Exit {
    /// The stringified code used to prefix diagnostics.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Ok => "OK",
            Self::ClArg => "ECLARG",
            Self::OutOfRange => "EOUTOFRANGE",
            Self::Load => "ELOAD",
            Self::Freq => "EFREQ",
            Self::Mode => "EMODE",
            Self::Ival => "EIVAL",
            Self::Samples => "ESAMPLES",
            Self::Sysctl => "ESYSCTL",
            Self::NoFreq => "ENOFREQ",
            Self::Conflict => "ECONFLICT",
            Self::Pid => "EPID",
            Self::Forbidden => "EFORBIDDEN",
            Self::Daemon => "EDAEMON",
            Self::Signal => "ESIGNAL",
            Self::Temperature => "ETEMPERATURE",
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for Exit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// A fatal condition bundling an exit code, errno value and message.
#[derive(Debug, Error)]
#[error("({code}) {msg}")]
pub struct Fatal {
    /// The code to exit with.
    pub code: Exit,
    /// The errno value at the time of creation.
    pub errno: i32,
    /// An error message.
    pub msg: String,
}

/// Build a [`Fatal`] with the given exit code and message.
pub fn fail(code: Exit, errno: i32, msg: impl Into<String>) -> Fatal {
    Fatal {
        code,
        errno,
        msg: msg.into(),
    }
}

/// Kernel MIB access failures.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SysctlError {
    /// The MIB name does not resolve.
    #[error("no such kernel variable")]
    NotFound,
    /// The value is larger than the caller's buffer.
    #[error("kernel value does not fit the buffer")]
    Truncated,
    /// Insufficient privilege.
    #[error("operation not permitted")]
    Denied,
    /// Any other kernel failure.
    #[error("kernel i/o failure (errno {0})")]
    Io(i32),
}

impl SysctlError {
    pub fn from_errno(errno: i32) -> Self {
        match errno {
            libc::ENOENT => Self::NotFound,
            libc::ENOMEM => Self::Truncated,
            libc::EPERM | libc::EACCES => Self::Denied,
            other => Self::Io(other),
        }
    }

    pub fn errno(self) -> i32 {
        match self {
            Self::NotFound => libc::ENOENT,
            Self::Truncated => libc::ENOMEM,
            Self::Denied => libc::EPERM,
            Self::Io(errno) => errno,
        }
    }
}

/// Promote a steady-state sysctl failure into a fatal condition.
pub fn sysctl_fail(err: SysctlError) -> Fatal {
    fail(Exit::Sysctl, err.errno(), format!("sysctl failed: {err}"))
}

/// Pidfile acquisition failures.
#[derive(Debug, Error)]
pub enum PidfileError {
    /// The pidfile is locked by a live process.
    #[error("held by process {0}")]
    Conflict(i32),
    /// Any other I/O failure.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
