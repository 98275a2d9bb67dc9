//! powerdxx - adaptive CPU clock control.
//!
//! A drop-in replacement for the system power daemon: it watches
//! per-core kernel tick counters over a sliding window and steers each
//! clock group's frequency towards a per-power-source load target, all
//! through the kernel's MIB tree.
//!
//! ## Architecture
//!
//! - **sysctl**: typed, width-checked access to kernel variables
//! - **topology**: core enumeration and clock-group discovery
//! - **sampler**: tick-counter ring buffer and load estimation
//! - **governor**: per-group frequency decisions and the main loop
//! - **config**: command line value grammar and runtime settings
//! - **pidfile**: scoped single-instance lock
//!
//! The kernel interface is a trait, so the whole control path can be
//! driven against a scripted kernel in tests.

pub mod config;
pub mod error;
pub mod governor;
pub mod pidfile;
pub mod sampler;
pub mod sysctl;
pub mod topology;
pub mod types;

pub use config::Settings;
pub use error::{Exit, Fatal, PidfileError, SysctlError};
pub use governor::{FreqGuard, Governor};
pub use pidfile::Pidfile;
pub use sysctl::{Kernel, Mib, SystemKernel};
pub use types::{AcLineState, AcState, CoreId, CpTime, Mhz};
