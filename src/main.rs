//! Daemon entry point: command line handling, signal wiring,
//! daemonisation and the top-level error funnel.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use clap::error::ErrorKind;
use clap::Parser;

use powerdxx::config::{self, Settings};
use powerdxx::error::{fail, Exit, Fatal, PidfileError};
use powerdxx::governor::{FreqGuard, Governor};
use powerdxx::pidfile::Pidfile;
use powerdxx::sysctl::{Kernel, SystemKernel};
use powerdxx::types::AcLineState;

/// Adaptive CPU clock control.
#[derive(Debug, Parser)]
#[command(name = "powerdxx")]
#[command(about = "Adaptive CPU clock control", long_about = None)]
struct Cli {
    /// Be verbose
    #[arg(short, long)]
    verbose: bool,

    /// Stay in foreground, log ticks to stdout
    #[arg(short, long)]
    foreground: bool,

    /// Select the mode while on AC power
    #[arg(short = 'a', long = "ac", value_name = "mode")]
    ac: Option<String>,

    /// Select the mode while on battery power
    #[arg(short = 'b', long = "batt", value_name = "mode")]
    batt: Option<String>,

    /// Select the mode while the power source is unknown
    #[arg(short = 'n', long = "unknown", value_name = "mode")]
    unknown: Option<String>,

    /// The minimum CPU frequency
    #[arg(short = 'm', long = "min", value_name = "freq")]
    min: Option<String>,

    /// The maximum CPU frequency
    #[arg(short = 'M', long = "max", value_name = "freq")]
    max: Option<String>,

    /// The minimum CPU frequency on AC power
    #[arg(long = "min-ac", value_name = "freq")]
    min_ac: Option<String>,

    /// The maximum CPU frequency on AC power
    #[arg(long = "max-ac", value_name = "freq")]
    max_ac: Option<String>,

    /// The minimum CPU frequency on battery power
    #[arg(long = "min-batt", value_name = "freq")]
    min_batt: Option<String>,

    /// The maximum CPU frequency on battery power
    #[arg(long = "max-batt", value_name = "freq")]
    max_batt: Option<String>,

    /// The polling interval
    #[arg(short = 'p', long = "poll", value_name = "ival")]
    poll: Option<String>,

    /// The number of samples to use
    #[arg(short = 's', long = "samples", value_name = "cnt")]
    samples: Option<String>,

    /// Alternative PID file
    #[arg(short = 'P', long = "pid", value_name = "file")]
    pid: Option<PathBuf>,

    /// Ignored, accepted for powerd compatibility
    #[arg(short = 'i', value_name = "load")]
    legacy_idle: Option<String>,

    /// Ignored, accepted for powerd compatibility
    #[arg(short = 'r', value_name = "load")]
    legacy_read: Option<String>,
}

/// The first terminating signal received, 0 while running.
static SIGNAL: AtomicI32 = AtomicI32::new(0);

extern "C" fn signal_recv(signal: libc::c_int) {
    SIGNAL.store(signal, Ordering::Relaxed);
}

/// Install a signal disposition, `handler` being either a handler
/// function or one of `SIG_IGN`/`SIG_DFL`.
fn install_signal(signal: libc::c_int, handler: libc::sighandler_t) -> Result<(), Fatal> {
    // SAFETY: the handler only performs a single atomic store, which
    // is async-signal-safe per POSIX.
    let previous = unsafe { libc::signal(signal, handler) };
    if previous == libc::SIG_ERR {
        return Err(fail(
            Exit::Signal,
            std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
            format!("cannot install handler for signal {signal}"),
        ));
    }
    Ok(())
}

fn handler() -> libc::sighandler_t {
    signal_recv as *const () as libc::sighandler_t
}

/// Fold the parsed command line into runtime settings, translating
/// each option value through its grammar.
fn settings(cli: &Cli) -> Result<Settings, Fatal> {
    let mut settings = Settings::default();
    settings.verbose = cli.verbose;
    settings.foreground = cli.foreground;

    if let Some(mode) = &cli.ac {
        config::set_mode(&mut settings.acstates, AcLineState::Online, mode)?;
    }
    if let Some(mode) = &cli.batt {
        config::set_mode(&mut settings.acstates, AcLineState::Battery, mode)?;
    }
    if let Some(mode) = &cli.unknown {
        config::set_mode(&mut settings.acstates, AcLineState::Unknown, mode)?;
    }

    if let Some(value) = &cli.min {
        settings.acstates[AcLineState::Unknown as usize].freq_min = config::freq(value)?;
    }
    if let Some(value) = &cli.max {
        settings.acstates[AcLineState::Unknown as usize].freq_max = config::freq(value)?;
    }
    if let Some(value) = &cli.min_ac {
        settings.acstates[AcLineState::Online as usize].freq_min = config::freq(value)?;
    }
    if let Some(value) = &cli.max_ac {
        settings.acstates[AcLineState::Online as usize].freq_max = config::freq(value)?;
    }
    if let Some(value) = &cli.min_batt {
        settings.acstates[AcLineState::Battery as usize].freq_min = config::freq(value)?;
    }
    if let Some(value) = &cli.max_batt {
        settings.acstates[AcLineState::Battery as usize].freq_max = config::freq(value)?;
    }

    if let Some(value) = &cli.poll {
        settings.interval = config::ival(value)?;
    }
    if let Some(value) = &cli.samples {
        settings.samples = config::samples(value)?;
    }
    if let Some(path) = &cli.pid {
        settings.pidfile = path.clone();
    }

    Ok(settings)
}

/// Acquire the single-instance lock, prove actuation works, detach and
/// run the loop.
fn run_daemon(mut governor: Governor, settings: &Settings) -> Result<(), Fatal> {
    let mut pidfile = match Pidfile::open(&settings.pidfile, 0o600) {
        Ok(pidfile) => pidfile,
        Err(PidfileError::Conflict(other)) => {
            return Err(fail(
                Exit::Conflict,
                libc::EEXIST,
                format!("a power daemon is already running under PID: {other}"),
            ))
        }
        Err(PidfileError::Io(err)) => {
            return Err(fail(
                Exit::Pid,
                err.raw_os_error().unwrap_or(0),
                format!("cannot create pidfile {}", settings.pidfile.display()),
            ))
        }
    };

    // try to set frequencies once, before detaching from the terminal
    let _guard = FreqGuard::new(governor.cores())?;

    if !settings.foreground {
        // SAFETY: no other threads are running at this point.
        if unsafe { libc::daemon(0, 1) } == -1 {
            return Err(fail(
                Exit::Daemon,
                std::io::Error::last_os_error().raw_os_error().unwrap_or(0),
                "detaching the process failed",
            ));
        }
    }

    // Terminal hangup terminates a foreground run; a detached daemon
    // must survive it.
    if settings.foreground {
        install_signal(libc::SIGHUP, handler())?;
    } else {
        install_signal(libc::SIGHUP, libc::SIG_IGN)?;
    }

    pidfile.write().map_err(|err| {
        let errno = match &err {
            PidfileError::Io(err) => err.raw_os_error().unwrap_or(0),
            PidfileError::Conflict(_) => libc::EEXIST,
        };
        fail(
            Exit::Pid,
            errno,
            format!("cannot write to pidfile: {}", settings.pidfile.display()),
        )
    })?;

    governor.run(&SIGNAL)
}

fn run(settings: &Settings) -> Result<(), Fatal> {
    let kernel: Arc<dyn Kernel> = Arc::new(SystemKernel);
    let mut governor = Governor::new(kernel, settings)?;
    governor.log_settings();
    governor.prime()?;
    run_daemon(governor, settings)
}

fn main() -> ExitCode {
    if let Err(err) = install_signal(libc::SIGINT, handler())
        .and_then(|()| install_signal(libc::SIGTERM, handler()))
    {
        eprintln!("{err}");
        return ExitCode::from(err.code.code());
    }

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err)
            if matches!(
                err.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion
            ) =>
        {
            let _ = err.print();
            return ExitCode::SUCCESS;
        }
        Err(err) => {
            let _ = err.print();
            return ExitCode::from(Exit::ClArg.code());
        }
    };

    env_logger::Builder::from_default_env()
        .filter_level(if cli.verbose {
            log::LevelFilter::Info
        } else {
            log::LevelFilter::Warn
        })
        .init();

    match settings(&cli).and_then(|settings| run(&settings)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            if !err.msg.is_empty() {
                eprintln!("{err}");
            }
            ExitCode::from(err.code.code())
        }
    }
}
