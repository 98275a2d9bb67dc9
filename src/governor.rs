//! The per-tick frequency decision and the main loop.
//!
//! Each tick samples the tick counters, folds group loads onto the
//! clock-controlling cores, reads the AC line state and picks a new
//! frequency for every controller from the active policy. Writes only
//! happen when the decision differs from the current clock.

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::config::Settings;
use crate::error::{fail, sysctl_fail, Exit, Fatal, SysctlError};
use crate::sampler::{coalesce_groups, Sampler};
use crate::sysctl::{once, Kernel, SysctlSync};
use crate::topology::{self, Core};
use crate::types::{AcLineState, AcState, CoreId, CpTime, Mhz, ACLINE, FREQ_UNSET};

pub struct Governor {
    cores: Vec<Core>,
    sampler: Sampler,
    /// The AC line variable, absent when the platform lacks one.
    acline: Option<SysctlSync<u32>>,
    acstates: [AcState; AcLineState::COUNT],
    interval: Duration,
    foreground: bool,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor").finish_non_exhaustive()
    }
}

impl Governor {
    /// Discover the topology and freeze the policy table.
    ///
    /// A missing AC line variable is tolerated (all ticks then run the
    /// `unknown` policy); a missing frequency variable on the first
    /// core is not.
    pub fn new(kernel: Arc<dyn Kernel>, settings: &Settings) -> Result<Self, Fatal> {
        let acline = match SysctlSync::resolve(kernel.clone(), ACLINE) {
            Ok(ctl) => Some(ctl),
            Err(_) => {
                log::info!("cannot read {ACLINE}");
                None
            }
        };

        let cores = topology::discover(&kernel)?;
        let sampler = Sampler::new(kernel, cores.len(), settings.samples)?;

        // bounds left unset by the operator inherit the unknown slot
        let mut acstates = settings.acstates;
        let unknown = acstates[AcLineState::Unknown as usize];
        for acstate in &mut acstates {
            if acstate.freq_min == FREQ_UNSET {
                acstate.freq_min = unknown.freq_min;
            }
            if acstate.freq_max == FREQ_UNSET {
                acstate.freq_max = unknown.freq_max;
            }
        }

        Ok(Self {
            cores,
            sampler,
            acline,
            acstates,
            interval: settings.interval,
            foreground: settings.foreground,
        })
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    /// The policy slot that would govern the given AC line state.
    pub fn policy(&self, line: AcLineState) -> &AcState {
        &self.acstates[line as usize]
    }

    /// Fill the sampling window before the first real tick.
    pub fn prime(&mut self) -> Result<(), Fatal> {
        self.sampler.prime(&mut self.cores)
    }

    /// The current AC line state; any read failure reads as unknown.
    pub fn acline_state(&self) -> AcLineState {
        AcLineState::from_raw(once(
            AcLineState::Unknown as u32,
            self.acline.as_ref(),
        ))
    }

    /// Run one sampling and actuation cycle.
    pub fn tick(&mut self) -> Result<(), Fatal> {
        self.sampler.sample(&mut self.cores)?;
        coalesce_groups(&mut self.cores);

        let line = self.acline_state();
        let acstate = self.acstates[line as usize];
        debug_assert!(
            acstate.target_load <= 1024,
            "load target must be in the range [0, 1024]"
        );

        for (id, core) in self.cores.iter().enumerate() {
            if !core.is_controller(id as CoreId) {
                continue;
            }
            let Some(freq) = &core.freq else { continue };

            let old = freq.get().map_err(sysctl_fail)?;
            let want = if acstate.target_load > 0 {
                // adaptive mode
                debug_assert!(
                    old >> 22 == 0,
                    "CPU clock frequency exceeds values that are safe to compute"
                );
                (CpTime::from(old) * core.load / acstate.target_load) as Mhz
            } else {
                // fixed frequency mode
                acstate.target_freq
            };

            // nested min/max rather than clamp: inverted operator
            // bounds settle on the upper limit instead of panicking
            let hi = core.max.min(acstate.freq_max);
            let lo = core.min.max(acstate.freq_min);
            let new = want.max(lo).min(hi);
            if new != old {
                freq.set(new).map_err(sysctl_fail)?;
            }

            if self.foreground {
                println!(
                    "power: {:>7}, load: {:>3}%, cpu{}.freq: {:>4} MHz, wanted: {:>4} MHz",
                    line,
                    (core.load * 100 + 512) / 1024,
                    id,
                    old,
                    want
                );
            }
        }
        Ok(())
    }

    /// The main loop: absolute-deadline scheduling at the configured
    /// interval, terminated by the first nonzero value in `signal`.
    ///
    /// An overrunning tick skips its sleep instead of shifting all
    /// later deadlines.
    pub fn run(&mut self, signal: &AtomicI32) -> Result<(), Fatal> {
        let mut deadline = Instant::now();
        while signal.load(Ordering::Relaxed) == 0 {
            deadline += self.interval;
            sleep_until(deadline);
            self.tick()?;
        }
        log::info!(
            "signal {} received, exiting ...",
            signal.load(Ordering::Relaxed)
        );
        Ok(())
    }

    /// Log the effective configuration.
    pub fn log_settings(&self) {
        if !log::log_enabled!(log::Level::Info) {
            return;
        }
        let samples = self.sampler.samples();
        let interval = self.interval.as_millis();
        log::info!("cp_time samples: {samples}");
        log::info!("polling interval: {interval} ms");
        log::info!("load average over: {} ms", (samples as u128 - 1) * interval);
        for (state, acstate) in ["battery", "online", "unknown"].iter().zip(&self.acstates) {
            log::info!(
                "{state} frequency limits: [{} MHz, {} MHz]",
                acstate.freq_min,
                acstate.freq_max
            );
        }
        log::info!("CPU cores: {}", self.cores.len());
        for (id, core) in self.cores.iter().enumerate() {
            if !core.is_controller(id as CoreId) {
                continue;
            }
            let group_end = self.cores[id..]
                .iter()
                .position(|other| other.controller != id as CoreId)
                .map_or(self.cores.len(), |len| id + len);
            log::info!("core group {id}: [{id}, {}]", group_end - 1);
            log::info!("cpu{id} frequency limits: [{} MHz, {} MHz]", core.min, core.max);
        }
        for (state, acstate) in ["battery", "online", "unknown"].iter().zip(&self.acstates) {
            if acstate.target_load > 0 {
                log::info!(
                    "{state} power target: {}% load",
                    (acstate.target_load * 100 + 512) / 1024
                );
            } else {
                log::info!("{state} power target: {} MHz", acstate.target_freq);
            }
        }
    }
}

fn sleep_until(deadline: Instant) {
    if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
        thread::sleep(wait);
    }
}

/// A core frequency guard bracketing the main loop.
///
/// Construction reads and rewrites every controller's clock, proving
/// write access before the daemon detaches. Dropping it settles every
/// controller on its hardware maximum.
pub struct FreqGuard {
    restore: Vec<(SysctlSync<Mhz>, Mhz)>,
}

impl std::fmt::Debug for FreqGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FreqGuard").finish_non_exhaustive()
    }
}

impl FreqGuard {
    pub fn new(cores: &[Core]) -> Result<Self, Fatal> {
        let mut restore = Vec::new();
        for (id, core) in cores.iter().enumerate() {
            if !core.is_controller(id as CoreId) {
                continue;
            }
            let Some(freq) = &core.freq else { continue };
            match freq.get().and_then(|value| freq.set(value)) {
                Ok(()) => restore.push((freq.clone(), core.max)),
                Err(SysctlError::Denied) => {
                    return Err(fail(
                        Exit::Forbidden,
                        libc::EPERM,
                        "insufficient privileges to change core frequency",
                    ))
                }
                Err(err) => return Err(sysctl_fail(err)),
            }
        }
        Ok(Self { restore })
    }
}

impl Drop for FreqGuard {
    fn drop(&mut self) {
        for (freq, max) in &self.restore {
            // best effort on the way out
            let _ = freq.set(*max);
        }
    }
}
