//! Core enumeration and clock-group discovery.
//!
//! Not every core exposes its own frequency variable; a core without
//! one is clocked by the nearest preceding core that does. Discovery
//! walks the cores in order and records that controller relation, then
//! reads the advertised frequency levels of each controller to learn
//! the hardware clock bounds.

use std::sync::Arc;

use crate::error::{fail, sysctl_fail, Exit, Fatal, SysctlError};
use crate::sysctl::{read_string, Kernel, Mib, SysctlOnce, SysctlSync, MIB_HW_NCPU};
use crate::types::{CoreId, CpTime, Mhz, FREQ_DEFAULT_MAX, FREQ_DEFAULT_MIN};

/// Management information for a single CPU core.
pub struct Core {
    /// The core's frequency variable, absent on follower cores.
    pub freq: Option<SysctlSync<Mhz>>,
    /// The core that controls the frequency for this core.
    pub controller: CoreId,
    /// The load during the last window, a value in [0, 1024].
    pub load: CpTime,
    /// The minimum core clock rate.
    pub min: Mhz,
    /// The maximum core clock rate.
    pub max: Mhz,
}

impl Core {
    /// Whether this core controls the clock of its group.
    pub fn is_controller(&self, id: CoreId) -> bool {
        self.controller == id
    }
}

fn freq_name(core: CoreId) -> String {
    format!("dev.cpu.{core}.freq")
}

fn freq_levels_name(core: CoreId) -> String {
    format!("dev.cpu.{core}.freq_levels")
}

/// Enumerate cores and assign each its clock-controlling core.
///
/// The first core must be a controller; a system where it is not
/// cannot be governed at all.
pub fn discover(kernel: &Arc<dyn Kernel>) -> Result<Vec<Core>, Fatal> {
    let ncpu = SysctlOnce::new(1 as CoreId, kernel.as_ref(), &Mib::new(&MIB_HW_NCPU))
        .value()
        .max(1) as usize;

    let mut cores = Vec::with_capacity(ncpu);
    let mut controller: CoreId = -1;
    for core in 0..ncpu as CoreId {
        let name = freq_name(core);
        let freq = match SysctlSync::resolve(kernel.clone(), &name) {
            Ok(ctl) => {
                controller = core;
                Some(ctl)
            }
            Err(SysctlError::NotFound) => {
                log::info!("cannot access sysctl: {name}");
                if controller < 0 {
                    return Err(fail(
                        Exit::NoFreq,
                        libc::ENOENT,
                        "at least the first CPU core must support frequency updates",
                    ));
                }
                None
            }
            Err(err) => return Err(sysctl_fail(err)),
        };
        cores.push(Core {
            freq,
            controller,
            load: 0,
            min: FREQ_DEFAULT_MIN,
            max: FREQ_DEFAULT_MAX,
        });
    }

    read_hw_limits(kernel, &mut cores);
    Ok(cores)
}

/// Read each controller's advertised frequency levels and derive the
/// hardware clock bounds from them. Missing or empty level lists keep
/// the defaults.
fn read_hw_limits(kernel: &Arc<dyn Kernel>, cores: &mut [Core]) {
    for core in 0..cores.len() {
        if !cores[core].is_controller(core as CoreId) {
            continue;
        }
        let name = freq_levels_name(core as CoreId);
        let levels = kernel
            .resolve(&name)
            .and_then(|mib| read_string(kernel.as_ref(), &mib));
        match levels {
            Ok(levels) => {
                if let Some((min, max)) = parse_freq_levels(&levels) {
                    cores[core].min = min;
                    cores[core].max = max;
                    debug_assert!(min <= max, "minimum must not be greater than maximum");
                }
            }
            Err(_) => log::info!("cannot access sysctl: {name}"),
        }
    }
}

/// Extract the frequency bounds from a space-separated list of
/// `<freq>/<power>` pairs. The power figure is only parsed for the
/// delimiter; a malformed entry ends the scan, keeping the pairs seen
/// so far.
fn parse_freq_levels(levels: &str) -> Option<(Mhz, Mhz)> {
    let mut min: Option<Mhz> = None;
    let mut max: Option<Mhz> = None;
    for pair in levels.split(' ') {
        let Some((freq, _power)) = pair.split_once('/') else {
            break;
        };
        let Ok(freq) = freq.parse::<Mhz>() else {
            break;
        };
        min = Some(min.map_or(freq, |lo| lo.min(freq)));
        max = Some(max.map_or(freq, |hi| hi.max(freq)));
    }
    min.zip(max)
}
