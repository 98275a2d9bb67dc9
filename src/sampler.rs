//! Tick-counter sampling and load estimation.
//!
//! A flat ring buffer holds `samples` snapshots of the kernel's
//! per-core tick counters. Each snapshot is one contiguous kernel read
//! covering every core, so the counters within a frame are mutually
//! consistent. The load of a core is the non-idle share of the delta
//! between the newest and the oldest frame, in 1/1024 units.

use std::sync::Arc;

use crate::error::{sysctl_fail, Fatal, SysctlError};
use crate::sysctl::{Kernel, Mib};
use crate::topology::Core;
use crate::types::{CpTime, CPUSTATES, CP_IDLE, CP_TIMES};

pub struct Sampler {
    kernel: Arc<dyn Kernel>,
    cp_times: Mib,
    ncpu: usize,
    samples: usize,
    /// Next frame to overwrite.
    head: usize,
    /// `samples * ncpu * CPUSTATES` counters, flat.
    ring: Vec<CpTime>,
}

impl Sampler {
    /// Resolve the counter variable and allocate the ring.
    ///
    /// `samples` must be at least 2; with fewer there is no window to
    /// difference over.
    pub fn new(kernel: Arc<dyn Kernel>, ncpu: usize, samples: usize) -> Result<Self, Fatal> {
        debug_assert!(samples >= 2, "a load window needs at least two samples");
        let cp_times = kernel.resolve(CP_TIMES).map_err(sysctl_fail)?;
        Ok(Self {
            kernel,
            cp_times,
            ncpu,
            samples,
            head: 0,
            ring: vec![0; samples * ncpu * CPUSTATES],
        })
    }

    pub fn samples(&self) -> usize {
        self.samples
    }

    /// Fill the ring with `samples - 1` back-to-back snapshots so the
    /// first real tick has a full window of history. The first
    /// adaptive decision is therefore based on a very short window.
    pub fn prime(&mut self, cores: &mut [Core]) -> Result<(), Fatal> {
        for _ in 1..self.samples {
            self.sample(cores)?;
        }
        Ok(())
    }

    /// Take one snapshot and refresh each core's load estimate.
    pub fn sample(&mut self, cores: &mut [Core]) -> Result<(), Fatal> {
        let stride = self.ncpu * CPUSTATES;
        let frame = &mut self.ring[self.head * stride..][..stride];
        let bytes = bytemuck::cast_slice_mut::<CpTime, u8>(frame);
        let want = bytes.len();
        let got = self.kernel.read(&self.cp_times, bytes).map_err(sysctl_fail)?;
        if got != want {
            return Err(sysctl_fail(SysctlError::Truncated));
        }

        // The frame just written is the newest; the one after it in
        // ring order is the oldest still present.
        let newest = self.head * stride;
        let oldest = ((self.head + 1) % self.samples) * stride;
        for (core, state) in cores.iter_mut().enumerate() {
            let new = &self.ring[newest + core * CPUSTATES..][..CPUSTATES];
            let old = &self.ring[oldest + core * CPUSTATES..][..CPUSTATES];
            let mut all: CpTime = 0;
            for s in 0..CPUSTATES {
                all = all.wrapping_add(new[s].wrapping_sub(old[s]));
            }
            let idle = new[CP_IDLE].wrapping_sub(old[CP_IDLE]);
            state.load = if all == 0 {
                0
            } else {
                (all.wrapping_sub(idle) << 10) / all
            };
        }
        self.head = (self.head + 1) % self.samples;
        Ok(())
    }
}

/// Fold each follower's load into its controller, which then clocks
/// for the worst case in its group.
pub fn coalesce_groups(cores: &mut [Core]) {
    for core in 0..cores.len() {
        debug_assert!(cores[core].controller >= 0);
        let controller = cores[core].controller as usize;
        if controller == core {
            continue;
        }
        cores[controller].load = cores[controller].load.max(cores[core].load);
    }
}
