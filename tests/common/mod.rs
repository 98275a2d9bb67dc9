//! A scripted kernel for driving the governor without a MIB tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use powerdxx::error::SysctlError;
use powerdxx::sysctl::{Kernel, Mib, MIB_HW_NCPU};
use powerdxx::types::{CpTime, CPUSTATES};

/// An in-memory variable store implementing the [`Kernel`] trait.
///
/// Variables are byte vectors keyed by name; resolved addresses are
/// indices into the registration order. The fixed `hw.ncpu` address is
/// recognised so read-by-vector works like it does against the real
/// tree. All writes are journalled for assertions.
#[derive(Default)]
pub struct FakeKernel {
    names: Mutex<Vec<String>>,
    values: Mutex<HashMap<String, Vec<u8>>>,
    writes: Mutex<Vec<(String, Vec<u8>)>>,
    denied: Mutex<HashSet<String>>,
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_bytes(&self, name: &str, bytes: Vec<u8>) {
        self.values.lock().insert(name.to_string(), bytes);
    }

    pub fn set_i32(&self, name: &str, value: i32) {
        self.set_bytes(name, value.to_ne_bytes().to_vec());
    }

    pub fn set_u32(&self, name: &str, value: u32) {
        self.set_bytes(name, value.to_ne_bytes().to_vec());
    }

    pub fn set_str(&self, name: &str, value: &str) {
        let mut bytes = value.as_bytes().to_vec();
        bytes.push(0);
        self.set_bytes(name, bytes);
    }

    pub fn set_cp_times(&self, ticks: &[CpTime]) {
        let bytes = ticks.iter().flat_map(|tick| tick.to_ne_bytes()).collect();
        self.set_bytes("kern.cp_times", bytes);
    }

    /// Make writes to `name` fail with `Denied`.
    pub fn deny(&self, name: &str) {
        self.denied.lock().insert(name.to_string());
    }

    pub fn writes_to(&self, name: &str) -> usize {
        self.writes
            .lock()
            .iter()
            .filter(|(written, _)| written == name)
            .count()
    }

    pub fn last_write_u32(&self, name: &str) -> Option<u32> {
        self.writes
            .lock()
            .iter()
            .rev()
            .find(|(written, _)| written == name)
            .map(|(_, bytes)| u32::from_ne_bytes(bytes.as_slice().try_into().unwrap()))
    }

    fn name_of(&self, mib: &Mib) -> Result<String, SysctlError> {
        let oid = mib.as_slice();
        if oid == MIB_HW_NCPU {
            return Ok("hw.ncpu".to_string());
        }
        let names = self.names.lock();
        match oid {
            [index] => names
                .get(*index as usize)
                .cloned()
                .ok_or(SysctlError::NotFound),
            _ => Err(SysctlError::NotFound),
        }
    }
}

impl Kernel for FakeKernel {
    fn resolve(&self, name: &str) -> Result<Mib, SysctlError> {
        if !self.values.lock().contains_key(name) {
            return Err(SysctlError::NotFound);
        }
        let mut names = self.names.lock();
        let index = match names.iter().position(|known| known == name) {
            Some(index) => index,
            None => {
                names.push(name.to_string());
                names.len() - 1
            }
        };
        Ok(Mib::new(&[index as i32]))
    }

    fn size(&self, mib: &Mib) -> Result<usize, SysctlError> {
        let name = self.name_of(mib)?;
        let values = self.values.lock();
        values
            .get(&name)
            .map(Vec::len)
            .ok_or(SysctlError::NotFound)
    }

    fn read(&self, mib: &Mib, buf: &mut [u8]) -> Result<usize, SysctlError> {
        let name = self.name_of(mib)?;
        let values = self.values.lock();
        let value = values.get(&name).ok_or(SysctlError::NotFound)?;
        if buf.len() < value.len() {
            return Err(SysctlError::Truncated);
        }
        buf[..value.len()].copy_from_slice(value);
        Ok(value.len())
    }

    fn write(&self, mib: &Mib, buf: &[u8]) -> Result<(), SysctlError> {
        let name = self.name_of(mib)?;
        if self.denied.lock().contains(&name) {
            return Err(SysctlError::Denied);
        }
        self.values.lock().insert(name.clone(), buf.to_vec());
        self.writes.lock().push((name, buf.to_vec()));
        Ok(())
    }
}

/// A kernel with `ncpu` cores and zeroed tick counters.
pub fn base_kernel(ncpu: i32) -> Arc<FakeKernel> {
    let kernel = Arc::new(FakeKernel::new());
    kernel.set_i32("hw.ncpu", ncpu);
    kernel.set_cp_times(&vec![0; ncpu as usize * CPUSTATES]);
    kernel
}

/// Give core `id` its own frequency variable and advertised levels.
pub fn add_controller(kernel: &FakeKernel, id: usize, mhz: u32, levels: &str) {
    kernel.set_u32(&format!("dev.cpu.{id}.freq"), mhz);
    if !levels.is_empty() {
        kernel.set_str(&format!("dev.cpu.{id}.freq_levels"), levels);
    }
}
