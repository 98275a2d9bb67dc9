//! Typed access to the kernel MIB tree.
//!
//! The [`Kernel`] trait carries the four primitives (resolve, size,
//! read, write); [`SysctlSync`] and [`SysctlOnce`] are the typed views
//! built on top. The daemon talks to the live tree through
//! [`SystemKernel`]; tests substitute their own [`Kernel`]
//! implementation.

use std::marker::PhantomData;
use std::sync::Arc;

use crate::error::SysctlError;

/// Maximum number of elements in a MIB address vector.
pub const CTL_MAXNAME: usize = 24;

/// MIB address of the `hw.ncpu` variable.
pub const MIB_HW_NCPU: [i32; 2] = [6, 3];

/// A resolved MIB address vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mib {
    oid: [i32; CTL_MAXNAME],
    depth: usize,
}

impl Mib {
    /// Build an address from a fixed vector, for the handful of
    /// variables with addresses known ahead of time.
    pub fn new(oid: &[i32]) -> Self {
        assert!(oid.len() <= CTL_MAXNAME, "MIB depth exceeds limit");
        let mut fixed = [0; CTL_MAXNAME];
        fixed[..oid.len()].copy_from_slice(oid);
        Self {
            oid: fixed,
            depth: oid.len(),
        }
    }

    pub fn as_slice(&self) -> &[i32] {
        &self.oid[..self.depth]
    }
}

/// The kernel-configuration primitives the daemon runs on.
pub trait Kernel: Send + Sync {
    /// Resolve a dotted variable name to its address.
    fn resolve(&self, name: &str) -> Result<Mib, SysctlError>;

    /// Current byte length of the value at `mib`.
    fn size(&self, mib: &Mib) -> Result<usize, SysctlError>;

    /// Fill `buf` from the value at `mib`, returning the number of
    /// bytes written. A value larger than `buf` is an error.
    fn read(&self, mib: &Mib, buf: &mut [u8]) -> Result<usize, SysctlError>;

    /// Replace the value at `mib` with `buf`.
    fn write(&self, mib: &Mib, buf: &[u8]) -> Result<(), SysctlError>;
}

/// Value types that can cross the kernel boundary.
///
/// The kernel hands binary values around without type information, so
/// the views below insist on an exact width match and a plain-old-data
/// representation.
pub trait CtlValue: bytemuck::Pod {}

impl CtlValue for i32 {}
impl CtlValue for u32 {}
impl CtlValue for u64 {}

/// A live, typed view of a kernel variable.
///
/// Every access round-trips through the kernel; nothing is cached.
#[derive(Clone)]
pub struct SysctlSync<T> {
    kernel: Arc<dyn Kernel>,
    mib: Mib,
    _value: PhantomData<T>,
}

impl<T: CtlValue> SysctlSync<T> {
    /// Resolve `name` and bind the view to it. Fails with `NotFound`
    /// if the kernel has no such variable.
    pub fn resolve(kernel: Arc<dyn Kernel>, name: &str) -> Result<Self, SysctlError> {
        let mib = kernel.resolve(name)?;
        Ok(Self::at(kernel, mib))
    }

    /// Bind the view to an already resolved address.
    pub fn at(kernel: Arc<dyn Kernel>, mib: Mib) -> Self {
        Self {
            kernel,
            mib,
            _value: PhantomData,
        }
    }

    /// Read the current value. A width mismatch is `Truncated`.
    pub fn get(&self) -> Result<T, SysctlError> {
        let mut value = T::zeroed();
        let n = self.kernel.read(&self.mib, bytemuck::bytes_of_mut(&mut value))?;
        if n != std::mem::size_of::<T>() {
            return Err(SysctlError::Truncated);
        }
        Ok(value)
    }

    pub fn set(&self, value: T) -> Result<(), SysctlError> {
        self.kernel.write(&self.mib, bytemuck::bytes_of(&value))
    }
}

/// A value captured once at construction.
///
/// Construction cannot fail; any read failure falls back to the given
/// default. Intended for variables that do not change over the daemon's
/// lifetime, such as `hw.ncpu`.
#[derive(Debug, Clone, Copy)]
pub struct SysctlOnce<T> {
    value: T,
}

impl<T: CtlValue> SysctlOnce<T> {
    pub fn new(fallback: T, kernel: &dyn Kernel, mib: &Mib) -> Self {
        let mut value = T::zeroed();
        let read = kernel
            .read(mib, bytemuck::bytes_of_mut(&mut value))
            .map(|n| n == std::mem::size_of::<T>())
            .unwrap_or(false);
        Self {
            value: if read { value } else { fallback },
        }
    }

    pub fn value(&self) -> T {
        self.value
    }
}

/// Non-throwing read through an optional view, used for values that may
/// legitimately be absent, such as the AC line state.
pub fn once<T: CtlValue>(fallback: T, ctl: Option<&SysctlSync<T>>) -> T {
    ctl.and_then(|ctl| ctl.get().ok()).unwrap_or(fallback)
}

/// Read a variable-length character value, such as a frequency-levels
/// list. Trailing NUL bytes are stripped.
pub fn read_string(kernel: &dyn Kernel, mib: &Mib) -> Result<String, SysctlError> {
    let len = kernel.size(mib)?;
    let mut buf = vec![0u8; len];
    let n = kernel.read(mib, &mut buf)?;
    buf.truncate(n);
    while buf.last() == Some(&0) {
        buf.pop();
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

/// The live MIB tree of the running kernel.
///
/// Only FreeBSD exposes the tree; on other platforms every address
/// resolves to nothing, which keeps the crate buildable and testable
/// there while the binary remains FreeBSD-targeted.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemKernel;

#[cfg(target_os = "freebsd")]
mod system {
    use std::ffi::CString;

    use super::{Kernel, Mib, CTL_MAXNAME};
    use crate::error::SysctlError;

    fn last_errno() -> i32 {
        std::io::Error::last_os_error().raw_os_error().unwrap_or(libc::EIO)
    }

    impl Kernel for super::SystemKernel {
        fn resolve(&self, name: &str) -> Result<Mib, SysctlError> {
            let name = CString::new(name).map_err(|_| SysctlError::NotFound)?;
            let mut oid = [0 as libc::c_int; CTL_MAXNAME];
            let mut depth = CTL_MAXNAME as libc::size_t;
            let rc = unsafe {
                libc::sysctlnametomib(name.as_ptr(), oid.as_mut_ptr(), &mut depth)
            };
            if rc == -1 {
                return Err(SysctlError::from_errno(last_errno()));
            }
            Ok(Mib {
                oid,
                depth: depth as usize,
            })
        }

        fn size(&self, mib: &Mib) -> Result<usize, SysctlError> {
            let mut len: libc::size_t = 0;
            let rc = unsafe {
                libc::sysctl(
                    mib.as_slice().as_ptr(),
                    mib.depth as libc::c_uint,
                    std::ptr::null_mut(),
                    &mut len,
                    std::ptr::null(),
                    0,
                )
            };
            if rc == -1 {
                return Err(SysctlError::from_errno(last_errno()));
            }
            Ok(len as usize)
        }

        fn read(&self, mib: &Mib, buf: &mut [u8]) -> Result<usize, SysctlError> {
            let mut len = buf.len() as libc::size_t;
            let rc = unsafe {
                libc::sysctl(
                    mib.as_slice().as_ptr(),
                    mib.depth as libc::c_uint,
                    buf.as_mut_ptr().cast(),
                    &mut len,
                    std::ptr::null(),
                    0,
                )
            };
            if rc == -1 {
                return Err(SysctlError::from_errno(last_errno()));
            }
            Ok(len as usize)
        }

        fn write(&self, mib: &Mib, buf: &[u8]) -> Result<(), SysctlError> {
            let rc = unsafe {
                libc::sysctl(
                    mib.as_slice().as_ptr(),
                    mib.depth as libc::c_uint,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                    buf.as_ptr().cast(),
                    buf.len() as libc::size_t,
                )
            };
            if rc == -1 {
                return Err(SysctlError::from_errno(last_errno()));
            }
            Ok(())
        }
    }
}

#[cfg(not(target_os = "freebsd"))]
mod system {
    use super::{Kernel, Mib};
    use crate::error::SysctlError;

    impl Kernel for super::SystemKernel {
        fn resolve(&self, _name: &str) -> Result<Mib, SysctlError> {
            Err(SysctlError::NotFound)
        }

        fn size(&self, _mib: &Mib) -> Result<usize, SysctlError> {
            Err(SysctlError::Io(libc::ENOSYS))
        }

        fn read(&self, _mib: &Mib, _buf: &mut [u8]) -> Result<usize, SysctlError> {
            Err(SysctlError::Io(libc::ENOSYS))
        }

        fn write(&self, _mib: &Mib, _buf: &[u8]) -> Result<(), SysctlError> {
            Err(SysctlError::Io(libc::ENOSYS))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// A single-variable kernel: name "v" at address [0].
    struct OneVar {
        value: Mutex<Vec<u8>>,
        names: HashMap<&'static str, Mib>,
    }

    impl OneVar {
        fn new(value: Vec<u8>) -> Self {
            let mut names = HashMap::new();
            names.insert("v", Mib::new(&[0]));
            Self {
                value: Mutex::new(value),
                names,
            }
        }
    }

    impl Kernel for OneVar {
        fn resolve(&self, name: &str) -> Result<Mib, SysctlError> {
            self.names.get(name).copied().ok_or(SysctlError::NotFound)
        }

        fn size(&self, _mib: &Mib) -> Result<usize, SysctlError> {
            Ok(self.value.lock().unwrap().len())
        }

        fn read(&self, _mib: &Mib, buf: &mut [u8]) -> Result<usize, SysctlError> {
            let value = self.value.lock().unwrap();
            if buf.len() < value.len() {
                return Err(SysctlError::Truncated);
            }
            buf[..value.len()].copy_from_slice(&value);
            Ok(value.len())
        }

        fn write(&self, _mib: &Mib, buf: &[u8]) -> Result<(), SysctlError> {
            *self.value.lock().unwrap() = buf.to_vec();
            Ok(())
        }
    }

    #[test]
    fn sync_view_roundtrips_values() {
        let kernel: Arc<dyn Kernel> = Arc::new(OneVar::new(1700u32.to_ne_bytes().to_vec()));
        let ctl = SysctlSync::<u32>::resolve(kernel, "v").unwrap();
        assert_eq!(ctl.get().unwrap(), 1700);
        ctl.set(2200).unwrap();
        assert_eq!(ctl.get().unwrap(), 2200);
    }

    #[test]
    fn sync_view_rejects_width_mismatch() {
        let kernel: Arc<dyn Kernel> = Arc::new(OneVar::new(vec![0u8; 2]));
        let ctl = SysctlSync::<u32>::resolve(kernel, "v").unwrap();
        assert_eq!(ctl.get(), Err(SysctlError::Truncated));
    }

    #[test]
    fn resolve_unknown_name_is_not_found() {
        let kernel: Arc<dyn Kernel> = Arc::new(OneVar::new(vec![]));
        assert_eq!(
            SysctlSync::<u32>::resolve(kernel, "hw.nope").err(),
            Some(SysctlError::NotFound)
        );
    }

    #[test]
    fn once_falls_back_on_failure() {
        let kernel = OneVar::new(8i32.to_ne_bytes().to_vec());
        let mib = Mib::new(&[0]);
        assert_eq!(SysctlOnce::new(1i32, &kernel, &mib).value(), 8);
        // unreadable address falls back
        let empty = OneVar::new(vec![]);
        assert_eq!(SysctlOnce::new(1i32, &empty, &mib).value(), 1);
    }

    #[test]
    fn once_helper_defaults_on_absent_handle() {
        assert_eq!(once(2u32, None), 2);
        let kernel: Arc<dyn Kernel> = Arc::new(OneVar::new(1u32.to_ne_bytes().to_vec()));
        let ctl = SysctlSync::<u32>::resolve(kernel, "v").unwrap();
        assert_eq!(once(2u32, Some(&ctl)), 1);
    }

    #[test]
    fn read_string_strips_trailing_nul() {
        let kernel = OneVar::new(b"2400/80000 1600/50000\0".to_vec());
        let mib = Mib::new(&[0]);
        assert_eq!(read_string(&kernel, &mib).unwrap(), "2400/80000 1600/50000");
    }
}
