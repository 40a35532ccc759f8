//! Guard pages over arbitrary page-aligned ranges.
//!
//! `MADV_GUARD_INSTALL` / `MADV_GUARD_REMOVE` (Linux 6.13+) mark page table
//! entries as faulting without splitting the VMA, unlike `mprotect()`. When
//! the kernel rejects the advice, `mprotect()` is used instead and the advice
//! is not tried again.
//!
//! Ranges must be private read/write anonymous memory. Their contents are
//! unspecified once a guard has been installed over them.

use std::ffi::c_void;
use std::io;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

use thiserror::Error;
use tracing::debug;

use crate::config::ConfigError;

#[cfg(any(target_os = "linux", target_os = "android"))]
const MADV_GUARD_INSTALL: libc::c_int = 102;
#[cfg(any(target_os = "linux", target_os = "android"))]
const MADV_GUARD_REMOVE: libc::c_int = 103;

const ADVISE_UNKNOWN: u8 = 0;
const ADVISE_SUPPORTED: u8 = 1;
const ADVISE_UNSUPPORTED: u8 = 2;

static ADVISE_STATE: AtomicU8 = AtomicU8::new(ADVISE_UNKNOWN);
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// How a guard was applied or lifted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardMechanism {
    /// `madvise(MADV_GUARD_*)`.
    Advise,
    /// `mprotect()`.
    Protect,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum GuardError {
    #[error("guard range {addr:#x}+{len:#x} is not page aligned")]
    Unaligned { addr: usize, len: usize },
    #[error("failed to guard {addr:#x}+{len:#x}: mprotect: {}", os_error(.errno))]
    Protect { addr: usize, len: usize, errno: i32 },
    #[error("failed to map guarded pool of {len} bytes: {}", os_error(.errno))]
    Map { len: usize, errno: i32 },
    #[error("guarded pool is already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// System page size.
#[inline]
pub fn page_size() -> usize {
    let cached = PAGE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }
    let size = match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
        n if n > 0 => n as usize,
        _ => 4096,
    };
    PAGE_SIZE.store(size, Ordering::Relaxed);
    size
}

/// Whether the advisory mechanism is in use. `None` until first tried.
pub fn advise_supported() -> Option<bool> {
    match ADVISE_STATE.load(Ordering::Relaxed) {
        ADVISE_SUPPORTED => Some(true),
        ADVISE_UNSUPPORTED => Some(false),
        _ => None,
    }
}

/// Makes `[addr, addr + len)` inaccessible.
///
/// Installing over an already guarded range is a no-op.
pub fn memory_guard_install(addr: *mut u8, len: usize) -> Result<GuardMechanism, GuardError> {
    check_aligned(addr, len)?;

    if try_advise(addr, len, Direction::Install) {
        return Ok(GuardMechanism::Advise);
    }

    protect(addr, len, libc::PROT_NONE)?;
    Ok(GuardMechanism::Protect)
}

/// Makes `[addr, addr + len)` accessible again, undoing either mechanism.
///
/// Removing from an unguarded range is a no-op. Restoring read/write
/// protection on pages that already have it does not split the mapping.
pub fn memory_guard_remove(addr: *mut u8, len: usize) -> Result<GuardMechanism, GuardError> {
    check_aligned(addr, len)?;

    let advised = try_advise(addr, len, Direction::Remove);
    match protect(addr, len, libc::PROT_READ | libc::PROT_WRITE) {
        Ok(()) if advised => Ok(GuardMechanism::Advise),
        Ok(()) => Ok(GuardMechanism::Protect),
        Err(_) if advised => Ok(GuardMechanism::Advise),
        Err(err) => Err(err),
    }
}

/// A guard owned by the caller, removed on drop.
#[derive(Debug)]
pub struct GuardRegion {
    addr: *mut u8,
    len: usize,
    mechanism: GuardMechanism,
}

impl GuardRegion {
    /// # Safety
    /// `[addr, addr + len)` must be a mapped read/write range the caller owns
    /// for the lifetime of the returned value.
    pub unsafe fn install(addr: *mut u8, len: usize) -> Result<Self, GuardError> {
        let mechanism = memory_guard_install(addr, len)?;
        Ok(Self { addr, len, mechanism })
    }

    pub fn mechanism(&self) -> GuardMechanism {
        self.mechanism
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for GuardRegion {
    fn drop(&mut self) {
        if let Err(err) = memory_guard_remove(self.addr, self.len) {
            debug!("failed to remove guard on drop: {err}");
        }
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Install,
    Remove,
}

fn check_aligned(addr: *mut u8, len: usize) -> Result<(), GuardError> {
    let page = page_size();
    if (addr as usize) % page != 0 || len % page != 0 {
        return Err(GuardError::Unaligned {
            addr: addr as usize,
            len,
        });
    }
    Ok(())
}

fn protect(addr: *mut u8, len: usize, prot: libc::c_int) -> Result<(), GuardError> {
    if unsafe { libc::mprotect(addr as *mut c_void, len, prot) } == 0 {
        return Ok(());
    }
    Err(GuardError::Protect {
        addr: addr as usize,
        len,
        errno: last_errno(),
    })
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn try_advise(addr: *mut u8, len: usize, direction: Direction) -> bool {
    if ADVISE_STATE.load(Ordering::Relaxed) == ADVISE_UNSUPPORTED {
        return false;
    }
    let advice = match direction {
        Direction::Install => MADV_GUARD_INSTALL,
        Direction::Remove => MADV_GUARD_REMOVE,
    };
    if unsafe { libc::madvise(addr as *mut c_void, len, advice) } == 0 {
        ADVISE_STATE.store(ADVISE_SUPPORTED, Ordering::Relaxed);
        return true;
    }
    let errno = last_errno();
    if errno == libc::EINVAL
        && ADVISE_STATE
            .compare_exchange(ADVISE_UNKNOWN, ADVISE_UNSUPPORTED, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    {
        debug!("MADV_GUARD_* not supported by the kernel, falling back to mprotect()");
    } else {
        debug!(
            "madvise guard {:#x}+{:#x} failed: {}",
            addr as usize,
            len,
            io::Error::from_raw_os_error(errno)
        );
    }
    false
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn try_advise(_addr: *mut u8, _len: usize, _direction: Direction) -> bool {
    ADVISE_STATE.store(ADVISE_UNSUPPORTED, Ordering::Relaxed);
    false
}

fn os_error(errno: &i32) -> io::Error {
    io::Error::from_raw_os_error(*errno)
}

#[inline]
fn last_errno() -> i32 {
    io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_size_is_power_of_two() {
        assert!(page_size().is_power_of_two());
        assert_eq!(page_size(), page_size());
    }

    #[test]
    fn test_unaligned_ranges_are_rejected() {
        let page = page_size();
        let addr = page as *mut u8;
        assert_eq!(
            memory_guard_install(unsafe { addr.add(1) }, page),
            Err(GuardError::Unaligned { addr: page + 1, len: page })
        );
        assert_eq!(
            memory_guard_remove(addr, page - 1),
            Err(GuardError::Unaligned { addr: page, len: page - 1 })
        );
    }

    #[test]
    fn test_error_messages() {
        let err = GuardError::Protect {
            addr: 0x1000,
            len: 0x2000,
            errno: libc::ENOMEM,
        };
        assert!(err.to_string().starts_with("failed to guard 0x1000+0x2000: mprotect: "));
    }
}
