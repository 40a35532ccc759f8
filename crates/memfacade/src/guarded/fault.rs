//! Fault classification and the optional SIGSEGV reporter.

use std::ffi::{c_int, c_void};
use std::fmt::{self, Write};
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::sync::OnceLock;

use tracing::debug;

use super::GuardedAlloc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    UseAfterFree,
    BufferOverflow,
    BufferUnderflow,
    /// Inside the pool but not attributable to an allocation.
    WildAccess,
}

impl FaultKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            FaultKind::UseAfterFree => "use-after-free",
            FaultKind::BufferOverflow => "buffer overflow",
            FaultKind::BufferUnderflow => "buffer underflow",
            FaultKind::WildAccess => "wild access",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaultReport {
    pub kind: FaultKind,
    pub addr: usize,
    pub slot: Option<usize>,
    pub alloc_ptr: usize,
    pub alloc_size: usize,
}

impl FaultReport {
    pub(super) fn wild(addr: usize) -> Self {
        Self {
            kind: FaultKind::WildAccess,
            addr,
            slot: None,
            alloc_ptr: 0,
            alloc_size: 0,
        }
    }

    /// Bytes between the faulting address and the allocation it is blamed on.
    pub fn distance(&self) -> usize {
        let end = self.alloc_ptr + self.alloc_size;
        if self.addr >= end {
            self.addr - end
        } else {
            self.alloc_ptr.saturating_sub(self.addr)
        }
    }
}

impl fmt::Display for FaultReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:#x}", self.kind.as_str(), self.addr)?;
        if let Some(slot) = self.slot {
            write!(
                f,
                " ({} bytes from allocation {:#x}+{}, guarded slot {})",
                self.distance(),
                self.alloc_ptr,
                self.alloc_size,
                slot
            )?;
        }
        Ok(())
    }
}

static POOL: AtomicPtr<GuardedAlloc> = AtomicPtr::new(ptr::null_mut());
static PREVIOUS_SEGV: OnceLock<libc::sigaction> = OnceLock::new();
static PREVIOUS_BUS: OnceLock<libc::sigaction> = OnceLock::new();

/// Installs the reporter for `pool`. The previous handlers are restored on the
/// first fault so the access re-faults into them (or the default action).
pub(super) fn install_handler(pool: &'static GuardedAlloc) {
    POOL.store(pool as *const GuardedAlloc as *mut GuardedAlloc, Ordering::Release);
    for (signal, previous) in [(libc::SIGSEGV, &PREVIOUS_SEGV), (libc::SIGBUS, &PREVIOUS_BUS)] {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            libc::sigemptyset(&mut action.sa_mask);
            action.sa_flags = libc::SA_SIGINFO | libc::SA_ONSTACK;
            action.sa_sigaction = handle_fault as usize;
            let mut old: libc::sigaction = mem::zeroed();
            if libc::sigaction(signal, &action, &mut old) != 0 {
                debug!("failed to install guarded fault handler for signal {signal}");
                continue;
            }
            let _ = previous.set(old);
        }
    }
}

extern "C" fn handle_fault(signal: c_int, info: *mut libc::siginfo_t, _context: *mut c_void) {
    let addr = unsafe { (*info).si_addr() } as usize;
    let pool = POOL.load(Ordering::Acquire);
    if let Some(report) = unsafe { pool.as_ref() }.and_then(|pool| pool.describe_fault(addr)) {
        let mut buf = StackWriter::<256>::new();
        let _ = writeln!(buf, "*** memfacade: {report} ***");
        buf.flush_to_stderr();
    }

    let previous = if signal == libc::SIGBUS {
        PREVIOUS_BUS.get()
    } else {
        PREVIOUS_SEGV.get()
    };
    unsafe {
        match previous {
            Some(previous) => {
                libc::sigaction(signal, previous, ptr::null_mut());
            }
            None => {
                libc::signal(signal, libc::SIG_DFL);
            }
        }
    }
}

/// Fixed-capacity formatter; signal handlers must not allocate.
struct StackWriter<const N: usize> {
    buf: [u8; N],
    len: usize,
}

impl<const N: usize> StackWriter<N> {
    fn new() -> Self {
        Self { buf: [0; N], len: 0 }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    fn flush_to_stderr(&self) {
        let bytes = self.as_bytes();
        unsafe {
            libc::write(libc::STDERR_FILENO, bytes.as_ptr() as *const c_void, bytes.len());
        }
    }
}

impl<const N: usize> Write for StackWriter<N> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = N - self.len;
        let take = s.len().min(room);
        self.buf[self.len..self.len + take].copy_from_slice(&s.as_bytes()[..take]);
        self.len += take;
        if take < s.len() {
            return Err(fmt::Error);
        }
        Ok(())
    }
}
