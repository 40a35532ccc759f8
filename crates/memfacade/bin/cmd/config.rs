use std::ptr;

use clap::Parser;
use eyre::{bail, Result};
use memfacade::guard::page_size;
use memfacade::{ActiveBackend, Backend, GuardRegion, SamplingOptions};

#[derive(Debug, Parser)]
pub struct ConfigArgs {
    #[arg(long, help = "Skip probing the guard-page mechanism")]
    pub no_probe: bool,
}

impl ConfigArgs {
    pub fn run(&self) -> Result<()> {
        let options = SamplingOptions::try_from_env()?;
        println!("backend: {}", ActiveBackend::NAME);
        println!("{options:#?}");
        if !self.no_probe {
            println!("guard mechanism: {:?}", probe_guard()?);
        }
        Ok(())
    }
}

/// Guards a scratch page to find out which mechanism the kernel accepts.
fn probe_guard() -> Result<memfacade::GuardMechanism> {
    let len = page_size();
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        bail!("mmap of a probe page failed: {}", std::io::Error::last_os_error());
    }
    let mechanism = unsafe { GuardRegion::install(addr as *mut u8, len) }.map(|region| region.mechanism());
    unsafe { libc::munmap(addr, len) };
    Ok(mechanism?)
}
