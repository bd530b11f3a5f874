//! VMM assembly and the exit dispatch loop.
//!
//! [`VmmBuilder`] performs the whole setup sequence in its invariant order:
//! session, VM chipset, guest memory, vCPU, CPU features, kernel load,
//! boot-params finalization, initial register state. [`Vmm::run`] then
//! drives the resume/dispatch loop for the lifetime of the guest.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use log::{debug, info, warn};

use crate::device::serial::COM1_PORT;
use crate::device::{PortIoBus, Serial};
use crate::error::{Error, Result};
use crate::kvm::vcpu::{Vcpu, VcpuExit};
use crate::kvm::{KvmSession, Vm};
use crate::loader::{bootparams, BzImage};
use crate::memory::{layout, GuestMemory};

/// Builder for a [`Vmm`].
///
/// # Example
///
/// ```rust,no_run
/// use nanovm::VmmBuilder;
///
/// let mut vmm = VmmBuilder::new("/boot/vmlinuz-linux")
///     .cmdline("earlyprintk=ttyS0,keep")
///     .build()?;
/// vmm.run()?;
/// # Ok::<(), nanovm::Error>(())
/// ```
pub struct VmmBuilder {
    kernel: PathBuf,
    cmdline: String,
    memory_bytes: u64,
}

impl VmmBuilder {
    /// Create a builder for the given kernel image path.
    pub fn new(kernel: impl Into<PathBuf>) -> Self {
        Self {
            kernel: kernel.into(),
            cmdline: String::new(),
            memory_bytes: layout::MEMORY_SIZE,
        }
    }

    /// Set the kernel command line.
    ///
    /// Default: empty.
    pub fn cmdline(mut self, cmdline: impl Into<String>) -> Self {
        self.cmdline = cmdline.into();
        self
    }

    /// Set the guest memory size in bytes.
    ///
    /// Default: 1 GiB.
    pub fn memory_bytes(mut self, bytes: u64) -> Self {
        self.memory_bytes = bytes;
        self
    }

    /// Validate the configuration and build the VM.
    ///
    /// Every setup-phase failure here is unrecoverable: an improperly
    /// configured VM cannot safely run, so errors propagate immediately.
    pub fn build(self) -> Result<Vmm> {
        // The kernel body lands at the fixed load address; memory that does
        // not reach past it cannot hold a guest.
        if self.memory_bytes <= layout::KERNEL_ADDR {
            return Err(Error::InvalidMemorySize(self.memory_bytes));
        }

        if !self.kernel.exists() {
            return Err(Error::KernelNotFound(self.kernel));
        }

        let session = KvmSession::open()?;
        info!(
            "KVM API version {}, vCPU state size {} bytes",
            session.api_version(),
            session.vcpu_state_size()?
        );

        let mut vm = session.create_vm()?;

        let mut memory = GuestMemory::new(self.memory_bytes as usize)?;
        vm.install_memory(&memory)?;

        // Chipset exists (done at VM creation), memory is installed: the
        // vCPU may now be created and configured.
        let mut vcpu = vm.create_vcpu(0)?;
        let cpuid = session.supported_cpu_features()?;
        vcpu.set_cpu_features(&cpuid)?;

        let loaded = BzImage::open(&self.kernel)?.load(&mut memory)?;
        bootparams::finalize(&mut memory, &self.cmdline)?;
        vcpu.set_initial_state(loaded.entry, layout::BOOT_PARAMS_ADDR)?;

        let mut bus = PortIoBus::new();
        bus.register(COM1_PORT..=COM1_PORT + 7, Box::new(Serial::new()))?;

        Ok(Vmm {
            _session: session,
            _vm: vm,
            vcpu,
            memory,
            bus,
            running: Arc::new(AtomicBool::new(true)),
        })
    }
}

/// Requests a cooperative stop of the dispatch loop.
///
/// The flag is checked between exit-handling iterations; a resume call
/// already blocked inside the hypervisor cannot be preempted mid-call.
#[derive(Clone)]
pub struct StopHandle {
    running: Arc<AtomicBool>,
}

impl StopHandle {
    /// Ask the dispatch loop to stop before its next resume.
    pub fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// A fully configured virtual machine and its dispatch loop.
pub struct Vmm {
    // Handles are kept for the VM's lifetime: all vCPU state lives behind
    // them, and `memory` must outlive the mapping installed into the VM.
    _session: KvmSession,
    _vm: Vm,
    vcpu: Vcpu,
    memory: GuestMemory,
    bus: PortIoBus,
    running: Arc<AtomicBool>,
}

impl Vmm {
    /// Handle for stopping the dispatch loop from another thread.
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            running: self.running.clone(),
        }
    }

    /// Guest memory size in bytes.
    pub fn memory_size(&self) -> usize {
        self.memory.size()
    }

    /// Run the guest until a stop is requested.
    ///
    /// Each iteration blocks in resume until the guest triggers an exit,
    /// handles exactly that one exit, and resumes. I/O port accesses route
    /// through the device bus; every other exit reason is a diagnostic, not
    /// a hard stop — guests probe hardware speculatively during boot. Only a
    /// failed resume call is fatal.
    pub fn run(&mut self) -> Result<()> {
        info!("entering guest at 0x{:x}", layout::KERNEL_ADDR);

        while self.running.load(Ordering::SeqCst) {
            match self.vcpu.resume()? {
                VcpuExit::IoIn(port, data) => self.bus.io_in(port, data),
                VcpuExit::IoOut(port, data) => self.bus.io_out(port, data),
                VcpuExit::Hlt => debug!("guest executed HLT"),
                VcpuExit::Shutdown => warn!("guest shutdown exit"),
                other => debug!("unhandled exit reason: {:?}", other),
            }
        }

        info!("stop requested, leaving dispatch loop");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_kernel_rejected_before_any_kvm_call() {
        let result = VmmBuilder::new("/definitely/not/a/kernel").build();
        assert!(matches!(result, Err(Error::KernelNotFound(_))));
    }

    #[test]
    fn test_memory_not_covering_kernel_addr_rejected() {
        let result = VmmBuilder::new("/definitely/not/a/kernel")
            .memory_bytes(layout::KERNEL_ADDR)
            .build();
        assert!(matches!(
            result,
            Err(Error::InvalidMemorySize(n)) if n == layout::KERNEL_ADDR
        ));
    }

    #[test]
    fn test_stop_handle_clears_running_flag() {
        let running = Arc::new(AtomicBool::new(true));
        let handle = StopHandle {
            running: running.clone(),
        };
        handle.stop();
        assert!(!running.load(Ordering::SeqCst));
    }
}
