//! KVM hypervisor access.
//!
//! Thin wrappers around the kvm-ioctls handles that encode this VMM's setup
//! contracts:
//!
//! - all VM and vCPU creation goes through one [`KvmSession`];
//! - chipset devices (TSS address, IRQ chip, PIT) are configured when the VM
//!   is created, before any vCPU exists — KVM wires the in-kernel local APIC
//!   at vCPU-create time;
//! - exactly one guest memory region is installed per VM lifetime.

pub mod vcpu;

use kvm_bindings::{kvm_pit_config, kvm_userspace_memory_region, CpuId, KVM_PIT_SPEAKER_DUMMY};
use kvm_ioctls::{Kvm, VmFd};
use log::debug;

use crate::error::{Error, Result};
use crate::memory::GuestMemory;
use vcpu::Vcpu;

/// Capacity pre-sized for `KVM_GET_SUPPORTED_CPUID`; the true entry count is
/// unknown until the call succeeds.
const MAX_CPUID_ENTRIES: usize = 128;

/// TSS address, placed in the conventionally unused hole below 4 GiB.
/// Intel VT-x requires it to be set before the IRQ chip is created.
const TSS_ADDRESS: usize = 0xfffb_d000;

/// Process-wide handle to the KVM control device.
pub struct KvmSession {
    kvm: Kvm,
}

impl KvmSession {
    /// Open `/dev/kvm`.
    ///
    /// Fails with [`Error::HypervisorUnavailable`] if the device is missing
    /// or inaccessible; nothing else in the VMM can proceed without it.
    pub fn open() -> Result<Self> {
        let kvm = Kvm::new().map_err(Error::HypervisorUnavailable)?;
        debug!("opened /dev/kvm, API version {}", kvm.get_api_version());
        Ok(Self { kvm })
    }

    /// KVM API version reported by the kernel.
    pub fn api_version(&self) -> i32 {
        self.kvm.get_api_version()
    }

    /// Byte size of the shared per-vCPU run structure.
    ///
    /// kvm-ioctls maps the structure itself when a vCPU is created; the size
    /// is surfaced here for diagnostics.
    pub fn vcpu_state_size(&self) -> Result<usize> {
        self.kvm.get_vcpu_mmap_size().map_err(Error::VcpuStateSize)
    }

    /// CPU feature-identification entries supported by the host.
    pub fn supported_cpu_features(&self) -> Result<CpuId> {
        self.kvm
            .get_supported_cpuid(MAX_CPUID_ENTRIES)
            .map_err(Error::SupportedCpuid)
    }

    /// Create a new VM with its chipset already configured.
    pub fn create_vm(&self) -> Result<Vm> {
        let vm = self.kvm.create_vm().map_err(Error::CreateVm)?;
        Vm::new(vm)
    }
}

/// A KVM virtual machine.
///
/// Owns the VM file descriptor and tracks whether the single guest memory
/// region has been installed.
pub struct Vm {
    vm: VmFd,
    memory_installed: bool,
}

impl Vm {
    /// Wrap a raw VM fd and configure the chipset.
    ///
    /// Ordering matters: TSS address before the IRQ chip, IRQ chip and PIT
    /// before any vCPU is created.
    fn new(vm: VmFd) -> Result<Self> {
        vm.set_tss_address(TSS_ADDRESS)
            .map_err(Error::SetTssAddress)?;
        vm.create_irq_chip().map_err(Error::CreateIrqChip)?;

        let pit_config = kvm_pit_config {
            flags: KVM_PIT_SPEAKER_DUMMY,
            ..Default::default()
        };
        vm.create_pit2(pit_config).map_err(Error::CreatePit)?;

        Ok(Self {
            vm,
            memory_installed: false,
        })
    }

    /// Install the guest memory region as guest physical range `[0, size)`.
    ///
    /// Valid exactly once per VM lifetime; slot reuse is not supported.
    pub fn install_memory(&mut self, memory: &GuestMemory) -> Result<()> {
        if self.memory_installed {
            return Err(Error::InvalidState {
                expected: "no memory region installed",
                actual: "memory region already installed",
            });
        }

        let region = kvm_userspace_memory_region {
            slot: 0,
            flags: 0,
            guest_phys_addr: 0,
            memory_size: memory.size() as u64,
            userspace_addr: memory.host_address(),
        };

        // Safety: the region points at a mapping owned by `memory`, which the
        // caller keeps alive for the lifetime of the VM.
        unsafe {
            self.vm
                .set_user_memory_region(region)
                .map_err(Error::SetMemoryRegion)?;
        }

        self.memory_installed = true;
        debug!(
            "installed {} MiB of guest memory at guest physical 0",
            memory.size() >> 20
        );
        Ok(())
    }

    /// Create a vCPU bound to this VM with the given logical index.
    pub fn create_vcpu(&self, index: u64) -> Result<Vcpu> {
        let fd = self.vm.create_vcpu(index).map_err(Error::CreateVcpu)?;
        Ok(Vcpu::new(fd, index))
    }
}
