//! vCPU state initialization and execution.
//!
//! The guest kernel's 32-bit entry point expects to be entered in flat
//! protected mode with `rsi` pointing at the boot parameters. The register
//! setup here mirrors that contract: flat 4 GiB segments, the
//! protected-mode-enable bit in CR0, `rip` at the kernel entry, and the
//! architecturally required reserved bit in RFLAGS.
//!
//! KVM latches whatever state is set at first resume, so ordering is a hard
//! invariant: segment/control registers, then general registers, both before
//! the first `KVM_RUN`. A small run-state machine enforces the one-shot
//! operations.

use kvm_bindings::{kvm_regs, kvm_segment, kvm_sregs, CpuId};
use kvm_ioctls::VcpuFd;

pub use kvm_ioctls::VcpuExit;

use crate::error::{Error, Result};

/// Protected mode enable bit in CR0.
const X86_CR0_PE: u64 = 0x1;

/// Architecturally required reserved-bit pattern for RFLAGS.
const RFLAGS_RESERVED: u64 = 0x2;

/// Tracks the one-way progression of a vCPU from creation to guest entry.
///
/// CPU features may be applied exactly once, and neither features nor the
/// initial register state may change after the vCPU has entered the guest.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct RunState {
    features_applied: bool,
    entered_guest: bool,
}

impl RunState {
    fn actual(&self) -> &'static str {
        if self.entered_guest {
            "running"
        } else if self.features_applied {
            "features applied"
        } else {
            "created"
        }
    }

    /// One-shot gate for applying the CPU feature set.
    pub(crate) fn apply_features(&mut self) -> Result<()> {
        if self.entered_guest || self.features_applied {
            return Err(Error::InvalidState {
                expected: "created",
                actual: self.actual(),
            });
        }
        self.features_applied = true;
        Ok(())
    }

    /// Gate for writing the initial register state.
    pub(crate) fn configure(&self) -> Result<()> {
        if self.entered_guest {
            return Err(Error::InvalidState {
                expected: "not yet running",
                actual: self.actual(),
            });
        }
        Ok(())
    }

    pub(crate) fn enter_guest(&mut self) {
        self.entered_guest = true;
    }
}

/// One virtual CPU bound to a VM.
pub struct Vcpu {
    fd: VcpuFd,
    index: u64,
    state: RunState,
}

impl Vcpu {
    pub(crate) fn new(fd: VcpuFd, index: u64) -> Self {
        Self {
            fd,
            index,
            state: RunState::default(),
        }
    }

    /// Logical index of this vCPU.
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Apply the host-supported CPU feature set.
    ///
    /// Must happen exactly once, before the first resume; the feature set is
    /// immutable afterward and re-setting is rejected.
    pub fn set_cpu_features(&mut self, cpuid: &CpuId) -> Result<()> {
        self.state.apply_features()?;
        self.fd.set_cpuid2(cpuid).map_err(Error::SetCpuid)
    }

    /// Configure the register state the guest kernel entry point expects.
    ///
    /// Segment and control registers are written before general registers.
    pub fn set_initial_state(&mut self, entry: u64, boot_params_addr: u64) -> Result<()> {
        self.state.configure()?;

        let mut sregs = self.fd.get_sregs().map_err(Error::GetSregs)?;
        configure_flat_protected_mode(&mut sregs);
        self.fd.set_sregs(&sregs).map_err(Error::SetSregs)?;

        let mut regs = self.fd.get_regs().map_err(Error::GetRegs)?;
        configure_entry_registers(&mut regs, entry, boot_params_addr);
        self.fd.set_regs(&regs).map_err(Error::SetRegs)
    }

    /// Resume guest execution until the next VM exit.
    ///
    /// Blocks inside `KVM_RUN`; returns only when the guest triggers a
    /// condition the hypervisor cannot service internally. An `Err` here is a
    /// hypervisor-level failure, not a guest-triggered exit, and is fatal to
    /// the VM.
    pub fn resume(&mut self) -> Result<VcpuExit<'_>> {
        self.state.enter_guest();
        self.fd.run().map_err(Error::VcpuRun)
    }
}

/// Make a segment descriptor flat: base 0, maximal limit, page granularity.
fn make_flat(segment: &mut kvm_segment) {
    segment.base = 0;
    segment.limit = !0;
    segment.g = 1;
}

/// Set up flat protected-mode addressing.
///
/// All six segments become flat 4 GiB descriptors; code and stack segments
/// are additionally marked 32-bit. Only the PE bit is touched in CR0 — the
/// kernel takes over paging and the rest of the control state itself.
pub(crate) fn configure_flat_protected_mode(sregs: &mut kvm_sregs) {
    make_flat(&mut sregs.cs);
    make_flat(&mut sregs.ds);
    make_flat(&mut sregs.es);
    make_flat(&mut sregs.fs);
    make_flat(&mut sregs.gs);
    make_flat(&mut sregs.ss);

    sregs.cs.db = 1;
    sregs.ss.db = 1;

    sregs.cr0 |= X86_CR0_PE;
}

/// Set up the general registers for the 32-bit kernel entry convention:
/// `rip` at the entry point, `rsi` pointing at the boot parameters.
pub(crate) fn configure_entry_registers(regs: &mut kvm_regs, entry: u64, boot_params_addr: u64) {
    regs.rflags = RFLAGS_RESERVED;
    regs.rip = entry;
    regs.rsi = boot_params_addr;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments_become_flat() {
        let mut sregs = kvm_sregs::default();
        configure_flat_protected_mode(&mut sregs);

        for segment in [sregs.cs, sregs.ds, sregs.es, sregs.fs, sregs.gs, sregs.ss] {
            assert_eq!(segment.base, 0);
            assert_eq!(segment.limit, 0xffff_ffff);
            assert_eq!(segment.g, 1);
        }
        assert_eq!(sregs.cs.db, 1);
        assert_eq!(sregs.ss.db, 1);
    }

    #[test]
    fn test_only_protected_mode_bit_is_added() {
        // Start from a realistic reset value for CR0 (ET | NW | CD).
        let mut sregs = kvm_sregs {
            cr0: 0x6000_0010,
            cr4: 0x2000,
            ..Default::default()
        };
        configure_flat_protected_mode(&mut sregs);

        assert_eq!(sregs.cr0, 0x6000_0010 | X86_CR0_PE);
        assert_eq!(sregs.cr4, 0x2000);
        assert_eq!(sregs.cr3, 0);
        assert_eq!(sregs.efer, 0);
    }

    #[test]
    fn test_entry_registers() {
        let mut regs = kvm_regs::default();
        configure_entry_registers(&mut regs, 0x20_0000, 0x7000);

        assert_eq!(regs.rip, 0x20_0000);
        assert_eq!(regs.rsi, 0x7000);
        assert_eq!(regs.rflags, 0x2);
        assert_eq!(regs.rax, 0);
    }

    #[test]
    fn test_features_apply_exactly_once() {
        let mut state = RunState::default();
        assert!(state.apply_features().is_ok());
        assert!(matches!(
            state.apply_features(),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_features_rejected_after_guest_entry() {
        let mut state = RunState::default();
        state.enter_guest();
        assert!(matches!(
            state.apply_features(),
            Err(Error::InvalidState { .. })
        ));
    }

    #[test]
    fn test_configure_rejected_after_guest_entry() {
        let mut state = RunState::default();
        assert!(state.configure().is_ok());
        state.enter_guest();
        assert!(matches!(state.configure(), Err(Error::InvalidState { .. })));
    }
}
