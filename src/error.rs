//! Error types for nanovm.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using nanovm's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when setting up or running a VM.
#[derive(Error, Debug)]
pub enum Error {
    // Platform/hypervisor errors
    #[error("KVM is not available (/dev/kvm missing or inaccessible): {0}")]
    HypervisorUnavailable(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_VM failed: {0}")]
    CreateVm(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_VCPU failed: {0}")]
    CreateVcpu(#[source] kvm_ioctls::Error),

    #[error("KVM_GET_VCPU_MMAP_SIZE failed: {0}")]
    VcpuStateSize(#[source] kvm_ioctls::Error),

    #[error("KVM_GET_SUPPORTED_CPUID failed: {0}")]
    SupportedCpuid(#[source] kvm_ioctls::Error),

    #[error("KVM_SET_TSS_ADDR failed: {0}")]
    SetTssAddress(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_IRQCHIP failed: {0}")]
    CreateIrqChip(#[source] kvm_ioctls::Error),

    #[error("KVM_CREATE_PIT2 failed: {0}")]
    CreatePit(#[source] kvm_ioctls::Error),

    #[error("KVM_SET_USER_MEMORY_REGION failed: {0}")]
    SetMemoryRegion(#[source] kvm_ioctls::Error),

    #[error("KVM_SET_CPUID2 failed: {0}")]
    SetCpuid(#[source] kvm_ioctls::Error),

    #[error("KVM_GET_SREGS failed: {0}")]
    GetSregs(#[source] kvm_ioctls::Error),

    #[error("KVM_SET_SREGS failed: {0}")]
    SetSregs(#[source] kvm_ioctls::Error),

    #[error("KVM_GET_REGS failed: {0}")]
    GetRegs(#[source] kvm_ioctls::Error),

    #[error("KVM_SET_REGS failed: {0}")]
    SetRegs(#[source] kvm_ioctls::Error),

    #[error("KVM_RUN failed: {0}")]
    VcpuRun(#[source] kvm_ioctls::Error),

    // Configuration errors
    #[error("invalid memory size: {0} bytes (must be > 0)")]
    InvalidMemorySize(u64),

    #[error("kernel not found: {0}")]
    KernelNotFound(PathBuf),

    #[error("corrupt boot image: {0}")]
    CorruptBootImage(String),

    // State machine errors
    #[error("invalid state transition: expected {expected}, got {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    // Memory errors
    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    #[error("invalid guest address: 0x{0:x}")]
    InvalidGuestAddress(u64),

    // Device errors
    #[error("port range 0x{0:x}-0x{1:x} overlaps an already registered device")]
    PortRangeOverlap(u16, u16),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
