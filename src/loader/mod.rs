//! Kernel boot-image loading.
//!
//! This module places a Linux bzImage and its boot parameters into guest
//! memory following the x86 boot protocol: the boot-params page goes to a
//! fixed low address, the protected-mode kernel body to the fixed load
//! address, and the header copy is then finalized with the command line and
//! memory map before the vCPU starts.

pub mod bootparams;
pub mod bzimage;

pub use bzimage::{BzImage, LoadedKernel};
