//! Minimal 8250 UART serial console.
//!
//! Just enough UART for early kernel console output: the guest polls the
//! line-status register before every byte, so LSR reads always report the
//! transmit holding register empty, and writes to the transmit register go
//! straight to the output stream. The remaining registers are accepted and
//! ignored — scratch, modem, and interrupt-enable state is not modeled.

use std::io::{self, Write};

use crate::device::PortIoDevice;

/// COM1 I/O port base.
pub const COM1_PORT: u16 = 0x3f8;

/// 8250 UART register offsets.
#[allow(dead_code)]
mod reg {
    pub const THR: u16 = 0; // Transmit Holding Register (write)
    pub const RBR: u16 = 0; // Receive Buffer Register (read)
    pub const IER: u16 = 1; // Interrupt Enable Register
    pub const IIR: u16 = 2; // Interrupt Identification Register (read)
    pub const FCR: u16 = 2; // FIFO Control Register (write)
    pub const LCR: u16 = 3; // Line Control Register
    pub const MCR: u16 = 4; // Modem Control Register
    pub const LSR: u16 = 5; // Line Status Register
    pub const MSR: u16 = 6; // Modem Status Register
    pub const SCR: u16 = 7; // Scratch Register
}

/// Line Status Register bits.
mod lsr {
    pub const THR_EMPTY: u8 = 0x20;
}

/// Write-only 8250 UART emulation.
pub struct Serial {
    /// Output writer
    output: Box<dyn Write + Send>,
}

impl Serial {
    /// Create a serial console that writes to stdout.
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    /// Create a serial console with a custom output writer.
    pub fn with_output(output: Box<dyn Write + Send>) -> Self {
        Self { output }
    }
}

impl Default for Serial {
    fn default() -> Self {
        Self::new()
    }
}

impl PortIoDevice for Serial {
    fn io_in(&mut self, offset: u16, data: &mut [u8]) {
        // Output is accepted immediately, so transmit is always ready.
        if offset == reg::LSR {
            if let Some(status) = data.first_mut() {
                *status = lsr::THR_EMPTY;
            }
        }
    }

    fn io_out(&mut self, offset: u16, data: &[u8]) {
        // Synchronous, unbuffered: every byte is emitted in order, as
        // received.
        if offset == reg::THR {
            let _ = self.output.write_all(data);
            let _ = self.output.flush();
        }
    }
}
