//! Port I/O device emulation.
//!
//! Devices implement [`PortIoDevice`] and register a port range with the
//! [`PortIoBus`]. The dispatch loop routes every I/O exit through the bus,
//! so adding a device model never touches the loop itself. Accesses to
//! unregistered ports are logged and ignored — guests probe chipset ports
//! speculatively during boot and must keep making forward progress.

pub mod serial;

pub use serial::Serial;

use std::ops::RangeInclusive;

use log::debug;

use crate::error::{Error, Result};

/// A device model reachable through x86 I/O ports.
///
/// Offsets are relative to the start of the registered range. The data
/// buffer is the exit structure's transfer buffer: `io_in` fills it with
/// what the guest reads, `io_out` consumes what the guest wrote.
pub trait PortIoDevice: Send {
    /// Guest `IN` from a port in this device's range.
    fn io_in(&mut self, offset: u16, data: &mut [u8]);

    /// Guest `OUT` to a port in this device's range.
    fn io_out(&mut self, offset: u16, data: &[u8]);
}

struct BusEntry {
    ports: RangeInclusive<u16>,
    device: Box<dyn PortIoDevice>,
}

/// Registry mapping port ranges to device models.
#[derive(Default)]
pub struct PortIoBus {
    entries: Vec<BusEntry>,
}

impl PortIoBus {
    /// Create an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a device for an inclusive port range.
    ///
    /// Overlapping ranges are rejected; each port belongs to at most one
    /// device.
    pub fn register(
        &mut self,
        ports: RangeInclusive<u16>,
        device: Box<dyn PortIoDevice>,
    ) -> Result<()> {
        let overlapping = self
            .entries
            .iter()
            .any(|e| e.ports.start() <= ports.end() && ports.start() <= e.ports.end());
        if overlapping {
            return Err(Error::PortRangeOverlap(*ports.start(), *ports.end()));
        }
        self.entries.push(BusEntry { ports, device });
        Ok(())
    }

    fn lookup(&mut self, port: u16) -> Option<(&mut (dyn PortIoDevice + 'static), u16)> {
        self.entries
            .iter_mut()
            .find(|e| e.ports.contains(&port))
            .map(|e| {
                let offset = port - *e.ports.start();
                (e.device.as_mut(), offset)
            })
    }

    /// Route a guest `IN` access. Unregistered ports leave `data` untouched.
    pub fn io_in(&mut self, port: u16, data: &mut [u8]) {
        match self.lookup(port) {
            Some((device, offset)) => device.io_in(offset, data),
            None => debug!("unhandled IN: port=0x{:x} size={}", port, data.len()),
        }
    }

    /// Route a guest `OUT` access. Unregistered ports discard the data.
    pub fn io_out(&mut self, port: u16, data: &[u8]) {
        match self.lookup(port) {
            Some((device, offset)) => device.io_out(offset, data),
            None => debug!("unhandled OUT: port=0x{:x} size={}", port, data.len()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records every access along with the device-relative offset.
    struct RecordingDevice {
        log: Arc<Mutex<Vec<(u16, u8)>>>,
    }

    impl PortIoDevice for RecordingDevice {
        fn io_in(&mut self, offset: u16, data: &mut [u8]) {
            data[0] = 0x5a;
            self.log.lock().unwrap().push((offset, 0));
        }

        fn io_out(&mut self, offset: u16, data: &[u8]) {
            self.log.lock().unwrap().push((offset, data[0]));
        }
    }

    #[test]
    fn test_dispatch_translates_port_to_offset() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = PortIoBus::new();
        bus.register(0x3f8..=0x3ff, Box::new(RecordingDevice { log: log.clone() }))
            .unwrap();

        bus.io_out(0x3fb, &[0x42]);
        let mut data = [0u8];
        bus.io_in(0x3f8, &mut data);

        assert_eq!(data[0], 0x5a);
        assert_eq!(&*log.lock().unwrap(), &[(3, 0x42), (0, 0)]);
    }

    #[test]
    fn test_overlapping_range_rejected() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut bus = PortIoBus::new();
        bus.register(0x3f8..=0x3ff, Box::new(RecordingDevice { log: log.clone() }))
            .unwrap();

        let result = bus.register(0x3ff..=0x400, Box::new(RecordingDevice { log }));
        assert!(matches!(result, Err(Error::PortRangeOverlap(0x3ff, 0x400))));
    }

    #[test]
    fn test_unregistered_port_leaves_data_untouched() {
        let mut bus = PortIoBus::new();
        let mut data = [0x77u8];
        bus.io_in(0xcf8, &mut data);
        assert_eq!(data[0], 0x77);
        bus.io_out(0x61, &[0x01]);
    }
}
