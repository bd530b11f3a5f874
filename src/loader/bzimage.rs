//! bzImage boot-image parsing and placement.
//!
//! A bzImage is two parts: real-mode setup code (discarded — the guest
//! enters directly in protected mode) and the protected-mode kernel body.
//! The split point is derived from the `setup_sects` header field, which is
//! untrusted input: every length computed from it is checked against the
//! actual image size before any copy.

use std::io::ErrorKind;
use std::path::Path;

use log::debug;

use crate::error::{Error, Result};
use crate::memory::{layout, GuestMemory};

/// Boot protocol header offsets, valid both within the image file and within
/// the boot-params page copied into guest memory.
#[allow(dead_code)]
pub mod header {
    pub const E820_ENTRIES: usize = 0x1e8;
    pub const SETUP_SECTS: usize = 0x1f1;
    pub const BOOT_FLAG: usize = 0x1fe;
    pub const HEADER_MAGIC: usize = 0x202;
    pub const VERSION: usize = 0x206;
    pub const TYPE_OF_LOADER: usize = 0x210;
    pub const RAMDISK_IMAGE: usize = 0x218;
    pub const RAMDISK_SIZE: usize = 0x21c;
    pub const EXT_LOADER_VER: usize = 0x226;
    pub const CMD_LINE_PTR: usize = 0x228;
    pub const CMDLINE_SIZE: usize = 0x238;
    pub const E820_TABLE: usize = 0x2d0;
}

/// Size of the boot-params (zero) page copied verbatim from the image.
pub const BOOT_PARAMS_SIZE: usize = 4096;

/// "HdrS" — boot protocol magic at [`header::HEADER_MAGIC`].
const HDR_MAGIC: &[u8; 4] = b"HdrS";

const SECTOR_SIZE: usize = 512;

/// Where the loaded kernel ended up.
#[derive(Debug, Clone, Copy)]
pub struct LoadedKernel {
    /// Protected-mode entry point (= the load address).
    pub entry: u64,
    /// Bytes of real-mode setup code skipped at the start of the image.
    pub setup_size: usize,
    /// Bytes of protected-mode kernel copied into guest memory.
    pub kernel_size: usize,
}

/// A Linux bzImage kernel artifact.
pub struct BzImage {
    image: Vec<u8>,
}

impl BzImage {
    /// Read a boot image from disk.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let image = std::fs::read(path).map_err(|e| {
            if e.kind() == ErrorKind::NotFound {
                Error::KernelNotFound(path.to_path_buf())
            } else {
                Error::Io(e)
            }
        })?;
        Ok(Self { image })
    }

    /// Wrap an in-memory boot image.
    pub fn from_bytes(image: Vec<u8>) -> Self {
        Self { image }
    }

    /// Number of bytes the real-mode setup code occupies.
    ///
    /// A `setup_sects` of 0 means 4, per the boot protocol.
    fn setup_size(&self) -> usize {
        let setup_sects = match self.image[header::SETUP_SECTS] {
            0 => 4,
            n => n as usize,
        };
        (setup_sects + 1) * SECTOR_SIZE
    }

    /// Copy the boot-params page and the protected-mode kernel into guest
    /// memory at their fixed addresses.
    pub fn load(&self, memory: &mut GuestMemory) -> Result<LoadedKernel> {
        if self.image.len() < BOOT_PARAMS_SIZE {
            return Err(Error::CorruptBootImage(format!(
                "image is {} bytes, shorter than the {} byte boot-params page",
                self.image.len(),
                BOOT_PARAMS_SIZE
            )));
        }

        let magic = &self.image[header::HEADER_MAGIC..header::HEADER_MAGIC + 4];
        if magic != HDR_MAGIC {
            return Err(Error::CorruptBootImage(
                "missing HdrS boot protocol magic".into(),
            ));
        }

        let setup_size = self.setup_size();
        if setup_size > self.image.len() {
            return Err(Error::CorruptBootImage(format!(
                "setup_sects claims {} bytes of setup code but the image is {} bytes",
                setup_size,
                self.image.len()
            )));
        }

        memory.write(layout::BOOT_PARAMS_ADDR, &self.image[..BOOT_PARAMS_SIZE])?;
        memory.write(layout::KERNEL_ADDR, &self.image[setup_size..])?;

        let kernel_size = self.image.len() - setup_size;
        debug!(
            "loaded kernel: {} setup bytes skipped, {} kernel bytes at 0x{:x}",
            setup_size,
            kernel_size,
            layout::KERNEL_ADDR
        );

        Ok(LoadedKernel {
            entry: layout::KERNEL_ADDR,
            setup_size,
            kernel_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    /// Build a minimal well-formed bzImage: `setup_sects` sectors of setup
    /// code (plus the boot sector) followed by `payload` as the kernel body.
    fn test_image(setup_sects: u8, payload: &[u8]) -> Vec<u8> {
        let setup_size = (setup_sects as usize + 1) * SECTOR_SIZE;
        let mut image = vec![0u8; setup_size.max(BOOT_PARAMS_SIZE)];
        image[header::SETUP_SECTS] = setup_sects;
        image[header::HEADER_MAGIC..header::HEADER_MAGIC + 4].copy_from_slice(HDR_MAGIC);
        image.truncate(setup_size);
        image.extend_from_slice(payload);
        image
    }

    fn test_memory() -> GuestMemory {
        GuestMemory::new(0x40_0000).unwrap()
    }

    #[test]
    fn test_kernel_payload_copied_exactly() {
        let payload: Vec<u8> = (0..0x1000u32).map(|i| (i % 251) as u8).collect();
        // 7 setup sectors + boot sector = exactly one boot-params page.
        let image = test_image(7, &payload);
        let mut memory = test_memory();

        let loaded = BzImage::from_bytes(image.clone())
            .load(&mut memory)
            .unwrap();

        assert_eq!(loaded.entry, layout::KERNEL_ADDR);
        assert_eq!(loaded.setup_size, 0x1000);
        assert_eq!(loaded.kernel_size, payload.len());

        let start = layout::KERNEL_ADDR as usize;
        assert_eq!(&memory.as_slice()[start..start + payload.len()], &payload[..]);
        assert_eq!(&memory.as_slice()[start..start + payload.len()], &image[0x1000..]);
    }

    #[test]
    fn test_boot_params_page_copied() {
        let image = test_image(7, b"kernel");
        let mut memory = test_memory();

        BzImage::from_bytes(image).load(&mut memory).unwrap();

        let base = layout::BOOT_PARAMS_ADDR;
        assert_eq!(
            memory.read_obj::<u8>(base + header::SETUP_SECTS as u64).unwrap(),
            7
        );
        let mut magic = [0u8; 4];
        memory.read(base + header::HEADER_MAGIC as u64, &mut magic).unwrap();
        assert_eq!(&magic, HDR_MAGIC);
    }

    #[test]
    fn test_zero_setup_sects_means_four() {
        let mut image = vec![0u8; BOOT_PARAMS_SIZE];
        image[header::HEADER_MAGIC..header::HEADER_MAGIC + 4].copy_from_slice(HDR_MAGIC);
        // setup_sects stays 0 → 5 sectors → kernel body starts at 0xa00.
        image[0xa00] = 0xab;
        let mut memory = test_memory();

        let loaded = BzImage::from_bytes(image).load(&mut memory).unwrap();

        assert_eq!(loaded.setup_size, 5 * SECTOR_SIZE);
        assert_eq!(loaded.kernel_size, BOOT_PARAMS_SIZE - 5 * SECTOR_SIZE);
        assert_eq!(
            memory.read_obj::<u8>(layout::KERNEL_ADDR).unwrap(),
            0xab
        );
    }

    #[test]
    fn test_setup_size_beyond_image_rejected() {
        // 255 setup sectors would put the kernel body far past the end of
        // this one-page image; the copy length must not underflow.
        let mut image = vec![0u8; BOOT_PARAMS_SIZE];
        image[header::SETUP_SECTS] = 255;
        image[header::HEADER_MAGIC..header::HEADER_MAGIC + 4].copy_from_slice(HDR_MAGIC);
        let mut memory = test_memory();

        assert!(matches!(
            BzImage::from_bytes(image).load(&mut memory),
            Err(Error::CorruptBootImage(_))
        ));
    }

    #[test]
    fn test_truncated_image_rejected() {
        let mut memory = test_memory();
        assert!(matches!(
            BzImage::from_bytes(vec![0u8; 100]).load(&mut memory),
            Err(Error::CorruptBootImage(_))
        ));
    }

    #[test]
    fn test_missing_magic_rejected() {
        let image = vec![0u8; BOOT_PARAMS_SIZE];
        let mut memory = test_memory();
        assert!(matches!(
            BzImage::from_bytes(image).load(&mut memory),
            Err(Error::CorruptBootImage(_))
        ));
    }

    #[test]
    fn test_missing_file_reported_as_kernel_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no-such-vmlinuz");
        assert!(matches!(
            BzImage::open(&path),
            Err(Error::KernelNotFound(p)) if p == path
        ));
    }

    #[test]
    fn test_load_from_disk() {
        let image = test_image(7, b"payload bytes");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&image).unwrap();

        let mut memory = test_memory();
        let loaded = BzImage::open(file.path()).unwrap().load(&mut memory).unwrap();
        assert_eq!(loaded.kernel_size, b"payload bytes".len());
    }
}
