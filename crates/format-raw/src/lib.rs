//! Raw static disk image backend.
//!
//! A raw image is a plain LBA sector dump: byte offset = LBA × 512, plus
//! an optional base offset into the containing file. This is the fallback
//! codec; any readable file mounts as a raw image.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

pub const SECTOR_SIZE: usize = 512;

#[derive(Debug, Error)]
pub enum RawError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image is empty")]
    Empty,
}

/// A file-backed raw sector image.
pub struct RawImage {
    file: File,
    base: u64,
    size: u64,
    writable: bool,
}

impl RawImage {
    /// Whether the file at `path` can be mounted as a raw image.
    ///
    /// Raw is the probe of last resort: any non-empty readable file
    /// qualifies.
    #[must_use]
    pub fn probe(path: &Path) -> bool {
        std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() > 0)
    }

    /// Open an image. `base` skips a fixed prefix of the file;
    /// `custom_size` (non-zero) overrides the size derived from the file
    /// length. The usable size is rounded down to a sector multiple.
    pub fn open(path: &Path, base: u64, custom_size: u64, read_only: bool) -> Result<Self, RawError> {
        let (file, writable) = if read_only {
            (File::open(path)?, false)
        } else {
            // Fall back to read-only when the file itself is not writable.
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => (f, true),
                Err(_) => (File::open(path)?, false),
            }
        };
        let file_len = file.metadata()?.len();
        let avail = file_len.saturating_sub(base);
        let mut size = if custom_size != 0 {
            avail.min(custom_size)
        } else {
            avail
        };
        size -= size % SECTOR_SIZE as u64;
        if size == 0 {
            return Err(RawError::Empty);
        }
        Ok(Self {
            file,
            base,
            size,
            writable,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Read one 512-byte sector. Returns `false` past the end of the
    /// image or on an I/O failure.
    pub fn read_sector(&mut self, lba: u32, buf: &mut [u8]) -> bool {
        let offset = u64::from(lba) * SECTOR_SIZE as u64;
        if offset + SECTOR_SIZE as u64 > self.size || buf.len() < SECTOR_SIZE {
            return false;
        }
        if self.file.seek(SeekFrom::Start(self.base + offset)).is_err() {
            return false;
        }
        self.file.read_exact(&mut buf[..SECTOR_SIZE]).is_ok()
    }

    /// Write one 512-byte sector. Returns `false` out of range, on a
    /// read-only image, or on an I/O failure.
    pub fn write_sector(&mut self, lba: u32, buf: &[u8]) -> bool {
        let offset = u64::from(lba) * SECTOR_SIZE as u64;
        if !self.writable || offset + SECTOR_SIZE as u64 > self.size || buf.len() < SECTOR_SIZE {
            return false;
        }
        if self.file.seek(SeekFrom::Start(self.base + offset)).is_err() {
            return false;
        }
        self.file.write_all(&buf[..SECTOR_SIZE]).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn image_with(content: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        let mut f = File::create(&path).expect("create");
        f.write_all(content).expect("fill");
        (dir, path)
    }

    #[test]
    fn probe_rejects_missing_and_empty() {
        let (dir, path) = image_with(&[]);
        assert!(!RawImage::probe(&path));
        assert!(!RawImage::probe(&dir.path().join("nope.img")));
    }

    #[test]
    fn size_rounds_down_to_sectors() {
        let (_dir, path) = image_with(&vec![0u8; 1000]);
        let img = RawImage::open(&path, 0, 0, false).expect("open");
        assert_eq!(img.size(), 512);
    }

    #[test]
    fn read_write_round_trip() {
        let (_dir, path) = image_with(&vec![0u8; 4096]);
        let mut img = RawImage::open(&path, 0, 0, false).expect("open");
        let data = [0xA5u8; SECTOR_SIZE];
        assert!(img.write_sector(3, &data));
        let mut back = [0u8; SECTOR_SIZE];
        assert!(img.read_sector(3, &mut back));
        assert_eq!(back, data);
    }

    #[test]
    fn base_offset_shifts_lba_zero() {
        let mut content = vec![0u8; 2048];
        content[1024] = 0x5A;
        let (_dir, path) = image_with(&content);
        let mut img = RawImage::open(&path, 1024, 0, false).expect("open");
        assert_eq!(img.size(), 1024);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(img.read_sector(0, &mut buf));
        assert_eq!(buf[0], 0x5A);
    }

    #[test]
    fn out_of_range_fails() {
        let (_dir, path) = image_with(&vec![0u8; 1024]);
        let mut img = RawImage::open(&path, 0, 0, false).expect("open");
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(!img.read_sector(2, &mut buf));
        assert!(!img.write_sector(2, &buf));
    }

    #[test]
    fn read_only_rejects_writes() {
        let (_dir, path) = image_with(&vec![0u8; 1024]);
        let mut img = RawImage::open(&path, 0, 0, true).expect("open");
        assert!(!img.write_sector(0, &[0u8; SECTOR_SIZE]));
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(img.read_sector(0, &mut buf));
    }
}
