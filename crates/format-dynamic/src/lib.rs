//! Sparse dynamic disk image backend.
//!
//! A dynamic image stores only the blocks that have been written. The
//! on-disk layout is private to this codec; the only contract is that the
//! codec reads back what it wrote.
//!
//! # Layout
//!
//! ```text
//! +0    signature "SPRSEDSK\x1A" + format revision (u16 LE)
//! +12   block size in bytes (u32 LE, 4 KiB)
//! +16   disk size in bytes (u64 LE)
//! +512  allocation table: u64 LE file offset per block, 0 = unallocated
//! ...   data blocks, appended in allocation order
//! ```

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

pub const SECTOR_SIZE: usize = 512;
/// Allocation granularity: eight sectors per block.
pub const BLOCK_SIZE: usize = 4096;

const SIGNATURE: &[u8; 10] = b"SPRSEDSK\x1A\x00";
const REVISION: u16 = 1;
const HEADER_SIZE: u64 = 512;

#[derive(Debug, Error)]
pub enum DynamicError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a dynamic image (bad signature)")]
    BadSignature,
    #[error("unsupported dynamic image revision {0}")]
    BadRevision(u16),
    #[error("corrupt allocation table")]
    CorruptTable,
}

/// A file-backed sparse image.
pub struct DynamicImage {
    file: File,
    disk_size: u64,
    /// File offset per block; 0 = unallocated (reads as zero).
    table: Vec<u64>,
    writable: bool,
}

impl DynamicImage {
    /// Whether the file at `path` carries the dynamic image signature.
    #[must_use]
    pub fn probe(path: &Path) -> bool {
        let Ok(mut f) = File::open(path) else {
            return false;
        };
        let mut sig = [0u8; 10];
        f.read_exact(&mut sig).is_ok() && &sig == SIGNATURE
    }

    /// Create an empty dynamic image of `disk_size` bytes (rounded down
    /// to a sector multiple).
    pub fn create(path: &Path, disk_size: u64) -> Result<Self, DynamicError> {
        let disk_size = disk_size - disk_size % SECTOR_SIZE as u64;
        let blocks = disk_size.div_ceil(BLOCK_SIZE as u64) as usize;
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[..10].copy_from_slice(SIGNATURE);
        header[10..12].copy_from_slice(&REVISION.to_le_bytes());
        header[12..16].copy_from_slice(&(BLOCK_SIZE as u32).to_le_bytes());
        header[16..24].copy_from_slice(&disk_size.to_le_bytes());
        file.write_all(&header)?;
        file.write_all(&vec![0u8; blocks * 8])?;
        file.flush()?;

        Ok(Self {
            file,
            disk_size,
            table: vec![0; blocks],
            writable: true,
        })
    }

    /// Open an existing dynamic image.
    pub fn open(path: &Path, read_only: bool) -> Result<Self, DynamicError> {
        let (mut file, writable) = if read_only {
            (File::open(path)?, false)
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => (f, true),
                Err(_) => (File::open(path)?, false),
            }
        };

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;
        if &header[..10] != SIGNATURE {
            return Err(DynamicError::BadSignature);
        }
        let revision = u16::from_le_bytes([header[10], header[11]]);
        if revision != REVISION {
            return Err(DynamicError::BadRevision(revision));
        }
        let block_size = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if block_size as usize != BLOCK_SIZE {
            return Err(DynamicError::CorruptTable);
        }
        let disk_size = u64::from_le_bytes([
            header[16], header[17], header[18], header[19], header[20], header[21], header[22],
            header[23],
        ]);

        let blocks = disk_size.div_ceil(BLOCK_SIZE as u64) as usize;
        let mut raw_table = vec![0u8; blocks * 8];
        file.read_exact(&mut raw_table)?;
        let file_len = file.metadata()?.len();
        let mut table = Vec::with_capacity(blocks);
        for chunk in raw_table.chunks_exact(8) {
            let offset = u64::from_le_bytes([
                chunk[0], chunk[1], chunk[2], chunk[3], chunk[4], chunk[5], chunk[6], chunk[7],
            ]);
            if offset != 0 && offset + BLOCK_SIZE as u64 > file_len {
                return Err(DynamicError::CorruptTable);
            }
            table.push(offset);
        }

        Ok(Self {
            file,
            disk_size,
            table,
            writable,
        })
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.disk_size
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Read one 512-byte sector. Unallocated blocks read as zeroes.
    pub fn read_sector(&mut self, lba: u32, buf: &mut [u8]) -> bool {
        let offset = u64::from(lba) * SECTOR_SIZE as u64;
        if offset + SECTOR_SIZE as u64 > self.disk_size || buf.len() < SECTOR_SIZE {
            return false;
        }
        let block = (offset / BLOCK_SIZE as u64) as usize;
        let within = offset % BLOCK_SIZE as u64;
        match self.table.get(block).copied() {
            Some(0) => {
                buf[..SECTOR_SIZE].fill(0);
                true
            }
            Some(data_offset) => {
                if self.file.seek(SeekFrom::Start(data_offset + within)).is_err() {
                    return false;
                }
                self.file.read_exact(&mut buf[..SECTOR_SIZE]).is_ok()
            }
            None => false,
        }
    }

    /// Write one 512-byte sector, allocating the containing block on
    /// first touch.
    pub fn write_sector(&mut self, lba: u32, buf: &[u8]) -> bool {
        let offset = u64::from(lba) * SECTOR_SIZE as u64;
        if !self.writable || offset + SECTOR_SIZE as u64 > self.disk_size || buf.len() < SECTOR_SIZE
        {
            return false;
        }
        let block = (offset / BLOCK_SIZE as u64) as usize;
        let within = offset % BLOCK_SIZE as u64;
        let data_offset = match self.table.get(block).copied() {
            Some(0) => match self.allocate(block) {
                Some(o) => o,
                None => return false,
            },
            Some(o) => o,
            None => return false,
        };
        if self.file.seek(SeekFrom::Start(data_offset + within)).is_err() {
            return false;
        }
        self.file.write_all(&buf[..SECTOR_SIZE]).is_ok()
    }

    /// Find the next allocated sector at or after `lba`, for image
    /// copying tools. `None` means end of image.
    #[must_use]
    pub fn next_allocated_sector(&self, lba: u32) -> Option<u32> {
        let sectors_per_block = (BLOCK_SIZE / SECTOR_SIZE) as u32;
        let total = (self.disk_size / SECTOR_SIZE as u64) as u32;
        let mut sector = lba;
        while sector < total {
            let block = (sector / sectors_per_block) as usize;
            if self.table.get(block).copied().unwrap_or(0) != 0 {
                return Some(sector);
            }
            sector = (block as u32 + 1) * sectors_per_block;
        }
        None
    }

    /// Append a zeroed block at EOF and record it in the table.
    fn allocate(&mut self, block: usize) -> Option<u64> {
        let end = self.file.seek(SeekFrom::End(0)).ok()?;
        self.file.write_all(&[0u8; BLOCK_SIZE]).ok()?;
        self.table[block] = end;
        let table_entry = HEADER_SIZE + block as u64 * 8;
        self.file.seek(SeekFrom::Start(table_entry)).ok()?;
        self.file.write_all(&end.to_le_bytes()).ok()?;
        Some(end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_then_probe() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dyn");
        DynamicImage::create(&path, 1 << 20).expect("create");
        assert!(DynamicImage::probe(&path));
    }

    #[test]
    fn unallocated_reads_zero() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dyn");
        let mut img = DynamicImage::create(&path, 1 << 20).expect("create");
        let mut buf = [0xFFu8; SECTOR_SIZE];
        assert!(img.read_sector(100, &mut buf));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_allocates_and_reads_back_after_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dyn");
        let data = [0x42u8; SECTOR_SIZE];
        {
            let mut img = DynamicImage::create(&path, 1 << 20).expect("create");
            assert!(img.write_sector(9, &data));
        }
        let mut img = DynamicImage::open(&path, false).expect("reopen");
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(img.read_sector(9, &mut buf));
        assert_eq!(buf, data);
        // Neighbouring sector in the same block is still zero.
        assert!(img.read_sector(10, &mut buf));
        assert!(buf.iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_file_stays_small() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dyn");
        let mut img = DynamicImage::create(&path, 100 << 20).expect("create");
        assert!(img.write_sector(0, &[1u8; SECTOR_SIZE]));
        let on_disk = std::fs::metadata(&path).expect("meta").len();
        assert!(on_disk < 1 << 20, "100 MiB image with one sector stays under 1 MiB");
    }

    #[test]
    fn next_allocated_sector_walks_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dyn");
        let mut img = DynamicImage::create(&path, 1 << 20).expect("create");
        assert_eq!(img.next_allocated_sector(0), None);
        assert!(img.write_sector(17, &[1u8; SECTOR_SIZE]));
        // Sector 17 lives in block 2 (sectors 16..24).
        assert_eq!(img.next_allocated_sector(0), Some(16));
        assert_eq!(img.next_allocated_sector(20), Some(20));
        assert_eq!(img.next_allocated_sector(24), None);
    }

    #[test]
    fn probe_rejects_raw_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("plain.img");
        std::fs::write(&path, vec![0u8; 4096]).expect("write");
        assert!(!DynamicImage::probe(&path));
    }

    #[test]
    fn out_of_range_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dyn");
        let mut img = DynamicImage::create(&path, 8192).expect("create");
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(!img.read_sector(16, &mut buf));
        assert!(!img.write_sector(16, &buf));
    }
}
