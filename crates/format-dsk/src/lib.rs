//! DSK and Extended DSK (EDSK) disk image backend.
//!
//! The CPC-emu format: a 256-byte disk information block, then one
//! track block per track×side. Each track block is a 256-byte header
//! (signature, C, H, sector size code, sector count, GAP#3, filler)
//! followed by the sector data. Sector headers carry the ID field
//! (C, H, R, N), the FDC status bits ST1/ST2 recorded for copy
//! protection, and (in the extended format) the actual stored length.
//!
//! Standard header: `"MV - CPCEMU Disk-File\r\nDisk-Info\r\n"`
//! Extended header: `"EXTENDED CPC DSK File\r\nDisk-Info\r\n"`
//!
//! The controller addresses sectors by physical index within a track
//! (the order they pass under the head), not by sector ID; ID matching
//! is the controller's job.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

const STANDARD_HEADER: &[u8] = b"MV - CPCEMU Disk-File\r\nDisk-Info\r\n";
const EXTENDED_HEADER: &[u8] = b"EXTENDED CPC DSK File\r\nDisk-Info\r\n";
const TRACK_SIGNATURE: &[u8] = b"Track-Info\r\n";

#[derive(Debug, Error)]
pub enum DskError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("file too short for a DSK header")]
    Truncated,
    #[error("not a DSK file (unrecognised header)")]
    BadSignature,
    #[error("malformed track {track} side {side}")]
    BadTrack { track: u8, side: u8 },
}

/// The disk information block.
#[derive(Debug, Clone, Copy)]
pub struct DiskInfo {
    pub tracks: u8,
    pub sides: u8,
    /// Uniform track size for standard DSK; 0 for extended.
    pub track_size: u16,
}

/// One track's header fields.
#[derive(Debug, Clone, Copy)]
pub struct TrackInfo {
    pub cylinder: u8,
    pub side: u8,
    /// Default sector size code (N) for the track.
    pub size_code: u8,
    pub sector_count: u8,
    pub gap3: u8,
    pub filler: u8,
}

/// One sector's ID field and recorded status.
#[derive(Debug, Clone, Copy)]
pub struct SectorInfo {
    pub c: u8,
    pub h: u8,
    pub r: u8,
    pub n: u8,
    pub st1: u8,
    pub st2: u8,
    /// Bytes actually stored for this sector.
    pub data_len: u16,
}

struct SectorEntry {
    info: SectorInfo,
    /// Absolute file offset of the sector data.
    data_offset: u64,
}

struct TrackEntry {
    info: TrackInfo,
    sectors: Vec<SectorEntry>,
}

/// A file-backed DSK image with an in-memory index.
///
/// Sector writes go straight through to the file; the format's layout is
/// fixed at creation so data never moves.
pub struct DskImage {
    file: File,
    info: DiskInfo,
    extended: bool,
    /// Indexed `track * sides + side`; `None` for unformatted tracks.
    tracks: Vec<Option<TrackEntry>>,
    writable: bool,
}

impl DskImage {
    /// Whether the file starts with either DSK signature.
    #[must_use]
    pub fn probe(path: &Path) -> bool {
        let Ok(mut f) = File::open(path) else {
            return false;
        };
        let mut header = [0u8; 34];
        if f.read_exact(&mut header).is_err() {
            return false;
        }
        header == STANDARD_HEADER[..34] || header == EXTENDED_HEADER[..34]
    }

    pub fn open(path: &Path, read_only: bool) -> Result<Self, DskError> {
        let (mut file, writable) = if read_only {
            (File::open(path)?, false)
        } else {
            match OpenOptions::new().read(true).write(true).open(path) {
                Ok(f) => (f, true),
                Err(_) => (File::open(path)?, false),
            }
        };
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        if raw.len() < 0x100 {
            return Err(DskError::Truncated);
        }

        let extended = if raw[..EXTENDED_HEADER.len()] == *EXTENDED_HEADER {
            true
        } else if raw[..STANDARD_HEADER.len()] == *STANDARD_HEADER {
            false
        } else {
            return Err(DskError::BadSignature);
        };

        let num_tracks = raw[0x30];
        let num_sides = raw[0x31].max(1);
        let track_size = u16::from_le_bytes([raw[0x32], raw[0x33]]);
        let total = num_tracks as usize * num_sides as usize;

        let mut tracks = Vec::with_capacity(total);
        let mut offset = 0x100usize;
        for i in 0..total {
            let block_size = if extended {
                // Per-track size table at $34, in 256-byte units.
                raw.get(0x34 + i).copied().unwrap_or(0) as usize * 256
            } else {
                track_size as usize
            };
            if block_size == 0 {
                tracks.push(None); // Unformatted track
                continue;
            }
            if offset + 0x100 > raw.len() {
                break; // Truncated image: index what we can
            }
            let entry = parse_track(&raw, offset, extended)?;
            tracks.push(Some(entry));
            offset += block_size;
        }

        Ok(Self {
            file,
            info: DiskInfo {
                tracks: num_tracks,
                sides: num_sides,
                track_size: if extended { 0 } else { track_size },
            },
            extended,
            tracks,
            writable,
        })
    }

    #[must_use]
    pub fn disk_info(&self) -> DiskInfo {
        self.info
    }

    #[must_use]
    pub fn is_extended(&self) -> bool {
        self.extended
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    fn track(&self, side: u8, track: u8) -> Option<&TrackEntry> {
        if side >= self.info.sides {
            return None;
        }
        let index = track as usize * self.info.sides as usize + side as usize;
        self.tracks.get(index)?.as_ref()
    }

    /// Track header for a physical track/side, if formatted.
    #[must_use]
    pub fn track_info(&self, side: u8, track: u8) -> Option<TrackInfo> {
        self.track(side, track).map(|t| t.info)
    }

    /// Sector header by physical index within the track.
    #[must_use]
    pub fn sector_info(&self, side: u8, track: u8, sector: u8) -> Option<SectorInfo> {
        self.track(side, track)
            .and_then(|t| t.sectors.get(sector as usize))
            .map(|s| s.info)
    }

    /// Read a sector's data by physical index. `size_code` must match
    /// the sector's recorded N. Returns the stored byte count, or `None`
    /// on mismatch.
    pub fn read_sector_data(
        &mut self,
        side: u8,
        track: u8,
        sector: u8,
        size_code: u8,
        buf: &mut [u8],
    ) -> Option<usize> {
        let entry = self
            .track(side, track)
            .and_then(|t| t.sectors.get(sector as usize))?;
        if entry.info.n != size_code {
            return None;
        }
        let len = (entry.info.data_len as usize).min(buf.len());
        let offset = entry.data_offset;
        if self.file.seek(SeekFrom::Start(offset)).is_err() {
            return None;
        }
        self.file.read_exact(&mut buf[..len]).ok()?;
        Some(len)
    }

    /// Write a sector's data by physical index, in place.
    pub fn write_sector_data(
        &mut self,
        side: u8,
        track: u8,
        sector: u8,
        size_code: u8,
        data: &[u8],
    ) -> bool {
        if !self.writable {
            return false;
        }
        let Some(entry) = self
            .track(side, track)
            .and_then(|t| t.sectors.get(sector as usize))
        else {
            return false;
        };
        if entry.info.n != size_code {
            return false;
        }
        let len = (entry.info.data_len as usize).min(data.len());
        let offset = entry.data_offset;
        if self.file.seek(SeekFrom::Start(offset)).is_err() {
            return false;
        }
        self.file.write_all(&data[..len]).is_ok()
    }
}

fn parse_track(raw: &[u8], offset: usize, extended: bool) -> Result<TrackEntry, DskError> {
    let block = &raw[offset..];
    if block.len() < 0x18 || &block[..TRACK_SIGNATURE.len()] != TRACK_SIGNATURE {
        return Err(DskError::BadTrack { track: 0, side: 0 });
    }
    let cylinder = block[0x10];
    let side = block[0x11];
    let size_code = block[0x14];
    let sector_count = block[0x15];
    let gap3 = block[0x16];
    let filler = block[0x17];

    let mut sectors = Vec::with_capacity(sector_count as usize);
    let mut data_offset = offset as u64 + 0x100;
    for s in 0..sector_count as usize {
        let info_offset = 0x18 + s * 8;
        if info_offset + 8 > 0x100 {
            break;
        }
        let entry = &block[info_offset..info_offset + 8];
        let data_len = if extended {
            u16::from_le_bytes([entry[6], entry[7]])
        } else {
            128u16 << u16::from(size_code.min(7))
        };
        sectors.push(SectorEntry {
            info: SectorInfo {
                c: entry[0],
                h: entry[1],
                r: entry[2],
                n: entry[3],
                st1: entry[4],
                st2: entry[5],
                data_len,
            },
            data_offset,
        });
        data_offset += u64::from(data_len);
    }

    Ok(TrackEntry {
        info: TrackInfo {
            cylinder,
            side,
            size_code,
            sector_count,
            gap3,
            filler,
        },
        sectors,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a standard DSK: 1 track, 1 side, 2×512-byte sectors.
    fn make_standard_dsk() -> Vec<u8> {
        let mut data = vec![0u8; 0x100];
        data[..STANDARD_HEADER.len()].copy_from_slice(STANDARD_HEADER);
        data[0x30] = 1; // tracks
        data[0x31] = 1; // sides
        // Track size = 256 info + 2*512 data = 1280 = 0x500
        data[0x32] = 0x00;
        data[0x33] = 0x05;

        let mut track = vec![0u8; 256];
        track[..TRACK_SIGNATURE.len()].copy_from_slice(TRACK_SIGNATURE);
        track[0x10] = 0; // cylinder
        track[0x11] = 0; // side
        track[0x14] = 2; // N=2 (512 bytes)
        track[0x15] = 2; // two sectors
        track[0x16] = 0x4E; // GAP#3
        track[0x17] = 0xE5; // filler
        // Sector 1: C,H,R,N + ST1/ST2
        track[0x18..0x1C].copy_from_slice(&[0, 0, 1, 2]);
        // Sector 2 carries copy-protection status bits
        track[0x20..0x24].copy_from_slice(&[0, 0, 2, 2]);
        track[0x24] = 0x20; // ST1: data error
        track[0x25] = 0x20; // ST2: CRC error in data field
        data.extend_from_slice(&track);

        let mut sec1 = vec![0xE5u8; 512];
        sec1[0] = 0xAA;
        data.extend_from_slice(&sec1);
        let mut sec2 = vec![0xE5u8; 512];
        sec2[0] = 0xBB;
        data.extend_from_slice(&sec2);
        data
    }

    fn write_image(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.dsk");
        std::fs::write(&path, bytes).expect("write image");
        (dir, path)
    }

    #[test]
    fn probe_standard_and_reject_other() {
        let (_dir, path) = write_image(&make_standard_dsk());
        assert!(DskImage::probe(&path));
        let (_dir2, other) = write_image(&vec![0u8; 512]);
        assert!(!DskImage::probe(&other));
    }

    #[test]
    fn disk_and_track_info() {
        let (_dir, path) = write_image(&make_standard_dsk());
        let img = DskImage::open(&path, false).expect("open");
        let info = img.disk_info();
        assert_eq!(info.tracks, 1);
        assert_eq!(info.sides, 1);
        let track = img.track_info(0, 0).expect("track 0");
        assert_eq!(track.sector_count, 2);
        assert_eq!(track.gap3, 0x4E);
        assert_eq!(track.filler, 0xE5);
    }

    #[test]
    fn sector_info_carries_status_bits() {
        let (_dir, path) = write_image(&make_standard_dsk());
        let img = DskImage::open(&path, false).expect("open");
        let sec = img.sector_info(0, 0, 1).expect("second sector");
        assert_eq!(sec.r, 2);
        assert_eq!(sec.st1, 0x20);
        assert_eq!(sec.st2, 0x20);
        assert_eq!(sec.data_len, 512);
    }

    #[test]
    fn read_sector_by_index() {
        let (_dir, path) = write_image(&make_standard_dsk());
        let mut img = DskImage::open(&path, false).expect("open");
        let mut buf = [0u8; 512];
        assert_eq!(img.read_sector_data(0, 0, 0, 2, &mut buf), Some(512));
        assert_eq!(buf[0], 0xAA);
        assert_eq!(img.read_sector_data(0, 0, 1, 2, &mut buf), Some(512));
        assert_eq!(buf[0], 0xBB);
    }

    #[test]
    fn size_code_mismatch_rejected() {
        let (_dir, path) = write_image(&make_standard_dsk());
        let mut img = DskImage::open(&path, false).expect("open");
        let mut buf = [0u8; 512];
        assert_eq!(img.read_sector_data(0, 0, 0, 3, &mut buf), None);
    }

    #[test]
    fn write_persists_to_file() {
        let (_dir, path) = write_image(&make_standard_dsk());
        {
            let mut img = DskImage::open(&path, false).expect("open");
            assert!(img.write_sector_data(0, 0, 0, 2, &[0x11u8; 512]));
        }
        let mut img = DskImage::open(&path, true).expect("reopen");
        let mut buf = [0u8; 512];
        assert_eq!(img.read_sector_data(0, 0, 0, 2, &mut buf), Some(512));
        assert!(buf.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn extended_dsk_per_sector_lengths() {
        let mut data = vec![0u8; 0x100];
        data[..EXTENDED_HEADER.len()].copy_from_slice(EXTENDED_HEADER);
        data[0x30] = 1;
        data[0x31] = 1;
        data[0x34] = 2; // (256 info + 256 data) / 256

        let mut track = vec![0u8; 256];
        track[..TRACK_SIGNATURE.len()].copy_from_slice(TRACK_SIGNATURE);
        track[0x14] = 1; // N=1 (256 bytes)
        track[0x15] = 1;
        track[0x18..0x1C].copy_from_slice(&[0, 0, 1, 1]);
        track[0x1E] = 0x00; // actual length 256, little-endian
        track[0x1F] = 0x01;
        data.extend_from_slice(&track);
        let mut sec = vec![0u8; 256];
        sec[0] = 0xCC;
        data.extend_from_slice(&sec);

        let (_dir, path) = write_image(&data);
        let mut img = DskImage::open(&path, false).expect("open EDSK");
        assert!(img.is_extended());
        let info = img.sector_info(0, 0, 0).expect("sector");
        assert_eq!(info.data_len, 256);
        let mut buf = [0u8; 256];
        assert_eq!(img.read_sector_data(0, 0, 0, 1, &mut buf), Some(256));
        assert_eq!(buf[0], 0xCC);
    }

    #[test]
    fn unformatted_track_is_none() {
        let (_dir, path) = write_image(&make_standard_dsk());
        let img = DskImage::open(&path, false).expect("open");
        assert!(img.track_info(0, 5).is_none());
        assert!(img.track_info(1, 0).is_none());
    }
}
