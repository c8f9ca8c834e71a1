//! ImageDisk (IMD) disk image backend.
//!
//! An IMD file is an ASCII comment terminated by 0x1A, then one record
//! per track:
//!
//! ```text
//! mode        0..=2 FM at 500/300/250 kbps, 3..=5 MFM at 500/300/250
//! cylinder
//! head        bit 7 = cylinder map present, bit 6 = head map present
//! count       sectors in this track
//! size code   sector size = 128 << code
//! sector map  `count` sector IDs in physical order
//! [cyl map]   per-sector cylinder IDs when bit 7 set
//! [head map]  per-sector head IDs when bit 6 set
//! records     per sector: 0x00 unavailable, 0x01 normal, 0x02 compressed
//!             (one fill byte), 0x03/0x04 deleted, 0x05/0x06 data error,
//!             0x07/0x08 deleted + data error
//! ```
//!
//! Writes update the in-memory model and rewrite the file: compressed
//! records change size when they stop being uniform, so offsets move.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use thiserror::Error;

const COMMENT_TERMINATOR: u8 = 0x1A;

#[derive(Debug, Error)]
pub enum ImdError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not an IMD file (bad signature)")]
    BadSignature,
    #[error("truncated track record at cylinder {0}")]
    TruncatedTrack(u8),
    #[error("unsupported sector record type {0:#04X}")]
    BadRecord(u8),
}

/// How a sector's data field is marked on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataMark {
    Normal,
    Deleted,
    NormalDataError,
    DeletedDataError,
    /// Record type 0: the sector could not be read when imaging.
    Unavailable,
}

impl DataMark {
    #[must_use]
    pub fn is_deleted(self) -> bool {
        matches!(self, DataMark::Deleted | DataMark::DeletedDataError)
    }

    #[must_use]
    pub fn is_data_error(self) -> bool {
        matches!(self, DataMark::NormalDataError | DataMark::DeletedDataError)
    }
}

/// Recording mode of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackMode {
    pub mfm: bool,
    /// 0 = 500 kbps, 1 = 300 kbps, 2 = 250 kbps.
    pub rate: u8,
}

impl TrackMode {
    fn from_byte(mode: u8) -> Self {
        Self {
            mfm: mode >= 3,
            rate: mode % 3,
        }
    }

    fn to_byte(self) -> u8 {
        self.rate % 3 + if self.mfm { 3 } else { 0 }
    }
}

/// Everything the controller needs to know about one sector.
#[derive(Debug, Clone, Copy)]
pub struct ImdSectorInfo {
    pub mode: TrackMode,
    pub sector_id: u8,
    pub cylinder_id: u8,
    pub head_id: u8,
    pub sector_size: u16,
    pub total_sectors: u8,
    pub mark: DataMark,
}

/// Whole-disk summary.
#[derive(Debug, Clone, Copy)]
pub struct ImdDiskInfo {
    pub cylinders: u8,
    pub heads: u8,
    pub mfm: bool,
}

enum SectorData {
    Unavailable,
    Whole(Vec<u8>),
    /// All bytes equal; stored as a single fill byte.
    Compressed(u8),
}

struct ImdSector {
    sector_id: u8,
    cylinder_id: u8,
    head_id: u8,
    mark: DataMark,
    data: SectorData,
}

struct ImdTrack {
    mode: TrackMode,
    cylinder: u8,
    head: u8,
    size_code: u8,
    sectors: Vec<ImdSector>,
}

/// A file-backed IMD image, fully parsed into memory.
pub struct ImdImage {
    file: File,
    comment: Vec<u8>,
    tracks: Vec<ImdTrack>,
    writable: bool,
}

impl ImdImage {
    /// Whether the file starts with the `IMD ` signature.
    #[must_use]
    pub fn probe(path: &Path) -> bool {
        let Ok(mut f) = File::open(path) else {
            return false;
        };
        let mut sig = [0u8; 4];
        f.read_exact(&mut sig).is_ok() && &sig == b"IMD "
    }

    pub fn open(path: &Path, read_only: bool) -> Result<Self, ImdError> {
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
        if raw.len() < 4 || &raw[..4] != b"IMD " {
            return Err(ImdError::BadSignature);
        }

        let comment_end = raw
            .iter()
            .position(|&b| b == COMMENT_TERMINATOR)
            .ok_or(ImdError::BadSignature)?;
        let comment = raw[..comment_end].to_vec();

        let mut tracks = Vec::new();
        let mut pos = comment_end + 1;
        while pos < raw.len() {
            let (track, next) = parse_track(&raw, pos)?;
            tracks.push(track);
            pos = next;
        }

        Ok(Self {
            file,
            comment,
            tracks,
            writable,
        })
    }

    #[must_use]
    pub fn comment(&self) -> &[u8] {
        &self.comment
    }

    #[must_use]
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Whole-disk summary: highest cylinder/head plus one, and the mode
    /// of the first track.
    #[must_use]
    pub fn disk_info(&self) -> Option<ImdDiskInfo> {
        let first = self.tracks.first()?;
        let cylinders = self.tracks.iter().map(|t| t.cylinder).max()? + 1;
        let heads = self.tracks.iter().map(|t| t.head).max()? + 1;
        Some(ImdDiskInfo {
            cylinders,
            heads,
            mfm: first.mode.mfm,
        })
    }

    fn track(&self, cylinder: u8, head: u8) -> Option<&ImdTrack> {
        self.tracks
            .iter()
            .find(|t| t.cylinder == cylinder && t.head == head)
    }

    /// Sector header by physical index within the track.
    #[must_use]
    pub fn sector_info(&self, cylinder: u8, head: u8, sector: u8) -> Option<ImdSectorInfo> {
        let track = self.track(cylinder, head)?;
        let entry = track.sectors.get(sector as usize)?;
        Some(ImdSectorInfo {
            mode: track.mode,
            sector_id: entry.sector_id,
            cylinder_id: entry.cylinder_id,
            head_id: entry.head_id,
            sector_size: 128u16 << u16::from(track.size_code.min(7)),
            total_sectors: track.sectors.len() as u8,
            mark: entry.mark,
        })
    }

    /// Read a sector's data by physical index. Compressed records expand
    /// to their fill byte. Unavailable sectors fail.
    pub fn read_sector(&self, cylinder: u8, head: u8, sector: u8, buf: &mut [u8]) -> Option<usize> {
        let track = self.track(cylinder, head)?;
        let entry = track.sectors.get(sector as usize)?;
        let size = (128usize << track.size_code.min(7)).min(buf.len());
        match &entry.data {
            SectorData::Unavailable => None,
            SectorData::Whole(data) => {
                let len = size.min(data.len());
                buf[..len].copy_from_slice(&data[..len]);
                Some(len)
            }
            SectorData::Compressed(fill) => {
                buf[..size].fill(*fill);
                Some(size)
            }
        }
    }

    /// Write a sector's data by physical index, updating the data mark,
    /// then rewrite the backing file.
    pub fn write_sector(
        &mut self,
        cylinder: u8,
        head: u8,
        sector: u8,
        deleted: bool,
        data: &[u8],
    ) -> bool {
        if !self.writable {
            return false;
        }
        let Some(track) = self
            .tracks
            .iter_mut()
            .find(|t| t.cylinder == cylinder && t.head == head)
        else {
            return false;
        };
        let size = 128usize << track.size_code.min(7);
        if data.len() < size {
            return false;
        }
        let Some(entry) = track.sectors.get_mut(sector as usize) else {
            return false;
        };
        let first = data[0];
        entry.data = if data[..size].iter().all(|&b| b == first) {
            SectorData::Compressed(first)
        } else {
            SectorData::Whole(data[..size].to_vec())
        };
        entry.mark = if deleted {
            DataMark::Deleted
        } else {
            DataMark::Normal
        };
        self.flush()
    }

    /// Replace (or append) a whole track with freshly formatted sectors.
    ///
    /// `ids` holds one (C, H, R, N) header per sector, in physical
    /// order, as collected by the controller's format command. All
    /// sectors take `size_code` and the `fill` byte.
    pub fn format_track(
        &mut self,
        cylinder: u8,
        head: u8,
        mode: TrackMode,
        fill: u8,
        size_code: u8,
        ids: &[(u8, u8, u8, u8)],
    ) -> bool {
        if !self.writable || ids.is_empty() {
            return false;
        }
        let sectors = ids
            .iter()
            .map(|&(c, h, r, _n)| ImdSector {
                sector_id: r,
                cylinder_id: c,
                head_id: h,
                mark: DataMark::Normal,
                data: SectorData::Compressed(fill),
            })
            .collect();
        let new_track = ImdTrack {
            mode,
            cylinder,
            head,
            size_code: size_code.min(7),
            sectors,
        };
        if let Some(track) = self
            .tracks
            .iter_mut()
            .find(|t| t.cylinder == cylinder && t.head == head)
        {
            *track = new_track;
        } else {
            self.tracks.push(new_track);
        }
        self.flush()
    }

    /// Serialise the whole image back to the file.
    fn flush(&mut self) -> bool {
        let mut out = self.comment.clone();
        out.push(COMMENT_TERMINATOR);
        for track in &self.tracks {
            out.push(track.mode.to_byte());
            out.push(track.cylinder);
            let cyl_map = track.sectors.iter().any(|s| s.cylinder_id != track.cylinder);
            let head_map = track.sectors.iter().any(|s| s.head_id != track.head);
            let mut head = track.head & 0x0F;
            if cyl_map {
                head |= 0x80;
            }
            if head_map {
                head |= 0x40;
            }
            out.push(head);
            out.push(track.sectors.len() as u8);
            out.push(track.size_code);
            for s in &track.sectors {
                out.push(s.sector_id);
            }
            if cyl_map {
                for s in &track.sectors {
                    out.push(s.cylinder_id);
                }
            }
            if head_map {
                for s in &track.sectors {
                    out.push(s.head_id);
                }
            }
            for s in &track.sectors {
                let base: u8 = match s.mark {
                    DataMark::Normal => 0x01,
                    DataMark::Deleted => 0x03,
                    DataMark::NormalDataError => 0x05,
                    DataMark::DeletedDataError => 0x07,
                    DataMark::Unavailable => {
                        out.push(0x00);
                        continue;
                    }
                };
                match &s.data {
                    SectorData::Unavailable => out.push(0x00),
                    SectorData::Whole(data) => {
                        out.push(base);
                        out.extend_from_slice(data);
                    }
                    SectorData::Compressed(fill) => {
                        out.push(base + 1);
                        out.push(*fill);
                    }
                }
            }
        }
        if self.file.seek(SeekFrom::Start(0)).is_err() {
            return false;
        }
        if self.file.write_all(&out).is_err() {
            return false;
        }
        self.file.set_len(out.len() as u64).is_ok()
    }
}

fn parse_track(raw: &[u8], pos: usize) -> Result<(ImdTrack, usize), ImdError> {
    let header = raw.get(pos..pos + 5).ok_or_else(|| {
        ImdError::TruncatedTrack(raw.get(pos + 1).copied().unwrap_or(0))
    })?;
    let mode = TrackMode::from_byte(header[0]);
    let cylinder = header[1];
    let head_byte = header[2];
    let count = header[3] as usize;
    let size_code = header[4];
    let sector_size = 128usize << size_code.min(7);

    let mut pos = pos + 5;
    let sector_map = raw
        .get(pos..pos + count)
        .ok_or(ImdError::TruncatedTrack(cylinder))?
        .to_vec();
    pos += count;

    let cyl_map = if head_byte & 0x80 != 0 {
        let map = raw
            .get(pos..pos + count)
            .ok_or(ImdError::TruncatedTrack(cylinder))?
            .to_vec();
        pos += count;
        Some(map)
    } else {
        None
    };
    let head_map = if head_byte & 0x40 != 0 {
        let map = raw
            .get(pos..pos + count)
            .ok_or(ImdError::TruncatedTrack(cylinder))?
            .to_vec();
        pos += count;
        Some(map)
    } else {
        None
    };

    let mut sectors = Vec::with_capacity(count);
    for i in 0..count {
        let record = *raw.get(pos).ok_or(ImdError::TruncatedTrack(cylinder))?;
        pos += 1;
        let (mark, data) = match record {
            0x00 => (DataMark::Unavailable, SectorData::Unavailable),
            0x01 | 0x03 | 0x05 | 0x07 => {
                let data = raw
                    .get(pos..pos + sector_size)
                    .ok_or(ImdError::TruncatedTrack(cylinder))?
                    .to_vec();
                pos += sector_size;
                (record_mark(record), SectorData::Whole(data))
            }
            0x02 | 0x04 | 0x06 | 0x08 => {
                let fill = *raw.get(pos).ok_or(ImdError::TruncatedTrack(cylinder))?;
                pos += 1;
                (record_mark(record - 1), SectorData::Compressed(fill))
            }
            other => return Err(ImdError::BadRecord(other)),
        };
        sectors.push(ImdSector {
            sector_id: sector_map[i],
            cylinder_id: cyl_map.as_ref().map_or(cylinder, |m| m[i]),
            head_id: head_map.as_ref().map_or(head_byte & 0x0F, |m| m[i]),
            mark,
            data,
        });
    }

    Ok((
        ImdTrack {
            mode,
            cylinder,
            head: head_byte & 0x0F,
            size_code: size_code.min(7),
            sectors,
        },
        pos,
    ))
}

fn record_mark(record: u8) -> DataMark {
    match record {
        0x01 => DataMark::Normal,
        0x03 => DataMark::Deleted,
        0x05 => DataMark::NormalDataError,
        _ => DataMark::DeletedDataError,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// One-cylinder, one-head MFM image with two 512-byte sectors:
    /// sector 1 whole data, sector 2 compressed fill.
    fn make_imd() -> Vec<u8> {
        let mut data = b"IMD 1.18: 01/01/2020 12:00:00\r\ntest disk\r\n".to_vec();
        data.push(COMMENT_TERMINATOR);
        data.push(5); // MFM 250 kbps
        data.push(0); // cylinder
        data.push(0); // head, no maps
        data.push(2); // two sectors
        data.push(2); // 512 bytes
        data.extend_from_slice(&[1, 2]); // sector map
        data.push(0x01); // sector 1: normal whole data
        let mut sec = vec![0u8; 512];
        sec[0] = 0xAA;
        data.extend_from_slice(&sec);
        data.push(0x04); // sector 2: compressed, deleted mark
        data.push(0xE5);
        data
    }

    fn write_image(bytes: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.imd");
        std::fs::write(&path, bytes).expect("write image");
        (dir, path)
    }

    #[test]
    fn probe_signature() {
        let (_dir, path) = write_image(&make_imd());
        assert!(ImdImage::probe(&path));
        let (_dir2, other) = write_image(b"MV - CPCEMU junk");
        assert!(!ImdImage::probe(&other));
    }

    #[test]
    fn disk_info_counts() {
        let (_dir, path) = write_image(&make_imd());
        let img = ImdImage::open(&path, true).expect("open");
        let info = img.disk_info().expect("info");
        assert_eq!(info.cylinders, 1);
        assert_eq!(info.heads, 1);
        assert!(info.mfm);
    }

    #[test]
    fn sector_info_reports_marks() {
        let (_dir, path) = write_image(&make_imd());
        let img = ImdImage::open(&path, true).expect("open");
        let s0 = img.sector_info(0, 0, 0).expect("sector 0");
        assert_eq!(s0.sector_id, 1);
        assert_eq!(s0.mark, DataMark::Normal);
        assert_eq!(s0.sector_size, 512);
        assert_eq!(s0.total_sectors, 2);
        let s1 = img.sector_info(0, 0, 1).expect("sector 1");
        assert_eq!(s1.sector_id, 2);
        assert!(s1.mark.is_deleted());
    }

    #[test]
    fn compressed_sector_expands() {
        let (_dir, path) = write_image(&make_imd());
        let img = ImdImage::open(&path, true).expect("open");
        let mut buf = [0u8; 512];
        assert_eq!(img.read_sector(0, 0, 1, &mut buf), Some(512));
        assert!(buf.iter().all(|&b| b == 0xE5));
    }

    #[test]
    fn write_round_trips_through_file() {
        let (_dir, path) = write_image(&make_imd());
        {
            let mut img = ImdImage::open(&path, false).expect("open");
            let mut data = vec![0u8; 512];
            data[0] = 0x77;
            data[511] = 0x88;
            assert!(img.write_sector(0, 0, 1, false, &data));
        }
        let img = ImdImage::open(&path, true).expect("reopen");
        let mut buf = [0u8; 512];
        assert_eq!(img.read_sector(0, 0, 1, &mut buf), Some(512));
        assert_eq!(buf[0], 0x77);
        assert_eq!(buf[511], 0x88);
        assert_eq!(
            img.sector_info(0, 0, 1).expect("info").mark,
            DataMark::Normal,
            "write with deleted=false clears the deleted mark"
        );
    }

    #[test]
    fn format_track_replaces_sectors() {
        let (_dir, path) = write_image(&make_imd());
        {
            let mut img = ImdImage::open(&path, false).expect("open");
            let ids = [(0, 0, 5, 2), (0, 0, 6, 2), (0, 0, 7, 2)];
            assert!(img.format_track(
                0,
                0,
                TrackMode { mfm: true, rate: 2 },
                0xF6,
                2,
                &ids
            ));
        }
        let img = ImdImage::open(&path, true).expect("reopen");
        let info = img.sector_info(0, 0, 0).expect("info");
        assert_eq!(info.total_sectors, 3);
        assert_eq!(info.sector_id, 5);
        let mut buf = [0u8; 512];
        assert_eq!(img.read_sector(0, 0, 2, &mut buf), Some(512));
        assert!(buf.iter().all(|&b| b == 0xF6));
    }

    #[test]
    fn unavailable_sector_fails_reads() {
        let mut data = b"IMD 1.18: test\r\n".to_vec();
        data.push(COMMENT_TERMINATOR);
        data.extend_from_slice(&[5, 0, 0, 1, 2]); // one 512-byte sector
        data.push(9); // sector map: id 9
        data.push(0x00); // unavailable
        let (_dir, path) = write_image(&data);
        let img = ImdImage::open(&path, true).expect("open");
        assert_eq!(
            img.sector_info(0, 0, 0).expect("info").mark,
            DataMark::Unavailable
        );
        let mut buf = [0u8; 512];
        assert!(img.read_sector(0, 0, 0, &mut buf).is_none());
    }

    #[test]
    fn cylinder_map_overrides_ids() {
        let mut data = b"IMD 1.18: test\r\n".to_vec();
        data.push(COMMENT_TERMINATOR);
        data.push(5); // mode
        data.push(3); // physical cylinder 3
        data.push(0x80); // cylinder map present, head 0
        data.push(1); // one sector
        data.push(0); // 128 bytes
        data.push(1); // sector map
        data.push(0xFF); // cylinder map: bad track marker
        data.push(0x01);
        data.extend_from_slice(&[0u8; 128]);
        let (_dir, path) = write_image(&data);
        let img = ImdImage::open(&path, true).expect("open");
        let info = img.sector_info(3, 0, 0).expect("info");
        assert_eq!(info.cylinder_id, 0xFF);
    }
}
