//! CUE sheet parser and CD sector resolver.
//!
//! A cue sheet is a text descriptor referencing one or more binary
//! backing files. Keywords are case-insensitive; the ones that matter
//! for playback and data reads are FILE, TRACK, INDEX, PREGAP, POSTGAP,
//! CATALOG and ISRC. Timestamps are `mm:ss:ff` MSF with 75 frames per
//! second.
//!
//! The sheet is resolved once at open time into a disc layout: every
//! index gets an absolute disc position and a byte offset into its
//! backing file. Pregaps and postgaps occupy disc address space but no
//! file bytes; the final track of a file runs to the file's end.
//! Malformed lines are skipped, not fatal.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use thiserror::Error;

pub const FRAMES_PER_SECOND: u32 = 75;
pub const FRAMES_PER_MINUTE: u32 = 60 * FRAMES_PER_SECOND;

#[derive(Debug, Error)]
pub enum CueError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cue sheet references no readable track data")]
    NoTracks,
    #[error("backing file {0} is missing")]
    MissingFile(PathBuf),
}

/// Minute/second/frame CD address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Msf {
    pub m: u8,
    pub s: u8,
    pub f: u8,
}

impl Msf {
    #[must_use]
    pub const fn new(m: u8, s: u8, f: u8) -> Self {
        Self { m, s, f }
    }

    #[must_use]
    pub fn to_lba(self) -> u32 {
        (u32::from(self.m) * 60 + u32::from(self.s)) * FRAMES_PER_SECOND + u32::from(self.f)
    }

    #[must_use]
    pub fn from_lba(lba: u32) -> Self {
        Self {
            m: (lba / FRAMES_PER_MINUTE) as u8,
            s: (lba % FRAMES_PER_MINUTE / FRAMES_PER_SECOND) as u8,
            f: (lba % FRAMES_PER_SECOND) as u8,
        }
    }
}

/// What kind of data a track holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackClass {
    Audio,
    Karaoke,
    Mode1,
    ModeXa,
    ModeCdi,
}

/// A TRACK keyword's mode: identifier, stored sector size and class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackMode {
    pub name: &'static str,
    pub sector_size: u16,
    pub class: TrackClass,
}

/// All modes the TRACK keyword accepts.
pub const TRACK_MODES: [TrackMode; 10] = [
    TrackMode { name: "AUDIO", sector_size: 2352, class: TrackClass::Audio },
    TrackMode { name: "CDG", sector_size: 2448, class: TrackClass::Karaoke },
    TrackMode { name: "MODE1/2048", sector_size: 2048, class: TrackClass::Mode1 },
    TrackMode { name: "MODE1/2352", sector_size: 2352, class: TrackClass::Mode1 },
    TrackMode { name: "MODE2/2048", sector_size: 2048, class: TrackClass::ModeXa },
    TrackMode { name: "MODE2/2324", sector_size: 2324, class: TrackClass::ModeXa },
    TrackMode { name: "MODE2/2336", sector_size: 2336, class: TrackClass::ModeXa },
    TrackMode { name: "MODE2/2352", sector_size: 2352, class: TrackClass::ModeXa },
    TrackMode { name: "CDI/2336", sector_size: 2336, class: TrackClass::ModeCdi },
    TrackMode { name: "CDI/2352", sector_size: 2352, class: TrackClass::ModeCdi },
];

/// Result of resolving one MSF address against the disc layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectorLookup {
    /// The address lies outside every track.
    OutOfRange,
    /// The address falls in a pregap or postgap; `skip` frames remain
    /// until the next track data begins.
    Gap { skip: u32 },
    /// Track data; for calls with a buffer the sector has been read.
    Data { class: TrackClass, track: u8 },
}

/// One resolved index entry.
#[derive(Debug, Clone, Copy)]
pub struct CueIndex {
    pub number: u8,
    /// Absolute disc frame where this index starts.
    pub disc_lba: u32,
    /// Frames of data belonging to this index.
    pub frames: u32,
    /// Byte offset of the index data in the backing file.
    pub file_offset: u64,
}

/// One resolved track.
#[derive(Debug, Clone)]
pub struct CueTrack {
    pub number: u8,
    pub mode: TrackMode,
    pub pregap: u32,
    pub postgap: u32,
    pub isrc: Option<String>,
    pub indexes: Vec<CueIndex>,
    /// Backing file the track data lives in.
    pub file: PathBuf,
}

impl CueTrack {
    /// Disc frame of the first data index (index 1, or the lowest
    /// non-zero index).
    #[must_use]
    pub fn start_lba(&self) -> u32 {
        self.indexes
            .iter()
            .find(|i| i.number != 0)
            .or_else(|| self.indexes.first())
            .map_or(0, |i| i.disc_lba)
    }

    /// Inclusive disc frame of the last data frame.
    #[must_use]
    pub fn end_lba(&self) -> u32 {
        self.indexes
            .last()
            .map_or(0, |i| i.disc_lba + i.frames.saturating_sub(1))
    }
}

/// A parsed, position-resolved cue sheet.
pub struct CueSheet {
    tracks: Vec<CueTrack>,
    catalog: Option<String>,
    /// First frame past the last track's data and postgap.
    leadout: u32,
}

impl CueSheet {
    /// Whether the file looks like a cue sheet: `.cue` extension and
    /// readable.
    #[must_use]
    pub fn probe(path: &Path) -> bool {
        path.extension()
            .is_some_and(|e| e.eq_ignore_ascii_case("cue"))
            && File::open(path).is_ok()
    }

    /// Parse a sheet and resolve the disc layout. `base_dir` resolves
    /// relative backing file names.
    pub fn open(path: &Path, base_dir: &Path) -> Result<Self, CueError> {
        let mut text = String::new();
        File::open(path)?.read_to_string(&mut text).map_err(CueError::Io)?;
        let sheet_dir = path.parent().unwrap_or(Path::new(""));
        parse_sheet(&text, sheet_dir, base_dir)
    }

    #[must_use]
    pub fn tracks(&self) -> &[CueTrack] {
        &self.tracks
    }

    #[must_use]
    pub fn track(&self, number: u8) -> Option<&CueTrack> {
        self.tracks.iter().find(|t| t.number == number)
    }

    #[must_use]
    pub fn catalog(&self) -> Option<&str> {
        self.catalog.as_deref()
    }

    /// Disc frame of the lead-out (first frame past the user area).
    #[must_use]
    pub fn leadout_lba(&self) -> u32 {
        self.leadout
    }

    /// Resolve an MSF address without reading data.
    #[must_use]
    pub fn resolve(&self, msf: Msf) -> SectorLookup {
        self.lookup(msf, 0, 0).0
    }

    /// Resolve an MSF address and read its sector when it is track data.
    ///
    /// `size` must match the track mode's stored sector size when a
    /// buffer is supplied (0 skips the check and the read). A non-zero
    /// `track_filter`/`index_filter` restricts the match to one track or
    /// index, the way a host-selected subtrack does.
    pub fn read_sector_msf(
        &self,
        msf: Msf,
        buf: &mut [u8],
        size: u16,
        track_filter: u32,
        index_filter: u32,
    ) -> Result<SectorLookup, CueError> {
        let (lookup, location) = self.lookup(msf, track_filter, index_filter);
        let SectorLookup::Data { .. } = lookup else {
            return Ok(lookup);
        };
        let Some((track_idx, file_offset)) = location else {
            return Ok(SectorLookup::OutOfRange);
        };
        let track = &self.tracks[track_idx];
        if size != 0 {
            if size != track.mode.sector_size {
                return Ok(SectorLookup::OutOfRange);
            }
            let mut file = File::open(&track.file)?;
            file.seek(SeekFrom::Start(file_offset))?;
            file.read_exact(&mut buf[..size as usize])?;
        }
        Ok(lookup)
    }

    /// Locate the region containing `msf`. The second element carries
    /// (track array index, file byte offset) for data hits.
    fn lookup(&self, msf: Msf, track_filter: u32, index_filter: u32) -> (SectorLookup, Option<(usize, u64)>) {
        let lba = msf.to_lba();
        for (ti, track) in self.tracks.iter().enumerate() {
            let track_matches =
                track_filter == 0 || track_filter == u32::from(track.number);
            // Pregap occupies the frames right before the first index.
            let data_start = track.indexes.first().map_or(0, |i| i.disc_lba);
            if track.pregap != 0 && lba < data_start && lba >= data_start - track.pregap.min(data_start)
            {
                return (SectorLookup::Gap { skip: data_start - lba }, None);
            }
            for index in &track.indexes {
                if lba < index.disc_lba || lba >= index.disc_lba + index.frames {
                    continue;
                }
                if index.number == 0 {
                    // Index 0 is the in-file pregap of the track; audio
                    // players get silence, data reads skip forward.
                    let skip = index.disc_lba + index.frames - lba;
                    return (SectorLookup::Gap { skip }, None);
                }
                if !track_matches
                    || !(index_filter == 0 || index_filter == u32::from(index.number))
                {
                    return (SectorLookup::OutOfRange, None);
                }
                let offset = index.file_offset
                    + u64::from(lba - index.disc_lba) * u64::from(track.mode.sector_size);
                return (
                    SectorLookup::Data {
                        class: track.mode.class,
                        track: track.number,
                    },
                    Some((ti, offset)),
                );
            }
            // Postgap stretches from the end of the data to the next
            // track's region.
            if track.postgap != 0 {
                let end = track.end_lba() + 1;
                if lba >= end && lba < end + track.postgap {
                    return (SectorLookup::Gap { skip: end + track.postgap - lba }, None);
                }
            }
        }
        (SectorLookup::OutOfRange, None)
    }
}

/// Keyword lines collected in sheet order before position resolution.
enum RawLine {
    File(PathBuf),
    Track(u8, TrackMode),
    Index(u8, u32),
    Pregap(u32),
    Postgap(u32),
    Isrc(String),
    Catalog(String),
}

fn parse_sheet(text: &str, sheet_dir: &Path, base_dir: &Path) -> Result<CueSheet, CueError> {
    let mut lines = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let keyword = line.split_whitespace().next().unwrap_or("");
        let rest = line[keyword.len()..].trim_start();
        match keyword.to_ascii_lowercase().as_str() {
            "file" => {
                if let Some(name) = parse_file_line(rest) {
                    lines.push(RawLine::File(resolve_path(&name, sheet_dir, base_dir)));
                }
            }
            "track" => {
                let mut parts = rest.split_whitespace();
                let number = parts.next().and_then(|n| n.parse::<u8>().ok());
                let mode = parts.next().and_then(find_track_mode);
                if let (Some(number), Some(mode)) = (number, mode) {
                    lines.push(RawLine::Track(number, mode));
                }
            }
            "index" => {
                let mut parts = rest.split_whitespace();
                let number = parts.next().and_then(|n| n.parse::<u8>().ok());
                let frame = parts.next().and_then(parse_msf);
                if let (Some(number), Some(frame)) = (number, frame) {
                    lines.push(RawLine::Index(number, frame));
                }
            }
            "pregap" => {
                if let Some(frames) = rest.split_whitespace().next().and_then(parse_msf) {
                    lines.push(RawLine::Pregap(frames));
                }
            }
            "postgap" => {
                if let Some(frames) = rest.split_whitespace().next().and_then(parse_msf) {
                    lines.push(RawLine::Postgap(frames));
                }
            }
            "isrc" => {
                if rest.len() == 12 {
                    lines.push(RawLine::Isrc(rest.to_string()));
                }
            }
            "catalog" => {
                if rest.len() == 13 && rest.bytes().all(|b| b.is_ascii_digit()) {
                    lines.push(RawLine::Catalog(rest.to_string()));
                }
            }
            // REM and anything unrecognised is ignored.
            _ => {}
        }
    }
    resolve_layout(lines)
}

/// `FILE "name" BINARY`: the type is the last whitespace token, the
/// name is everything before it, optionally quoted. Only binary backing
/// files are supported.
fn parse_file_line(rest: &str) -> Option<String> {
    let rest = rest.trim_end();
    let split = rest.rfind(char::is_whitespace)?;
    let (name, file_type) = rest.split_at(split);
    if !file_type.trim().eq_ignore_ascii_case("binary") {
        return None;
    }
    let name = name.trim().trim_matches('"');
    if name.is_empty() {
        None
    } else {
        Some(name.to_string())
    }
}

fn resolve_path(name: &str, sheet_dir: &Path, base_dir: &Path) -> PathBuf {
    let candidate = sheet_dir.join(name);
    if candidate.is_file() {
        candidate
    } else {
        base_dir.join(name)
    }
}

fn find_track_mode(name: &str) -> Option<TrackMode> {
    TRACK_MODES
        .iter()
        .find(|m| m.name.eq_ignore_ascii_case(name))
        .copied()
}

/// Parse `mm:ss:ff` into a frame count. Frames above 74 are invalid.
fn parse_msf(text: &str) -> Option<u32> {
    let mut parts = text.split(':');
    let m = parts.next()?.parse::<u32>().ok()?;
    let s = parts.next()?.parse::<u32>().ok()?;
    let f = parts.next()?.parse::<u32>().ok()?;
    if parts.next().is_some() || s > 59 || f > 74 {
        return None;
    }
    Some((m * 60 + s) * FRAMES_PER_SECOND + f)
}

/// Walk the collected lines, assigning each index an absolute disc
/// position and file byte offset.
fn resolve_layout(lines: Vec<RawLine>) -> Result<CueSheet, CueError> {
    struct PendingIndex {
        track_slot: usize,
        number: u8,
        file_frame: u32,
    }

    let mut tracks: Vec<CueTrack> = Vec::new();
    let mut catalog = None;
    let mut disc_pos = 0u32;

    // Indexes are sized against the following index (or EOF), so they
    // are buffered per FILE and flushed when the file ends.
    let mut current_file: Option<PathBuf> = None;
    let mut pending: Vec<PendingIndex> = Vec::new();

    fn flush_file(
        file: &Option<PathBuf>,
        pending: &mut Vec<PendingIndex>,
        tracks: &mut Vec<CueTrack>,
        disc_pos: &mut u32,
    ) -> Result<(), CueError> {
        if pending.is_empty() {
            return Ok(());
        }
        let Some(file) = file else {
            pending.clear();
            return Ok(());
        };
        let file_size = std::fs::metadata(file)
            .map_err(|_| CueError::MissingFile(file.clone()))?
            .len();

        // Running byte position within the file: index timestamps are
        // frame counts, but each frame's width is its own track's
        // sector size, so offsets accumulate region by region.
        let mut file_pos = 0u64;
        for i in 0..pending.len() {
            let entry = &pending[i];
            let track = &tracks[entry.track_slot];
            let sector_size = u64::from(track.mode.sector_size);
            let file_offset = file_pos;
            let frames = if let Some(next) = pending.get(i + 1) {
                next.file_frame.saturating_sub(entry.file_frame)
            } else {
                (file_size.saturating_sub(file_pos) / sector_size) as u32
            };
            file_pos += u64::from(frames) * sector_size;

            // Pregap of the entry's track is consumed right before its
            // first index.
            let is_first_of_track = tracks[entry.track_slot].indexes.is_empty();
            if is_first_of_track {
                *disc_pos += tracks[entry.track_slot].pregap;
            }
            let index = CueIndex {
                number: entry.number,
                disc_lba: *disc_pos,
                frames,
                file_offset,
            };
            *disc_pos += frames;
            let track_slot = entry.track_slot;
            tracks[track_slot].indexes.push(index);

            // Postgap is consumed once the track's data ends.
            let track_done = pending
                .get(i + 1)
                .is_none_or(|n| n.track_slot != track_slot);
            if track_done {
                *disc_pos += tracks[track_slot].postgap;
            }
        }
        pending.clear();
        Ok(())
    }

    for line in lines {
        match line {
            RawLine::File(path) => {
                flush_file(&current_file, &mut pending, &mut tracks, &mut disc_pos)?;
                current_file = Some(path);
            }
            RawLine::Track(number, mode) => {
                let Some(file) = &current_file else {
                    continue; // TRACK before any FILE is ignored
                };
                tracks.push(CueTrack {
                    number,
                    mode,
                    pregap: 0,
                    postgap: 0,
                    isrc: None,
                    indexes: Vec::new(),
                    file: file.clone(),
                });
            }
            RawLine::Index(number, file_frame) => {
                if tracks.is_empty() {
                    continue;
                }
                pending.push(PendingIndex {
                    track_slot: tracks.len() - 1,
                    number,
                    file_frame,
                });
            }
            RawLine::Pregap(frames) => {
                if let Some(track) = tracks.last_mut() {
                    track.pregap = frames;
                }
            }
            RawLine::Postgap(frames) => {
                if let Some(track) = tracks.last_mut() {
                    track.postgap = frames;
                }
            }
            RawLine::Isrc(isrc) => {
                if let Some(track) = tracks.last_mut() {
                    if track.isrc.is_none() {
                        track.isrc = Some(isrc);
                    }
                }
            }
            RawLine::Catalog(mcn) => {
                if catalog.is_none() {
                    catalog = Some(mcn);
                }
            }
        }
    }
    flush_file(&current_file, &mut pending, &mut tracks, &mut disc_pos)?;

    tracks.retain(|t| !t.indexes.is_empty());
    if tracks.is_empty() {
        return Err(CueError::NoTracks);
    }
    Ok(CueSheet {
        tracks,
        catalog,
        leadout: disc_pos,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    /// One data track (4 sectors of 2048) and one audio track
    /// (10 frames of 2352) with a two-second pregap.
    fn make_disc() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("disc.bin");
        let mut f = File::create(&bin).expect("bin");
        for sector in 0u8..4 {
            let mut block = vec![sector; 2048];
            block[0] = 0xD0 + sector;
            f.write_all(&block).expect("data track");
        }
        for frame in 0u8..10 {
            f.write_all(&vec![0xA0 + frame; 2352]).expect("audio track");
        }
        let cue = dir.path().join("disc.cue");
        std::fs::write(
            &cue,
            "FILE \"disc.bin\" BINARY\n\
             \x20 TRACK 01 MODE1/2048\n\
             \x20   INDEX 01 00:00:00\n\
             \x20 TRACK 02 AUDIO\n\
             \x20   PREGAP 00:02:00\n\
             \x20   INDEX 01 00:00:04\n",
        )
        .expect("cue");
        (dir, cue)
    }

    #[test]
    fn msf_lba_round_trip() {
        let msf = Msf::new(2, 30, 44);
        assert_eq!(msf.to_lba(), (2 * 60 + 30) * 75 + 44);
        assert_eq!(Msf::from_lba(msf.to_lba()), msf);
    }

    #[test]
    fn probe_requires_cue_extension() {
        let (dir, cue) = make_disc();
        assert!(CueSheet::probe(&cue));
        assert!(!CueSheet::probe(&dir.path().join("disc.bin")));
    }

    #[test]
    fn layout_positions() {
        let (dir, cue) = make_disc();
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        assert_eq!(sheet.tracks().len(), 2);

        let t1 = sheet.track(1).expect("track 1");
        assert_eq!(t1.start_lba(), 0);
        assert_eq!(t1.end_lba(), 3);

        // 150-frame pregap pushes track 2 data to frame 154.
        let t2 = sheet.track(2).expect("track 2");
        assert_eq!(t2.pregap, 150);
        assert_eq!(t2.start_lba(), 154);
        assert_eq!(t2.end_lba(), 163);
        assert_eq!(sheet.leadout_lba(), 164);
    }

    #[test]
    fn resolve_track_membership() {
        let (dir, cue) = make_disc();
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        for lba in 0..4 {
            let r = sheet.resolve(Msf::from_lba(lba));
            assert_eq!(
                r,
                SectorLookup::Data { class: TrackClass::Mode1, track: 1 },
                "frame {lba} belongs to track 1"
            );
        }
        for lba in 154..164 {
            let r = sheet.resolve(Msf::from_lba(lba));
            assert_eq!(
                r,
                SectorLookup::Data { class: TrackClass::Audio, track: 2 },
                "frame {lba} belongs to track 2"
            );
        }
    }

    #[test]
    fn pregap_reports_skip_distance() {
        let (dir, cue) = make_disc();
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        assert_eq!(sheet.resolve(Msf::from_lba(4)), SectorLookup::Gap { skip: 150 });
        assert_eq!(sheet.resolve(Msf::from_lba(153)), SectorLookup::Gap { skip: 1 });
    }

    #[test]
    fn out_of_range_past_leadout() {
        let (dir, cue) = make_disc();
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        assert_eq!(sheet.resolve(Msf::from_lba(164)), SectorLookup::OutOfRange);
    }

    #[test]
    fn read_sector_checks_size_and_reads() {
        let (dir, cue) = make_disc();
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        let mut buf = vec![0u8; 2048];
        let r = sheet
            .read_sector_msf(Msf::from_lba(2), &mut buf, 2048, 0, 0)
            .expect("read");
        assert_eq!(r, SectorLookup::Data { class: TrackClass::Mode1, track: 1 });
        assert_eq!(buf[0], 0xD2);

        // Wrong size for the mode is rejected.
        let r = sheet
            .read_sector_msf(Msf::from_lba(2), &mut buf, 2047, 0, 0)
            .expect("lookup");
        assert_eq!(r, SectorLookup::OutOfRange);
    }

    #[test]
    fn audio_frames_read_from_file_tail() {
        let (dir, cue) = make_disc();
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        let mut buf = vec![0u8; 2352];
        let r = sheet
            .read_sector_msf(Msf::from_lba(154), &mut buf, 2352, 0, 0)
            .expect("read");
        assert_eq!(r, SectorLookup::Data { class: TrackClass::Audio, track: 2 });
        assert_eq!(buf[0], 0xA0, "first audio frame starts after the data track");
    }

    #[test]
    fn track_filter_hides_other_tracks() {
        let (dir, cue) = make_disc();
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        let mut buf = vec![0u8; 2048];
        let r = sheet
            .read_sector_msf(Msf::from_lba(2), &mut buf, 2048, 2, 0)
            .expect("lookup");
        assert_eq!(r, SectorLookup::OutOfRange);
    }

    #[test]
    fn postgap_occupies_disc_space() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("d.bin");
        std::fs::write(&bin, vec![0u8; 2048 * 2]).expect("bin");
        let cue = dir.path().join("d.cue");
        std::fs::write(
            &cue,
            "FILE \"d.bin\" BINARY\n\
             TRACK 01 MODE1/2048\n\
             INDEX 01 00:00:00\n\
             POSTGAP 00:01:00\n",
        )
        .expect("cue");
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        assert_eq!(sheet.track(1).expect("t1").postgap, 75);
        assert_eq!(sheet.resolve(Msf::from_lba(2)), SectorLookup::Gap { skip: 75 });
        assert_eq!(sheet.leadout_lba(), 77);
    }

    #[test]
    fn index_zero_is_a_gap() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("d.bin");
        // 150 frames of in-file pregap plus 10 frames of audio.
        std::fs::write(&bin, vec![0u8; 2352 * 160]).expect("bin");
        let cue = dir.path().join("d.cue");
        std::fs::write(
            &cue,
            "FILE \"d.bin\" BINARY\n\
             TRACK 01 AUDIO\n\
             INDEX 00 00:00:00\n\
             INDEX 01 00:02:00\n",
        )
        .expect("cue");
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        assert_eq!(sheet.resolve(Msf::from_lba(0)), SectorLookup::Gap { skip: 150 });
        assert_eq!(
            sheet.resolve(Msf::from_lba(150)),
            SectorLookup::Data { class: TrackClass::Audio, track: 1 }
        );
    }

    #[test]
    fn case_insensitive_keywords_and_catalog() {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("d.bin");
        std::fs::write(&bin, vec![0u8; 2048]).expect("bin");
        let cue = dir.path().join("d.cue");
        std::fs::write(
            &cue,
            "catalog 1234567890123\n\
             file \"d.bin\" binary\n\
             track 01 mode1/2048\n\
             index 01 00:00:00\n",
        )
        .expect("cue");
        let sheet = CueSheet::open(&cue, dir.path()).expect("open");
        assert_eq!(sheet.catalog(), Some("1234567890123"));
        assert_eq!(sheet.tracks().len(), 1);
    }

    #[test]
    fn missing_backing_file_errors() {
        let dir = tempfile::tempdir().expect("tempdir");
        let cue = dir.path().join("d.cue");
        std::fs::write(
            &cue,
            "FILE \"nope.bin\" BINARY\nTRACK 01 MODE1/2048\nINDEX 01 00:00:00\n",
        )
        .expect("cue");
        assert!(CueSheet::open(&cue, dir.path()).is_err());
    }
}
