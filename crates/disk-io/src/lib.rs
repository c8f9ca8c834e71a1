//! Disk mount slots and byte-range I/O routing.
//!
//! Eight slots hold the mounted media: two floppies, two hard disks,
//! two CD-ROMs and two spares. Mounting probes the image codec in a
//! fixed order (dynamic, DSK, IMD, CUE, then raw as the fallback) and
//! the router dispatches sector I/O to whichever backend claimed the
//! file. DSK, IMD and CUE have no plain sector handler: the controllers
//! reach their per-track entry points through [`DiskRouter::dsk`],
//! [`DiskRouter::imd`] and [`DiskRouter::cue`].
//!
//! Controllers hold slot ids only; the router owns every backend.
//! Media-change notification is a drained queue, delivered by the
//! machine between commands so it never preempts an in-flight transfer.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use format_cue::CueSheet;
use format_dsk::DskImage;
use format_dynamic::DynamicImage;
use format_imd::ImdImage;
use format_raw::RawImage;

pub const SECTOR_SIZE: usize = 512;

/// The eight mount slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskId {
    Floppy0,
    Floppy1,
    Hdd0,
    Hdd1,
    Cdrom0,
    Cdrom1,
    Spare0,
    Spare1,
}

impl DiskId {
    pub const ALL: [DiskId; 8] = [
        DiskId::Floppy0,
        DiskId::Floppy1,
        DiskId::Hdd0,
        DiskId::Hdd1,
        DiskId::Cdrom0,
        DiskId::Cdrom1,
        DiskId::Spare0,
        DiskId::Spare1,
    ];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            DiskId::Floppy0 => 0,
            DiskId::Floppy1 => 1,
            DiskId::Hdd0 => 2,
            DiskId::Hdd1 => 3,
            DiskId::Cdrom0 => 4,
            DiskId::Cdrom1 => 5,
            DiskId::Spare0 => 6,
            DiskId::Spare1 => 7,
        }
    }

    /// CD-ROM slots reject writes and honour track selection.
    #[must_use]
    pub fn is_cdrom(self) -> bool {
        matches!(self, DiskId::Cdrom0 | DiskId::Cdrom1)
    }

    #[must_use]
    pub fn is_floppy(self) -> bool {
        matches!(self, DiskId::Floppy0 | DiskId::Floppy1)
    }
}

/// Which codec claimed the mounted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Codec {
    #[default]
    None,
    Raw,
    Dynamic,
    Dsk,
    Imd,
    Cue,
}

/// A queued media event, drained by the machine between commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskChange {
    /// Slot contents were mounted, remounted or unmounted.
    Media(DiskId),
    /// The host asked for the medium to be ejected (tray button).
    EjectRequested(DiskId),
}

enum Backend {
    None,
    Raw(RawImage),
    Dynamic(DynamicImage),
    Dsk(DskImage),
    Imd(ImdImage),
    Cue(CueSheet),
}

impl Default for Backend {
    fn default() -> Self {
        Backend::None
    }
}

/// One mount slot.
#[derive(Default)]
struct MountedDisk {
    /// Canonical path of the image.
    filename: String,
    /// File name without directories, as shown to the user.
    raw_filename: String,
    start: u64,
    size: u64,
    read_only: bool,
    /// Latched when the most recent write failed because the medium is
    /// read-only.
    write_was_read_only: bool,
    /// CUE only: restrict reads to one track (0 = whole disc).
    selected_track: u32,
    /// CUE only: restrict reads to one index within the track.
    selected_subtrack: u32,
    backend: Backend,
}

impl MountedDisk {
    fn codec(&self) -> Codec {
        match self.backend {
            Backend::None => Codec::None,
            Backend::Raw(_) => Codec::Raw,
            Backend::Dynamic(_) => Codec::Dynamic,
            Backend::Dsk(_) => Codec::Dsk,
            Backend::Imd(_) => Codec::Imd,
            Backend::Cue(_) => Codec::Cue,
        }
    }
}

/// The router owning all eight slots.
pub struct DiskRouter {
    disks: [MountedDisk; 8],
    /// Base directory for relative image paths.
    disk_path: PathBuf,
    changes: VecDeque<DiskChange>,
}

impl DiskRouter {
    #[must_use]
    pub fn new(disk_path: PathBuf) -> Self {
        Self {
            disks: Default::default(),
            disk_path,
            changes: VecDeque::new(),
        }
    }

    #[must_use]
    pub fn disk_path(&self) -> &Path {
        &self.disk_path
    }

    /// Mount an image into a slot, probing codecs in order. An
    /// unreadable or unrecognisable file leaves the slot unmounted.
    /// Either way the change event is queued: pulling a disk is a
    /// media change too.
    pub fn mount(
        &mut self,
        id: DiskId,
        filename: &str,
        start: u64,
        read_only: bool,
        custom_size: u64,
    ) -> bool {
        let path = self.resolve(filename);
        let backend = probe_backends(&path, &self.disk_path, start, custom_size, read_only);
        let mounted = !matches!(backend, Backend::None);

        let slot = &mut self.disks[id.index()];
        slot.size = match &backend {
            Backend::Raw(img) => img.size(),
            Backend::Dynamic(img) => img.size(),
            // Track-addressed codecs have no flat byte size.
            Backend::Dsk(_) | Backend::Imd(_) | Backend::Cue(_) | Backend::None => 0,
        };
        slot.filename = if mounted {
            path.to_string_lossy().into_owned()
        } else {
            String::new()
        };
        slot.raw_filename = if mounted {
            Path::new(filename)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            String::new()
        };
        slot.start = start;
        slot.read_only = read_only
            || match &backend {
                Backend::Raw(img) => !img.writable(),
                Backend::Dynamic(img) => !img.writable(),
                Backend::Dsk(img) => !img.writable(),
                Backend::Imd(img) => !img.writable(),
                Backend::Cue(_) => true,
                Backend::None => false,
            };
        slot.write_was_read_only = false;
        slot.selected_track = 0;
        slot.selected_subtrack = 0;
        slot.backend = backend;

        self.changes.push_back(DiskChange::Media(id));
        mounted
    }

    /// Empty a slot. Queues the media-change event.
    pub fn unmount(&mut self, id: DiskId) {
        self.disks[id.index()] = MountedDisk::default();
        self.changes.push_back(DiskChange::Media(id));
    }

    /// Ask for an ejectable medium to be ejected. The UI owns the
    /// actual unmount; controllers see the request as a pending eject.
    pub fn request_eject(&mut self, id: DiskId) {
        if self.is_mounted(id) {
            self.changes.push_back(DiskChange::EjectRequested(id));
        }
    }

    /// Drain queued media events.
    pub fn drain_changes(&mut self) -> Vec<DiskChange> {
        self.changes.drain(..).collect()
    }

    #[must_use]
    pub fn is_mounted(&self, id: DiskId) -> bool {
        !matches!(self.disks[id.index()].backend, Backend::None)
    }

    #[must_use]
    pub fn codec(&self, id: DiskId) -> Codec {
        self.disks[id.index()].codec()
    }

    /// Flat byte size of the mounted medium (0 for track-addressed
    /// codecs).
    #[must_use]
    pub fn size(&self, id: DiskId) -> u64 {
        self.disks[id.index()].size
    }

    #[must_use]
    pub fn read_only(&self, id: DiskId) -> bool {
        self.disks[id.index()].read_only
    }

    /// Whether the most recent write failed because the medium is
    /// read-only.
    #[must_use]
    pub fn write_was_read_only(&self, id: DiskId) -> bool {
        self.disks[id.index()].write_was_read_only
    }

    #[must_use]
    pub fn raw_filename(&self, id: DiskId) -> &str {
        &self.disks[id.index()].raw_filename
    }

    /// Canonical path of the mounted image (empty when unmounted).
    #[must_use]
    pub fn filename(&self, id: DiskId) -> &str {
        &self.disks[id.index()].filename
    }

    /// Base offset of the image within its file.
    #[must_use]
    pub fn base_offset(&self, id: DiskId) -> u64 {
        self.disks[id.index()].start
    }

    /// Select the CUE track raw reads address (0 = whole disc).
    pub fn select_track(&mut self, id: DiskId, track: u32) {
        self.disks[id.index()].selected_track = track;
    }

    pub fn select_subtrack(&mut self, id: DiskId, subtrack: u32) {
        self.disks[id.index()].selected_subtrack = subtrack;
    }

    #[must_use]
    pub fn selected_track(&self, id: DiskId) -> u32 {
        self.disks[id.index()].selected_track
    }

    #[must_use]
    pub fn selected_subtrack(&self, id: DiskId) -> u32 {
        self.disks[id.index()].selected_subtrack
    }

    /// C/H/S geometry for raw and dynamic media, guessed from the size.
    #[must_use]
    pub fn geometry(&self, id: DiskId) -> Option<(u16, u16, u16)> {
        let slot = &self.disks[id.index()];
        match &slot.backend {
            Backend::Raw(_) | Backend::Dynamic(_) => guess_geometry(slot.size),
            Backend::Dsk(img) => {
                let info = img.disk_info();
                let track = img.track_info(0, 0)?;
                Some((
                    u16::from(info.tracks),
                    u16::from(info.sides),
                    u16::from(track.sector_count),
                ))
            }
            Backend::Imd(img) => {
                let info = img.disk_info()?;
                let sector = img.sector_info(0, 0, 0)?;
                Some((
                    u16::from(info.cylinders),
                    u16::from(info.heads),
                    u16::from(sector.total_sectors),
                ))
            }
            Backend::Cue(_) | Backend::None => None,
        }
    }

    /// Read a byte range, decomposed into sector reads. Fails whole on
    /// any unreadable sector, leaving `buf` contents unspecified.
    pub fn read(&mut self, id: DiskId, buf: &mut [u8], start_byte: u64) -> bool {
        if id.is_cdrom() && self.disks[id.index()].selected_track != 0 {
            // Raw access only addresses the whole disc.
            return false;
        }
        let slot = &mut self.disks[id.index()];
        let len = buf.len() as u64;
        if len == 0 {
            return true;
        }
        if start_byte + len > slot.size {
            return false;
        }

        let mut sector_buf = [0u8; SECTOR_SIZE];
        let mut done = 0usize;
        let mut pos = start_byte;
        while done < buf.len() {
            let lba = (pos / SECTOR_SIZE as u64) as u32;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(buf.len() - done);
            if !read_backend_sector(&mut slot.backend, lba, &mut sector_buf) {
                return false;
            }
            buf[done..done + chunk].copy_from_slice(&sector_buf[within..within + chunk]);
            done += chunk;
            pos += chunk as u64;
        }
        true
    }

    /// Write a byte range with read-modify-write on partial edge
    /// sectors. CD-ROM slots and read-only media reject the write, the
    /// latter latching [`DiskRouter::write_was_read_only`].
    pub fn write(&mut self, id: DiskId, data: &[u8], start_byte: u64) -> bool {
        if id.is_cdrom() {
            return false;
        }
        let slot = &mut self.disks[id.index()];
        if matches!(slot.backend, Backend::None) {
            return false;
        }
        if slot.read_only {
            slot.write_was_read_only = true;
            return false;
        }
        let len = data.len() as u64;
        if len == 0 {
            return true;
        }
        if start_byte + len > slot.size {
            return false;
        }

        let mut sector_buf = [0u8; SECTOR_SIZE];
        let mut done = 0usize;
        let mut pos = start_byte;
        while done < data.len() {
            let lba = (pos / SECTOR_SIZE as u64) as u32;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(data.len() - done);
            if chunk != SECTOR_SIZE {
                // Partial sector: read-modify-write.
                if !read_backend_sector(&mut slot.backend, lba, &mut sector_buf) {
                    return false;
                }
            }
            sector_buf[within..within + chunk].copy_from_slice(&data[done..done + chunk]);
            if !write_backend_sector(&mut slot.backend, lba, &sector_buf) {
                slot.write_was_read_only = slot.read_only;
                return false;
            }
            done += chunk;
            pos += chunk as u64;
        }
        true
    }

    /// DSK entry points for the floppy controller.
    pub fn dsk(&mut self, id: DiskId) -> Option<&mut DskImage> {
        match &mut self.disks[id.index()].backend {
            Backend::Dsk(img) => Some(img),
            _ => None,
        }
    }

    /// IMD entry points for the floppy controller.
    pub fn imd(&mut self, id: DiskId) -> Option<&mut ImdImage> {
        match &mut self.disks[id.index()].backend {
            Backend::Imd(img) => Some(img),
            _ => None,
        }
    }

    /// CUE entry points for the CD-ROM device.
    pub fn cue(&mut self, id: DiskId) -> Option<&CueSheet> {
        match &self.disks[id.index()].backend {
            Backend::Cue(sheet) => Some(sheet),
            _ => None,
        }
    }

    /// Latch the read-only cause flag after a failed controller write.
    pub fn note_write_read_only(&mut self, id: DiskId) {
        if self.disks[id.index()].read_only {
            self.disks[id.index()].write_was_read_only = true;
        }
    }

    fn resolve(&self, filename: &str) -> PathBuf {
        let path = Path::new(filename);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.disk_path.join(path)
        }
    }
}

fn read_backend_sector(backend: &mut Backend, lba: u32, buf: &mut [u8]) -> bool {
    match backend {
        Backend::Raw(img) => img.read_sector(lba, buf),
        Backend::Dynamic(img) => img.read_sector(lba, buf),
        // Track-addressed codecs have no flat sector handler.
        Backend::Dsk(_) | Backend::Imd(_) | Backend::Cue(_) | Backend::None => false,
    }
}

fn write_backend_sector(backend: &mut Backend, lba: u32, buf: &[u8]) -> bool {
    match backend {
        Backend::Raw(img) => img.write_sector(lba, buf),
        Backend::Dynamic(img) => img.write_sector(lba, buf),
        Backend::Dsk(_) | Backend::Imd(_) | Backend::Cue(_) | Backend::None => false,
    }
}

/// Probe order: dynamic, DSK, IMD, CUE, then raw as the fallback.
fn probe_backends(
    path: &Path,
    base_dir: &Path,
    start: u64,
    custom_size: u64,
    read_only: bool,
) -> Backend {
    if DynamicImage::probe(path) {
        if let Ok(img) = DynamicImage::open(path, read_only) {
            return Backend::Dynamic(img);
        }
    }
    if DskImage::probe(path) {
        if let Ok(img) = DskImage::open(path, read_only) {
            return Backend::Dsk(img);
        }
    }
    if ImdImage::probe(path) {
        if let Ok(img) = ImdImage::open(path, read_only) {
            return Backend::Imd(img);
        }
    }
    if CueSheet::probe(path) {
        if let Ok(sheet) = CueSheet::open(path, base_dir) {
            return Backend::Cue(sheet);
        }
    }
    if RawImage::probe(path) {
        if let Ok(img) = RawImage::open(path, start, custom_size, read_only) {
            return Backend::Raw(img);
        }
    }
    Backend::None
}

/// C/H/S from a flat size: the classic floppy capacities first, then
/// the 16-head/63-sector translation used for hard disk images.
#[must_use]
pub fn guess_geometry(size: u64) -> Option<(u16, u16, u16)> {
    const FLOPPY_SIZES: [(u64, u16, u16, u16); 13] = [
        (160, 40, 1, 8),
        (180, 40, 1, 9),
        (200, 40, 1, 10),
        (320, 40, 2, 8),
        (360, 40, 2, 9),
        (400, 40, 2, 10),
        (720, 80, 2, 9),
        (1200, 80, 2, 15),
        (1440, 80, 2, 18),
        (1680, 80, 2, 21),
        (1722, 82, 2, 21),
        (1840, 80, 2, 23),
        (2880, 80, 2, 36),
    ];
    if size == 0 || size % SECTOR_SIZE as u64 != 0 {
        return None;
    }
    let kb = size / 1024;
    for &(fkb, c, h, s) in &FLOPPY_SIZES {
        if fkb == kb {
            return Some((c, h, s));
        }
    }
    // Hard disk translation.
    let per_cylinder = 16 * 63 * SECTOR_SIZE as u64;
    let cylinders = size / per_cylinder;
    if cylinders == 0 || cylinders > 0xFFFF {
        return None;
    }
    Some((cylinders as u16, 16, 63))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn router_with_raw(size: usize) -> (tempfile::TempDir, DiskRouter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hdd.img");
        let mut f = std::fs::File::create(&path).expect("create");
        f.write_all(&vec![0u8; size]).expect("fill");
        let mut router = DiskRouter::new(dir.path().to_path_buf());
        assert!(router.mount(DiskId::Hdd0, "hdd.img", 0, false, 0));
        (dir, router)
    }

    #[test]
    fn mount_probes_raw_fallback() {
        let (_dir, router) = router_with_raw(16 * 63 * 512);
        assert_eq!(router.codec(DiskId::Hdd0), Codec::Raw);
        assert_eq!(router.size(DiskId::Hdd0), 16 * 63 * 512);
    }

    #[test]
    fn mount_detects_dynamic_over_raw() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("disk.img");
        format_dynamic::DynamicImage::create(&path, 1 << 20).expect("create");
        let mut router = DiskRouter::new(dir.path().to_path_buf());
        assert!(router.mount(DiskId::Hdd0, "disk.img", 0, false, 0));
        assert_eq!(router.codec(DiskId::Hdd0), Codec::Dynamic);
        assert_eq!(router.size(DiskId::Hdd0), 1 << 20);
    }

    #[test]
    fn failed_mount_still_queues_change() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut router = DiskRouter::new(dir.path().to_path_buf());
        assert!(!router.mount(DiskId::Floppy0, "missing.img", 0, false, 0));
        assert!(!router.is_mounted(DiskId::Floppy0));
        assert_eq!(
            router.drain_changes(),
            vec![DiskChange::Media(DiskId::Floppy0)]
        );
    }

    #[test]
    fn byte_range_read_write_round_trip() {
        let (_dir, mut router) = router_with_raw(4096);
        router.drain_changes();
        let data: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        // Unaligned start exercises the read-modify-write edges.
        assert!(router.write(DiskId::Hdd0, &data, 300));
        let mut back = vec![0u8; 1000];
        assert!(router.read(DiskId::Hdd0, &mut back, 300));
        assert_eq!(back, data);
        // Bytes around the range are untouched.
        let mut edge = [0u8; 4];
        assert!(router.read(DiskId::Hdd0, &mut edge, 296));
        assert_eq!(edge, [0, 0, 0, 0]);
    }

    #[test]
    fn reads_past_end_fail_atomically() {
        let (_dir, mut router) = router_with_raw(1024);
        let mut buf = [0u8; 512];
        assert!(!router.read(DiskId::Hdd0, &mut buf, 768));
        assert!(!router.write(DiskId::Hdd0, &buf, 768));
    }

    #[test]
    fn read_only_mount_latches_flag() {
        let (_dir, mut router) = {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("hdd.img");
            std::fs::write(&path, vec![0u8; 4096]).expect("create");
            let mut router = DiskRouter::new(dir.path().to_path_buf());
            assert!(router.mount(DiskId::Hdd0, "hdd.img", 0, true, 0));
            (dir, router)
        };
        assert!(router.read_only(DiskId::Hdd0));
        assert!(!router.write_was_read_only(DiskId::Hdd0));
        assert!(!router.write(DiskId::Hdd0, &[0u8; 512], 0));
        assert!(router.write_was_read_only(DiskId::Hdd0));
    }

    #[test]
    fn cdrom_rejects_writes_and_selected_track_raw_reads() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("cd.iso");
        std::fs::write(&path, vec![0u8; 4096]).expect("iso");
        let mut router = DiskRouter::new(dir.path().to_path_buf());
        assert!(router.mount(DiskId::Cdrom0, "cd.iso", 0, true, 0));
        assert!(!router.write(DiskId::Cdrom0, &[0u8; 512], 0));
        let mut buf = [0u8; 512];
        assert!(router.read(DiskId::Cdrom0, &mut buf, 0));
        router.select_track(DiskId::Cdrom0, 1);
        assert!(!router.read(DiskId::Cdrom0, &mut buf, 0));
    }

    #[test]
    fn unmount_clears_slot() {
        let (_dir, mut router) = router_with_raw(4096);
        router.drain_changes();
        router.unmount(DiskId::Hdd0);
        assert!(!router.is_mounted(DiskId::Hdd0));
        assert_eq!(router.size(DiskId::Hdd0), 0);
        assert_eq!(router.drain_changes(), vec![DiskChange::Media(DiskId::Hdd0)]);
    }

    #[test]
    fn eject_request_queues_event_only_when_mounted() {
        let (_dir, mut router) = router_with_raw(4096);
        router.drain_changes();
        router.request_eject(DiskId::Hdd0);
        router.request_eject(DiskId::Floppy1);
        assert_eq!(
            router.drain_changes(),
            vec![DiskChange::EjectRequested(DiskId::Hdd0)]
        );
    }

    #[test]
    fn geometry_guesses() {
        assert_eq!(guess_geometry(1_474_560), Some((80, 2, 18)));
        assert_eq!(guess_geometry(368_640), Some((40, 2, 9)));
        let hdd = 63 * 16 * 512 * 100u64;
        assert_eq!(guess_geometry(hdd), Some((100, 16, 63)));
        assert_eq!(guess_geometry(0), None);
    }

    #[test]
    fn floppy_size_invariant_after_mount() {
        let (_dir, router) = {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("fd.img");
            std::fs::write(&path, vec![0u8; 1_474_560]).expect("image");
            let mut router = DiskRouter::new(dir.path().to_path_buf());
            assert!(router.mount(DiskId::Floppy0, "fd.img", 0, false, 0));
            (dir, router)
        };
        let (c, h, s) = router.geometry(DiskId::Floppy0).expect("geometry");
        assert_eq!(
            u64::from(c) * u64::from(h) * u64::from(s) * 512,
            router.size(DiskId::Floppy0)
        );
    }
}
