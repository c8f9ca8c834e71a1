//! The ATAPI packet protocol: 12-byte command packets over the ATA
//! task file, the sense machinery, mode pages, the loading/spinning
//! state machine and the CD command set.
//!
//! Interrupt-reason coding rides in the sector count register: bit 0
//! C/nD (command vs data), bit 1 I/O (to the host). The byte count
//! registers window large transfers into sub-blocks of at most 0xFFFE
//! bytes.

use disk_io::{Codec, DiskId, DiskRouter};
use emu_core::{NanoTimer, Nanos};
use format_cue::{Msf, SectorLookup, TrackClass};

use crate::audio::{AudioPlayer, FrameFetch};
use crate::{AtaDevice, DevicePhase, STATUS_DSC, STATUS_ERR};

// Packet opcodes (SFF-8020 mandatory set).
const TEST_UNIT_READY: u8 = 0x00;
const REQUEST_SENSE: u8 = 0x03;
const INQUIRY: u8 = 0x12;
const START_STOP_UNIT: u8 = 0x1B;
const PREVENT_ALLOW_REMOVAL: u8 = 0x1E;
const READ_CAPACITY: u8 = 0x25;
const READ_10: u8 = 0x28;
const SEEK_10: u8 = 0x2B;
const READ_SUBCHANNEL: u8 = 0x42;
const READ_TOC: u8 = 0x43;
const READ_HEADER: u8 = 0x44;
const PLAY_AUDIO_10: u8 = 0x45;
const PLAY_AUDIO_MSF: u8 = 0x47;
const PAUSE_RESUME: u8 = 0x4B;
const STOP_PLAY_SCAN: u8 = 0x4E;
const MODE_SELECT_10: u8 = 0x55;
const MODE_SENSE_10: u8 = 0x5A;
const READ_12: u8 = 0xA8;
const READ_CD_MSF: u8 = 0xB9;
const MECHANISM_STATUS: u8 = 0xBD;
const READ_CD: u8 = 0xBE;

// Sense keys.
pub const SENSE_NONE: u8 = 0;
pub const SENSE_NOT_READY: u8 = 2;
pub const SENSE_ILLEGAL_REQUEST: u8 = 5;
pub const SENSE_UNIT_ATTENTION: u8 = 6;

// Additional sense codes.
pub const ASC_BECOMING_READY: u8 = 0x04;
pub const ASC_INVALID_COMMAND: u8 = 0x20;
pub const ASC_LBA_OUT_OF_RANGE: u8 = 0x21;
pub const ASC_INVALID_FIELD: u8 = 0x24;
pub const ASC_MEDIUM_MAY_HAVE_CHANGED: u8 = 0x28;
pub const ASC_MEDIUM_NOT_PRESENT: u8 = 0x3A;
pub const ASC_MEDIUM_REMOVAL_PREVENTED: u8 = 0x53;
pub const ASC_ILLEGAL_MODE_FOR_TRACK: u8 = 0x64;

/// The 2-second lead-in offset between logical block 0 and MSF 00:02:00.
const MSF_OFFSET: u32 = 150;

const SPINUP_NS: Nanos = 1_000_000_000.0;
const SPINDOWN_AUTO_NS: Nanos = 10_000_000_000.0;
const SPINDOWN_COMMANDED_NS: Nanos = 1_000_000_000.0;
const EJECT_NS: Nanos = 1_000_000_000.0;
const INSERT_NS: Nanos = 1_000_000_000.0;

/// Where the packet engine is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PacketPhase {
    #[default]
    Idle,
    /// Receiving the 12 command bytes.
    Command,
    /// Transferring response data to the host.
    DataIn,
    /// Receiving parameter data from the host.
    DataOut,
    /// Completion status pending.
    Result,
}

/// Tray/spindle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoadingState {
    #[default]
    Idle,
    NoDisc,
    /// Tray closing with a fresh disc.
    InsertCd,
    /// Spinning up.
    DiscLoading,
    /// Spun up, about to report ready.
    DiscReadied,
    Ready,
    /// Spun down; media present but the motor is off.
    SpinDown,
    /// Tray opening.
    Ejecting,
}

/// Cached per-track geometry captured from the cue sheet at mount time.
#[derive(Debug, Clone, Copy)]
pub struct TocEntry {
    pub number: u8,
    pub class: TrackClass,
    /// First frame of track data (logical block address).
    pub start: u32,
    /// Last data frame, inclusive.
    pub end: u32,
    pub pregap: u32,
    pub postgap: u32,
}

/// Mode page storage with per-page writable masks.
pub struct ModePages {
    /// Page 0x01: read error recovery.
    pub error_recovery: [u8; 8],
    /// Page 0x0D: CD-ROM parameters.
    pub cdrom: [u8; 8],
    /// Page 0x0E: CD audio control (port volumes at 9/11/13/15).
    pub audio_control: [u8; 16],
    /// Page 0x2A: capabilities and mechanical status (read-only).
    pub capabilities: [u8; 20],
}

impl ModePages {
    fn new() -> Self {
        let mut audio_control = [0u8; 16];
        audio_control[0] = 0x0E;
        audio_control[1] = 14;
        audio_control[2] = 0x04; // Immed
        audio_control[8] = 0x01; // port 0 -> channel 0
        audio_control[9] = 0xFF;
        audio_control[10] = 0x02; // port 1 -> channel 1
        audio_control[11] = 0xFF;
        let mut capabilities = [0u8; 20];
        capabilities[0] = 0x2A;
        capabilities[1] = 18;
        capabilities[4] = 0x03; // audio play + composite
        capabilities[5] = 0x03; // CD-DA commands, accurate streaming
        capabilities[6] = 0x29; // tray loader, eject, lock
        capabilities[8] = 0x02; // max speed 706 kB/s
        capabilities[9] = 0xC2;
        capabilities[10] = 0x01; // 256 volume levels
        capabilities[11] = 0x00;
        let mut error_recovery = [0u8; 8];
        error_recovery[0] = 0x01;
        error_recovery[1] = 6;
        let mut cdrom = [0u8; 8];
        cdrom[0] = 0x0D;
        cdrom[1] = 6;
        cdrom[5] = 60; // seconds per MSF minute unit
        cdrom[7] = 75; // frames per MSF second unit
        Self {
            error_recovery,
            cdrom,
            audio_control,
            capabilities,
        }
    }

    fn page(&self, code: u8) -> Option<&[u8]> {
        match code {
            0x01 => Some(&self.error_recovery),
            0x0D => Some(&self.cdrom),
            0x0E => Some(&self.audio_control),
            0x2A => Some(&self.capabilities),
            _ => None,
        }
    }

    /// Apply a MODE SELECT page, honouring the writable mask.
    fn select(&mut self, code: u8, data: &[u8]) -> bool {
        match code {
            0x01 => {
                copy_masked(&mut self.error_recovery, data, &[0, 0, 0xFF, 0xFF, 0, 0, 0, 0]);
                true
            }
            0x0D => {
                copy_masked(&mut self.cdrom, data, &[0, 0, 0, 0x0F, 0, 0xFF, 0xFF, 0xFF]);
                true
            }
            0x0E => {
                let mask = [
                    0u8, 0, 0x04, 0, 0, 0, 0, 0, 0x0F, 0xFF, 0x0F, 0xFF, 0x0F, 0xFF, 0x0F, 0xFF,
                ];
                copy_masked(&mut self.audio_control, data, &mask);
                true
            }
            // Capabilities are read-only; selecting them is invalid.
            _ => false,
        }
    }
}

fn copy_masked(page: &mut [u8], data: &[u8], mask: &[u8]) {
    for i in 0..page.len().min(data.len()).min(mask.len()) {
        page[i] = (page[i] & !mask[i]) | (data[i] & mask[i]);
    }
}

/// ATAPI-side state of one CD-ROM device.
pub struct AtapiState {
    pub(crate) packet: [u8; 12],
    pub(crate) packet_phase: PacketPhase,
    /// Host's per-DRQ byte count, latched when PACKET is issued.
    pub(crate) byte_count_limit: u16,
    /// Full response awaiting sub-block windowing.
    response: Vec<u8>,
    response_pos: usize,

    pub(crate) sense: [u8; 18],
    pub(crate) unit_attention: bool,
    pub(crate) media_changed: bool,
    pub(crate) prevent_removal: bool,
    /// Sense queued by a denied host eject, surfaced on the next command.
    pending_sense: Option<(u8, u8, u8)>,
    /// The host asked for the tray; the machine unmounts when it sees
    /// this.
    pub(crate) eject_requested: bool,

    pub loading: LoadingState,
    load_timer: NanoTimer,
    spindown_timer: NanoTimer,

    pub(crate) mode_pages: ModePages,
    pub audio: AudioPlayer,

    /// Track table captured at media-change time (at most 99 tracks).
    pub(crate) toc: Vec<TocEntry>,
    /// First frame past the user area.
    pub(crate) leadout: u32,
}

impl AtapiState {
    #[must_use]
    pub fn new() -> Self {
        Self {
            packet: [0; 12],
            packet_phase: PacketPhase::Idle,
            byte_count_limit: 0,
            response: Vec::new(),
            response_pos: 0,
            sense: [0; 18],
            unit_attention: false,
            media_changed: false,
            prevent_removal: false,
            pending_sense: None,
            eject_requested: false,
            loading: LoadingState::Idle,
            load_timer: NanoTimer::new(),
            spindown_timer: NanoTimer::new(),
            mode_pages: ModePages::new(),
            audio: AudioPlayer::new(),
            toc: Vec::new(),
            leadout: 0,
        }
    }

    fn fill_sense(&mut self, key: u8, asc: u8, ascq: u8) {
        self.sense = [0; 18];
        self.sense[0] = 0x70 | 0x80; // current error, valid
        self.sense[2] = key & 0x0F;
        self.sense[7] = 10; // additional length
        self.sense[12] = asc;
        self.sense[13] = ascq;
    }
}

impl Default for AtapiState {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------
// Channel entry points
// ---------------------------------------------------------------------

impl crate::AtaChannel {
    pub(crate) fn atapi_begin_packet(&mut self, index: usize) {
        begin_packet(&mut self.devices[index]);
    }

    pub(crate) fn atapi_data_in_done(&mut self, disks: &mut DiskRouter, index: usize) {
        let _ = disks;
        data_in_done(&mut self.devices[index]);
    }

    pub(crate) fn atapi_data_out_done(&mut self, disks: &mut DiskRouter, index: usize) {
        data_out_done(&mut self.devices[index], disks);
    }

    pub(crate) fn atapi_update(&mut self, disks: &mut DiskRouter, index: usize, dt: Nanos) {
        update(&mut self.devices[index], disks, dt);
    }

    pub(crate) fn atapi_media_changed(&mut self, disks: &mut DiskRouter, index: usize) {
        media_changed(&mut self.devices[index], disks);
    }

    pub(crate) fn atapi_host_eject(&mut self, disks: &mut DiskRouter, index: usize) -> bool {
        host_eject(&mut self.devices[index], disks)
    }

    /// Tray-open requests raised by START/STOP UNIT, for the machine to
    /// turn into unmounts.
    pub fn take_eject_requests(&mut self) -> Vec<DiskId> {
        let mut out = Vec::new();
        for device in &mut self.devices {
            if let (Some(atapi), Some(slot)) = (device.atapi.as_mut(), device.kind.slot()) {
                if atapi.eject_requested {
                    atapi.eject_requested = false;
                    out.push(slot);
                }
            }
        }
        out
    }

    /// Drain PCM samples produced by a device's audio player.
    pub fn take_pcm(&mut self, index: usize) -> Vec<i16> {
        self.devices[index]
            .atapi
            .as_mut()
            .map(|a| a.audio.take_pcm())
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------
// Packet plumbing
// ---------------------------------------------------------------------

fn begin_packet(device: &mut AtaDevice) {
    let Some(atapi) = device.atapi.as_mut() else {
        device.abort_command();
        return;
    };
    // Latch the host's byte-count window.
    let mut limit = u16::from(device.lba_mid) | (u16::from(device.lba_high) << 8);
    if limit == 0 || limit == 0xFFFF {
        limit = 0xFFFE;
    }
    atapi.byte_count_limit = limit;
    atapi.packet_phase = PacketPhase::Command;
    device.sector_count = 0x01; // C/nD = 1, I/O = 0
    device.buf_pos = 0;
    device.buf_len = 12;
    device.phase = DevicePhase::DataOut;
}

/// Completion with good status.
fn complete_ok(device: &mut AtaDevice) {
    if let Some(atapi) = device.atapi.as_mut() {
        atapi.packet_phase = PacketPhase::Idle;
        atapi.response.clear();
        atapi.response_pos = 0;
    }
    device.sector_count = 0x03; // command, to host
    device.status &= !STATUS_ERR;
    device.status |= STATUS_DSC;
    device.error = 0;
    device.phase = DevicePhase::Idle;
    device.irq_pending = true;
}

/// Completion with check condition: latch sense, set the key in the
/// error register's high nibble.
fn sense_error(device: &mut AtaDevice, key: u8, asc: u8, ascq: u8) {
    if let Some(atapi) = device.atapi.as_mut() {
        atapi.fill_sense(key, asc, ascq);
        atapi.packet_phase = PacketPhase::Result;
        atapi.response.clear();
    }
    device.sector_count = 0x03;
    device.error = (key << 4) | 0x04; // key + ABRT as the low nibble
    device.status |= STATUS_ERR | STATUS_DSC;
    device.phase = DevicePhase::Error;
    device.irq_pending = true;
}

/// Queue response data, serving the first sub-block.
fn send_data(device: &mut AtaDevice, data: Vec<u8>) {
    if data.is_empty() {
        complete_ok(device);
        return;
    }
    let Some(atapi) = device.atapi.as_mut() else {
        return;
    };
    atapi.response = data;
    atapi.response_pos = 0;
    atapi.packet_phase = PacketPhase::DataIn;
    serve_data_block(device);
}

fn serve_data_block(device: &mut AtaDevice) {
    let Some(atapi) = device.atapi.as_mut() else {
        return;
    };
    let remaining = atapi.response.len() - atapi.response_pos;
    let chunk = remaining.min(usize::from(atapi.byte_count_limit));
    let start = atapi.response_pos;
    device.buffer[..chunk].copy_from_slice(&atapi.response[start..start + chunk]);
    atapi.response_pos += chunk;
    device.buf_pos = 0;
    device.buf_len = chunk;
    device.lba_mid = chunk as u8;
    device.lba_high = (chunk >> 8) as u8;
    device.sector_count = 0x02; // data, to host
    device.phase = DevicePhase::DataIn;
    device.irq_pending = true;
}

fn data_in_done(device: &mut AtaDevice) {
    let more = device
        .atapi
        .as_ref()
        .is_some_and(|a| a.response_pos < a.response.len());
    if more {
        serve_data_block(device);
    } else {
        complete_ok(device);
    }
}

fn data_out_done(device: &mut AtaDevice, disks: &mut DiskRouter) {
    let phase = device.atapi.as_ref().map(|a| a.packet_phase);
    match phase {
        Some(PacketPhase::Command) => {
            let mut packet = [0u8; 12];
            packet.copy_from_slice(&device.buffer[..12]);
            if let Some(atapi) = device.atapi.as_mut() {
                atapi.packet = packet;
            }
            device.phase = DevicePhase::BusyWait;
            execute_packet(device, disks);
        }
        Some(PacketPhase::DataOut) => {
            // MODE SELECT parameter list arrived.
            let len = device.buf_len;
            let data = device.buffer[..len].to_vec();
            apply_mode_select(device, &data);
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------
// Media / loading state machine
// ---------------------------------------------------------------------

fn media_changed(device: &mut AtaDevice, disks: &mut DiskRouter) {
    let mounted = device
        .kind
        .slot()
        .is_some_and(|slot| disks.is_mounted(slot));
    refresh_toc(device, disks);
    let Some(atapi) = device.atapi.as_mut() else {
        return;
    };
    atapi.audio.stop();
    atapi.media_changed = true;
    atapi.unit_attention = true;
    if mounted {
        atapi.loading = LoadingState::InsertCd;
        atapi.load_timer.arm(INSERT_NS);
    } else {
        atapi.loading = LoadingState::NoDisc;
        atapi.load_timer.disarm();
        atapi.spindown_timer.disarm();
    }
}

/// The host's eject button. A locked tray refuses and leaves sense for
/// the next command.
fn host_eject(device: &mut AtaDevice, _disks: &mut DiskRouter) -> bool {
    let Some(atapi) = device.atapi.as_mut() else {
        return true;
    };
    if atapi.prevent_removal {
        atapi.pending_sense = Some((SENSE_NOT_READY, ASC_MEDIUM_REMOVAL_PREVENTED, 0));
        return false;
    }
    atapi.audio.stop();
    atapi.loading = LoadingState::Ejecting;
    atapi.load_timer.arm(EJECT_NS);
    true
}

fn update(device: &mut AtaDevice, disks: &mut DiskRouter, dt: Nanos) {
    // Loading transitions.
    {
        let Some(atapi) = device.atapi.as_mut() else {
            return;
        };
        atapi.load_timer.advance(dt);
        while atapi.load_timer.fire() {
            atapi.load_timer.disarm();
            match atapi.loading {
                LoadingState::InsertCd => {
                    atapi.loading = LoadingState::DiscLoading;
                    atapi.load_timer.arm(SPINUP_NS);
                }
                LoadingState::DiscLoading => {
                    atapi.loading = LoadingState::DiscReadied;
                }
                LoadingState::Ejecting => {
                    atapi.loading = LoadingState::NoDisc;
                }
                LoadingState::Ready => {
                    // A commanded stop finished.
                    atapi.loading = LoadingState::SpinDown;
                    atapi.spindown_timer.disarm();
                }
                _ => {}
            }
        }
        if atapi.loading == LoadingState::DiscReadied {
            atapi.loading = LoadingState::Ready;
            atapi.spindown_timer.arm(SPINDOWN_AUTO_NS);
        }
        atapi.spindown_timer.advance(dt);
        while atapi.spindown_timer.fire() {
            atapi.spindown_timer.disarm();
            if atapi.loading == LoadingState::Ready && !atapi.audio.is_playing() {
                atapi.loading = LoadingState::SpinDown;
            }
        }
    }

    // Audio playback.
    let slot = device.kind.slot();
    if let (Some(atapi), Some(slot)) = (device.atapi.as_mut(), slot) {
        let leadout = atapi.leadout;
        let toc: Vec<TocEntry> = atapi.toc.clone();
        atapi.audio.tick(dt, |frame| {
            if frame >= leadout {
                return FrameFetch::OutOfRange;
            }
            // Crossing into a data track ends the user area.
            if let Some(entry) = toc.iter().find(|t| frame >= t.start && frame <= t.end) {
                if entry.class != TrackClass::Audio {
                    return FrameFetch::EndOfUserArea;
                }
            }
            match disks.cue(slot) {
                Some(sheet) => {
                    let mut buf = [0u8; 2352];
                    match sheet.read_sector_msf(Msf::from_lba(frame), &mut buf, 2352, 0, 0) {
                        Ok(SectorLookup::Data { class: TrackClass::Audio, .. }) => {
                            FrameFetch::Audio(Box::new(buf))
                        }
                        Ok(SectorLookup::Data { .. }) => FrameFetch::EndOfUserArea,
                        Ok(SectorLookup::Gap { .. }) => FrameFetch::Gap,
                        Ok(SectorLookup::OutOfRange) | Err(_) => FrameFetch::OutOfRange,
                    }
                }
                None => FrameFetch::OutOfRange,
            }
        });
    }
}

/// Rebuild the cached track table from the mounted medium.
fn refresh_toc(device: &mut AtaDevice, disks: &mut DiskRouter) {
    let Some(slot) = device.kind.slot() else {
        return;
    };
    let mut toc = Vec::new();
    let mut leadout = 0u32;
    match disks.codec(slot) {
        Codec::Cue => {
            if let Some(sheet) = disks.cue(slot) {
                for track in sheet.tracks().iter().take(99) {
                    toc.push(TocEntry {
                        number: track.number,
                        class: track.mode.class,
                        start: track.start_lba(),
                        end: track.end_lba(),
                        pregap: track.pregap,
                        postgap: track.postgap,
                    });
                }
                leadout = sheet.leadout_lba();
            }
        }
        Codec::Raw | Codec::Dynamic => {
            // A flat ISO is one data track.
            let frames = (disks.size(slot) / 2048) as u32;
            if frames != 0 {
                toc.push(TocEntry {
                    number: 1,
                    class: TrackClass::Mode1,
                    start: 0,
                    end: frames - 1,
                    pregap: 0,
                    postgap: 0,
                });
                leadout = frames;
            }
        }
        _ => {}
    }
    if let Some(atapi) = device.atapi.as_mut() {
        atapi.toc = toc;
        atapi.leadout = leadout;
    }
}

/// Gate a medium-touching command on the loading state and any pending
/// unit attention.
fn check_ready(device: &mut AtaDevice, allow_attention: bool) -> Result<(), (u8, u8, u8)> {
    let Some(atapi) = device.atapi.as_mut() else {
        return Err((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 1));
    };
    if let Some(pending) = atapi.pending_sense.take() {
        return Err(pending);
    }
    if !allow_attention && atapi.unit_attention {
        atapi.unit_attention = false;
        return Err((SENSE_UNIT_ATTENTION, ASC_MEDIUM_MAY_HAVE_CHANGED, 0));
    }
    match atapi.loading {
        LoadingState::Ready => {
            atapi.spindown_timer.arm(SPINDOWN_AUTO_NS);
            Ok(())
        }
        LoadingState::DiscReadied => {
            atapi.loading = LoadingState::Ready;
            atapi.spindown_timer.arm(SPINDOWN_AUTO_NS);
            Ok(())
        }
        LoadingState::SpinDown => {
            // Touching a stopped disc spins it back up.
            atapi.loading = LoadingState::DiscLoading;
            atapi.load_timer.arm(SPINUP_NS);
            Err((SENSE_NOT_READY, ASC_BECOMING_READY, 1))
        }
        LoadingState::InsertCd | LoadingState::DiscLoading => {
            Err((SENSE_NOT_READY, ASC_BECOMING_READY, 1))
        }
        LoadingState::Idle | LoadingState::NoDisc | LoadingState::Ejecting => {
            Err((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 1))
        }
    }
}

// ---------------------------------------------------------------------
// Command execution
// ---------------------------------------------------------------------

fn execute_packet(device: &mut AtaDevice, disks: &mut DiskRouter) {
    let packet = device.atapi.as_ref().map_or([0; 12], |a| a.packet);
    let opcode = packet[0];
    match opcode {
        TEST_UNIT_READY => match check_ready(device, false) {
            Ok(()) => complete_ok(device),
            Err((key, asc, ascq)) => sense_error(device, key, asc, ascq),
        },
        REQUEST_SENSE => {
            let alloc = usize::from(packet[4]).min(18);
            let Some(atapi) = device.atapi.as_mut() else {
                return;
            };
            let data = atapi.sense[..alloc.max(1)].to_vec();
            // Draining sense clears it and any unit attention.
            atapi.fill_sense(SENSE_NONE, 0, 0);
            atapi.sense[0] = 0x70;
            atapi.unit_attention = false;
            send_data(device, data);
        }
        INQUIRY => {
            let alloc = usize::from(packet[4]);
            let data = inquiry_block(&device.model);
            send_data(device, data[..alloc.min(data.len())].to_vec());
        }
        START_STOP_UNIT => cmd_start_stop(device, disks, &packet),
        PREVENT_ALLOW_REMOVAL => {
            if let Some(atapi) = device.atapi.as_mut() {
                atapi.prevent_removal = packet[4] & 1 != 0;
            }
            complete_ok(device);
        }
        READ_CAPACITY => match check_ready(device, false) {
            Ok(()) => {
                let leadout = device.atapi.as_ref().map_or(0, |a| a.leadout);
                let last = leadout.saturating_sub(1);
                let mut data = vec![0u8; 8];
                data[..4].copy_from_slice(&last.to_be_bytes());
                data[4..8].copy_from_slice(&2048u32.to_be_bytes());
                send_data(device, data);
            }
            Err((key, asc, ascq)) => sense_error(device, key, asc, ascq),
        },
        READ_10 | READ_12 => cmd_read(device, disks, &packet),
        READ_CD => cmd_read_cd(device, disks, &packet),
        READ_CD_MSF => cmd_read_cd_msf(device, disks, &packet),
        READ_HEADER => cmd_read_header(device, disks, &packet),
        READ_SUBCHANNEL => cmd_read_subchannel(device, &packet),
        READ_TOC => cmd_read_toc(device, &packet),
        SEEK_10 => match check_ready(device, false) {
            Ok(()) => {
                let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
                let leadout = device.atapi.as_ref().map_or(0, |a| a.leadout);
                if lba >= leadout {
                    sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0);
                } else {
                    complete_ok(device);
                }
            }
            Err((key, asc, ascq)) => sense_error(device, key, asc, ascq),
        },
        PLAY_AUDIO_10 => cmd_play_audio_10(device, &packet),
        PLAY_AUDIO_MSF => cmd_play_audio_msf(device, &packet),
        PAUSE_RESUME => {
            let Some(atapi) = device.atapi.as_mut() else {
                return;
            };
            if packet[8] & 1 != 0 {
                atapi.audio.resume();
            } else {
                atapi.audio.pause();
            }
            complete_ok(device);
        }
        STOP_PLAY_SCAN => {
            if let Some(atapi) = device.atapi.as_mut() {
                atapi.audio.stop();
            }
            complete_ok(device);
        }
        MODE_SENSE_10 => cmd_mode_sense(device, &packet),
        MODE_SELECT_10 => {
            let length = usize::from(u16::from_be_bytes([packet[7], packet[8]]));
            if length == 0 {
                complete_ok(device);
                return;
            }
            let Some(atapi) = device.atapi.as_mut() else {
                return;
            };
            atapi.packet_phase = PacketPhase::DataOut;
            device.buf_pos = 0;
            device.buf_len = length.min(device.buffer.len());
            device.lba_mid = device.buf_len as u8;
            device.lba_high = (device.buf_len >> 8) as u8;
            device.sector_count = 0x00; // data, from host
            device.phase = DevicePhase::DataOut;
            device.irq_pending = true;
        }
        MECHANISM_STATUS => {
            let mounted = matches!(
                device.atapi.as_ref().map(|a| a.loading),
                Some(LoadingState::Ready | LoadingState::DiscReadied | LoadingState::SpinDown)
            );
            let mut data = vec![0u8; 8];
            if device.atapi.as_ref().is_some_and(|a| a.audio.is_playing()) {
                data[1] = 0x20; // playing audio
            }
            if !mounted {
                data[1] |= 0x10; // door open / no disc in transport
            }
            send_data(device, data);
        }
        _ => sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_INVALID_COMMAND, 0),
    }
}

fn inquiry_block(model: &str) -> Vec<u8> {
    let mut data = vec![0u8; 36];
    data[0] = 0x05; // CD-ROM
    data[1] = 0x80; // removable
    data[2] = 0x00; // ANSI version
    data[3] = 0x21; // ATAPI-2 response format
    data[4] = 31; // additional length
    let mut vendor = model.split_whitespace();
    let vendor_name = vendor.next().unwrap_or("CDROM");
    let product: String = vendor.collect::<Vec<_>>().join(" ");
    for (i, b) in vendor_name.bytes().chain(std::iter::repeat(b' ')).take(8).enumerate() {
        data[8 + i] = b;
    }
    for (i, b) in product.bytes().chain(std::iter::repeat(b' ')).take(16).enumerate() {
        data[16 + i] = b;
    }
    for (i, b) in b"1.0 ".iter().enumerate() {
        data[32 + i] = *b;
    }
    data
}

fn cmd_start_stop(device: &mut AtaDevice, _disks: &mut DiskRouter, packet: &[u8; 12]) {
    let load_eject = packet[4] & 0x02 != 0;
    let start = packet[4] & 0x01 != 0;
    if load_eject && !start {
        // Open the tray.
        let Some(atapi) = device.atapi.as_mut() else {
            return;
        };
        if atapi.prevent_removal {
            sense_error(
                device,
                SENSE_ILLEGAL_REQUEST,
                ASC_MEDIUM_REMOVAL_PREVENTED,
                0x02,
            );
            return;
        }
        atapi.audio.stop();
        atapi.loading = LoadingState::Ejecting;
        atapi.load_timer.arm(EJECT_NS);
        atapi.eject_requested = true;
        complete_ok(device);
    } else if load_eject && start {
        // Close the tray / load the disc.
        let Some(atapi) = device.atapi.as_mut() else {
            return;
        };
        if atapi.loading == LoadingState::NoDisc {
            // Nothing to load; still a successful tray close.
            complete_ok(device);
            return;
        }
        atapi.loading = LoadingState::DiscLoading;
        atapi.load_timer.arm(SPINUP_NS);
        complete_ok(device);
    } else if start {
        let Some(atapi) = device.atapi.as_mut() else {
            return;
        };
        if atapi.loading == LoadingState::SpinDown {
            atapi.loading = LoadingState::DiscLoading;
            atapi.load_timer.arm(SPINUP_NS);
        }
        complete_ok(device);
    } else {
        // Stop the spindle after the commanded spin-down time.
        let Some(atapi) = device.atapi.as_mut() else {
            return;
        };
        atapi.audio.stop();
        if atapi.loading == LoadingState::Ready {
            atapi.load_timer.arm(SPINDOWN_COMMANDED_NS);
        }
        complete_ok(device);
    }
}

/// User-data reads (2048-byte view) shared by READ(10)/(12).
fn cmd_read(device: &mut AtaDevice, disks: &mut DiskRouter, packet: &[u8; 12]) {
    if let Err((key, asc, ascq)) = check_ready(device, false) {
        sense_error(device, key, asc, ascq);
        return;
    }
    let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
    let count = if packet[0] == READ_12 {
        u32::from_be_bytes([packet[6], packet[7], packet[8], packet[9]])
    } else {
        u32::from(u16::from_be_bytes([packet[7], packet[8]]))
    };
    if count == 0 {
        complete_ok(device);
        return;
    }
    let leadout = device.atapi.as_ref().map_or(0, |a| a.leadout);
    if lba + count > leadout {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0);
        return;
    }
    let mut data = vec![0u8; count as usize * 2048];
    for i in 0..count {
        let offset = i as usize * 2048;
        if let Err((key, asc, ascq)) =
            read_data_2048(device, disks, lba + i, &mut data[offset..offset + 2048])
        {
            sense_error(device, key, asc, ascq);
            return;
        }
    }
    send_data(device, data);
}

/// Extract the 2048-byte user area of one frame, whatever the stored
/// sector layout.
fn read_data_2048(
    device: &mut AtaDevice,
    disks: &mut DiskRouter,
    frame: u32,
    out: &mut [u8],
) -> Result<(), (u8, u8, u8)> {
    let Some(slot) = device.kind.slot() else {
        return Err((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 1));
    };
    match disks.codec(slot) {
        Codec::Cue => {
            let entry = device
                .atapi
                .as_ref()
                .and_then(|a| a.toc.iter().find(|t| frame >= t.start && frame <= t.end).copied());
            let Some(entry) = entry else {
                return Err((SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0));
            };
            if entry.class == TrackClass::Audio {
                return Err((SENSE_ILLEGAL_REQUEST, ASC_ILLEGAL_MODE_FOR_TRACK, 0));
            }
            let sector_size = disks
                .cue(slot)
                .and_then(|sheet| sheet.track(entry.number))
                .map_or(2048, |t| t.mode.sector_size);
            let mut raw = vec![0u8; usize::from(sector_size)];
            let lookup = disks
                .cue(slot)
                .ok_or((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 1))?
                .read_sector_msf(Msf::from_lba(frame), &mut raw, sector_size, 0, 0)
                .map_err(|_| (SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0))?;
            match lookup {
                SectorLookup::Data { .. } => {
                    let offset = match sector_size {
                        2048 => 0,
                        2352 => 16,
                        2336 => 8,
                        _ => return Err((SENSE_ILLEGAL_REQUEST, ASC_ILLEGAL_MODE_FOR_TRACK, 0)),
                    };
                    out.copy_from_slice(&raw[offset..offset + 2048]);
                    Ok(())
                }
                SectorLookup::Gap { .. } => {
                    out.fill(0);
                    Ok(())
                }
                SectorLookup::OutOfRange => {
                    Err((SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0))
                }
            }
        }
        Codec::Raw | Codec::Dynamic => {
            if disks.read(slot, out, u64::from(frame) * 2048) {
                Ok(())
            } else {
                Err((SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0))
            }
        }
        _ => Err((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 1)),
    }
}

/// Raw 2352-byte view of one frame, synthesising headers for cooked
/// media.
fn read_raw_2352(
    device: &mut AtaDevice,
    disks: &mut DiskRouter,
    frame: u32,
    out: &mut [u8],
) -> Result<(), (u8, u8, u8)> {
    let Some(slot) = device.kind.slot() else {
        return Err((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 1));
    };
    let entry = device
        .atapi
        .as_ref()
        .and_then(|a| a.toc.iter().find(|t| frame >= t.start && frame <= t.end).copied());
    let Some(entry) = entry else {
        return Err((SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0));
    };
    let stored = match disks.codec(slot) {
        Codec::Cue => disks
            .cue(slot)
            .and_then(|sheet| sheet.track(entry.number))
            .map_or(2048, |t| t.mode.sector_size),
        _ => 2048,
    };
    if stored == 2352 {
        let mut raw = [0u8; 2352];
        let sheet = disks
            .cue(slot)
            .ok_or((SENSE_NOT_READY, ASC_MEDIUM_NOT_PRESENT, 1))?;
        match sheet.read_sector_msf(Msf::from_lba(frame), &mut raw, 2352, 0, 0) {
            Ok(SectorLookup::Data { .. }) => {
                out.copy_from_slice(&raw);
                Ok(())
            }
            Ok(SectorLookup::Gap { .. }) => {
                out.fill(0);
                Ok(())
            }
            _ => Err((SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0)),
        }
    } else {
        // Cooked 2048-byte storage: synthesise sync + header + data.
        let mut user = [0u8; 2048];
        read_data_2048(device, disks, frame, &mut user)?;
        out.fill(0);
        out[1..11].fill(0xFF); // 00 FF*10 00 sync
        let msf = Msf::from_lba(frame + MSF_OFFSET);
        out[12] = bcd(msf.m);
        out[13] = bcd(msf.s);
        out[14] = bcd(msf.f);
        out[15] = 0x01; // mode 1
        out[16..16 + 2048].copy_from_slice(&user);
        Ok(())
    }
}

fn bcd(value: u8) -> u8 {
    ((value / 10) << 4) | (value % 10)
}

fn cmd_read_cd(device: &mut AtaDevice, disks: &mut DiskRouter, packet: &[u8; 12]) {
    if let Err((key, asc, ascq)) = check_ready(device, false) {
        sense_error(device, key, asc, ascq);
        return;
    }
    let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
    let count = u32::from_be_bytes([0, packet[6], packet[7], packet[8]]);
    let selection = packet[9];
    read_cd_common(device, disks, lba, count, selection);
}

fn cmd_read_cd_msf(device: &mut AtaDevice, disks: &mut DiskRouter, packet: &[u8; 12]) {
    if let Err((key, asc, ascq)) = check_ready(device, false) {
        sense_error(device, key, asc, ascq);
        return;
    }
    let start = Msf::new(packet[3], packet[4], packet[5]).to_lba();
    let end = Msf::new(packet[6], packet[7], packet[8]).to_lba();
    if end < start || start < MSF_OFFSET {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD, 0);
        return;
    }
    let lba = start - MSF_OFFSET;
    let count = end - start;
    read_cd_common(device, disks, lba, count, packet[9]);
}

fn read_cd_common(
    device: &mut AtaDevice,
    disks: &mut DiskRouter,
    lba: u32,
    count: u32,
    selection: u8,
) {
    if count == 0 {
        complete_ok(device);
        return;
    }
    let leadout = device.atapi.as_ref().map_or(0, |a| a.leadout);
    if lba + count > leadout {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0);
        return;
    }
    let frame_size: usize = match selection & 0xF8 {
        0x10 => 2048, // user data only
        0xF8 => 2352, // everything
        0x00 => {
            complete_ok(device); // no fields: a glorified seek
            return;
        }
        _ => {
            sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD, 0);
            return;
        }
    };
    let mut data = vec![0u8; count as usize * frame_size];
    for i in 0..count {
        let offset = i as usize * frame_size;
        let result = if frame_size == 2048 {
            read_data_2048(device, disks, lba + i, &mut data[offset..offset + 2048])
        } else {
            read_raw_2352(device, disks, lba + i, &mut data[offset..offset + 2352])
        };
        if let Err((key, asc, ascq)) = result {
            sense_error(device, key, asc, ascq);
            return;
        }
    }
    send_data(device, data);
}

fn cmd_read_header(device: &mut AtaDevice, disks: &mut DiskRouter, packet: &[u8; 12]) {
    if let Err((key, asc, ascq)) = check_ready(device, false) {
        sense_error(device, key, asc, ascq);
        return;
    }
    let _ = disks;
    let msf = packet[1] & 0x02 != 0;
    let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
    let entry = device
        .atapi
        .as_ref()
        .and_then(|a| a.toc.iter().find(|t| lba >= t.start && lba <= t.end).copied());
    let Some(entry) = entry else {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0);
        return;
    };
    let mut data = vec![0u8; 8];
    data[0] = match entry.class {
        TrackClass::Audio | TrackClass::Karaoke => 0,
        TrackClass::Mode1 => 1,
        TrackClass::ModeXa | TrackClass::ModeCdi => 2,
    };
    if msf {
        let address = Msf::from_lba(lba + MSF_OFFSET);
        data[5] = address.m;
        data[6] = address.s;
        data[7] = address.f;
    } else {
        data[4..8].copy_from_slice(&lba.to_be_bytes());
    }
    send_data(device, data);
}

fn cmd_read_subchannel(device: &mut AtaDevice, packet: &[u8; 12]) {
    let msf = packet[1] & 0x02 != 0;
    let want_q = packet[2] & 0x40 != 0;
    let alloc = usize::from(u16::from_be_bytes([packet[7], packet[8]]));

    let Some(atapi) = device.atapi.as_mut() else {
        return;
    };
    let status = atapi.audio.effective_status();
    let position = atapi.audio.position();
    let track = atapi.audio.track;
    let track_start = atapi
        .toc
        .iter()
        .find(|t| t.number == track)
        .map_or(0, |t| t.start);

    let mut data = vec![0u8; 16];
    data[1] = status;
    if want_q {
        data[3] = 12; // subchannel data length
        data[4] = 0x01; // current position format
        data[5] = if atapi
            .toc
            .iter()
            .find(|t| t.number == track)
            .is_some_and(|t| t.class == TrackClass::Audio)
        {
            0x10
        } else {
            0x14
        };
        data[6] = track.max(1);
        data[7] = 1; // index
        if msf {
            let absolute = Msf::from_lba(position + MSF_OFFSET);
            data[9] = absolute.m;
            data[10] = absolute.s;
            data[11] = absolute.f;
            let relative = Msf::from_lba(position.saturating_sub(track_start));
            data[13] = relative.m;
            data[14] = relative.s;
            data[15] = relative.f;
        } else {
            data[8..12].copy_from_slice(&position.to_be_bytes());
            data[12..16].copy_from_slice(&position.saturating_sub(track_start).to_be_bytes());
        }
    } else {
        data.truncate(4);
    }
    let len = data.len().min(alloc.max(4));
    send_data(device, data[..len].to_vec());
}

fn cmd_read_toc(device: &mut AtaDevice, packet: &[u8; 12]) {
    if let Err((key, asc, ascq)) = check_ready(device, false) {
        sense_error(device, key, asc, ascq);
        return;
    }
    let msf = packet[1] & 0x02 != 0;
    // New-style format field, with the old high-bits fallback.
    let format = if packet[2] & 0x0F != 0 {
        packet[2] & 0x0F
    } else {
        packet[9] >> 6
    };
    let start_track = packet[6];
    let alloc = usize::from(u16::from_be_bytes([packet[7], packet[8]]));

    let Some(atapi) = device.atapi.as_ref() else {
        return;
    };
    let toc = &atapi.toc;
    let leadout = atapi.leadout;
    let first = toc.first().map_or(1, |t| t.number);
    let last = toc.last().map_or(1, |t| t.number);

    let address = |frame: u32, out: &mut Vec<u8>| {
        if msf {
            let position = Msf::from_lba(frame + MSF_OFFSET);
            out.extend_from_slice(&[0, position.m, position.s, position.f]);
        } else {
            out.extend_from_slice(&frame.to_be_bytes());
        }
    };

    let mut data = Vec::new();
    match format {
        0 => {
            data.extend_from_slice(&[0, 0, first, last]);
            for entry in toc {
                if entry.number < start_track {
                    continue;
                }
                let control = if entry.class == TrackClass::Audio { 0x10 } else { 0x14 };
                data.extend_from_slice(&[0, control, entry.number, 0]);
                address(entry.start, &mut data);
            }
            // Lead-out descriptor.
            data.extend_from_slice(&[0, 0x14, 0xAA, 0]);
            address(leadout, &mut data);
        }
        1 => {
            // Session info: one session, its first track.
            data.extend_from_slice(&[0, 0, 1, 1]);
            let entry = toc.first();
            let control = entry.map_or(0x14, |t| {
                if t.class == TrackClass::Audio { 0x10 } else { 0x14 }
            });
            data.extend_from_slice(&[0, control, first, 0]);
            address(entry.map_or(0, |t| t.start), &mut data);
        }
        2 => {
            // Raw Q: session markers plus one entry per track.
            data.extend_from_slice(&[0, 0, 1, 1]);
            for entry in toc {
                let control = if entry.class == TrackClass::Audio { 0x10 } else { 0x14 };
                data.extend_from_slice(&[1, control, 0, entry.number, 0, 0, 0]);
                let position = Msf::from_lba(entry.start + MSF_OFFSET);
                data.extend_from_slice(&[0, position.m, position.s, position.f]);
            }
        }
        _ => {
            sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD, 0);
            return;
        }
    }
    let total = data.len() as u16 - 2;
    data[0] = (total >> 8) as u8;
    data[1] = total as u8;
    let len = data.len().min(alloc.max(4));
    send_data(device, data[..len].to_vec());
}

fn cmd_play_audio_10(device: &mut AtaDevice, packet: &[u8; 12]) {
    if let Err((key, asc, ascq)) = check_ready(device, false) {
        sense_error(device, key, asc, ascq);
        return;
    }
    let lba = u32::from_be_bytes([packet[2], packet[3], packet[4], packet[5]]);
    let length = u32::from(u16::from_be_bytes([packet[7], packet[8]]));
    let start = if lba == 0xFFFF_FFFF {
        // The current-position token.
        device.atapi.as_ref().map_or(0, |a| a.audio.position())
    } else {
        lba
    };
    start_audio(device, start, start + length);
}

fn cmd_play_audio_msf(device: &mut AtaDevice, packet: &[u8; 12]) {
    if let Err((key, asc, ascq)) = check_ready(device, false) {
        sense_error(device, key, asc, ascq);
        return;
    }
    let start = if packet[3] == 0xFF && packet[4] == 0xFF && packet[5] == 0xFF {
        device.atapi.as_ref().map_or(0, |a| a.audio.position())
    } else {
        Msf::new(packet[3], packet[4], packet[5])
            .to_lba()
            .saturating_sub(MSF_OFFSET)
    };
    let end = Msf::new(packet[6], packet[7], packet[8])
        .to_lba()
        .saturating_sub(MSF_OFFSET);
    if end < start {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD, 0);
        return;
    }
    start_audio(device, start, end);
}

fn start_audio(device: &mut AtaDevice, start: u32, end: u32) {
    let entry = device
        .atapi
        .as_ref()
        .and_then(|a| a.toc.iter().find(|t| start >= t.start && start <= t.end).copied());
    let Some(entry) = entry else {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_LBA_OUT_OF_RANGE, 0);
        return;
    };
    if entry.class != TrackClass::Audio {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_ILLEGAL_MODE_FOR_TRACK, 0);
        return;
    }
    if let Some(atapi) = device.atapi.as_mut() {
        atapi.audio.play(start, end, entry.number);
    }
    complete_ok(device);
}

fn cmd_mode_sense(device: &mut AtaDevice, packet: &[u8; 12]) {
    let page_code = packet[2] & 0x3F;
    let alloc = usize::from(u16::from_be_bytes([packet[7], packet[8]]));
    let Some(atapi) = device.atapi.as_ref() else {
        return;
    };
    let mut pages = Vec::new();
    if page_code == 0x3F {
        for code in [0x01u8, 0x0D, 0x0E, 0x2A] {
            if let Some(page) = atapi.mode_pages.page(code) {
                pages.extend_from_slice(page);
            }
        }
    } else if let Some(page) = atapi.mode_pages.page(page_code) {
        pages.extend_from_slice(page);
    } else {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD, 0);
        return;
    }
    // 8-byte mode parameter header.
    let mut data = vec![0u8; 8];
    let length = (pages.len() + 6) as u16;
    data[0] = (length >> 8) as u8;
    data[1] = length as u8;
    data[2] = 0x01; // medium type: 120 mm data CD
    data.extend_from_slice(&pages);
    let len = data.len().min(alloc.max(8));
    send_data(device, data[..len].to_vec());
}

fn apply_mode_select(device: &mut AtaDevice, data: &[u8]) {
    // Skip the 8-byte parameter header, then apply page by page.
    let mut offset = 8usize;
    let mut ok = true;
    while offset + 2 <= data.len() {
        let code = data[offset] & 0x3F;
        let length = usize::from(data[offset + 1]) + 2;
        let end = (offset + length).min(data.len());
        if let Some(atapi) = device.atapi.as_mut() {
            ok &= atapi.mode_pages.select(code, &data[offset..end]);
        }
        offset = end;
        if length == 2 {
            break;
        }
    }
    if ok {
        complete_ok(device);
    } else {
        sense_error(device, SENSE_ILLEGAL_REQUEST, ASC_INVALID_FIELD, 0);
    }
}
