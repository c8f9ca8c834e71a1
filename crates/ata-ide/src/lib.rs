//! ATA-1 / ATAPI-4 IDE channel pair.
//!
//! Two channels of two devices each: hard disks speak plain ATA PIO,
//! CD-ROM drives layer the ATAPI packet protocol on top. Each device
//! owns its task-file shadow, a PIO buffer and its timers; the channel
//! arbitrates the shared register block and the interrupt line.
//!
//! Bus-master DMA is not modelled; every transfer is PIO through the
//! data register, which is how the compatibility-mode port map is
//! normally driven anyway.

pub mod atapi;
pub mod audio;
mod commands;
mod identify;
pub mod pci;

use disk_io::{DiskId, DiskRouter};
use emu_core::{NanoTimer, Nanos, Observable, Value};

pub const ATA_PRIMARY_IRQ: u8 = 14;
pub const ATA_SECONDARY_IRQ: u8 = 15;

// Status register bits.
pub const STATUS_ERR: u8 = 0x01;
pub const STATUS_IDX: u8 = 0x02;
pub const STATUS_CORR: u8 = 0x04;
pub const STATUS_DRQ: u8 = 0x08;
pub const STATUS_DSC: u8 = 0x10;
pub const STATUS_DWF: u8 = 0x20;
pub const STATUS_DRDY: u8 = 0x40;
pub const STATUS_BSY: u8 = 0x80;

// Error register bits.
pub const ERROR_AMNF: u8 = 0x01;
pub const ERROR_TK0NF: u8 = 0x02;
pub const ERROR_ABRT: u8 = 0x04;
pub const ERROR_MCR: u8 = 0x08;
pub const ERROR_IDNF: u8 = 0x10;
pub const ERROR_MC: u8 = 0x20;
pub const ERROR_UNC: u8 = 0x40;

/// Selecting the other device settles in 400 ns.
const DRIVE_SELECT_NS: Nanos = 400.0;
/// A command that finishes "immediately" still shows BSY for a moment.
pub(crate) const COMMAND_FINISH_NS: Nanos = 1_000.0;

/// What occupies a device right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevicePhase {
    /// Accepting commands.
    Idle,
    /// PIO data waiting for the host to read.
    DataIn,
    /// PIO buffer waiting for host writes.
    DataOut,
    /// Busy executing; completion rides on the device timer.
    BusyWait,
    /// Last command failed; status holds ERR until the next command.
    Error,
}

/// What the device timer completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum TimerEvent {
    #[default]
    None,
    /// Plain command completion: settle, raise IRQ.
    CommandDone,
    /// Software/device reset completing.
    ResetDone,
}

/// Which medium a device addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriveKind {
    None,
    Hdd(DiskId),
    Atapi(DiskId),
}

impl DriveKind {
    #[must_use]
    pub fn slot(self) -> Option<DiskId> {
        match self {
            DriveKind::None => None,
            DriveKind::Hdd(id) | DriveKind::Atapi(id) => Some(id),
        }
    }

    #[must_use]
    pub fn is_atapi(self) -> bool {
        matches!(self, DriveKind::Atapi(_))
    }
}

/// One ATA device.
pub struct AtaDevice {
    pub(crate) kind: DriveKind,

    // Task file shadow.
    pub(crate) features: u8,
    pub(crate) error: u8,
    pub(crate) sector_count: u8,
    pub(crate) lba_low: u8,
    pub(crate) lba_mid: u8,
    pub(crate) lba_high: u8,
    pub(crate) drive_head: u8,
    pub(crate) status: u8,
    pub(crate) command: u8,

    pub(crate) phase: DevicePhase,
    pub(crate) identify: [u16; 256],
    /// PIO transfer buffer.
    pub(crate) buffer: Vec<u8>,
    pub(crate) buf_pos: usize,
    pub(crate) buf_len: usize,

    // Multi-sector transfer bookkeeping.
    pub(crate) transfer_lba: u64,
    pub(crate) remaining_sectors: u32,
    pub(crate) block_sectors: u32,
    pub(crate) multiple: u8,
    pub(crate) enable_8bit: bool,
    pub(crate) reset_sets_defaults: bool,

    // Logical geometry (re-translatable by INITIALIZE DEVICE PARAMETERS).
    pub(crate) cylinders: u16,
    pub(crate) heads: u8,
    pub(crate) spt: u8,

    pub(crate) timer: NanoTimer,
    pub(crate) timer_event: TimerEvent,
    pub(crate) irq_pending: bool,

    pub(crate) model: String,
    pub(crate) atapi: Option<atapi::AtapiState>,
}

impl AtaDevice {
    fn new(kind: DriveKind, model: String) -> Self {
        let atapi = kind.is_atapi().then(atapi::AtapiState::new);
        Self {
            kind,
            features: 0,
            error: 0,
            sector_count: 0,
            lba_low: 0,
            lba_mid: 0,
            lba_high: 0,
            drive_head: 0,
            status: 0,
            command: 0,
            phase: DevicePhase::Idle,
            identify: [0; 256],
            buffer: vec![0; 0x20000],
            buf_pos: 0,
            buf_len: 0,
            transfer_lba: 0,
            remaining_sectors: 0,
            block_sectors: 1,
            multiple: 0,
            enable_8bit: false,
            reset_sets_defaults: true,
            cylinders: 0,
            heads: 0,
            spt: 0,
            timer: NanoTimer::new(),
            timer_event: TimerEvent::None,
            irq_pending: false,
            model,
            atapi,
        }
    }

    #[must_use]
    pub fn kind(&self) -> DriveKind {
        self.kind
    }

    /// Current logical geometry (cylinders, heads, sectors per track).
    #[must_use]
    pub fn geometry(&self) -> (u16, u8, u8) {
        (self.cylinders, self.heads, self.spt)
    }

    /// Present the reset signature and defaults.
    pub(crate) fn apply_reset_signature(&mut self) {
        self.error = 0x01; // diagnostics passed
        self.sector_count = 1;
        self.lba_low = 1;
        if self.kind.is_atapi() {
            self.lba_mid = 0x14;
            self.lba_high = 0xEB;
        } else {
            self.lba_mid = 0;
            self.lba_high = 0;
        }
        self.phase = DevicePhase::Idle;
        self.buf_pos = 0;
        self.buf_len = 0;
        self.remaining_sectors = 0;
        self.irq_pending = false;
        self.timer.disarm();
        self.timer_event = TimerEvent::None;
        if self.reset_sets_defaults {
            self.multiple = 0;
            self.enable_8bit = false;
        }
        if let Some(atapi) = &mut self.atapi {
            atapi.packet_phase = atapi::PacketPhase::Idle;
        }
    }

    /// Current status byte, derived from phase and timers.
    #[must_use]
    pub(crate) fn status_byte(&self) -> u8 {
        if self.kind == DriveKind::None {
            return 0;
        }
        let mut status = self.status & (STATUS_ERR | STATUS_DSC | STATUS_DWF | STATUS_CORR);
        if self.timer.is_armed() || self.phase == DevicePhase::BusyWait {
            status |= STATUS_BSY;
            // BSY and DRQ are mutually exclusive.
            return status & !(STATUS_DRQ | STATUS_DRDY);
        }
        match self.phase {
            DevicePhase::DataIn | DevicePhase::DataOut => {
                status |= STATUS_DRQ | STATUS_DRDY;
            }
            DevicePhase::Idle => {
                status |= STATUS_DRDY | STATUS_DSC;
            }
            DevicePhase::Error => {
                status |= STATUS_DRDY | STATUS_ERR;
            }
            DevicePhase::BusyWait => {}
        }
        status
    }

    /// LBA from the task file (LBA mode or CHS translation).
    #[must_use]
    pub(crate) fn task_lba(&self) -> u64 {
        if self.drive_head & 0x40 != 0 {
            (u64::from(self.drive_head & 0x0F) << 24)
                | (u64::from(self.lba_high) << 16)
                | (u64::from(self.lba_mid) << 8)
                | u64::from(self.lba_low)
        } else {
            let cylinder = (u64::from(self.lba_high) << 8) | u64::from(self.lba_mid);
            let head = u64::from(self.drive_head & 0x0F);
            let sector = u64::from(self.lba_low);
            (cylinder * u64::from(self.heads.max(1)) + head) * u64::from(self.spt.max(1))
                + sector.saturating_sub(1)
        }
    }

    /// Store an LBA back into the task file, honouring the address mode.
    pub(crate) fn set_task_lba(&mut self, lba: u64) {
        if self.drive_head & 0x40 != 0 {
            self.lba_low = lba as u8;
            self.lba_mid = (lba >> 8) as u8;
            self.lba_high = (lba >> 16) as u8;
            self.drive_head = (self.drive_head & 0xF0) | ((lba >> 24) as u8 & 0x0F);
        } else {
            let spt = u64::from(self.spt.max(1));
            let heads = u64::from(self.heads.max(1));
            self.lba_low = (lba % spt + 1) as u8;
            let track = lba / spt;
            self.drive_head = (self.drive_head & 0xF0) | ((track % heads) as u8 & 0x0F);
            let cylinder = track / heads;
            self.lba_mid = cylinder as u8;
            self.lba_high = (cylinder >> 8) as u8;
        }
    }

    /// Total sectors of the mounted medium.
    pub(crate) fn total_sectors(&self, disks: &DiskRouter) -> u64 {
        match self.kind {
            DriveKind::Hdd(slot) => disks.size(slot) / 512,
            DriveKind::Atapi(_) | DriveKind::None => 0,
        }
    }

    pub(crate) fn abort_command(&mut self) {
        self.error = ERROR_ABRT;
        self.status |= STATUS_ERR;
        self.phase = DevicePhase::Error;
        self.buf_pos = 0;
        self.buf_len = 0;
        self.irq_pending = true;
    }

    pub(crate) fn finish_ok(&mut self) {
        self.status &= !STATUS_ERR;
        self.error = 0;
        self.status |= STATUS_DSC;
        self.phase = DevicePhase::Idle;
        self.irq_pending = true;
    }
}

/// One IDE channel: shared register block, two devices.
pub struct AtaChannel {
    index: u8,
    pub(crate) devices: [AtaDevice; 2],
    pub(crate) selected: usize,
    /// Device control: bit 1 nIEN, bit 2 SRST.
    pub(crate) device_control: u8,
    drive_select_timer: NanoTimer,
}

impl AtaChannel {
    /// Build a channel. Device models default to the classic strings
    /// the host BIOS expects; the machine may override them.
    #[must_use]
    pub fn new(index: u8, kinds: [DriveKind; 2], models: [Option<String>; 2]) -> Self {
        let model_for = |position: u8, kind: DriveKind, name: Option<String>| {
            name.unwrap_or_else(|| match kind {
                DriveKind::Atapi(_) => format!("UniPCemu CD-ROM{}", index * 2 + position),
                _ => format!("UniPCemu HDD{}", index * 2 + position),
            })
        };
        let [model0, model1] = models;
        let mut devices = [
            AtaDevice::new(kinds[0], model_for(0, kinds[0], model0)),
            AtaDevice::new(kinds[1], model_for(1, kinds[1], model1)),
        ];
        for device in &mut devices {
            device.apply_reset_signature();
        }
        Self {
            index,
            devices,
            selected: 0,
            device_control: 0,
            drive_select_timer: NanoTimer::new(),
        }
    }

    #[must_use]
    pub fn irq_line(&self) -> u8 {
        if self.index == 0 { ATA_PRIMARY_IRQ } else { ATA_SECONDARY_IRQ }
    }

    #[must_use]
    pub fn device(&self, index: usize) -> &AtaDevice {
        &self.devices[index & 1]
    }

    pub fn device_mut(&mut self, index: usize) -> &mut AtaDevice {
        &mut self.devices[index & 1]
    }

    fn selected_device(&mut self) -> &mut AtaDevice {
        &mut self.devices[self.selected]
    }

    /// Level of the channel INTRQ output.
    #[must_use]
    pub fn irq_level(&self) -> bool {
        if self.device_control & 0x02 != 0 {
            return false; // nIEN masks the line
        }
        self.devices[self.selected].irq_pending
    }

    /// Initialise both devices' identify blocks and geometry from the
    /// mounted media.
    pub fn attach_media(&mut self, disks: &DiskRouter) {
        for device in &mut self.devices {
            match device.kind {
                DriveKind::Hdd(slot) => {
                    let (c, h, s) = disks.geometry(slot).unwrap_or((0, 16, 63));
                    device.cylinders = c;
                    device.heads = h as u8;
                    device.spt = s as u8;
                    let total = disks.size(slot) / 512;
                    device.identify =
                        identify::identify_hdd(&device.model, c, h as u8, s as u8, total);
                }
                DriveKind::Atapi(_) => {
                    device.identify = identify::identify_packet_device(&device.model);
                }
                DriveKind::None => {}
            }
        }
    }

    // -------------------------------------------------------------------
    // Command block registers (1F0–1F7 / 170–177)
    // -------------------------------------------------------------------

    /// 16-bit read of the data register.
    pub fn read_data16(&mut self, disks: &mut DiskRouter) -> u16 {
        let low = self.read_data8(disks);
        let high = if self.devices[self.selected].enable_8bit {
            0
        } else {
            self.read_data8(disks)
        };
        u16::from(low) | (u16::from(high) << 8)
    }

    /// 16-bit write to the data register.
    pub fn write_data16(&mut self, disks: &mut DiskRouter, value: u16) {
        self.write_data8(disks, value as u8);
        if !self.devices[self.selected].enable_8bit {
            self.write_data8(disks, (value >> 8) as u8);
        }
    }

    fn read_data8(&mut self, disks: &mut DiskRouter) -> u8 {
        let selected = self.selected;
        let device = &mut self.devices[selected];
        if device.phase != DevicePhase::DataIn || device.buf_pos >= device.buf_len {
            return 0;
        }
        let value = device.buffer[device.buf_pos];
        device.buf_pos += 1;
        if device.buf_pos >= device.buf_len {
            self.data_in_block_done(disks);
        }
        value
    }

    fn write_data8(&mut self, disks: &mut DiskRouter, value: u8) {
        let selected = self.selected;
        let device = &mut self.devices[selected];
        if device.phase != DevicePhase::DataOut || device.buf_pos >= device.buf_len {
            return;
        }
        device.buffer[device.buf_pos] = value;
        device.buf_pos += 1;
        if device.buf_pos >= device.buf_len {
            self.data_out_block_done(disks);
        }
    }

    /// Read a command block register.
    pub fn read_register(&mut self, disks: &mut DiskRouter, reg: u8) -> u8 {
        match reg & 7 {
            0 => self.read_data16(disks) as u8,
            1 => self.devices[self.selected].error,
            2 => self.devices[self.selected].sector_count,
            3 => self.devices[self.selected].lba_low,
            4 => self.devices[self.selected].lba_mid,
            5 => self.devices[self.selected].lba_high,
            6 => self.devices[self.selected].drive_head,
            _ => {
                // Reading status acknowledges the interrupt.
                let device = &mut self.devices[self.selected];
                device.irq_pending = false;
                device.status_byte()
            }
        }
    }

    /// Write a command block register.
    pub fn write_register(&mut self, disks: &mut DiskRouter, reg: u8, value: u8) {
        match reg & 7 {
            0 => self.write_data16(disks, u16::from(value)),
            1 => self.selected_device().features = value,
            2 => self.selected_device().sector_count = value,
            3 => self.selected_device().lba_low = value,
            4 => self.selected_device().lba_mid = value,
            5 => self.selected_device().lba_high = value,
            6 => {
                let target = usize::from(value >> 4) & 1;
                if target != self.selected {
                    self.drive_select_timer.arm(DRIVE_SELECT_NS);
                }
                self.selected = target;
                self.devices[target].drive_head = value;
            }
            _ => self.issue_command(disks, value),
        }
    }

    // -------------------------------------------------------------------
    // Control block registers (3F6–3F7 / 376–377)
    // -------------------------------------------------------------------

    /// Alternate status: no interrupt acknowledge side effect.
    #[must_use]
    pub fn read_alt_status(&self) -> u8 {
        self.devices[self.selected].status_byte()
    }

    /// Drive address register: inverted select/head lines.
    #[must_use]
    pub fn read_drive_address(&self) -> u8 {
        let head = self.devices[self.selected].drive_head & 0x0F;
        let select = if self.selected == 0 { 0x01 } else { 0x02 };
        !(select | (head << 2)) & 0x7F
    }

    /// Device control: nIEN and soft reset.
    pub fn write_device_control(&mut self, value: u8) {
        let was_reset = self.device_control & 0x04 != 0;
        self.device_control = value;
        if value & 0x04 != 0 && !was_reset {
            // SRST resets both devices on the channel.
            for device in &mut self.devices {
                if device.kind != DriveKind::None {
                    device.timer.arm(COMMAND_FINISH_NS);
                    device.timer_event = TimerEvent::ResetDone;
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------

    pub fn update(&mut self, disks: &mut DiskRouter, dt: Nanos) {
        self.drive_select_timer.advance(dt);
        while self.drive_select_timer.fire() {
            self.drive_select_timer.disarm();
        }
        for index in 0..2 {
            self.devices[index].timer.advance(dt);
            while self.devices[index].timer.fire() {
                let event = self.devices[index].timer_event;
                self.devices[index].timer.disarm();
                self.devices[index].timer_event = TimerEvent::None;
                match event {
                    TimerEvent::None => {}
                    TimerEvent::CommandDone => {
                        self.devices[index].finish_ok();
                    }
                    TimerEvent::ResetDone => {
                        self.devices[index].apply_reset_signature();
                    }
                }
            }
            if self.devices[index].kind.is_atapi() {
                self.atapi_update(disks, index, dt);
            }
        }
    }

    /// Media change notification from the router.
    pub fn notify_disk_changed(&mut self, disks: &mut DiskRouter, id: DiskId) {
        for index in 0..2 {
            if self.devices[index].kind.slot() == Some(id) {
                if self.devices[index].kind.is_atapi() {
                    self.atapi_media_changed(disks, index);
                } else {
                    self.attach_media(disks);
                }
            }
        }
    }

    /// Host pressed the eject button for a slot owned by this channel.
    /// Returns false when the device refused (medium removal prevented).
    pub fn host_eject(&mut self, disks: &mut DiskRouter, id: DiskId) -> bool {
        for index in 0..2 {
            if self.devices[index].kind.slot() == Some(id) && self.devices[index].kind.is_atapi() {
                return self.atapi_host_eject(disks, index);
            }
        }
        true
    }
}

impl Observable for AtaChannel {
    fn query(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("device") {
            let (index, field) = rest.split_once('.')?;
            let device = self.devices.get(index.parse::<usize>().ok()?)?;
            return match field {
                "status" => Some(device.status_byte().into()),
                "error" => Some(device.error.into()),
                "sector_count" => Some(device.sector_count.into()),
                "command" => Some(device.command.into()),
                "atapi.loading" => device
                    .atapi
                    .as_ref()
                    .map(|a| Value::String(format!("{:?}", a.loading))),
                "atapi.audio_status" => device
                    .atapi
                    .as_ref()
                    .map(|a| a.audio.effective_status_peek().into()),
                _ => None,
            };
        }
        match path {
            "selected" => Some((self.selected as u8).into()),
            "device_control" => Some(self.device_control.into()),
            "irq" => Some(self.irq_level().into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "selected",
            "device_control",
            "irq",
            "device<n>.status",
            "device<n>.error",
            "device<n>.sector_count",
            "device<n>.command",
            "device<n>.atapi.loading",
            "device<n>.atapi.audio_status",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::atapi::LoadingState;
    use super::*;

    fn hdd_router(sectors: u64) -> (tempfile::TempDir, DiskRouter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("hdd.img");
        let mut image = vec![0u8; (sectors * 512) as usize];
        for (lba, sector) in image.chunks_mut(512).enumerate() {
            sector[0] = (lba & 0xFF) as u8;
            sector[1] = ((lba >> 8) & 0xFF) as u8;
        }
        std::fs::write(&path, &image).expect("image");
        let mut router = DiskRouter::new(dir.path().to_path_buf());
        assert!(router.mount(DiskId::Hdd0, "hdd.img", 0, false, 0));
        router.drain_changes();
        (dir, router)
    }

    fn hdd_channel(disks: &DiskRouter) -> AtaChannel {
        let mut channel = AtaChannel::new(
            0,
            [DriveKind::Hdd(DiskId::Hdd0), DriveKind::None],
            [None, None],
        );
        channel.attach_media(disks);
        channel
    }

    /// A mixed-mode CD: one 2048-byte data track, one audio track with
    /// a two-second pregap.
    fn cd_router() -> (tempfile::TempDir, DiskRouter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let bin = dir.path().join("disc.bin");
        let mut image = Vec::new();
        for sector in 0u32..64 {
            let mut block = vec![0u8; 2048];
            block[0] = sector as u8;
            image.extend_from_slice(&block);
        }
        for frame in 0u32..300 {
            image.extend_from_slice(&vec![(frame & 0x7F) as u8 | 1; 2352]);
        }
        std::fs::write(&bin, &image).expect("bin");
        std::fs::write(
            dir.path().join("disc.cue"),
            "FILE \"disc.bin\" BINARY\n\
             TRACK 01 MODE1/2048\n\
             INDEX 01 00:00:00\n\
             TRACK 02 AUDIO\n\
             PREGAP 00:02:00\n\
             INDEX 01 00:00:64\n",
        )
        .expect("cue");
        let mut router = DiskRouter::new(dir.path().to_path_buf());
        assert!(router.mount(DiskId::Cdrom0, "disc.cue", 0, true, 0));
        router.drain_changes();
        (dir, router)
    }

    fn cd_channel(disks: &mut DiskRouter, with_media: bool) -> AtaChannel {
        let mut channel = AtaChannel::new(
            0,
            [DriveKind::Atapi(DiskId::Cdrom0), DriveKind::None],
            [None, None],
        );
        channel.attach_media(disks);
        if with_media {
            channel.notify_disk_changed(disks, DiskId::Cdrom0);
            // Tray close, then spin-up.
            channel.update(disks, 1_100_000_000.0);
            channel.update(disks, 1_100_000_000.0);
            // Swallow the pending unit attention.
            send_packet(&mut channel, disks, [0x00; 12]);
            let _ = channel.read_register(disks, 7);
        }
        channel
    }

    fn send_packet(channel: &mut AtaChannel, disks: &mut DiskRouter, cdb: [u8; 12]) {
        channel.write_register(disks, 4, 0xFE);
        channel.write_register(disks, 5, 0xFF);
        channel.write_register(disks, 7, 0xA0);
        assert_eq!(
            channel.read_alt_status() & STATUS_DRQ,
            STATUS_DRQ,
            "packet phase wants the CDB"
        );
        for pair in cdb.chunks(2) {
            channel.write_data16(disks, u16::from(pair[0]) | (u16::from(pair[1]) << 8));
        }
    }

    fn read_response(channel: &mut AtaChannel, disks: &mut DiskRouter) -> Vec<u8> {
        let mut out = Vec::new();
        while channel.read_alt_status() & STATUS_DRQ != 0 {
            let count = usize::from(channel.device(0).lba_mid)
                | (usize::from(channel.device(0).lba_high) << 8);
            for _ in 0..count.div_ceil(2) {
                let word = channel.read_data16(disks);
                out.push(word as u8);
                out.push((word >> 8) as u8);
            }
        }
        out
    }

    #[test]
    fn identify_returns_model_string() {
        let (_dir, mut disks) = hdd_router(1008);
        let mut channel = hdd_channel(&disks);
        channel.write_register(&mut disks, 7, 0xEC);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & (STATUS_DRQ | STATUS_DRDY), STATUS_DRQ | STATUS_DRDY);
        let mut words = [0u16; 256];
        for word in &mut words {
            *word = channel.read_data16(&mut disks);
        }
        let mut model = String::new();
        for word in &words[27..47] {
            model.push((word >> 8) as u8 as char);
            model.push(*word as u8 as char);
        }
        assert_eq!(model.trim_end(), "UniPCemu HDD0");
        let total = u32::from(words[60]) | (u32::from(words[61]) << 16);
        assert_eq!(total, 1008);
    }

    #[test]
    fn read_sectors_pio_delivers_data() {
        let (_dir, mut disks) = hdd_router(1008);
        let mut channel = hdd_channel(&disks);
        // LBA mode, LBA 2, two sectors.
        channel.write_register(&mut disks, 6, 0xE0);
        channel.write_register(&mut disks, 2, 2);
        channel.write_register(&mut disks, 3, 2);
        channel.write_register(&mut disks, 4, 0);
        channel.write_register(&mut disks, 5, 0);
        channel.write_register(&mut disks, 7, 0x20);
        assert!(channel.irq_level(), "data ready interrupt");

        let mut data = Vec::new();
        for _ in 0..512 {
            let word = channel.read_data16(&mut disks);
            data.push(word as u8);
            data.push((word >> 8) as u8);
        }
        assert_eq!(data[0], 2, "first sector is LBA 2");
        assert_eq!(data[512], 3, "second sector follows");
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_DRQ, 0, "transfer complete");
        assert_eq!(channel.device(0).sector_count, 0);
    }

    #[test]
    fn write_then_read_round_trips() {
        let (_dir, mut disks) = hdd_router(1008);
        let mut channel = hdd_channel(&disks);
        channel.write_register(&mut disks, 6, 0xE0);
        channel.write_register(&mut disks, 2, 1);
        channel.write_register(&mut disks, 3, 5);
        channel.write_register(&mut disks, 7, 0x30);
        // First DRQ block arrives without an interrupt.
        assert!(!channel.irq_level());
        assert_eq!(channel.read_alt_status() & STATUS_DRQ, STATUS_DRQ);
        for i in 0..256u16 {
            channel.write_data16(&mut disks, 0x4100 | i);
        }
        assert!(channel.irq_level(), "completion interrupt");

        channel.write_register(&mut disks, 2, 1);
        channel.write_register(&mut disks, 3, 5);
        channel.write_register(&mut disks, 7, 0x20);
        let first = channel.read_data16(&mut disks);
        assert_eq!(first, 0x4100);
    }

    #[test]
    fn sector_count_zero_means_256() {
        let (_dir, mut disks) = hdd_router(1008);
        let mut channel = hdd_channel(&disks);
        channel.write_register(&mut disks, 6, 0xE0);
        channel.write_register(&mut disks, 2, 0);
        channel.write_register(&mut disks, 3, 0);
        channel.write_register(&mut disks, 7, 0x20);
        let mut sectors = 0u32;
        while channel.read_alt_status() & STATUS_DRQ != 0 {
            for _ in 0..256 {
                let _ = channel.read_data16(&mut disks);
            }
            sectors += 1;
        }
        assert_eq!(sectors, 256);
    }

    #[test]
    fn read_multiple_batches_blocks() {
        let (_dir, mut disks) = hdd_router(1008);
        let mut channel = hdd_channel(&disks);
        channel.write_register(&mut disks, 2, 4);
        channel.write_register(&mut disks, 7, 0xC6); // SET MULTIPLE = 4
        assert_eq!(channel.read_register(&mut disks, 7) & STATUS_ERR, 0);

        channel.write_register(&mut disks, 6, 0xE0);
        channel.write_register(&mut disks, 2, 8);
        channel.write_register(&mut disks, 3, 0);
        channel.write_register(&mut disks, 7, 0xC4); // READ MULTIPLE
        // 8 sectors in two 4-sector DRQ blocks.
        assert_eq!(channel.device(0).buf_len, 4 * 512);
        let mut blocks = 0;
        while channel.read_alt_status() & STATUS_DRQ != 0 {
            for _ in 0..(channel.device(0).buf_len / 2) {
                let _ = channel.read_data16(&mut disks);
            }
            blocks += 1;
        }
        assert_eq!(blocks, 2);
    }

    #[test]
    fn busy_excludes_drq_invariant() {
        let (_dir, mut disks) = hdd_router(1008);
        let mut channel = hdd_channel(&disks);
        channel.write_register(&mut disks, 7, 0x70); // SEEK: busy-wait
        let status = channel.read_alt_status();
        if status & STATUS_BSY != 0 {
            assert_eq!(status & STATUS_DRQ, 0, "BSY and DRQ are exclusive");
        }
        channel.update(&mut disks, 10_000.0);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & (STATUS_BSY | STATUS_DRDY), STATUS_DRDY);
    }

    #[test]
    fn out_of_range_lba_sets_idnf() {
        let (_dir, mut disks) = hdd_router(64);
        let mut channel = hdd_channel(&disks);
        channel.write_register(&mut disks, 6, 0xE0);
        channel.write_register(&mut disks, 2, 1);
        channel.write_register(&mut disks, 3, 200);
        channel.write_register(&mut disks, 7, 0x20);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_ERR, STATUS_ERR);
        assert_eq!(channel.read_register(&mut disks, 1) & ERROR_IDNF, ERROR_IDNF);
    }

    #[test]
    fn unknown_command_aborts() {
        let (_dir, mut disks) = hdd_router(64);
        let mut channel = hdd_channel(&disks);
        channel.write_register(&mut disks, 7, 0xF7);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & 0x41, 0x41, "DRDY | ERR");
        assert_eq!(channel.read_register(&mut disks, 1), ERROR_ABRT);
    }

    #[test]
    fn atapi_signature_after_reset() {
        let (_dir, mut disks) = cd_router();
        let channel = cd_channel(&mut disks, false);
        assert_eq!(channel.device(0).lba_mid, 0x14);
        assert_eq!(channel.device(0).lba_high, 0xEB);
    }

    #[test]
    fn read10_with_no_disc_reports_not_present() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut disks = DiskRouter::new(dir.path().to_path_buf());
        let mut channel = cd_channel(&mut disks, false);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x28; // READ(10), LBA 0, 1 sector
        cdb[8] = 1;
        send_packet(&mut channel, &mut disks, cdb);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status, 0x51, "CHECK CONDITION with DRDY|DSC");
        assert_eq!(channel.read_register(&mut disks, 1) >> 4, 2, "NOT READY");

        let mut sense_cdb = [0u8; 12];
        sense_cdb[0] = 0x03;
        sense_cdb[4] = 18;
        send_packet(&mut channel, &mut disks, sense_cdb);
        let sense = read_response(&mut channel, &mut disks);
        assert_eq!(sense[2] & 0x0F, 2, "sense key NOT READY");
        assert_eq!(sense[12], 0x3A, "medium not present");
        assert_eq!(sense[13], 1);
    }

    #[test]
    fn media_change_raises_unit_attention_once() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, false);
        channel.notify_disk_changed(&mut disks, DiskId::Cdrom0);
        channel.update(&mut disks, 1_100_000_000.0);
        channel.update(&mut disks, 1_100_000_000.0);

        send_packet(&mut channel, &mut disks, [0x00; 12]); // TEST UNIT READY
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_ERR, STATUS_ERR);
        assert_eq!(channel.read_register(&mut disks, 1) >> 4, 6, "UNIT ATTENTION");

        send_packet(&mut channel, &mut disks, [0x00; 12]);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_ERR, 0, "attention consumed");
    }

    #[test]
    fn read10_extracts_user_data() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, true);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x28;
        cdb[5] = 3; // LBA 3
        cdb[8] = 2; // two sectors
        send_packet(&mut channel, &mut disks, cdb);
        let data = read_response(&mut channel, &mut disks);
        assert_eq!(data.len(), 4096);
        assert_eq!(data[0], 3);
        assert_eq!(data[2048], 4);
    }

    #[test]
    fn read_capacity_matches_toc_leadout() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, true);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x25;
        send_packet(&mut channel, &mut disks, cdb);
        let capacity = read_response(&mut channel, &mut disks);
        let last = u32::from_be_bytes([capacity[0], capacity[1], capacity[2], capacity[3]]);
        let block = u32::from_be_bytes([capacity[4], capacity[5], capacity[6], capacity[7]]);
        assert_eq!(block, 2048);

        let mut toc_cdb = [0u8; 12];
        toc_cdb[0] = 0x43; // READ TOC, LBA format 0
        toc_cdb[7] = 0x03;
        toc_cdb[8] = 0xFF;
        send_packet(&mut channel, &mut disks, toc_cdb);
        let toc = read_response(&mut channel, &mut disks);
        assert_eq!(toc[2], 1, "first track");
        assert_eq!(toc[3], 2, "last track");
        // The lead-out descriptor is the final entry.
        let leadout_entry = toc.len() - 8;
        assert_eq!(toc[leadout_entry + 2], 0xAA);
        let leadout = u32::from_be_bytes([
            toc[leadout_entry + 4],
            toc[leadout_entry + 5],
            toc[leadout_entry + 6],
            toc[leadout_entry + 7],
        ]);
        assert_eq!(leadout, last + 1, "lead-out equals capacity");
    }

    #[test]
    fn prevent_removal_denies_host_eject_and_sets_sense() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, true);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x1E; // PREVENT ALLOW MEDIUM REMOVAL
        cdb[4] = 1;
        send_packet(&mut channel, &mut disks, cdb);
        let _ = channel.read_register(&mut disks, 7);

        assert!(!channel.host_eject(&mut disks, DiskId::Cdrom0), "eject denied");

        // The denial surfaces on the next command.
        send_packet(&mut channel, &mut disks, [0x00; 12]);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_ERR, STATUS_ERR);
        assert_eq!(channel.read_register(&mut disks, 1) >> 4, 2);
        let mut sense_cdb = [0u8; 12];
        sense_cdb[0] = 0x03;
        sense_cdb[4] = 18;
        send_packet(&mut channel, &mut disks, sense_cdb);
        let sense = read_response(&mut channel, &mut disks);
        assert_eq!(sense[12], 0x53, "medium removal prevented");
    }

    #[test]
    fn play_audio_msf_transitions_and_emits_samples() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, true);
        // Track 2 audio data begins at frame 64 + 150 pregap = 214;
        // MSF values carry the 150-frame lead-in offset on top.
        let start = format_cue::Msf::from_lba(214 + 150);
        let end = format_cue::Msf::from_lba(214 + 150 + 75);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x47; // PLAY AUDIO MSF
        cdb[3] = start.m;
        cdb[4] = start.s;
        cdb[5] = start.f;
        cdb[6] = end.m;
        cdb[7] = end.s;
        cdb[8] = end.f;
        send_packet(&mut channel, &mut disks, cdb);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_ERR, 0, "audio play accepted");

        // Subchannel reports playing while samples are produced.
        let mut sub = [0u8; 12];
        sub[0] = 0x42;
        sub[2] = 0x40;
        sub[8] = 16;
        channel.update(&mut disks, 100_000_000.0);
        send_packet(&mut channel, &mut disks, sub);
        let response = read_response(&mut channel, &mut disks);
        assert_eq!(response[1], 0x11, "audio status: playing");

        // Let the remaining second of audio finish.
        channel.update(&mut disks, 1_200_000_000.0);
        let pcm = channel.take_pcm(0);
        assert_eq!(pcm.len(), 75 * audio::SAMPLES_PER_FRAME * 2);

        send_packet(&mut channel, &mut disks, sub);
        let response = read_response(&mut channel, &mut disks);
        assert_eq!(response[1], 0x13, "completion reported once");
        send_packet(&mut channel, &mut disks, sub);
        let response = read_response(&mut channel, &mut disks);
        assert_eq!(response[1], 0x15, "and only once");
    }

    #[test]
    fn play_audio_rejects_data_tracks() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, true);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x45; // PLAY AUDIO(10) at LBA 0: a data track
        cdb[8] = 10;
        send_packet(&mut channel, &mut disks, cdb);
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_ERR, STATUS_ERR);
        assert_eq!(channel.read_register(&mut disks, 1) >> 4, 5, "ILLEGAL REQUEST");
    }

    #[test]
    fn loading_state_spins_up_through_the_fsm() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, false);
        channel.notify_disk_changed(&mut disks, DiskId::Cdrom0);
        let loading = channel.device(0).atapi.as_ref().map(|a| a.loading);
        assert_eq!(loading, Some(LoadingState::InsertCd));
        channel.update(&mut disks, 1_000_000_001.0);
        let loading = channel.device(0).atapi.as_ref().map(|a| a.loading);
        assert_eq!(loading, Some(LoadingState::DiscLoading));
        channel.update(&mut disks, 1_000_000_001.0);
        channel.update(&mut disks, 1_000.0);
        let loading = channel.device(0).atapi.as_ref().map(|a| a.loading);
        assert_eq!(loading, Some(LoadingState::Ready));
    }

    #[test]
    fn mode_sense_reports_capabilities_page() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, true);
        let mut cdb = [0u8; 12];
        cdb[0] = 0x5A;
        cdb[2] = 0x2A;
        cdb[8] = 40;
        send_packet(&mut channel, &mut disks, cdb);
        let data = read_response(&mut channel, &mut disks);
        assert_eq!(data[8], 0x2A, "page code after the 8-byte header");
        assert_eq!(data[12] & 0x01, 0x01, "audio play supported");
    }

    #[test]
    fn mode_select_updates_audio_volume() {
        let (_dir, mut disks) = cd_router();
        let mut channel = cd_channel(&mut disks, true);
        let mut params = vec![0u8; 8];
        let mut page = vec![0u8; 16];
        page[0] = 0x0E;
        page[1] = 14;
        page[9] = 0x80; // port 0 volume
        page[11] = 0x80;
        params.extend_from_slice(&page);

        let mut cdb = [0u8; 12];
        cdb[0] = 0x55;
        cdb[8] = params.len() as u8;
        send_packet(&mut channel, &mut disks, cdb);
        assert_eq!(channel.read_alt_status() & STATUS_DRQ, STATUS_DRQ);
        for pair in params.chunks(2) {
            let word = u16::from(pair[0]) | (u16::from(*pair.get(1).unwrap_or(&0)) << 8);
            channel.write_data16(&mut disks, word);
        }
        let status = channel.read_register(&mut disks, 7);
        assert_eq!(status & STATUS_ERR, 0);
        let volume = channel.device(0).atapi.as_ref().map(|a| a.mode_pages.audio_control[9]);
        assert_eq!(volume, Some(0x80));
    }
}
