//! The PC storage subsystem: floppy controller, both IDE channels, the
//! PCI IDE function and the disk router, wired to the host's interrupt
//! and DMA collaborators.
//!
//! The host drives progress three ways: port accesses, the nanosecond
//! tick, and mount/unmount calls. Media-change events queue in the
//! router and are delivered here between commands, never mid-transfer.

mod audio;
mod config;

pub use audio::CdAudioOutput;
pub use config::{Architecture, StorageConfig};

use ata_ide::pci::PciIde;
use ata_ide::{AtaChannel, DriveKind};
use disk_io::{DiskChange, DiskId, DiskRouter};
use emu_core::{DmaBus, IrqLine, Nanos};
use nec_upd765::{Architecture as FdcArchitecture, Fdc, FLOPPY_DMA_CHANNEL, FLOPPY_IRQ};

/// Everything on the storage side of the bus.
pub struct StorageSubsystem {
    router: DiskRouter,
    fdc: Fdc,
    channels: [AtaChannel; 2],
    pci: PciIde,
    irq: Box<dyn IrqLine>,
    dma: Box<dyn DmaBus>,
    arch: Architecture,
    /// Last levels pushed to the collaborators (FDC, channel 0/1, DREQ).
    irq_levels: [bool; 3],
    dreq_level: bool,
    /// One PCM ring per possible ATAPI device.
    cd_audio: [[CdAudioOutput; 2]; 2],
}

impl StorageSubsystem {
    #[must_use]
    pub fn new(config: &StorageConfig, irq: Box<dyn IrqLine>, dma: Box<dyn DmaBus>) -> Self {
        let router = DiskRouter::new(config.disk_path.clone());
        let fdc_arch = match config.architecture {
            Architecture::Xt => FdcArchitecture::Xt,
            Architecture::At => FdcArchitecture::At,
        };
        let models = config.ata_models.clone();
        let primary = AtaChannel::new(
            0,
            [DriveKind::Hdd(DiskId::Hdd0), DriveKind::Hdd(DiskId::Hdd1)],
            [models[0].clone(), models[1].clone()],
        );
        let secondary = AtaChannel::new(
            1,
            [
                DriveKind::Atapi(DiskId::Cdrom0),
                DriveKind::Atapi(DiskId::Cdrom1),
            ],
            [models[2].clone(), models[3].clone()],
        );
        Self {
            router,
            fdc: Fdc::new(fdc_arch),
            channels: [primary, secondary],
            pci: PciIde::new(),
            irq,
            dma,
            arch: config.architecture,
            irq_levels: [false; 3],
            dreq_level: false,
            cd_audio: Default::default(),
        }
    }

    #[must_use]
    pub fn router(&self) -> &DiskRouter {
        &self.router
    }

    #[must_use]
    pub fn fdc(&self) -> &Fdc {
        &self.fdc
    }

    #[must_use]
    pub fn channel(&self, index: usize) -> &AtaChannel {
        &self.channels[index & 1]
    }

    #[must_use]
    pub fn pci(&self) -> &PciIde {
        &self.pci
    }

    // -------------------------------------------------------------------
    // Mounting
    // -------------------------------------------------------------------

    /// Mount an image into a slot. The matching controller learns about
    /// it through the queued change event.
    pub fn mount(
        &mut self,
        slot: DiskId,
        filename: &str,
        start: u64,
        read_only: bool,
        custom_size: u64,
    ) -> bool {
        let mounted = self.router.mount(slot, filename, start, read_only, custom_size);
        self.deliver_changes();
        mounted
    }

    pub fn unmount(&mut self, slot: DiskId) {
        self.router.unmount(slot);
        self.deliver_changes();
    }

    /// The user pressed the eject button. ATAPI devices may refuse when
    /// the medium is locked; floppies always eject.
    pub fn request_eject(&mut self, slot: DiskId) -> bool {
        if slot.is_cdrom() {
            // Both CD-ROM slots live on the secondary channel.
            let allowed = self.channels[1].host_eject(&mut self.router, slot);
            if allowed {
                self.router.unmount(slot);
                self.deliver_changes();
            }
            allowed
        } else {
            self.router.request_eject(slot);
            self.deliver_changes();
            true
        }
    }

    /// Route queued media events to the owning controllers.
    fn deliver_changes(&mut self) {
        for change in self.router.drain_changes() {
            match change {
                DiskChange::Media(id) => match id {
                    DiskId::Floppy0 | DiskId::Floppy1 => self.fdc.notify_disk_changed(id),
                    DiskId::Hdd0 | DiskId::Hdd1 => {
                        self.channels[0].notify_disk_changed(&mut self.router, id);
                    }
                    DiskId::Cdrom0 | DiskId::Cdrom1 => {
                        self.channels[1].notify_disk_changed(&mut self.router, id);
                    }
                    DiskId::Spare0 | DiskId::Spare1 => {}
                },
                DiskChange::EjectRequested(id) => {
                    if id.is_floppy() {
                        self.fdc.notify_disk_changed(id);
                    }
                }
            }
        }
    }

    // -------------------------------------------------------------------
    // Port dispatch
    // -------------------------------------------------------------------

    fn ata_decode(&self, port: u16) -> Option<(usize, AtaPort)> {
        for channel in 0..2 {
            let (base, control) = self.pci.channel_ports(channel);
            if port >= base && port < base + 8 {
                return Some((channel, AtaPort::Command((port - base) as u8)));
            }
            if port == control {
                return Some((channel, AtaPort::Control));
            }
            if port == control + 1 {
                return Some((channel, AtaPort::DriveAddress));
            }
        }
        None
    }

    /// 8-bit port read. `None` when nothing decodes the port.
    pub fn io_read(&mut self, port: u16) -> Option<u8> {
        let value = match port {
            0x3F0..=0x3F5 => self.fdc.io_read(&mut self.router, (port & 7) as u8),
            0x3F7 => {
                // Shared register: FDC DIR bit 7 over the IDE drive
                // address lines.
                let dir = self
                    .fdc
                    .io_read(&mut self.router, 7)
                    .map_or(0, |v| v & 0x80);
                let address = if self.pci.native_mode(0) {
                    0x7F
                } else {
                    self.channels[0].read_drive_address() & 0x7F
                };
                if self.arch == Architecture::At {
                    Some(dir | address)
                } else {
                    None
                }
            }
            _ => match self.ata_decode(port) {
                Some((channel, AtaPort::Command(reg))) => {
                    Some(self.channels[channel].read_register(&mut self.router, reg))
                }
                Some((channel, AtaPort::Control)) => Some(self.channels[channel].read_alt_status()),
                Some((channel, AtaPort::DriveAddress)) => {
                    Some(self.channels[channel].read_drive_address())
                }
                None => None,
            },
        };
        self.sync_lines();
        value
    }

    /// 8-bit port write. Returns whether anything decoded the port.
    pub fn io_write(&mut self, port: u16, value: u8) -> bool {
        let handled = match port {
            0x3F0..=0x3F5 => self.fdc.io_write(&mut self.router, (port & 7) as u8, value),
            0x3F7 => self.fdc.io_write(&mut self.router, 7, value),
            _ => match self.ata_decode(port) {
                Some((channel, AtaPort::Command(reg))) => {
                    self.channels[channel].write_register(&mut self.router, reg, value);
                    true
                }
                Some((channel, AtaPort::Control)) => {
                    self.channels[channel].write_device_control(value);
                    true
                }
                Some((_, AtaPort::DriveAddress)) => true,
                None => false,
            },
        };
        self.sync_lines();
        handled
    }

    /// 16-bit read, for the ATA data ports.
    pub fn io_read16(&mut self, port: u16) -> Option<u16> {
        if let Some((channel, AtaPort::Command(0))) = self.ata_decode(port) {
            let value = self.channels[channel].read_data16(&mut self.router);
            self.sync_lines();
            return Some(value);
        }
        self.io_read(port).map(u16::from)
    }

    /// 16-bit write, for the ATA data ports.
    pub fn io_write16(&mut self, port: u16, value: u16) -> bool {
        if let Some((channel, AtaPort::Command(0))) = self.ata_decode(port) {
            self.channels[channel].write_data16(&mut self.router, value);
            self.sync_lines();
            return true;
        }
        self.io_write(port, value as u8)
    }

    /// PCI configuration access for the IDE function.
    pub fn pci_config_read(&self, offset: u8) -> u8 {
        self.pci.read(offset)
    }

    pub fn pci_config_write(&mut self, offset: u8, value: u8) {
        self.pci.write(offset, value);
    }

    // -------------------------------------------------------------------
    // DMA collaborator surface (floppy channel 2)
    // -------------------------------------------------------------------

    /// DACK + read: the DMA controller collects one byte from the FDC.
    pub fn fdc_dma_read(&mut self) -> u8 {
        let value = self.fdc.dma_read(&mut self.router);
        self.sync_lines();
        value
    }

    /// DACK + write: the DMA controller hands one byte to the FDC.
    pub fn fdc_dma_write(&mut self, value: u8) {
        self.fdc.dma_write(&mut self.router, value);
        self.sync_lines();
    }

    /// Terminal count reached on the floppy channel.
    pub fn fdc_dma_terminal_count(&mut self) {
        self.fdc.dma_terminal_count();
    }

    /// End-of-process query.
    #[must_use]
    pub fn fdc_dma_end_of_process(&self) -> bool {
        self.fdc.dma_end_of_process()
    }

    // -------------------------------------------------------------------
    // Audio
    // -------------------------------------------------------------------

    /// Take the host side of a CD-ROM drive's PCM stream.
    pub fn take_cd_audio(&mut self, channel: usize, device: usize) -> Option<ringbuf::HeapCons<i16>> {
        self.cd_audio[channel & 1][device & 1].take_consumer()
    }

    // -------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------

    /// Advance the whole subsystem by `dt` nanoseconds.
    pub fn update(&mut self, dt: Nanos) {
        self.fdc.update(&mut self.router, dt);
        for channel in 0..2 {
            self.channels[channel].update(&mut self.router, dt);
            for device in 0..2 {
                let pcm = self.channels[channel].take_pcm(device);
                if !pcm.is_empty() {
                    self.cd_audio[channel][device].push_samples(&pcm);
                }
            }
            for slot in self.channels[channel].take_eject_requests() {
                self.router.unmount(slot);
            }
        }
        self.deliver_changes();
        self.sync_lines();
    }

    /// Mirror controller line state out to the collaborators.
    fn sync_lines(&mut self) {
        let fdc_irq = self.fdc.irq_level();
        if fdc_irq != self.irq_levels[0] {
            self.irq_levels[0] = fdc_irq;
            if fdc_irq {
                self.irq.raise_irq(FLOPPY_IRQ);
            } else {
                self.irq.lower_irq(FLOPPY_IRQ);
                self.irq.acknowledge_irq(FLOPPY_IRQ);
            }
        }
        for channel in 0..2 {
            let level = self.channels[channel].irq_level();
            if level != self.irq_levels[1 + channel] {
                self.irq_levels[1 + channel] = level;
                let line = self.channels[channel].irq_line();
                if level {
                    self.irq.raise_irq(line);
                } else {
                    self.irq.lower_irq(line);
                    self.irq.acknowledge_irq(line);
                }
            }
        }
        let dreq = self.fdc.dma_request();
        if dreq != self.dreq_level {
            self.dreq_level = dreq;
            self.dma.set_dreq(FLOPPY_DMA_CHANNEL, dreq);
        }
    }
}

enum AtaPort {
    Command(u8),
    Control,
    DriveAddress,
}

/// Create an empty sparse image ready to mount as a hard disk.
pub fn create_dynamic_image(path: &std::path::Path, size: u64) -> bool {
    format_dynamic::DynamicImage::create(path, size).is_ok()
}
