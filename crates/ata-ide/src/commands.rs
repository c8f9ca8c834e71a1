//! ATA command dispatch and the PIO sector transfer engine.

use disk_io::DiskRouter;

use crate::{
    AtaChannel, DevicePhase, DriveKind, TimerEvent, COMMAND_FINISH_NS, ERROR_ABRT, ERROR_IDNF,
    ERROR_MC, ERROR_MCR, ERROR_UNC, STATUS_DWF, STATUS_ERR,
};

// ATA-1 command bytes.
pub(crate) const CMD_NOP: u8 = 0x00;
pub(crate) const CMD_DEVICE_RESET: u8 = 0x08;
pub(crate) const CMD_READ_SECTORS: u8 = 0x20;
pub(crate) const CMD_READ_SECTORS_NORETRY: u8 = 0x21;
pub(crate) const CMD_READ_LONG: u8 = 0x22;
pub(crate) const CMD_READ_LONG_NORETRY: u8 = 0x23;
pub(crate) const CMD_WRITE_SECTORS: u8 = 0x30;
pub(crate) const CMD_WRITE_SECTORS_NORETRY: u8 = 0x31;
pub(crate) const CMD_WRITE_LONG: u8 = 0x32;
pub(crate) const CMD_WRITE_LONG_NORETRY: u8 = 0x33;
pub(crate) const CMD_VERIFY_SECTORS: u8 = 0x40;
pub(crate) const CMD_VERIFY_SECTORS_NORETRY: u8 = 0x41;
pub(crate) const CMD_DIAGNOSTIC: u8 = 0x90;
pub(crate) const CMD_INIT_DEVICE_PARAMS: u8 = 0x91;
pub(crate) const CMD_PACKET: u8 = 0xA0;
pub(crate) const CMD_IDENTIFY_PACKET: u8 = 0xA1;
pub(crate) const CMD_READ_MULTIPLE: u8 = 0xC4;
pub(crate) const CMD_WRITE_MULTIPLE: u8 = 0xC5;
pub(crate) const CMD_SET_MULTIPLE: u8 = 0xC6;
pub(crate) const CMD_GET_MEDIA_STATUS: u8 = 0xDA;
pub(crate) const CMD_ACK_MEDIA_CHANGE: u8 = 0xDB;
pub(crate) const CMD_IDENTIFY: u8 = 0xEC;
pub(crate) const CMD_SET_FEATURES: u8 = 0xEF;

impl AtaChannel {
    /// A write to the command register.
    pub(crate) fn issue_command(&mut self, disks: &mut DiskRouter, command: u8) {
        let selected = self.selected;
        {
            let device = &mut self.devices[selected];
            if device.kind == DriveKind::None {
                return;
            }
            device.command = command;
            device.irq_pending = false;
            device.status &= !(STATUS_ERR | STATUS_DWF);
            device.error = 0;
        }

        // Recalibrate and Seek carry the cylinder in the low nibble.
        match command & 0xF0 {
            0x10 => {
                self.cmd_recalibrate();
                return;
            }
            0x70 => {
                self.cmd_seek();
                return;
            }
            _ => {}
        }

        match command {
            CMD_NOP => {
                // NOP aborts without touching the data registers.
                self.devices[selected].abort_command();
            }
            CMD_DEVICE_RESET => {
                if self.devices[selected].kind.is_atapi() {
                    let device = &mut self.devices[selected];
                    device.timer.arm(COMMAND_FINISH_NS);
                    device.timer_event = TimerEvent::ResetDone;
                } else {
                    self.devices[selected].abort_command();
                }
            }
            CMD_READ_SECTORS | CMD_READ_SECTORS_NORETRY | CMD_READ_LONG
            | CMD_READ_LONG_NORETRY => self.start_sector_transfer(disks, false, 1),
            CMD_WRITE_SECTORS | CMD_WRITE_SECTORS_NORETRY | CMD_WRITE_LONG
            | CMD_WRITE_LONG_NORETRY => self.start_sector_transfer(disks, true, 1),
            CMD_READ_MULTIPLE => {
                let block = self.devices[selected].multiple;
                if block == 0 {
                    self.devices[selected].abort_command();
                } else {
                    self.start_sector_transfer(disks, false, u32::from(block));
                }
            }
            CMD_WRITE_MULTIPLE => {
                let block = self.devices[selected].multiple;
                if block == 0 {
                    self.devices[selected].abort_command();
                } else {
                    self.start_sector_transfer(disks, true, u32::from(block));
                }
            }
            CMD_VERIFY_SECTORS | CMD_VERIFY_SECTORS_NORETRY => self.cmd_verify(disks),
            CMD_DIAGNOSTIC => {
                // Both devices pass diagnostics.
                for device in &mut self.devices {
                    if device.kind != DriveKind::None {
                        device.apply_reset_signature();
                    }
                }
                self.devices[selected].irq_pending = true;
            }
            CMD_INIT_DEVICE_PARAMS => {
                let device = &mut self.devices[selected];
                if device.kind.is_atapi() {
                    device.abort_command();
                } else {
                    device.heads = (device.drive_head & 0x0F) + 1;
                    device.spt = device.sector_count;
                    let per_cylinder =
                        u64::from(device.heads.max(1)) * u64::from(device.spt.max(1));
                    device.cylinders = (device.total_sectors(disks) / per_cylinder) as u16;
                    device.finish_ok();
                }
            }
            CMD_IDENTIFY => {
                let device = &mut self.devices[selected];
                if device.kind.is_atapi() {
                    // ATAPI devices reject IDENTIFY with their signature.
                    device.apply_reset_signature();
                    device.abort_command();
                } else if device.kind == DriveKind::None {
                    device.abort_command();
                } else {
                    let block = device.identify;
                    for (i, word) in block.iter().enumerate() {
                        device.buffer[i * 2] = *word as u8;
                        device.buffer[i * 2 + 1] = (*word >> 8) as u8;
                    }
                    device.buf_pos = 0;
                    device.buf_len = 512;
                    device.remaining_sectors = 0;
                    device.phase = DevicePhase::DataIn;
                    device.irq_pending = true;
                }
            }
            CMD_IDENTIFY_PACKET => {
                let device = &mut self.devices[selected];
                if !device.kind.is_atapi() {
                    device.abort_command();
                } else {
                    let block = device.identify;
                    for (i, word) in block.iter().enumerate() {
                        device.buffer[i * 2] = *word as u8;
                        device.buffer[i * 2 + 1] = (*word >> 8) as u8;
                    }
                    device.buf_pos = 0;
                    device.buf_len = 512;
                    device.remaining_sectors = 0;
                    device.phase = DevicePhase::DataIn;
                    device.irq_pending = true;
                }
            }
            CMD_SET_MULTIPLE => {
                let device = &mut self.devices[selected];
                let count = device.sector_count;
                if count != 0 && (count > 128 || !count.is_power_of_two()) {
                    device.abort_command();
                } else {
                    device.multiple = count;
                    device.finish_ok();
                }
            }
            CMD_SET_FEATURES => self.cmd_set_features(),
            CMD_GET_MEDIA_STATUS => {
                let device = &mut self.devices[selected];
                if device.kind.is_atapi() {
                    let mounted = device
                        .kind
                        .slot()
                        .is_some_and(|slot| disks.is_mounted(slot));
                    let changed = device.atapi.as_ref().is_some_and(|a| a.media_changed);
                    device.error = 0;
                    if !mounted {
                        device.error |= 0x02; // no media
                    }
                    if changed {
                        device.error |= ERROR_MC;
                    }
                    if device.error != 0 {
                        device.status |= STATUS_ERR;
                        device.phase = DevicePhase::Error;
                        device.irq_pending = true;
                    } else {
                        device.finish_ok();
                    }
                } else {
                    device.abort_command();
                }
            }
            CMD_ACK_MEDIA_CHANGE => {
                let device = &mut self.devices[selected];
                if device.kind.is_atapi() {
                    if let Some(atapi) = &mut device.atapi {
                        atapi.media_changed = false;
                    }
                    device.finish_ok();
                } else {
                    device.error = ERROR_MCR;
                    device.status |= STATUS_ERR;
                    device.phase = DevicePhase::Error;
                    device.irq_pending = true;
                }
            }
            CMD_PACKET => {
                if self.devices[selected].kind.is_atapi() {
                    self.atapi_begin_packet(selected);
                } else {
                    self.devices[selected].abort_command();
                }
            }
            _ => self.devices[selected].abort_command(),
        }
    }

    fn cmd_recalibrate(&mut self) {
        let device = &mut self.devices[self.selected];
        if device.kind.is_atapi() {
            device.abort_command();
            return;
        }
        device.lba_mid = 0;
        device.lba_high = 0;
        device.timer.arm(COMMAND_FINISH_NS);
        device.timer_event = TimerEvent::CommandDone;
        device.phase = DevicePhase::BusyWait;
    }

    fn cmd_seek(&mut self) {
        let device = &mut self.devices[self.selected];
        if device.kind.is_atapi() {
            device.abort_command();
            return;
        }
        device.timer.arm(COMMAND_FINISH_NS);
        device.timer_event = TimerEvent::CommandDone;
        device.phase = DevicePhase::BusyWait;
    }

    fn cmd_set_features(&mut self) {
        let device = &mut self.devices[self.selected];
        match device.features {
            0x01 => {
                device.enable_8bit = true;
                device.finish_ok();
            }
            0x81 => {
                device.enable_8bit = false;
                device.finish_ok();
            }
            // Write cache toggles are accepted and ignored.
            0x02 | 0x82 => device.finish_ok(),
            0x66 => {
                device.reset_sets_defaults = false;
                device.finish_ok();
            }
            0xCC => {
                device.reset_sets_defaults = true;
                device.finish_ok();
            }
            _ => device.abort_command(),
        }
    }

    fn cmd_verify(&mut self, disks: &mut DiskRouter) {
        let selected = self.selected;
        let device = &mut self.devices[selected];
        if device.kind.is_atapi() {
            device.abort_command();
            return;
        }
        let count = if device.sector_count == 0 {
            256u32
        } else {
            u32::from(device.sector_count)
        };
        let lba = device.task_lba();
        let total = device.total_sectors(disks);
        if lba + u64::from(count) > total {
            device.error = ERROR_IDNF;
            device.status |= STATUS_ERR;
            device.set_task_lba(total.min(lba));
            device.phase = DevicePhase::Error;
            device.irq_pending = true;
            return;
        }
        device.sector_count = 0;
        device.set_task_lba(lba + u64::from(count));
        device.timer.arm(COMMAND_FINISH_NS);
        device.timer_event = TimerEvent::CommandDone;
        device.phase = DevicePhase::BusyWait;
    }

    /// Common setup for read/write (multiple) commands.
    fn start_sector_transfer(&mut self, disks: &mut DiskRouter, is_write: bool, block: u32) {
        let selected = self.selected;
        {
            let device = &mut self.devices[selected];
            if device.kind.is_atapi() {
                device.apply_reset_signature();
                device.abort_command();
                return;
            }
            let count = if device.sector_count == 0 {
                256u32
            } else {
                u32::from(device.sector_count)
            };
            let lba = device.task_lba();
            let total = device.total_sectors(disks);
            if total == 0 || lba + u64::from(count) > total {
                device.error = ERROR_IDNF;
                device.status |= STATUS_ERR;
                device.phase = DevicePhase::Error;
                device.irq_pending = true;
                return;
            }
            device.transfer_lba = lba;
            device.remaining_sectors = count;
            device.block_sectors = block;
        }
        if is_write {
            // First DRQ block raises no interrupt.
            let device = &mut self.devices[selected];
            let chunk = device.block_sectors.min(device.remaining_sectors) as usize;
            device.buf_pos = 0;
            device.buf_len = chunk * 512;
            device.phase = DevicePhase::DataOut;
        } else {
            self.load_read_block(disks, selected, true);
        }
    }

    /// Pull the next block of a read into the PIO buffer.
    fn load_read_block(&mut self, disks: &mut DiskRouter, index: usize, interrupt: bool) {
        let device = &mut self.devices[index];
        let Some(slot) = device.kind.slot() else {
            device.abort_command();
            return;
        };
        let chunk = device.block_sectors.min(device.remaining_sectors) as usize;
        let bytes = chunk * 512;
        let start = device.transfer_lba * 512;
        if !disks.read(slot, &mut device.buffer[..bytes], start) {
            device.error = ERROR_UNC;
            device.status |= STATUS_ERR;
            device.phase = DevicePhase::Error;
            device.irq_pending = true;
            return;
        }
        device.transfer_lba += chunk as u64;
        device.remaining_sectors -= chunk as u32;
        device.buf_pos = 0;
        device.buf_len = bytes;
        device.phase = DevicePhase::DataIn;
        if interrupt {
            device.irq_pending = true;
        }
    }

    /// The host drained a DataIn block.
    pub(crate) fn data_in_block_done(&mut self, disks: &mut DiskRouter) {
        let selected = self.selected;
        if self.devices[selected].kind.is_atapi() {
            self.atapi_data_in_done(disks, selected);
            return;
        }
        let device = &mut self.devices[selected];
        if device.remaining_sectors == 0 {
            // Sector reads leave the task file past the last sector;
            // IDENTIFY and friends leave it alone.
            if matches!(device.command, 0x20..=0x23 | CMD_READ_MULTIPLE) {
                device.sector_count = 0;
                let lba = device.transfer_lba;
                device.set_task_lba(lba);
            }
            device.phase = DevicePhase::Idle;
            device.status |= crate::STATUS_DSC;
            return;
        }
        self.load_read_block(disks, selected, true);
    }

    /// The host filled a DataOut block.
    pub(crate) fn data_out_block_done(&mut self, disks: &mut DiskRouter) {
        let selected = self.selected;
        if self.devices[selected].kind.is_atapi() {
            self.atapi_data_out_done(disks, selected);
            return;
        }
        let device = &mut self.devices[selected];
        let Some(slot) = device.kind.slot() else {
            device.abort_command();
            return;
        };
        let chunk = device.buf_len / 512;
        let start = device.transfer_lba * 512;
        let data = device.buffer[..device.buf_len].to_vec();
        if !disks.write(slot, &data, start) {
            // A read-only medium reports a write fault on top of ABRT.
            device.error = ERROR_ABRT;
            device.status |= STATUS_ERR | STATUS_DWF;
            device.phase = DevicePhase::Error;
            device.irq_pending = true;
            return;
        }
        device.transfer_lba += chunk as u64;
        device.remaining_sectors -= chunk as u32;
        if device.remaining_sectors == 0 {
            device.sector_count = 0;
            device.set_task_lba(device.transfer_lba);
            device.finish_ok();
        } else {
            let next = device.block_sectors.min(device.remaining_sectors) as usize;
            device.buf_pos = 0;
            device.buf_len = next * 512;
            device.phase = DevicePhase::DataOut;
            device.irq_pending = true;
        }
    }
}
