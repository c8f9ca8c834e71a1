//! Command decoding, the parameter/result byte protocol, and the
//! seek/recalibrate machinery.

use disk_io::DiskRouter;

use crate::{CommandStep, Fdc};

pub const READ_TRACK: u8 = 2;
pub const SPECIFY: u8 = 3;
pub const SENSE_DRIVE_STATUS: u8 = 4;
pub const WRITE_DATA: u8 = 5;
pub const READ_DATA: u8 = 6;
pub const RECALIBRATE: u8 = 7;
pub const SENSE_INTERRUPT: u8 = 8;
pub const WRITE_DELETED_DATA: u8 = 9;
pub const READ_ID: u8 = 10;
pub const READ_DELETED_DATA: u8 = 12;
pub const FORMAT_TRACK: u8 = 13;
pub const DUMPREG: u8 = 14;
pub const SEEK: u8 = 15;
pub const VERSION: u8 = 16;
pub const SCAN_EQUAL: u8 = 17;
pub const PERPENDICULAR_MODE: u8 = 18;
pub const CONFIGURE: u8 = 19;
pub const LOCK: u8 = 20;
pub const VERIFY: u8 = 22;
pub const SCAN_LOW_OR_EQUAL: u8 = 25;
pub const SCAN_HIGH_OR_EQUAL: u8 = 29;

/// MT / MFM / SK bits folded into the command byte.
pub const CMD_EXT_SKIP: u8 = 0x20;
pub const CMD_EXT_MFM: u8 = 0x40;
pub const CMD_EXT_MT: u8 = 0x80;

/// ST1/ST2 values latched when the medium vanishes mid-transfer.
pub(crate) const ST1_MEDIA_EJECTED: u8 = 0x24;
pub(crate) const ST2_MEDIA_EJECTED: u8 = 0x01;

/// Parameter bytes following the command byte, indexed by command id.
const PARAMETER_COUNT: [u8; 0x20] = [
    0, 0, 8, 2, 1, 8, 8, 1, 0, 8, 1, 0, 8, 5, 0, 2, //
    0, 8, 1, 3, 1, 0, 8, 0, 0, 8, 0, 0, 0, 8, 0, 0,
];

/// Result bytes per command id.
const RESULT_COUNT: [u8; 0x20] = [
    0, 0, 7, 0, 1, 7, 7, 0, 2, 7, 7, 0, 7, 7, 10, 7, //
    1, 7, 0, 0, 1, 0, 7, 0, 0, 7, 0, 0, 0, 7, 0, 0,
];

impl Fdc {
    // -------------------------------------------------------------------
    // Data register protocol
    // -------------------------------------------------------------------

    /// A write to the data register (or a DMA DACK write).
    pub(crate) fn write_data(&mut self, is_dma: bool, value: u8, disks: &mut DiskRouter) {
        match self.step {
            CommandStep::Command => {
                if is_dma {
                    self.abnormal_polling();
                    return;
                }
                if self.ignore_commands {
                    return;
                }
                self.step = CommandStep::Parameters;
                self.command_pos = 1;
                self.mt = value & CMD_EXT_MT != 0;
                self.mfm = value & CMD_EXT_MFM != 0;
                self.skip_deleted = value & CMD_EXT_SKIP != 0;
                self.mt_mask = true;
                let id = value & 0x1F;
                // Any command byte stops the post-reset interrupt timer.
                self.stop_timer(4);
                match id {
                    DUMPREG | VERSION | LOCK | SENSE_INTERRUPT => {
                        if id != SENSE_INTERRUPT {
                            self.finish_reset_pending();
                        }
                        self.command[0] = value;
                        self.execute_command(disks);
                    }
                    READ_TRACK | FORMAT_TRACK => {
                        // Track-wide commands ignore MT in sector math.
                        self.mt_mask = false;
                        self.finish_reset_pending();
                        self.command[0] = value;
                    }
                    WRITE_DATA | WRITE_DELETED_DATA | READ_DATA | VERIFY | READ_DELETED_DATA
                    | SPECIFY | SENSE_DRIVE_STATUS | RECALIBRATE | SEEK | READ_ID | CONFIGURE
                    | SCAN_EQUAL | SCAN_LOW_OR_EQUAL | SCAN_HIGH_OR_EQUAL | PERPENDICULAR_MODE => {
                        if self.arch == crate::Architecture::Xt {
                            self.lower_irq();
                        }
                        self.finish_reset_pending();
                        self.command[0] = value;
                    }
                    _ => {
                        self.st0 = 0x80;
                        self.step = CommandStep::Error;
                        self.dma_pending = 0;
                    }
                }
            }
            CommandStep::Parameters => {
                if is_dma {
                    self.abnormal_polling();
                    return;
                }
                self.command[self.command_pos] = value;
                self.command_pos += 1;
                if self.command_pos > PARAMETER_COUNT[(self.command[0] & 0x1F) as usize] as usize {
                    self.execute_command(disks);
                }
            }
            CommandStep::Data => match self.command[0] & 0x1F {
                SCAN_EQUAL | SCAN_LOW_OR_EQUAL | SCAN_HIGH_OR_EQUAL => {
                    if self.use_dma() != is_dma {
                        self.abnormal_polling();
                        return;
                    }
                    if !is_dma {
                        self.lower_irq();
                    }
                    let fdc_byte = self.data[self.data_pos];
                    self.data_pos += 1;
                    self.scan_byte(fdc_byte, value);
                    self.after_data_byte_in(disks);
                }
                WRITE_DATA | WRITE_DELETED_DATA | FORMAT_TRACK => {
                    if self.use_dma() != is_dma {
                        self.abnormal_polling();
                        return;
                    }
                    if !is_dma {
                        self.lower_irq();
                    }
                    self.data[self.data_pos] = value;
                    self.data_pos += 1;
                    self.after_data_byte_in(disks);
                }
                _ => self.abnormal_polling(),
            },
            CommandStep::Result | CommandStep::Error => self.abnormal_polling(),
            CommandStep::ResultThenLock | CommandStep::Locked => {}
        }
    }

    fn after_data_byte_in(&mut self, disks: &mut DiskRouter) {
        if self.data_pos == self.data_size {
            self.execute_data(disks);
        } else {
            self.data_ready();
            if self.use_dma() && self.tc {
                // Terminal count cut the transfer short.
                self.execute_data(disks);
            }
        }
    }

    /// A read of the data register (or a DMA DACK read).
    pub(crate) fn read_data(&mut self, is_dma: bool, disks: &mut DiskRouter) -> u8 {
        match self.step {
            CommandStep::Command => {
                if !self.ignore_commands {
                    self.abnormal_polling();
                }
                0
            }
            CommandStep::Parameters => {
                self.abnormal_polling();
                0
            }
            CommandStep::Data => match self.command[0] & 0x1F {
                READ_TRACK | READ_DATA | READ_DELETED_DATA => {
                    if self.use_dma() != is_dma {
                        self.abnormal_polling();
                        return 0;
                    }
                    if !is_dma {
                        self.lower_irq();
                    }
                    let value = self.data[self.data_pos];
                    self.data_pos += 1;
                    if self.data_pos == self.data_size {
                        self.execute_data(disks);
                    } else {
                        self.data_ready();
                        if self.use_dma() && self.tc {
                            self.execute_data(disks);
                        }
                    }
                    value
                }
                _ => {
                    self.abnormal_polling();
                    0
                }
            },
            CommandStep::Result => {
                if is_dma {
                    self.abnormal_polling();
                    return 0;
                }
                let value = self.result[self.result_pos];
                self.result_pos += 1;
                let id = self.command[0] & 0x1F;
                if matches!(
                    id,
                    READ_TRACK
                        | WRITE_DATA
                        | READ_DATA
                        | WRITE_DELETED_DATA
                        | READ_DELETED_DATA
                        | FORMAT_TRACK
                        | READ_ID
                        | SCAN_EQUAL
                        | SCAN_LOW_OR_EQUAL
                        | SCAN_HIGH_OR_EQUAL
                ) {
                    self.lower_irq();
                }
                if self.result_pos >= RESULT_COUNT[id as usize] as usize {
                    self.step = CommandStep::Command;
                }
                value
            }
            CommandStep::ResultThenLock | CommandStep::Error => {
                if is_dma {
                    return 0;
                }
                self.lower_irq();
                if self.step == CommandStep::ResultThenLock {
                    self.step = CommandStep::Locked;
                } else {
                    self.step = CommandStep::Command;
                }
                self.st0
            }
            CommandStep::Locked => 0xFF,
        }
    }

    /// Polling the data register against the transfer direction aborts
    /// the command with interrupt code 3.
    pub(crate) fn abnormal_polling(&mut self) {
        self.st0 = (self.st0 & !0xC8) | 0xC0;
        self.step = CommandStep::Error;
        self.dma_pending = 0;
        self.raise_irq();
    }

    fn finish_reset_pending(&mut self) {
        self.reset_pending = 0;
        if self.reset_pended {
            self.st0 &= 0x20;
            self.reset_pended = false;
        }
    }

    // -------------------------------------------------------------------
    // Command execution
    // -------------------------------------------------------------------

    pub(crate) fn execute_command(&mut self, disks: &mut DiskRouter) {
        let drive = self.selected_drive();
        self.tc = false;
        self.result_pos = 0;
        self.data_size = 0;
        self.abort_after_data = false;
        self.update_geometry(
            disks,
            drive,
            self.drives[drive].physical_head,
            self.drives[drive].physical_cylinder,
        );
        self.erroring &= !(1 << drive);
        self.drives[drive].eject_pending = false;

        match self.command[0] & 0x1F {
            WRITE_DATA | WRITE_DELETED_DATA => {
                self.datamark_deleted = self.command[0] & 0x1F == WRITE_DELETED_DATA;
                self.drives[drive].active_command = self.command[0] & 0x1F;
                self.rw_requested_cylinder = self.command[2];
                self.drives[drive].head = self.command[3];
                self.drives[drive].physical_head = (self.command[1] & 4) >> 2;
                self.drives[drive].sector = self.command[4];
                self.update_geometry(
                    disks,
                    drive,
                    self.drives[drive].physical_head,
                    self.drives[drive].physical_cylinder,
                );
                self.update_st3(disks, drive);
                self.write_sector(disks);
            }
            READ_TRACK | READ_DATA | READ_DELETED_DATA | SCAN_EQUAL | SCAN_LOW_OR_EQUAL
            | SCAN_HIGH_OR_EQUAL | VERIFY => {
                self.datamark_deleted = self.command[0] & 0x1F == READ_DELETED_DATA;
                self.drives[drive].active_command = self.command[0] & 0x1F;
                self.drives[drive].physical_head = (self.command[1] & 4) >> 2;
                self.rw_requested_cylinder = self.command[2];
                self.drives[drive].head = self.command[3];
                self.drives[drive].sector = self.command[4];
                self.scanning_for_sector_id = true;
                self.update_st3(disks, drive);
                self.update_geometry(
                    disks,
                    drive,
                    self.drives[drive].physical_head,
                    self.drives[drive].physical_cylinder,
                );
                self.read_sector(disks);
            }
            SPECIFY => {
                let rate = self.rate_select();
                let d = &mut self.drives[drive];
                d.specify = [self.command[1], self.command[2]];
                d.step_rate = crate::rates::step_rate_ns(rate, (self.command[1] >> 4) & 0xF);
                d.head_unload_time = crate::rates::head_unload_ns(rate, self.command[1] & 0xF);
                d.head_load_time = crate::rates::head_load_ns(rate, (self.command[2] >> 1) & 0x7F);
                self.step = CommandStep::Command;
                // No result phase and no interrupt.
                self.lower_irq();
            }
            RECALIBRATE => {
                let target = (self.command[1] & 3) as usize;
                self.step = CommandStep::Command;
                self.drives[target].physical_head = 0;
                self.drives[target].active_command = RECALIBRATE;
                self.st0 &= !0x20;
                self.drives[target].recalibrate_steps_left = 79;
                let step_rate = self.drives[target].step_rate;
                self.arm_timer(target, step_rate);
                self.set_msr_seek_busy(target, true);
                if self.drives[target].physical_cylinder == 0 {
                    // Already home: finish on the spot.
                    self.fake_track_change(disks, target);
                    self.finish_recalibrate(disks, target);
                    self.check_finish_timing(target);
                } else {
                    self.clear_disk_changed(target);
                }
            }
            SENSE_INTERRUPT => {
                self.sense_interrupt();
            }
            SEEK => {
                let target = (self.command[1] & 3) as usize;
                self.step = CommandStep::Command;
                self.drives[target].physical_head = (self.command[1] & 4) >> 2;
                self.drives[target].head = (self.command[1] & 4) >> 2;
                self.drives[target].active_command = SEEK;
                self.drives[target].seek_destination = self.command[2];
                self.drives[target].seek_relative = self.mt;
                self.drives[target].seek_up = self.mfm;
                self.st0 &= !0x20;
                let step_rate = self.drives[target].step_rate;
                self.arm_timer(target, step_rate);
                self.set_msr_seek_busy(target, true);
                let at_destination = target < 2
                    && self.drives[target].geometry.is_some_and(|g| {
                        (self.drives[target].cylinder == self.drives[target].seek_destination
                            && self.drives[target].cylinder < g.tracks
                            && !self.drives[target].seek_relative)
                            || (self.drives[target].seek_relative
                                && self.drives[target].seek_destination == 0)
                    });
                if at_destination {
                    self.fake_track_change(disks, target);
                    self.finish_seek(disks, target, true);
                    self.check_finish_timing(target);
                } else {
                    self.clear_disk_changed(target);
                }
            }
            SENSE_DRIVE_STATUS => {
                let target = (self.command[1] & 3) as usize;
                self.drives[target].head = (self.command[1] & 4) >> 2;
                self.drives[target].physical_head = (self.command[1] & 4) >> 2;
                self.update_st3(disks, target);
                self.result[0] = self.st3;
                self.result_pos = 0;
                self.step = CommandStep::Result;
            }
            READ_ID => {
                self.read_id(disks);
            }
            FORMAT_TRACK => {
                self.format_track_start(disks);
            }
            VERSION => {
                self.result[0] = 0x90; // 82077AA
                self.result_pos = 0;
                self.step = CommandStep::Result;
            }
            CONFIGURE => {
                self.configuration = [self.command[1], self.command[2], self.command[3]];
                self.step = CommandStep::Command;
                self.lower_irq();
            }
            LOCK => {
                self.locked = self.mt;
                self.result[0] = u8::from(self.locked) << 4;
                self.result_pos = 0;
                self.step = CommandStep::Result;
            }
            DUMPREG => {
                self.result[0] = self.drives[0].cylinder;
                self.result[1] = self.drives[1].cylinder;
                self.result[2] = self.drives[2].cylinder;
                self.result[3] = self.drives[3].cylinder;
                self.result[4] = self.drives[drive].specify[0];
                self.result[5] = self.drives[drive].specify[1];
                self.result[6] = if self.drive_mounted(disks, drive) {
                    self.drives[drive].geometry.map_or(0, |g| g.spt)
                } else {
                    0
                };
                self.result[7] = (u8::from(self.locked) << 7) | (self.perpendicular & 0x7F);
                self.result[8] = self.configuration[1];
                self.result[9] = self.configuration[2];
                self.result_pos = 0;
                self.step = CommandStep::Result;
            }
            PERPENDICULAR_MODE => {
                // OW (bit 7) gates overwriting the per-drive bits D0-D3.
                if self.command[1] & 0x80 == 0 {
                    self.perpendicular =
                        (self.command[1] & !0x3C) | (self.perpendicular & 0x3C);
                } else {
                    self.perpendicular = self.command[1] & 0x7F;
                }
                self.st0 = (self.st0 & 0x38)
                    | drive as u8
                    | (self.drives[drive].physical_head << 2);
                self.step = CommandStep::Command;
                self.lower_irq();
            }
            _ => {
                self.lower_irq();
                self.step = CommandStep::Error;
                self.st0 = 0x80;
                self.dma_pending = 0;
            }
        }
    }

    fn sense_interrupt(&mut self) {
        let drive = self.selected_drive();
        let had_irq = self.irq_pending != 0;
        self.step = CommandStep::Result;
        let mut reported_st0 = self.st0;
        if self.reset_pending != 0 {
            if self.reset_pending == 0xFF {
                // Polling off: Sense Interrupt here is an error.
                self.reset_pending = 0;
                self.st0 = 0x80;
                self.result[0] = self.st0;
                self.result[1] = self.drives[drive].cylinder;
                self.result_pos = 0;
                self.step = CommandStep::Error;
                return;
            }
            let reset_drive = self.reset_pending_size - self.reset_pending;
            self.reset_pending -= 1;
            self.st0 &= 0xF8;
            self.st0 |= reset_drive & 3;
            self.st0 =
                (self.st0 & !0x04) | ((self.drives[reset_drive as usize].physical_head & 1) << 2);
            self.st0 &= !0x10;
            reported_st0 = self.st0;
            if self.reset_pending == 0 {
                // All four drives polled: drop the polling flag.
                self.st0 &= 0x3F;
            }
        } else if !had_irq {
            self.st0 = 0x80;
            self.result[0] = self.st0;
            self.result[1] = self.drives[drive].cylinder;
            self.result_pos = 0;
            self.step = CommandStep::Error;
            return;
        }
        self.lower_irq();
        self.result[0] = reported_st0;
        self.result[1] = self.drives[drive].cylinder;
        self.result_pos = 0;
        self.step = CommandStep::Result;
    }

    // -------------------------------------------------------------------
    // Seek / recalibrate stepping
    // -------------------------------------------------------------------

    /// Pretend the track changed so READ ID restarts its scan at the
    /// index hole.
    pub(crate) fn fake_track_change(&mut self, disks: &mut DiskRouter, drive: usize) {
        self.update_geometry(
            disks,
            drive,
            self.drives[drive].physical_head,
            self.drives[drive].physical_cylinder,
        );
        self.read_id_last_sector = self.drives[drive]
            .geometry
            .map_or(0, |g| g.spt.wrapping_add(1));
    }

    /// One step pulse of a SEEK (or an implied seek for a transfer
    /// command).
    pub(crate) fn seek_step(&mut self, disks: &mut DiskRouter, drive: usize) {
        let active = self.drives[drive].active_command & 0x1F;
        if drive >= 2 || self.drives[drive].geometry.is_none() {
            // No drive or no medium: the seek cannot complete.
            self.read_id_last_sector = 0;
            self.st0 = 0x20 | (self.drives[drive].physical_head << 2) | drive as u8;
            self.irq_pending = 2;
            self.stop_timer(drive);
            self.set_msr_seek_busy(drive, false);
            self.implied_seek_pickup_failed(disks, drive, active);
            return;
        }

        let d = &self.drives[drive];
        let (step_out, step_in) = if d.seek_relative {
            (!d.seek_up && d.seek_destination != 0, d.seek_up && d.seek_destination != 0)
        } else {
            (d.cylinder > d.seek_destination, d.cylinder < d.seek_destination)
        };

        let mut moved = false;
        if step_out {
            self.fake_track_change(disks, drive);
            self.drives[drive].cylinder = self.drives[drive].cylinder.wrapping_sub(1);
            if self.drives[drive].physical_cylinder > 0 {
                self.drives[drive].physical_cylinder -= 1;
            }
            moved = true;
        } else if step_in {
            self.fake_track_change(disks, drive);
            self.drives[drive].cylinder = self.drives[drive].cylinder.wrapping_add(1);
            if let Some(geometry) = self.drives[drive].geometry {
                if self.drives[drive].physical_cylinder < geometry.tracks - 1 {
                    self.drives[drive].physical_cylinder += 1;
                }
            }
            moved = true;
        }
        self.update_st3(disks, drive);

        let tracks = self.drives[drive].geometry.map_or(0, |g| g.tracks);
        let d = &self.drives[drive];
        let arrived = drive < 2
            && ((!d.seek_relative && d.cylinder == d.seek_destination && d.cylinder < tracks)
                || (d.seek_relative && d.seek_destination == 0));
        // A destination past the last track parks the head there and
        // completes; the drive has no way to step further.
        let clamped = !d.seek_relative
            && d.seek_destination >= tracks
            && d.physical_cylinder == tracks.saturating_sub(1);
        if arrived || clamped {
            if clamped {
                self.drives[drive].cylinder = tracks.saturating_sub(1);
            }
            self.finish_seek(disks, drive, active == SEEK);
            if active != SEEK {
                self.implied_seek_pickup(disks, drive, active);
            }
            return;
        }
        if !moved {
            // Nowhere to go: report completion without Seek End.
            self.st0 = (self.st0 & 0x30) | drive as u8 | (self.drives[drive].physical_head << 2);
            self.st2 = 0;
            self.irq_pending = 2;
            self.stop_timer(drive);
            self.set_msr_seek_busy(drive, false);
            self.implied_seek_pickup_failed(disks, drive, active);
        }
    }

    /// Resume the interrupted transfer command after its implied seek
    /// landed.
    fn implied_seek_pickup(&mut self, disks: &mut DiskRouter, drive: usize, active: u8) {
        match active {
            VERIFY => self.verify_tick(disks, drive),
            FORMAT_TRACK => self.format_sector(disks, false),
            READ_TRACK | READ_DATA | READ_DELETED_DATA | SCAN_EQUAL | SCAN_LOW_OR_EQUAL
            | SCAN_HIGH_OR_EQUAL => self.read_sector(disks),
            WRITE_DATA | WRITE_DELETED_DATA => self.write_sector(disks),
            _ => {}
        }
    }

    /// The implied seek could not land; surface the command's failure.
    fn implied_seek_pickup_failed(&mut self, disks: &mut DiskRouter, drive: usize, active: u8) {
        match active {
            VERIFY => self.verify_tick(disks, drive),
            FORMAT_TRACK => self.format_sector(disks, false),
            READ_TRACK | READ_DATA | READ_DELETED_DATA | SCAN_EQUAL | SCAN_LOW_OR_EQUAL
            | SCAN_HIGH_OR_EQUAL => self.read_sector_fail_result(),
            WRITE_DATA | WRITE_DELETED_DATA => self.write_sector_fail_result(),
            _ => self.raise_irq(),
        }
    }

    pub(crate) fn recalibrate_step(&mut self, disks: &mut DiskRouter, drive: usize) {
        if self.drives[drive].physical_cylinder != 0 && drive < 2 {
            self.drives[drive].physical_cylinder -= 1;
            self.fake_track_change(disks, drive);
        }
        if (self.drives[drive].physical_cylinder != 0 || drive >= 2)
            && self.drives[drive].recalibrate_steps_left != 0
        {
            self.drives[drive].recalibrate_steps_left -= 1;
        } else {
            self.finish_recalibrate(disks, drive);
        }
    }

    pub(crate) fn finish_recalibrate(&mut self, disks: &mut DiskRouter, drive: usize) {
        self.drives[drive].cylinder = 0;
        self.st0 = 0x20 | drive as u8 | (self.drives[drive].physical_head << 2);
        self.update_st3(disks, drive);
        if !self.motor_on(drive) || drive > 1 || self.drives[drive].physical_cylinder != 0 {
            // Unit check: track 0 not reached within 79 pulses.
            self.st0 |= 0x50;
        }
        self.raise_irq();
        self.irq_pending = 2;
        self.set_msr_seek_busy(drive, false);
        self.stop_timer(drive);
    }

    pub(crate) fn finish_seek(&mut self, disks: &mut DiskRouter, drive: usize, finish_irq: bool) {
        self.st0 = 0x20 | (self.drives[drive].physical_head << 2) | drive as u8;
        if !self.motor_on(drive) || drive > 1 {
            self.st0 |= 0x50;
        }
        self.update_st3(disks, drive);
        if finish_irq {
            self.raise_irq();
            self.irq_pending = 2;
        }
        self.stop_timer(drive);
        self.set_msr_seek_busy(drive, false);
    }

    pub(crate) fn check_finish_timing(&mut self, drive: usize) {
        if !self.timers[drive].is_armed() {
            self.timing &= !(1 << drive);
        }
    }

    /// Schedule the implied seek a transfer command needs before it can
    /// touch the medium.
    pub(crate) fn perform_implicit_seek(&mut self, disks: &mut DiskRouter, destination: u8) {
        let drive = (self.command[1] & 3) as usize;
        self.drives[drive].seek_destination = destination;
        self.drives[drive].seek_relative = false;
        self.drives[drive].seek_up = false;
        self.st0 &= !0x20;
        let step_rate = self.drives[drive].step_rate;
        self.arm_timer(drive, step_rate);
        self.set_msr_seek_busy(drive, true);
        let at_destination = drive < 2
            && self.drives[drive]
                .geometry
                .is_some_and(|g| {
                    self.drives[drive].cylinder == self.drives[drive].seek_destination
                        && self.drives[drive].cylinder < g.tracks
                });
        if at_destination {
            self.fake_track_change(disks, drive);
            self.finish_seek(disks, drive, true);
            self.check_finish_timing(drive);
        }
    }

    /// Arm the half-second spin used when a command errors without
    /// moving data.
    pub(crate) fn start_error_timing(&mut self, drive: usize) {
        self.step = CommandStep::Data;
        self.arm_timer(drive, crate::ERROR_TIMING_NS);
        self.dma_pending = 0;
    }

    /// Common "no medium" failure: latch missing-address-mark status
    /// and lock up until the next reset.
    pub(crate) fn no_media_lockup(&mut self, drive: usize) {
        self.step = CommandStep::Locked;
        self.st0 = 0x40
            | (self.st0 & 0x30)
            | drive as u8
            | (self.drives[drive].physical_head << 2);
        self.st1 = 0x05; // Missing address mark + no data
        self.st2 = 0x01;
        self.result_pos = 0;
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = if self.command[0] & 0x1F == FORMAT_TRACK {
            self.command[2]
        } else {
            self.command[5]
        };
        self.dma_pending = 0;
    }

}
