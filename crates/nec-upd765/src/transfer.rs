//! Execution-phase machinery: sector reads and writes, track formats,
//! READ ID, VERIFY and the scan commands.
//!
//! Flat images (raw, dynamic) are addressed by LBA math over the drive
//! geometry. DSK and IMD media are addressed like the real surface: the
//! track's sector list is scanned from the last position of the index
//! hole, matching ID fields and honouring data marks, for at most two
//! revolutions.

use disk_io::DiskRouter;
use format_imd::DataMark;

use crate::commands::{
    self, FORMAT_TRACK, READ_TRACK, ST1_MEDIA_EJECTED, ST2_MEDIA_EJECTED, WRITE_DATA,
    WRITE_DELETED_DATA,
};
use crate::{CommandStep, Fdc};

/// Outcome of advancing to the next sector of a multi-sector transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SectorAdvance {
    Finished,
    Continue,
    Error,
}

impl Fdc {
    #[must_use]
    fn sector_size_bytes(code: u8) -> usize {
        128usize << code.min(7)
    }

    // -------------------------------------------------------------------
    // Data phase scaffolding
    // -------------------------------------------------------------------

    /// Non-DMA transfers interrupt per byte when Specify asked for it.
    pub(crate) fn data_ready(&mut self) {
        let drive = self.selected_drive();
        if self.drives[drive].specify[1] & 1 != 0 {
            self.raise_irq();
        }
    }

    /// Enter the data phase for the running command.
    pub(crate) fn start_data(&mut self, drive: usize) {
        self.data_pos = 0;
        match self.command[0] & 0x1F {
            commands::SCAN_EQUAL | commands::SCAN_LOW_OR_EQUAL | commands::SCAN_HIGH_OR_EQUAL => {
                // Matching until proven otherwise.
                self.st2 = (self.st2 & !0x04) | 0x08;
            }
            _ => {}
        }
        self.step = CommandStep::Data;
        if matches!(
            self.command[0] & 0x1F,
            commands::VERIFY | commands::READ_ID
        ) {
            // No data moves; the revolution is simulated on the timer.
            self.supports_rate(drive);
            self.dma_rate = self.dma_rate_pending;
            if self.erroring & (1 << drive) == 0 {
                self.arm_timer(drive, self.dma_rate);
            } else {
                self.arm_timer(drive, crate::ERROR_TIMING_NS / self.data_size.max(1) as f64);
            }
            self.dma_pending = 0;
        } else if self.use_dma() {
            self.dma_pending = 1;
            self.supports_rate(drive);
            self.dma_rate = self.dma_rate_pending;
            if self.drives[drive].active_command & 0x1F == FORMAT_TRACK {
                // Four ID bytes stand in for a whole formatted sector.
                self.dma_rate *= 128.0;
            }
            self.data_ready();
        } else {
            self.dma_pending = 0;
            self.data_ready();
        }
    }

    /// TC for the running transfer: the DMA line, or the natural end of
    /// the track in non-DMA mode.
    fn transfer_complete(&self, drive: usize, eot: u8) -> bool {
        if self.use_dma() {
            return self.tc;
        }
        self.data_pos == self.data_size
            && self.drives[drive].sector == eot
            && self.drives[drive].head == u8::from(self.mt)
    }

    /// Advance the running transfer to the next sector, handling the
    /// end-of-track / multi-track / terminal-count interplay.
    pub(crate) fn increase_sector(&mut self, drive: usize, eot: u8, is_format: bool) -> SectorAdvance {
        let use_mt = self.mt && self.mt_mask;
        self.drives[drive].sector += 1;
        let more = !self.transfer_complete(drive, eot);

        let spt = self.drives[drive].geometry.map_or(0, |g| g.spt);
        let overflowed = (self.drives[drive].sector > spt && !is_format)
            || (self.drives[drive].sector > eot && !(use_mt && self.use_dma()));
        let mut track_done = false;
        if overflowed {
            self.drives[drive].sector = 1;
            if use_mt {
                self.result[4] = self.drives[drive].head;
                self.drives[drive].head ^= 1;
                self.drives[drive].physical_head ^= 1;
                if self.drives[drive].head == 0 {
                    // Last sector of side 1: the operation is complete.
                    track_done = true;
                    self.result[3] = self.drives[drive].cylinder + 1;
                    self.result[4] = self.drives[drive].head;
                } else {
                    self.result[3] = self.drives[drive].cylinder;
                }
            } else {
                track_done = true;
                self.result[3] = self.drives[drive].cylinder + 1;
                self.result[4] = self.drives[drive].head;
            }
        } else {
            self.result[3] = self.drives[drive].cylinder;
            self.result[4] = self.drives[drive].head;
        }

        self.st0 = (self.st0 & !0x04) | ((self.drives[drive].physical_head & 1) << 2);
        self.sectors_transferred += 1;

        if self.use_dma() {
            if more {
                if !track_done {
                    return SectorAdvance::Continue;
                }
                if self.drives[drive].active_command & 0x1F == FORMAT_TRACK {
                    return SectorAdvance::Finished;
                }
                // EOT passed but terminal count never came.
                self.st0 = (self.st0 & !0xC0) | 0x40;
                self.st1 |= 0x80; // End of cylinder
                return SectorAdvance::Error;
            }
            SectorAdvance::Finished
        } else if track_done {
            SectorAdvance::Finished
        } else {
            SectorAdvance::Continue
        }
    }

    // -------------------------------------------------------------------
    // Read sector
    // -------------------------------------------------------------------

    /// Set up and start a sector read (also the scan and read-track
    /// entry).
    pub(crate) fn read_sector(&mut self, disks: &mut DiskRouter) {
        let drive = self.selected_drive();
        self.erroring &= !(1 << drive);

        if self.drives[drive].geometry.is_none() || !self.drive_mounted(disks, drive) {
            self.no_media_lockup(drive);
            return;
        }

        self.data_size = Self::sector_size_bytes(self.command[5]);
        if self.command[5] == 0 {
            // N=0: DTL gives the byte count.
            self.data_size = usize::from(self.command[8]).max(1);
        }
        let lba = self.chs_to_lba(
            drive,
            self.drives[drive].physical_head,
            self.drives[drive].physical_cylinder,
            self.drives[drive].sector,
        );
        self.disk_start_pos = u64::from(lba) * self.data_size as u64;

        if !self.motor_on(drive) {
            self.fill_st0(drive);
            self.st0 = (self.st0 & !0x70) | 0x08;
            self.st1 = 0x05;
            self.st2 = 0x01;
            self.erroring |= 1 << drive;
            self.read_sector_fail_result();
            return;
        }

        self.fill_st0(drive);
        self.st0 &= !0xD8; // ready, no unit check, interrupt code 0

        if !self.supports_rate(drive) {
            self.st1 = 0x01;
            self.st2 = 0x01;
            self.read_sector_fail_result();
            return;
        }

        if self.implied_seek_enabled()
            && self.rw_requested_cylinder != self.drives[drive].cylinder
        {
            let destination = self.rw_requested_cylinder;
            self.perform_implicit_seek(disks, destination);
            return;
        }

        self.st1 = 0x04;
        self.st2 = 0x01;
        let slot = Self::slot(drive);
        let size = self.data_size;
        let start = self.disk_start_pos;
        let flat_ok = {
            let buf = &mut self.data[..size];
            disks.read(slot, buf, start)
        };
        if flat_ok {
            if self.drives[drive].eject_pending
                || self.rw_requested_cylinder != self.drives[drive].physical_cylinder
            {
                self.st1 = 0x04;
                self.st2 = 0x01;
                self.read_sector_fail_result();
                return;
            }
            self.st1 &= !0x04;
            self.st2 &= !0x01;
            self.read_id_last_sector = self.drives[drive].sector;
            self.start_data(drive);
        } else if disks.dsk(slot).is_some() || disks.imd(slot).is_some() {
            if self.drives[drive].eject_pending {
                self.st1 = 0x04;
                self.st2 = 0x01;
                self.read_sector_fail_result();
                return;
            }
            self.read_sector_track_media(disks, drive);
        } else {
            self.st1 = 0x04;
            self.st2 = 0x01;
            self.read_sector_fail_result();
        }
    }

    /// Scan a DSK/IMD track for the requested ID field, starting past
    /// the last sector seen and looping to the index hole at most
    /// twice.
    fn read_sector_track_media(&mut self, disks: &mut DiskRouter, drive: usize) {
        let slot = Self::slot(drive);
        let side = self.drives[drive].physical_head;
        let track = self.drives[drive].physical_cylinder;
        let is_read_track = self.command[0] & 0x1F == READ_TRACK;
        let wanted = (
            self.drives[drive].cylinder,
            self.drives[drive].head,
            self.drives[drive].sector,
        );

        let total = if let Some(dsk) = disks.dsk(slot) {
            match dsk.track_info(side, track) {
                Some(info) => u16::from(info.sector_count),
                None => {
                    self.st1 = 0x01;
                    self.st2 = 0x01;
                    self.read_sector_fail_result();
                    return;
                }
            }
        } else if let Some(imd) = disks.imd(slot) {
            match imd.sector_info(track, side, 0) {
                Some(info) => u16::from(info.total_sectors),
                None => {
                    self.st1 = 0x01;
                    self.st2 = 0x01;
                    self.read_sector_fail_result();
                    return;
                }
            }
        } else {
            self.st1 = 0x01;
            self.st2 = 0x01;
            self.read_sector_fail_result();
            return;
        };

        self.st1 = 0x04;
        self.st2 = 0x01;
        if total == 0 {
            self.st2 |= 0x04;
            self.read_sector_fail_result();
            return;
        }

        // Start just past the sector the head last saw.
        let mut start = u16::from(self.read_id_last_sector);
        if start >= total.max(1) - 1 {
            start = 0;
        } else {
            start += 1;
        }

        for pass in 0..2u8 {
            let begin = if pass == 0 { start } else { 0 };
            for index in begin..total {
                if let Some(dsk) = disks.dsk(slot) {
                    let Some(info) = dsk.sector_info(side, track, index as u8) else {
                        continue;
                    };
                    let id_match = (info.r == wanted.2 || is_read_track)
                        && info.h == wanted.1
                        && info.c == wanted.0;
                    if id_match {
                        self.st1 &= !0x04;
                        self.st2 &= !0x01;
                        self.finish_track_read_dsk(disks, drive, index as u8);
                        return;
                    }
                    if !self.scanning_for_sector_id {
                        if info.c != wanted.0 {
                            if info.c == 0xFF {
                                self.st2 |= 0x02; // Bad cylinder
                            }
                            self.st2 |= 0x10; // Wrong cylinder
                        }
                        self.read_id_last_sector = index as u8;
                        self.read_sector_fail_result();
                        return;
                    }
                } else if let Some(imd) = disks.imd(slot) {
                    let Some(info) = imd.sector_info(track, side, index as u8) else {
                        continue;
                    };
                    let id_match = (info.sector_id == wanted.2 || is_read_track)
                        && info.head_id == wanted.1
                        && info.cylinder_id == wanted.0;
                    if id_match {
                        if info.mark == DataMark::Unavailable {
                            continue;
                        }
                        self.st1 &= !0x04;
                        self.st2 &= !0x01;
                        self.finish_track_read_imd(disks, drive, index as u8);
                        return;
                    }
                    if !self.scanning_for_sector_id {
                        if info.cylinder_id != wanted.0 {
                            if info.cylinder_id == 0xFF {
                                self.st2 |= 0x02;
                            }
                            self.st2 |= 0x10;
                        }
                        self.read_id_last_sector = index as u8;
                        self.read_sector_fail_result();
                        return;
                    }
                }
            }
            self.read_id_last_sector = (total - 1) as u8;
        }

        // Two revolutions without a match.
        self.scanning_for_sector_id = false;
        self.st1 |= 0x04;
        self.st2 |= 0x04;
        self.read_sector_fail_result();
    }

    fn finish_track_read_dsk(&mut self, disks: &mut DiskRouter, drive: usize, index: u8) {
        let slot = Self::slot(drive);
        let side = self.drives[drive].physical_head;
        let track = self.drives[drive].physical_cylinder;
        let size_code = self.command[5];
        let Some(dsk) = disks.dsk(slot) else {
            self.read_sector_fail_result();
            return;
        };
        match dsk.read_sector_data(side, track, index, size_code, &mut self.data) {
            Some(len) => {
                self.data_size = len;
                if let Some(info) = dsk.sector_info(side, track, index) {
                    // The recorded status bits ride along (weak sectors,
                    // CRC errors kept by the imaging tool).
                    self.st1 = info.st1;
                    self.st2 = info.st2;
                }
                self.read_id_last_sector = index;
                self.scanning_for_sector_id = false;
                self.start_data(drive);
            }
            None => {
                self.st1 = 0x04;
                self.st2 = 0x01;
                self.read_sector_fail_result();
            }
        }
    }

    fn finish_track_read_imd(&mut self, disks: &mut DiskRouter, drive: usize, index: u8) {
        let slot = Self::slot(drive);
        let side = self.drives[drive].physical_head;
        let track = self.drives[drive].physical_cylinder;
        let Some(imd) = disks.imd(slot) else {
            self.read_sector_fail_result();
            return;
        };
        let Some(info) = imd.sector_info(track, side, index) else {
            self.st1 |= 0x04;
            self.st2 |= 0x01;
            self.read_sector_fail_result();
            return;
        };
        if info.mark.is_deleted() && self.skip_deleted {
            // Skip deleted data and keep scanning from here.
            self.read_id_last_sector = index;
            self.st1 |= 0x04;
            self.st2 |= 0x01;
            self.read_sector_fail_result();
            return;
        }
        match imd.read_sector(track, side, index, &mut self.data) {
            Some(len) => {
                self.data_size = len;
                if info.mark.is_deleted() != self.datamark_deleted {
                    // Other mark than asked for: transfer, then abort.
                    self.st1 |= 0x40;
                    self.abort_after_data = true;
                }
                if info.mark.is_data_error() {
                    self.st1 |= 0x20;
                    self.abort_after_data = true;
                }
                self.read_id_last_sector = index;
                self.scanning_for_sector_id = false;
                self.start_data(drive);
            }
            None => {
                self.st1 |= 0x04;
                self.st2 |= 0x01;
                self.read_sector_fail_result();
            }
        }
    }

    /// Enter the failed-read result phase (or the half-second error
    /// spin when the failure is mechanical).
    pub(crate) fn read_sector_fail_result(&mut self) {
        let drive = self.selected_drive();
        self.scanning_for_sector_id = false;
        self.result_pos = 0;
        self.fill_st0(drive);
        self.st0 = 0x40 | (self.st0 & 0x3B) | drive as u8 | ((self.drives[drive].physical_head & 1) << 2);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[2];
        if self.erroring & (1 << drive) == 0 {
            self.step = CommandStep::Result;
            self.raise_irq();
        } else {
            self.start_error_timing(drive);
        }
    }

    /// A full read buffer was drained: move on or finish.
    pub(crate) fn execute_read_data(&mut self, disks: &mut DiskRouter) {
        let drive = self.selected_drive();
        match self.increase_sector(drive, self.command[6], false) {
            SectorAdvance::Continue => {
                if !self.abort_after_data {
                    self.read_sector(disks);
                    return;
                }
            }
            SectorAdvance::Error => {}
            SectorAdvance::Finished => {
                self.st0 &= !0xC8; // normal termination, ready
            }
        }
        self.abort_after_data = false;
        self.result_pos = 0;
        self.fill_st0(drive);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[5];
        self.step = CommandStep::Result;
        self.raise_irq();
    }

    // -------------------------------------------------------------------
    // Write sector
    // -------------------------------------------------------------------

    /// Set up and start a sector write: the data phase runs first, the
    /// medium is touched once the buffer is full.
    pub(crate) fn write_sector(&mut self, disks: &mut DiskRouter) {
        let drive = self.selected_drive();
        self.data_size = Self::sector_size_bytes(self.command[5]);
        if self.command[5] == 0 {
            self.data_size = usize::from(self.command[8]).max(1);
        }
        let lba = self.chs_to_lba(
            drive,
            self.drives[drive].physical_head,
            self.drives[drive].physical_cylinder,
            self.drives[drive].sector,
        );
        self.disk_start_pos = u64::from(lba) * self.data_size as u64;
        self.erroring &= !(1 << drive);

        if !self.motor_on(drive) {
            self.fill_st0(drive);
            self.st0 = (self.st0 & !0x70) | 0x08;
            self.st1 = 0x01;
            self.st2 = 0x01;
            self.write_sector_fail_result();
            return;
        }
        if self.drives[drive].geometry.is_none() || !self.drive_mounted(disks, drive) {
            self.no_media_lockup(drive);
            return;
        }
        if !self.supports_rate(drive) {
            self.st1 = 0x01;
            self.st2 = 0x01;
            self.write_sector_fail_result();
            return;
        }
        self.fill_st0(drive);
        self.st0 &= !0xD8;
        if self.drives[drive].eject_pending {
            self.st1 = 0x04;
            self.st2 = 0x01;
            self.write_sector_fail_result();
            return;
        }
        if self.implied_seek_enabled()
            && self.rw_requested_cylinder != self.drives[drive].cylinder
        {
            let destination = self.rw_requested_cylinder;
            self.perform_implicit_seek(disks, destination);
            return;
        }
        self.start_data(drive);
    }

    pub(crate) fn write_sector_fail_result(&mut self) {
        let drive = self.selected_drive();
        self.st0 = (self.st0 & !0xC0) | 0x40;
        self.result_pos = 0;
        self.fill_st0(drive);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[5];
        self.erroring |= 1 << drive;
        self.start_error_timing(drive);
    }

    /// The write buffer is full: commit it to the medium.
    pub(crate) fn execute_write_data(&mut self, disks: &mut DiskRouter) {
        let drive = self.selected_drive();
        self.erroring &= !(1 << drive);

        if self.drives[drive].geometry.is_none() || !self.drive_mounted(disks, drive) {
            self.no_media_lockup(drive);
            return;
        }
        if !self.supports_rate(drive) {
            self.st1 = 0x01;
            self.st2 = 0x01;
            self.write_error_result();
            return;
        }
        if self.drives[drive].eject_pending {
            self.st1 = 0x04;
            self.st2 = 0x01;
            self.write_error_result();
            return;
        }

        let slot = Self::slot(drive);
        let size = self.data_size;
        let start = self.disk_start_pos;
        let flat_ok = {
            let buf = &self.data[..size];
            disks.write(slot, buf, start)
        };
        if flat_ok {
            if self.rw_requested_cylinder != self.drives[drive].physical_cylinder {
                self.st1 = 0x04;
                self.st2 = 0x01;
                self.write_error_result();
                return;
            }
            self.update_write_protected(disks, true, drive);
            self.read_id_last_sector = self.drives[drive].sector;
            self.write_advance_or_finish(disks, drive);
        } else if self.drive_read_only(disks, drive) {
            // Read-only medium: classic write-protect result.
            self.update_write_protected(disks, true, drive);
            self.result_pos = 0;
            self.st0 = 0x40 | (self.st0 & 0x3B) | drive as u8 | ((self.drives[drive].physical_head & 1) << 2);
            self.st1 = 0x27;
            self.st2 = 0x31;
            self.result[0] = self.st0;
            self.result[1] = self.st1;
            self.result[2] = self.st2;
            self.result[3] = self.drives[drive].cylinder;
            self.result[4] = self.drives[drive].head;
            self.result[5] = self.drives[drive].sector;
            self.result[6] = self.command[5];
            self.step = CommandStep::Result;
            self.raise_irq();
        } else {
            // Track-addressed media: locate the ID on the track.
            self.update_write_protected(disks, true, drive);
            self.st1 = 0x04;
            self.st2 = 0x01;
            self.write_track_media(disks, drive);
        }
    }

    fn write_track_media(&mut self, disks: &mut DiskRouter, drive: usize) {
        let slot = Self::slot(drive);
        let side = self.drives[drive].physical_head;
        let track = self.drives[drive].physical_cylinder;
        let wanted = (
            self.drives[drive].cylinder,
            self.drives[drive].head,
            self.drives[drive].sector,
        );

        let total = if let Some(dsk) = disks.dsk(slot) {
            match dsk.track_info(side, track) {
                Some(info) => u16::from(info.sector_count),
                None => {
                    self.st1 = 0x01;
                    self.write_error_result();
                    return;
                }
            }
        } else if let Some(imd) = disks.imd(slot) {
            match imd.sector_info(track, side, 0) {
                Some(info) => u16::from(info.total_sectors),
                None => {
                    self.st1 = 0x01;
                    self.write_error_result();
                    return;
                }
            }
        } else {
            self.write_error_result();
            return;
        };

        for index in 0..total {
            if let Some(dsk) = disks.dsk(slot) {
                let Some(info) = dsk.sector_info(side, track, index as u8) else {
                    continue;
                };
                if info.r == wanted.2 && info.h == wanted.1 && info.c == wanted.0 {
                    self.st1 &= !0x05;
                    self.st2 &= !0x01;
                    self.read_id_last_sector = index as u8;
                    let size = self.data_size;
                    let size_code = self.command[5];
                    let data = &self.data[..size];
                    let ok = disks
                        .dsk(slot)
                        .is_some_and(|d| d.write_sector_data(side, track, index as u8, size_code, data));
                    if ok {
                        self.write_advance_or_finish(disks, drive);
                    } else {
                        self.st1 = 0x04;
                        self.st2 = 0x01;
                        self.write_error_result();
                    }
                    return;
                }
            } else if let Some(imd) = disks.imd(slot) {
                let Some(info) = imd.sector_info(track, side, index as u8) else {
                    continue;
                };
                if info.sector_id == wanted.2
                    && info.head_id == wanted.1
                    && info.cylinder_id == wanted.0
                    && info.mark != DataMark::Unavailable
                {
                    self.st1 &= !0x05;
                    self.st2 &= !0x01;
                    self.read_id_last_sector = index as u8;
                    let size = self.data_size;
                    let deleted = self.datamark_deleted;
                    let data = self.data[..size].to_vec();
                    let ok = disks
                        .imd(slot)
                        .is_some_and(|d| d.write_sector(track, side, index as u8, deleted, &data));
                    if ok {
                        self.write_advance_or_finish(disks, drive);
                    } else {
                        self.st1 = 0x04;
                        self.st2 = 0x01;
                        self.write_error_result();
                    }
                    return;
                }
            }
        }
        self.st1 |= 0x04;
        self.st2 |= 0x04;
        self.write_error_result();
    }

    fn write_advance_or_finish(&mut self, disks: &mut DiskRouter, drive: usize) {
        match self.increase_sector(drive, self.command[6], false) {
            SectorAdvance::Continue => {
                self.write_sector(disks);
                return;
            }
            SectorAdvance::Error => {}
            SectorAdvance::Finished => {
                self.st1 = 0;
                self.st2 = 0;
                self.st0 &= !0xC8;
            }
        }
        self.result_pos = 0;
        self.fill_st0(drive);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[5];
        self.step = CommandStep::Result;
        self.raise_irq();
    }

    /// Failed write path shared by the media scan: error bit, result
    /// phase.
    fn write_error_result(&mut self) {
        let drive = self.selected_drive();
        self.st0 |= 0x40;
        self.result_pos = 0;
        self.result[0] = (self.st0 & 0x3B) | 0x40 | drive as u8 | ((self.drives[drive].physical_head & 1) << 2);
        self.st0 = self.result[0];
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[5];
        self.step = CommandStep::Result;
        self.raise_irq();
    }

    // -------------------------------------------------------------------
    // Data phase completion
    // -------------------------------------------------------------------

    /// The data buffer filled or drained; dispatch on the command.
    pub(crate) fn execute_data(&mut self, disks: &mut DiskRouter) {
        let drive = self.selected_drive();
        match self.command[0] & 0x1F {
            WRITE_DATA | WRITE_DELETED_DATA => {
                if self.drives[drive].eject_pending {
                    self.media_ejected_result(drive, 0x50);
                    return;
                }
                if self.data_pos == self.data_size {
                    self.execute_write_data(disks);
                } else {
                    self.short_transfer_result(drive);
                }
            }
            READ_TRACK | commands::READ_DATA | commands::READ_DELETED_DATA
            | commands::SCAN_EQUAL | commands::SCAN_LOW_OR_EQUAL | commands::SCAN_HIGH_OR_EQUAL
            | commands::VERIFY => {
                if self.drives[drive].eject_pending {
                    self.media_ejected_result(drive, 0x50);
                    return;
                }
                if self.data_pos == self.data_size {
                    self.execute_read_data(disks);
                } else {
                    self.short_transfer_result(drive);
                }
            }
            FORMAT_TRACK => {
                if self.drives[drive].eject_pending {
                    self.media_ejected_result(drive, 0x50);
                    return;
                }
                self.update_write_protected(disks, true, drive);
                self.format_sector(disks, false);
            }
            _ => {
                self.step = CommandStep::Error;
                self.st0 = 0x80 | (self.st0 & 0x30) | drive as u8 | (self.drives[drive].physical_head << 2);
                self.dma_pending = 0;
                self.raise_irq();
            }
        }
    }

    fn media_ejected_result(&mut self, drive: usize, st0_extra: u8) {
        self.result_pos = 0;
        self.st0 = st0_extra | (self.st0 & 0x3B) | drive as u8 | ((self.drives[drive].physical_head & 1) << 2);
        self.st1 = ST1_MEDIA_EJECTED;
        self.st2 = ST2_MEDIA_EJECTED;
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[5];
        self.step = CommandStep::Result;
        self.raise_irq();
    }

    /// A transfer ended with an unfinished buffer (early TC).
    fn short_transfer_result(&mut self, drive: usize) {
        self.result_pos = 0;
        self.st0 = (self.st0 & 0x3B) | drive as u8 | ((self.drives[drive].physical_head & 1) << 2);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[5];
        self.step = CommandStep::Result;
        self.raise_irq();
    }

    // -------------------------------------------------------------------
    // Scan comparison
    // -------------------------------------------------------------------

    /// Compare one disk byte with one CPU byte for the scan commands.
    pub(crate) fn scan_byte(&mut self, fdc_byte: u8, cpu_byte: u8) {
        if self.st2 & 0x0C != 0x08 {
            return; // Already mismatched
        }
        if fdc_byte == cpu_byte || fdc_byte == 0xFF || cpu_byte == 0xFF {
            return;
        }
        match self.command[0] & 0x1F {
            commands::SCAN_EQUAL => {
                self.st2 = (self.st2 & !0x08) | 0x04;
            }
            commands::SCAN_LOW_OR_EQUAL => {
                if fdc_byte > cpu_byte {
                    self.st2 = (self.st2 & !0x08) | 0x04;
                } else {
                    self.st2 &= !0x08;
                }
            }
            commands::SCAN_HIGH_OR_EQUAL => {
                if fdc_byte < cpu_byte {
                    self.st2 = (self.st2 & !0x08) | 0x04;
                } else {
                    self.st2 &= !0x08;
                }
            }
            _ => {}
        }
    }

    // -------------------------------------------------------------------
    // VERIFY / READ ID ticks
    // -------------------------------------------------------------------

    /// VERIFY walks the sector on the timer without moving data.
    pub(crate) fn verify_tick(&mut self, disks: &mut DiskRouter, drive: usize) {
        self.data_pos += 1;
        if self.data_pos >= self.data_size.max(1) {
            self.stop_timer(drive);
            self.execute_data(disks);
        }
    }

    /// READ ID finishes once the simulated sector has passed the head.
    pub(crate) fn read_id_tick(&mut self, drive: usize) {
        self.data_pos += 1;
        if self.data_pos < self.data_size.max(1) {
            return;
        }
        self.stop_timer(drive);
        self.result_pos = 0;
        if self.read_id_error {
            self.st0 |= 0x40;
            self.st1 |= 0x05;
            self.result[3] = self.drives[drive].physical_cylinder;
            self.result[4] = self.drives[drive].head;
            self.result[5] = self.drives[drive].sector;
        }
        let id_drive = self.read_id_drive;
        self.fill_st0(id_drive);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.step = CommandStep::Result;
        self.raise_irq();
    }

    /// READ ID: report the next ID field passing the head.
    pub(crate) fn read_id(&mut self, disks: &mut DiskRouter) {
        let drive = (self.command[1] & 3) as usize;
        self.drives[drive].physical_head = (self.command[1] & 4) >> 2;
        self.drives[drive].head = (self.command[1] & 4) >> 2;
        self.drives[drive].active_command = commands::READ_ID;
        self.erroring &= !(1 << drive);
        self.read_id_drive = drive;
        self.read_id_error = false;
        self.data_size = 0x200;

        if self.drives[drive].geometry.is_none() || !self.drive_mounted(disks, drive) {
            self.no_media_lockup(self.selected_drive());
            return;
        }
        self.rw_requested_cylinder = self.drives[drive].cylinder;
        if !self.supports_rate(drive) || !self.motor_on(drive) {
            self.st1 = 0x05;
            self.st2 = 0x01;
            self.read_id_error = true;
            self.start_data(drive);
            return;
        }

        self.st0 = 0;
        self.update_geometry(
            disks,
            drive,
            self.drives[drive].physical_head,
            self.drives[drive].physical_cylinder,
        );
        self.fill_st0(drive);

        let slot = Self::slot(drive);
        let side = self.drives[drive].physical_head;
        let track = self.drives[drive].physical_cylinder;
        if disks.dsk(slot).is_some() || disks.imd(slot).is_some() {
            let total = if let Some(dsk) = disks.dsk(slot) {
                dsk.track_info(side, track).map(|t| u16::from(t.sector_count))
            } else {
                disks
                    .imd(slot)
                    .and_then(|imd| imd.sector_info(track, side, 0))
                    .map(|s| u16::from(s.total_sectors))
            };
            let Some(total) = total else {
                self.st1 = 0x04;
                self.st2 = 0;
                self.result[6] = 0;
                self.read_id_error = true;
                self.start_data(drive);
                return;
            };
            self.st1 = 0;
            self.st2 = 0;
            if total == 0 {
                self.st1 = 0x04;
                self.st2 |= 0x04;
                self.result[6] = 0;
                self.read_id_error = true;
                self.start_data(drive);
                return;
            }
            // The next sector under the head, wrapping at the index.
            let mut index = u16::from(self.read_id_last_sector) + 1;
            if index >= total {
                index = 0;
            }
            let mut found = None;
            for probe in 0..total {
                let slot_index = ((index + probe) % total) as u8;
                if let Some(dsk) = disks.dsk(slot) {
                    if let Some(info) = dsk.sector_info(side, track, slot_index) {
                        found = Some((slot_index, info.c, info.h, info.r, info.n));
                        break;
                    }
                } else if let Some(imd) = disks.imd(slot) {
                    if let Some(info) = imd.sector_info(track, side, slot_index) {
                        if info.mark == DataMark::Unavailable {
                            continue;
                        }
                        let n = sector_size_to_code(info.sector_size);
                        found =
                            Some((slot_index, info.cylinder_id, info.head_id, info.sector_id, n));
                        break;
                    }
                }
            }
            match found {
                Some((slot_index, c, h, r, n)) => {
                    self.read_id_last_sector = slot_index;
                    self.result[3] = c;
                    self.result[4] = h;
                    self.result[5] = r;
                    self.result[6] = n;
                }
                None => {
                    self.st1 = 0x04;
                    self.st2 |= 0x04;
                    self.result[6] = 0;
                    self.read_id_error = true;
                }
            }
            self.start_data(drive);
            return;
        }

        // Flat media: IDs march in order as the disk turns.
        self.st1 = 0;
        self.st2 = 0;
        self.update_st3(disks, drive);
        let spt = self.drives[drive].geometry.map_or(0, |g| g.spt);
        if self.read_id_last_sector == 0 || self.read_id_last_sector > spt {
            self.read_id_last_sector = 1;
        } else if self.read_id_last_sector < spt {
            self.read_id_last_sector += 1;
        } else {
            self.read_id_last_sector = 1;
        }
        let in_range = self.drives[drive].geometry.is_some_and(|g| {
            let lba = self.chs_to_lba(drive, side, track, self.read_id_last_sector);
            u64::from(lba) * 512 < u64::from(g.kb) * 1024
        });
        if !in_range {
            self.read_id_error = true;
            self.start_data(drive);
            return;
        }
        self.result[3] = self.drives[drive].physical_cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.read_id_last_sector;
        self.result[6] = 2;
        self.start_data(drive);
    }

    // -------------------------------------------------------------------
    // Format track
    // -------------------------------------------------------------------

    /// FORMAT TRACK setup: validate the drive, then collect four ID
    /// bytes per sector through the data phase.
    pub(crate) fn format_track_start(&mut self, disks: &mut DiskRouter) {
        let drive = (self.command[1] & 3) as usize;
        self.rw_requested_cylinder = self.drives[drive].physical_cylinder;
        self.drives[drive].physical_head = (self.command[1] & 4) >> 2;
        self.drives[drive].active_command = FORMAT_TRACK;
        self.drives[drive].head = (self.command[1] & 4) >> 2;
        self.drives[drive].sector = 1;
        self.drives[drive].format_sector_index = 0;
        self.update_geometry(
            disks,
            drive,
            self.drives[drive].physical_head,
            self.drives[drive].physical_cylinder,
        );

        if !self.motor_on(drive) {
            self.fill_st0(drive);
            self.st0 = (self.st0 & !0x70) | 0x08;
            self.st1 = 0x01;
            self.st2 = 0x01;
            self.format_error_result(drive);
            return;
        }
        if self.drives[drive].geometry.is_none() || !self.drive_mounted(disks, drive) {
            self.no_media_lockup(self.selected_drive());
            return;
        }
        let spt = self.drives[drive].geometry.map_or(0, |g| g.spt);
        let is_imd = disks.imd(Self::slot(drive)).is_some();
        if self.command[3] != spt && !is_imd {
            self.no_media_lockup(drive);
            return;
        }
        self.fill_st0(drive);
        self.st0 &= !0xD8;
        self.st1 = 0;
        self.st2 = 0;

        let is_track_media = is_imd || disks.dsk(Self::slot(drive)).is_some();
        if !is_track_media && self.command[2] != 0x02 {
            // Flat images only hold 512-byte sectors.
            self.no_media_lockup(drive);
            return;
        }
        self.data_size = 4;
        self.start_data(drive);

        if self.command[3] == 0 {
            // No sectors at all: wait one revolution for the index
            // pulse, then finish empty-handed.
            self.dma_pending |= 2;
            self.supports_rate(drive);
            self.arm_timer(drive, self.dma_rate_pending * 512.0);
        }
    }

    /// One sector's worth of format data (C, H, R, N) has arrived.
    pub(crate) fn format_sector(&mut self, disks: &mut DiskRouter, no_data: bool) {
        let drive = self.selected_drive();
        self.sectors_transferred += 1;
        self.erroring &= !(1 << drive);

        if self.drives[drive].geometry.is_none() || !self.drive_mounted(disks, drive) {
            self.no_media_lockup(drive);
            return;
        }
        if !self.supports_rate(drive) {
            self.fill_st0(drive);
            self.st0 = (self.st0 & !0x30) | 0x08 | 0x40;
            self.st1 = 0x05;
            self.st2 = 0x01;
            self.erroring |= 1 << drive;
            self.format_error_result(drive);
            return;
        }
        if self.drive_read_only(disks, drive) {
            self.format_read_only_result(disks, drive);
            return;
        }

        if !no_data {
            let slot = Self::slot(drive);
            let side = self.drives[drive].physical_head;
            let track = self.drives[drive].physical_cylinder;
            let header = [self.data[0], self.data[1], self.data[2], self.data[3]];

            if disks.dsk(slot).is_some() {
                let index = self.drives[drive].sector.wrapping_sub(1);
                let Some(info) = disks
                    .dsk(slot)
                    .and_then(|d| d.sector_info(side, track, index))
                else {
                    self.st1 = 0x05;
                    self.st2 = 0x01;
                    self.format_error_result(drive);
                    return;
                };
                self.read_id_last_sector = index;
                if info.c != header[0]
                    || info.h != header[1]
                    || info.r != header[2]
                    || info.n != header[3]
                    || self.command[2] != header[3]
                {
                    self.st1 = 0x05;
                    self.st2 = 0x01;
                    self.format_error_result(drive);
                    return;
                }
                if self.drives[drive].eject_pending {
                    self.st1 = 0x05;
                    self.st2 = 0x01;
                    self.format_error_result(drive);
                    return;
                }
                let fill = self.command[5];
                let size = Self::sector_size_bytes(info.n).min(self.data.len());
                self.data[..size].fill(fill);
                let data = self.data[..size].to_vec();
                let ok = disks
                    .dsk(slot)
                    .is_some_and(|d| d.write_sector_data(side, track, index, header[3], &data));
                self.update_write_protected(disks, true, drive);
                if !ok {
                    self.st1 = 0x05;
                    self.st2 = 0x01;
                    self.format_error_result(drive);
                    return;
                }
            } else if disks.imd(slot).is_some() {
                // Collect the header; the track is rewritten at the end.
                let offset = usize::from(self.drives[drive].format_sector_index) << 2;
                if offset + 4 <= self.format_scratch.len() {
                    self.format_scratch[offset..offset + 4].copy_from_slice(&header);
                }
                self.update_write_protected(disks, true, drive);
            } else {
                // Flat image: the header must name the physical sector.
                self.read_id_last_sector = self.drives[drive].sector;
                if header[0] != self.drives[drive].physical_cylinder
                    || header[1] != self.drives[drive].physical_head
                    || header[2] != self.drives[drive].sector
                    || header[3] != 0x02
                    || self.command[2] != 0x02
                {
                    self.st1 = 0x05;
                    self.st2 = 0x01;
                    self.format_error_result(drive);
                    return;
                }
                if self.drives[drive].eject_pending {
                    self.st1 = 0x05;
                    self.st2 = 0x01;
                    self.format_error_result(drive);
                    return;
                }
                let fill = self.command[5];
                self.data[..512].fill(fill);
                let lba = self.chs_to_lba(drive, side, track, self.drives[drive].sector);
                let data = self.data[..512].to_vec();
                let ok = disks.write(slot, &data, u64::from(lba) << 9);
                self.update_write_protected(disks, true, drive);
                if !ok {
                    if disks.write_was_read_only(slot) {
                        self.format_read_only_result(disks, drive);
                        return;
                    }
                    self.st1 = 0x05;
                    self.st2 = 0x01;
                    self.format_error_result(drive);
                    return;
                }
            }
            self.drives[drive].format_sector_index += 1;
        }

        self.st0 = (self.st0 & !0x04) | ((self.drives[drive].physical_head & 1) << 2);
        match self.increase_sector(drive, self.command[3], true) {
            SectorAdvance::Continue => {
                self.start_data(drive);
                return;
            }
            SectorAdvance::Error => {}
            SectorAdvance::Finished => {
                let slot = Self::slot(drive);
                if disks.imd(slot).is_some() {
                    // All headers collected: rewrite the whole track.
                    if self.drives[drive].eject_pending || self.drive_read_only(disks, drive) {
                        self.format_read_only_result(disks, drive);
                        return;
                    }
                    let count = usize::from(self.drives[drive].format_sector_index);
                    let mut ids = Vec::with_capacity(count);
                    for i in 0..count {
                        let o = i << 2;
                        ids.push((
                            self.format_scratch[o],
                            self.format_scratch[o + 1],
                            self.format_scratch[o + 2],
                            self.format_scratch[o + 3],
                        ));
                    }
                    let mode = format_imd::TrackMode {
                        mfm: self.mfm,
                        rate: match self.ccr & 3 {
                            0 => 0,
                            1 => 1,
                            _ => 2,
                        },
                    };
                    let side = self.drives[drive].physical_head;
                    let track = self.drives[drive].physical_cylinder;
                    let fill = self.command[5];
                    let size_code = self.command[2];
                    let ok = disks.imd(slot).is_some_and(|d| {
                        d.format_track(track, side, mode, fill, size_code, &ids)
                    });
                    self.update_write_protected(disks, true, drive);
                    if !ok {
                        self.st1 = 0x05;
                        self.st2 = 0x01;
                        self.format_error_result(drive);
                        return;
                    }
                }
                self.st1 = 0;
                self.st2 = 0;
                self.st0 &= !0xC8;
            }
        }

        self.result_pos = 0;
        self.step = CommandStep::Result;
        self.fill_st0(drive);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[2];
        self.raise_irq();
    }

    fn format_error_result(&mut self, drive: usize) {
        self.result_pos = 0;
        self.fill_st0(drive);
        self.st0 = 0x40 | (self.st0 & 0x3B) | 0x10 | drive as u8 | ((self.drives[drive].physical_head & 1) << 2);
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[2];
        if self.erroring & (1 << drive) == 0 {
            self.step = CommandStep::Result;
            self.raise_irq();
        } else {
            self.start_error_timing(drive);
        }
    }

    fn format_read_only_result(&mut self, disks: &mut DiskRouter, drive: usize) {
        self.update_write_protected(disks, true, drive);
        self.result_pos = 0;
        self.fill_st0(drive);
        self.st0 = 0x40 | (self.st0 & 0x3B) | drive as u8 | ((self.drives[drive].physical_head & 1) << 2);
        self.st1 = 0x27;
        self.st2 = 0x31;
        self.result[0] = self.st0;
        self.result[1] = self.st1;
        self.result[2] = self.st2;
        self.result[3] = self.drives[drive].cylinder;
        self.result[4] = self.drives[drive].head;
        self.result[5] = self.drives[drive].sector;
        self.result[6] = self.command[2];
        self.step = CommandStep::Result;
        self.raise_irq();
    }
}

fn sector_size_to_code(size: u16) -> u8 {
    let mut shifted = size >> 7;
    if shifted == 0 {
        return 0xFF; // Below 128 bytes per sector
    }
    let mut code = 0u8;
    while shifted > 1 {
        shifted >>= 1;
        code += 1;
    }
    code
}
