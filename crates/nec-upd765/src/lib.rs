//! NEC uPD765-class floppy disk controller (82077AA level).
//!
//! The PC controller: DOR, MSR, CCR, DIR and DSR registers at 3F0–3F7,
//! four drives, DMA channel 2 and IRQ 6. Commands move through the
//! classic phases (command byte, parameter bytes, execution, result
//! bytes) with per-drive timers pacing seeks, head
//! settling and sector transfers at the selected data rate.
//!
//! # State machine
//!
//! `commandstep` follows 0 (command) → 1 (parameters) → 2 (data) →
//! 3 (result) → 0, with the error detour 0xFF (serve ST0, then reset)
//! and the lock-up pair 0xFD (serve result, then hang) / 0xFE (hung
//! until reset).
//!
//! The controller owns no media: it addresses the mount slots of a
//! [`DiskRouter`] passed into every port access and tick.

pub mod commands;
pub mod rates;
mod transfer;

use disk_io::{DiskId, DiskRouter};
use emu_core::{NanoTimer, Nanos, Observable, Value};
use rates::FloppyGeometry;

pub const FLOPPY_IRQ: u8 = 6;
pub const FLOPPY_DMA_CHANNEL: u8 = 2;

/// Reset takes 30 µs of wall time before the polling interrupt fires.
const RESET_ACTIVATION_NS: Nanos = 30_000.0;

/// Delay used when a command errors before any data moved: the drive
/// spins for half a second before the error surfaces.
pub(crate) const ERROR_TIMING_NS: Nanos = 500_000_000.0;

/// Host machine flavour; the XT exposes neither DIR/CCR nor DSR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Xt,
    At,
}

/// Command state machine phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandStep {
    /// Waiting for a command byte.
    Command,
    /// Receiving parameter bytes.
    Parameters,
    /// Execution phase: data moves through the data register or DMA.
    Data,
    /// CPU reads result bytes.
    Result,
    /// Serve the result, then lock up.
    ResultThenLock,
    /// Locked up until reset.
    Locked,
    /// Serve ST0 with the error, then return to command phase.
    Error,
}

impl CommandStep {
    /// The register-visible phase encoding.
    #[must_use]
    pub fn code(self) -> u8 {
        match self {
            CommandStep::Command => 0,
            CommandStep::Parameters => 1,
            CommandStep::Data => 2,
            CommandStep::Result => 3,
            CommandStep::ResultThenLock => 0xFD,
            CommandStep::Locked => 0xFE,
            CommandStep::Error => 0xFF,
        }
    }
}

/// Per-drive mechanical and addressing state.
#[derive(Debug, Clone)]
pub(crate) struct DriveState {
    /// The two Specify parameter bytes (SRT/HUT, HLT/ND).
    pub specify: [u8; 2],
    pub head_load_time: Nanos,
    pub head_unload_time: Nanos,
    pub step_rate: Nanos,
    /// The controller's idea of the cylinder (follows SEEK arguments).
    pub cylinder: u8,
    /// Where the head physically sits.
    pub physical_cylinder: u8,
    /// Head number from the ID field of the running command.
    pub head: u8,
    /// Physically selected head (command byte bit 2).
    pub physical_head: u8,
    /// Current sector number (R), 1-based.
    pub sector: u8,
    pub active_command: u8,
    pub seek_destination: u8,
    pub seek_relative: bool,
    pub seek_up: bool,
    pub recalibrate_steps_left: u8,
    /// Sector index being formatted (IMD formats collect a whole track).
    pub format_sector_index: u8,
    pub disk_changed: bool,
    pub eject_pending: bool,
    pub geometry: Option<FloppyGeometry>,
}

impl Default for DriveState {
    fn default() -> Self {
        Self {
            specify: [0; 2],
            head_load_time: 0.0,
            head_unload_time: 0.0,
            step_rate: 0.0,
            cylinder: 0,
            physical_cylinder: 0,
            head: 0,
            physical_head: 0,
            sector: 1,
            active_command: 0,
            seek_destination: 0,
            seek_relative: false,
            seek_up: false,
            recalibrate_steps_left: 0,
            format_sector_index: 0,
            disk_changed: false,
            eject_pending: false,
            geometry: None,
        }
    }
}

/// The controller.
pub struct Fdc {
    arch: Architecture,

    pub(crate) dor: u8,
    pub(crate) msr: u8,
    pub(crate) ccr: u8,
    pub(crate) dir: u8,
    pub(crate) dsr: u8,
    pub(crate) st0: u8,
    pub(crate) st1: u8,
    pub(crate) st2: u8,
    pub(crate) st3: u8,

    /// The three Configure parameters.
    pub(crate) configuration: [u8; 3],
    pub(crate) locked: bool,
    pub(crate) perpendicular: u8,

    pub(crate) step: CommandStep,
    pub(crate) command: [u8; 16],
    pub(crate) command_pos: usize,
    /// Execution-phase transfer buffer, large enough for a full track.
    pub(crate) data: Vec<u8>,
    pub(crate) data_pos: usize,
    pub(crate) data_size: usize,
    /// Collected (C, H, R, N) headers while formatting a track.
    pub(crate) format_scratch: [u8; 0x400],
    pub(crate) result: [u8; 16],
    pub(crate) result_pos: usize,

    /// Byte position on the mounted medium for the running transfer.
    pub(crate) disk_start_pos: u64,

    /// 0 = idle, 1 = line asserted, 2 = forced pending (seek results).
    pub(crate) irq_pending: u8,
    pub(crate) irq_level: bool,
    /// bit 0: transfer wants DMA service; bit 1: paused until the byte
    /// pulse timer fires again.
    pub(crate) dma_pending: u8,
    pub(crate) tc: bool,

    pub(crate) reset_pending: u8,
    pub(crate) reset_pending_size: u8,
    pub(crate) reset_pended: bool,
    /// 0 = running, 1 = held in reset, 2 = activation timer running.
    pub(crate) resetted: u8,
    pub(crate) ignore_commands: bool,

    pub(crate) mt: bool,
    pub(crate) mfm: bool,
    pub(crate) skip_deleted: bool,
    pub(crate) mt_mask: bool,
    pub(crate) datamark_deleted: bool,
    pub(crate) abort_after_data: bool,
    pub(crate) scanning_for_sector_id: bool,

    pub(crate) dma_rate: Nanos,
    pub(crate) dma_rate_pending: Nanos,
    pub(crate) rw_requested_cylinder: u8,
    pub(crate) read_id_last_sector: u8,
    pub(crate) read_id_drive: usize,
    pub(crate) read_id_error: bool,
    /// Drives whose running command is in the delayed-error state.
    pub(crate) erroring: u8,
    pub(crate) sectors_transferred: u32,

    pub(crate) drives: [DriveState; 4],
    /// One timer per drive plus the reset activation timer.
    pub(crate) timers: [NanoTimer; 5],
    /// Armed-timer bitmask short-circuiting the idle tick.
    pub(crate) timing: u8,
}

impl Fdc {
    #[must_use]
    pub fn new(arch: Architecture) -> Self {
        let mut fdc = Self {
            arch,
            dor: 0,
            msr: 0,
            ccr: 0,
            dir: 0,
            dsr: 0,
            st0: 0,
            st1: 0,
            st2: 0,
            st3: 0,
            // Implied seek on, FIFO off, polling on, no threshold.
            configuration: [0, 0x60, 0],
            locked: false,
            perpendicular: 0,
            step: CommandStep::Command,
            command: [0; 16],
            command_pos: 0,
            data: vec![0; 0x10000],
            data_pos: 0,
            data_size: 0,
            format_scratch: [0; 0x400],
            result: [0; 16],
            result_pos: 0,
            disk_start_pos: 0,
            irq_pending: 0,
            irq_level: false,
            dma_pending: 0,
            tc: false,
            reset_pending: 0,
            reset_pending_size: 0,
            reset_pended: false,
            resetted: 0,
            ignore_commands: false,
            mt: false,
            mfm: false,
            skip_deleted: false,
            mt_mask: true,
            datamark_deleted: false,
            abort_after_data: false,
            scanning_for_sector_id: false,
            dma_rate: 0.0,
            dma_rate_pending: 0.0,
            rw_requested_cylinder: 0,
            read_id_last_sector: 0,
            read_id_drive: 0,
            read_id_error: false,
            erroring: 0,
            sectors_transferred: 0,
            drives: Default::default(),
            timers: [NanoTimer::new(); 5],
            timing: 0,
        };
        for drive in 0..4 {
            fdc.drives[drive].step_rate = rates::step_rate_ns(0, 0);
            fdc.drives[drive].head_load_time = rates::head_load_ns(0, 0);
            fdc.drives[drive].head_unload_time = rates::head_unload_ns(0, 0);
        }
        fdc
    }

    // -------------------------------------------------------------------
    // Register helpers
    // -------------------------------------------------------------------

    #[must_use]
    pub(crate) fn selected_drive(&self) -> usize {
        (self.dor & 3) as usize
    }

    #[must_use]
    pub(crate) fn motor_on(&self, drive: usize) -> bool {
        self.dor & (0x10 << drive) != 0
    }

    #[must_use]
    pub(crate) fn dma_irq_enabled(&self) -> bool {
        self.dor & 0x08 != 0
    }

    /// DMA mode: DOR gate set and the Specify ND bit clear.
    #[must_use]
    pub(crate) fn use_dma(&self) -> bool {
        self.dma_irq_enabled() && self.drives[self.selected_drive()].specify[1] & 1 == 0
    }

    #[must_use]
    pub(crate) fn rate_select(&self) -> u8 {
        self.dsr & 3
    }

    #[must_use]
    pub(crate) fn implied_seek_enabled(&self) -> bool {
        self.configuration[1] & 0x40 != 0
    }

    #[must_use]
    pub(crate) fn polling_disabled(&self) -> bool {
        self.configuration[1] & 0x10 != 0
    }

    pub(crate) fn slot(drive: usize) -> DiskId {
        if drive == 0 { DiskId::Floppy0 } else { DiskId::Floppy1 }
    }

    /// Drives 2 and 3 have no mount slot and never carry media.
    pub(crate) fn drive_mounted(&self, disks: &DiskRouter, drive: usize) -> bool {
        drive < 2 && disks.is_mounted(Self::slot(drive))
    }

    pub(crate) fn drive_read_only(&self, disks: &DiskRouter, drive: usize) -> bool {
        drive < 2
            && (disks.read_only(Self::slot(drive)) || disks.write_was_read_only(Self::slot(drive)))
    }

    // -------------------------------------------------------------------
    // IRQ
    // -------------------------------------------------------------------

    pub(crate) fn raise_irq(&mut self) {
        if self.dma_irq_enabled() {
            self.irq_pending = 1;
            self.irq_level = true;
        }
    }

    pub(crate) fn lower_irq(&mut self) {
        self.irq_pending = 0;
        self.irq_level = false;
    }

    /// Current level of the IRQ 6 output. The machine mirrors this to
    /// the interrupt controller after every access and tick.
    #[must_use]
    pub fn irq_level(&self) -> bool {
        self.irq_level
    }

    /// Specify-derived timings for a drive: step rate, head load and
    /// head unload, in nanoseconds.
    #[must_use]
    pub fn drive_timings(&self, drive: usize) -> (Nanos, Nanos, Nanos) {
        let d = &self.drives[drive & 3];
        (d.step_rate, d.head_load_time, d.head_unload_time)
    }

    // -------------------------------------------------------------------
    // Timers
    // -------------------------------------------------------------------

    pub(crate) fn arm_timer(&mut self, index: usize, period: Nanos) {
        self.timers[index].arm(period);
        self.timing |= 1 << index;
    }

    /// Re-arm without clearing accumulated time (byte pulse pacing).
    pub(crate) fn continue_timer(&mut self, index: usize, period: Nanos) {
        self.timers[index].set_period(period);
        self.timing |= 1 << index;
    }

    pub(crate) fn stop_timer(&mut self, index: usize) {
        self.timers[index].disarm();
        self.timing &= !(1 << index);
    }

    // -------------------------------------------------------------------
    // Port interface (offsets within 3F0–3F7)
    // -------------------------------------------------------------------

    /// Read one of the controller's ports. `reg` is the low three
    /// address bits. `None` for decode holes (and AT-only ports on XT).
    pub fn io_read(&mut self, disks: &mut DiskRouter, reg: u8) -> Option<u8> {
        match reg & 7 {
            0 => {
                // Diskette board jumper settings, two bits per drive.
                let mut value = 0u8;
                for drive in (0..4).rev() {
                    value <<= 2;
                    value |= self.drives[drive]
                        .geometry
                        .map_or(rates::FLOPPYTYPE_12MB, |g| g.board_jumper);
                }
                Some(value)
            }
            2 => Some(self.dor),
            3 => {
                // Tape drive register: media format of the selected drive.
                let drive = self.selected_drive();
                Some(
                    self.drives[drive]
                        .geometry
                        .map_or(0x20, |g| g.tape_drive_register),
                )
            }
            4 => {
                self.update_msr();
                Some(self.msr)
            }
            5 => Some(self.read_data(false, disks)),
            7 => {
                if self.arch == Architecture::At {
                    self.update_dir(disks);
                    Some(self.dir)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    /// Write one of the controller's ports.
    pub fn io_write(&mut self, disks: &mut DiskRouter, reg: u8, value: u8) -> bool {
        match reg & 7 {
            2 => {
                self.dor = value;
                self.handle_reset(disks, 0);
                true
            }
            4 => {
                if self.arch != Architecture::At {
                    return false;
                }
                self.dsr = value;
                self.handle_reset(disks, 1);
                if self.dsr & 0x80 != 0 {
                    // The software reset bit clears itself.
                    self.dsr &= !0x80;
                    self.handle_reset(disks, 1);
                }
                self.ccr = (self.ccr & !3) | (self.dsr & 3);
                true
            }
            5 => {
                self.write_data(false, value, disks);
                true
            }
            7 => {
                if self.arch != Architecture::At {
                    return false;
                }
                self.ccr = value;
                self.dsr = (self.dsr & !3) | (self.ccr & 3);
                true
            }
            _ => false,
        }
    }

    // -------------------------------------------------------------------
    // Derived registers
    // -------------------------------------------------------------------

    /// Recompute MSR from the command phase.
    pub(crate) fn update_msr(&mut self) {
        use commands::*;
        match self.step {
            CommandStep::Command => {
                self.sectors_transferred = 0;
                self.set_msr_busy(false);
                self.set_msr_rqm(self.resetted == 0);
                self.set_msr_dio(false);
                self.set_msr_nondma(false);
            }
            CommandStep::Parameters => {
                self.set_msr_busy(true);
                self.set_msr_rqm(true);
                self.set_msr_dio(false);
                self.set_msr_nondma(false);
            }
            CommandStep::Data => {
                self.set_msr_busy(true);
                match self.command[0] & 0x1F {
                    WRITE_DATA | WRITE_DELETED_DATA | FORMAT_TRACK | READ_DATA | READ_TRACK
                    | READ_DELETED_DATA | SCAN_EQUAL | SCAN_LOW_OR_EQUAL | SCAN_HIGH_OR_EQUAL => {
                        let nondma = !self.use_dma();
                        self.set_msr_rqm(nondma);
                        self.set_msr_nondma(nondma);
                    }
                    READ_ID | VERIFY => {
                        // No direct data transfer.
                        self.set_msr_rqm(false);
                        self.set_msr_nondma(false);
                    }
                    _ => {
                        self.set_msr_rqm(true);
                        self.set_msr_nondma(false);
                    }
                }
                let has_data_for_cpu = matches!(
                    self.command[0] & 0x1F,
                    READ_DATA | READ_TRACK | READ_DELETED_DATA | READ_ID | VERIFY
                );
                self.set_msr_dio(has_data_for_cpu);
            }
            CommandStep::Result | CommandStep::ResultThenLock | CommandStep::Error => {
                self.set_msr_busy(true);
                self.set_msr_rqm(true);
                self.set_msr_dio(true);
                self.set_msr_nondma(false);
            }
            CommandStep::Locked => {
                self.set_msr_busy(true);
                self.set_msr_rqm(false);
                self.set_msr_dio(false);
                self.set_msr_nondma(false);
            }
        }
    }

    fn set_msr_busy(&mut self, busy: bool) {
        self.msr = (self.msr & !0x10) | (u8::from(busy) << 4);
    }

    fn set_msr_nondma(&mut self, nondma: bool) {
        self.msr = (self.msr & !0x20) | (u8::from(nondma) << 5);
    }

    fn set_msr_dio(&mut self, dio: bool) {
        self.msr = (self.msr & !0x40) | (u8::from(dio) << 6);
    }

    fn set_msr_rqm(&mut self, rqm: bool) {
        self.msr = (self.msr & !0x80) | (u8::from(rqm) << 7);
    }

    pub(crate) fn set_msr_seek_busy(&mut self, drive: usize, busy: bool) {
        self.msr = (self.msr & !(1 << drive)) | (u8::from(busy) << drive);
    }

    #[must_use]
    pub(crate) fn msr_seek_busy(&self, drive: usize) -> bool {
        self.msr & (1 << drive) != 0
    }

    /// DIR bit 7: disk changed on the selected, motor-on drive.
    pub(crate) fn update_dir(&mut self, _disks: &DiskRouter) {
        self.dir = 0;
        let drive = self.selected_drive();
        if self.drives[drive].disk_changed && self.motor_on(drive) {
            self.dir = 0x80;
        }
    }

    /// ST3 for the given drive: always-set bits, track 0, sides, write
    /// protection.
    pub(crate) fn update_st3(&mut self, disks: &DiskRouter, drive: usize) {
        self.st3 = 0x28; // Ready + two-side, as the PC wires it
        if self.drives[drive].physical_cylinder == 0 {
            self.st3 |= 0x10;
        }
        let double_sided = self.drives[drive].geometry.is_none_or(|g| g.sides == 2);
        if double_sided {
            self.st3 |= 0x08;
        } else {
            self.st3 &= !0x08;
        }
        self.st3 |= (self.drives[drive].physical_head & 1) << 2;
        self.st3 |= drive as u8 & 3;
        if self.drive_read_only(disks, drive) {
            self.st3 |= 0x40;
        }
    }

    pub(crate) fn update_write_protected(&mut self, disks: &DiskRouter, is_write: bool, drive: usize) {
        self.st1 &= !0x02;
        if is_write && self.drive_read_only(disks, drive) {
            self.st1 |= 0x02;
        }
    }

    pub(crate) fn fill_st0(&mut self, drive: usize) {
        self.st0 = (self.st0 & !0x07) | (drive as u8 & 3) | ((self.drives[drive].physical_head & 1) << 2);
    }

    // -------------------------------------------------------------------
    // Reset
    // -------------------------------------------------------------------

    /// DOR bit 2 low or DSR bit 7 high holds the controller in reset;
    /// releasing it starts the 30 µs activation timer.
    fn handle_reset(&mut self, disks: &mut DiskRouter, _source: u8) {
        let in_reset = self.dor & 0x04 == 0 || self.dsr & 0x80 != 0;
        if in_reset {
            if self.resetted != 0 {
                return;
            }
            self.dir = 0;
            self.ccr = 0;
            self.msr = 0;
            self.command_pos = 0;
            self.step = CommandStep::Command;
            self.st0 = 0;
            self.st1 = 0;
            self.st2 = 0;
            self.st3 = 0;
            let pending = if self.polling_disabled() { 0 } else { 4 };
            if pending != 0 {
                self.st0 |= 0xC0; // Polling flag while reset results drain
                self.reset_pending_size = pending;
            } else {
                // Sense Interrupt is invalid with polling off.
                self.reset_pending_size = 0xFF;
            }
            self.reset_pending = pending;
            self.reset_pended = true;
            for drive in &mut self.drives {
                drive.head = 0;
                drive.physical_head = 0;
                drive.sector = 1;
            }
            self.update_st3(disks, 0);
            self.tc = false;
            if !self.locked {
                self.configuration[1] &= !0x0F; // threshold
                self.configuration[1] |= 0x20; // FIFO disabled
            }
            // Soft reset clears GAP/WGATE only.
            self.perpendicular &= !0x03;
            self.resetted = 1;
            self.ignore_commands = false;
            self.lower_irq();
            for drive in 0..4 {
                self.stop_timer(drive);
            }
            self.dma_pending = 0;
        } else if self.resetted == 1 {
            self.arm_timer(4, RESET_ACTIVATION_NS);
            self.resetted = 2;
        }
    }

    // -------------------------------------------------------------------
    // Tick
    // -------------------------------------------------------------------

    /// Advance all timers by `dt` nanoseconds.
    pub fn update(&mut self, disks: &mut DiskRouter, dt: Nanos) {
        if self.timing == 0 {
            return;
        }
        for index in 0..5 {
            if !self.timers[index].is_armed() {
                continue;
            }
            self.timers[index].advance(dt);
            while self.timers[index].fire() {
                self.on_timer_fire(disks, index);
                if !self.timers[index].is_armed() {
                    break;
                }
            }
            if !self.timers[index].is_armed() {
                self.timing &= !(1 << index);
            }
        }
    }

    fn on_timer_fire(&mut self, disks: &mut DiskRouter, index: usize) {
        use commands::*;
        if index == 4 {
            // Reset activation complete.
            self.raise_irq();
            self.resetted = 0;
            self.stop_timer(4);
            return;
        }
        let drive = index;
        let active = self.drives[drive].active_command & 0x1F;
        if self.erroring & (1 << drive) != 0 && active != READ_ID && active != VERIFY {
            // Delayed error surfaces now.
            self.step = CommandStep::Result;
            self.raise_irq();
            self.stop_timer(drive);
            return;
        }
        match active {
            SEEK => self.seek_step(disks, drive),
            RECALIBRATE => self.recalibrate_step(disks, drive),
            READ_TRACK | READ_DATA | READ_DELETED_DATA | SCAN_EQUAL | SCAN_LOW_OR_EQUAL
            | SCAN_HIGH_OR_EQUAL | WRITE_DATA | WRITE_DELETED_DATA => {
                if self.msr_seek_busy(drive) {
                    self.seek_step(disks, drive);
                } else {
                    self.dma_pulse(drive);
                }
            }
            VERIFY => {
                if self.msr_seek_busy(drive) {
                    self.seek_step(disks, drive);
                } else {
                    self.verify_tick(disks, drive);
                }
            }
            READ_ID => self.read_id_tick(drive),
            FORMAT_TRACK => {
                if self.msr_seek_busy(drive) {
                    self.seek_step(disks, drive);
                } else if self.step == CommandStep::Data && self.command[3] == 0 {
                    // Zero sectors: the index pulse ends the format.
                    self.format_sector(disks, true);
                    self.stop_timer(drive);
                } else {
                    self.dma_pulse(drive);
                }
            }
            _ => self.dma_pulse(drive),
        }
    }

    /// DMA byte pacing: a paused transfer resumes its request once the
    /// byte time elapses.
    fn dma_pulse(&mut self, drive: usize) {
        if self.step == CommandStep::Data
            && self.use_dma()
            && self.dma_pending & 2 != 0
            && drive == self.selected_drive()
        {
            self.dma_pending &= !2;
            self.continue_timer(drive, self.dma_rate);
        } else {
            self.stop_timer(drive);
        }
    }

    // -------------------------------------------------------------------
    // DMA interface (channel 2 handshake)
    // -------------------------------------------------------------------

    /// Level of the DREQ output.
    #[must_use]
    pub fn dma_request(&self) -> bool {
        self.step == CommandStep::Data && self.use_dma() && self.dma_pending == 1
    }

    fn dma_acknowledge(&mut self) {
        if self.dma_pending != 0 {
            self.dma_pending |= 2;
            let drive = self.selected_drive();
            self.continue_timer(drive, self.dma_rate);
        }
    }

    /// DACK + read: the DMA controller fetches one byte from the FDC.
    pub fn dma_read(&mut self, disks: &mut DiskRouter) -> u8 {
        self.dma_acknowledge();
        self.read_data(true, disks)
    }

    /// DACK + write: the DMA controller hands one byte to the FDC.
    pub fn dma_write(&mut self, disks: &mut DiskRouter, value: u8) {
        self.dma_acknowledge();
        self.write_data(true, value, disks);
    }

    /// Terminal count asserted by the DMA controller.
    pub fn dma_terminal_count(&mut self) {
        self.tc = true;
    }

    /// End-of-process query from the DMA controller.
    #[must_use]
    pub fn dma_end_of_process(&self) -> bool {
        self.tc
    }

    // -------------------------------------------------------------------
    // Media notifications
    // -------------------------------------------------------------------

    /// A slot's media changed (mounted, remounted or pulled).
    pub fn notify_disk_changed(&mut self, id: DiskId) {
        let drive = match id {
            DiskId::Floppy0 => 0,
            DiskId::Floppy1 => 1,
            _ => return,
        };
        self.drives[drive].disk_changed = true;
        self.drives[drive].eject_pending = true;
    }

    pub(crate) fn clear_disk_changed(&mut self, drive: usize) {
        self.drives[drive].disk_changed = false;
        self.drives[drive].eject_pending = false;
    }

    // -------------------------------------------------------------------
    // Geometry
    // -------------------------------------------------------------------

    /// Refresh the drive's geometry: DSK/IMD media build a custom
    /// geometry from the track under the head, raw media match the size
    /// table (largest-fit as a fallback).
    pub(crate) fn update_geometry(&mut self, disks: &mut DiskRouter, drive: usize, side: u8, track: u8) {
        self.drives[drive].geometry = None;
        if drive >= 2 || !self.drive_mounted(disks, drive) {
            return;
        }
        let slot = Self::slot(drive);
        if let Some(dsk) = disks.dsk(slot) {
            let info = dsk.disk_info();
            if let Some(track_info) = dsk.track_info(side, track) {
                self.drives[drive].geometry = Some(FloppyGeometry {
                    kb: 0,
                    spt: track_info.sector_count,
                    sides: info.sides,
                    tracks: info.tracks,
                    board_jumper: 0,
                    small_form: info.tracks > 40,
                    supported_rates: 0x1B,
                    media_descriptor: 0x00,
                    density: u8::from(track_info.sector_count > 40),
                    gap_length: track_info.gap3,
                    tape_drive_register: 0x00,
                    rpm: 300,
                    name: "custom DSK geometry",
                });
            }
            return;
        }
        if let Some(imd) = disks.imd(slot) {
            if let (Some(info), Some(sector)) = (imd.disk_info(), imd.sector_info(track, side, 0)) {
                self.drives[drive].geometry = Some(FloppyGeometry {
                    kb: 0,
                    spt: sector.total_sectors,
                    sides: info.heads,
                    tracks: info.cylinders,
                    board_jumper: 0,
                    small_form: info.cylinders > 40,
                    supported_rates: 0x1B,
                    media_descriptor: 0x00,
                    density: u8::from(sector.mode.mfm),
                    gap_length: rates::GAPLENGTH_IGNORE,
                    tape_drive_register: 0x00,
                    rpm: 300,
                    name: "custom IMD geometry",
                });
            }
            return;
        }
        let size = disks.size(slot);
        self.drives[drive].geometry =
            rates::geometry_for_size(size).or_else(|| rates::largest_geometry_within(size));
        if let Some(geometry) = self.drives[drive].geometry {
            if self.drives[drive].physical_cylinder > geometry.tracks - 1 {
                self.drives[drive].physical_cylinder = geometry.tracks - 1;
            }
        }
    }

    /// LBA within a flat floppy image for the current geometry.
    #[must_use]
    pub(crate) fn chs_to_lba(&self, drive: usize, side: u8, track: u8, sector: u8) -> u32 {
        let Some(geometry) = self.drives[drive].geometry else {
            return 0;
        };
        (u32::from(track) * u32::from(geometry.sides) + u32::from(side)) * u32::from(geometry.spt)
            + u32::from(sector).saturating_sub(1)
    }

    /// Whether the programmed data rate suits the mounted medium, and
    /// latch the byte pulse period for the transfer.
    pub(crate) fn supports_rate(&mut self, drive: usize) -> bool {
        let format_sectors = if self.drives[drive].active_command & 0x1F == commands::FORMAT_TRACK {
            Some(self.command[3].max(1))
        } else {
            None
        };
        let Some(geometry) = self.drives[drive].geometry else {
            // Unknown media: accept and pace at the default 300 RPM/80.
            self.dma_rate_pending = rates::sector_rate_ns(300, format_sectors.unwrap_or(80)) / 512.0;
            return true;
        };
        let spt = format_sectors.unwrap_or(geometry.spt);
        let mut supported = geometry.supported_rates;
        let current = self.rate_select();
        for _ in 0..4 {
            if current == supported & 3 {
                self.dma_rate_pending = rates::sector_rate_ns(geometry.rpm, spt) / 512.0;
                return true;
            }
            supported >>= 2;
        }
        false
    }
}

impl Observable for Fdc {
    fn query(&self, path: &str) -> Option<Value> {
        if let Some(rest) = path.strip_prefix("drive") {
            let (index, field) = rest.split_once('.')?;
            let drive = self.drives.get(index.parse::<usize>().ok()?)?;
            return match field {
                "cylinder" => Some(drive.cylinder.into()),
                "physical_cylinder" => Some(drive.physical_cylinder.into()),
                "head" => Some(drive.head.into()),
                "sector" => Some(drive.sector.into()),
                "disk_changed" => Some(drive.disk_changed.into()),
                _ => None,
            };
        }
        match path {
            "dor" => Some(self.dor.into()),
            "msr" => Some(self.msr.into()),
            "ccr" => Some(self.ccr.into()),
            "dir" => Some(self.dir.into()),
            "dsr" => Some(self.dsr.into()),
            "st0" => Some(self.st0.into()),
            "st1" => Some(self.st1.into()),
            "st2" => Some(self.st2.into()),
            "st3" => Some(self.st3.into()),
            "commandstep" => Some(self.step.code().into()),
            "irq" => Some(self.irq_level.into()),
            _ => None,
        }
    }

    fn query_paths(&self) -> &'static [&'static str] {
        &[
            "dor",
            "msr",
            "ccr",
            "dir",
            "dsr",
            "st0",
            "st1",
            "st2",
            "st3",
            "commandstep",
            "irq",
            "drive<n>.cylinder",
            "drive<n>.physical_cylinder",
            "drive<n>.head",
            "drive<n>.sector",
            "drive<n>.disk_changed",
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::commands::*;
    use super::*;

    /// A 1.44 MB image whose sectors carry their LBA in the first byte.
    fn router_with_floppy() -> (tempfile::TempDir, DiskRouter) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("boot.img");
        let mut image = vec![0u8; 1_474_560];
        for (lba, sector) in image.chunks_mut(512).enumerate() {
            sector[0] = (lba & 0xFF) as u8;
            sector[1] = ((lba >> 8) & 0xFF) as u8;
            sector[511] = 0x55;
        }
        std::fs::write(&path, &image).expect("image");
        let mut router = DiskRouter::new(dir.path().to_path_buf());
        assert!(router.mount(DiskId::Floppy0, "boot.img", 0, false, 0));
        router.drain_changes();
        (dir, router)
    }

    fn specify(fdc: &mut Fdc, disks: &mut DiskRouter, srt_hut: u8, hlt_nd: u8) {
        fdc.io_write(disks, 5, 0x03);
        fdc.io_write(disks, 5, srt_hut);
        fdc.io_write(disks, 5, hlt_nd);
    }

    fn read_result(fdc: &mut Fdc, disks: &mut DiskRouter, count: usize) -> Vec<u8> {
        (0..count)
            .map(|_| fdc.io_read(disks, 5).expect("result byte"))
            .collect()
    }

    #[test]
    fn msr_reports_idle_ready() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        let msr = fdc.io_read(&mut disks, 4).expect("msr");
        assert_eq!(msr & 0x80, 0x80, "RQM set while idle");
        assert_eq!(msr & 0x40, 0x00, "DIO towards the controller");
    }

    #[test]
    fn specify_consumes_parameters_silently() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        specify(&mut fdc, &mut disks, 0xDF, 0x02);
        assert_eq!(fdc.step, CommandStep::Command);
        assert!(!fdc.irq_level(), "Specify raises no interrupt");
        // SRT 0xD at 500 kbps: 3 ms per step; HLT 1 loads in 2 ms.
        let (step, head_load, _) = fdc.drive_timings(0);
        assert!((step - 3_000_000.0).abs() < 1.0);
        assert!((head_load - 2_000_000.0).abs() < 1.0);
    }

    #[test]
    fn dma_read_sector_delivers_data_and_one_irq() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C); // motor 0, DMA gate, no reset
        specify(&mut fdc, &mut disks, 0xDF, 0x02); // ND=0: DMA mode

        for byte in [0x46, 0x00, 0x00, 0x00, 0x01, 0x02, 18, 0x1B, 0xFF] {
            fdc.io_write(&mut disks, 5, byte);
        }
        assert_eq!(fdc.step, CommandStep::Data);

        let mut transferred = Vec::new();
        let mut irq_edges = 0;
        let mut irq_was = false;
        let mut guard = 0;
        while fdc.step != CommandStep::Result {
            if fdc.dma_request() {
                if transferred.len() == 511 {
                    fdc.dma_terminal_count(); // 8237 TC on the last byte
                }
                transferred.push(fdc.dma_read(&mut disks));
            } else {
                fdc.update(&mut disks, 30_000.0);
            }
            if fdc.irq_level() && !irq_was {
                irq_edges += 1;
            }
            irq_was = fdc.irq_level();
            guard += 1;
            assert!(guard < 100_000, "transfer stalled");
        }

        assert_eq!(transferred.len(), 512);
        assert_eq!(transferred[0], 0x00);
        assert_eq!(transferred[511], 0x55);
        assert_eq!(irq_edges, 1, "one interrupt at completion");

        let result = read_result(&mut fdc, &mut disks, 7);
        assert_eq!(result[0], 0x00, "ST0 normal termination");
        assert_eq!(result[3], 0, "cylinder");
        assert_eq!(result[4], 0, "head");
        assert_eq!(result[5], 2, "next sector");
        assert_eq!(fdc.step, CommandStep::Command);
    }

    #[test]
    fn non_dma_read_interrupts_per_byte() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        specify(&mut fdc, &mut disks, 0xDF, 0x03); // ND=1: polled mode

        // EOT = 1: the command ends once sector 1 is drained.
        for byte in [0x46, 0x00, 0x00, 0x00, 0x01, 0x02, 1, 0x1B, 0xFF] {
            fdc.io_write(&mut disks, 5, byte);
        }
        assert!(fdc.irq_level(), "data-ready interrupt");
        let msr = fdc.io_read(&mut disks, 4).expect("msr");
        assert_eq!(msr & 0x20, 0x20, "NDM flag during polled execution");

        let mut data = Vec::new();
        for _ in 0..512 {
            data.push(fdc.io_read(&mut disks, 5).expect("data"));
        }
        assert_eq!(data[0], 0x00);
        assert_eq!(data[511], 0x55);
        assert_eq!(fdc.step, CommandStep::Result);
    }

    #[test]
    fn seek_past_last_track_parks_at_79() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        specify(&mut fdc, &mut disks, 0xDF, 0x02);

        fdc.io_write(&mut disks, 5, 0x0F); // SEEK
        fdc.io_write(&mut disks, 5, 0x00); // drive 0
        fdc.io_write(&mut disks, 5, 80); // one past the last cylinder
        // 80 steps at 3 ms each.
        fdc.update(&mut disks, 400_000_000.0);
        assert!(fdc.irq_level());

        fdc.io_write(&mut disks, 5, 0x08); // SENSE INTERRUPT
        let result = read_result(&mut fdc, &mut disks, 2);
        assert_eq!(result[0], 0x20, "seek end without error");
        assert_eq!(result[1], 79, "head parked on the last cylinder");
        assert_eq!(fdc.drives[0].physical_cylinder, 79);
    }

    #[test]
    fn recalibrate_steps_home_and_interrupts() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        specify(&mut fdc, &mut disks, 0xDF, 0x02);

        fdc.io_write(&mut disks, 5, 0x0F);
        fdc.io_write(&mut disks, 5, 0x00);
        fdc.io_write(&mut disks, 5, 10);
        fdc.update(&mut disks, 100_000_000.0);
        fdc.io_write(&mut disks, 5, 0x08);
        let _ = read_result(&mut fdc, &mut disks, 2);

        fdc.io_write(&mut disks, 5, 0x07); // RECALIBRATE
        fdc.io_write(&mut disks, 5, 0x00);
        fdc.update(&mut disks, 400_000_000.0);
        assert!(fdc.irq_level());
        fdc.io_write(&mut disks, 5, 0x08);
        let result = read_result(&mut fdc, &mut disks, 2);
        assert_eq!(result[0] & 0x20, 0x20, "seek end");
        assert_eq!(result[0] & 0x10, 0x00, "no unit check");
        assert_eq!(result[1], 0, "back at track 0");
    }

    #[test]
    fn write_to_read_only_medium_reports_protection() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("locked.img");
        std::fs::write(&path, vec![0u8; 1_474_560]).expect("image");
        let mut disks = DiskRouter::new(dir.path().to_path_buf());
        assert!(disks.mount(DiskId::Floppy0, "locked.img", 0, true, 0));
        disks.drain_changes();

        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        specify(&mut fdc, &mut disks, 0xDF, 0x03); // polled

        for byte in [0x45, 0x00, 0x00, 0x00, 0x01, 0x02, 18, 0x1B, 0xFF] {
            fdc.io_write(&mut disks, 5, byte);
        }
        for _ in 0..512 {
            fdc.io_write(&mut disks, 5, 0xAB);
        }
        let result = read_result(&mut fdc, &mut disks, 7);
        assert_eq!(result[0] & 0x40, 0x40, "abnormal termination");
        assert_eq!(result[1], 0x27, "ST1 not-writable");
        assert_eq!(result[2], 0x31, "ST2 write fault pattern");
    }

    #[test]
    fn invalid_command_serves_error_st0() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        fdc.io_write(&mut disks, 5, 0x01); // not a command
        assert_eq!(fdc.step.code(), 0xFF);
        let st0 = fdc.io_read(&mut disks, 5).expect("st0");
        assert_eq!(st0, 0x80);
        assert_eq!(fdc.step, CommandStep::Command);
    }

    #[test]
    fn sense_interrupt_without_irq_is_an_error() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        fdc.io_write(&mut disks, 5, 0x08);
        let st0 = fdc.io_read(&mut disks, 5).expect("st0");
        assert_eq!(st0, 0x80, "invalid sense interrupt");
    }

    #[test]
    fn reset_pends_four_sense_interrupt_results() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x00); // assert reset
        let msr = fdc.io_read(&mut disks, 4).expect("msr");
        assert_eq!(msr & 0x80, 0, "not ready while held in reset");
        fdc.io_write(&mut disks, 2, 0x0C); // release, DMA gate on
        fdc.update(&mut disks, 30_000.0);
        assert!(fdc.irq_level(), "polling interrupt after 30 us");

        for drive in 0..4u8 {
            fdc.io_write(&mut disks, 5, 0x08);
            let result = read_result(&mut fdc, &mut disks, 2);
            assert_eq!(result[0] & 0x03, drive, "drive {drive} polled");
            assert_eq!(result[0] & 0xC0, 0xC0, "polling flag");
        }
        fdc.io_write(&mut disks, 5, 0x08);
        let st0 = fdc.io_read(&mut disks, 5).expect("st0");
        assert_eq!(st0, 0x80, "fifth sense interrupt is invalid");
    }

    #[test]
    fn version_and_dumpreg() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        fdc.io_write(&mut disks, 5, 0x10); // VERSION
        assert_eq!(fdc.io_read(&mut disks, 5), Some(0x90));

        fdc.io_write(&mut disks, 5, 0x0E); // DUMPREG
        let result = read_result(&mut fdc, &mut disks, 10);
        assert_eq!(result[6], 18, "sectors per track of the mounted disk");
    }

    #[test]
    fn read_id_walks_the_sector_numbers() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        specify(&mut fdc, &mut disks, 0xDF, 0x02);

        fdc.io_write(&mut disks, 5, 0x4A); // READ ID, MFM
        fdc.io_write(&mut disks, 5, 0x00);
        // The ID passes the head after one simulated sector time.
        fdc.update(&mut disks, 30_000_000.0);
        let result = read_result(&mut fdc, &mut disks, 7);
        assert_eq!(result[0] & 0x40, 0, "no error");
        assert_eq!(result[3], 0, "cylinder");
        assert_eq!(result[5], 1, "first sector after the index");
        assert_eq!(result[6], 2, "512-byte sectors");
    }

    #[test]
    fn dir_reports_media_change_until_cleared() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        fdc.notify_disk_changed(DiskId::Floppy0);
        let dir_reg = fdc.io_read(&mut disks, 7).expect("dir");
        assert_eq!(dir_reg & 0x80, 0x80, "disk change latched");

        // A seek to another cylinder clears the change line.
        specify(&mut fdc, &mut disks, 0xDF, 0x02);
        fdc.io_write(&mut disks, 5, 0x0F);
        fdc.io_write(&mut disks, 5, 0x00);
        fdc.io_write(&mut disks, 5, 2);
        fdc.update(&mut disks, 100_000_000.0);
        let dir_reg = fdc.io_read(&mut disks, 7).expect("dir");
        assert_eq!(dir_reg & 0x80, 0x00);
    }

    #[test]
    fn observable_paths_answer() {
        let (_dir, mut disks) = router_with_floppy();
        let mut fdc = Fdc::new(Architecture::At);
        fdc.io_write(&mut disks, 2, 0x1C);
        assert_eq!(fdc.query("dor"), Some(Value::U8(0x1C)));
        assert_eq!(fdc.query("commandstep"), Some(Value::U8(0)));
        assert_eq!(fdc.query("drive0.cylinder"), Some(Value::U8(0)));
        assert_eq!(fdc.query("nonsense"), None);
    }
}
