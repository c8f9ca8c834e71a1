//! Data-rate derived timing tables and the floppy geometry table.
//!
//! All Specify parameters scale with the selected transfer rate. The
//! rate select index is the CCR/DSR encoding: 0 = 500 kbps, 1 = 300,
//! 2 = 250, 3 = 1M.
//!
//! ```text
//! Step rate (ms):        1M = 8 - v/2     500k = 16 - v
//!                        300k = 26⅔ - v·1⅔  250k = 32 - 2v
//! Head unload (v0 → 16): 1M = 8v   500k = 16v   300k = 26⅔v  250k = 32v
//! Head load (v0 → 128):  1M = v    500k = 2v    300k = 3⅓v   250k = 4v
//! ```

use emu_core::Nanos;

pub const RATE_500K: u8 = 0;
pub const RATE_300K: u8 = 1;
pub const RATE_250K: u8 = 2;
pub const RATE_1M: u8 = 3;

/// Density classes a geometry supports, plus the ignore flag for media
/// the controller cannot distinguish.
pub const DENSITY_SINGLE: u8 = 0;
pub const DENSITY_DOUBLE: u8 = 1;
pub const DENSITY_HD: u8 = 2;
pub const DENSITY_ED: u8 = 4;
pub const DENSITY_IGNORE: u8 = 8;

/// 82072AA diskette controller board jumper settings per drive type.
pub const FLOPPYTYPE_12MB: u8 = 0;
pub const FLOPPYTYPE_720K: u8 = 1;
pub const FLOPPYTYPE_28MB: u8 = 2;
pub const FLOPPYTYPE_14MB: u8 = 3;

/// GAP#3 lengths per media family; 0 disables the gap check.
pub const GAPLENGTH_IGNORE: u8 = 0;
pub const GAPLENGTH_5_14: u8 = 32;
pub const GAPLENGTH_3_5: u8 = 27;

// Supported-rate sets, packed four 2-bit rate codes per byte.
const LOWSPEED: u8 = RATE_250K | (RATE_300K << 2) | (RATE_500K << 4) | (RATE_500K << 6);
const MIDSPEED: u8 = LOWSPEED;
const HIGHSPEED: u8 = RATE_250K | (RATE_300K << 2) | (RATE_500K << 4) | (RATE_1M << 6);

// Indexed by rate select (500k, 300k, 250k, 1M), in milliseconds.
const STEPRATE_BASE: [f64; 4] = [16.0, 26.0 + 2.0 / 3.0, 32.0, 8.0];
const STEPRATE_SLOPE: [f64; 4] = [-1.0, -(1.0 + 2.0 / 3.0), -2.0, -0.5];
const HEAD_UNLOAD_UNIT: [f64; 4] = [16.0, 26.0 + 2.0 / 3.0, 32.0, 8.0];
const HEAD_LOAD_UNIT: [f64; 4] = [2.0, 3.0 + 1.0 / 3.0, 4.0, 1.0];

const MS: f64 = 1_000_000.0;

/// Duration between step pulses of a Seek/Recalibrate, from the SRT
/// nibble of Specify.
#[must_use]
pub fn step_rate_ns(rate_sel: u8, srt: u8) -> Nanos {
    let sel = (rate_sel & 3) as usize;
    (STEPRATE_BASE[sel] + STEPRATE_SLOPE[sel] * f64::from(srt & 0xF)) * MS
}

/// Time after a data operation at which the head unloads, from the HUT
/// nibble of Specify. A value of 0 means 16.
#[must_use]
pub fn head_unload_ns(rate_sel: u8, hut: u8) -> Nanos {
    let sel = (rate_sel & 3) as usize;
    let v = if hut & 0xF == 0 { 16 } else { hut & 0xF };
    HEAD_UNLOAD_UNIT[sel] * f64::from(v) * MS
}

/// Head settle time before a data operation, from the HLT field of
/// Specify. A value of 0 means 128.
#[must_use]
pub fn head_load_ns(rate_sel: u8, hlt: u8) -> Nanos {
    let sel = (rate_sel & 3) as usize;
    let v = if hlt & 0x7F == 0 { 128 } else { hlt & 0x7F };
    HEAD_LOAD_UNIT[sel] * f64::from(v) * MS
}

/// One full revolution holds one track: nanoseconds per sector at the
/// given spindle speed. The format command divides the revolution by
/// its own sector count instead of the geometry's.
#[must_use]
pub fn sector_rate_ns(rpm: u16, spt: u8) -> Nanos {
    let rpm = f64::from(rpm.max(1));
    let spt = f64::from(spt.max(1));
    (60_000_000_000.0 / rpm) / spt
}

/// A known floppy format and its drive parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FloppyGeometry {
    pub kb: u16,
    pub spt: u8,
    pub sides: u8,
    pub tracks: u8,
    pub board_jumper: u8,
    /// true for 3.5" media, false for 5.25".
    pub small_form: bool,
    /// Packed 2-bit rate codes this format reads at.
    pub supported_rates: u8,
    pub media_descriptor: u8,
    pub density: u8,
    pub gap_length: u8,
    pub tape_drive_register: u8,
    pub rpm: u16,
    pub name: &'static str,
}

/// Differently formatted disks and their corresponding geometries.
pub const GEOMETRIES: [FloppyGeometry; 14] = [
    // 5.25"
    FloppyGeometry { kb: 160, spt: 8, sides: 1, tracks: 40, board_jumper: FLOPPYTYPE_12MB, small_form: false, supported_rates: LOWSPEED, media_descriptor: 0xFE, density: DENSITY_SINGLE, gap_length: GAPLENGTH_5_14, tape_drive_register: 0x00, rpm: 300, name: "160KB disk 5.25\"" },
    FloppyGeometry { kb: 180, spt: 9, sides: 1, tracks: 40, board_jumper: FLOPPYTYPE_12MB, small_form: false, supported_rates: LOWSPEED, media_descriptor: 0xFC, density: DENSITY_SINGLE, gap_length: GAPLENGTH_5_14, tape_drive_register: 0x00, rpm: 300, name: "180KB disk 5.25\"" },
    FloppyGeometry { kb: 200, spt: 10, sides: 1, tracks: 40, board_jumper: FLOPPYTYPE_12MB, small_form: false, supported_rates: LOWSPEED, media_descriptor: 0xFC, density: DENSITY_SINGLE, gap_length: GAPLENGTH_5_14, tape_drive_register: 0x00, rpm: 300, name: "200KB disk 5.25\"" },
    FloppyGeometry { kb: 320, spt: 8, sides: 2, tracks: 40, board_jumper: FLOPPYTYPE_12MB, small_form: false, supported_rates: LOWSPEED, media_descriptor: 0xFF, density: DENSITY_SINGLE, gap_length: GAPLENGTH_5_14, tape_drive_register: 0x00, rpm: 300, name: "320KB disk 5.25\"" },
    FloppyGeometry { kb: 360, spt: 9, sides: 2, tracks: 40, board_jumper: FLOPPYTYPE_12MB, small_form: false, supported_rates: LOWSPEED, media_descriptor: 0xFD, density: DENSITY_DOUBLE, gap_length: GAPLENGTH_5_14, tape_drive_register: 0x00, rpm: 300, name: "360KB disk 5.25\"" },
    FloppyGeometry { kb: 400, spt: 10, sides: 2, tracks: 40, board_jumper: FLOPPYTYPE_12MB, small_form: false, supported_rates: LOWSPEED, media_descriptor: 0xFD, density: DENSITY_SINGLE, gap_length: GAPLENGTH_5_14, tape_drive_register: 0x00, rpm: 300, name: "400KB disk 5.25\"" },
    FloppyGeometry { kb: 1200, spt: 15, sides: 2, tracks: 80, board_jumper: FLOPPYTYPE_12MB, small_form: false, supported_rates: MIDSPEED, media_descriptor: 0xF9, density: DENSITY_SINGLE, gap_length: GAPLENGTH_5_14, tape_drive_register: 0x00, rpm: 360, name: "1.2MB disk 5.25\"" },
    // 3.5"
    FloppyGeometry { kb: 720, spt: 9, sides: 2, tracks: 80, board_jumper: FLOPPYTYPE_720K, small_form: true, supported_rates: LOWSPEED, media_descriptor: 0xF9, density: DENSITY_DOUBLE, gap_length: GAPLENGTH_3_5, tape_drive_register: 0xC0, rpm: 300, name: "720KB disk 3.5\"" },
    FloppyGeometry { kb: 1440, spt: 18, sides: 2, tracks: 80, board_jumper: FLOPPYTYPE_14MB, small_form: true, supported_rates: MIDSPEED, media_descriptor: 0xF0, density: DENSITY_IGNORE | DENSITY_HD, gap_length: GAPLENGTH_3_5, tape_drive_register: 0x80, rpm: 300, name: "1.44MB disk 3.5\"" },
    FloppyGeometry { kb: 1680, spt: 21, sides: 2, tracks: 80, board_jumper: FLOPPYTYPE_14MB, small_form: true, supported_rates: MIDSPEED, media_descriptor: 0xF0, density: DENSITY_IGNORE | DENSITY_HD, gap_length: GAPLENGTH_3_5, tape_drive_register: 0x80, rpm: 300, name: "1.68MB disk 3.5\"" },
    FloppyGeometry { kb: 1722, spt: 21, sides: 2, tracks: 82, board_jumper: FLOPPYTYPE_14MB, small_form: true, supported_rates: MIDSPEED, media_descriptor: 0xF0, density: DENSITY_IGNORE | DENSITY_HD, gap_length: GAPLENGTH_3_5, tape_drive_register: 0x80, rpm: 300, name: "1.722MB disk 3.5\"" },
    FloppyGeometry { kb: 1840, spt: 23, sides: 2, tracks: 80, board_jumper: FLOPPYTYPE_14MB, small_form: true, supported_rates: MIDSPEED, media_descriptor: 0xF0, density: DENSITY_IGNORE | DENSITY_HD, gap_length: GAPLENGTH_3_5, tape_drive_register: 0x80, rpm: 300, name: "1.84MB disk 3.5\"" },
    FloppyGeometry { kb: 2880, spt: 36, sides: 2, tracks: 80, board_jumper: FLOPPYTYPE_28MB, small_form: true, supported_rates: HIGHSPEED, media_descriptor: 0xF0, density: DENSITY_IGNORE | DENSITY_ED, gap_length: GAPLENGTH_IGNORE, tape_drive_register: 0x40, rpm: 300, name: "2.88MB disk 3.5\"" },
    // Catch-all entry for oversized custom images.
    FloppyGeometry { kb: 3840, spt: 48, sides: 2, tracks: 80, board_jumper: FLOPPYTYPE_28MB, small_form: true, supported_rates: HIGHSPEED, media_descriptor: 0xF0, density: DENSITY_IGNORE | DENSITY_ED, gap_length: GAPLENGTH_IGNORE, tape_drive_register: 0x40, rpm: 300, name: "3.84MB disk 3.5\"" },
];

/// Exact-size lookup.
#[must_use]
pub fn geometry_for_size(size: u64) -> Option<FloppyGeometry> {
    let kb = (size / 1024) as u16;
    GEOMETRIES.iter().find(|g| g.kb == kb).copied()
}

/// Largest geometry that fits inside `size`, for odd-sized images.
#[must_use]
pub fn largest_geometry_within(size: u64) -> Option<FloppyGeometry> {
    let kb = (size / 1024) as u16;
    GEOMETRIES
        .iter()
        .filter(|g| g.kb <= kb)
        .max_by_key(|g| g.kb)
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_rate_matches_datasheet() {
        // 500 kbps, SRT=0xD: 16 - 13 = 3 ms.
        assert!((step_rate_ns(RATE_500K, 0xD) - 3_000_000.0).abs() < 1e-6);
        // 300 kbps keeps its thirds: 26.666… - 13·1.666… ms.
        let expected = (26.0 + 2.0 / 3.0 - 13.0 * (1.0 + 2.0 / 3.0)) * 1_000_000.0;
        assert!((step_rate_ns(RATE_300K, 0xD) - expected).abs() < 1e-3);
    }

    #[test]
    fn head_times_zero_means_max() {
        assert!((head_unload_ns(RATE_500K, 0) - 16.0 * 16.0 * 1_000_000.0).abs() < 1e-6);
        assert!((head_load_ns(RATE_1M, 0) - 128.0 * 1_000_000.0).abs() < 1e-6);
    }

    #[test]
    fn sector_rate_covers_revolution() {
        // 300 RPM = 200 ms per revolution; 18 sectors → 11.11 ms each.
        let per_sector = sector_rate_ns(300, 18);
        assert!((per_sector * 18.0 - 200_000_000.0).abs() < 1e-3);
    }

    #[test]
    fn size_lookup_finds_1440k() {
        let g = geometry_for_size(1_474_560).expect("1.44MB");
        assert_eq!(g.spt, 18);
        assert_eq!(g.tracks, 80);
        assert_eq!(g.sides, 2);
    }

    #[test]
    fn largest_fit_for_odd_sizes() {
        let g = largest_geometry_within(1_500_000).expect("fits");
        assert_eq!(g.kb, 1440);
    }

    #[test]
    fn high_density_rates_include_1m() {
        let g = geometry_for_size(2_949_120).expect("2.88MB");
        let rates = [
            g.supported_rates & 3,
            (g.supported_rates >> 2) & 3,
            (g.supported_rates >> 4) & 3,
            (g.supported_rates >> 6) & 3,
        ];
        assert!(rates.contains(&RATE_1M));
    }
}
