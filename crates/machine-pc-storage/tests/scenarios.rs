//! End-to-end scenarios through the port map: boot-style floppy reads
//! over DMA, seeks, ATAPI sense reporting, CD audio and the PCI mode
//! switch.

use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;

use disk_io::DiskId;
use emu_core::{DmaBus, IrqLine, Observable, Value};
use machine_pc_storage::{StorageConfig, StorageSubsystem};
use ringbuf::traits::Consumer;

/// Shared IRQ/DREQ recorder both collaborator boxes point at.
#[derive(Clone, Default)]
struct Lines(Rc<RefCell<LineState>>);

#[derive(Default)]
struct LineState {
    irq_level: [bool; 16],
    irq_edges: [u32; 16],
    dreq: [bool; 8],
}

impl Lines {
    fn irq_level(&self, line: u8) -> bool {
        self.0.borrow().irq_level[line as usize]
    }

    fn irq_edges(&self, line: u8) -> u32 {
        self.0.borrow().irq_edges[line as usize]
    }

    fn dreq(&self, channel: u8) -> bool {
        self.0.borrow().dreq[channel as usize]
    }
}

impl IrqLine for Lines {
    fn raise_irq(&mut self, line: u8) {
        let mut state = self.0.borrow_mut();
        if !state.irq_level[line as usize] {
            state.irq_edges[line as usize] += 1;
        }
        state.irq_level[line as usize] = true;
    }

    fn lower_irq(&mut self, line: u8) {
        self.0.borrow_mut().irq_level[line as usize] = false;
    }

    fn acknowledge_irq(&mut self, _line: u8) {}
}

impl DmaBus for Lines {
    fn set_dreq(&mut self, channel: u8, level: bool) {
        self.0.borrow_mut().dreq[channel as usize] = level;
    }
}

fn machine_in(dir: &std::path::Path) -> (StorageSubsystem, Lines) {
    let lines = Lines::default();
    let config = StorageConfig::new(PathBuf::from(dir));
    let machine = StorageSubsystem::new(
        &config,
        Box::new(lines.clone()),
        Box::new(lines.clone()),
    );
    (machine, lines)
}

fn write_floppy_image(dir: &std::path::Path) {
    let mut image = vec![0u8; 1_474_560];
    for (lba, sector) in image.chunks_mut(512).enumerate() {
        sector[0] = (lba & 0xFF) as u8;
        sector[511] = 0x99;
    }
    std::fs::write(dir.join("boot.img"), &image).expect("floppy image");
}

fn fdc_command(machine: &mut StorageSubsystem, bytes: &[u8]) {
    for &byte in bytes {
        assert!(machine.io_write(0x3F5, byte));
    }
}

fn fdc_result(machine: &mut StorageSubsystem, count: usize) -> Vec<u8> {
    (0..count)
        .map(|_| machine.io_read(0x3F5).expect("result byte"))
        .collect()
}

/// Spec scenario: Specify then READ DATA at C0/H0/R1 over DMA; one
/// interrupt, data intact, result C/H/R rolls to the next sector.
#[test]
fn floppy_dma_read_boot_sector() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_floppy_image(dir.path());
    let (mut machine, lines) = machine_in(dir.path());
    assert!(machine.mount(DiskId::Floppy0, "boot.img", 0, false, 0));

    machine.io_write(0x3F2, 0x1C); // motor 0 + DMA gate + no reset
    fdc_command(&mut machine, &[0x03, 0xDF, 0x02]); // SPECIFY
    fdc_command(&mut machine, &[0x46, 0x00, 0x00, 0x00, 0x01, 0x02, 18, 0x1B, 0xFF]);

    let mut data = Vec::new();
    let mut guard = 0;
    while !lines.irq_level(6) {
        if lines.dreq(2) {
            if data.len() == 511 {
                machine.fdc_dma_terminal_count();
            }
            data.push(machine.fdc_dma_read());
        } else {
            machine.update(30_000.0);
        }
        guard += 1;
        assert!(guard < 100_000, "transfer stalled");
    }

    assert_eq!(data.len(), 512);
    assert_eq!(data[0], 0x00);
    assert_eq!(data[511], 0x99);
    assert_eq!(lines.irq_edges(6), 1, "IRQ 6 asserted exactly once");

    let result = fdc_result(&mut machine, 7);
    assert_eq!(result[0], 0x00, "ST0");
    assert_eq!(&result[3..6], &[0, 0, 2], "C/H/R after the read");
    assert_eq!(
        machine.fdc().query("commandstep"),
        Some(Value::U8(0)),
        "command phase restored"
    );
}

/// Spec scenario: four sectors over DMA with terminal count on the
/// last byte.
#[test]
fn floppy_dma_read_four_sectors() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_floppy_image(dir.path());
    let (mut machine, lines) = machine_in(dir.path());
    assert!(machine.mount(DiskId::Floppy0, "boot.img", 0, false, 0));

    machine.io_write(0x3F2, 0x1C);
    fdc_command(&mut machine, &[0x03, 0xDF, 0x02]);
    fdc_command(&mut machine, &[0x46, 0x00, 0x00, 0x00, 0x01, 0x02, 18, 0x1B, 0xFF]);

    let mut data = Vec::new();
    let mut guard = 0;
    while !lines.irq_level(6) {
        if lines.dreq(2) {
            if data.len() == 2047 {
                machine.fdc_dma_terminal_count();
            }
            data.push(machine.fdc_dma_read());
        } else {
            machine.update(30_000.0);
        }
        guard += 1;
        assert!(guard < 400_000, "transfer stalled");
    }

    assert_eq!(data.len(), 2048, "four sectors arrive through DMA");
    for sector in 0..4 {
        assert_eq!(data[sector * 512], sector as u8, "sector payload");
    }
    assert_eq!(lines.irq_edges(6), 1);
    let result = fdc_result(&mut machine, 7);
    assert_eq!(result[0], 0x00);
    assert_eq!(result[5], 5, "next sector after four reads");
}

/// Spec scenario: SEEK to cylinder 80 on an 80-track disc parks at 79
/// with Seek End set.
#[test]
fn floppy_seek_past_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_floppy_image(dir.path());
    let (mut machine, _lines) = machine_in(dir.path());
    assert!(machine.mount(DiskId::Floppy0, "boot.img", 0, false, 0));

    machine.io_write(0x3F2, 0x1C);
    fdc_command(&mut machine, &[0x03, 0xDF, 0x02]);
    fdc_command(&mut machine, &[0x0F, 0x00, 80]);
    machine.update(500_000_000.0);

    fdc_command(&mut machine, &[0x08]); // SENSE INTERRUPT
    let result = fdc_result(&mut machine, 2);
    assert_eq!(result[0], 0x20, "ST0 seek end");
    assert_eq!(result[1], 79, "cylinder clamped to the last track");
}

const SEC_BASE: u16 = 0x170;

fn atapi_packet(machine: &mut StorageSubsystem, cdb: [u8; 12]) {
    machine.io_write(SEC_BASE + 6, 0xA0); // device 0
    machine.io_write(SEC_BASE + 4, 0xFE);
    machine.io_write(SEC_BASE + 5, 0xFF);
    machine.io_write(SEC_BASE + 7, 0xA0); // PACKET
    for pair in cdb.chunks(2) {
        machine.io_write16(SEC_BASE, u16::from(pair[0]) | (u16::from(pair[1]) << 8));
    }
}

fn atapi_response(machine: &mut StorageSubsystem) -> Vec<u8> {
    let mut out = Vec::new();
    // Alternate status leaves the interrupt latch alone.
    while machine.io_read(0x376).expect("alt status") & 0x08 != 0 {
        let count = usize::from(machine.io_read(SEC_BASE + 4).expect("count low"))
            | (usize::from(machine.io_read(SEC_BASE + 5).expect("count high")) << 8);
        for _ in 0..count.div_ceil(2) {
            let word = machine.io_read16(SEC_BASE).expect("data word");
            out.push(word as u8);
            out.push((word >> 8) as u8);
        }
    }
    out
}

/// Spec scenario: READ(10) with no disc answers CHECK CONDITION with
/// NOT READY / MEDIUM NOT PRESENT.
#[test]
fn atapi_read_without_disc() {
    let dir = tempfile::tempdir().expect("tempdir");
    let (mut machine, _lines) = machine_in(dir.path());

    let mut cdb = [0u8; 12];
    cdb[0] = 0x28;
    cdb[8] = 1;
    atapi_packet(&mut machine, cdb);
    let status = machine.io_read(SEC_BASE + 7).expect("status");
    assert_eq!(status, 0x51, "DRDY | DSC | ERR");
    let error = machine.io_read(SEC_BASE + 1).expect("error");
    assert_eq!(error >> 4, 2, "sense key NOT READY in the high nibble");

    let mut sense_cdb = [0u8; 12];
    sense_cdb[0] = 0x03;
    sense_cdb[4] = 18;
    atapi_packet(&mut machine, sense_cdb);
    let sense = atapi_response(&mut machine);
    assert_eq!(sense[2] & 0x0F, 2);
    assert_eq!(sense[12], 0x3A, "medium not present");
    assert_eq!(sense[13], 1);
}

fn write_cd(dir: &std::path::Path) {
    let mut image = Vec::new();
    for sector in 0u32..64 {
        let mut block = vec![0u8; 2048];
        block[0] = sector as u8;
        image.extend_from_slice(&block);
    }
    for _ in 0..300 {
        // A 1 kHz-ish square so samples are visibly non-zero.
        let mut frame = vec![0u8; 2352];
        for sample in frame.chunks_mut(4) {
            sample.copy_from_slice(&[0x00, 0x40, 0x00, 0x40]);
        }
        image.extend_from_slice(&frame);
    }
    std::fs::write(dir.join("game.bin"), &image).expect("bin");
    std::fs::write(
        dir.join("game.cue"),
        "FILE \"game.bin\" BINARY\n\
         TRACK 01 MODE1/2048\n\
         INDEX 01 00:00:00\n\
         TRACK 02 AUDIO\n\
         PREGAP 00:02:00\n\
         INDEX 01 00:00:64\n",
    )
    .expect("cue");
}

fn ready_cd(machine: &mut StorageSubsystem) {
    assert!(machine.mount(DiskId::Cdrom0, "game.cue", 0, true, 0));
    // Tray close and spin-up.
    machine.update(1_100_000_000.0);
    machine.update(1_100_000_000.0);
    // Consume the media-change unit attention.
    atapi_packet(machine, [0u8; 12]);
    let _ = machine.io_read(SEC_BASE + 7);
}

/// Spec scenario: PLAY AUDIO MSF across a pregap; PCM arrives at the
/// sink and the audio status walks PLAYING → COMPLETED-once.
#[test]
fn cd_audio_playback_through_sink() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_cd(dir.path());
    let (mut machine, _lines) = machine_in(dir.path());
    let mut pcm_sink = machine.take_cd_audio(1, 0).expect("sink");
    ready_cd(&mut machine);

    // Track 2 audio starts at frame 64 + 150 pregap; MSF adds the
    // 150-frame lead-in.
    let start = format_cue::Msf::from_lba(214 + 150);
    let end = format_cue::Msf::from_lba(214 + 150 + 75);
    let mut cdb = [0u8; 12];
    cdb[0] = 0x47;
    cdb[3] = start.m;
    cdb[4] = start.s;
    cdb[5] = start.f;
    cdb[6] = end.m;
    cdb[7] = end.s;
    cdb[8] = end.f;
    atapi_packet(&mut machine, cdb);
    let status = machine.io_read(SEC_BASE + 7).expect("status");
    assert_eq!(status & 0x01, 0, "play accepted");

    let mut sub = [0u8; 12];
    sub[0] = 0x42;
    sub[2] = 0x40;
    sub[8] = 16;
    machine.update(100_000_000.0);
    atapi_packet(&mut machine, sub);
    let response = atapi_response(&mut machine);
    assert_eq!(response[1], 0x11, "playing");

    // Drain the ring while the second of audio runs out.
    let mut samples = Vec::new();
    let mut chunk = [0i16; 8192];
    for _ in 0..14 {
        machine.update(100_000_000.0);
        loop {
            let taken = pcm_sink.pop_slice(&mut chunk);
            if taken == 0 {
                break;
            }
            samples.extend_from_slice(&chunk[..taken]);
        }
    }
    assert_eq!(samples.len(), 75 * 588 * 2, "one second of stereo PCM");
    assert!(samples.iter().any(|&s| s != 0), "audio data, not silence");

    atapi_packet(&mut machine, sub);
    let response = atapi_response(&mut machine);
    assert_eq!(response[1], 0x13, "completion reported");
    atapi_packet(&mut machine, sub);
    let response = atapi_response(&mut machine);
    assert_eq!(response[1], 0x15, "and only once");
}

/// Spec scenario: a locked tray refuses the host eject and leaves
/// NOT READY / 0x53 sense for the next command.
#[test]
fn locked_tray_refuses_host_eject() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_cd(dir.path());
    let (mut machine, _lines) = machine_in(dir.path());
    ready_cd(&mut machine);

    let mut cdb = [0u8; 12];
    cdb[0] = 0x1E;
    cdb[4] = 1;
    atapi_packet(&mut machine, cdb);
    let _ = machine.io_read(SEC_BASE + 7);

    assert!(!machine.request_eject(DiskId::Cdrom0), "eject denied");
    assert!(machine.router().is_mounted(DiskId::Cdrom0), "disc stays in");

    atapi_packet(&mut machine, [0u8; 12]); // TEST UNIT READY
    let status = machine.io_read(SEC_BASE + 7).expect("status");
    assert_eq!(status & 0x01, 0x01, "check condition");
    let mut sense_cdb = [0u8; 12];
    sense_cdb[0] = 0x03;
    sense_cdb[4] = 18;
    atapi_packet(&mut machine, sense_cdb);
    let sense = atapi_response(&mut machine);
    assert_eq!(sense[2] & 0x0F, 2, "NOT READY");
    assert_eq!(sense[12], 0x53, "medium removal prevented");
}

/// Read TOC and Read Capacity agree on the lead-out for data discs.
#[test]
fn toc_leadout_matches_capacity() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_cd(dir.path());
    let (mut machine, _lines) = machine_in(dir.path());
    ready_cd(&mut machine);

    let mut cap_cdb = [0u8; 12];
    cap_cdb[0] = 0x25;
    atapi_packet(&mut machine, cap_cdb);
    let capacity = atapi_response(&mut machine);
    let last = u32::from_be_bytes([capacity[0], capacity[1], capacity[2], capacity[3]]);

    let mut toc_cdb = [0u8; 12];
    toc_cdb[0] = 0x43;
    toc_cdb[7] = 0x03;
    toc_cdb[8] = 0xFF;
    atapi_packet(&mut machine, toc_cdb);
    let toc = atapi_response(&mut machine);
    let leadout_entry = toc.len() - 8;
    assert_eq!(toc[leadout_entry + 2], 0xAA);
    let leadout = u32::from_be_bytes([
        toc[leadout_entry + 4],
        toc[leadout_entry + 5],
        toc[leadout_entry + 6],
        toc[leadout_entry + 7],
    ]);
    assert_eq!(leadout, last + 1);
}

/// IDENTIFY DEVICE through the primary channel carries the configured
/// model string.
#[test]
fn identify_device_model_number() {
    let dir = tempfile::tempdir().expect("tempdir");
    let hdd = dir.path().join("disk.img");
    std::fs::write(&hdd, vec![0u8; 16 * 63 * 512 * 4]).expect("hdd image");
    let (mut machine, lines) = machine_in(dir.path());
    assert!(machine.mount(DiskId::Hdd0, "disk.img", 0, false, 0));

    machine.io_write(0x1F6, 0xA0);
    machine.io_write(0x1F7, 0xEC); // IDENTIFY DEVICE
    assert!(lines.irq_level(14), "identify data ready on IRQ 14");
    let mut words = [0u16; 256];
    for word in &mut words {
        *word = machine.io_read16(0x1F0).expect("identify word");
    }
    let mut model = String::new();
    for word in &words[27..47] {
        model.push((word >> 8) as u8 as char);
        model.push(*word as u8 as char);
    }
    assert_eq!(model.trim_end(), "UniPCemu HDD0");
}

/// Flipping the secondary channel to native PCI mode moves its ports
/// to the BAR values.
#[test]
fn pci_native_mode_remaps_ports() {
    let dir = tempfile::tempdir().expect("tempdir");
    write_cd(dir.path());
    let (mut machine, _lines) = machine_in(dir.path());
    ready_cd(&mut machine);

    machine.pci_config_write(0x09, 0x04); // secondary native
    machine.pci_config_write(0x18, 0x60); // BAR2 = 0x260
    machine.pci_config_write(0x19, 0x02);
    machine.pci_config_write(0x1C, 0x64); // BAR3 = 0x264 -> control 0x266
    machine.pci_config_write(0x1D, 0x02);

    assert!(machine.io_read(0x170).is_none(), "legacy decode released");
    let status = machine.io_read(0x260 + 7).expect("native status");
    assert_ne!(status & 0x40, 0, "device ready behind the new ports");
    // Primary stays on the legacy ports.
    assert!(machine.io_read(0x1F7).is_some());
}
