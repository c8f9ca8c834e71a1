//! Red Book audio playback out of CUE audio tracks.
//!
//! The player walks the disc one 2352-byte frame at a time, emitting
//! 44.1 kHz stereo samples on its own timer. Gaps play silence; a
//! crossing into a data track or the end position stops playback.

use emu_core::{NanoTimer, Nanos};
use format_cue::Msf;

/// 588 stereo samples per CD frame (2352 bytes / 4).
pub const SAMPLES_PER_FRAME: usize = 588;
/// One 44.1 kHz sample period in nanoseconds.
const SAMPLE_PERIOD_NS: Nanos = 1_000_000_000.0 / 44_100.0;

/// Audio-status codes reported through READ SUBCHANNEL.
pub const AUDIO_STATUS_PLAYING: u8 = 0x11;
pub const AUDIO_STATUS_PAUSED: u8 = 0x12;
pub const AUDIO_STATUS_COMPLETED: u8 = 0x13;
pub const AUDIO_STATUS_ERROR: u8 = 0x14;
pub const AUDIO_STATUS_NONE: u8 = 0x15;

/// Player state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayerStatus {
    Initialized,
    Playing,
    Paused,
    Scanning,
}

/// What the disc returned for one requested frame.
pub enum FrameFetch {
    /// 2352 bytes of audio data.
    Audio(Box<[u8; 2352]>),
    /// Pregap/postgap: silence.
    Gap,
    /// The next frame is a data track: end of the audio user area.
    EndOfUserArea,
    /// Past the lead-out.
    OutOfRange,
}

/// One device's audio playback engine and its PCM output buffer.
pub struct AudioPlayer {
    pub(crate) status: PlayerStatus,
    /// A finished play reports 0x13 exactly once.
    completed_once: bool,
    errored: bool,
    /// Current and one-past-last frame of the programmed play range.
    pub(crate) position: u32,
    pub(crate) end: u32,
    pub(crate) last_played: Msf,
    pub(crate) track: u8,
    frame: [u8; 2352],
    sample_index: usize,
    frame_valid: bool,
    sample_timer: NanoTimer,
    /// Interleaved stereo PCM awaiting the sink.
    pcm: Vec<i16>,
}

impl AudioPlayer {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: PlayerStatus::Initialized,
            completed_once: false,
            errored: false,
            position: 0,
            end: 0,
            last_played: Msf::new(0, 0, 0),
            track: 0,
            frame: [0; 2352],
            sample_index: 0,
            frame_valid: false,
            sample_timer: NanoTimer::new(),
            pcm: Vec::new(),
        }
    }

    #[must_use]
    pub fn status(&self) -> PlayerStatus {
        self.status
    }

    #[must_use]
    pub fn is_playing(&self) -> bool {
        matches!(self.status, PlayerStatus::Playing | PlayerStatus::Scanning)
    }

    #[must_use]
    pub fn position(&self) -> u32 {
        self.position
    }

    /// Begin playback over `[start, end)` disc frames.
    pub fn play(&mut self, start: u32, end: u32, track: u8) {
        self.position = start;
        self.end = end;
        self.track = track;
        self.sample_index = 0;
        self.frame_valid = false;
        self.completed_once = false;
        self.errored = false;
        self.status = PlayerStatus::Playing;
        self.sample_timer.arm(SAMPLE_PERIOD_NS);
    }

    pub fn pause(&mut self) {
        if self.status == PlayerStatus::Playing {
            self.status = PlayerStatus::Paused;
            self.sample_timer.disarm();
        }
    }

    pub fn resume(&mut self) {
        if self.status == PlayerStatus::Paused {
            self.status = PlayerStatus::Playing;
            self.sample_timer.arm(SAMPLE_PERIOD_NS);
        }
    }

    /// Stop without marking completion (STOP PLAY/SCAN, eject).
    pub fn stop(&mut self) {
        self.status = PlayerStatus::Initialized;
        self.sample_timer.disarm();
        self.frame_valid = false;
    }

    fn finish(&mut self, ok: bool) {
        self.status = PlayerStatus::Initialized;
        self.sample_timer.disarm();
        self.frame_valid = false;
        self.completed_once = ok;
        self.errored = !ok;
    }

    /// Status for READ SUBCHANNEL; completion reports exactly once.
    pub fn effective_status(&mut self) -> u8 {
        match self.status {
            PlayerStatus::Playing | PlayerStatus::Scanning => AUDIO_STATUS_PLAYING,
            PlayerStatus::Paused => AUDIO_STATUS_PAUSED,
            PlayerStatus::Initialized => {
                if self.completed_once {
                    self.completed_once = false;
                    AUDIO_STATUS_COMPLETED
                } else if self.errored {
                    self.errored = false;
                    AUDIO_STATUS_ERROR
                } else {
                    AUDIO_STATUS_NONE
                }
            }
        }
    }

    /// Status without consuming the one-shot completion report.
    #[must_use]
    pub fn effective_status_peek(&self) -> u8 {
        match self.status {
            PlayerStatus::Playing | PlayerStatus::Scanning => AUDIO_STATUS_PLAYING,
            PlayerStatus::Paused => AUDIO_STATUS_PAUSED,
            PlayerStatus::Initialized => {
                if self.completed_once {
                    AUDIO_STATUS_COMPLETED
                } else if self.errored {
                    AUDIO_STATUS_ERROR
                } else {
                    AUDIO_STATUS_NONE
                }
            }
        }
    }

    /// Drain the PCM produced since the last call (interleaved stereo).
    pub fn take_pcm(&mut self) -> Vec<i16> {
        std::mem::take(&mut self.pcm)
    }

    /// Advance playback. `fetch` resolves one disc frame.
    pub fn tick<F>(&mut self, dt: Nanos, mut fetch: F)
    where
        F: FnMut(u32) -> FrameFetch,
    {
        if self.status != PlayerStatus::Playing && self.status != PlayerStatus::Scanning {
            return;
        }
        self.sample_timer.advance(dt);
        while self.sample_timer.fire() {
            if !self.frame_valid {
                if self.position >= self.end {
                    self.finish(true);
                    return;
                }
                match fetch(self.position) {
                    FrameFetch::Audio(data) => {
                        self.frame = *data;
                        self.frame_valid = true;
                        self.last_played = Msf::from_lba(self.position);
                    }
                    FrameFetch::Gap => {
                        // Gaps carry silence and keep the clock running.
                        self.frame = [0; 2352];
                        self.frame_valid = true;
                        self.last_played = Msf::from_lba(self.position);
                    }
                    FrameFetch::EndOfUserArea => {
                        self.finish(true);
                        return;
                    }
                    FrameFetch::OutOfRange => {
                        self.finish(false);
                        return;
                    }
                }
                self.sample_index = 0;
            }
            let offset = self.sample_index * 4;
            let left = i16::from_le_bytes([self.frame[offset], self.frame[offset + 1]]);
            let right = i16::from_le_bytes([self.frame[offset + 2], self.frame[offset + 3]]);
            self.pcm.push(left);
            self.pcm.push(right);
            self.sample_index += 1;
            if self.sample_index >= SAMPLES_PER_FRAME {
                self.frame_valid = false;
                self.position += 1;
            }
        }
    }
}

impl Default for AudioPlayer {
    fn default() -> Self {
        Self::new()
    }
}
