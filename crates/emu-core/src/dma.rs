//! DMA controller collaborator interface.
//!
//! Only the request line is driven outward; the data path runs the other
//! way (the controller calls the device's own DACK read/write entry
//! points and signals terminal count to it directly).

/// The DMA controller as seen by a device: a per-channel request line.
pub trait DmaBus {
    /// Assert or release DREQ for a channel.
    fn set_dreq(&mut self, channel: u8, level: bool);
}

/// Recording [`DmaBus`] for tests.
#[derive(Debug, Default)]
pub struct DreqProbe {
    level: [bool; 8],
}

impl DreqProbe {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn level(&self, channel: u8) -> bool {
        self.level[channel as usize & 7]
    }
}

impl DmaBus for DreqProbe {
    fn set_dreq(&mut self, channel: u8, level: bool) {
        self.level[channel as usize & 7] = level;
    }
}
