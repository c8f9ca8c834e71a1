//! Core traits and types for time-driven device emulation.
//!
//! The host clocks every device in nanosecond increments. All component
//! timing derives from `update(Δt)` calls carrying fractional nanoseconds.

mod dma;
mod irq;
mod observable;
mod timing;

pub use dma::{DmaBus, DreqProbe};
pub use irq::{IrqLine, IrqProbe};
pub use observable::{Observable, Value};
pub use timing::{NanoTimer, Nanos};
