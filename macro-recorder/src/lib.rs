//! Macro recorder
//!
//! Buffers keyboard and mouse events handed over by a capture layer and turns
//! them into a draft macro for the engine: taps, holds, combos, clicks, drags
//! and scrolls, separated by delays quantized to the configured precision.

pub mod convert;
pub mod error;
pub mod events;
pub mod recorder;

pub use convert::*;
pub use error::*;
pub use events::*;
pub use recorder::*;
