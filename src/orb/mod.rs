// =============================================================================
// ORB engine — opening-range capture and breakout signal generation
// =============================================================================

pub mod quality;
pub mod range;
pub mod signals;

pub use range::{OrbBook, OrbData};
pub use signals::{OrbSignal, SignalEngine};
