// =============================================================================
// Broker adapter — trait seam, live client, demo simulator
// =============================================================================

pub mod client;
pub mod error;
pub mod sim;
pub mod types;

pub use client::{Broker, EtradeClient};
pub use error::BrokerError;
pub use sim::SimBroker;
