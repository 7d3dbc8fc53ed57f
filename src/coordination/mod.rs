//! Swap coordination
//!
//! The coordination layer:
//! 1. Forwards a committed inbound swap to the outbound rail and settles it
//! 2. Drives each trade from quote to a finalized row
//! 3. Replays unfinished trades once after startup

pub mod forwarder;
pub mod orchestrator;

pub use orchestrator::TradeOrchestrator;
