//! Authoritative side of the movement protocol: validates client timestamps,
//! replays client moves and decides between acks and corrections.

mod move_handler;
mod prediction;

pub use move_handler::{LogObserver, MoveObserver, ServerMoveHandler};
pub use prediction::{PendingAdjustment, ServerPredictionData, TimeDiscrepancyReport, TimeStampCheck};
