//! Client side of networked character movement: prediction of the locally
//! controlled character, extrapolation of remote ones and correction smoothing.

mod plugin;
mod prediction;
mod proxy;
mod saved_move;
mod smoothing;

pub use plugin::{MovementScene, RenderScale, SimulatedCharacter, StriderSmoothingPlugin};
pub use prediction::{ClientPrediction, ClientPredictionData};
pub use proxy::{ReplicatedMovement, SimulatedProxy};
pub use saved_move::{PostUpdateMode, SavedMove};
pub use smoothing::{NetworkSmoothing, ReplaySample};
