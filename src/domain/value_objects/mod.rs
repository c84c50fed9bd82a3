//! Value objects - Immutable objects defined by their attributes

mod dialog;
mod generation;
mod ids;

pub use dialog::{ActionCall, DialogTurn, TurnRole};
pub use generation::{GenerationParams, TurnResponse};
pub use ids::*;
