//! Built-in classifier stages

mod centroid;
mod heuristic;
mod linear;

pub use centroid::CentroidStage;
pub use heuristic::PortHeuristicStage;
pub use linear::LinearModelStage;
