//! Primary-vertex identification and reconstruction emulation.

mod finder;
mod reconstruction;

pub use finder::PvFinder;
pub use reconstruction::{AxisSmearing, PvReconstruction, SmearingParametrization};
