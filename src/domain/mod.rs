pub mod measurement;
pub mod pv;

pub use measurement::*;
pub use pv::*;
