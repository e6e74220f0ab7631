//! Repository implementations for database operations

pub mod bars;
pub mod baselines;
pub mod flow;
pub mod pending;

pub use bars::*;
pub use baselines::*;
pub use flow::*;
pub use pending::*;
