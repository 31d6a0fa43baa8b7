//! Steps, position mapping and transactions.

pub mod map;
mod replace;
pub mod step;
pub mod transaction;

pub use map::{Bias, MapResult, Mapping, StepMap};
pub use step::{Step, StepJson};
pub use transaction::{Applied, Transaction, Transform};
