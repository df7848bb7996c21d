pub mod events;
pub mod ids;
pub mod state;

pub use state::{NodeState, StateProvider};
