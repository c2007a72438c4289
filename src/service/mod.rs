mod state;
mod types;

pub use state::State;
pub use types::{ClientRecord, Group, Tally, Vote};
