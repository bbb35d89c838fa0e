pub mod state_store;

pub use state_store::{load_state, save_state, Recovered, RecoverySource, StateStore};
