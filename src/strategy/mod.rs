pub mod drift;
pub mod state_updater;
pub mod triggers;

pub use drift::*;
pub use state_updater::*;
pub use triggers::*;
