//! Supervision of a Terraria dedicated server: launches the process, parses
//! its console output into game events, paces commands into its stdin, and
//! flags connections that never identify as a player.

pub mod command_queue;
pub mod config;
pub mod console;
pub mod correlator;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod launch;
pub mod logging;
pub mod players;
pub mod state;
pub mod supervisor;

pub use config::{CorrelatorConfig, SupervisorConfig, Verbosity};
pub use error::SupervisorError;
pub use supervisor::{ProcessPhase, TerrariaServer};
