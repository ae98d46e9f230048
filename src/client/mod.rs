//! Edge client: connection, chunk playback, and the five-state control loop.

pub mod chunk_player;
pub mod connection;
pub mod state_machine;

pub use chunk_player::ChunkPlayer;
pub use connection::{InboundEvent, ServerConnection};
pub use state_machine::{ClientState, ClientStateMachine};
