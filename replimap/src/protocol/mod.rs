//! Replication protocol engine.
//!
//! Each connection goes through the same handshake whichever side dialed:
//!
//! 1. both sides send an identifier frame carrying their node id;
//! 2. for every bound channel, each side declares the newest timestamp it
//!    has seen from the other (`0` if never synced);
//! 3. each side replays its logs newer than what the peer declared, then
//!    keeps streaming records as they are written, with a checkpoint after
//!    every complete pass so the peer can advance its declared timestamp;
//! 4. heartbeats flow whenever the writer has been quiet for half an
//!    interval, and a reader that hears nothing for the configured multiple
//!    of the interval tears the connection down.

mod connection;
mod outbound;
mod state;

pub(crate) use connection::{run, Command, Session, SessionEnd};
pub use state::ConnectionState;
