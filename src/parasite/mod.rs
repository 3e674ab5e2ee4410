//! Parasite injection engine: blob transport (spec §4.4), the command set
//! and argument layouts (spec §4.5), and the control channel that drives
//! them (spec §4.5).

pub mod commands;
pub mod control;
pub mod transport;

pub use commands::CommandCode;
pub use transport::ParasiteBlob;
