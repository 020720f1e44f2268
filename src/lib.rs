//! Brainstim controller library
//! Discovers a multi-channel neurostimulator over Bluetooth LE, keeps one
//! connection to it and sends it framed stimulation commands.

pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod state;
pub mod utils;
