//! Price feeder library.
//!
//! A validator sidecar that samples exchange prices from several markets,
//! aggregates them into one price per asset and votes that price on-chain
//! every voting period.

pub mod chain;
pub mod config;
pub mod oracle;
pub mod providers;
pub mod server;
pub mod telemetry;
pub mod types;
