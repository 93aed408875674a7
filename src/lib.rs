//! Almanac: server-state synchronization for the marketplace admin dashboard.

pub mod config;
pub mod error;
pub mod infra;
pub mod sync;
