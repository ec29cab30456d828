//! Crewlink — reliable task dispatch for agent crews over a shared filesystem.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod monitor;
pub mod park;
pub mod permission;
pub mod runtime;
pub mod store;
