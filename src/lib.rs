pub mod adapter;
pub mod agent;
pub mod clock;
pub mod config;
pub mod contract;
pub mod error;
pub mod foreman;
pub mod host;
pub mod pipeline;
pub mod readiness;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod tracker;

#[cfg(test)]
pub(crate) mod testing;
