pub mod benchmark;
pub mod config;
pub mod counters;
pub mod display;
pub mod errors;
pub mod iteration;
pub mod metrics;
pub mod prefetch;
pub mod preload;
pub mod profile;
pub mod runner;
pub mod service;
pub mod target;
pub mod trace;
pub mod types;
pub mod workingset;

#[cfg(test)]
pub(crate) mod testing;
