#[macro_use]
extern crate tracing;

pub mod collector;
pub mod daemon;
pub mod discovery;
pub mod http;
pub mod pool;
pub mod projects;
pub mod server;
pub mod signal;
pub mod snapshot;
pub mod synthesizer;
pub mod targets;
pub mod trace;

#[cfg(test)]
mod testing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T> = std::result::Result<T, Error>;
