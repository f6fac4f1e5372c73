#![forbid(unsafe_code)]

pub mod config;
pub mod error;
pub mod server;
pub mod store;
pub mod util;

#[cfg(test)]
mod testing;
