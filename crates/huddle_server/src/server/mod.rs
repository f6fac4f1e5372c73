#![forbid(unsafe_code)]

pub mod access;
pub mod api;
pub mod health;
pub mod hub;
pub mod listener;
pub mod realtime;
pub mod token;


#[cfg(test)]
mod api_tests;
