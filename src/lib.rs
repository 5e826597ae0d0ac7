pub mod config;
pub mod engine;
pub mod error;
pub mod render;
pub mod state;
pub mod status;
pub mod supervisor;
pub mod web;

#[cfg(test)]
mod testing;
