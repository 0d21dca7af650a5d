//! Response cache coordination in front of an asynchronous page renderer.

pub mod cache;
pub mod config;
pub mod infra;
pub mod render;
