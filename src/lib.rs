// src/lib.rs
pub mod config;
pub mod utils;
pub mod pipelines;
pub mod store;
pub mod cli;
pub use cli::{Arguments, Layout};
