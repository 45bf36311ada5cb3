#![forbid(unsafe_code)]

pub mod cache;
pub mod checkpoint;
pub mod cli;
pub mod commands;
pub mod config;
pub mod discover;
pub mod epub;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod formats;
pub mod ingest;
pub mod logging;
pub mod manifest;
pub mod render;
pub mod retry;
pub mod store;
pub mod throttle;
pub mod validate;
