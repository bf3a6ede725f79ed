#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod auth;
pub mod comments;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod listing;
pub mod pipeline;
pub mod reddit;
pub mod session;
pub mod storage;
pub mod token;

#[cfg(test)]
mod testing;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::run;
