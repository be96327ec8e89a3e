//! Client-side data resilience: a tiered cache, read strategies over it, and
//! optimistic mutations with offline queueing.

pub mod cache;
pub mod config;
pub mod error;
pub mod logging;
pub mod offline;
pub mod optimistic;
pub mod strategy;

pub use error::{Error, Result};
