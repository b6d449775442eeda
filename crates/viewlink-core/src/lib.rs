//! Core types, config, errors, and command formatting for Viewlink.

pub mod config;
pub mod error;
pub mod protocol;
pub mod types;
