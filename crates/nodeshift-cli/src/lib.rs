//! Nodeshift command-line support: configuration loading and adapter wiring

pub mod config;
pub mod runtime;
