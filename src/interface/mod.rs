//! # Interface Layer
//!
//! Built-in command handlers registered with the router.

pub mod commands;
