//! # Domain Layer
//!
//! Configuration, message model, error taxonomy and the gateway seam.

pub mod config;
pub mod error;
pub mod message;
pub mod traits;
