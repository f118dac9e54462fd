//! # Infrastructure Layer
//!
//! Concrete transports: the OneBot HTTP client and the inbound webhook.

pub mod onebot;
pub mod webhook;
