//! # Application Layer
//!
//! The concurrency core: cancellable tasks, interruptible requests, task
//! groups, per-peer sessions and the command router.

pub mod dispatcher;
pub mod group;
pub mod request;
pub mod session;
pub mod task;

#[cfg(test)]
pub mod mock;
