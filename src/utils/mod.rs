//! Shared helpers for the binaries and broker plumbing.

pub mod bootstrap;
pub mod retry;
