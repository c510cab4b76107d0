//! Retry helpers for storage startup.

pub mod retry;
