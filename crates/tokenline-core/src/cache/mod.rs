//! Client-side query caching.
//!
//! This module provides the `QueryCache` for keeping decoded API responses
//! in memory. Entries are considered stale after a configurable TTL, and
//! mutations invalidate the key prefixes they affect.
//!
//! Fetches that fail transiently (5xx, network, timeout) are retried with
//! exponential backoff per `RetryPolicy`.

pub mod query;

pub use query::{CachedData, QueryCache, RetryPolicy};
