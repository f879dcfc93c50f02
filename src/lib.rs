//! Namespaced memcache client with dependency-tag invalidation.

pub mod backend;
pub mod cache;
pub mod config;
pub mod error;
pub mod telemetry;
