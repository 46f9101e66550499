//! Tidemark CLI - configuration and bootstrap for the aggregation job.

pub mod config;
