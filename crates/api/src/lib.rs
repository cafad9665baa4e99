//! HTTP API: trigger, drain and status endpoints for the extraction queue.

pub mod app;
pub mod middleware;
