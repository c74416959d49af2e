//! HTTP API: ingest endpoints, request-log producer, service wiring.

pub mod app;
pub mod config;
pub mod middleware;
