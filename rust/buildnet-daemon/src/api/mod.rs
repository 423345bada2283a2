//! HTTP adapter
//!
//! Thin axum translation layer over the core APIs plus the SSE bridge.

pub mod models;
pub mod rest;
pub mod sse;

pub use rest::ApiServer;
