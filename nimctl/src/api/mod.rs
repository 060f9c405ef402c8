//! HTTP API: request/response models and endpoint handlers.

pub mod handlers;
pub mod models;
