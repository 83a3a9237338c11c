//! Endpoint handlers, one module per feature.

pub mod convert;
pub mod health;
