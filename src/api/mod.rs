//! HTTP surface of the conversion service.
//!
//! Two conversion routes (one per direction) plus a liveness check. Handlers
//! collect the multipart form, hand it to the synchronous pipeline on the
//! blocking pool, and map the outcome to an archive download or a JSON
//! error body.

pub mod endpoints;
pub mod error;
pub mod router;
pub mod server;
pub mod types;

pub use error::ApiError;
pub use router::conversion_router;
pub use server::{start_server, ConversionServer, ServerError};
pub use types::ApiContext;
