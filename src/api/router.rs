//! Conversion service router.
//!
//! Returns a composable `Router` that can be mounted on any axum server.
//!
//! Layer stack (outermost → innermost):
//! 1. Request tracing → 2. Body size limit → handler

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::api::endpoints;
use crate::api::types::ApiContext;

/// Build the conversion router.
pub fn conversion_router(ctx: ApiContext) -> Router {
    let body_limit = ctx.max_upload_bytes;
    Router::new()
        .route("/convert/to/rios", post(endpoints::convert::to_standard))
        .route("/convert/from/rios", post(endpoints::convert::from_standard))
        .route("/ping", get(endpoints::health::ping))
        .with_state(ctx)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
}
