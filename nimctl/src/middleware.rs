//! HTTP middleware: per-request IDs and CORS.
//!
//! Every response carries an `X-Request-ID` header. The id is minted before
//! the handler runs and stashed in request extensions, so submission
//! handlers can use the same id for the durable record; the value a client
//! reads off the response is exactly what `/get` and `/stream` accept.

use axum::{
    extract::Request,
    http::{HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// The id minted for the current HTTP request.
#[derive(Debug, Clone, Copy)]
pub struct ApiRequestId(pub Uuid);

pub async fn request_id_middleware(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4();
    request.extensions_mut().insert(ApiRequestId(request_id));

    let mut response = next.run(request).await;

    let header = HeaderName::from_static(REQUEST_ID_HEADER);
    if !response.headers().contains_key(&header) {
        if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
            response.headers_mut().insert(header, value);
        }
    }
    response
}

/// Permissive CORS: any origin, any method, any header, with the request-id
/// header exposed so browser clients can read it.
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([HeaderName::from_static(REQUEST_ID_HEADER)])
}
