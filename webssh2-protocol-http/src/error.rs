use poem::http::StatusCode;
use poem::{IntoResponse, Response};
use serde_json::json;
use tracing::*;
use webssh2_common::Webssh2Error;

/// Maps route errors onto the documented JSON error shape: typed gateway
/// errors expose their message and code, anything else collapses into a
/// generic 500.
pub fn error_to_response(error: poem::Error) -> Response {
    if let Some(typed) = error.downcast_ref::<Webssh2Error>() {
        let status = error.status();
        let mut body = json!({ "error": typed.to_string() });
        if let Some(code) = typed.code() {
            body["code"] = json!(code);
        }
        return (status, poem::web::Json(body)).into_response();
    }

    let status = error.status();
    if status.is_client_error() {
        return (status, poem::web::Json(json!({ "error": error.to_string() })))
            .into_response();
    }

    error!(%error, "Unhandled request error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        poem::web::Json(json!({ "error": "An unexpected error occurred" })),
    )
        .into_response()
}
