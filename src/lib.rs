use crate::api::APIResponse;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;
use std::error::Error;

pub mod api;
pub mod config;
pub mod db;
pub mod error;
pub mod handler;
pub mod model;
pub mod sanitize;
pub mod session;
pub mod suggest;
pub mod sync;

pub fn server_error(body: APIResponse<()>) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

pub fn bad_request(body: APIResponse<()>) -> Response {
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

fn good_response<T: Serialize>(body: APIResponse<T>) -> Response {
    (StatusCode::OK, Json(body)).into_response()
}

pub fn unpack_error(err: &(dyn Error)) -> String {
    let mut parts = Vec::new();
    parts.push(err.to_string());
    let mut current = err.source();
    while let Some(source) = current {
        let msg = source.to_string();
        // wrappers often repeat their source's message
        if !parts.last().is_some_and(|p: &String| p.ends_with(&msg)) {
            parts.push(msg);
        }
        current = source.source();
    }
    parts.join(": ")
}
