use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use tracing::info;

use crate::api::{APIResponse, ExportRequest, SanitizeRequest};
use crate::config::Config;
use crate::db::Database;
use crate::error::{ExportError, HandlerError, PersistenceError};
use crate::model::GroupId;
use crate::sanitize;
use crate::session::EditSession;
use crate::suggest::{self, TranscriptProvider};
use crate::sync::PresetNotifier;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub cfg: Arc<Config>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(healthcheck))
        .route("/masks/sanitize", post(sanitize_masks))
        .route("/groups", post(create_group))
        .route("/groups/:id", get(get_group).put(update_group))
        .with_state(state)
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        let msg = crate::unpack_error(&self);
        let status = match &self {
            HandlerError::ValidationError(_) | HandlerError::Sanitize(_) | HandlerError::Provider(_) => {
                StatusCode::BAD_REQUEST
            }
            HandlerError::Export(ExportError::Persistence(PersistenceError::GroupNotFound(_)))
            | HandlerError::Persistence(PersistenceError::GroupNotFound(_)) => StatusCode::NOT_FOUND,
            HandlerError::Export(ExportError::Persistence(_)) | HandlerError::Persistence(_) => {
                tracing::error!("request failed: {}", msg);
                StatusCode::INTERNAL_SERVER_ERROR
            }
            HandlerError::Export(_) => StatusCode::BAD_REQUEST,
        };
        match status {
            StatusCode::BAD_REQUEST => crate::bad_request(APIResponse::new_from_msg(&msg)),
            StatusCode::INTERNAL_SERVER_ERROR => crate::server_error(APIResponse::new_from_msg(&msg)),
            _ => (status, Json(APIResponse::new_from_msg(&msg))).into_response(),
        }
    }
}

pub async fn healthcheck() -> impl IntoResponse {
    info!("got healthcheck request");
    Json(APIResponse::new(Some("ok"), None::<()>))
}

pub async fn sanitize_masks(
    State(state): State<AppState>,
    Json(req): Json<SanitizeRequest>,
) -> Result<Response, HandlerError> {
    let mut opts = state.cfg.masks.sanitize_options();
    if let Some(max_n) = req.max_n {
        opts.max_n = max_n;
    }

    let masks = match (req.candidates, req.output) {
        (Some(candidates), _) => sanitize::sanitize(&candidates, &opts)?,
        (None, Some(output)) => {
            let provider = TranscriptProvider { output };
            suggest::suggest_masks(&provider, &[], "", &opts, state.cfg.masks.suggest_timeout()).await?
        }
        (None, None) => {
            return Err(HandlerError::ValidationError(
                "either candidates or output is required".to_string(),
            ));
        }
    };

    tracing::info!(kept = masks.len(), "sanitized masks");
    Ok(crate::good_response(APIResponse::new(Some("sanitized masks"), Some(masks))))
}

pub async fn create_group(
    State(state): State<AppState>,
    Json(req): Json<ExportRequest>,
) -> Result<Response, HandlerError> {
    let mut session = EditSession::open_create();
    session.set_image(&req.image);
    session.apply_export(&req.payload, state.cfg.masks.label_max_chars)?;

    let mut gateway = state.db.gateway().await;
    let report = session
        .export(&mut gateway, &PresetNotifier(req.confirm_delete), &state.cfg.notes)
        .await?;

    tracing::info!(group = %report.group, "created group");
    Ok((StatusCode::CREATED, Json(APIResponse::new(Some("created group"), Some(report)))).into_response())
}

pub async fn get_group(State(state): State<AppState>, Path(id): Path<String>) -> Result<Response, HandlerError> {
    let group = GroupId::new(id);
    let mut gateway = state.db.gateway().await;
    let session = EditSession::open_edit(&mut gateway, &group).await?;
    Ok(crate::good_response(APIResponse::new(Some("got group"), Some(session))))
}

pub async fn update_group(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExportRequest>,
) -> Result<Response, HandlerError> {
    let group = GroupId::new(id);
    let mut gateway = state.db.gateway().await;

    let mut session = EditSession::open_edit(&mut gateway, &group).await?;
    if !req.image.is_empty() {
        session.image = req.image.clone();
    }
    session.apply_export(&req.payload, state.cfg.masks.label_max_chars)?;

    let report = session
        .export(&mut gateway, &PresetNotifier(req.confirm_delete), &state.cfg.notes)
        .await?;

    let msg = if report.is_clean() { "group updated" } else { "group updated with failures" };
    Ok(crate::good_response(APIResponse::new(Some(msg), Some(report))))
}
