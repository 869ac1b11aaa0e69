use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::ExportPayload;

#[derive(Debug, Deserialize)]
pub struct SanitizeRequest {
    /// Raw candidate list.
    #[serde(default)]
    pub candidates: Option<Value>,
    /// Free-form model output containing the candidates as JSON.
    #[serde(default)]
    pub output: Option<String>,
    pub max_n: Option<usize>,
}

#[derive(Debug, Deserialize)]
pub struct ExportRequest {
    #[serde(default)]
    pub image: String,
    #[serde(flatten)]
    pub payload: ExportPayload,
    /// Answer to "delete extra records?" for this export.
    #[serde(default)]
    pub confirm_delete: bool,
}

#[derive(Debug, Serialize)]
pub struct APIResponse<T> {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> APIResponse<T> {
    pub fn new(msg: Option<&str>, data: Option<T>) -> Self {
        APIResponse {
            status: msg.unwrap_or_default().to_owned(),
            data,
        }
    }
}

impl APIResponse<()> {
    pub fn new_from_msg(msg: &str) -> Self {
        APIResponse {
            status: msg.to_owned(),
            data: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_request_reads_wire_format() {
        let req: ExportRequest = serde_json::from_str(
            r#"{"image":"a.png","masks":[{"x":0,"y":0,"w":0.5,"h":0.5,"label":"l"}],"meta":{"title":"T","explanation":"E"},"confirm_delete":true}"#,
        )
        .unwrap();
        assert_eq!(req.image, "a.png");
        assert_eq!(req.payload.masks.len(), 1);
        assert_eq!(req.payload.meta.map(|m| m.title), Some("T".to_string()));
        assert!(req.confirm_delete);
    }

    #[test]
    fn confirm_delete_defaults_to_false() {
        let req: ExportRequest = serde_json::from_str(r#"{"image":"a.png","masks":[]}"#).unwrap();
        assert!(!req.confirm_delete);
        assert!(req.payload.meta.is_none());
    }

    #[test]
    fn response_omits_missing_data() {
        let body = serde_json::to_value(APIResponse::new(None, None::<()>)).unwrap();
        assert_eq!(body, serde_json::json!({"status": ""}));
        let body = serde_json::to_value(APIResponse::new(Some("ok"), Some(3))).unwrap();
        assert_eq!(body, serde_json::json!({"status": "ok", "data": 3}));
    }
}
