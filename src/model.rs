use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::ExportError;

/// Smallest width/height a mask is clamped to.
pub const MIN_SIDE: f64 = 0.001;
pub const LABEL_MAX_CHARS: usize = 120;
pub const PAYLOAD_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaskSource {
    #[default]
    User,
    Ai,
}

/// A normalized rectangle, top-left anchored, fully inside the unit square.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mask {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub source: MaskSource,
}

pub type MaskList = Vec<Mask>;

impl Mask {
    /// Clamps the rectangle into the unit square. Callers must have rejected
    /// non-finite and non-positive sizes already.
    pub fn clamped(x: f64, y: f64, w: f64, h: f64, label: &str, max_chars: usize, source: MaskSource) -> Self {
        // keep room for a minimum-size rect at the far edge
        let x = x.clamp(0.0, 1.0 - MIN_SIDE);
        let y = y.clamp(0.0, 1.0 - MIN_SIDE);
        let w = w.min(1.0 - x).max(MIN_SIDE);
        let h = h.min(1.0 - y).max(MIN_SIDE);
        Mask {
            x,
            y,
            w,
            h,
            label: truncate_chars(label, max_chars),
            source,
        }
    }

    pub fn area(&self) -> f64 {
        self.w.max(0.0) * self.h.max(0.0)
    }

    /// Intersection over union. Zero when the rectangles are disjoint or
    /// either one has no area.
    pub fn iou(&self, other: &Mask) -> f64 {
        let ix0 = self.x.max(other.x);
        let iy0 = self.y.max(other.y);
        let ix1 = (self.x + self.w).min(other.x + other.w);
        let iy1 = (self.y + self.h).min(other.y + other.h);

        let inter = (ix1 - ix0).max(0.0) * (iy1 - iy0).max(0.0);
        if inter <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - inter;
        if union > 0.0 { inter / union } else { 0.0 }
    }
}

pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => s[..byte_idx].to_string(),
        None => s.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupId(String);

impl GroupId {
    pub fn new(id: impl Into<String>) -> Self {
        GroupId(id.into())
    }

    /// Fresh 12 hex character id for a group exported for the first time.
    pub fn generate() -> Self {
        let hex = uuid::Uuid::new_v4().simple().to_string();
        GroupId(hex[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque handle of a persisted record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordRef(pub i64);

impl fmt::Display for RecordRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "record#{}", self.0)
    }
}

/// The persisted fields of one record. `no` stays a string because stored
/// values are not trusted to be numeric.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFields {
    pub group_id: String,
    pub no: String,
    pub image_file: String,
    pub image_html: String,
    pub sort_key: String,
    pub title: String,
    pub explanation: String,
    pub mask_label: String,
    pub internal: String,
}

impl RecordFields {
    /// 0-based position this record claims, if its stored number is usable.
    pub fn position(&self) -> Option<usize> {
        match self.no.trim().parse::<i64>() {
            Ok(no) if no > 0 => Some((no - 1) as usize),
            _ => None,
        }
    }

    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for part in [
            &self.group_id,
            &self.no,
            &self.image_file,
            &self.image_html,
            &self.sort_key,
            &self.title,
            &self.explanation,
            &self.mask_label,
            &self.internal,
        ] {
            hasher.update(part.as_bytes());
            hasher.update([0x1fu8]);
        }
        hex::encode(hasher.finalize())
    }

    pub fn payload(&self) -> Option<InternalPayload> {
        InternalPayload::unpack(&self.internal)
    }
}

/// Full snapshot of the group stored on every record, so any single record
/// is enough to reopen the editing session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InternalPayload {
    pub v: u32,
    pub image: String,
    pub group: String,
    pub active: usize,
    pub masks: MaskList,
    pub mask_label: String,
}

impl InternalPayload {
    pub fn new(image: &str, group: &GroupId, active: usize, masks: &[Mask], mask_label: &str) -> Self {
        InternalPayload {
            v: PAYLOAD_VERSION,
            image: image.to_string(),
            group: group.as_str().to_string(),
            active,
            masks: masks.to_vec(),
            mask_label: mask_label.to_string(),
        }
    }

    pub fn pack(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(error = %e, "failed to encode internal payload");
            "{}".to_string()
        })
    }

    /// `None` for empty, undecodable or unversioned text.
    pub fn unpack(s: &str) -> Option<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return None;
        }
        let payload: InternalPayload = serde_json::from_str(trimmed).ok()?;
        if payload.v < PAYLOAD_VERSION {
            return None;
        }
        Some(payload)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WireMask {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub source: Option<MaskSource>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Meta {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub explanation: String,
}

/// What the editor hands over on export.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ExportPayload {
    #[serde(default)]
    pub masks: Vec<WireMask>,
    #[serde(default)]
    pub meta: Option<Meta>,
}

impl ExportPayload {
    /// Converts user masks into a MaskList. Positions are identity, so a bad
    /// mask rejects the whole export instead of being skipped.
    pub fn mask_list(&self, max_chars: usize) -> Result<MaskList, ExportError> {
        self.masks
            .iter()
            .enumerate()
            .map(|(position, m)| {
                if ![m.x, m.y, m.w, m.h].iter().all(|v| v.is_finite()) {
                    return Err(ExportError::InvalidMask {
                        position,
                        reason: "non-finite coordinate",
                    });
                }
                if m.w <= 0.0 || m.h <= 0.0 {
                    return Err(ExportError::InvalidMask {
                        position,
                        reason: "non-positive size",
                    });
                }
                Ok(Mask::clamped(
                    m.x,
                    m.y,
                    m.w,
                    m.h,
                    m.label.as_deref().unwrap_or(""),
                    max_chars,
                    m.source.unwrap_or_default(),
                ))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rect(x: f64, y: f64, w: f64, h: f64) -> Mask {
        Mask {
            x,
            y,
            w,
            h,
            label: String::new(),
            source: MaskSource::User,
        }
    }

    #[test]
    fn iou_of_disjoint_and_identical_rects() {
        let a = rect(0.0, 0.0, 0.2, 0.2);
        let b = rect(0.5, 0.5, 0.2, 0.2);
        assert_eq!(a.iou(&b), 0.0);
        assert!((a.iou(&a) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn iou_of_touching_rects_is_zero() {
        let a = rect(0.0, 0.0, 0.5, 0.5);
        let b = rect(0.5, 0.0, 0.5, 0.5);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn iou_with_zero_area_is_zero() {
        let a = rect(0.1, 0.1, 0.0, 0.3);
        let b = rect(0.0, 0.0, 1.0, 1.0);
        assert_eq!(a.iou(&b), 0.0);
    }

    #[test]
    fn truncates_on_char_boundaries() {
        let label = "é".repeat(130);
        let cut = truncate_chars(&label, 120);
        assert_eq!(cut.chars().count(), 120);
        assert_eq!(truncate_chars("short", 120), "short");
    }

    #[test]
    fn position_ignores_malformed_numbers() {
        let mut fields = RecordFields::default();
        for (no, expected) in [("3", Some(2)), (" 1 ", Some(0)), ("0", None), ("-2", None), ("abc", None), ("", None)] {
            fields.no = no.to_string();
            assert_eq!(fields.position(), expected, "no = {:?}", no);
        }
    }

    #[test]
    fn payload_uses_compact_wire_keys() {
        let group = GroupId::new("abc123");
        let masks = vec![rect(0.1, 0.2, 0.3, 0.4)];
        let packed = InternalPayload::new("img.png", &group, 0, &masks, "lbl").pack();

        assert!(packed.starts_with(r#"{"v":1,"image":"img.png","group":"abc123","active":0,"masks":["#));
        assert!(!packed.contains(' '));
        assert_eq!(InternalPayload::unpack(&packed).map(|p| p.masks), Some(masks));
    }

    #[test]
    fn unpack_rejects_garbage_and_unversioned() {
        assert!(InternalPayload::unpack("").is_none());
        assert!(InternalPayload::unpack("not json").is_none());
        assert!(
            InternalPayload::unpack(r#"{"v":0,"image":"","group":"","active":0,"masks":[],"mask_label":""}"#).is_none()
        );
    }

    #[test]
    fn export_rejects_degenerate_masks_by_position() {
        let payload: ExportPayload = serde_json::from_str(
            r#"{"masks":[{"x":0.1,"y":0.1,"w":0.2,"h":0.2},{"x":0.1,"y":0.1,"w":0.0,"h":0.2}]}"#,
        )
        .unwrap();
        match payload.mask_list(LABEL_MAX_CHARS) {
            Err(ExportError::InvalidMask { position, .. }) => assert_eq!(position, 1),
            other => panic!("expected invalid mask, got {:?}", other),
        }
    }

    #[test]
    fn export_clamps_user_masks_into_unit_square() {
        let payload: ExportPayload =
            serde_json::from_str(r#"{"masks":[{"x":0.9,"y":-0.2,"w":0.5,"h":0.4,"label":"a"}]}"#).unwrap();
        let masks = payload.mask_list(LABEL_MAX_CHARS).unwrap();
        let m = &masks[0];
        assert_eq!(m.y, 0.0);
        assert!(m.x + m.w <= 1.0 + 1e-12);
        assert_eq!(m.source, MaskSource::User);
        assert_eq!(m.label, "a");
    }

    #[test]
    fn generated_group_ids_are_twelve_hex_chars() {
        let id = GroupId::generate();
        assert_eq!(id.as_str().len(), 12);
        assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }
}
