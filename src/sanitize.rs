//! Cleanup of machine-suggested masks.
//!
//! Suggestions arrive as loosely typed JSON. Each candidate is validated,
//! clamped into the unit square and filtered by area; the survivors are
//! deduplicated with a greedy non-maximum suppression that favours larger
//! regions. Malformed entries are dropped silently.

use serde_json::Value;

use crate::error::{ProviderError, SanitizeError};
use crate::model::{Mask, MaskList, MaskSource, Meta};

#[derive(Debug, Clone, PartialEq)]
pub struct SanitizeOptions {
    /// Upper bound on kept masks.
    pub max_n: usize,
    /// A candidate whose IoU with a kept mask reaches this value is dropped.
    pub iou_threshold: f64,
    pub min_area: f64,
    pub label_max_chars: usize,
}

impl Default for SanitizeOptions {
    fn default() -> Self {
        SanitizeOptions {
            max_n: 24,
            iou_threshold: 0.70,
            min_area: 0.0004,
            label_max_chars: crate::model::LABEL_MAX_CHARS,
        }
    }
}

impl SanitizeOptions {
    pub fn with_max_n(mut self, max_n: usize) -> Self {
        self.max_n = max_n;
        self
    }
}

/// Sanitizes a JSON list of raw candidates. Fails only when `candidates`
/// is not a list.
pub fn sanitize(candidates: &Value, opts: &SanitizeOptions) -> Result<MaskList, SanitizeError> {
    match candidates {
        Value::Array(items) => Ok(sanitize_candidates(items, opts)),
        other => Err(SanitizeError::NotASequence(json_kind(other))),
    }
}

pub fn sanitize_candidates<'a, I>(candidates: I, opts: &SanitizeOptions) -> MaskList
where
    I: IntoIterator<Item = &'a Value>,
{
    let mut received = 0usize;
    let mut cleaned: Vec<Mask> = candidates
        .into_iter()
        .inspect(|_| received += 1)
        .filter_map(|raw| validate(raw, opts))
        .collect();

    // stable: equal areas keep their input order
    cleaned.sort_by(|a, b| b.area().total_cmp(&a.area()));

    let valid = cleaned.len();
    let mut kept: MaskList = Vec::with_capacity(opts.max_n.min(valid));
    for candidate in cleaned {
        if kept.len() >= opts.max_n {
            break;
        }
        if kept.iter().all(|k| candidate.iou(k) < opts.iou_threshold) {
            kept.push(candidate);
        }
    }

    tracing::debug!(received, valid, kept = kept.len(), "sanitized mask candidates");
    kept
}

fn validate(raw: &Value, opts: &SanitizeOptions) -> Option<Mask> {
    let obj = raw.as_object()?;
    let x = number(obj.get("x"))?;
    let y = number(obj.get("y"))?;
    let w = number(obj.get("w"))?;
    let h = number(obj.get("h"))?;
    if w <= 0.0 || h <= 0.0 {
        return None;
    }

    let mask = Mask::clamped(x, y, w, h, &label_text(obj.get("label")), opts.label_max_chars, MaskSource::Ai);
    if mask.w * mask.h < opts.min_area {
        return None;
    }
    Some(mask)
}

/// Finite number from a JSON number or a numeric string.
fn number(v: Option<&Value>) -> Option<f64> {
    let n = match v? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    n.is_finite().then_some(n)
}

pub(crate) fn label_text(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Parses the first JSON object or array embedded in free-form model text,
/// spanning to the last matching closer.
pub fn extract_json(text: &str) -> Result<Value, ProviderError> {
    for (start, c) in text.char_indices() {
        let closer = match c {
            '{' => '}',
            '[' => ']',
            _ => continue,
        };
        if let Some(end) = text.rfind(closer) {
            if end > start {
                return Ok(serde_json::from_str(&text[start..=end])?);
            }
        }
    }
    Err(ProviderError::MalformedOutput("no JSON found in model output".to_string()))
}

/// Accepts `{"masks": [...]}` or a bare list.
pub fn candidates_from_output(value: Value) -> Result<Value, ProviderError> {
    match value {
        Value::Array(_) => Ok(value),
        Value::Object(mut obj) => match obj.remove("masks") {
            Some(masks @ Value::Array(_)) => Ok(masks),
            _ => Err(ProviderError::MalformedOutput("no masks in output JSON".to_string())),
        },
        _ => Err(ProviderError::MalformedOutput("no masks in output JSON".to_string())),
    }
}

/// Reads `{"title": .., "explanation": ..}` out of model output. Missing or
/// null fields become empty strings.
pub fn meta_from_output(value: Value) -> Result<Meta, ProviderError> {
    match value {
        Value::Object(obj) => Ok(Meta {
            title: label_text(obj.get("title")),
            explanation: label_text(obj.get("explanation")),
        }),
        other => Err(ProviderError::MalformedOutput(format!(
            "expected a title/explanation object, got {}",
            json_kind(&other)
        ))),
    }
}
