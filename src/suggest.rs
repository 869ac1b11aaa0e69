use serde_json::Value;
use std::future::Future;
use std::path::Path;
use std::time::Duration;

use crate::error::{ProviderError, SanitizeError};
use crate::model::{MaskList, Meta};
use crate::sanitize::{self, SanitizeOptions};

/// Source of raw mask candidates for an image, typically a vision model.
/// The returned value is untrusted and is expected to be a JSON list.
pub trait SuggestionProvider {
    fn suggest(
        &self,
        image: &[u8],
        mime: &str,
        max_n: usize,
    ) -> impl Future<Output = Result<Value, ProviderError>> + Send;
}

/// Source of a short title and explanation for an image.
pub trait MetaProvider {
    fn describe(&self, image: &[u8], mime: &str) -> impl Future<Output = Result<Meta, ProviderError>> + Send;
}

pub fn guess_mime(filename: &str) -> String {
    mime_guess::from_path(filename).first_or_octet_stream().to_string()
}

/// Asks the provider for candidates and sanitizes them. Any provider failure,
/// including a timeout or output that is not a list, yields an error and no
/// partial result.
pub async fn suggest_masks<P: SuggestionProvider>(
    provider: &P,
    image: &[u8],
    mime: &str,
    opts: &SanitizeOptions,
    timeout: Duration,
) -> Result<MaskList, ProviderError> {
    let raw = with_timeout(timeout, provider.suggest(image, mime, opts.max_n)).await?;

    sanitize::sanitize(&raw, opts).map_err(|e| match e {
        SanitizeError::NotASequence(kind) => {
            ProviderError::MalformedOutput(format!("expected a list of masks, got {}", kind))
        }
    })
}

pub async fn suggest_masks_for_file<P: SuggestionProvider>(
    provider: &P,
    path: &Path,
    opts: &SanitizeOptions,
    timeout: Duration,
) -> Result<MaskList, ProviderError> {
    let image = tokio::fs::read(path)
        .await
        .map_err(|e| ProviderError::Failed(format!("failed to read {}: {}", path.display(), e)))?;
    let mime = guess_mime(&path.to_string_lossy());
    tracing::info!(path = %path.display(), bytes = image.len(), mime = %mime, "requesting mask suggestions");
    suggest_masks(provider, &image, &mime, opts, timeout).await
}

/// Asks the provider for a title and explanation of the image.
pub async fn generate_meta<P: MetaProvider>(
    provider: &P,
    image: &[u8],
    mime: &str,
    timeout: Duration,
) -> Result<Meta, ProviderError> {
    let meta = with_timeout(timeout, provider.describe(image, mime)).await?;
    tracing::debug!(title = %meta.title, "generated metadata");
    Ok(meta)
}

async fn with_timeout<T>(
    timeout: Duration,
    fut: impl Future<Output = Result<T, ProviderError>>,
) -> Result<T, ProviderError> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProviderError::Timeout(timeout.as_secs())),
    }
}

/// Provider answering with a fixed model transcript. Useful for replaying
/// saved model output through the sanitizer.
#[derive(Debug, Clone)]
pub struct TranscriptProvider {
    pub output: String,
}

impl SuggestionProvider for TranscriptProvider {
    async fn suggest(&self, _image: &[u8], _mime: &str, _max_n: usize) -> Result<Value, ProviderError> {
        let value = sanitize::extract_json(&self.output)?;
        sanitize::candidates_from_output(value)
    }
}

impl MetaProvider for TranscriptProvider {
    async fn describe(&self, _image: &[u8], _mime: &str) -> Result<Meta, ProviderError> {
        sanitize::meta_from_output(sanitize::extract_json(&self.output)?)
    }
}
