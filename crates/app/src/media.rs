//! Loading inputs from disk: images and extractor output.

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use session_host::sniff_image_mime;
use shared::page::PageSignals;
use shared::protocol::MediaPayload;
use std::path::Path;

/// Encode image bytes for the wire, sniffing the mime type from content
pub fn media_from_bytes(bytes: &[u8]) -> Result<MediaPayload> {
    if bytes.is_empty() {
        bail!("image is empty");
    }
    let mime_type = sniff_image_mime(bytes)?;
    Ok(MediaPayload {
        data: STANDARD.encode(bytes),
        mime_type: mime_type.to_string(),
    })
}

pub async fn load_image(path: &Path) -> Result<MediaPayload> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    media_from_bytes(&bytes).with_context(|| format!("loading {}", path.display()))
}

pub async fn load_page_signals(path: &Path) -> Result<PageSignals> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parsing {}", path.display()))
}
