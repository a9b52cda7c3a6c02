//! # Media
//!
//! Two directions of image handling:
//!
//! * Outbound: media references found in an agent reply are mapped to
//!   publicly reachable URLs by a [`MediaResolver`].
//! * Inbound: images a candidate sends (raw bytes, data URIs, file paths or
//!   HTTP URLs) are loaded by a [`MediaLoader`] into an [`InlineImage`] the
//!   language model can consume.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// URL prefix under which the label dataset is served.
pub const LABEL_MEDIA_MOUNT: &str = "label-media";
/// URL prefix under which the safety-photo dataset is served.
pub const PHOTO_MEDIA_MOUNT: &str = "ElectricianAssessment";

const LABEL_DATASET_DIR: &str = "label_dataset";
const DEFAULT_MIME: &str = "image/jpeg";

#[derive(Debug, thiserror::Error)]
pub enum MediaError {
    #[error("media reference '{0}' has no public URL")]
    Unresolvable(String),
    #[error("failed to load inbound media: {0}")]
    Load(String),
    #[error("inbound media is larger than {limit} bytes")]
    TooLarge { limit: usize },
}

/// MIME type guessed from a file extension. Unknown extensions are treated
/// as JPEG.
pub fn mime_hint(path: &str) -> &'static str {
    let extension = Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("tif") | Some("tiff") => "image/tiff",
        _ => DEFAULT_MIME,
    }
}

/// A media reference extracted from an agent reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaRef {
    pub raw: String,
    pub mime_hint: String,
}

impl MediaRef {
    pub fn new(raw: &str) -> Self {
        let raw = raw.trim();
        Self {
            raw: raw.to_string(),
            mime_hint: mime_hint(raw).to_string(),
        }
    }
}

/// A media reference a channel can deliver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedMedia {
    pub url: String,
    pub mime_type: String,
}

pub trait MediaResolver: Send + Sync {
    fn resolve(&self, media: &MediaRef) -> Result<ResolvedMedia, MediaError>;
}

/// Maps dataset paths onto the server's static media routes.
///
/// * `http(s)://` URLs pass through; a localhost origin is rewritten to
///   the public base URL.
/// * Paths inside `label_dataset/` map to `{base}/label-media/...`.
/// * Paths inside `ElectricianAssessment/` map to
///   `{base}/ElectricianAssessment/...`.
/// * Bare file names are taken to be photos in that folder.
#[derive(Debug, Clone)]
pub struct PublicUrlResolver {
    base_url: String,
}

impl PublicUrlResolver {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn rewrite_local_origin(&self, url: &str) -> String {
        let Some(rest) = url.strip_prefix("http://") else {
            return url.to_string();
        };
        let (host, path) = rest.split_once('/').unwrap_or((rest, ""));
        let hostname = host.split(':').next().unwrap_or(host);
        if matches!(hostname, "localhost" | "127.0.0.1" | "0.0.0.0") {
            format!("{}/{}", self.base_url, path)
        } else {
            url.to_string()
        }
    }
}

impl MediaResolver for PublicUrlResolver {
    fn resolve(&self, media: &MediaRef) -> Result<ResolvedMedia, MediaError> {
        let raw = media.raw.trim();
        let url = if raw.starts_with("http://") || raw.starts_with("https://") {
            self.rewrite_local_origin(raw)
        } else {
            let normalized = raw.replace('\\', "/");
            if let Some(rest) = after_segment(&normalized, LABEL_DATASET_DIR) {
                format!("{}/{}/{}", self.base_url, LABEL_MEDIA_MOUNT, rest)
            } else if let Some(rest) = after_segment(&normalized, PHOTO_MEDIA_MOUNT) {
                format!("{}/{}/{}", self.base_url, PHOTO_MEDIA_MOUNT, rest)
            } else if !normalized.is_empty() && !normalized.contains('/') {
                format!("{}/{}/{}", self.base_url, PHOTO_MEDIA_MOUNT, normalized)
            } else {
                return Err(MediaError::Unresolvable(raw.to_string()));
            }
        };
        Ok(ResolvedMedia {
            url,
            mime_type: media.mime_hint.clone(),
        })
    }
}

/// The part of `path` after the directory segment `segment`, if present.
fn after_segment<'a>(path: &'a str, segment: &str) -> Option<&'a str> {
    let marker = format!("{segment}/");
    if let Some(rest) = path.strip_prefix(&marker) {
        return Some(rest).filter(|r| !r.is_empty());
    }
    let needle = format!("/{marker}");
    path.find(&needle)
        .map(|index| &path[index + needle.len()..])
        .filter(|rest| !rest.is_empty())
}

/// An image attached to an inbound message, in whatever form the channel
/// delivered it.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMedia {
    Bytes {
        data: Vec<u8>,
        mime_type: Option<String>,
    },
    /// A `data:`, `file://` or `http(s)://` URI.
    Uri(String),
    Path(PathBuf),
}

/// Image bytes ready to be attached to a model request.
#[derive(Debug, Clone, PartialEq)]
pub struct InlineImage {
    pub data: Vec<u8>,
    pub mime_type: String,
}

impl InlineImage {
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, STANDARD.encode(&self.data))
    }
}

/// Normalizes [`InboundMedia`] into an [`InlineImage`].
///
/// Local files are only read from inside the configured local root; a
/// loader without one accepts bytes, `data:` URIs and HTTP(S) URLs only.
#[derive(Debug, Clone)]
pub struct MediaLoader {
    http: reqwest::Client,
    max_bytes: usize,
    local_root: Option<PathBuf>,
}

impl Default for MediaLoader {
    fn default() -> Self {
        Self::new(10 * 1024 * 1024, Duration::from_secs(15))
    }
}

impl MediaLoader {
    pub fn new(max_bytes: usize, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            max_bytes,
            local_root: None,
        }
    }

    /// Allows `file://` URIs and paths that resolve inside `root`. Relative
    /// paths are taken relative to `root`.
    pub fn with_local_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.local_root = Some(root.into());
        self
    }

    pub async fn load(&self, media: &InboundMedia) -> Result<InlineImage, MediaError> {
        let image = match media {
            InboundMedia::Bytes { data, mime_type } => InlineImage {
                data: data.clone(),
                mime_type: mime_type.clone().unwrap_or_else(|| DEFAULT_MIME.to_string()),
            },
            InboundMedia::Path(path) => self.load_path(path).await?,
            InboundMedia::Uri(uri) => self.load_uri(uri).await?,
        };
        if image.data.len() > self.max_bytes {
            return Err(MediaError::TooLarge {
                limit: self.max_bytes,
            });
        }
        debug!(bytes = image.data.len(), mime = %image.mime_type, "Loaded inbound media");
        Ok(image)
    }

    async fn load_uri(&self, uri: &str) -> Result<InlineImage, MediaError> {
        if let Some(rest) = uri.strip_prefix("data:") {
            return decode_data_uri(rest);
        }
        if let Some(path) = uri.strip_prefix("file://") {
            return self.load_path(Path::new(path)).await;
        }
        if uri.starts_with("http://") || uri.starts_with("https://") {
            return self.fetch(uri).await;
        }
        Err(MediaError::Load(format!("unsupported media URI '{uri}'")))
    }

    async fn load_path(&self, path: &Path) -> Result<InlineImage, MediaError> {
        let path = self.confine(path).await?;
        let data = tokio::fs::read(&path)
            .await
            .map_err(|e| MediaError::Load(format!("{}: {e}", path.display())))?;
        Ok(InlineImage {
            data,
            mime_type: mime_hint(&path.to_string_lossy()).to_string(),
        })
    }

    /// Canonicalizes `path` and checks that it lies inside the local root.
    async fn confine(&self, path: &Path) -> Result<PathBuf, MediaError> {
        let Some(root) = &self.local_root else {
            return Err(MediaError::Load("local files are not accepted".to_string()));
        };
        let root = tokio::fs::canonicalize(root)
            .await
            .map_err(|e| MediaError::Load(format!("media root {}: {e}", root.display())))?;
        let canonical = tokio::fs::canonicalize(root.join(path))
            .await
            .map_err(|_| MediaError::Load("media file not found".to_string()))?;
        if !canonical.starts_with(&root) {
            return Err(MediaError::Load("media path is outside the media root".to_string()));
        }
        Ok(canonical)
    }

    async fn fetch(&self, url: &str) -> Result<InlineImage, MediaError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| MediaError::Load(e.to_string()))?;
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .filter(|value| value.starts_with("image/"))
            .map(|value| value.split(';').next().unwrap_or(value).trim().to_string())
            .unwrap_or_else(|| mime_hint(url).to_string());
        let data = response
            .bytes()
            .await
            .map_err(|e| MediaError::Load(e.to_string()))?;
        Ok(InlineImage {
            data: data.to_vec(),
            mime_type,
        })
    }
}

fn decode_data_uri(rest: &str) -> Result<InlineImage, MediaError> {
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| MediaError::Load("data URI has no payload".to_string()))?;
    if !header.ends_with(";base64") {
        return Err(MediaError::Load("only base64 data URIs are supported".to_string()));
    }
    let mime_type = header.trim_end_matches(";base64");
    let data = STANDARD
        .decode(payload.trim())
        .map_err(|e| MediaError::Load(format!("invalid base64 payload: {e}")))?;
    Ok(InlineImage {
        data,
        mime_type: if mime_type.is_empty() {
            DEFAULT_MIME.to_string()
        } else {
            mime_type.to_string()
        },
    })
}
