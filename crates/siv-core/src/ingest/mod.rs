//! Document ingestion: validation, normalization, and content hashing.
//!
//! Every uploaded document passes through [`ingest`] before it enters the
//! verification workflow:
//!
//! 1. The declared kind must be one of jpeg/png/pdf and the payload must be
//!    within the size cap.
//! 2. Raster images are decoded, converted to a single color model (RGB8),
//!    downsized so neither dimension exceeds [`MAX_DIMENSION`] pixels, and
//!    re-encoded as JPEG at a fixed quality for deterministic size bounds.
//!    PDFs are magic-checked and passed through unmodified.
//! 3. A SHA-256 content hash is computed over the **original** bytes, so
//!    dedup and integrity checks are stable regardless of normalization.
//!
//! Corrupt input is never silently dropped: unparseable images fail with
//! [`IngestError::InvalidImage`].

use std::io::Cursor;

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{GenericImageView, ImageFormat, ImageReader};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Maximum accepted document size (10 MiB).
pub const MAX_DOCUMENT_SIZE: usize = 10 * 1024 * 1024;

/// Maximum width/height of a normalized raster image, in pixels.
pub const MAX_DIMENSION: u32 = 2048;

/// JPEG quality used when re-encoding normalized raster images.
pub const JPEG_QUALITY: u8 = 85;

/// Errors that can occur during document ingestion.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum IngestError {
    /// The declared content type is not accepted.
    #[error("unsupported document format: {content_type}")]
    UnsupportedFormat {
        /// The declared content type that was rejected.
        content_type: String,
    },

    /// The payload exceeds the size cap.
    #[error("document too large: {size} bytes exceeds maximum of {max_size} bytes")]
    PayloadTooLarge {
        /// The actual payload size.
        size: usize,
        /// The maximum allowed size.
        max_size: usize,
    },

    /// Empty payloads are rejected outright.
    #[error("empty document is not allowed")]
    EmptyDocument,

    /// The payload could not be parsed as the declared format.
    #[error("invalid {kind} document: {detail}")]
    InvalidImage {
        /// The declared kind that failed to parse.
        kind: DocumentKind,
        /// Decoder detail.
        detail: String,
    },
}

/// Accepted document kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentKind {
    /// JPEG raster image.
    Jpeg,
    /// PNG raster image.
    Png,
    /// PDF document (passed through without normalization).
    Pdf,
}

impl DocumentKind {
    /// Maps a declared content type to a document kind.
    ///
    /// Accepts both MIME form (`image/jpeg`) and bare form (`jpeg`).
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::UnsupportedFormat`] for anything else.
    pub fn from_content_type(content_type: &str) -> Result<Self, IngestError> {
        match content_type.trim().to_ascii_lowercase().as_str() {
            "image/jpeg" | "image/jpg" | "jpeg" | "jpg" => Ok(Self::Jpeg),
            "image/png" | "png" => Ok(Self::Png),
            "application/pdf" | "pdf" => Ok(Self::Pdf),
            other => Err(IngestError::UnsupportedFormat {
                content_type: other.to_string(),
            }),
        }
    }

    /// Stable string form.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Pdf => "pdf",
        }
    }
}

impl std::fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Shape metadata recorded during ingestion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// The accepted document kind.
    pub kind: DocumentKind,

    /// Size of the original payload in bytes.
    pub original_bytes: usize,

    /// Size of the normalized payload in bytes.
    pub normalized_bytes: usize,

    /// Width/height of the original raster image; `None` for PDFs.
    pub original_dimensions: Option<(u32, u32)>,

    /// Width/height after normalization; `None` for PDFs.
    pub normalized_dimensions: Option<(u32, u32)>,
}

/// A validated, normalized, hashed document ready for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedDocument {
    /// The bytes to store (re-encoded for rasters, original for PDFs).
    pub normalized: Vec<u8>,

    /// Hex-encoded SHA-256 of the original payload.
    pub sha256_hex: String,

    /// Shape metadata.
    pub metadata: DocumentMetadata,
}

/// Validates, normalizes, and hashes an uploaded document.
///
/// # Errors
///
/// - [`IngestError::EmptyDocument`] / [`IngestError::PayloadTooLarge`] on
///   size violations
/// - [`IngestError::InvalidImage`] when the payload does not parse as the
///   declared kind
pub fn ingest(raw: &[u8], kind: DocumentKind) -> Result<IngestedDocument, IngestError> {
    if raw.is_empty() {
        return Err(IngestError::EmptyDocument);
    }
    if raw.len() > MAX_DOCUMENT_SIZE {
        return Err(IngestError::PayloadTooLarge {
            size: raw.len(),
            max_size: MAX_DOCUMENT_SIZE,
        });
    }

    // Hash the original bytes before any normalization.
    let sha256_hex = sha256_hex(raw);

    match kind {
        DocumentKind::Pdf => {
            if !raw.starts_with(b"%PDF") {
                return Err(IngestError::InvalidImage {
                    kind,
                    detail: "missing %PDF header".to_string(),
                });
            }
            Ok(IngestedDocument {
                metadata: DocumentMetadata {
                    kind,
                    original_bytes: raw.len(),
                    normalized_bytes: raw.len(),
                    original_dimensions: None,
                    normalized_dimensions: None,
                },
                normalized: raw.to_vec(),
                sha256_hex,
            })
        },
        DocumentKind::Jpeg | DocumentKind::Png => {
            let format = if kind == DocumentKind::Jpeg {
                ImageFormat::Jpeg
            } else {
                ImageFormat::Png
            };

            let mut reader = ImageReader::new(Cursor::new(raw));
            reader.set_format(format);
            let decoded = reader.decode().map_err(|err| IngestError::InvalidImage {
                kind,
                detail: err.to_string(),
            })?;

            let original_dimensions = decoded.dimensions();

            // Downsize only when needed; `resize` preserves aspect ratio by
            // fitting within the bounding box.
            let (width, height) = original_dimensions;
            let resized = if width > MAX_DIMENSION || height > MAX_DIMENSION {
                decoded.resize(MAX_DIMENSION, MAX_DIMENSION, FilterType::Lanczos3)
            } else {
                decoded
            };
            let normalized_dimensions = resized.dimensions();

            let rgb = resized.to_rgb8();
            let mut out = Cursor::new(Vec::new());
            JpegEncoder::new_with_quality(&mut out, JPEG_QUALITY)
                .encode_image(&rgb)
                .map_err(|err| IngestError::InvalidImage {
                    kind,
                    detail: err.to_string(),
                })?;
            let normalized = out.into_inner();

            Ok(IngestedDocument {
                metadata: DocumentMetadata {
                    kind,
                    original_bytes: raw.len(),
                    normalized_bytes: normalized.len(),
                    original_dimensions: Some(original_dimensions),
                    normalized_dimensions: Some(normalized_dimensions),
                },
                normalized,
                sha256_hex,
            })
        },
    }
}

/// Hex-encoded SHA-256 of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let digest = Sha256::digest(bytes);
    digest
        .iter()
        .fold(String::with_capacity(64), |mut acc, b| {
            let _ = write!(acc, "{b:02x}");
            acc
        })
}
