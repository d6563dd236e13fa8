//! Image typing, byte-level validation, and best-effort metadata extraction.
//!
//! The extension set below is the canonical definition of "image" for the
//! whole pipeline. Validation never decodes pixels; it checks container
//! signatures so obviously truncated or mislabeled files fail fast with a
//! structured reason instead of reaching the ML service.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::Path;

/// Canonical image extension set (case-insensitive)
pub const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "gif", "webp", "heic", "dng"];

/// Detected image kind, from the file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageKind {
  Raw,
  Jpeg,
  Png,
  Other,
}

impl ImageKind {
  pub fn from_extension(ext: &str) -> Self {
    match ext.to_ascii_lowercase().as_str() {
      "dng" => Self::Raw,
      "jpg" | "jpeg" => Self::Jpeg,
      "png" => Self::Png,
      _ => Self::Other,
    }
  }

  pub fn is_raw(&self) -> bool {
    matches!(self, Self::Raw)
  }
}

/// Returns the lowercase extension if the path names a supported image
pub fn image_extension(path: &Path) -> Option<String> {
  let ext = path.extension()?.to_str()?.to_ascii_lowercase();
  IMAGE_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}

/// True if the path has a supported image extension (case-insensitive)
pub fn is_image_path(path: &Path) -> bool {
  image_extension(path).is_some()
}

/// MIME category for a supported extension
pub fn mime_for_extension(ext: &str) -> &'static str {
  match ext.to_ascii_lowercase().as_str() {
    "jpg" | "jpeg" => "image/jpeg",
    "png" => "image/png",
    "bmp" => "image/bmp",
    "gif" => "image/gif",
    "webp" => "image/webp",
    "heic" => "image/heic",
    "dng" => "image/x-adobe-dng",
    _ => "application/octet-stream",
  }
}

/// Validate container signatures without decoding pixels.
///
/// DNG deliberately only checks the TIFF magic: RAW files never go through
/// a full decoder in this pipeline.
pub fn validate_bytes(ext: &str, bytes: &[u8]) -> Result<(), String> {
  if bytes.is_empty() {
    return Err("empty file".to_string());
  }

  match ext.to_ascii_lowercase().as_str() {
    "jpg" | "jpeg" => {
      if bytes.len() < 4 || bytes[0..3] != [0xFF, 0xD8, 0xFF] {
        return Err("not a JPEG stream".to_string());
      }
      if bytes[bytes.len() - 2..] != [0xFF, 0xD9] {
        return Err("truncated JPEG (missing EOI marker)".to_string());
      }
      Ok(())
    }
    "png" => {
      const SIG: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
      if bytes.len() < 16 || bytes[0..8] != SIG {
        return Err("not a PNG stream".to_string());
      }
      if &bytes[bytes.len() - 8..bytes.len() - 4] != b"IEND" {
        return Err("truncated PNG (missing IEND chunk)".to_string());
      }
      Ok(())
    }
    "gif" => {
      if bytes.len() < 6 || (&bytes[0..6] != b"GIF87a" && &bytes[0..6] != b"GIF89a") {
        return Err("not a GIF stream".to_string());
      }
      Ok(())
    }
    "bmp" => {
      if bytes.len() < 2 || &bytes[0..2] != b"BM" {
        return Err("not a BMP stream".to_string());
      }
      Ok(())
    }
    "webp" => {
      if bytes.len() < 12 || &bytes[0..4] != b"RIFF" || &bytes[8..12] != b"WEBP" {
        return Err("not a WebP stream".to_string());
      }
      Ok(())
    }
    "heic" => {
      if bytes.len() < 12 || &bytes[4..8] != b"ftyp" {
        return Err("not a HEIC container".to_string());
      }
      Ok(())
    }
    "dng" => {
      if bytes.len() < 4 || (&bytes[0..4] != b"II*\0" && &bytes[0..4] != b"MM\0*") {
        return Err("not a TIFF/DNG container".to_string());
      }
      Ok(())
    }
    other => Err(format!("unsupported extension: {other}")),
  }
}

/// Best-effort EXIF fields, all optional
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExifSummary {
  pub camera_make: Option<String>,
  pub camera_model: Option<String>,
  pub lens_model: Option<String>,
  pub iso: Option<u32>,
  pub aperture: Option<f64>,
  pub shutter: Option<String>,
  pub focal_length_mm: Option<f64>,
  pub captured_at: Option<String>,
}

impl ExifSummary {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

/// Extracted metadata for one image file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageMeta {
  pub file_name: String,
  pub file_size: u64,
  pub extension: String,
  pub mime: String,
  pub raw: bool,
  pub exif: Option<ExifSummary>,
}

impl ImageMeta {
  /// Extract metadata from in-memory bytes. EXIF failures are swallowed:
  /// a photo with a stripped or mangled EXIF block is still ingestible.
  pub fn extract(path: &Path, bytes: &[u8]) -> Self {
    let ext = path
      .extension()
      .and_then(|e| e.to_str())
      .map(|e| e.to_ascii_lowercase())
      .unwrap_or_default();
    let kind = ImageKind::from_extension(&ext);

    let exif = read_exif(bytes).filter(|s| !s.is_empty());

    Self {
      file_name: path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default(),
      file_size: bytes.len() as u64,
      extension: ext.clone(),
      mime: mime_for_extension(&ext).to_string(),
      raw: kind.is_raw(),
      exif,
    }
  }

  /// Build the vector store payload for this file.
  ///
  /// `path` is the normalized (forward-slash) source path; `hash` is the
  /// hex content hash. Caption is merged in by the GPU stage when present.
  pub fn into_payload(self, path: &str, hash: &str) -> Map<String, Value> {
    let mut payload = Map::new();
    payload.insert("filename".to_string(), json!(self.file_name));
    payload.insert("path".to_string(), json!(path));
    payload.insert("file_size".to_string(), json!(self.file_size));
    payload.insert("extension".to_string(), json!(self.extension));
    payload.insert("mime".to_string(), json!(self.mime));
    payload.insert("raw".to_string(), json!(self.raw));
    payload.insert("hash".to_string(), json!(hash));

    if let Some(exif) = self.exif {
      if let Some(v) = exif.camera_make {
        payload.insert("camera_make".to_string(), json!(v));
      }
      if let Some(v) = exif.camera_model {
        payload.insert("camera_model".to_string(), json!(v));
      }
      if let Some(v) = exif.lens_model {
        payload.insert("lens_model".to_string(), json!(v));
      }
      if let Some(v) = exif.iso {
        payload.insert("iso".to_string(), json!(v));
      }
      if let Some(v) = exif.aperture {
        payload.insert("aperture".to_string(), json!(v));
      }
      if let Some(v) = exif.shutter {
        payload.insert("shutter".to_string(), json!(v));
      }
      if let Some(v) = exif.focal_length_mm {
        payload.insert("focal_length_mm".to_string(), json!(v));
      }
      if let Some(v) = exif.captured_at {
        payload.insert("captured_at".to_string(), json!(v));
      }
    }

    payload
  }
}

/// Read EXIF from any supported container (JPEG APP1, TIFF/DNG, HEIC, PNG).
fn read_exif(bytes: &[u8]) -> Option<ExifSummary> {
  let mut cursor = std::io::Cursor::new(bytes);
  let exif = exif::Reader::new().read_from_container(&mut cursor).ok()?;

  Some(ExifSummary {
    camera_make: ascii_field(&exif, exif::Tag::Make),
    camera_model: ascii_field(&exif, exif::Tag::Model),
    lens_model: ascii_field(&exif, exif::Tag::LensModel),
    iso: uint_field(&exif, exif::Tag::PhotographicSensitivity),
    aperture: rational_field(&exif, exif::Tag::FNumber),
    shutter: exif
      .get_field(exif::Tag::ExposureTime, exif::In::PRIMARY)
      .map(|f| f.display_value().to_string()),
    focal_length_mm: rational_field(&exif, exif::Tag::FocalLength),
    captured_at: ascii_field(&exif, exif::Tag::DateTimeOriginal),
  })
}

fn ascii_field(exif: &exif::Exif, tag: exif::Tag) -> Option<String> {
  let field = exif.get_field(tag, exif::In::PRIMARY)?;
  match &field.value {
    exif::Value::Ascii(parts) => {
      let text = parts
        .iter()
        .map(|p| String::from_utf8_lossy(p))
        .collect::<Vec<_>>()
        .join(" ");
      let trimmed = text.trim().trim_matches(char::from(0)).to_string();
      (!trimmed.is_empty()).then_some(trimmed)
    }
    _ => Some(field.display_value().to_string()),
  }
}

fn uint_field(exif: &exif::Exif, tag: exif::Tag) -> Option<u32> {
  exif.get_field(tag, exif::In::PRIMARY)?.value.get_uint(0)
}

fn rational_field(exif: &exif::Exif, tag: exif::Tag) -> Option<f64> {
  let field = exif.get_field(tag, exif::In::PRIMARY)?;
  match &field.value {
    exif::Value::Rational(v) => v.first().map(|r| r.to_f64()),
    _ => None,
  }
}
