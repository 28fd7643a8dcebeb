//! Storage for images that arrive inline as `data:` URLs.
//!
//! Chat clients send images as `data:image/<ext>;base64,<payload>`. The
//! buffer keeps that string as-is; at flush time it is decoded and written
//! under the media root, and the durable row stores only the relative path.

use std::path::{Path, PathBuf};

use anyhow::Result;
use base64::Engine;
use base64::engine::general_purpose::STANDARD as B64;
use uuid::Uuid;

const ALLOWED_EXTENSIONS: &[&str] = &["png", "jpeg", "jpg", "gif", "webp"];

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MediaError {
    #[error("image must be a data URL with a base64 payload")]
    NotDataUrl,
    #[error("unsupported image type '{0}'")]
    UnsupportedType(String),
    #[error("image payload is not valid base64")]
    InvalidBase64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub extension: String,
    pub bytes: Vec<u8>,
}

impl DataUrl {
    pub fn parse(raw: &str) -> Result<Self, MediaError> {
        let (header, payload) = raw.split_once(";base64,").ok_or(MediaError::NotDataUrl)?;
        let mime = header.strip_prefix("data:").ok_or(MediaError::NotDataUrl)?;
        let extension = mime
            .strip_prefix("image/")
            .ok_or_else(|| MediaError::UnsupportedType(mime.to_string()))?
            .to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(MediaError::UnsupportedType(extension));
        }
        let bytes = B64.decode(payload).map_err(|_| MediaError::InvalidBase64)?;
        if bytes.is_empty() {
            return Err(MediaError::InvalidBase64);
        }
        Ok(Self { extension, bytes })
    }
}

#[derive(Debug, Clone)]
pub struct MediaStore {
    root: PathBuf,
}

impl MediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(root.join("images/chat"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decode a chat image and write it to disk. Returns the reference to
    /// store in the message row.
    pub fn save_chat_image(&self, data_url: &str) -> Result<String> {
        let image = DataUrl::parse(data_url)?;
        let reference = format!("images/chat/{}.{}", Uuid::new_v4().simple(), image.extension);
        std::fs::write(self.resolve(&reference), &image.bytes)?;
        Ok(reference)
    }

    pub fn resolve(&self, reference: &str) -> PathBuf {
        self.root.join(reference)
    }

    /// Remove a stored image; missing files are not an error.
    pub fn remove(&self, reference: &str) -> Result<()> {
        match std::fs::remove_file(self.resolve(reference)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
