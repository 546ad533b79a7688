use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::status_notifier::Notice;

pub const MAX_ATTACHMENT_BYTES: u64 = 5 * 1024 * 1024;
pub const ACCEPTED_IMAGE_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/webp", "image/gif"];
pub const RECORDED_AUDIO_MIME_TYPE: &str = "audio/webm";
const PREVIEW_URI_PREFIX: &str = "blob:sage-chat/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    Image,
    Audio,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Image => "image",
            Self::Audio => "audio",
        }
    }
}

/// A user-selected file as reported by the file picker.
#[derive(Debug, Clone)]
pub struct FileSelection {
    pub name: String,
    pub mime_type: String,
    pub size_bytes: u64,
    pub bytes: Bytes,
}

impl FileSelection {
    pub fn new(name: impl Into<String>, mime_type: impl Into<String>, bytes: Bytes) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size_bytes: bytes.len() as u64,
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    FileTooLarge { size_bytes: u64, limit_bytes: u64 },
    UnsupportedType(String),
}

impl ValidationError {
    pub fn notice(&self) -> Notice {
        match self {
            Self::FileTooLarge { limit_bytes, .. } => Notice::error(
                "File too large",
                format!(
                    "Please upload a file smaller than {}MB.",
                    limit_bytes / (1024 * 1024)
                ),
            ),
            Self::UnsupportedType(_) => Notice::error(
                "Invalid file type",
                "Only JPG, PNG, GIF, and WEBP images are accepted.",
            ),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FileTooLarge {
                size_bytes,
                limit_bytes,
            } => write!(
                f,
                "File is {size_bytes} bytes which exceeds the {limit_bytes} byte limit"
            ),
            Self::UnsupportedType(mime_type) => {
                write!(f, "Unsupported attachment type `{mime_type}`")
            }
        }
    }
}

impl std::error::Error for ValidationError {}

/// Owns the bytes behind every live preview URI, the way a browser owns object URLs.
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    entries: Arc<Mutex<HashMap<String, Bytes>>>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, bytes: Bytes) -> PreviewHandle {
        let uri = format!("{PREVIEW_URI_PREFIX}{}", Uuid::new_v4());
        let byte_len = bytes.len();
        self.lock().insert(uri.clone(), bytes);
        debug!(uri = %uri, byte_len, "preview handle allocated");

        PreviewHandle {
            uri,
            registry: self.clone(),
            released: false,
        }
    }

    /// Revokes a preview by URI. Returns `false` when the URI was not live.
    pub fn revoke(&self, uri: &str) -> bool {
        let removed = self.lock().remove(uri).is_some();
        if removed {
            debug!(uri, "preview handle revoked");
        }
        removed
    }

    pub fn read(&self, uri: &str) -> Option<Bytes> {
        self.lock().get(uri).cloned()
    }

    pub fn is_live(&self, uri: &str) -> bool {
        self.lock().contains_key(uri)
    }

    pub fn live_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Bytes>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Scoped ownership of one preview URI. Released exactly once: explicitly via
/// [`PreviewHandle::revoke`] or implicitly on drop.
#[derive(Debug)]
pub struct PreviewHandle {
    uri: String,
    registry: PreviewRegistry,
    released: bool,
}

impl PreviewHandle {
    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn read(&self) -> Option<Bytes> {
        if self.released {
            return None;
        }
        self.registry.read(&self.uri)
    }

    pub fn revoke(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if !self.registry.revoke(&self.uri) {
            warn!(uri = %self.uri, "preview handle was already revoked externally");
        }
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        self.release();
    }
}

#[derive(Debug)]
pub struct Attachment {
    kind: AttachmentKind,
    mime_type: String,
    size_bytes: u64,
    preview: PreviewHandle,
}

impl Attachment {
    pub fn from_recording(registry: &PreviewRegistry, payload: Bytes) -> Self {
        let size_bytes = payload.len() as u64;
        Self {
            kind: AttachmentKind::Audio,
            mime_type: RECORDED_AUDIO_MIME_TYPE.to_string(),
            size_bytes,
            preview: registry.register(payload),
        }
    }

    pub fn kind(&self) -> AttachmentKind {
        self.kind
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn preview_uri(&self) -> &str {
        self.preview.uri()
    }

    /// Backing bytes, or `None` once the preview has been revoked.
    pub fn bytes(&self) -> Option<Bytes> {
        self.preview.read()
    }

    pub fn release(self) {
        debug!(
            kind = self.kind.as_str(),
            uri = %self.preview.uri(),
            "releasing attachment"
        );
        self.preview.revoke();
    }
}

pub fn capture_file(
    registry: &PreviewRegistry,
    file: FileSelection,
) -> Result<Attachment, ValidationError> {
    if file.size_bytes > MAX_ATTACHMENT_BYTES {
        warn!(
            file_name = %file.name,
            size_bytes = file.size_bytes,
            "rejected attachment above size limit"
        );
        return Err(ValidationError::FileTooLarge {
            size_bytes: file.size_bytes,
            limit_bytes: MAX_ATTACHMENT_BYTES,
        });
    }

    let mime_type = file.mime_type.trim().to_ascii_lowercase();
    if !ACCEPTED_IMAGE_TYPES.contains(&mime_type.as_str()) {
        warn!(
            file_name = %file.name,
            mime_type = %file.mime_type,
            "rejected attachment with unsupported type"
        );
        return Err(ValidationError::UnsupportedType(file.mime_type));
    }

    let attachment = Attachment {
        kind: AttachmentKind::Image,
        mime_type,
        size_bytes: file.size_bytes,
        preview: registry.register(file.bytes),
    };
    info!(
        file_name = %file.name,
        mime_type = %attachment.mime_type,
        size_bytes = attachment.size_bytes,
        "image attachment captured"
    );
    Ok(attachment)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image_file(mime_type: &str, size_bytes: u64) -> FileSelection {
        FileSelection {
            name: "homework.jpg".to_string(),
            mime_type: mime_type.to_string(),
            size_bytes,
            bytes: Bytes::from_static(b"\xff\xd8\xff\xe0fake-jpeg"),
        }
    }

    #[test]
    fn accepts_supported_image_and_allocates_preview() {
        let registry = PreviewRegistry::new();

        let attachment = capture_file(&registry, image_file("image/png", 1024))
            .expect("png under the limit should be accepted");

        assert_eq!(attachment.kind(), AttachmentKind::Image);
        assert_eq!(attachment.mime_type(), "image/png");
        assert!(attachment.preview_uri().starts_with(PREVIEW_URI_PREFIX));
        assert!(registry.is_live(attachment.preview_uri()));
        assert_eq!(
            attachment.bytes(),
            Some(Bytes::from_static(b"\xff\xd8\xff\xe0fake-jpeg"))
        );
    }

    #[test]
    fn rejects_six_mebibyte_jpeg_without_allocating() {
        let registry = PreviewRegistry::new();

        let error = capture_file(&registry, image_file("image/jpeg", 6 * 1024 * 1024))
            .expect_err("6 MiB file should be rejected");

        assert_eq!(
            error,
            ValidationError::FileTooLarge {
                size_bytes: 6 * 1024 * 1024,
                limit_bytes: MAX_ATTACHMENT_BYTES,
            }
        );
        assert_eq!(registry.live_count(), 0);
        assert_eq!(error.notice().title, "File too large");
        assert_eq!(
            error.notice().description,
            "Please upload a file smaller than 5MB."
        );
    }

    #[test]
    fn accepts_file_exactly_at_the_limit() {
        let registry = PreviewRegistry::new();

        assert!(capture_file(&registry, image_file("image/gif", MAX_ATTACHMENT_BYTES)).is_ok());
    }

    #[test]
    fn rejects_non_image_types() {
        let registry = PreviewRegistry::new();

        let error = capture_file(&registry, image_file("application/pdf", 10))
            .expect_err("pdf should be rejected");

        assert_eq!(
            error,
            ValidationError::UnsupportedType("application/pdf".to_string())
        );
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn releasing_attachment_revokes_preview_once() {
        let registry = PreviewRegistry::new();
        let attachment = capture_file(&registry, image_file("image/webp", 10))
            .expect("webp should be accepted");
        let uri = attachment.preview_uri().to_string();

        attachment.release();

        assert!(!registry.is_live(&uri));
        assert!(!registry.revoke(&uri));
    }

    #[test]
    fn dropping_attachment_releases_preview() {
        let registry = PreviewRegistry::new();
        {
            let _attachment = Attachment::from_recording(&registry, Bytes::from_static(b"abc"));
            assert_eq!(registry.live_count(), 1);
        }

        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn externally_revoked_preview_reads_nothing() {
        let registry = PreviewRegistry::new();
        let attachment = Attachment::from_recording(&registry, Bytes::from_static(b"abc"));

        assert!(registry.revoke(attachment.preview_uri()));

        assert_eq!(attachment.bytes(), None);
        assert_eq!(attachment.mime_type(), RECORDED_AUDIO_MIME_TYPE);
    }
}
