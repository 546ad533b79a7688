use std::fmt;

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use tracing::{debug, error};

use crate::attachment_capture::Attachment;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    Read(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Read(message) => write!(f, "Failed to read attachment bytes: {message}"),
        }
    }
}

impl std::error::Error for EncodeError {}

pub fn to_data_uri(attachment: &Attachment) -> Result<String, EncodeError> {
    let Some(bytes) = attachment.bytes() else {
        error!(
            uri = %attachment.preview_uri(),
            "attachment bytes are no longer readable"
        );
        return Err(EncodeError::Read(format!(
            "preview `{}` has been revoked",
            attachment.preview_uri()
        )));
    };

    let data_uri = encode_data_uri(attachment.mime_type(), &bytes);
    debug!(
        kind = attachment.kind().as_str(),
        mime_type = %attachment.mime_type(),
        byte_len = bytes.len(),
        encoded_len = data_uri.len(),
        "attachment encoded as data URI"
    );
    Ok(data_uri)
}

pub fn encode_data_uri(mime_type: &str, bytes: &[u8]) -> String {
    format!("data:{mime_type};base64,{}", BASE64_STANDARD.encode(bytes))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::attachment_capture::{capture_file, FileSelection, PreviewRegistry};

    #[test]
    fn embeds_mime_type_and_base64_payload() {
        let registry = PreviewRegistry::new();
        let attachment = capture_file(
            &registry,
            FileSelection::new("dot.png", "image/png", Bytes::from_static(b"hello")),
        )
        .expect("png should be accepted");

        let data_uri = to_data_uri(&attachment).expect("encoding should succeed");

        assert_eq!(data_uri, "data:image/png;base64,aGVsbG8=");
    }

    #[test]
    fn identical_bytes_encode_identically() {
        let registry = PreviewRegistry::new();
        let first = Attachment::from_recording(&registry, Bytes::from_static(&[1, 2, 3, 250]));
        let second = Attachment::from_recording(&registry, Bytes::from_static(&[1, 2, 3, 250]));

        assert_eq!(
            to_data_uri(&first).expect("first should encode"),
            to_data_uri(&second).expect("second should encode")
        );
        assert!(to_data_uri(&first)
            .expect("first should encode")
            .starts_with("data:audio/webm;base64,"));
    }

    #[test]
    fn revoked_preview_fails_with_read_error() {
        let registry = PreviewRegistry::new();
        let attachment = Attachment::from_recording(&registry, Bytes::from_static(b"voice"));
        registry.revoke(attachment.preview_uri());

        let error = to_data_uri(&attachment).expect_err("revoked preview should not encode");

        assert!(matches!(error, EncodeError::Read(message) if message.contains("revoked")));
    }
}
