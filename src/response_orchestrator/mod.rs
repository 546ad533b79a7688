use std::{fmt, sync::Arc};

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::{
    attachment_capture::{Attachment, AttachmentKind},
    chat_backend::{ChatBackend, GenerateRequest, GenerateResponse},
    conversation_store::{MessageMedia, MessageStatus, ReconcileOutcome, Transcript},
    encoder::{self, EncodeError},
    status_notifier::Notice,
};

pub const FALLBACK_REPLY_TEXT: &str = "Sorry, I encountered an error. Please try again.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitError {
    Busy,
    EmptyMessage,
    Encode(EncodeError),
}

impl SubmitError {
    pub fn notice(&self) -> Option<Notice> {
        match self {
            Self::Encode(_) => Some(failure_notice()),
            Self::Busy | Self::EmptyMessage => None,
        }
    }
}

impl fmt::Display for SubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "A response is already in progress"),
            Self::EmptyMessage => write!(f, "Message needs text or an attachment"),
            Self::Encode(error) => write!(f, "{error}"),
        }
    }
}

impl std::error::Error for SubmitError {}

/// Everything the user handed over for one question.
#[derive(Debug)]
pub struct Submission {
    pub text: String,
    pub attachment: Option<Attachment>,
    pub prefers_audio_reply: bool,
}

/// An accepted cycle whose backend call has not resolved yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightCycle {
    pub user_message_id: String,
    pub assistant_message_id: String,
    pub request: GenerateRequest,
    pub started_at: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub assistant_message_id: String,
    pub status: MessageStatus,
    pub notice: Option<Notice>,
}

/// Drives one question/answer cycle at a time against the transcript.
#[derive(Clone)]
pub struct ResponseOrchestrator {
    backend: Arc<dyn ChatBackend>,
    in_flight: Option<String>,
}

impl fmt::Debug for ResponseOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseOrchestrator")
            .field("backend", &self.backend.name())
            .field("in_flight", &self.in_flight)
            .finish()
    }
}

impl ResponseOrchestrator {
    pub fn new(backend: Arc<dyn ChatBackend>) -> Self {
        Self {
            backend,
            in_flight: None,
        }
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        Arc::clone(&self.backend)
    }

    pub fn is_responding(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Validates and records a submission. Once accepted, the user message and a pending
    /// assistant placeholder are in the transcript and the busy flag is raised; the returned
    /// cycle carries the request to send. An attachment that cannot be encoded settles the
    /// placeholder as failed right away and comes back as [`SubmitError::Encode`]. The
    /// attachment is consumed whenever the submission gets past validation.
    pub fn begin(
        &mut self,
        transcript: &mut Transcript,
        submission: Submission,
    ) -> Result<InFlightCycle, SubmitError> {
        if self.is_responding() || transcript.pending_assistant_id().is_some() {
            warn!("submission rejected while a response is in flight");
            return Err(SubmitError::Busy);
        }

        let Submission {
            text,
            attachment,
            prefers_audio_reply,
        } = submission;

        if text.trim().is_empty() && attachment.is_none() {
            return Err(SubmitError::EmptyMessage);
        }

        let encoded = attachment.map(encode_and_release);
        let media = encoded.as_ref().map(|encoded| encoded.message_media());

        let user_message_id = transcript
            .append_user_message(&text, media.clone())
            .map_err(|_| SubmitError::EmptyMessage)?;
        let assistant_message_id = transcript
            .append_pending_assistant()
            .map_err(|_| SubmitError::Busy)?;
        self.in_flight = Some(assistant_message_id.clone());

        if let Some(EncodedAttachment {
            data_uri: Err(error),
            ..
        }) = encoded
        {
            self.finish(
                transcript,
                &assistant_message_id,
                Err::<GenerateResponse, _>(error.clone()),
            );
            return Err(SubmitError::Encode(error));
        }

        let mut request = GenerateRequest {
            question_text: text,
            question_image: None,
            question_audio: None,
            user_prefers_audio_reply: prefers_audio_reply,
        };
        match media {
            Some(MessageMedia {
                kind: AttachmentKind::Image,
                uri,
            }) => request.question_image = Some(uri),
            Some(MessageMedia {
                kind: AttachmentKind::Audio,
                uri,
            }) => request.question_audio = Some(uri),
            None => {}
        }

        info!(
            user_message_id = %user_message_id,
            assistant_message_id = %assistant_message_id,
            has_image = request.question_image.is_some(),
            has_audio = request.question_audio.is_some(),
            prefers_audio_reply,
            "response cycle started"
        );
        Ok(InFlightCycle {
            user_message_id,
            assistant_message_id,
            request,
            started_at: Instant::now(),
        })
    }

    /// Reconciles the backend outcome into the transcript and lowers the busy flag. A stale
    /// or duplicate id leaves the transcript alone and raises no notice.
    pub fn finish<E: fmt::Display>(
        &mut self,
        transcript: &mut Transcript,
        assistant_message_id: &str,
        result: Result<GenerateResponse, E>,
    ) -> CycleReport {
        if self.in_flight.as_deref() == Some(assistant_message_id) {
            self.in_flight = None;
        } else {
            warn!(
                assistant_message_id,
                in_flight = ?self.in_flight,
                "backend result does not belong to the active cycle"
            );
        }

        let (outcome, notice) = match result {
            Ok(response) => (
                ReconcileOutcome::Success {
                    text: response.text_response,
                    image: response.image_response,
                    audio: response.audio_response,
                },
                None,
            ),
            Err(error) => {
                error!(assistant_message_id, error = %error, "response cycle failed");
                (
                    ReconcileOutcome::Failure {
                        display_text: FALLBACK_REPLY_TEXT.to_string(),
                    },
                    Some(failure_notice()),
                )
            }
        };

        let notice = match transcript.reconcile(assistant_message_id, outcome) {
            Ok(()) => notice,
            Err(error) => {
                warn!(assistant_message_id, error = %error, "reconciliation skipped");
                None
            }
        };

        let status = transcript
            .get(assistant_message_id)
            .map(|message| message.status)
            .unwrap_or(MessageStatus::Failed);
        info!(assistant_message_id, status = ?status, "response cycle finished");

        CycleReport {
            assistant_message_id: assistant_message_id.to_string(),
            status,
            notice,
        }
    }

    /// Runs a full cycle inline. The backend call is the only suspension point.
    pub async fn run(
        &mut self,
        transcript: &mut Transcript,
        submission: Submission,
    ) -> Result<CycleReport, SubmitError> {
        let cycle = self.begin(transcript, submission)?;
        let result = self.backend.generate(cycle.request.clone()).await;
        Ok(self.finish(transcript, &cycle.assistant_message_id, result))
    }
}

fn failure_notice() -> Notice {
    Notice::error(
        "An error occurred",
        "Failed to get a response from the AI. Please try again.",
    )
}

/// Outcome of encoding a submitted attachment, keeping the preview URI for the transcript
/// when the bytes could not be read.
struct EncodedAttachment {
    kind: AttachmentKind,
    preview_uri: String,
    data_uri: Result<String, EncodeError>,
}

impl EncodedAttachment {
    fn message_media(&self) -> MessageMedia {
        let uri = match &self.data_uri {
            Ok(data_uri) => data_uri.clone(),
            Err(_) => self.preview_uri.clone(),
        };
        MessageMedia {
            kind: self.kind,
            uri,
        }
    }
}

fn encode_and_release(attachment: Attachment) -> EncodedAttachment {
    let encoded = EncodedAttachment {
        kind: attachment.kind(),
        preview_uri: attachment.preview_uri().to_string(),
        data_uri: encoder::to_data_uri(&attachment),
    };
    attachment.release();
    encoded
}


#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::test_support::StubBackend;
    use super::*;
    use crate::{
        attachment_capture::{capture_file, FileSelection, PreviewRegistry},
        chat_backend::BackendError,
        conversation_store::Role,
    };

    fn text_submission(text: &str) -> Submission {
        Submission {
            text: text.to_string(),
            attachment: None,
            prefers_audio_reply: false,
        }
    }

    fn image_attachment(registry: &PreviewRegistry) -> Attachment {
        capture_file(
            registry,
            FileSelection::new("triangle.png", "image/png", Bytes::from_static(b"png")),
        )
        .expect("png should be accepted")
    }

    #[tokio::test]
    async fn text_question_yields_user_message_and_completed_answer() {
        let backend = Arc::new(StubBackend::default());
        let mut orchestrator = ResponseOrchestrator::new(backend.clone());
        let mut transcript = Transcript::new();

        let report = orchestrator
            .run(&mut transcript, text_submission("What is 2+2?"))
            .await
            .expect("submission should be accepted");

        assert_eq!(report.status, MessageStatus::Complete);
        assert!(report.notice.is_none());
        let messages = transcript.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert_eq!(messages[0].text.as_deref(), Some("What is 2+2?"));
        assert_eq!(messages[1].id, report.assistant_message_id);
        assert_eq!(messages[1].status, MessageStatus::Complete);
        assert_eq!(messages[1].text.as_deref(), Some("4"));
        assert!(!orchestrator.is_responding());
        assert_eq!(
            backend.requests(),
            vec![GenerateRequest {
                question_text: "What is 2+2?".to_string(),
                question_image: None,
                question_audio: None,
                user_prefers_audio_reply: false,
            }]
        );
    }

    #[tokio::test]
    async fn backend_failure_marks_placeholder_failed_and_keeps_user_message() {
        let registry = PreviewRegistry::new();
        let backend = Arc::new(StubBackend::failing());
        let mut orchestrator = ResponseOrchestrator::new(backend);
        let mut transcript = Transcript::new();

        let report = orchestrator
            .run(
                &mut transcript,
                Submission {
                    text: "Explain this diagram".to_string(),
                    attachment: Some(image_attachment(&registry)),
                    prefers_audio_reply: false,
                },
            )
            .await
            .expect("submission should be accepted");

        assert_eq!(report.status, MessageStatus::Failed);
        assert_eq!(
            report.notice.map(|notice| notice.title),
            Some("An error occurred".to_string())
        );
        let messages = transcript.messages();
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert_eq!(messages[0].text.as_deref(), Some("Explain this diagram"));
        assert_eq!(messages[0].image.as_deref(), Some("data:image/png;base64,cG5n"));
        assert_eq!(messages[1].status, MessageStatus::Failed);
        assert_eq!(messages[1].text.as_deref(), Some(FALLBACK_REPLY_TEXT));
        assert!(!orchestrator.is_responding());
        assert_eq!(registry.live_count(), 0);
    }

    #[tokio::test]
    async fn attachments_route_to_matching_request_slot() {
        let registry = PreviewRegistry::new();
        let backend = Arc::new(StubBackend::default());
        let mut orchestrator = ResponseOrchestrator::new(backend.clone());
        let mut transcript = Transcript::new();

        orchestrator
            .run(
                &mut transcript,
                Submission {
                    text: String::new(),
                    attachment: Some(Attachment::from_recording(
                        &registry,
                        Bytes::from_static(b"voice"),
                    )),
                    prefers_audio_reply: true,
                },
            )
            .await
            .expect("audio submission should be accepted");
        orchestrator
            .run(
                &mut transcript,
                Submission {
                    text: "and this?".to_string(),
                    attachment: Some(image_attachment(&registry)),
                    prefers_audio_reply: false,
                },
            )
            .await
            .expect("image submission should be accepted");

        let requests = backend.requests();
        assert_eq!(
            requests[0].question_audio.as_deref(),
            Some("data:audio/webm;base64,dm9pY2U=")
        );
        assert!(requests[0].question_image.is_none());
        assert!(requests[0].user_prefers_audio_reply);
        assert!(requests[1].question_audio.is_none());
        assert!(requests[1].question_image.is_some());
        assert_eq!(transcript.len(), 4);
    }

    #[test]
    fn second_submission_is_rejected_while_busy() {
        let mut orchestrator = ResponseOrchestrator::new(Arc::new(StubBackend::default()));
        let mut transcript = Transcript::new();
        orchestrator
            .begin(&mut transcript, text_submission("first"))
            .expect("first submission should be accepted");

        let error = orchestrator
            .begin(&mut transcript, text_submission("second"))
            .expect_err("second submission should be rejected");

        assert_eq!(error, SubmitError::Busy);
        assert_eq!(transcript.len(), 2);
        assert!(orchestrator.is_responding());
    }

    #[test]
    fn empty_submission_is_a_no_op() {
        let mut orchestrator = ResponseOrchestrator::new(Arc::new(StubBackend::default()));
        let mut transcript = Transcript::new();

        assert_eq!(
            orchestrator
                .begin(&mut transcript, text_submission("  "))
                .expect_err("blank submission should be rejected"),
            SubmitError::EmptyMessage
        );
        assert!(transcript.is_empty());
        assert!(!orchestrator.is_responding());
    }

    #[test]
    fn unreadable_attachment_settles_cycle_as_failed() {
        let registry = PreviewRegistry::new();
        let attachment = image_attachment(&registry);
        let preview_uri = attachment.preview_uri().to_string();
        registry.revoke(&preview_uri);
        let mut orchestrator = ResponseOrchestrator::new(Arc::new(StubBackend::default()));
        let mut transcript = Transcript::new();

        let error = orchestrator
            .begin(
                &mut transcript,
                Submission {
                    text: "look".to_string(),
                    attachment: Some(attachment),
                    prefers_audio_reply: false,
                },
            )
            .expect_err("revoked attachment should fail");

        assert!(matches!(error, SubmitError::Encode(EncodeError::Read(_))));
        assert_eq!(
            error.notice().map(|notice| notice.title),
            Some("An error occurred".to_string())
        );
        let messages = transcript.messages();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::User);
        assert_eq!(messages[0].status, MessageStatus::Complete);
        assert_eq!(messages[0].text.as_deref(), Some("look"));
        assert_eq!(messages[0].image.as_deref(), Some(preview_uri.as_str()));
        assert_eq!(messages[1].role, Role::Assistant);
        assert_eq!(messages[1].status, MessageStatus::Failed);
        assert_eq!(messages[1].text.as_deref(), Some(FALLBACK_REPLY_TEXT));
        assert!(transcript.pending_assistant_id().is_none());
        assert!(!orchestrator.is_responding());
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn duplicate_finish_keeps_first_terminal_status() {
        let mut orchestrator = ResponseOrchestrator::new(Arc::new(StubBackend::default()));
        let mut transcript = Transcript::new();
        let cycle = orchestrator
            .begin(&mut transcript, text_submission("What is 2+2?"))
            .expect("submission should be accepted");

        let first = orchestrator.finish::<BackendError>(
            &mut transcript,
            &cycle.assistant_message_id,
            Ok(GenerateResponse {
                text_response: Some("4".to_string()),
                ..GenerateResponse::default()
            }),
        );
        let second = orchestrator.finish(
            &mut transcript,
            &cycle.assistant_message_id,
            Err(BackendError::Network("late".to_string())),
        );

        assert_eq!(first.status, MessageStatus::Complete);
        assert_eq!(second.status, MessageStatus::Complete);
        assert!(second.notice.is_none());
        assert!(!orchestrator.is_responding());
        assert_eq!(
            transcript
                .get(&cycle.assistant_message_id)
                .and_then(|message| message.text.as_deref()),
            Some("4")
        );
    }

    #[tokio::test]
    async fn empty_backend_response_still_completes() {
        let backend = Arc::new(StubBackend {
            generate_result: Ok(GenerateResponse::default()),
            ..StubBackend::default()
        });
        let mut orchestrator = ResponseOrchestrator::new(backend);
        let mut transcript = Transcript::new();

        let report = orchestrator
            .run(&mut transcript, text_submission("anything?"))
            .await
            .expect("submission should be accepted");

        assert_eq!(report.status, MessageStatus::Complete);
        let answer = transcript
            .get(&report.assistant_message_id)
            .expect("answer should exist");
        assert!(answer.text.is_none() && answer.image.is_none() && answer.audio.is_none());
    }
}
