use std::{collections::HashMap, fmt};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::attachment_capture::AttachmentKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Pending,
    Complete,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<String>,
    pub status: MessageStatus,
    pub created_at: String,
}

/// Media carried by a user message: the encoded payload or a URI pointing at it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageMedia {
    pub kind: AttachmentKind,
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Success {
        text: Option<String>,
        image: Option<String>,
        audio: Option<String>,
    },
    Failure {
        display_text: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    EmptyMessage,
    PendingExists(String),
    UnknownMessage(String),
    NotPending(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyMessage => write!(f, "Message needs text or an attachment"),
            Self::PendingExists(id) => {
                write!(f, "Assistant message `{id}` is still awaiting a response")
            }
            Self::UnknownMessage(id) => write!(f, "No message with id `{id}`"),
            Self::NotPending(id) => write!(f, "Message `{id}` is not pending"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Ordered conversation history. Append-only, except that the single pending assistant
/// message is replaced in place when it is reconciled.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<Message>,
    positions: HashMap<String, usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.positions
            .get(id)
            .and_then(|position| self.messages.get(*position))
    }

    pub fn pending_assistant_id(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.status == MessageStatus::Pending)
            .map(|message| message.id.as_str())
    }

    pub fn append_user_message(
        &mut self,
        text: &str,
        media: Option<MessageMedia>,
    ) -> Result<String, StoreError> {
        let text = normalize_text(text);
        if text.is_none() && media.is_none() {
            warn!("rejected empty user message");
            return Err(StoreError::EmptyMessage);
        }

        let (image, audio) = match media {
            Some(MessageMedia {
                kind: AttachmentKind::Image,
                uri,
            }) => (Some(uri), None),
            Some(MessageMedia {
                kind: AttachmentKind::Audio,
                uri,
            }) => (None, Some(uri)),
            None => (None, None),
        };

        let id = format!("user-{}", Uuid::new_v4());
        debug!(
            message_id = %id,
            has_text = text.is_some(),
            has_image = image.is_some(),
            has_audio = audio.is_some(),
            "appending user message"
        );
        self.push(Message {
            id: id.clone(),
            role: Role::User,
            text,
            image,
            audio,
            status: MessageStatus::Complete,
            created_at: now_timestamp(),
        });
        Ok(id)
    }

    pub fn append_pending_assistant(&mut self) -> Result<String, StoreError> {
        if let Some(pending_id) = self.pending_assistant_id() {
            warn!(pending_id, "rejected second pending assistant message");
            return Err(StoreError::PendingExists(pending_id.to_string()));
        }

        let id = format!("assistant-{}", Uuid::new_v4());
        debug!(message_id = %id, "appending pending assistant message");
        self.push(Message {
            id: id.clone(),
            role: Role::Assistant,
            text: None,
            image: None,
            audio: None,
            status: MessageStatus::Pending,
            created_at: now_timestamp(),
        });
        Ok(id)
    }

    /// Resolves a pending assistant message in place. Any id that is not currently pending
    /// leaves the transcript untouched.
    pub fn reconcile(&mut self, id: &str, outcome: ReconcileOutcome) -> Result<(), StoreError> {
        let Some(position) = self.positions.get(id).copied() else {
            warn!(message_id = id, "reconcile requested for unknown message");
            return Err(StoreError::UnknownMessage(id.to_string()));
        };

        let message = &mut self.messages[position];
        if message.status.is_terminal() {
            warn!(
                message_id = id,
                status = ?message.status,
                "ignoring duplicate or stale reconciliation"
            );
            return Err(StoreError::NotPending(id.to_string()));
        }

        match outcome {
            ReconcileOutcome::Success { text, image, audio } => {
                message.text = text;
                message.image = image;
                message.audio = audio;
                message.status = MessageStatus::Complete;
            }
            ReconcileOutcome::Failure { display_text } => {
                message.text = Some(display_text);
                message.image = None;
                message.audio = None;
                message.status = MessageStatus::Failed;
            }
        }
        info!(message_id = id, status = ?message.status, position, "assistant message reconciled");
        Ok(())
    }

    fn push(&mut self, message: Message) {
        self.positions
            .insert(message.id.clone(), self.messages.len());
        self.messages.push(message);
    }
}

fn normalize_text(text: &str) -> Option<String> {
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(transcript: &Transcript) -> Vec<String> {
        transcript
            .messages()
            .iter()
            .map(|message| message.id.clone())
            .collect()
    }

    #[test]
    fn user_message_is_complete_at_creation() {
        let mut transcript = Transcript::new();

        let id = transcript
            .append_user_message("What is 2+2?", None)
            .expect("text message should be accepted");

        let message = transcript.get(&id).expect("message should exist");
        assert_eq!(message.role, Role::User);
        assert_eq!(message.status, MessageStatus::Complete);
        assert_eq!(message.text.as_deref(), Some("What is 2+2?"));
        assert!(message.image.is_none() && message.audio.is_none());
    }

    #[test]
    fn rejects_blank_text_without_media() {
        let mut transcript = Transcript::new();

        assert_eq!(
            transcript.append_user_message("   \n", None),
            Err(StoreError::EmptyMessage)
        );
        assert!(transcript.is_empty());
    }

    #[test]
    fn routes_media_to_matching_slot() {
        let mut transcript = Transcript::new();

        let id = transcript
            .append_user_message(
                "",
                Some(MessageMedia {
                    kind: AttachmentKind::Audio,
                    uri: "data:audio/webm;base64,AAA=".to_string(),
                }),
            )
            .expect("media-only message should be accepted");

        let message = transcript.get(&id).expect("message should exist");
        assert!(message.text.is_none());
        assert!(message.image.is_none());
        assert_eq!(message.audio.as_deref(), Some("data:audio/webm;base64,AAA="));
    }

    #[test]
    fn only_one_pending_assistant_at_a_time() {
        let mut transcript = Transcript::new();
        let first = transcript
            .append_pending_assistant()
            .expect("first placeholder should be accepted");

        assert_eq!(
            transcript.append_pending_assistant(),
            Err(StoreError::PendingExists(first.clone()))
        );

        transcript
            .reconcile(
                &first,
                ReconcileOutcome::Success {
                    text: Some("4".to_string()),
                    image: None,
                    audio: None,
                },
            )
            .expect("reconcile should succeed");
        assert!(transcript.append_pending_assistant().is_ok());
    }

    #[test]
    fn reconcile_replaces_in_place_and_preserves_order() {
        let mut transcript = Transcript::new();
        transcript
            .append_user_message("first", None)
            .expect("user message should be accepted");
        let pending = transcript
            .append_pending_assistant()
            .expect("placeholder should be accepted");
        let before = ids(&transcript);

        transcript
            .reconcile(
                &pending,
                ReconcileOutcome::Success {
                    text: Some("answer".to_string()),
                    image: Some("https://example.com/diagram.png".to_string()),
                    audio: None,
                },
            )
            .expect("reconcile should succeed");

        assert_eq!(ids(&transcript), before);
        let message = transcript.get(&pending).expect("message should exist");
        assert_eq!(message.status, MessageStatus::Complete);
        assert_eq!(message.text.as_deref(), Some("answer"));
        assert_eq!(
            message.image.as_deref(),
            Some("https://example.com/diagram.png")
        );
    }

    #[test]
    fn second_reconcile_is_a_no_op() {
        let mut transcript = Transcript::new();
        let pending = transcript
            .append_pending_assistant()
            .expect("placeholder should be accepted");
        transcript
            .reconcile(
                &pending,
                ReconcileOutcome::Failure {
                    display_text: "Sorry".to_string(),
                },
            )
            .expect("first reconcile should succeed");

        let result = transcript.reconcile(
            &pending,
            ReconcileOutcome::Success {
                text: Some("late answer".to_string()),
                image: None,
                audio: None,
            },
        );

        assert_eq!(result, Err(StoreError::NotPending(pending.clone())));
        let message = transcript.get(&pending).expect("message should exist");
        assert_eq!(message.status, MessageStatus::Failed);
        assert_eq!(message.text.as_deref(), Some("Sorry"));
    }

    #[test]
    fn reconcile_against_user_or_unknown_id_is_rejected() {
        let mut transcript = Transcript::new();
        let user_id = transcript
            .append_user_message("hi", None)
            .expect("user message should be accepted");
        let success = ReconcileOutcome::Success {
            text: Some("x".to_string()),
            image: None,
            audio: None,
        };

        assert_eq!(
            transcript.reconcile(&user_id, success.clone()),
            Err(StoreError::NotPending(user_id.clone()))
        );
        assert_eq!(
            transcript.reconcile("assistant-missing", success),
            Err(StoreError::UnknownMessage("assistant-missing".to_string()))
        );
        assert_eq!(
            transcript.get(&user_id).and_then(|m| m.text.as_deref()),
            Some("hi")
        );
    }

    #[test]
    fn message_serializes_camel_case_without_empty_slots() {
        let mut transcript = Transcript::new();
        let id = transcript
            .append_pending_assistant()
            .expect("placeholder should be accepted");

        let value = serde_json::to_value(transcript.get(&id).expect("message should exist"))
            .expect("message should serialize");

        assert_eq!(value["status"], "pending");
        assert_eq!(value["role"], "assistant");
        assert!(value.get("createdAt").is_some());
        assert!(value.get("text").is_none());
    }
}
