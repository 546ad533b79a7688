pub mod runtime;

use std::{fmt, sync::Arc};

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
    attachment_capture::{self, Attachment, FileSelection, PreviewRegistry, ValidationError},
    audio_recorder::{
        AudioInputDevice, AudioRecorder, RecorderError, RecorderState, RecordingStarted,
        RecordingStopped,
    },
    chat_backend::{BackendError, ChatBackend, GenerateResponse},
    conversation_store::{Message, Transcript},
    encoder,
    response_orchestrator::{
        CycleReport, InFlightCycle, ResponseOrchestrator, SubmitError, Submission,
    },
    settings_store::{ChatSettings, ChatSettingsUpdate, SettingsStore},
    starter_prompts,
    status_notifier::{AppStatus, Notice, StatusNotifier},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    Validation(ValidationError),
    Recorder(RecorderError),
    Submit(SubmitError),
    Backend(BackendError),
    UnknownStarter(usize),
    Closed,
}

impl SessionError {
    pub fn notice(&self) -> Option<Notice> {
        match self {
            Self::Validation(error) => Some(error.notice()),
            Self::Recorder(error) => error.notice(),
            Self::Submit(error) => error.notice(),
            Self::Backend(_) | Self::UnknownStarter(_) | Self::Closed => None,
        }
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Validation(error) => write!(f, "{error}"),
            Self::Recorder(error) => write!(f, "{error}"),
            Self::Submit(error) => write!(f, "{error}"),
            Self::Backend(error) => write!(f, "{error}"),
            Self::UnknownStarter(index) => write!(f, "No example prompt at position {index}"),
            Self::Closed => write!(f, "Chat session has shut down"),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<ValidationError> for SessionError {
    fn from(error: ValidationError) -> Self {
        Self::Validation(error)
    }
}

impl From<RecorderError> for SessionError {
    fn from(error: RecorderError) -> Self {
        Self::Recorder(error)
    }
}

impl From<SubmitError> for SessionError {
    fn from(error: SubmitError) -> Self {
        Self::Submit(error)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryTask {
    Summarize,
    IdentifyConcepts,
}

impl AuxiliaryTask {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summarize => "summarize",
            Self::IdentifyConcepts => "identify_concepts",
        }
    }

    fn failure_notice(&self) -> Notice {
        match self {
            Self::Summarize => Notice::error(
                "Could not summarize",
                "Failed to get a summary from the AI. Please try again.",
            ),
            Self::IdentifyConcepts => Notice::error(
                "Could not identify concepts",
                "Failed to get related concepts from the AI. Please try again.",
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingAttachment {
    pub kind: &'static str,
    pub mime_type: String,
    pub size_bytes: u64,
    pub preview_uri: String,
}

/// Read-only view of everything the presentation layer renders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: AppStatus,
    pub recorder_state: RecorderState,
    pub is_responding: bool,
    pub prefers_audio_reply: bool,
    pub show_welcome: bool,
    pub pending_attachment: Option<PendingAttachment>,
    pub messages: Vec<Message>,
}

/// The single owner of all per-session state. Every operation runs to completion; the only
/// work that outlives a call is the backend request handed out by
/// [`ChatSession::begin_submission`].
pub struct ChatSession {
    registry: PreviewRegistry,
    composer: Option<Attachment>,
    recorder: AudioRecorder,
    orchestrator: ResponseOrchestrator,
    transcript: Transcript,
    notifier: StatusNotifier,
    settings: ChatSettings,
    settings_store: Option<Arc<SettingsStore>>,
}

impl fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChatSession")
            .field("composer", &self.composer)
            .field("recorder", &self.recorder)
            .field("orchestrator", &self.orchestrator)
            .field("messages", &self.transcript.len())
            .field("status", &self.notifier.current())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        device: Box<dyn AudioInputDevice>,
        settings: ChatSettings,
    ) -> Self {
        let registry = PreviewRegistry::new();
        info!(backend = backend.name(), "chat session created");
        Self {
            recorder: AudioRecorder::new(device, registry.clone()),
            registry,
            composer: None,
            orchestrator: ResponseOrchestrator::new(backend),
            transcript: Transcript::new(),
            notifier: StatusNotifier::new(),
            settings,
            settings_store: None,
        }
    }

    /// Persists preference changes through `store`.
    pub fn with_settings_store(mut self, store: Arc<SettingsStore>) -> Self {
        self.settings_store = Some(store);
        self
    }

    pub fn backend(&self) -> Arc<dyn ChatBackend> {
        self.orchestrator.backend()
    }

    pub fn registry(&self) -> &PreviewRegistry {
        &self.registry
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn status(&self) -> AppStatus {
        self.notifier.current()
    }

    pub fn recorder_state(&self) -> RecorderState {
        self.recorder.state()
    }

    pub fn active_recording_id(&self) -> Option<u64> {
        self.recorder.active_recording_id()
    }

    pub fn pending_attachment(&self) -> Option<&Attachment> {
        self.composer.as_ref()
    }

    pub fn is_responding(&self) -> bool {
        self.orchestrator.is_responding()
    }

    pub fn prefers_audio_reply(&self) -> bool {
        self.settings.prefers_audio_reply
    }

    pub fn show_welcome(&self) -> bool {
        self.settings.show_welcome && self.transcript.is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            status: self.status(),
            recorder_state: self.recorder.state(),
            is_responding: self.is_responding(),
            prefers_audio_reply: self.prefers_audio_reply(),
            show_welcome: self.show_welcome(),
            pending_attachment: self.composer.as_ref().map(|attachment| PendingAttachment {
                kind: attachment.kind().as_str(),
                mime_type: attachment.mime_type().to_string(),
                size_bytes: attachment.size_bytes(),
                preview_uri: attachment.preview_uri().to_string(),
            }),
            messages: self.transcript.messages().to_vec(),
        }
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        self.notifier.take_notices()
    }

    /// Validates a picked file and makes it the pending attachment, revoking whatever it
    /// replaces.
    pub fn select_file(&mut self, file: FileSelection) -> Result<(), SessionError> {
        let result = self.try_select_file(file);
        self.surface(result)
    }

    fn try_select_file(&mut self, file: FileSelection) -> Result<(), SessionError> {
        self.ensure_idle_input()?;
        if self.recorder.is_recording() {
            warn!("file selection rejected while recording");
            return Err(RecorderError::AlreadyRecording.into());
        }

        let attachment = attachment_capture::capture_file(&self.registry, file)?;
        if let Some(replaced) = self.composer.replace(attachment) {
            debug!(uri = %replaced.preview_uri(), "replacing pending attachment");
            replaced.release();
        }
        Ok(())
    }

    pub fn remove_attachment(&mut self) -> bool {
        match self.composer.take() {
            Some(attachment) => {
                attachment.release();
                true
            }
            None => false,
        }
    }

    /// Opens the input device. `route` must deliver fragments back through
    /// [`ChatSession::push_audio_fragment`] on the session's own event loop.
    pub fn start_recording<F>(&mut self, route: F) -> Result<RecordingStarted, SessionError>
    where
        F: Fn(u64, Bytes) + Send + Sync + 'static,
    {
        let result = match self.ensure_idle_input() {
            Ok(()) => self
                .recorder
                .start(self.composer.is_some(), route)
                .map_err(SessionError::from),
            Err(error) => Err(error),
        };
        let result = self.surface(result);
        self.refresh_status();
        result
    }

    pub fn push_audio_fragment(&mut self, recording_id: u64, fragment: Bytes) -> bool {
        self.recorder.push_fragment(recording_id, fragment)
    }

    /// Manual stop. Returns `true` when the recording produced an attachment.
    pub fn stop_recording(&mut self) -> Result<bool, SessionError> {
        let result = self.recorder.stop().map_err(SessionError::from);
        let result = self.surface(result).map(|stopped| self.adopt_recording(stopped));
        self.refresh_status();
        result
    }

    pub fn on_recording_deadline(&mut self, recording_id: u64) -> bool {
        let produced = self
            .recorder
            .on_deadline(recording_id)
            .map(|stopped| self.adopt_recording(stopped))
            .unwrap_or(false);
        if produced {
            self.notifier.notify(Notice::info(
                "Recording stopped",
                "Voice questions are limited to 60 seconds. Send it or record again.",
            ));
        }
        self.refresh_status();
        produced
    }

    /// The device failed after it was acquired.
    pub fn on_recording_failure(&mut self, message: &str) {
        if self.recorder.abort(message) {
            if let Some(notice) = RecorderError::DeviceUnavailable(message.to_string()).notice() {
                self.notifier.notify(notice);
            }
        }
        self.refresh_status();
    }

    fn adopt_recording(&mut self, stopped: RecordingStopped) -> bool {
        let Some(attachment) = stopped.attachment else {
            return false;
        };

        if let Some(replaced) = self.composer.replace(attachment) {
            warn!(
                uri = %replaced.preview_uri(),
                "recording replaced a pending attachment"
            );
            replaced.release();
        }
        true
    }

    /// Records the user's question and hands back the request to send. The pending
    /// attachment is only consumed once the submission is accepted.
    pub fn begin_submission(&mut self, text: &str) -> Result<InFlightCycle, SessionError> {
        let result = self.try_begin_submission(text, true);
        let result = self.surface(result);
        self.refresh_status();
        result
    }

    /// Sends one of the welcome-screen examples as a plain text question.
    pub fn begin_starter_submission(
        &mut self,
        index: usize,
    ) -> Result<InFlightCycle, SessionError> {
        let result = match starter_prompts::starter_prompt(index) {
            Some(starter) => self.try_begin_submission(starter.prompt, false),
            None => Err(SessionError::UnknownStarter(index)),
        };
        let result = self.surface(result);
        self.refresh_status();
        result
    }

    fn try_begin_submission(
        &mut self,
        text: &str,
        with_attachment: bool,
    ) -> Result<InFlightCycle, SessionError> {
        self.ensure_idle_input()?;
        let attachment_pending = with_attachment && self.composer.is_some();
        if text.trim().is_empty() && !attachment_pending {
            return Err(SubmitError::EmptyMessage.into());
        }

        let attachment = if with_attachment {
            self.composer.take()
        } else {
            None
        };
        let submission = Submission {
            text: text.to_string(),
            attachment,
            prefers_audio_reply: self.settings.prefers_audio_reply,
        };
        Ok(self.orchestrator.begin(&mut self.transcript, submission)?)
    }

    pub fn complete_submission(
        &mut self,
        assistant_message_id: &str,
        result: Result<GenerateResponse, BackendError>,
    ) -> CycleReport {
        let report = self
            .orchestrator
            .finish(&mut self.transcript, assistant_message_id, result);
        if let Some(notice) = &report.notice {
            self.notifier.notify(notice.clone());
        }
        self.refresh_status();
        report
    }

    /// Submits and awaits the answer inline.
    pub async fn submit(&mut self, text: &str) -> Result<CycleReport, SessionError> {
        let cycle = self.begin_submission(text)?;
        let result = self.orchestrator.backend().generate(cycle.request).await;
        Ok(self.complete_submission(&cycle.assistant_message_id, result))
    }

    pub fn set_prefers_audio_reply(&mut self, enabled: bool) -> Result<(), SessionError> {
        if let Err(error) = self.ensure_idle_input() {
            return self.surface(Err(error));
        }

        self.settings.prefers_audio_reply = enabled;
        info!(enabled, "audio reply preference changed");
        self.persist(ChatSettingsUpdate {
            prefers_audio_reply: Some(enabled),
            ..ChatSettingsUpdate::default()
        });
        Ok(())
    }

    pub fn dismiss_welcome(&mut self) {
        if !self.settings.show_welcome {
            return;
        }
        self.settings.show_welcome = false;
        self.persist(ChatSettingsUpdate {
            show_welcome: Some(false),
            ..ChatSettingsUpdate::default()
        });
    }

    /// Input for the auxiliary flows: the pending attachment's data URI when there is one,
    /// otherwise the typed text. The attachment stays pending.
    pub fn auxiliary_input(&mut self, text: &str) -> Result<String, SessionError> {
        let result = match &self.composer {
            Some(attachment) => encoder::to_data_uri(attachment)
                .map_err(|error| SessionError::Submit(SubmitError::Encode(error))),
            None if text.trim().is_empty() => Err(SubmitError::EmptyMessage.into()),
            None => Ok(text.to_string()),
        };
        self.surface(result)
    }

    pub fn record_auxiliary_failure(&mut self, task: AuxiliaryTask, error: &BackendError) {
        warn!(task = task.as_str(), error = %error, "auxiliary request failed");
        self.notifier.notify(task.failure_notice());
    }

    /// Releases the input device and the pending attachment.
    pub fn shutdown(&mut self) {
        if self.recorder.abort("session shutting down") {
            info!("active recording discarded on shutdown");
        }
        self.remove_attachment();
        self.refresh_status();
        info!(messages = self.transcript.len(), "chat session shut down");
    }

    fn ensure_idle_input(&self) -> Result<(), SessionError> {
        if self.orchestrator.is_responding() {
            return Err(SubmitError::Busy.into());
        }
        Ok(())
    }

    fn surface<T>(&mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        if let Err(error) = &result {
            debug!(error = %error, "session operation rejected");
            if let Some(notice) = error.notice() {
                self.notifier.notify(notice);
            }
        }
        result
    }

    fn persist(&self, update: ChatSettingsUpdate) {
        let Some(store) = &self.settings_store else {
            return;
        };
        if let Err(error) = store.update(update) {
            warn!(error = %error, "failed to persist chat settings");
        }
    }

    fn refresh_status(&mut self) {
        let status = if self.orchestrator.is_responding() {
            AppStatus::Responding
        } else if self.recorder.is_recording() {
            AppStatus::Recording
        } else {
            AppStatus::Idle
        };
        self.notifier.set(status);
    }
}
