use std::{fmt, sync::Arc, time::Duration};

use bytes::{Bytes, BytesMut};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::{
    attachment_capture::{Attachment, PreviewRegistry},
    status_notifier::Notice,
};

pub const MAX_RECORDING_DURATION: Duration = Duration::from_secs(60);

/// Receives encoded audio fragments from a capture device, in arrival order.
pub type FragmentCallback = Arc<dyn Fn(Bytes) + Send + Sync + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceError(pub String);

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::error::Error for DeviceError {}

/// An audio input that can be opened for exclusive capture.
pub trait AudioInputDevice: Send {
    fn name(&self) -> &str;

    fn open(&mut self, on_fragment: FragmentCallback) -> Result<Box<dyn CaptureStream>, DeviceError>;
}

/// An open capture. Releasing it stops fragment delivery and frees the device.
pub trait CaptureStream: Send {
    fn release(self: Box<Self>);
}

/// Stand-in device for builds without native capture; every open is refused.
#[derive(Debug, Default)]
pub struct NoInputDevice;

impl AudioInputDevice for NoInputDevice {
    fn name(&self) -> &str {
        "none"
    }

    fn open(&mut self, _on_fragment: FragmentCallback) -> Result<Box<dyn CaptureStream>, DeviceError> {
        Err(DeviceError(
            "No audio input device is available in this build".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecorderState {
    Idle,
    Recording,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Manual,
    Deadline,
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Deadline => "deadline",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecorderError {
    AlreadyRecording,
    AttachmentPending,
    NotRecording,
    DeviceUnavailable(String),
}

impl RecorderError {
    /// Only device failures are worth interrupting the user for.
    pub fn notice(&self) -> Option<Notice> {
        match self {
            Self::DeviceUnavailable(_) => Some(Notice::error(
                "Microphone Error",
                "Could not access microphone. Please check permissions.",
            )),
            _ => None,
        }
    }
}

impl fmt::Display for RecorderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyRecording => write!(f, "Recording is already in progress"),
            Self::AttachmentPending => {
                write!(f, "Remove the pending attachment before recording")
            }
            Self::NotRecording => write!(f, "Recording is not in progress"),
            Self::DeviceUnavailable(message) => {
                write!(f, "Audio input device unavailable: {message}")
            }
        }
    }
}

impl std::error::Error for RecorderError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordingStarted {
    pub recording_id: u64,
    pub deadline: Instant,
}

#[derive(Debug)]
pub struct RecordingStopped {
    pub recording_id: u64,
    pub reason: StopReason,
    pub fragment_count: usize,
    pub elapsed: Duration,
    /// `None` when no audio was captured.
    pub attachment: Option<Attachment>,
}

struct RecorderSession {
    id: u64,
    state: RecorderState,
    chunks: Vec<Bytes>,
    started_at: Instant,
    deadline: Instant,
    capture: Option<Box<dyn CaptureStream>>,
}

impl RecorderSession {
    fn release_device(&mut self) {
        if let Some(capture) = self.capture.take() {
            capture.release();
            debug!(recording_id = self.id, "audio input device released");
        }
    }
}

impl Drop for RecorderSession {
    fn drop(&mut self) {
        self.release_device();
    }
}

pub struct AudioRecorder {
    device: Box<dyn AudioInputDevice>,
    registry: PreviewRegistry,
    session: Option<RecorderSession>,
    next_recording_id: u64,
    max_duration: Duration,
}

impl fmt::Debug for AudioRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioRecorder")
            .field("device", &self.device.name())
            .field("state", &self.state())
            .field("next_recording_id", &self.next_recording_id)
            .finish_non_exhaustive()
    }
}

impl AudioRecorder {
    pub fn new(device: Box<dyn AudioInputDevice>, registry: PreviewRegistry) -> Self {
        Self::with_max_duration(device, registry, MAX_RECORDING_DURATION)
    }

    pub fn with_max_duration(
        device: Box<dyn AudioInputDevice>,
        registry: PreviewRegistry,
        max_duration: Duration,
    ) -> Self {
        debug!(device = device.name(), "audio recorder initialized");
        Self {
            device,
            registry,
            session: None,
            next_recording_id: 1,
            max_duration,
        }
    }

    pub fn state(&self) -> RecorderState {
        self.session
            .as_ref()
            .map(|session| session.state)
            .unwrap_or(RecorderState::Idle)
    }

    pub fn is_recording(&self) -> bool {
        self.state() == RecorderState::Recording
    }

    pub fn active_recording_id(&self) -> Option<u64> {
        self.session.as_ref().map(|session| session.id)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.session.as_ref().map(|session| session.deadline)
    }

    /// Acquires the input device and begins a session. `route` receives every fragment the
    /// device produces, tagged with the recording id, so it can be fed back through
    /// [`AudioRecorder::push_fragment`] from the owning event loop.
    pub fn start<F>(
        &mut self,
        attachment_pending: bool,
        route: F,
    ) -> Result<RecordingStarted, RecorderError>
    where
        F: Fn(u64, Bytes) + Send + Sync + 'static,
    {
        if self.session.is_some() {
            warn!("recording start requested while already recording");
            return Err(RecorderError::AlreadyRecording);
        }

        if attachment_pending {
            warn!("recording start requested while an attachment is pending");
            return Err(RecorderError::AttachmentPending);
        }

        let recording_id = self.next_recording_id;
        let on_fragment: FragmentCallback = Arc::new(move |bytes| route(recording_id, bytes));
        let capture = self.device.open(on_fragment).map_err(|error| {
            error!(device = self.device.name(), error = %error, "failed to open audio input");
            RecorderError::DeviceUnavailable(error.0)
        })?;

        self.next_recording_id += 1;
        let started_at = Instant::now();
        let deadline = started_at + self.max_duration;
        self.session = Some(RecorderSession {
            id: recording_id,
            state: RecorderState::Recording,
            chunks: Vec::new(),
            started_at,
            deadline,
            capture: Some(capture),
        });

        info!(
            recording_id,
            device = self.device.name(),
            max_duration_ms = self.max_duration.as_millis() as u64,
            "recording started"
        );
        Ok(RecordingStarted {
            recording_id,
            deadline,
        })
    }

    /// Appends a fragment to the active session. Fragments for any other recording id are
    /// late deliveries from a finished session and are dropped.
    pub fn push_fragment(&mut self, recording_id: u64, fragment: Bytes) -> bool {
        match self.session.as_mut() {
            Some(session) if session.id == recording_id => {
                session.chunks.push(fragment);
                true
            }
            _ => {
                debug!(
                    recording_id,
                    byte_len = fragment.len(),
                    "dropping fragment for inactive recording"
                );
                false
            }
        }
    }

    pub fn stop(&mut self) -> Result<RecordingStopped, RecorderError> {
        let Some(session) = self.session.take() else {
            warn!("recording stop requested while idle");
            return Err(RecorderError::NotRecording);
        };
        Ok(self.finish(session, StopReason::Manual))
    }

    /// Deadline timer callback. Stale timers from an earlier session are ignored.
    pub fn on_deadline(&mut self, recording_id: u64) -> Option<RecordingStopped> {
        if self.active_recording_id() != Some(recording_id) {
            debug!(recording_id, "ignoring deadline for inactive recording");
            return None;
        }
        self.expire_if_due(Instant::now())
    }

    /// Forces the deadline stop if `now` has reached it.
    pub fn expire_if_due(&mut self, now: Instant) -> Option<RecordingStopped> {
        let deadline = self.deadline()?;
        if now < deadline {
            return None;
        }
        let session = self.session.take()?;
        Some(self.finish(session, StopReason::Deadline))
    }

    /// Tears the session down after a device failure. Captured fragments are discarded.
    pub fn abort(&mut self, message: &str) -> bool {
        let Some(mut session) = self.session.take() else {
            return false;
        };
        session.state = RecorderState::Stopped;
        session.release_device();
        error!(
            recording_id = session.id,
            message,
            discarded_fragments = session.chunks.len(),
            "recording aborted"
        );
        true
    }

    fn finish(&self, mut session: RecorderSession, reason: StopReason) -> RecordingStopped {
        session.state = RecorderState::Stopped;
        session.release_device();

        let fragment_count = session.chunks.len();
        let elapsed = session.started_at.elapsed();
        let payload = concat_fragments(&session.chunks);

        let attachment = if payload.is_empty() {
            info!(
                recording_id = session.id,
                reason = reason.as_str(),
                "discarding empty recording"
            );
            None
        } else {
            Some(Attachment::from_recording(&self.registry, payload))
        };

        info!(
            recording_id = session.id,
            reason = reason.as_str(),
            fragment_count,
            elapsed_ms = elapsed.as_millis() as u64,
            produced_attachment = attachment.is_some(),
            "recording stopped"
        );

        RecordingStopped {
            recording_id: session.id,
            reason,
            fragment_count,
            elapsed,
            attachment,
        }
    }
}

fn concat_fragments(chunks: &[Bytes]) -> Bytes {
    let total_len = chunks.iter().map(Bytes::len).sum();
    let mut payload = BytesMut::with_capacity(total_len);
    for chunk in chunks {
        payload.extend_from_slice(chunk);
    }
    payload.freeze()
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct DeviceLog {
        pub opened: Mutex<u32>,
        pub released: Mutex<u32>,
        pub callbacks: Mutex<Vec<FragmentCallback>>,
    }

    impl DeviceLog {
        pub fn opened(&self) -> u32 {
            *self.opened.lock().expect("opened lock should not be poisoned")
        }

        pub fn released(&self) -> u32 {
            *self
                .released
                .lock()
                .expect("released lock should not be poisoned")
        }

        /// Simulates the device delivering a fragment through the most recent callback.
        pub fn deliver(&self, bytes: &'static [u8]) {
            let callback = self
                .callbacks
                .lock()
                .expect("callback lock should not be poisoned")
                .last()
                .cloned()
                .expect("device should have been opened");
            callback(Bytes::from_static(bytes));
        }
    }

    pub struct TestDevice {
        pub log: Arc<DeviceLog>,
        pub deny: bool,
    }

    impl TestDevice {
        pub fn available() -> (Self, Arc<DeviceLog>) {
            let log = Arc::new(DeviceLog::default());
            (
                Self {
                    log: Arc::clone(&log),
                    deny: false,
                },
                log,
            )
        }

        pub fn denied() -> (Self, Arc<DeviceLog>) {
            let (mut device, log) = Self::available();
            device.deny = true;
            (device, log)
        }
    }

    impl AudioInputDevice for TestDevice {
        fn name(&self) -> &str {
            "test-microphone"
        }

        fn open(
            &mut self,
            on_fragment: FragmentCallback,
        ) -> Result<Box<dyn CaptureStream>, DeviceError> {
            if self.deny {
                return Err(DeviceError("permission denied".to_string()));
            }
            *self
                .log
                .opened
                .lock()
                .expect("opened lock should not be poisoned") += 1;
            self.log
                .callbacks
                .lock()
                .expect("callback lock should not be poisoned")
                .push(on_fragment);
            Ok(Box::new(TestCapture {
                log: Arc::clone(&self.log),
            }))
        }
    }

    struct TestCapture {
        log: Arc<DeviceLog>,
    }

    impl CaptureStream for TestCapture {
        fn release(self: Box<Self>) {
            *self
                .log
                .released
                .lock()
                .expect("released lock should not be poisoned") += 1;
        }
    }
}
