use std::future::Future;

use bytes::Bytes;
use serde::Serialize;
use tokio::{
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::sleep_until,
};
use tracing::{debug, info};

use super::{AuxiliaryTask, ChatSession, SessionError, SessionSnapshot};
use crate::{
    attachment_capture::FileSelection,
    audio_recorder::RecordingStarted,
    chat_backend::{BackendError, Concepts, GenerateResponse, Summary},
    conversation_store::Message,
    response_orchestrator::InFlightCycle,
    status_notifier::{AppStatus, Notice},
};

const UPDATE_CHANNEL_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, SessionError>>;

/// User actions, each answered on its own reply channel.
#[derive(Debug)]
pub enum SessionCommand {
    SelectFile {
        file: FileSelection,
        reply: Reply<()>,
    },
    RemoveAttachment {
        reply: Reply<bool>,
    },
    StartRecording {
        reply: Reply<RecordingStarted>,
    },
    StopRecording {
        reply: Reply<bool>,
    },
    Submit {
        text: String,
        reply: Reply<String>,
    },
    SubmitStarter {
        index: usize,
        reply: Reply<String>,
    },
    SetPrefersAudioReply {
        enabled: bool,
        reply: Reply<()>,
    },
    DismissWelcome {
        reply: Reply<()>,
    },
    Summarize {
        text: String,
        reply: Reply<Summary>,
    },
    IdentifyConcepts {
        text: String,
        reply: Reply<Concepts>,
    },
    Snapshot {
        reply: Reply<SessionSnapshot>,
    },
    Shutdown {
        reply: Reply<()>,
    },
}

/// Everything the session loop reacts to. Events are handled one at a time, to completion.
#[derive(Debug)]
pub enum SessionEvent {
    Command(SessionCommand),
    AudioFragment {
        recording_id: u64,
        fragment: Bytes,
    },
    RecordingDeadline {
        recording_id: u64,
    },
    RecordingFailed {
        message: String,
    },
    GenerateFinished {
        assistant_message_id: String,
        result: Result<GenerateResponse, BackendError>,
    },
    SummaryFinished {
        result: Result<Summary, BackendError>,
        reply: Reply<Summary>,
    },
    ConceptsFinished {
        result: Result<Concepts, BackendError>,
        reply: Reply<Concepts>,
    },
}

/// Changes pushed to the presentation layer after each handled event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionUpdate {
    MessageAppended { message: Message },
    MessageReconciled { message: Message },
    Status { status: AppStatus },
    Notice { notice: Notice },
}

#[derive(Debug, Clone)]
pub struct SessionHandle {
    events: mpsc::UnboundedSender<SessionEvent>,
    updates: broadcast::Sender<SessionUpdate>,
}

impl SessionHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub async fn select_file(&self, file: FileSelection) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SelectFile { file, reply })
            .await
    }

    pub async fn remove_attachment(&self) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::RemoveAttachment { reply })
            .await
    }

    pub async fn start_recording(&self) -> Result<RecordingStarted, SessionError> {
        self.request(|reply| SessionCommand::StartRecording { reply })
            .await
    }

    pub async fn stop_recording(&self) -> Result<bool, SessionError> {
        self.request(|reply| SessionCommand::StopRecording { reply })
            .await
    }

    /// Resolves once the question is accepted, with the id of the pending answer. The answer
    /// itself arrives as a [`SessionUpdate::MessageReconciled`].
    pub async fn submit(&self, text: impl Into<String>) -> Result<String, SessionError> {
        let text = text.into();
        self.request(|reply| SessionCommand::Submit { text, reply })
            .await
    }

    pub async fn submit_starter(&self, index: usize) -> Result<String, SessionError> {
        self.request(|reply| SessionCommand::SubmitStarter { index, reply })
            .await
    }

    pub async fn set_prefers_audio_reply(&self, enabled: bool) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::SetPrefersAudioReply { enabled, reply })
            .await
    }

    pub async fn dismiss_welcome(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::DismissWelcome { reply })
            .await
    }

    pub async fn summarize(&self, text: impl Into<String>) -> Result<Summary, SessionError> {
        let text = text.into();
        self.request(|reply| SessionCommand::Summarize { text, reply })
            .await
    }

    pub async fn identify_concepts(
        &self,
        text: impl Into<String>,
    ) -> Result<Concepts, SessionError> {
        let text = text.into();
        self.request(|reply| SessionCommand::IdentifyConcepts { text, reply })
            .await
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, SessionError> {
        self.request(|reply| SessionCommand::Snapshot { reply })
            .await
    }

    /// Reports a capture failure after the device was acquired.
    pub fn report_recording_failure(&self, message: impl Into<String>) {
        let _ = self.events.send(SessionEvent::RecordingFailed {
            message: message.into(),
        });
    }

    /// Releases the device and pending attachment, then stops the loop.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.request(|reply| SessionCommand::Shutdown { reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> SessionCommand,
    ) -> Result<T, SessionError> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(SessionEvent::Command(build(reply)))
            .map_err(|_| SessionError::Closed)?;
        response.await.map_err(|_| SessionError::Closed)?
    }
}

/// Moves `session` onto its own task and returns the handle that feeds it.
pub fn spawn_session(session: ChatSession) -> SessionHandle {
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let (updates_tx, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
    let worker = SessionWorker {
        last_status: session.status(),
        published_len: session.transcript().len(),
        session,
        events: events_tx.downgrade(),
        updates: updates_tx.clone(),
        deadline_timer: None,
        stopped: false,
    };

    tokio::spawn(worker.run(events_rx));
    SessionHandle {
        events: events_tx,
        updates: updates_tx,
    }
}

struct DeadlineTimer {
    recording_id: u64,
    task: JoinHandle<()>,
}

struct SessionWorker {
    session: ChatSession,
    events: mpsc::WeakUnboundedSender<SessionEvent>,
    updates: broadcast::Sender<SessionUpdate>,
    deadline_timer: Option<DeadlineTimer>,
    last_status: AppStatus,
    published_len: usize,
    stopped: bool,
}

impl SessionWorker {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<SessionEvent>) {
        info!("chat session runtime started");
        while let Some(event) = events.recv().await {
            self.handle(event);
            if self.stopped {
                break;
            }
        }

        if !self.stopped {
            self.stop();
        }
        info!("chat session runtime stopped");
    }

    fn handle(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Command(command) => self.handle_command(command),
            SessionEvent::AudioFragment {
                recording_id,
                fragment,
            } => {
                self.session.push_audio_fragment(recording_id, fragment);
            }
            SessionEvent::RecordingDeadline { recording_id } => {
                if self
                    .deadline_timer
                    .as_ref()
                    .is_some_and(|timer| timer.recording_id == recording_id)
                {
                    self.deadline_timer = None;
                }
                self.session.on_recording_deadline(recording_id);
            }
            SessionEvent::RecordingFailed { message } => {
                self.cancel_deadline_timer();
                self.session.on_recording_failure(&message);
            }
            SessionEvent::GenerateFinished {
                assistant_message_id,
                result,
            } => {
                self.session
                    .complete_submission(&assistant_message_id, result);
                if let Some(message) = self.session.transcript().get(&assistant_message_id) {
                    let _ = self.updates.send(SessionUpdate::MessageReconciled {
                        message: message.clone(),
                    });
                }
            }
            SessionEvent::SummaryFinished { result, reply } => {
                let result = self.auxiliary_result(AuxiliaryTask::Summarize, result);
                let _ = reply.send(result);
            }
            SessionEvent::ConceptsFinished { result, reply } => {
                let result = self.auxiliary_result(AuxiliaryTask::IdentifyConcepts, result);
                let _ = reply.send(result);
            }
        }
        self.publish();
    }

    fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::SelectFile { file, reply } => {
                let _ = reply.send(self.session.select_file(file));
            }
            SessionCommand::RemoveAttachment { reply } => {
                let _ = reply.send(Ok(self.session.remove_attachment()));
            }
            SessionCommand::StartRecording { reply } => {
                let _ = reply.send(self.start_recording());
            }
            SessionCommand::StopRecording { reply } => {
                self.cancel_deadline_timer();
                let _ = reply.send(self.session.stop_recording());
            }
            SessionCommand::Submit { text, reply } => {
                let cycle = self.session.begin_submission(&text);
                let _ = reply.send(self.dispatch_cycle(cycle));
            }
            SessionCommand::SubmitStarter { index, reply } => {
                let cycle = self.session.begin_starter_submission(index);
                let _ = reply.send(self.dispatch_cycle(cycle));
            }
            SessionCommand::SetPrefersAudioReply { enabled, reply } => {
                let _ = reply.send(self.session.set_prefers_audio_reply(enabled));
            }
            SessionCommand::DismissWelcome { reply } => {
                self.session.dismiss_welcome();
                let _ = reply.send(Ok(()));
            }
            SessionCommand::Summarize { text, reply } => {
                let input = match self.session.auxiliary_input(&text) {
                    Ok(input) => input,
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        return;
                    }
                };
                let backend = self.session.backend();
                if let Err(reply) = self.spawn_backend_call(reply, move |reply| async move {
                    let result = backend.summarize(input).await;
                    SessionEvent::SummaryFinished { result, reply }
                }) {
                    let _ = reply.send(Err(SessionError::Closed));
                }
            }
            SessionCommand::IdentifyConcepts { text, reply } => {
                let input = match self.session.auxiliary_input(&text) {
                    Ok(input) => input,
                    Err(error) => {
                        let _ = reply.send(Err(error));
                        return;
                    }
                };
                let backend = self.session.backend();
                if let Err(reply) = self.spawn_backend_call(reply, move |reply| async move {
                    let result = backend.identify_concepts(input).await;
                    SessionEvent::ConceptsFinished { result, reply }
                }) {
                    let _ = reply.send(Err(SessionError::Closed));
                }
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(Ok(self.session.snapshot()));
            }
            SessionCommand::Shutdown { reply } => {
                self.stop();
                self.publish();
                let _ = reply.send(Ok(()));
            }
        }
    }

    fn start_recording(&mut self) -> Result<RecordingStarted, SessionError> {
        if self.events.upgrade().is_none() {
            return Err(SessionError::Closed);
        }
        let fragment_events = self.events.clone();
        let started = self.session.start_recording(move |recording_id, fragment| {
            if let Some(events) = fragment_events.upgrade() {
                let _ = events.send(SessionEvent::AudioFragment {
                    recording_id,
                    fragment,
                });
            }
        })?;

        let recording_id = started.recording_id;
        let deadline = started.deadline;
        let deadline_events = self.events.clone();
        let task = tokio::spawn(async move {
            sleep_until(deadline).await;
            if let Some(events) = deadline_events.upgrade() {
                let _ = events.send(SessionEvent::RecordingDeadline { recording_id });
            }
        });
        self.cancel_deadline_timer();
        self.deadline_timer = Some(DeadlineTimer { recording_id, task });
        debug!(recording_id, "recording deadline armed");
        Ok(started)
    }

    fn cancel_deadline_timer(&mut self) {
        if let Some(timer) = self.deadline_timer.take() {
            timer.task.abort();
            debug!(recording_id = timer.recording_id, "recording deadline disarmed");
        }
    }

    /// Sends the accepted question to the backend off the loop. The result comes back as a
    /// [`SessionEvent::GenerateFinished`].
    fn dispatch_cycle(
        &mut self,
        cycle: Result<InFlightCycle, SessionError>,
    ) -> Result<String, SessionError> {
        let cycle = cycle?;
        let assistant_message_id = cycle.assistant_message_id.clone();
        let Some(events) = self.events.upgrade() else {
            self.session.complete_submission(
                &assistant_message_id,
                Err(BackendError::Network("chat session is shutting down".to_string())),
            );
            return Err(SessionError::Closed);
        };

        let backend = self.session.backend();
        let request = cycle.request;
        let started_at = cycle.started_at;
        let event_id = assistant_message_id.clone();
        tokio::spawn(async move {
            let result = backend.generate(request).await;
            debug!(
                assistant_message_id = %event_id,
                elapsed_ms = started_at.elapsed().as_millis() as u64,
                succeeded = result.is_ok(),
                "backend call returned"
            );
            let _ = events.send(SessionEvent::GenerateFinished {
                assistant_message_id: event_id,
                result,
            });
        });
        Ok(assistant_message_id)
    }

    fn spawn_backend_call<T, F, Fut>(&self, reply: Reply<T>, call: F) -> Result<(), Reply<T>>
    where
        F: FnOnce(Reply<T>) -> Fut,
        Fut: Future<Output = SessionEvent> + Send + 'static,
    {
        let Some(events) = self.events.upgrade() else {
            return Err(reply);
        };
        let task = call(reply);
        tokio::spawn(async move {
            let _ = events.send(task.await);
        });
        Ok(())
    }

    fn auxiliary_result<T>(
        &mut self,
        task: AuxiliaryTask,
        result: Result<T, BackendError>,
    ) -> Result<T, SessionError> {
        result.map_err(|error| {
            self.session.record_auxiliary_failure(task, &error);
            SessionError::Backend(error)
        })
    }

    fn stop(&mut self) {
        self.cancel_deadline_timer();
        self.session.shutdown();
        self.stopped = true;
    }

    fn publish(&mut self) {
        let messages = self.session.transcript().messages();
        for message in messages.iter().skip(self.published_len) {
            let _ = self.updates.send(SessionUpdate::MessageAppended {
                message: message.clone(),
            });
        }
        self.published_len = messages.len();

        let status = self.session.status();
        if status != self.last_status {
            self.last_status = status;
            let _ = self.updates.send(SessionUpdate::Status { status });
        }

        for notice in self.session.take_notices() {
            debug!(title = %notice.title, "publishing notice");
            let _ = self.updates.send(SessionUpdate::Notice { notice });
        }
    }
}
