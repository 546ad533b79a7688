pub mod attachment_capture;
pub mod audio_recorder;
pub mod chat_backend;
pub mod chat_session;
pub mod conversation_store;
pub mod encoder;
pub mod logging;
pub mod response_orchestrator;
pub mod settings_store;
pub mod starter_prompts;
pub mod status_notifier;

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};
use tracing::{error, info, warn};

use attachment_capture::{FileSelection, MAX_ATTACHMENT_BYTES};
use audio_recorder::NoInputDevice;
use chat_backend::genkit::{GenkitBackendConfig, GenkitChatBackend};
use chat_session::{
    runtime::{spawn_session, SessionHandle, SessionUpdate},
    ChatSession, SessionError,
};
use conversation_store::{Message, MessageStatus, Role};
use logging::LoggingState;
use settings_store::SettingsStore;
use status_notifier::{Notice, NoticeVariant};

const DATA_DIR_ENV: &str = "SAGE_DATA_DIR";
const DEFAULT_DATA_DIR_NAME: &str = "sage-chat";
const MEDIA_PREVIEW_CHARS: usize = 48;

#[derive(Debug, Clone, PartialEq, Eq)]
enum TerminalCommand {
    Ask(String),
    Attach(PathBuf),
    Remove,
    Record,
    Stop,
    AudioReply(bool),
    Summarize(String),
    Concepts(String),
    Examples,
    Example(usize),
    Help,
    Logs,
    Quit,
}

fn parse_command(line: &str) -> Result<Option<TerminalCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let Some(command) = line.strip_prefix('/') else {
        return Ok(Some(TerminalCommand::Ask(line.to_string())));
    };

    let (name, argument) = match command.split_once(char::is_whitespace) {
        Some((name, argument)) => (name, argument.trim()),
        None => (command, ""),
    };

    let parsed = match (name, argument) {
        ("attach", "") => return Err("Usage: /attach <path>".to_string()),
        ("attach", path) => TerminalCommand::Attach(PathBuf::from(path)),
        ("send", text) => TerminalCommand::Ask(text.to_string()),
        ("remove", _) => TerminalCommand::Remove,
        ("record", _) => TerminalCommand::Record,
        ("stop", _) => TerminalCommand::Stop,
        ("audio", "on") => TerminalCommand::AudioReply(true),
        ("audio", "off") => TerminalCommand::AudioReply(false),
        ("audio", _) => return Err("Usage: /audio on|off".to_string()),
        ("summarize", text) => TerminalCommand::Summarize(text.to_string()),
        ("concepts", text) => TerminalCommand::Concepts(text.to_string()),
        ("examples", _) => TerminalCommand::Examples,
        ("example", index) => {
            let position = index
                .parse::<usize>()
                .ok()
                .filter(|position| *position >= 1)
                .ok_or_else(|| "Usage: /example <1-4>".to_string())?;
            TerminalCommand::Example(position - 1)
        }
        ("help", _) => TerminalCommand::Help,
        ("logs", _) => TerminalCommand::Logs,
        ("quit" | "exit", _) => TerminalCommand::Quit,
        (other, _) => return Err(format!("Unknown command `/{other}`. Try /help.")),
    };

    Ok(Some(parsed))
}

fn mime_type_for_path(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|value| value.to_str())
        .map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("webp") => "image/webp",
        Some("gif") => "image/gif",
        _ => "application/octet-stream",
    }
}

/// Oversized files are described by their metadata size only, so validation rejects them
/// without reading the contents.
async fn read_file_selection(path: &Path) -> Result<FileSelection, String> {
    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|error| format!("Failed to read `{}`: {error}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or("attachment")
        .to_string();
    let mime_type = mime_type_for_path(path);

    if metadata.len() > MAX_ATTACHMENT_BYTES {
        return Ok(FileSelection {
            name,
            mime_type: mime_type.to_string(),
            size_bytes: metadata.len(),
            bytes: Bytes::new(),
        });
    }

    let bytes = tokio::fs::read(path)
        .await
        .map_err(|error| format!("Failed to read `{}`: {error}", path.display()))?;
    Ok(FileSelection::new(name, mime_type, Bytes::from(bytes)))
}

fn resolve_data_dir() -> PathBuf {
    std::env::var(DATA_DIR_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::temp_dir().join(DEFAULT_DATA_DIR_NAME))
}

fn abbreviate_media(uri: &str) -> String {
    if uri.chars().count() <= MEDIA_PREVIEW_CHARS {
        return uri.to_string();
    }

    let prefix: String = uri.chars().take(MEDIA_PREVIEW_CHARS).collect();
    format!("{prefix}… ({} chars)", uri.len())
}

fn format_message(message: &Message) -> String {
    let speaker = match message.role {
        Role::User => "you",
        Role::Assistant => "sage",
    };

    if message.status == MessageStatus::Pending {
        return format!("[{speaker}] …thinking");
    }

    let mut lines = Vec::new();
    if let Some(text) = &message.text {
        lines.push(text.clone());
    }
    if let Some(image) = &message.image {
        lines.push(format!("(image) {}", abbreviate_media(image)));
    }
    if let Some(audio) = &message.audio {
        lines.push(format!("(audio) {}", abbreviate_media(audio)));
    }

    let marker = if message.status == MessageStatus::Failed {
        "!"
    } else {
        ""
    };
    format!("[{speaker}{marker}] {}", lines.join("\n    "))
}

fn format_notice(notice: &Notice) -> String {
    let label = match notice.variant {
        NoticeVariant::Destructive => "error",
        NoticeVariant::Default => "note",
    };
    format!("<{label}> {}: {}", notice.title, notice.description)
}

fn print_starter_prompts() {
    println!("Try one of these (/example <n>):");
    for (position, starter) in starter_prompts::starter_prompts().iter().enumerate() {
        println!("  {}. {}: {}", position + 1, starter.label, starter.prompt);
    }
}

fn print_help() {
    println!(
        "Type a question and press enter.\n\
         /attach <path>     attach a JPG, PNG, GIF or WEBP image (max 5MB)\n\
         /send              send the pending attachment on its own\n\
         /remove            drop the pending attachment\n\
         /record, /stop     record a voice question (max 60s)\n\
         /audio on|off      ask for spoken replies\n\
         /summarize <text>  summarize homework context\n\
         /concepts <text>   list related concepts\n\
         /examples          show example questions\n\
         /example <n>       ask example question n\n\
         /logs              print this session's log file\n\
         /quit              exit"
    );
}

async fn print_updates(mut updates: broadcast::Receiver<SessionUpdate>) {
    loop {
        match updates.recv().await {
            Ok(SessionUpdate::MessageAppended { message })
            | Ok(SessionUpdate::MessageReconciled { message }) => {
                println!("{}", format_message(&message));
            }
            Ok(SessionUpdate::Notice { notice }) => println!("{}", format_notice(&notice)),
            Ok(SessionUpdate::Status { .. }) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "terminal fell behind session updates");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn execute(
    handle: &SessionHandle,
    logging_state: &LoggingState,
    command: TerminalCommand,
) -> Result<bool, SessionError> {
    match command {
        TerminalCommand::Ask(text) => {
            handle.submit(text).await?;
        }
        TerminalCommand::Attach(path) => match read_file_selection(&path).await {
            Ok(file) => {
                handle.select_file(file).await?;
                println!("attached {}", path.display());
            }
            Err(message) => println!("{message}"),
        },
        TerminalCommand::Remove => {
            if !handle.remove_attachment().await? {
                println!("nothing attached");
            }
        }
        TerminalCommand::Record => {
            handle.start_recording().await?;
            println!("recording… /stop to finish (stops on its own after 60s)");
        }
        TerminalCommand::Stop => {
            if handle.stop_recording().await? {
                println!("voice question attached; type a question or /send to ask");
            } else {
                println!("nothing was recorded");
            }
        }
        TerminalCommand::AudioReply(enabled) => {
            handle.set_prefers_audio_reply(enabled).await?;
            println!("audio replies {}", if enabled { "on" } else { "off" });
        }
        TerminalCommand::Summarize(text) => {
            let summary = handle.summarize(text).await?;
            println!("summary: {}", summary.summary);
            if !summary.progress.is_empty() {
                println!("progress: {}", summary.progress);
            }
        }
        TerminalCommand::Concepts(text) => {
            let concepts = handle.identify_concepts(text).await?;
            println!("concepts: {}", concepts.concepts.join(", "));
        }
        TerminalCommand::Examples => print_starter_prompts(),
        TerminalCommand::Example(index) => {
            handle.submit_starter(index).await?;
        }
        TerminalCommand::Help => print_help(),
        TerminalCommand::Logs => match logging::export_log_contents(logging_state) {
            Ok(contents) => print!("{contents}"),
            Err(message) => println!("{message}"),
        },
        TerminalCommand::Quit => return Ok(false),
    }
    Ok(true)
}

async fn run_terminal() -> Result<(), String> {
    let data_dir = resolve_data_dir();
    let logging_state = logging::initialize(&data_dir)?;

    let settings_store = Arc::new(SettingsStore::new(&data_dir));
    let settings = settings_store.load().unwrap_or_else(|error| {
        warn!(error = %error, "failed to load chat settings; using defaults");
        settings_store.current()
    });

    let mut config = GenkitBackendConfig::from_env();
    if let Some(backend_url) = &settings.backend_url {
        config.base_url = backend_url.clone();
    }
    let backend = GenkitChatBackend::new(config).map_err(|error| error.to_string())?;

    let session = ChatSession::new(Arc::new(backend), Box::new(NoInputDevice), settings)
        .with_settings_store(Arc::clone(&settings_store));
    let handle = spawn_session(session);
    let printer = tokio::spawn(print_updates(handle.subscribe()));

    info!(
        data_dir = %data_dir.display(),
        log_file = %logging_state.log_file_path().display(),
        "sage-chat started"
    );
    println!("sage-chat: ask anything. /help for commands.");
    if handle
        .snapshot()
        .await
        .map(|snapshot| snapshot.show_welcome)
        .unwrap_or(false)
    {
        print_starter_prompts();
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(error) => {
                error!(error = %error, "failed to read terminal input");
                break;
            }
        };

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(message) => {
                println!("{message}");
                continue;
            }
        };

        match execute(&handle, &logging_state, command).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(SessionError::Closed) => break,
            Err(error) => {
                if error.notice().is_none() {
                    println!("{error}");
                }
            }
        }
    }

    if let Err(error) = handle.shutdown().await {
        warn!(error = %error, "chat session already closed");
    }
    drop(handle);
    printer.abort();
    info!("sage-chat exiting");
    Ok(())
}

pub fn run() {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("sage-chat: failed to start async runtime: {error}");
            std::process::exit(1);
        }
    };

    if let Err(error) = runtime.block_on(run_terminal()) {
        eprintln!("sage-chat: {error}");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(role: Role, status: MessageStatus, text: Option<&str>) -> Message {
        Message {
            id: "m-1".to_string(),
            role,
            text: text.map(str::to_string),
            image: None,
            audio: None,
            status,
            created_at: "2026-01-01T00:00:00.000Z".to_string(),
        }
    }

    fn temp_attachment_path(file_name: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::SystemTime::UNIX_EPOCH)
            .expect("clock should progress")
            .as_nanos();
        std::env::temp_dir()
            .join(format!("sage-attach-{nanos}"))
            .join(file_name)
    }

    #[tokio::test]
    async fn oversized_file_is_described_without_reading_contents() {
        let path = temp_attachment_path("huge.png");
        let parent_dir = path.parent().expect("path has a parent").to_path_buf();
        std::fs::create_dir_all(&parent_dir).expect("should create temp dir");
        let file = std::fs::File::create(&path).expect("should create sparse file");
        file.set_len(4 * 1024 * 1024 * 1024)
            .expect("should extend sparse file");
        drop(file);

        let selection = read_file_selection(&path)
            .await
            .expect("metadata should be readable");

        assert_eq!(selection.size_bytes, 4 * 1024 * 1024 * 1024);
        assert!(selection.bytes.is_empty());
        assert_eq!(selection.mime_type, "image/png");
        assert!(matches!(
            attachment_capture::capture_file(
                &attachment_capture::PreviewRegistry::new(),
                selection
            ),
            Err(attachment_capture::ValidationError::FileTooLarge { .. })
        ));
        let _ = std::fs::remove_dir_all(parent_dir);
    }

    #[tokio::test]
    async fn small_file_is_read_in_full() {
        let path = temp_attachment_path("dot.gif");
        let parent_dir = path.parent().expect("path has a parent").to_path_buf();
        std::fs::create_dir_all(&parent_dir).expect("should create temp dir");
        std::fs::write(&path, b"GIF89a").expect("should write gif");

        let selection = read_file_selection(&path)
            .await
            .expect("file should be readable");

        assert_eq!(selection.name, "dot.gif");
        assert_eq!(selection.mime_type, "image/gif");
        assert_eq!(selection.size_bytes, 6);
        assert_eq!(selection.bytes, Bytes::from_static(b"GIF89a"));
        let _ = std::fs::remove_dir_all(parent_dir);
    }

    #[test]
    fn plain_lines_are_questions_and_blank_lines_are_ignored() {
        assert_eq!(
            parse_command("  What is 2+2? "),
            Ok(Some(TerminalCommand::Ask("What is 2+2?".to_string())))
        );
        assert_eq!(parse_command("   "), Ok(None));
    }

    #[test]
    fn slash_commands_parse_arguments() {
        assert_eq!(
            parse_command("/attach ./notes/diagram one.png"),
            Ok(Some(TerminalCommand::Attach(PathBuf::from(
                "./notes/diagram one.png"
            ))))
        );
        assert_eq!(
            parse_command("/audio on"),
            Ok(Some(TerminalCommand::AudioReply(true)))
        );
        assert_eq!(
            parse_command("/example 2"),
            Ok(Some(TerminalCommand::Example(1)))
        );
        assert_eq!(
            parse_command("/summarize  cell division "),
            Ok(Some(TerminalCommand::Summarize("cell division".to_string())))
        );
        assert_eq!(
            parse_command("/send"),
            Ok(Some(TerminalCommand::Ask(String::new())))
        );
        assert_eq!(parse_command("/quit"), Ok(Some(TerminalCommand::Quit)));
    }

    #[test]
    fn malformed_commands_report_usage() {
        assert!(parse_command("/attach").is_err());
        assert!(parse_command("/audio maybe").is_err());
        assert!(parse_command("/example 0").is_err());
        assert!(parse_command("/example two").is_err());
        assert!(parse_command("/dance")
            .expect_err("unknown command should fail")
            .contains("/dance"));
    }

    #[test]
    fn mime_type_follows_extension() {
        assert_eq!(mime_type_for_path(Path::new("a.JPG")), "image/jpeg");
        assert_eq!(mime_type_for_path(Path::new("a.webp")), "image/webp");
        assert_eq!(
            mime_type_for_path(Path::new("notes.pdf")),
            "application/octet-stream"
        );
        assert_eq!(
            mime_type_for_path(Path::new("no_extension")),
            "application/octet-stream"
        );
    }

    #[test]
    fn messages_render_by_status() {
        assert_eq!(
            format_message(&message(Role::Assistant, MessageStatus::Pending, None)),
            "[sage] …thinking"
        );
        assert_eq!(
            format_message(&message(Role::User, MessageStatus::Complete, Some("hi"))),
            "[you] hi"
        );
        assert_eq!(
            format_message(&message(
                Role::Assistant,
                MessageStatus::Failed,
                Some("Sorry")
            )),
            "[sage!] Sorry"
        );
    }

    #[test]
    fn long_media_uris_are_abbreviated() {
        let uri = format!("data:image/png;base64,{}", "A".repeat(200));

        let rendered = abbreviate_media(&uri);

        assert!(rendered.starts_with("data:image/png;base64,"));
        assert!(rendered.ends_with(&format!("({} chars)", uri.len())));
        assert_eq!(abbreviate_media("https://x.test/a.png"), "https://x.test/a.png");
    }
}
