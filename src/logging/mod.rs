use std::{
    fs::{self, File, OpenOptions},
    io::{self, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use tracing::info;
use tracing_subscriber::{fmt::MakeWriter, prelude::*, EnvFilter};

pub const LOG_FILE_NAME: &str = "sage-chat.log";
const DEFAULT_LOG_FILTER: &str = "info,sage_chat=debug";
const MAX_LOG_FILE_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct LoggingState {
    log_file_path: Arc<PathBuf>,
}

impl LoggingState {
    pub fn new(log_file_path: PathBuf) -> Self {
        Self {
            log_file_path: Arc::new(log_file_path),
        }
    }

    pub fn log_file_path(&self) -> &Path {
        self.log_file_path.as_path()
    }
}

/// Installs the global subscriber: `RUST_LOG`-style filtering, a plain-text file layer in
/// `log_dir` and a stderr layer.
pub fn initialize(log_dir: &Path) -> Result<LoggingState, String> {
    let log_file_path = log_dir.join(LOG_FILE_NAME);
    let writer = LogFileWriter::open(&log_file_path, MAX_LOG_FILE_BYTES)?;
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_target(true)
        .with_writer(writer);
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_writer(io::stderr);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(stderr_layer)
        .try_init()
        .map_err(|error| format!("Failed to initialize logging: {error}"))?;

    info!(log_file = %log_file_path.display(), "logging initialized");
    Ok(LoggingState::new(log_file_path))
}

/// Current log file contents, or an empty string if nothing was logged yet.
pub fn export_log_contents(state: &LoggingState) -> Result<String, String> {
    match fs::read(state.log_file_path()) {
        Ok(contents) => Ok(String::from_utf8_lossy(&contents).into_owned()),
        Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(String::new()),
        Err(error) => Err(format!(
            "Failed to read log file `{}`: {error}",
            state.log_file_path().display()
        )),
    }
}

/// Starts over once the file grows past `max_bytes`.
fn truncate_if_oversized(log_file_path: &Path, max_bytes: u64) -> Result<(), String> {
    let size = match fs::metadata(log_file_path) {
        Ok(metadata) => metadata.len(),
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(error) => {
            return Err(format!(
                "Failed to inspect log file `{}`: {error}",
                log_file_path.display()
            ))
        }
    };

    if size > max_bytes {
        File::create(log_file_path).map_err(|error| {
            format!(
                "Failed to truncate log file `{}`: {error}",
                log_file_path.display()
            )
        })?;
    }
    Ok(())
}

/// Cloneable handle to the shared log file; each clone is one `tracing` writer.
#[derive(Debug, Clone)]
struct LogFileWriter {
    file: Arc<Mutex<File>>,
}

impl LogFileWriter {
    fn open(log_file_path: &Path, max_bytes: u64) -> Result<Self, String> {
        if let Some(parent_dir) = log_file_path.parent() {
            fs::create_dir_all(parent_dir).map_err(|error| {
                format!(
                    "Failed to create log directory `{}`: {error}",
                    parent_dir.display()
                )
            })?;
        }

        truncate_if_oversized(log_file_path, max_bytes)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_file_path)
            .map_err(|error| {
                format!(
                    "Failed to open log file `{}`: {error}",
                    log_file_path.display()
                )
            })?;

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    fn with_file<T>(&self, action: impl FnOnce(&mut File) -> io::Result<T>) -> io::Result<T> {
        let mut file = self
            .file
            .lock()
            .map_err(|_| io::Error::other("log file lock poisoned"))?;
        action(&mut file)
    }
}

impl<'a> MakeWriter<'a> for LogFileWriter {
    type Writer = LogFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

impl Write for LogFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.with_file(|file| file.write_all(buf))?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.with_file(|file| file.flush())
    }
}
