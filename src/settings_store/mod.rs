use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    sync::{Mutex, RwLock},
    time::{SystemTime, UNIX_EPOCH},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const SETTINGS_FILE_NAME: &str = "settings.json";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ChatSettings {
    pub prefers_audio_reply: bool,
    pub show_welcome: bool,
    /// Overrides `SAGE_BACKEND_URL` when set.
    pub backend_url: Option<String>,
}

impl Default for ChatSettings {
    fn default() -> Self {
        Self {
            prefers_audio_reply: false,
            show_welcome: true,
            backend_url: None,
        }
    }
}

impl ChatSettings {
    fn normalized(mut self) -> Result<Self, String> {
        self.backend_url = normalize_backend_url(self.backend_url)?;
        Ok(self)
    }

    fn with_update(mut self, update: ChatSettingsUpdate) -> Result<Self, String> {
        if let Some(prefers_audio_reply) = update.prefers_audio_reply {
            self.prefers_audio_reply = prefers_audio_reply;
        }

        if let Some(show_welcome) = update.show_welcome {
            self.show_welcome = show_welcome;
        }

        if let Some(backend_url) = update.backend_url {
            self.backend_url = backend_url;
        }

        self.normalized()
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct ChatSettingsUpdate {
    pub prefers_audio_reply: Option<bool>,
    pub show_welcome: Option<bool>,
    pub backend_url: Option<Option<String>>,
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    settings: RwLock<ChatSettings>,
    io_lock: Mutex<()>,
}

impl SettingsStore {
    pub fn new(data_dir: &Path) -> Self {
        Self::at_path(data_dir.join(SETTINGS_FILE_NAME))
    }

    pub fn at_path(path: PathBuf) -> Self {
        debug!(path = %path.display(), "settings store initialized");
        Self {
            path,
            settings: RwLock::new(ChatSettings::default()),
            io_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn current(&self) -> ChatSettings {
        self.settings
            .read()
            .map(|settings| settings.clone())
            .unwrap_or_else(|_| ChatSettings::default())
    }

    pub fn load(&self) -> Result<ChatSettings, String> {
        debug!(path = %self.path.display(), "loading settings from disk");
        let _io_guard = self.io_lock.lock().map_err(|_| io_lock_error())?;
        let settings = read_settings_file_with_recovery(&self.path)?;
        let mut guard = self.settings.write().map_err(|_| lock_error())?;
        *guard = settings.clone();
        Ok(settings)
    }

    pub fn update(&self, update: ChatSettingsUpdate) -> Result<ChatSettings, String> {
        debug!(path = %self.path.display(), "updating settings on disk");
        let _io_guard = self.io_lock.lock().map_err(|_| io_lock_error())?;
        let current_settings = read_settings_file_with_recovery(&self.path)?;
        let updated_settings = current_settings.with_update(update)?;
        write_settings_file(&self.path, &updated_settings)?;

        let mut guard = self.settings.write().map_err(|_| lock_error())?;
        *guard = updated_settings.clone();
        Ok(updated_settings)
    }
}

#[derive(Debug)]
struct SettingsReadError {
    message: String,
    recoverable: bool,
}

impl SettingsReadError {
    fn read(message: String) -> Self {
        Self {
            message,
            recoverable: false,
        }
    }

    fn malformed(message: String) -> Self {
        Self {
            message,
            recoverable: true,
        }
    }
}

fn read_settings_file_with_recovery(settings_path: &Path) -> Result<ChatSettings, String> {
    match read_settings_file(settings_path) {
        Ok(settings) => Ok(settings),
        Err(error) if error.recoverable => {
            let backup_path = backup_corrupt_settings_file(settings_path)?;
            let defaults = ChatSettings::default();
            write_settings_file(settings_path, &defaults)?;
            warn!(
                path = %settings_path.display(),
                backup = %backup_path.display(),
                reason = %error.message,
                "recovered malformed settings file"
            );
            Ok(defaults)
        }
        Err(error) => Err(error.message),
    }
}

fn read_settings_file(settings_path: &Path) -> Result<ChatSettings, SettingsReadError> {
    if !settings_path.exists() {
        info!(path = %settings_path.display(), "settings file missing; using defaults");
        return Ok(ChatSettings::default());
    }

    let file_contents = fs::read_to_string(settings_path)
        .map_err(|error| {
            format!(
                "Failed to read settings file `{}`: {error}",
                settings_path.display()
            )
        })
        .map_err(SettingsReadError::read)?;

    let parsed = serde_json::from_str::<ChatSettings>(&file_contents).map_err(|error| {
        SettingsReadError::malformed(format!(
            "Failed to parse settings file `{}`: {error}",
            settings_path.display()
        ))
    })?;

    parsed.normalized().map_err(|error| {
        SettingsReadError::malformed(format!(
            "Failed to validate settings file `{}`: {error}",
            settings_path.display()
        ))
    })
}

fn write_settings_file(settings_path: &Path, settings: &ChatSettings) -> Result<(), String> {
    if let Some(parent_dir) = settings_path.parent() {
        fs::create_dir_all(parent_dir).map_err(|error| {
            format!(
                "Failed to create settings directory `{}`: {error}",
                parent_dir.display()
            )
        })?;
    }

    let serialized = serde_json::to_vec_pretty(settings)
        .map_err(|error| format!("Failed to serialize settings: {error}"))?;
    write_atomic_file(settings_path, &serialized)?;

    info!(
        path = %settings_path.display(),
        prefers_audio_reply = settings.prefers_audio_reply,
        show_welcome = settings.show_welcome,
        "settings file written"
    );
    Ok(())
}

fn write_atomic_file(file_path: &Path, contents: &[u8]) -> Result<(), String> {
    let temp_path = sibling_path(file_path, "tmp");
    let mut temp_file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .map_err(|error| {
            format!(
                "Failed to create temp settings file `{}`: {error}",
                temp_path.display()
            )
        })?;

    if let Err(error) = temp_file.write_all(contents).and_then(|()| temp_file.sync_all()) {
        let _ = fs::remove_file(&temp_path);
        return Err(format!(
            "Failed to write temp settings file `{}`: {error}",
            temp_path.display()
        ));
    }

    drop(temp_file);

    fs::rename(&temp_path, file_path).map_err(|error| {
        let _ = fs::remove_file(&temp_path);
        format!(
            "Failed to finalize settings file `{}`: {error}",
            file_path.display()
        )
    })
}

fn backup_corrupt_settings_file(settings_path: &Path) -> Result<PathBuf, String> {
    let backup_path = sibling_path(settings_path, "bak");

    fs::rename(settings_path, &backup_path).map_err(|error| {
        format!(
            "Failed to backup malformed settings file `{}` to `{}`: {error}",
            settings_path.display(),
            backup_path.display()
        )
    })?;

    Ok(backup_path)
}

/// `.settings.json.<pid>.<nanos>.tmp` for temp files, `settings.json.corrupt-<pid>-<nanos>.bak`
/// for backups.
fn sibling_path(file_path: &Path, extension: &str) -> PathBuf {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let file_name = file_path
        .file_name()
        .and_then(|value| value.to_str())
        .unwrap_or(SETTINGS_FILE_NAME);
    let pid = std::process::id();

    if extension == "bak" {
        file_path.with_file_name(format!("{file_name}.corrupt-{pid}-{timestamp}.bak"))
    } else {
        file_path.with_file_name(format!(".{file_name}.{pid}.{timestamp}.{extension}"))
    }
}

fn normalize_backend_url(value: Option<String>) -> Result<Option<String>, String> {
    let Some(candidate) = value else {
        return Ok(None);
    };

    let trimmed = candidate.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        return Ok(None);
    }

    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(format!(
            "Unsupported backend url `{trimmed}`. Expected an http:// or https:// address"
        ));
    }

    Ok(Some(trimmed.to_string()))
}

fn lock_error() -> String {
    "Settings store lock was poisoned".to_string()
}

fn io_lock_error() -> String {
    "Settings store IO lock was poisoned".to_string()
}
