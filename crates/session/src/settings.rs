use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use dialog_core::types::{CLIENT_APPROVAL_TYPE, DEFAULT_ASSISTANT_NAME, DEFAULT_ASSISTANT_TYPE};
use dialog_core::{ApprovalHandlers, ChatType, ProcessorOptions, ReconcileOptions, Topic};
use dialog_transport::{ClientOptions, TransportResult, build_ws_url};
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "dialog";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "DIALOG_";
pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub api_base_url: String,
    pub assistant_name: String,
    pub assistant_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assistant_avatar: Option<String>,
    /// Approval types rendered inline in the chat; the rest are escalated.
    pub display_approval_types: Vec<String>,
    pub chat_types: Vec<ChatType>,
    pub client: ClientOptions,
    pub shared_close_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            assistant_name: DEFAULT_ASSISTANT_NAME.to_string(),
            assistant_type: DEFAULT_ASSISTANT_TYPE.to_string(),
            assistant_avatar: None,
            display_approval_types: vec![CLIENT_APPROVAL_TYPE.to_string()],
            chat_types: vec![ChatType::Client],
            client: ClientOptions::default(),
            shared_close_delay_ms: 3_000,
        }
    }
}

impl Settings {
    fn normalized(mut self) -> Self {
        let defaults = Self::default();

        self.api_base_url = self.api_base_url.trim().to_string();
        if self.api_base_url.is_empty() {
            self.api_base_url = defaults.api_base_url;
        }
        self.assistant_name = self.assistant_name.trim().to_string();
        if self.assistant_name.is_empty() {
            self.assistant_name = defaults.assistant_name;
        }
        self.assistant_type = self.assistant_type.trim().to_string();
        if self.assistant_type.is_empty() {
            self.assistant_type = defaults.assistant_type;
        }
        self.assistant_avatar = self
            .assistant_avatar
            .map(|avatar| avatar.trim().to_string())
            .filter(|avatar| !avatar.is_empty());

        let mut display_types: Vec<String> = Vec::new();
        for approval_type in self.display_approval_types {
            let approval_type = approval_type.trim().to_string();
            if !approval_type.is_empty() && !display_types.contains(&approval_type) {
                display_types.push(approval_type);
            }
        }
        self.display_approval_types = if display_types.is_empty() {
            defaults.display_approval_types
        } else {
            display_types
        };

        let mut chat_types: Vec<ChatType> = Vec::new();
        for chat_type in self.chat_types {
            if !chat_types.contains(&chat_type) {
                chat_types.push(chat_type);
            }
        }
        self.chat_types = if chat_types.is_empty() {
            defaults.chat_types
        } else {
            chat_types
        };
        self
    }

    /// Subject topics to subscribe to, one per configured chat type.
    pub fn topics(&self) -> Vec<Topic> {
        self.chat_types.iter().map(|chat_type| chat_type.topic()).collect()
    }

    pub fn shared_close_delay(&self) -> Duration {
        Duration::from_millis(self.shared_close_delay_ms)
    }

    pub fn ws_url(&self, token: Option<&str>) -> TransportResult<String> {
        build_ws_url(&self.api_base_url, token)
    }

    pub fn processor_options(&self, handlers: ApprovalHandlers) -> ProcessorOptions {
        ProcessorOptions {
            display_approval_types: self.display_approval_types.clone(),
            handlers,
            ..ProcessorOptions::default()
        }
    }

    /// Reconcile options for the transcript of one chat type.
    pub fn reconcile_options(
        &self,
        chat_type: Option<ChatType>,
        handlers: ApprovalHandlers,
    ) -> ReconcileOptions {
        ReconcileOptions {
            assistant_name: self.assistant_name.clone(),
            assistant_type: self.assistant_type.clone(),
            assistant_avatar: self.assistant_avatar.clone(),
            handlers,
            chat_type_filter: chat_type.map(|chat_type| chat_type.as_str().to_string()),
            display_approval_types: Some(self.display_approval_types.clone()),
            ..ReconcileOptions::default()
        }
    }
}

/// Settings backed by a JSON file, overridable through `DIALOG_` environment variables.
///
/// Nested keys use a double underscore, e.g. `DIALOG_CLIENT__CONNECT_TIMEOUT_MS`.
pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".dialog"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized = settings.normalized();
        self.persist(&normalized)?;
        self.settings.store(Arc::new(normalized));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found, using defaults");
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(
                    path = ?path,
                    error = %error,
                    "failed to parse settings, using defaults"
                );
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}
