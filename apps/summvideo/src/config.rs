use std::{fs, path::Path, time::Duration};

use serde::Deserialize;

pub const CONFIG_FILE: &str = "summvideo.toml";

/// Mirrors the backend's upload limit.
pub const DEFAULT_MAX_UPLOAD_BYTES: u64 = 500 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub api_url: String,
    pub storage_url: String,
    pub request_timeout_secs: u64,
    pub max_upload_bytes: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:8000".into(),
            storage_url: "sqlite://./data/summvideo.db".into(),
            request_timeout_secs: 600,
            max_upload_bytes: DEFAULT_MAX_UPLOAD_BYTES,
        }
    }
}

impl Settings {
    /// `None` disables the client-side timeout.
    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_secs > 0).then(|| Duration::from_secs(self.request_timeout_secs))
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    api_url: Option<String>,
    storage_url: Option<String>,
    request_timeout_secs: Option<u64>,
    max_upload_bytes: Option<u64>,
}

pub fn load_settings() -> Settings {
    load_settings_from(Path::new(CONFIG_FILE), |key| std::env::var(key).ok())
}

/// Defaults, then the TOML file at `path` if it parses, then the environment.
pub fn load_settings_from(path: &Path, env: impl Fn(&str) -> Option<String>) -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string(path) {
        match toml::from_str::<FileSettings>(&raw) {
            Ok(file_cfg) => {
                if let Some(v) = file_cfg.api_url {
                    settings.api_url = v;
                }
                if let Some(v) = file_cfg.storage_url {
                    settings.storage_url = v;
                }
                if let Some(v) = file_cfg.request_timeout_secs {
                    settings.request_timeout_secs = v;
                }
                if let Some(v) = file_cfg.max_upload_bytes {
                    settings.max_upload_bytes = v;
                }
            }
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    "config: ignoring unreadable settings file: {err}"
                );
            }
        }
    }

    if let Some(v) = env("SUMMVIDEO_API_URL") {
        settings.api_url = v;
    }
    if let Some(v) = env("APP__API_URL") {
        settings.api_url = v;
    }

    if let Some(v) = env("APP__STORAGE_URL") {
        settings.storage_url = v;
    }

    if let Some(v) = env("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    if let Some(v) = env("APP__MAX_UPLOAD_BYTES") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.max_upload_bytes = parsed;
        }
    }

    settings
}

/// Turns a bare path into a `sqlite://` url; `Storage::new` creates its directory.
pub fn normalize_storage_url(raw_storage_url: &str) -> String {
    let raw_storage_url = raw_storage_url.trim();

    if raw_storage_url.is_empty() {
        return Settings::default().storage_url;
    }

    if raw_storage_url.starts_with("sqlite::memory:")
        || raw_storage_url.starts_with("sqlite://")
        || raw_storage_url.contains("://")
    {
        return raw_storage_url.to_string();
    }

    if let Some(path) = raw_storage_url.strip_prefix("sqlite:") {
        return format!("sqlite://{}", path.replace('\\', "/"));
    }

    format!("sqlite://{}", raw_storage_url.replace('\\', "/"))
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
