use std::{fs, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone)]
pub struct Settings {
    pub server_bind: String,
    pub database_url: String,
    /// Channel this deployment archives. Sync routes reject requests until
    /// it is configured.
    pub target_channel: Option<String>,
    pub source_url: String,
    pub blob_root: String,
    pub approved_media_kinds: Vec<String>,
    pub max_media_bytes: u64,
    pub download_timeout_seconds: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8090".into(),
            database_url: "sqlite://./data/archive.db".into(),
            target_channel: None,
            source_url: "http://127.0.0.1:8081".into(),
            blob_root: "./data/blobs".into(),
            approved_media_kinds: vec!["photo".into()],
            max_media_bytes: 10 * 1024 * 1024,
            download_timeout_seconds: 30,
        }
    }
}

impl Settings {
    pub fn download_timeout(&self) -> Duration {
        Duration::from_secs(self.download_timeout_seconds)
    }
}

/// Shape of `archive.toml`; every field optional so a partial file only
/// overrides what it names.
#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    bind_addr: Option<String>,
    database_url: Option<String>,
    target_channel: Option<String>,
    source_url: Option<String>,
    blob_root: Option<String>,
    approved_media_kinds: Option<Vec<String>>,
    max_media_bytes: Option<u64>,
    download_timeout_seconds: Option<u64>,
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("archive.toml") {
        if let Ok(file_cfg) = toml::from_str::<FileSettings>(&raw) {
            apply_file_settings(&mut settings, file_cfg);
        }
    }

    if let Ok(v) = std::env::var("SERVER_BIND") {
        settings.server_bind = v;
    }
    if let Ok(v) = std::env::var("DATABASE_URL") {
        settings.database_url = v;
    }
    if let Ok(v) = std::env::var("TARGET_CHANNEL") {
        settings.target_channel = Some(v);
    }
    if let Ok(v) = std::env::var("SOURCE_URL") {
        settings.source_url = v;
    }
    if let Ok(v) = std::env::var("BLOB_ROOT") {
        settings.blob_root = v;
    }
    if let Ok(v) = std::env::var("APPROVED_MEDIA_KINDS") {
        settings.approved_media_kinds = v
            .split(',')
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .map(str::to_string)
            .collect();
    }
    if let Ok(v) = std::env::var("MAX_MEDIA_BYTES") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.max_media_bytes = parsed;
        }
    }
    if let Ok(v) = std::env::var("MEDIA_DOWNLOAD_TIMEOUT_SECONDS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.download_timeout_seconds = parsed;
        }
    }

    settings
}

fn apply_file_settings(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.bind_addr {
        settings.server_bind = v;
    }
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.target_channel {
        settings.target_channel = Some(v);
    }
    if let Some(v) = file_cfg.source_url {
        settings.source_url = v;
    }
    if let Some(v) = file_cfg.blob_root {
        settings.blob_root = v;
    }
    if let Some(v) = file_cfg.approved_media_kinds {
        settings.approved_media_kinds = v;
    }
    if let Some(v) = file_cfg.max_media_bytes {
        settings.max_media_bytes = v;
    }
    if let Some(v) = file_cfg.download_timeout_seconds {
        settings.download_timeout_seconds = v;
    }
}

/// Accepts bare paths and `sqlite:`-prefixed forms; parent-directory
/// creation happens in the storage crate when the pool opens.
pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:")
        || raw_database_url.starts_with("sqlite://")
        || raw_database_url.contains("://")
    {
        return raw_database_url.to_string();
    }

    if let Some(path) = raw_database_url.strip_prefix("sqlite:") {
        let path = path.replace('\\', "/");
        return format!("sqlite://{path}");
    }

    format!("sqlite://{}", raw_database_url.replace('\\', "/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/archive.db"),
            "sqlite://./data/archive.db"
        );
    }

    #[test]
    fn keeps_memory_url_untouched() {
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
    }

    #[test]
    fn partial_file_settings_only_override_named_fields() {
        let mut settings = Settings::default();
        let file_cfg: FileSettings =
            toml::from_str("target_channel = \"1001234567890\"\nmax_media_bytes = 1024")
                .expect("toml");
        apply_file_settings(&mut settings, file_cfg);

        assert_eq!(settings.target_channel.as_deref(), Some("1001234567890"));
        assert_eq!(settings.max_media_bytes, 1024);
        assert_eq!(settings.server_bind, Settings::default().server_bind);
        assert_eq!(settings.approved_media_kinds, vec!["photo".to_string()]);
    }
}
