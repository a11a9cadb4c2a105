use std::{fs, io, path::Path};

use anyhow::Context;
use client_core::EngineSettings;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub database_url: String,
    pub store_url: Option<String>,
    pub access_token: Option<String>,
    pub log_filter: String,
    pub engine: EngineSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "sqlite://./data/chat.db".into(),
            store_url: None,
            access_token: None,
            log_filter: "info".into(),
            engine: EngineSettings::default(),
        }
    }
}

/// Shape of `chat.toml`. Every key is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FileSettings {
    database_url: Option<String>,
    store_url: Option<String>,
    access_token: Option<String>,
    log_filter: Option<String>,
    max_image_bytes: Option<usize>,
    image_bucket: Option<String>,
    fallback_display_name: Option<String>,
}

/// Defaults, then the config file if present, then the environment.
pub fn load_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();

    match fs::read_to_string(path) {
        Ok(raw) => {
            let file_cfg = toml::from_str::<FileSettings>(&raw)
                .with_context(|| format!("invalid config file '{}'", path.display()))?;
            apply_file(&mut settings, file_cfg);
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read '{}'", path.display()));
        }
    }

    apply_env(&mut settings, |key| std::env::var(key).ok());
    settings.database_url = normalize_database_url(&settings.database_url);
    Ok(settings)
}

fn apply_file(settings: &mut Settings, file_cfg: FileSettings) {
    if let Some(v) = file_cfg.database_url {
        settings.database_url = v;
    }
    if let Some(v) = file_cfg.store_url {
        settings.store_url = Some(v);
    }
    if let Some(v) = file_cfg.access_token {
        settings.access_token = Some(v);
    }
    if let Some(v) = file_cfg.log_filter {
        settings.log_filter = v;
    }
    if let Some(v) = file_cfg.max_image_bytes {
        settings.engine.max_image_bytes = v;
    }
    if let Some(v) = file_cfg.image_bucket {
        settings.engine.image_bucket = v;
    }
    if let Some(v) = file_cfg.fallback_display_name {
        settings.engine.fallback_display_name = v;
    }
}

fn apply_env(settings: &mut Settings, var: impl Fn(&str) -> Option<String>) {
    if let Some(v) = var("CHAT_DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = var("APP__DATABASE_URL") {
        settings.database_url = v;
    }

    if let Some(v) = var("CHAT_STORE_URL") {
        settings.store_url = Some(v);
    }
    if let Some(v) = var("APP__STORE_URL") {
        settings.store_url = Some(v);
    }

    if let Some(v) = var("APP__ACCESS_TOKEN") {
        settings.access_token = Some(v);
    }

    if let Some(v) = var("APP__MAX_IMAGE_BYTES") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.engine.max_image_bytes = parsed;
        }
    }
}

pub fn normalize_database_url(raw_database_url: &str) -> String {
    let raw_database_url = raw_database_url.trim();

    if raw_database_url.is_empty() {
        return Settings::default().database_url;
    }

    if raw_database_url.starts_with("sqlite::memory:") || raw_database_url.contains("://") {
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
    use std::collections::HashMap;

    use super::*;

    #[test]
    fn normalizes_plain_file_path_to_sqlite_url() {
        assert_eq!(
            normalize_database_url("./data/test.db"),
            "sqlite://./data/test.db"
        );
        assert_eq!(normalize_database_url("sqlite:chat.db"), "sqlite://chat.db");
        assert_eq!(normalize_database_url("sqlite::memory:"), "sqlite::memory:");
        assert_eq!(normalize_database_url("  "), Settings::default().database_url);
    }

    #[test]
    fn file_values_override_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chat.toml");
        fs::write(
            &path,
            "database_url = \"sqlite::memory:\"\nmax_image_bytes = 1024\nimage_bucket = \"pics\"\n",
        )
        .expect("write config");

        let mut settings = Settings::default();
        let raw = fs::read_to_string(&path).expect("read");
        apply_file(&mut settings, toml::from_str(&raw).expect("parse"));

        assert_eq!(settings.database_url, "sqlite::memory:");
        assert_eq!(settings.engine.max_image_bytes, 1024);
        assert_eq!(settings.engine.image_bucket, "pics");
        assert_eq!(settings.engine.fallback_display_name, "Member");
    }

    #[test]
    fn app_prefixed_env_wins_over_plain_env() {
        let env = HashMap::from([
            ("CHAT_DATABASE_URL", "sqlite://a.db"),
            ("APP__DATABASE_URL", "sqlite://b.db"),
            ("APP__MAX_IMAGE_BYTES", "not a number"),
        ]);
        let mut settings = Settings::default();

        apply_env(&mut settings, |key| env.get(key).map(|v| v.to_string()));

        assert_eq!(settings.database_url, "sqlite://b.db");
        assert_eq!(
            settings.engine.max_image_bytes,
            EngineSettings::default().max_image_bytes
        );
    }

    #[test]
    fn missing_config_file_is_not_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = load_settings(&dir.path().join("absent.toml")).expect("settings");
        assert!(settings.database_url.starts_with("sqlite:"));
    }

    #[test]
    fn malformed_config_file_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("chat.toml");
        fs::write(&path, "max_image_bytes = \"lots\"").expect("write config");

        assert!(load_settings(&path).is_err());
    }
}
