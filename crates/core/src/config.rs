//! Application configuration.
//!
//! Settings come from a TOML file (by default in the platform config directory)
//! and are then overridden by environment variables:
//!
//! - `CLINICAL_EXTRACT_DATA_DIR`: directory for persisted extractions and jobs
//! - `CLINICAL_EXTRACT_CACHE_PAGES`: page text cache capacity (default 50)
//! - `SUPABASE_URL`, `SUPABASE_ANON_KEY`, `SUPABASE_SCHEMA`: remote store

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use viewer_core::DEFAULT_TEXT_CACHE_PAGES;

pub const DATA_DIR_ENV: &str = "CLINICAL_EXTRACT_DATA_DIR";
pub const CACHE_PAGES_ENV: &str = "CLINICAL_EXTRACT_CACHE_PAGES";
pub const SUPABASE_URL_ENV: &str = "SUPABASE_URL";
pub const SUPABASE_ANON_KEY_ENV: &str = "SUPABASE_ANON_KEY";
pub const SUPABASE_SCHEMA_ENV: &str = "SUPABASE_SCHEMA";

const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for configuration key: {0}")]
    InvalidValue(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to write configuration: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Connection settings for the remote submission store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupabaseConfig {
    pub url: Option<String>,
    pub anon_key: Option<String>,
    pub schema: String,
}

impl Default for SupabaseConfig {
    fn default() -> Self {
        Self { url: None, anon_key: None, schema: "public".to_owned() }
    }
}

impl SupabaseConfig {
    /// Both the URL and the key are present and non-blank.
    pub fn is_configured(&self) -> bool {
        let present = |value: &Option<String>| value.as_deref().is_some_and(|v| !v.trim().is_empty());
        present(&self.url) && present(&self.anon_key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `None` means the platform data directory.
    pub data_dir: Option<PathBuf>,
    pub cache_pages: usize,
    pub supabase: SupabaseConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            cache_pages: DEFAULT_TEXT_CACHE_PAGES,
            supabase: SupabaseConfig::default(),
        }
    }
}

impl AppConfig {
    /// `<config dir>/config.toml`, if the platform has a config directory.
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("org", "ClinicalExtract", "clinical-extract")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Loads `path` (or the default path) if it exists, then applies env overrides.
    ///
    /// An explicitly given path must exist; a missing default file just means defaults.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::from_file(path)?,
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::from_file(&path)?,
                _ => Self::default(),
            },
        };

        config.with_env_overrides()
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path.as_ref())?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(contents)?;
        if config.cache_pages == 0 {
            return Err(ConfigError::InvalidValue("cache_pages".to_owned()));
        }
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path.as_ref(), self.to_toml()?)?;
        Ok(())
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(val) = std::env::var(DATA_DIR_ENV) {
            self.data_dir = Some(PathBuf::from(val));
        }

        if let Ok(val) = std::env::var(CACHE_PAGES_ENV) {
            self.cache_pages = val
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|pages| *pages > 0)
                .ok_or_else(|| ConfigError::InvalidValue(CACHE_PAGES_ENV.to_owned()))?;
        }

        if let Ok(val) = std::env::var(SUPABASE_URL_ENV) {
            self.supabase.url = Some(val);
        }
        if let Ok(val) = std::env::var(SUPABASE_ANON_KEY_ENV) {
            self.supabase.anon_key = Some(val);
        }
        if let Ok(val) = std::env::var(SUPABASE_SCHEMA_ENV) {
            if val.trim().is_empty() {
                return Err(ConfigError::InvalidValue(SUPABASE_SCHEMA_ENV.to_owned()));
            }
            self.supabase.schema = val;
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    const ALL_VARS: [&str; 5] =
        [DATA_DIR_ENV, CACHE_PAGES_ENV, SUPABASE_URL_ENV, SUPABASE_ANON_KEY_ENV, SUPABASE_SCHEMA_ENV];

    // Restores the listed variables on drop.
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(var_names: &[&str]) -> Self {
            let vars = var_names
                .iter()
                .map(|name| (name.to_string(), env::var(name).ok()))
                .collect();
            for name in var_names {
                env::remove_var(name);
            }
            Self { vars }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (name, value) in &self.vars {
                match value {
                    Some(v) => env::set_var(name, v),
                    None => env::remove_var(name),
                }
            }
        }
    }

    #[test]
    fn defaults() {
        let config = AppConfig::default();

        assert_eq!(config.cache_pages, 50);
        assert_eq!(config.data_dir, None);
        assert_eq!(config.supabase.schema, "public");
        assert!(!config.supabase.is_configured());
    }

    #[test]
    fn parses_partial_toml() {
        let config = AppConfig::from_toml(
            "cache_pages = 10\n\n[supabase]\nurl = \"https://db.example.org\"\n",
        )
        .unwrap();

        assert_eq!(config.cache_pages, 10);
        assert_eq!(config.supabase.url.as_deref(), Some("https://db.example.org"));
        assert_eq!(config.supabase.schema, "public");
        assert!(!config.supabase.is_configured());
    }

    #[test]
    fn zero_cache_pages_is_invalid() {
        let err = AppConfig::from_toml("cache_pages = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(key) if key == "cache_pages"));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        assert!(matches!(AppConfig::from_toml("cache_pages = ["), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = AppConfig {
            data_dir: Some(PathBuf::from("/tmp/extractions")),
            cache_pages: 12,
            supabase: SupabaseConfig {
                url: Some("https://db.example.org".to_owned()),
                anon_key: Some("anon".to_owned()),
                schema: "clinical".to_owned(),
            },
        };

        config.save_to_file(&path).unwrap();

        assert_eq!(AppConfig::from_file(&path).unwrap(), config);
    }

    #[test]
    #[serial]
    fn env_overrides_file_values() {
        let _guard = EnvGuard::new(&ALL_VARS);
        env::set_var(DATA_DIR_ENV, "/tmp/override");
        env::set_var(CACHE_PAGES_ENV, "7");
        env::set_var(SUPABASE_URL_ENV, "https://db.example.org");
        env::set_var(SUPABASE_ANON_KEY_ENV, "anon");
        env::set_var(SUPABASE_SCHEMA_ENV, "audit");

        let config = AppConfig::from_toml("cache_pages = 20").unwrap().with_env_overrides().unwrap();

        assert_eq!(config.data_dir, Some(PathBuf::from("/tmp/override")));
        assert_eq!(config.cache_pages, 7);
        assert_eq!(config.supabase.schema, "audit");
        assert!(config.supabase.is_configured());
    }

    #[test]
    #[serial]
    fn invalid_cache_pages_env_is_rejected() {
        let _guard = EnvGuard::new(&ALL_VARS);
        env::set_var(CACHE_PAGES_ENV, "lots");

        let err = AppConfig::default().with_env_overrides().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(key) if key == CACHE_PAGES_ENV));
    }

    #[test]
    #[serial]
    fn explicit_missing_file_is_an_error() {
        let _guard = EnvGuard::new(&ALL_VARS);
        let dir = tempfile::tempdir().unwrap();

        let result = AppConfig::load(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }

    #[test]
    fn blank_credentials_are_not_configured() {
        let supabase = SupabaseConfig {
            url: Some("https://db.example.org".to_owned()),
            anon_key: Some("  ".to_owned()),
            ..SupabaseConfig::default()
        };
        assert!(!supabase.is_configured());
    }
}
