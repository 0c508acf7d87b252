use facematch_core::{Metric, MatcherConfig, ModelInfo};
use facematch_gallery::store::DEFAULT_GALLERY_FILE;
use facematch_gallery::PersistPolicy;
use serde::Deserialize;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Matcher(#[from] facematch_core::ConfigError),
    #[error("failed to read config file {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config file: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid value for {key}: {value:?}")]
    InvalidEnv { key: &'static str, value: String },
    #[error("invalid value for {key} in config file: {value:?}")]
    InvalidFile { key: &'static str, value: String },
}

/// Daemon configuration: optional TOML file, then `FACEMATCH_*` overrides.
#[derive(Debug, Clone)]
pub struct Config {
    /// User-writable gallery file.
    pub gallery_path: PathBuf,
    /// Read-only gallery shipped with the application, used to seed a fresh install.
    pub bundled_gallery: Option<PathBuf>,
    pub matcher: MatcherConfig,
    pub persist_policy: PersistPolicy,
    /// Write `<gallery>.txt` after every save.
    pub text_dump: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    matcher: MatcherSection,
    gallery: GallerySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct MatcherSection {
    model: Option<String>,
    metric: Option<String>,
    cosine_threshold: Option<f32>,
    l2_threshold: Option<f32>,
    embedding_dim: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct GallerySection {
    path: Option<PathBuf>,
    bundled: Option<PathBuf>,
    persist: Option<String>,
    text_dump: Option<bool>,
}

impl Config {
    /// Load from `FACEMATCH_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let file = match std::env::var("FACEMATCH_CONFIG") {
            Ok(path) => Some(std::fs::read_to_string(&path).map_err(|source| {
                ConfigError::Read {
                    path: PathBuf::from(&path),
                    source,
                }
            })?),
            Err(_) => None,
        };
        Self::from_sources(file.as_deref(), |key| std::env::var(key).ok())
    }

    /// Build from TOML text and an environment lookup. Environment wins.
    pub fn from_sources(
        toml_text: Option<&str>,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let file: FileConfig = match toml_text {
            Some(text) => toml::from_str(text)?,
            None => FileConfig::default(),
        };

        let model_key = env("FACEMATCH_MODEL").or(file.matcher.model);
        let model = match model_key.as_deref() {
            Some(key) => ModelInfo::by_key(key)?,
            None => &facematch_core::FACENET,
        };

        let metric = match env("FACEMATCH_METRIC").or(file.matcher.metric) {
            Some(name) => Metric::from_str(&name)?,
            None => Metric::default(),
        };

        let mut matcher = MatcherConfig::for_model(model, metric);
        if let Some(v) = env_parse(&env, "FACEMATCH_COSINE_THRESHOLD")?.or(file.matcher.cosine_threshold) {
            matcher.cosine_threshold = v;
        }
        if let Some(v) = env_parse(&env, "FACEMATCH_L2_THRESHOLD")?.or(file.matcher.l2_threshold) {
            matcher.l2_threshold = v;
        }
        if let Some(v) = env_parse(&env, "FACEMATCH_EMBEDDING_DIM")?.or(file.matcher.embedding_dim) {
            matcher.embedding_dim = v;
        }
        matcher.validate()?;

        let gallery_path = env("FACEMATCH_GALLERY_PATH")
            .map(PathBuf::from)
            .or(file.gallery.path)
            .unwrap_or_else(|| default_data_dir(&env).join(DEFAULT_GALLERY_FILE));

        let bundled_gallery = env("FACEMATCH_BUNDLED_GALLERY")
            .map(PathBuf::from)
            .or(file.gallery.bundled);

        let persist_policy = match (env("FACEMATCH_PERSIST"), file.gallery.persist) {
            (Some(v), _) => PersistPolicy::from_str(&v).map_err(|_| ConfigError::InvalidEnv {
                key: "FACEMATCH_PERSIST",
                value: v,
            })?,
            (None, Some(v)) => PersistPolicy::from_str(&v).map_err(|_| ConfigError::InvalidFile {
                key: "gallery.persist",
                value: v,
            })?,
            (None, None) => PersistPolicy::default(),
        };

        let text_dump = match env("FACEMATCH_TEXT_DUMP") {
            Some(v) => parse_flag(&v).ok_or(ConfigError::InvalidEnv {
                key: "FACEMATCH_TEXT_DUMP",
                value: v,
            })?,
            None => file.gallery.text_dump.unwrap_or(false),
        };

        Ok(Self {
            gallery_path,
            bundled_gallery,
            matcher,
            persist_policy,
            text_dump,
        })
    }
}

/// `$XDG_DATA_HOME/facematch`, falling back to `$HOME/.local/share/facematch`.
pub fn default_data_dir(env: &impl Fn(&str) -> Option<String>) -> PathBuf {
    env("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            let home = env("HOME").unwrap_or_else(|| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("facematch")
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

fn env_parse<T: FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match env(key) {
        Some(v) => v
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key, value: v }),
        None => Ok(None),
    }
}
