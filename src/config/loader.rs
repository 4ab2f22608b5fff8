use crate::config::schema::{FixerConfig, ValidationError};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Environment variable naming a config file.
pub const CONFIG_ENV: &str = "PHP_PATCHER_CONFIG";
/// Config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "php-patcher.toml";
/// Directory of rule files looked up in the working directory.
pub const DEFAULT_RULES_DIR: &str = "rules";

#[derive(Debug)]
pub enum ConfigError {
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    Toml {
        path: Option<PathBuf>,
        source: toml_edit::de::Error,
    },
    Validation {
        path: Option<PathBuf>,
        source: ValidationError,
    },
}

impl ConfigError {
    fn with_path(self, path: &Path) -> Self {
        let path = path.to_path_buf();
        match self {
            ConfigError::Io { .. } => self,
            ConfigError::Toml { path: None, source } => ConfigError::Toml {
                path: Some(path),
                source,
            },
            ConfigError::Validation { path: None, source } => ConfigError::Validation {
                path: Some(path),
                source,
            },
            other => other,
        }
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io { path, source } => {
                write!(f, "failed to read fixer config from {}: {}", path.display(), source)
            }
            ConfigError::Toml { path, source } => match path {
                Some(path) => write!(
                    f,
                    "failed to parse fixer config TOML ({}): {}",
                    path.display(),
                    source
                ),
                None => write!(f, "failed to parse fixer config TOML: {}", source),
            },
            ConfigError::Validation { path, source } => match path {
                Some(path) => write!(f, "invalid fixer config ({}): {}", path.display(), source),
                None => write!(f, "invalid fixer config: {}", source),
            },
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io { source, .. } => Some(source),
            ConfigError::Toml { source, .. } => Some(source),
            ConfigError::Validation { source, .. } => Some(source),
        }
    }
}

pub fn load_from_str(input: &str) -> Result<FixerConfig, ConfigError> {
    let config = parse(input)?;
    config
        .validate()
        .map_err(|source| ConfigError::Validation { path: None, source })?;
    Ok(config)
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<FixerConfig, ConfigError> {
    let path = path.as_ref();
    let contents = read(path)?;
    load_from_str(&contents).map_err(|error| error.with_path(path))
}

/// Merge every `*.toml` directly inside `dir`, in file-name order, and
/// validate the result as a whole (ids must be unique across files).
pub fn load_dir(dir: impl AsRef<Path>) -> Result<(FixerConfig, Vec<PathBuf>), ConfigError> {
    let dir = dir.as_ref();
    let mut files: Vec<PathBuf> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "toml"))
        .collect();
    files.sort();

    let mut merged = FixerConfig::default();
    for file in &files {
        let contents = read(file)?;
        let config = parse(&contents).map_err(|error| error.with_path(file))?;
        merged.merge(config);
    }
    merged.validate().map_err(|source| ConfigError::Validation {
        path: Some(dir.to_path_buf()),
        source,
    })?;
    Ok((merged, files))
}

/// A config together with the files it came from.
#[derive(Debug, Clone, Default)]
pub struct LoadedConfig {
    pub config: FixerConfig,
    /// Empty when no config was found
    pub sources: Vec<PathBuf>,
}

/// Find the config for a run started in `base`: `explicit`, then
/// [`CONFIG_ENV`], then `base/php-patcher.toml`, then `base/rules/*.toml`.
/// Nothing found is an empty config.
pub fn discover(explicit: Option<&Path>, base: &Path) -> Result<LoadedConfig, ConfigError> {
    let from_env = env::var_os(CONFIG_ENV)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from);
    discover_with(explicit, from_env.as_deref(), base)
}

/// [`discover`] with the environment value passed in.
pub fn discover_with(
    explicit: Option<&Path>,
    from_env: Option<&Path>,
    base: &Path,
) -> Result<LoadedConfig, ConfigError> {
    if let Some(path) = explicit.or(from_env) {
        return single(path);
    }

    let default_file = base.join(DEFAULT_CONFIG_FILE);
    if default_file.is_file() {
        return single(&default_file);
    }

    let rules_dir = base.join(DEFAULT_RULES_DIR);
    if rules_dir.is_dir() {
        let (config, sources) = load_dir(&rules_dir)?;
        tracing::debug!(files = sources.len(), "loaded rule directory {}", rules_dir.display());
        return Ok(LoadedConfig { config, sources });
    }

    tracing::debug!("no fixer config found; using empty rule set");
    Ok(LoadedConfig::default())
}

fn single(path: &Path) -> Result<LoadedConfig, ConfigError> {
    let config = load_from_path(path)?;
    tracing::debug!(rules = config.rules.len(), "loaded config {}", path.display());
    Ok(LoadedConfig {
        config,
        sources: vec![path.to_path_buf()],
    })
}

fn parse(input: &str) -> Result<FixerConfig, ConfigError> {
    toml_edit::de::from_str(input).map_err(|source| ConfigError::Toml { path: None, source })
}

fn read(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}
