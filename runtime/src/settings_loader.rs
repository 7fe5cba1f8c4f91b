//! Loading settings, module mappings and URL patterns from `.properties`
//! files, and registering configuration files with the file monitor.
//!
//! Values may reference other keys as `${key}`; paths read through this
//! module are expanded before use, so
//! `sql.queries.driver = ${config.dir}/database/postgresql/postgresql.sql`
//! resolves against the configured `config.dir`.

use agora_core::jobs::{ChangeListener, FileMonitor};
use agora_core::settings::{ConfigError, Properties, PropertiesLoader, Settings, keys};
use std::collections::{BTreeMap, btree_map};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Main settings file, relative to the application path.
pub const SYSTEM_GLOBALS: &str = "config/SystemGlobals.properties";

/// Module mapping file, relative to the base config directory.
pub const MODULES_MAPPING: &str = "modulesMapping.properties";

/// URL pattern file, relative to `config.dir`.
pub const URL_PATTERNS: &str = "urlPattern.properties";

/// Prefix of environment variables that override settings, e.g.
/// `AGORA_DAO_DRIVER` for `dao.driver`.
pub const ENV_PREFIX: &str = "AGORA_";

/// Errors that can occur while loading configuration files.
#[derive(Error, Debug)]
pub enum LoaderError {
    /// A settings file or value could not be used.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The module mapping file could not be loaded.
    #[error("Error while loading modules mapping from {path}")]
    ModulesMapping {
        /// Path that was read
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: ConfigError,
    },

    /// The URL pattern file could not be loaded.
    #[error("Error while loading url patterns from {path}")]
    UrlPatterns {
        /// Path that was read
        path: PathBuf,
        /// Underlying failure
        #[source]
        source: ConfigError,
    },
}

/// Load system settings for the application rooted at `app_path`.
///
/// Reads `<app_path>/config/SystemGlobals.properties`, records
/// `application.path`, defaults `config.dir` to `<app_path>/config`, then
/// merges the database driver config named by `database.driver.config` (if
/// set) and the installation config named by `installation.config` (if that
/// file exists). Later files override earlier ones.
///
/// # Errors
///
/// Returns [`LoaderError::Config`] if the main file or the driver config
/// cannot be read.
pub fn start_settings(app_path: &Path, loader: &dyn PropertiesLoader) -> Result<Settings, LoaderError> {
    let settings = Settings::new();
    settings.set(keys::APPLICATION_PATH, app_path.to_string_lossy());
    settings.set(keys::CONFIG_DIR, app_path.join("config").to_string_lossy());

    let main = app_path.join(SYSTEM_GLOBALS);
    settings.merge(loader.load(&main)?);
    tracing::info!(path = %main.display(), "Loaded system settings");

    if let Some(driver_config) = expanded_path(&settings, keys::DATABASE_DRIVER_CONFIG) {
        settings.merge(loader.load(&driver_config)?);
        tracing::info!(path = %driver_config.display(), "Loaded database driver settings");
    }

    if let Some(installation) = expanded_path(&settings, keys::INSTALLATION_CONFIG) {
        if loader.exists(&installation) {
            settings.merge(loader.load(&installation)?);
            tracing::info!(path = %installation.display(), "Loaded installation settings");
        } else {
            tracing::debug!(path = %installation.display(), "No installation settings yet");
        }
    }

    Ok(settings)
}

/// [`start_settings`], then overlay `AGORA_*` environment variables.
///
/// # Errors
///
/// As [`start_settings`].
pub fn start_settings_with_env(
    app_path: &Path,
    loader: &dyn PropertiesLoader,
) -> Result<Settings, LoaderError> {
    Ok(start_settings(app_path, loader)?.with_env_overrides(ENV_PREFIX))
}

/// Load `<base_dir>/modulesMapping.properties`.
///
/// # Errors
///
/// Returns [`LoaderError::ModulesMapping`] if the file cannot be read.
pub fn load_modules_mapping(
    base_dir: &Path,
    loader: &dyn PropertiesLoader,
) -> Result<Properties, LoaderError> {
    let path = base_dir.join(MODULES_MAPPING);
    loader
        .load(&path)
        .map_err(|source| LoaderError::ModulesMapping { path, source })
}

/// A named URL pattern and the parameters it carries, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UrlPattern {
    /// Pattern name, e.g. `posts.list.2`
    pub name: String,
    /// Parameter names, e.g. `["topic_id", "start"]`
    pub params: Vec<String>,
}

impl UrlPattern {
    /// Parse a comma-separated parameter list.
    #[must_use]
    pub fn parse(name: &str, value: &str) -> Self {
        Self {
            name: name.to_string(),
            params: value
                .split(',')
                .map(str::trim)
                .filter(|param| !param.is_empty())
                .map(str::to_string)
                .collect(),
        }
    }
}

/// URL patterns keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UrlPatterns {
    patterns: BTreeMap<String, UrlPattern>,
}

impl UrlPatterns {
    /// Pattern called `name`
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&UrlPattern> {
        self.patterns.get(name)
    }

    /// Number of patterns
    #[must_use]
    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    /// Whether there are no patterns
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// All patterns, sorted by name
    pub fn iter(&self) -> btree_map::Values<'_, String, UrlPattern> {
        self.patterns.values()
    }
}

impl<'a> IntoIterator for &'a UrlPatterns {
    type Item = &'a UrlPattern;
    type IntoIter = btree_map::Values<'a, String, UrlPattern>;

    fn into_iter(self) -> Self::IntoIter {
        self.patterns.values()
    }
}

impl FromIterator<(String, String)> for UrlPatterns {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        let patterns = iter
            .into_iter()
            .map(|(name, value)| {
                let pattern = UrlPattern::parse(&name, &value);
                (name, pattern)
            })
            .collect();
        Self { patterns }
    }
}

/// Load `<config.dir>/urlPattern.properties`.
///
/// # Errors
///
/// - [`LoaderError::Config`]: `config.dir` is not set
/// - [`LoaderError::UrlPatterns`]: the file cannot be read
pub fn load_url_patterns(
    settings: &Settings,
    loader: &dyn PropertiesLoader,
) -> Result<UrlPatterns, LoaderError> {
    let config_dir = expanded_path(settings, keys::CONFIG_DIR).ok_or_else(|| ConfigError::Missing {
        key: keys::CONFIG_DIR.to_string(),
    })?;
    let path = config_dir.join(URL_PATTERNS);

    let properties = loader
        .load(&path)
        .map_err(|source| LoaderError::UrlPatterns { path, source })?;

    let patterns: UrlPatterns = properties.into_iter().collect();
    tracing::debug!(count = patterns.len(), "Loaded url patterns");
    Ok(patterns)
}

/// Register the query files and settings files with `monitor`.
///
/// Does nothing when `file.changes.delay` (milliseconds) is unset, blank,
/// zero or negative. Otherwise watches the generic and driver SQL query files, the
/// default settings file and, through [`listen_installation_config`], the
/// installation settings file. Keys that are unset are skipped. Returns how
/// many files are now watched.
///
/// # Errors
///
/// Returns [`LoaderError::Config`] if `file.changes.delay` is not an integer.
pub fn listen_for_changes(
    settings: &Settings,
    monitor: &dyn FileMonitor,
    loader: &dyn PropertiesLoader,
) -> Result<usize, LoaderError> {
    let Some(delay) = change_delay(settings)? else {
        tracing::debug!("File change monitoring disabled");
        return Ok(0);
    };

    let mut watched = 0;
    for (key, listener) in [
        (keys::SQL_QUERIES_GENERIC, ChangeListener::Queries),
        (keys::SQL_QUERIES_DRIVER, ChangeListener::Queries),
        (keys::DEFAULT_CONFIG, ChangeListener::Settings),
    ] {
        match expanded_path(settings, key) {
            Some(path) => {
                tracing::debug!(path = %path.display(), ?listener, "Watching for changes");
                monitor.watch(path, listener, delay);
                watched += 1;
            }
            None => tracing::warn!(key, "Not watching unset file"),
        }
    }

    if listen_installation_config(settings, monitor, loader)? {
        watched += 1;
    }

    Ok(watched)
}

/// Register the installation settings file with `monitor` if it exists.
///
/// Returns whether a watch was registered.
///
/// # Errors
///
/// Returns [`LoaderError::Config`] if `file.changes.delay` is not an integer.
pub fn listen_installation_config(
    settings: &Settings,
    monitor: &dyn FileMonitor,
    loader: &dyn PropertiesLoader,
) -> Result<bool, LoaderError> {
    let Some(delay) = change_delay(settings)? else {
        return Ok(false);
    };

    match expanded_path(settings, keys::INSTALLATION_CONFIG) {
        Some(path) if loader.exists(&path) => {
            monitor.watch(path, ChangeListener::Settings, delay);
            Ok(true)
        }
        _ => Ok(false),
    }
}

fn change_delay(settings: &Settings) -> Result<Option<Duration>, ConfigError> {
    if settings.require(keys::FILECHANGES_DELAY).is_err() {
        return Ok(None);
    }

    let millis = settings.get_int(keys::FILECHANGES_DELAY)?;
    Ok(u64::try_from(millis)
        .ok()
        .filter(|&millis| millis > 0)
        .map(Duration::from_millis))
}

/// Value of `key` as a path, with `${other.key}` references expanded.
///
/// Returns `None` when the key is unset or blank.
#[must_use]
pub fn expanded_path(settings: &Settings, key: &str) -> Option<PathBuf> {
    settings
        .get(key)
        .map(|value| expand(settings, value.trim()))
        .filter(|value| !value.is_empty())
        .map(PathBuf::from)
}

/// Replace every `${key}` in `value` with the setting it names.
///
/// Unknown keys expand to nothing. Expansion is not recursive.
#[must_use]
pub fn expand(settings: &Settings, value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        out.push_str(&rest[..start]);
        let key = &rest[start + 2..start + 2 + len];
        out.push_str(&settings.get(key).unwrap_or_default());
        rest = &rest[start + 3 + len..];
    }

    out.push_str(rest);
    out
}
