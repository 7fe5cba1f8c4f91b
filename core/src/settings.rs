//! Settings store and `.properties` loading.
//!
//! [`Settings`] is the string-keyed configuration every subsystem reads at
//! start-up: which plugin implements which capability, whether transactions
//! are enabled, how often configuration files are polled for changes.
//!
//! Values come from `.properties` files read through a
//! [`PropertiesLoader`], and may be overridden from the process environment
//! with [`Settings::with_env_overrides`].
//!
//! # Example
//!
//! ```
//! use agora_core::settings::{keys, parse_properties, Settings};
//!
//! let settings = Settings::new();
//! settings.merge(parse_properties("database.use.transactions = true\nfile.changes.delay: 2000"));
//!
//! assert!(settings.get_bool(keys::DATABASE_USE_TRANSACTIONS).unwrap());
//! assert_eq!(settings.get_int(keys::FILECHANGES_DELAY).unwrap(), 2000);
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

/// Parsed `.properties` content, ordered by key.
pub type Properties = BTreeMap<String, String>;

/// Configuration keys read by the bootstrap layer.
pub mod keys {
    /// Class name of the persistence driver plugin
    pub const DAO_DRIVER: &str = "dao.driver";
    /// Class name of the cache engine plugin
    pub const CACHE_IMPLEMENTATION: &str = "cache.engine.implementation";
    /// Comma-separated class names of cacheable plugins
    pub const CACHEABLE_OBJECTS: &str = "cacheable.objects";
    /// Class name of the login authenticator plugin
    pub const LOGIN_AUTHENTICATOR: &str = "login.authenticator";
    /// Whether units of work commit/roll back their connection
    pub const DATABASE_USE_TRANSACTIONS: &str = "database.use.transactions";
    /// Polling delay, in milliseconds, for configuration file changes
    pub const FILECHANGES_DELAY: &str = "file.changes.delay";
    /// Directory holding auxiliary configuration files
    pub const CONFIG_DIR: &str = "config.dir";
    /// Root directory of the installed application
    pub const APPLICATION_PATH: &str = "application.path";
    /// Driver-specific defaults file
    pub const DATABASE_DRIVER_CONFIG: &str = "database.driver.config";
    /// Installation overrides file, written by the installer
    pub const INSTALLATION_CONFIG: &str = "installation.config";
    /// Main settings file
    pub const DEFAULT_CONFIG: &str = "default.config";
    /// Generic SQL queries file
    pub const SQL_QUERIES_GENERIC: &str = "sql.queries.generic";
    /// Driver-specific SQL queries file
    pub const SQL_QUERIES_DRIVER: &str = "sql.queries.driver";
    /// Database connection URL
    pub const DATABASE_CONNECTION_URL: &str = "database.connection.url";
    /// Maximum number of pooled connections
    pub const DATABASE_POOL_MAX: &str = "database.connection.pool.max";
    /// Seconds to wait for a free pooled connection
    pub const DATABASE_ACQUIRE_TIMEOUT: &str = "database.connection.acquire.timeout";
}

/// Errors that can occur while reading configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// A configuration file could not be read.
    #[error("Could not read {path}: {source}")]
    Io {
        /// The file that failed to load
        path: PathBuf,
        /// Underlying I/O error
        #[source]
        source: std::io::Error,
    },

    /// A required key is not set.
    #[error("Configuration key {key} is not set")]
    Missing {
        /// The missing key
        key: String,
    },

    /// A key holds a value of the wrong shape.
    #[error("Configuration key {key} has invalid value {value:?}, expected {expected}")]
    Invalid {
        /// The offending key
        key: String,
        /// The raw value
        value: String,
        /// What the value should look like
        expected: &'static str,
    },
}

/// Thread-safe string-keyed configuration store.
///
/// Written during start-up and by file-change listeners, read everywhere else.
#[derive(Debug, Default)]
pub struct Settings {
    values: RwLock<HashMap<String, String>>,
}

impl Settings {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store from key/value pairs.
    #[must_use]
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let values = pairs
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            values: RwLock::new(values),
        }
    }

    /// Raw value of `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<String> {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .cloned()
    }

    /// Value of `key`, or `default` when unset.
    #[must_use]
    pub fn get_or(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Value of `key`, failing when unset or blank.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Missing`] if the key is unset or only whitespace.
    pub fn require(&self, key: &str) -> Result<String, ConfigError> {
        self.get(key)
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| ConfigError::Missing {
                key: key.to_string(),
            })
    }

    /// Integer value of `key`.
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`]: the key is unset
    /// - [`ConfigError::Invalid`]: the value is not an integer
    pub fn get_int(&self, key: &str) -> Result<i64, ConfigError> {
        let value = self.require(key)?;
        value.trim().parse().map_err(|_| ConfigError::Invalid {
            key: key.to_string(),
            value,
            expected: "an integer",
        })
    }

    /// Boolean value of `key` (`true`/`false`, case-insensitive).
    ///
    /// # Errors
    ///
    /// - [`ConfigError::Missing`]: the key is unset
    /// - [`ConfigError::Invalid`]: the value is neither `true` nor `false`
    pub fn get_bool(&self, key: &str) -> Result<bool, ConfigError> {
        let value = self.require(key)?;
        match value.trim().to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ConfigError::Invalid {
                key: key.to_string(),
                value,
                expected: "true or false",
            }),
        }
    }

    /// Set `key` to `value`, replacing any earlier value.
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.into(), value.into());
    }

    /// Remove `key`.
    pub fn remove(&self, key: &str) -> Option<String> {
        self.values
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
    }

    /// Copy every entry of `properties` into the store.
    ///
    /// Later merges win, so defaults are merged first and overrides last.
    pub fn merge(&self, properties: Properties) {
        let mut values = self.values.write().unwrap_or_else(PoisonError::into_inner);
        values.extend(properties);
    }

    /// Overlay values from environment variables.
    ///
    /// A `.env` file in the working directory is loaded first if present.
    /// `<PREFIX>DAO_DRIVER` overrides `dao.driver`, `<PREFIX>CACHEABLE_OBJECTS`
    /// overrides `cacheable.objects`, and so on: the prefix is stripped, the rest
    /// is lower-cased and `_` becomes `.`.
    #[must_use]
    pub fn with_env_overrides(self, prefix: &str) -> Self {
        dotenvy::dotenv().ok();

        let overrides: Properties = std::env::vars()
            .filter_map(|(name, value)| {
                name.strip_prefix(prefix)
                    .filter(|rest| !rest.is_empty())
                    .map(|rest| (rest.to_ascii_lowercase().replace('_', "."), value))
            })
            .collect();

        if !overrides.is_empty() {
            tracing::debug!(count = overrides.len(), prefix, "Applying environment overrides");
        }
        self.merge(overrides);
        self
    }

    /// Copy of every entry, sorted by key.
    #[must_use]
    pub fn snapshot(&self) -> Properties {
        self.values
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Reads `.properties` files.
///
/// Swappable so tests can serve property sets from memory.
pub trait PropertiesLoader: Send + Sync {
    /// Load and parse the file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read.
    fn load(&self, path: &Path) -> Result<Properties, ConfigError>;

    /// Whether a file exists at `path`.
    fn exists(&self, path: &Path) -> bool;
}

/// [`PropertiesLoader`] reading from the file system.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilePropertiesLoader;

impl PropertiesLoader for FilePropertiesLoader {
    fn load(&self, path: &Path) -> Result<Properties, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(parse_properties(&text))
    }

    fn exists(&self, path: &Path) -> bool {
        path.is_file()
    }
}

/// Parse `.properties` text.
///
/// Supports `#`/`!` comment lines, `=`, `:` or whitespace separators,
/// trailing-backslash continuation lines and the `\\ \n \t \r \= \: \#`
/// escapes. Duplicate keys keep the last value.
#[must_use]
pub fn parse_properties(text: &str) -> Properties {
    let mut properties = Properties::new();
    let mut logical = String::new();

    for raw in text.lines() {
        // Continuation lines drop their leading whitespace too
        let line = raw.trim_start();

        if logical.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }

        if ends_with_continuation(line) {
            logical.push_str(&line[..line.len() - 1]);
            continue;
        }

        logical.push_str(line);
        let (key, value) = split_entry(&logical);
        if !key.is_empty() {
            properties.insert(key, value);
        }
        logical.clear();
    }

    if !logical.is_empty() {
        let (key, value) = split_entry(&logical);
        if !key.is_empty() {
            properties.insert(key, value);
        }
    }

    properties
}

/// An odd number of trailing backslashes continues the line.
fn ends_with_continuation(line: &str) -> bool {
    line.chars().rev().take_while(|c| *c == '\\').count() % 2 == 1
}

/// Split a logical line into unescaped key and value.
fn split_entry(line: &str) -> (String, String) {
    let mut key_end = line.len();
    let mut escaped = false;

    for (index, c) in line.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' => escaped = true,
            '=' | ':' | ' ' | '\t' => {
                key_end = index;
                break;
            }
            _ => {}
        }
    }

    let key = unescape(&line[..key_end]);
    let mut rest = line[key_end..].trim_start_matches([' ', '\t']);
    if let Some(stripped) = rest.strip_prefix(['=', ':']) {
        rest = stripped.trim_start_matches([' ', '\t']);
    }

    (key, unescape(rest.trim_end()))
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => {}
        }
    }

    out
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn test_parse_separators_and_comments() {
        let props = parse_properties(
            "# comment\n! also a comment\n\ndao.driver=agora.dao.Postgres\ncache.engine.implementation : agora.cache.Default\nlogin.authenticator agora.sso.Default\n",
        );

        assert_eq!(props.len(), 3);
        assert_eq!(props["dao.driver"], "agora.dao.Postgres");
        assert_eq!(props["cache.engine.implementation"], "agora.cache.Default");
        assert_eq!(props["login.authenticator"], "agora.sso.Default");
    }

    #[test]
    fn test_parse_continuation_lines() {
        let props = parse_properties(
            "cacheable.objects = agora.repository.Forums, \\\n    agora.repository.Ranking, \\\n    agora.repository.Smilies\n",
        );

        assert_eq!(
            props["cacheable.objects"],
            "agora.repository.Forums, agora.repository.Ranking, agora.repository.Smilies"
        );
    }

    #[test]
    fn test_parse_escapes() {
        let props = parse_properties("key\\=with\\:seps = tab\\there\\\\\nempty=\n");

        assert_eq!(props["key=with:seps"], "tab\there\\");
        assert_eq!(props["empty"], "");
    }

    #[test]
    fn test_duplicate_keys_keep_last_value() {
        let props = parse_properties("a=1\na=2\n");
        assert_eq!(props["a"], "2");
    }

    #[test]
    fn test_typed_getters() {
        let settings = Settings::from_pairs([
            ("delay", "2000"),
            ("flag", "TRUE"),
            ("bad", "often"),
            ("blank", "  "),
        ]);

        assert_eq!(settings.get_int("delay").unwrap(), 2000);
        assert!(settings.get_bool("flag").unwrap());
        assert!(matches!(
            settings.get_bool("bad"),
            Err(ConfigError::Invalid { expected: "true or false", .. })
        ));
        assert!(matches!(settings.get_int("unset"), Err(ConfigError::Missing { .. })));
        assert!(matches!(settings.require("blank"), Err(ConfigError::Missing { .. })));
        assert_eq!(settings.get_or("unset", "fallback"), "fallback");
    }

    #[test]
    fn test_merge_overrides_earlier_values() {
        let settings = Settings::from_pairs([("dao.driver", "first")]);
        settings.merge(parse_properties("dao.driver=second\nextra=1"));

        assert_eq!(settings.get("dao.driver").as_deref(), Some("second"));
        assert_eq!(settings.snapshot().len(), 2);
        assert_eq!(settings.remove("extra").as_deref(), Some("1"));
        assert_eq!(settings.get("extra"), None);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = FilePropertiesLoader
            .load(Path::new("/definitely/not/here.properties"))
            .unwrap_err();

        assert!(matches!(err, ConfigError::Io { .. }));
        assert!(err.to_string().contains("/definitely/not/here.properties"));
    }

    #[test]
    fn test_env_overrides_strip_prefix_and_lowercase() {
        let Ok(path) = std::env::var("PATH") else {
            return;
        };

        let settings = Settings::from_pairs([("h", "placeholder")]).with_env_overrides("PAT");

        assert_eq!(settings.get("h"), Some(path));
    }
}
