//! Layered configuration resolution.
//!
//! Options come from three layers, highest precedence first:
//!
//! 1. inline options handed to the filter,
//! 2. the `[memcache]` section of `<config_dir>/memcache.conf`,
//! 3. built-in defaults.
//!
//! The file is only consulted when the inline layer lacks a server list or
//! a usable pool size. Once read, every option in its section acts as a
//! default for the inline layer.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use indexmap::IndexMap;
use tracing::debug;

use crate::config::{Options, ServerSpec, TlsSettings};
use crate::error::{RingError, RingResult};

/// Inline option map, as handed over by the host pipeline.
pub type Conf = IndexMap<String, String>;

/// Directory searched for [`CONFIG_FILE`] unless `config_dir` is set.
pub const DEFAULT_CONFIG_DIR: &str = "/etc/memcache-ring";
/// File name of the external configuration.
pub const CONFIG_FILE: &str = "memcache.conf";
/// Section of the external file holding our options.
pub const SECTION: &str = "memcache";
/// Server list used when no layer names one.
pub const DEFAULT_SERVERS: &str = "127.0.0.1:11211";

const DEFAULT_TRIES: usize = 3;
const DEFAULT_MAX_CONNECTIONS: usize = 2;
const DEFAULT_CONNECT_TIMEOUT: f64 = 0.3;
const DEFAULT_POOL_TIMEOUT: f64 = 1.0;
const DEFAULT_IO_TIMEOUT: f64 = 2.0;
const DEFAULT_IDLE_TIMEOUT: f64 = 60.0;
const DEFAULT_ERROR_LIMIT: u32 = 10;
const DEFAULT_ERROR_INTERVAL: f64 = 60.0;

/// A source of file-based configuration.
pub trait ConfigSource {
    /// Load the file at `path`. Returns `Ok(false)` when it does not exist;
    /// any other failure is an error.
    fn read(&mut self, path: &Path) -> io::Result<bool>;

    /// A single option, `None` when the section or option is missing.
    fn get(&self, section: &str, option: &str) -> Option<String>;

    /// Every option of a section, `None` when the section is missing.
    fn items(&self, section: &str) -> Option<IndexMap<String, String>>;
}

/// A source with no configuration at all.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyConfigSource;

impl ConfigSource for EmptyConfigSource {
    fn read(&mut self, _path: &Path) -> io::Result<bool> {
        Ok(false)
    }

    fn get(&self, _section: &str, _option: &str) -> Option<String> {
        None
    }

    fn items(&self, _section: &str) -> Option<IndexMap<String, String>> {
        None
    }
}

/// INI-style file source.
///
/// Understands `[section]` headers, `key = value` and `key: value` pairs,
/// full-line `#`/`;` comments, and indented continuation lines that extend
/// the previous value. Keys are case-insensitive. Lines before the first
/// header are ignored.
#[derive(Debug, Default, Clone)]
pub struct FileConfigSource {
    sections: IndexMap<String, IndexMap<String, String>>,
}

impl FileConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse configuration text.
    pub fn parse(text: &str) -> Self {
        let mut sections: IndexMap<String, IndexMap<String, String>> = IndexMap::new();
        let mut section: Option<String> = None;
        let mut last_key: Option<String> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() {
                last_key = None;
                continue;
            }
            if line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            let indented = raw.starts_with(char::is_whitespace);
            if let (true, Some(name), Some(key)) = (indented, &section, &last_key) {
                if let Some(value) = sections.get_mut(name).and_then(|s| s.get_mut(key)) {
                    value.push('\n');
                    value.push_str(line);
                    continue;
                }
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                let name = name.trim().to_string();
                sections.entry(name.clone()).or_default();
                section = Some(name);
                last_key = None;
                continue;
            }

            let Some(name) = &section else { continue };
            let Some(split) = line.find(['=', ':']) else { continue };
            let key = line[..split].trim().to_lowercase();
            let value = line[split + 1..].trim().to_string();
            if let Some(options) = sections.get_mut(name) {
                options.insert(key.clone(), value);
            }
            last_key = Some(key);
        }

        Self { sections }
    }
}

impl ConfigSource for FileConfigSource {
    fn read(&mut self, path: &Path) -> io::Result<bool> {
        match fs::read_to_string(path) {
            Ok(text) => {
                *self = Self::parse(&text);
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn get(&self, section: &str, option: &str) -> Option<String> {
        self.sections
            .get(section)?
            .get(&option.to_lowercase())
            .cloned()
    }

    fn items(&self, section: &str) -> Option<IndexMap<String, String>> {
        self.sections.get(section).cloned()
    }
}

/// Merges inline options, the external file and defaults into [`Options`].
#[derive(Debug)]
pub struct ConfigResolver<S = FileConfigSource> {
    source: S,
}

impl ConfigResolver<FileConfigSource> {
    /// Resolver backed by the real configuration file.
    pub fn new() -> Self {
        Self::with_source(FileConfigSource::new())
    }
}

impl Default for ConfigResolver<FileConfigSource> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: ConfigSource> ConfigResolver<S> {
    pub fn with_source(source: S) -> Self {
        Self { source }
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Resolve `inline` into options.
    ///
    /// Fails when `item_size_warning_threshold` is not an integer, when the
    /// config file exists but cannot be read, or when the server list is
    /// malformed or empty. Every other malformed value falls back to the next layer.
    pub fn resolve(&mut self, inline: &Conf) -> RingResult<Options> {
        let mut servers = non_empty(inline.get("memcache_servers"));
        let mut max_connections = inline
            .get("memcache_max_connections")
            .or_else(|| inline.get("max_connections"))
            .and_then(|v| parse_positive(v));

        let mut merged = Conf::new();
        if servers.is_none() || max_connections.is_none() {
            let path = config_path(inline);
            if self.source.read(&path).map_err(RingError::ConfigRead)? {
                debug!(path = %path.display(), "loaded memcache config file");
                if let Some(items) = self.source.items(SECTION) {
                    merged = items;
                }
                if servers.is_none() {
                    servers = non_empty(self.source.get(SECTION, "memcache_servers").as_ref());
                }
                if max_connections.is_none() {
                    max_connections = self
                        .source
                        .get(SECTION, "memcache_max_connections")
                        .and_then(|v| parse_positive(&v));
                }
            }
        }
        for (key, value) in inline {
            merged.insert(key.clone(), value.clone());
        }

        let servers = ServerSpec::parse_list(servers.as_deref().unwrap_or(DEFAULT_SERVERS))?;
        if servers.is_empty() {
            return Err(RingError::Config("memcache_servers lists no servers".to_string()));
        }
        let interval = seconds(&merged, "error_suppression_interval", DEFAULT_ERROR_INTERVAL);

        let mut options = Options::new()
            .servers(servers)
            .max_connections(max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS))
            .tries(number(&merged, "tries").unwrap_or(DEFAULT_TRIES))
            .connect_timeout(seconds(&merged, "connect_timeout", DEFAULT_CONNECT_TIMEOUT))
            .pool_timeout(seconds(&merged, "pool_timeout", DEFAULT_POOL_TIMEOUT))
            .io_timeout(seconds(&merged, "io_timeout", DEFAULT_IO_TIMEOUT))
            .idle_timeout(seconds(&merged, "idle_timeout", DEFAULT_IDLE_TIMEOUT))
            .error_suppression_limit(number(&merged, "error_suppression_limit").unwrap_or(DEFAULT_ERROR_LIMIT))
            .error_suppression_interval(interval);
        if let Some(duration) = duration(&merged, "error_suppression_duration") {
            options = options.error_suppression_duration(duration);
        }

        Ok(options
            .tls(tls_settings(&merged))
            .item_size_warning_threshold(item_size_warning_threshold(&merged)?)
            .build())
    }
}

fn config_path(inline: &Conf) -> PathBuf {
    let dir = non_empty(inline.get("config_dir")).unwrap_or_else(|| DEFAULT_CONFIG_DIR.to_string());
    Path::new(&dir).join(CONFIG_FILE)
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.map(|v| v.trim()).filter(|v| !v.is_empty()).map(str::to_string)
}

fn parse_positive(value: &str) -> Option<usize> {
    value.trim().parse::<usize>().ok().filter(|&n| n > 0)
}

fn number<T: FromStr>(conf: &Conf, key: &str) -> Option<T> {
    conf.get(key)?.trim().parse().ok()
}

fn duration(conf: &Conf, key: &str) -> Option<Duration> {
    let secs: f64 = number(conf, key)?;
    Duration::try_from_secs_f64(secs).ok()
}

fn seconds(conf: &Conf, key: &str, default: f64) -> Duration {
    duration(conf, key).unwrap_or_else(|| Duration::from_secs_f64(default))
}

fn item_size_warning_threshold(conf: &Conf) -> RingResult<i64> {
    match conf.get("item_size_warning_threshold") {
        None => Ok(-1),
        Some(value) => value
            .trim()
            .parse::<i64>()
            .map_err(|e| RingError::InvalidThreshold {
                value: value.clone(),
                reason: e.to_string(),
            }),
    }
}

/// Truthy config values, as commonly written in INI files.
pub fn config_true_value(value: &str) -> bool {
    matches!(
        value.trim().to_lowercase().as_str(),
        "true" | "1" | "yes" | "on" | "t" | "y"
    )
}

fn tls_settings(conf: &Conf) -> Option<TlsSettings> {
    if !conf.get("tls_enabled").is_some_and(|v| config_true_value(v)) {
        return None;
    }
    let path = |key: &str| non_empty(conf.get(key)).map(PathBuf::from);
    Some(TlsSettings {
        cafile: path("tls_cafile"),
        certfile: path("tls_certfile"),
        keyfile: path("tls_keyfile"),
    })
}
