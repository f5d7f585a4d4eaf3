//! Agent options.
//!
//! Everything arrives in the `-agentpath:libagent.so=<options>` string as
//! comma separated `key=value` pairs. List values separate their items with
//! `|`, since `,` already separates the pairs:
//!
//! ```text
//! log=debug,plugin.jars=/opt/apm/jdbc.jar|/opt/apm/http.jar,profiler.jdbc.tracesqlbindvalue=true
//! ```

use std::collections::BTreeMap;
use std::path::PathBuf;

/// `env_logger` filter for the agent's own diagnostics.
pub const LOG_KEY: &str = "log";
/// Plugin jars whose classes the injector may define in application loaders.
pub const PLUGIN_JARS_KEY: &str = "plugin.jars";
/// Request the retransform capabilities at load.
pub const RETRANSFORM_KEY: &str = "profiler.retransform";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProfilerConfig {
    values: BTreeMap<String, String>,
}

impl ProfilerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses an option string. Entries without `=` are flags set to `true`.
    pub fn parse(options: &str) -> Self {
        let mut values = BTreeMap::new();
        for pair in options.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = match pair.split_once('=') {
                Some((key, value)) => (key.trim(), value.trim()),
                None => (pair, "true"),
            };
            if values.insert(key.to_string(), value.to_string()).is_some() {
                log::warn!("agent option {key} given more than once, using the last value");
            }
        }
        Self { values }
    }

    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.values.insert(key.to_string(), value.to_string());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn read_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or(default).to_string()
    }

    pub fn read_bool(&self, key: &str, default: bool) -> bool {
        match self.get(key).map(str::to_ascii_lowercase).as_deref() {
            Some("true") | Some("yes") | Some("on") | Some("1") => true,
            Some("false") | Some("no") | Some("off") | Some("0") => false,
            Some(other) => {
                log::warn!("agent option {key}={other} is not a boolean, using {default}");
                default
            }
            None => default,
        }
    }

    pub fn read_int(&self, key: &str, default: i64) -> i64 {
        match self.get(key) {
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                log::warn!("agent option {key}={raw} is not an integer, using {default}");
                default
            }),
            None => default,
        }
    }

    /// `|` separated items, empty items dropped.
    pub fn read_list(&self, key: &str) -> Vec<String> {
        self.get(key)
            .map(|raw| raw.split('|').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect())
            .unwrap_or_default()
    }

    pub fn log_filter(&self) -> Option<&str> {
        self.get(LOG_KEY)
    }

    pub fn plugin_jars(&self) -> Vec<PathBuf> {
        self.read_list(PLUGIN_JARS_KEY).into_iter().map(PathBuf::from).collect()
    }

    pub fn retransform_enabled(&self) -> bool {
        self.read_bool(RETRANSFORM_KEY, false)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }
}
