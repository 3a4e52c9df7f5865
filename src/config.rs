//! Runtime configuration.
//!
//! Settings come from an optional YAML file, with `REFLECTOR_`-prefixed
//! environment variables overriding it. A missing file means defaults; a
//! malformed file or override is a startup error.

use std::path::Path;

use serde::Deserialize;

/// Environment variables with this prefix belong to reflector.
pub const ENV_PREFIX: &str = "REFLECTOR_";

#[derive(Clone, Debug, Default, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub watcher: WatcherSettings,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct WatcherSettings {
    /// Watch session timeout, in seconds. Sessions restart when it expires.
    pub timeout: u64,

    /// Capacity of the bounded event queue between watch producer and
    /// consumer. Smooths bursts; not load-bearing for correctness.
    pub queue_capacity: usize,
}

impl Default for WatcherSettings {
    fn default() -> Self {
        WatcherSettings {
            timeout: 3600,
            queue_capacity: 256,
        }
    }
}

pub fn load(path: &Path) -> Result<Config, Vec<String>> {
    let mut config = if path.exists() {
        let data = std::fs::read_to_string(path)
            .map_err(|err| vec![format!("could not read config file {:?}: {}", path, err)])?;

        serde_yaml::from_str(&data)
            .map_err(|err| vec![format!("could not parse config file {:?}: {}", path, err)])?
    } else {
        Config::default()
    };

    apply_env(&mut config, std::env::vars())?;

    Ok(config)
}

fn apply_env(
    config: &mut Config,
    vars: impl Iterator<Item = (String, String)>,
) -> Result<(), Vec<String>> {
    let mut errors = Vec::new();

    for (key, value) in vars {
        let Some(name) = key.strip_prefix(ENV_PREFIX) else {
            continue;
        };

        match name {
            "WATCHER_TIMEOUT" => match value.parse() {
                Ok(timeout) => config.watcher.timeout = timeout,
                Err(err) => errors.push(format!("invalid {}: {}", key, err)),
            },
            "WATCHER_QUEUE_CAPACITY" => match value.parse() {
                Ok(capacity) => config.watcher.queue_capacity = capacity,
                Err(err) => errors.push(format!("invalid {}: {}", key, err)),
            },
            // consumed elsewhere (log filtering)
            "LOG" => {}
            _ => warn!(message = "unknown environment variable", key),
        }
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
