//! Effective settings: a string map composed from five ordered sources.
//!
//! Precedence, later wins: built-in defaults, `RAI_*` environment
//! variables, the `.rai/config` file, agent-file frontmatter, CLI flags.
//! Unknown keys are preserved; adapters ignore what they don't recognize.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Environment variable prefix; `RAI_API_KEY` becomes the key `api_key`.
pub const ENV_PREFIX: &str = "RAI_";

/// File name of the persisted settings layer, under the state folder.
pub const CONFIG_FILE: &str = "config";

/// Name of the per-working-directory state folder.
pub const STATE_DIR: &str = ".rai";

/// The effective settings map. A `BTreeMap` keeps serialization sorted.
pub type Settings = BTreeMap<String, String>;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config {}: line {line}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },

    #[error("config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Overlay the five sources in order; later layers win per key.
pub fn merge(
    defaults: Settings,
    env: Settings,
    file: Settings,
    agent: Settings,
    cli: Settings,
) -> Settings {
    let mut out = defaults;
    for layer in [env, file, agent, cli] {
        out.extend(layer);
    }
    out
}

/// Extract the environment layer: every `RAI_*` variable contributes its
/// lowercased suffix as the key, underscores preserved.
pub fn env_settings() -> Settings {
    env_settings_from(env::vars())
}

fn env_settings_from(vars: impl Iterator<Item = (String, String)>) -> Settings {
    vars.filter_map(|(name, value)| {
        let suffix = name.strip_prefix(ENV_PREFIX)?;
        if suffix.is_empty() {
            return None;
        }
        Some((suffix.to_lowercase(), value))
    })
    .collect()
}

/// Parse the `key = "value"` file format. `#` starts a comment; blank
/// lines are skipped; anything else malformed fails with its line number.
pub fn parse(path: &Path, text: &str) -> Result<Settings, ConfigError> {
    let mut settings = Settings::new();

    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let malformed = |reason: &str| ConfigError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: reason.to_string(),
        };

        let (key, rest) = line
            .split_once('=')
            .ok_or_else(|| malformed("expected `key = \"value\"`"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(malformed("empty key"));
        }

        let rest = rest.trim();
        let value = rest
            .strip_prefix('"')
            .and_then(|v| v.strip_suffix('"'))
            .ok_or_else(|| malformed("value must be double-quoted"))?;

        settings.insert(key.to_string(), value.to_string());
    }

    Ok(settings)
}

/// Render settings in the file format, one sorted `key = "value"` per line.
pub fn serialize(settings: &Settings) -> String {
    let mut out = String::new();
    for (key, value) in settings {
        out.push_str(key);
        out.push_str(" = \"");
        out.push_str(value);
        out.push_str("\"\n");
    }
    out
}

/// Path of the settings file under `basedir`.
pub fn config_path(base_dir: &Path) -> PathBuf {
    base_dir.join(STATE_DIR).join(CONFIG_FILE)
}

/// Load the file layer. A missing file is an empty layer, not an error.
pub fn load_file(base_dir: &Path) -> Result<Settings, ConfigError> {
    let path = config_path(base_dir);
    let text = match fs::read_to_string(&path) {
        Ok(text) => text,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Settings::new()),
        Err(err) => {
            return Err(ConfigError::Io {
                path,
                source: err,
            })
        }
    };
    parse(&path, &text)
}

/// Persist one entry into the settings file, creating the state folder and
/// file as needed. Used by the `config <key> <value>` subcommand.
pub fn store(base_dir: &Path, key: &str, value: &str) -> Result<(), ConfigError> {
    let mut settings = load_file(base_dir)?;
    settings.insert(key.to_string(), value.to_string());

    let path = config_path(base_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    fs::write(&path, serialize(&settings)).map_err(|source| ConfigError::Io { path, source })
}

/// Convenience lookup honoring the `api-key` / `api_key` alias.
pub fn api_key(settings: &Settings) -> Option<&str> {
    settings
        .get("api-key")
        .or_else(|| settings.get("api_key"))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}
