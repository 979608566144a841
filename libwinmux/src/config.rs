// Copyright 2024 WinMux Contributors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Daemon configuration.
//!
//! Unlike `libshpool`'s TOML config, the external configuration document
//! for winmux is JSON (per spec), loaded once at daemon startup and handed
//! to the one `SessionRegistry` constructor that exists — there is no
//! no-config constructor shape for callers to accidentally reach for.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, instrument};

use crate::consts;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_shell")]
    pub default_shell: String,
    #[serde(default = "default_cwd")]
    pub default_cwd: String,
    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            default_shell: default_shell(),
            default_cwd: default_cwd(),
            max_sessions: default_max_sessions(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_shell() -> String {
    consts::DEFAULT_SHELL.to_string()
}
fn default_cwd() -> String {
    consts::DEFAULT_CWD.to_string()
}
fn default_max_sessions() -> usize {
    consts::DEFAULT_MAX_SESSIONS
}
fn default_buffer_size() -> usize {
    consts::DEFAULT_BUFFER_SIZE
}

/// Read the config file at `path`, if given, falling back to defaults.
/// Expansion of `%VAR%` forms in `defaultShell`/`defaultCwd` is deliberately
/// *not* done here: it happens lazily in `Config::resolve_shell` /
/// `Config::resolve_cwd` at session-creation time, so a change to the
/// daemon's environment between startup and the first `CreateSession`
/// request is still honored.
#[instrument(skip_all)]
pub fn read_config(path: Option<&Path>) -> anyhow::Result<Config> {
    let Some(path) = path else {
        info!("no config file given, using defaults");
        return Ok(Config::default());
    };
    if !path.exists() {
        info!(path = %path.display(), "config file does not exist, using defaults");
        return Ok(Config::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: Config = serde_json::from_str(&contents)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}

impl Config {
    pub fn resolve_shell(&self, override_shell: Option<&str>) -> String {
        expand_env(override_shell.unwrap_or(&self.default_shell))
    }

    pub fn resolve_cwd(&self, override_cwd: Option<&str>) -> String {
        expand_env(override_cwd.unwrap_or(&self.default_cwd))
    }
}

/// Expand `%NAME%` occurrences against the daemon's own environment,
/// leaving unrecognized names untouched (matching `cmd.exe`'s own
/// best-effort expansion behavior rather than erroring out).
pub fn expand_env(input: &str) -> String {
    let vars: HashMap<String, String> = std::env::vars().collect();
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(start) = rest.find('%') {
        let Some(end) = rest[start + 1..].find('%') else {
            out.push_str(rest);
            return out;
        };
        let name = &rest[start + 1..start + 1 + end];
        out.push_str(&rest[..start]);
        match vars.get(name) {
            Some(value) => out.push_str(value),
            None => {
                out.push('%');
                out.push_str(name);
                out.push('%');
            }
        }
        rest = &rest[start + 1 + end + 1..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_when_no_path_given() {
        let config = read_config(None).unwrap();
        assert_eq!(config.default_shell, "pwsh.exe");
        assert_eq!(config.max_sessions, 50);
        assert_eq!(config.buffer_size, 4096);
    }

    #[test]
    fn parses_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        fs::write(&path, r#"{ "maxSessions": 10 }"#).unwrap();
        let config = read_config(Some(&path)).unwrap();
        assert_eq!(config.max_sessions, 10);
        assert_eq!(config.default_shell, "pwsh.exe");
    }

    #[test]
    fn expands_known_and_leaves_unknown_vars() {
        std::env::set_var("WINMUX_TEST_VAR", "value");
        assert_eq!(expand_env("%WINMUX_TEST_VAR%\\x"), "value\\x");
        assert_eq!(expand_env("%NOT_A_REAL_VAR_XYZ%"), "%NOT_A_REAL_VAR_XYZ%");
        assert_eq!(expand_env("plain"), "plain");
    }
}
