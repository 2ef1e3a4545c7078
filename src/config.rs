// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// Part of the MIND project (Machine Intelligence Native Design).

//! Bridge configuration.
//!
//! Read from a TOML file named by `MIND_XCALL_CONFIG`, then overridden by
//! individual environment variables.
//!
//! ```toml
//! api_version = 1
//! compatible_versions = []
//! fatal_handler_errors = false
//! cse_pure_calls = true
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{invalid, Result};
use crate::frame::API_VERSION;

pub const CONFIG_ENV: &str = "MIND_XCALL_CONFIG";
pub const FATAL_ERRORS_ENV: &str = "MIND_XCALL_FATAL_ERRORS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    /// Version stamped on every frame.
    pub api_version: u32,
    /// Handler versions accepted in addition to `api_version`.
    pub compatible_versions: Vec<u32>,
    /// Abort the process when a handler reports an error.
    pub fatal_handler_errors: bool,
    /// Let pure call sites reuse results for identical inputs.
    pub cse_pure_calls: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            api_version: API_VERSION,
            compatible_versions: Vec::new(),
            fatal_handler_errors: false,
            cse_pure_calls: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_toml_str(src: &str) -> Result<Self> {
        toml::from_str(src).map_err(|e| invalid(format!("bad bridge config: {e}")))
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let src = std::fs::read_to_string(path)
            .map_err(|e| invalid(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&src)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| invalid(format!("cannot encode config: {e}")))
    }

    /// Defaults, then the file named by `MIND_XCALL_CONFIG`, then
    /// `MIND_XCALL_FATAL_ERRORS`.
    pub fn from_env() -> Result<Self> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) if !path.is_empty() => Self::load(path)?,
            _ => Self::default(),
        };
        if let Ok(raw) = std::env::var(FATAL_ERRORS_ENV) {
            config.fatal_handler_errors = parse_flag(&raw)
                .ok_or_else(|| invalid(format!("{FATAL_ERRORS_ENV}={raw} is not a boolean")))?;
        }
        tracing::debug!(?config, "bridge configuration");
        Ok(config)
    }

    /// Versions a handler may carry to accept frames built under this
    /// configuration.
    pub fn accepts(&self) -> impl Iterator<Item = u32> + '_ {
        std::iter::once(self.api_version).chain(self.compatible_versions.iter().copied())
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" | "" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = BridgeConfig::from_toml_str("compatible_versions = [0]\n").unwrap();
        assert_eq!(config.api_version, API_VERSION);
        assert_eq!(config.compatible_versions, vec![0]);
        assert!(config.cse_pure_calls);
        assert_eq!(config.accepts().collect::<Vec<_>>(), vec![API_VERSION, 0]);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(BridgeConfig::from_toml_str("retries = 3\n").is_err());
    }

    #[test]
    fn flags_parse() {
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("off"), Some(false));
        assert_eq!(parse_flag("maybe"), None);
    }
}
