// -------------------------------------------------------------------------------------------------
//  Copyright (C) 2015-2025 Nautech Systems Pty Ltd. All rights reserved.
//  https://nautechsystems.io
//
//  Licensed under the GNU Lesser General Public License Version 3.0 (the "License");
//  You may not use this file except in compliance with the License.
//  You may obtain a copy of the License at https://www.gnu.org/licenses/lgpl-3.0.en.html
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.
// -------------------------------------------------------------------------------------------------

//! Logging setup on top of `tracing`.
//!
//! Log filtering can be driven either by the standard `RUST_LOG` variable (see [`init_tracing`])
//! or by a [`LoggerConfig`], usually read from the `TERMSYNC_LOG` environment variable, which maps
//! a compact `stdout=Info;termsync_client=Debug` spec onto an [`EnvFilter`].

use std::{
    collections::HashMap,
    env,
    fmt::Display,
    str::FromStr,
    sync::atomic::{AtomicBool, Ordering},
};

use log::LevelFilter;
use tracing_subscriber::EnvFilter;
use ustr::Ustr;

/// Environment variable holding a [`LoggerConfig`] spec.
pub const TERMSYNC_LOG: &str = "TERMSYNC_LOG";

static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Returns whether a subscriber has been installed by this module.
pub fn logging_is_initialized() -> bool {
    LOGGING_INITIALIZED.load(Ordering::Relaxed)
}

/// Configuration for the tracing subscriber.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggerConfig {
    /// Maximum log level to write to stdout.
    pub stdout_level: LevelFilter,
    /// Per-component log levels, keyed by module path.
    component_level: HashMap<Ustr, LevelFilter>,
    /// If logger is using ANSI color codes.
    pub is_colored: bool,
    /// If the configuration should be printed to stdout at initialization.
    pub print_config: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            stdout_level: LevelFilter::Info,
            component_level: HashMap::new(),
            is_colored: false,
            print_config: false,
        }
    }
}

impl LoggerConfig {
    /// Creates a new [`LoggerConfig`] instance.
    #[must_use]
    pub const fn new(
        stdout_level: LevelFilter,
        component_level: HashMap<Ustr, LevelFilter>,
        is_colored: bool,
        print_config: bool,
    ) -> Self {
        Self {
            stdout_level,
            component_level,
            is_colored,
            print_config,
        }
    }

    /// Parses a configuration from a `;` separated spec such as
    /// `stdout=Info;termsync_client::latency=Debug;is_colored`.
    ///
    /// # Errors
    ///
    /// Returns an error if a pair is malformed or a level is unknown.
    pub fn from_spec(spec: &str) -> anyhow::Result<Self> {
        let mut config = Self::default();
        for kv in spec.split(';') {
            let kv = kv.trim();
            if kv.is_empty() {
                continue;
            }
            let kv_lower = kv.to_lowercase();
            if kv_lower == "is_colored" {
                config.is_colored = true;
            } else if kv_lower == "print_config" {
                config.print_config = true;
            } else {
                let Some((k, v)) = kv.split_once('=') else {
                    anyhow::bail!("Invalid spec pair: {kv}");
                };
                let (k, v) = (k.trim(), v.trim());
                let lvl = LevelFilter::from_str(v)
                    .map_err(|_| anyhow::anyhow!("Invalid log level: {v}"))?;
                if k.eq_ignore_ascii_case("stdout") {
                    config.stdout_level = lvl;
                } else {
                    config.component_level.insert(Ustr::from(k), lvl);
                }
            }
        }
        Ok(config)
    }

    /// Retrieves the logger configuration from the `TERMSYNC_LOG` environment variable.
    ///
    /// # Errors
    ///
    /// Returns an error if the variable is unset or invalid.
    pub fn from_env() -> anyhow::Result<Self> {
        let spec = env::var(TERMSYNC_LOG)?;
        Self::from_spec(&spec)
    }

    /// Returns the per-component levels.
    #[must_use]
    pub const fn component_level(&self) -> &HashMap<Ustr, LevelFilter> {
        &self.component_level
    }

    /// Renders the configuration as `EnvFilter` directives.
    #[must_use]
    pub fn directives(&self) -> String {
        let mut components: Vec<_> = self.component_level.iter().collect();
        components.sort_by_key(|(k, _)| k.as_str());

        let mut directives = vec![level_directive(self.stdout_level)];
        directives.extend(
            components
                .into_iter()
                .map(|(component, level)| format!("{component}={}", level_directive(*level))),
        );
        directives.join(",")
    }
}

impl Display for LoggerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LoggerConfig(directives={}, is_colored={})",
            self.directives(),
            self.is_colored
        )
    }
}

fn level_directive(level: LevelFilter) -> String {
    level.as_str().to_lowercase()
}

/// Initialize tracing.
///
/// Tracing is configured to filter modules and write up to a specific level by passing
/// a configuration using the `RUST_LOG` environment variable. When the variable is unset
/// this is a no-op.
///
/// # Errors
///
/// Returns an error if tracing subscriber fails to initialize.
pub fn init_tracing() -> anyhow::Result<()> {
    if let Ok(v) = env::var("RUST_LOG") {
        let env_filter = EnvFilter::new(v.clone());

        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))?;

        LOGGING_INITIALIZED.store(true, Ordering::Relaxed);
        tracing::debug!("Initialized tracing logs with RUST_LOG={v}");
    }
    Ok(())
}

/// Initialize logging from the given configuration.
///
/// Should only be called once during an applications run, ideally at the beginning of the run.
///
/// # Errors
///
/// Returns an error if the directives are invalid or a global subscriber is already set.
pub fn init_logging(config: &LoggerConfig) -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_new(config.directives())
        .map_err(|e| anyhow::anyhow!("Invalid log directives: {e}"))?;

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_ansi(config.is_colored)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {e}"))?;

    LOGGING_INITIALIZED.store(true, Ordering::Relaxed);

    if config.print_config {
        println!("Logging config: {config}");
    }
    Ok(())
}
