//! Application settings persistence using dconf
//!
//! Settings are stored in dconf under `/com/parley/voice-agent/`. Numeric
//! values are stored as strings. Command-line flags override stored values.

use crate::cli::Args;
use crate::session::SessionConfig;
use log::{error, warn};
use std::str::FromStr;
use std::time::Duration;

const DCONF_PATH: &str = "/com/parley/voice-agent/";

/// Keys for dconf settings
mod keys {
    pub const ENDPOINT: &str = "endpoint";
    pub const MODEL: &str = "model";
    pub const SYSTEM_INSTRUCTION: &str = "system-instruction";
    pub const IDLE_TIMEOUT_SECS: &str = "idle-timeout-secs";
    pub const LEAD_IN_MS: &str = "lead-in-ms";
    pub const GUARD_WINDOW_MS: &str = "guard-window-ms";
    pub const BLOCK_SIZE: &str = "block-size";
}

fn key(name: &str) -> String {
    format!("{}{}", DCONF_PATH, name)
}

fn get_string(name: &str) -> Option<String> {
    dconf_rs::get_string(&key(name))
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn set_string(name: &str, value: &str) {
    if let Err(e) = dconf_rs::set_string(&key(name), value) {
        error!("Failed to save {} to dconf: {}", name, e);
    }
}

/// Parse a numeric setting, ignoring values that do not parse
fn parse_number<T: FromStr>(name: &str, value: Option<String>) -> Option<T> {
    let value = value?;
    match value.parse() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Ignoring invalid dconf value {}={:?}", name, value);
            None
        }
    }
}

/// Values read from dconf; `None` means "use the built-in default"
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StoredSettings {
    pub endpoint: Option<String>,
    pub model: Option<String>,
    pub system_instruction: Option<String>,
    pub idle_timeout_secs: Option<u64>,
    pub lead_in_ms: Option<u64>,
    pub guard_window_ms: Option<u64>,
    pub block_size: Option<usize>,
}

impl StoredSettings {
    pub fn load() -> Self {
        Self {
            endpoint: get_string(keys::ENDPOINT),
            model: get_string(keys::MODEL),
            system_instruction: get_string(keys::SYSTEM_INSTRUCTION),
            idle_timeout_secs: parse_number(
                keys::IDLE_TIMEOUT_SECS,
                get_string(keys::IDLE_TIMEOUT_SECS),
            ),
            lead_in_ms: parse_number(keys::LEAD_IN_MS, get_string(keys::LEAD_IN_MS)),
            guard_window_ms: parse_number(keys::GUARD_WINDOW_MS, get_string(keys::GUARD_WINDOW_MS)),
            block_size: parse_number(keys::BLOCK_SIZE, get_string(keys::BLOCK_SIZE)),
        }
    }
}

/// Persist the connection overrides given on the command line
pub fn save_overrides(args: &Args) {
    if let Some(endpoint) = &args.endpoint {
        set_string(keys::ENDPOINT, endpoint);
    }
    if let Some(model) = &args.model {
        set_string(keys::MODEL, model);
    }
    if let Some(secs) = args.idle_timeout_secs {
        set_string(keys::IDLE_TIMEOUT_SECS, &secs.to_string());
    }
}

/// Build the session configuration: defaults, then dconf, then CLI
pub fn session_config(stored: StoredSettings, args: &Args) -> SessionConfig {
    let mut config = SessionConfig::default();

    if let Some(endpoint) = stored.endpoint {
        config.transport.endpoint = endpoint;
    }
    if let Some(model) = stored.model {
        config.transport.model = model;
    }
    config.transport.system_instruction = stored.system_instruction;
    if let Some(secs) = stored.idle_timeout_secs.filter(|&secs| secs > 0) {
        config.idle_timeout = Duration::from_secs(secs);
    }
    if let Some(ms) = stored.lead_in_ms {
        config.playback.lead_in = Duration::from_millis(ms);
    }
    if let Some(ms) = stored.guard_window_ms {
        config.playback.guard_window = Duration::from_millis(ms);
    }
    if let Some(block_size) = stored.block_size.filter(|&size| size > 0) {
        config.capture.block_size = block_size;
    }

    if let Some(endpoint) = &args.endpoint {
        config.transport.endpoint = endpoint.clone();
    }
    if let Some(model) = &args.model {
        config.transport.model = model.clone();
    }
    if let Some(secs) = args.idle_timeout_secs {
        config.idle_timeout = Duration::from_secs(secs);
    }
    config.credential = args.api_key.clone();

    config
}
