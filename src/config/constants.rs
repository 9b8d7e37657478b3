use arc_swap::ArcSwap;
use clap::Parser;
use std::{
    net::{IpAddr, Ipv4Addr},
    path::PathBuf,
    sync::LazyLock,
};

use crate::{config::PolygateConfig, utils::set_polygate_dir};

pub const CONFIG_NAME: &str = "polygate.toml";

pub const CLAUDE_ENDPOINT: &str = "https://api.anthropic.com";
pub const CLAUDE_TOKEN_URL: &str = "https://console.anthropic.com/v1/oauth/token";
pub const CODEX_ENDPOINT: &str = "https://chatgpt.com/backend-api/codex";
pub const GEMINI_ENDPOINT: &str = "https://generativelanguage.googleapis.com";

pub static POLYGATE_CONFIG: LazyLock<ArcSwap<PolygateConfig>> = LazyLock::new(|| {
    let _ = *POLYGATE_DIR;
    let config = PolygateConfig::new();
    ArcSwap::from_pointee(config)
});

pub static ARG_CONFIG_FILE: LazyLock<Option<PathBuf>> = LazyLock::new(|| {
    // tolerate foreign argv, e.g. the test harness
    let args = crate::Args::try_parse().ok()?;
    let config_file = args.config?;
    config_file.canonicalize().ok()
});

pub static CONFIG_PATH: LazyLock<PathBuf> = LazyLock::new(|| {
    if let Some(path) = ARG_CONFIG_FILE.as_ref() {
        path.to_owned()
    } else {
        POLYGATE_DIR.join(CONFIG_NAME)
    }
});

pub static POLYGATE_DIR: LazyLock<PathBuf> =
    LazyLock::new(|| set_polygate_dir().expect("Failed to get dir"));

// Default functions

pub fn default_ip() -> IpAddr {
    Ipv4Addr::new(127, 0, 0, 1).into()
}

pub fn default_port() -> u16 {
    8787
}

/// Default model the synthetic `auto` name resolves to.
pub fn default_auto_model() -> String {
    "claude-sonnet-4-5".to_string()
}

/// First cooldown window applied to a failing credential.
pub const fn default_cooldown_base_secs() -> u64 {
    30
}

/// Ceiling for the exponential cooldown backoff.
pub const fn default_cooldown_max_secs() -> u64 {
    900
}

/// How many times a streaming request may be retried before any payload
/// bytes have been flushed to the client.
pub const fn default_bootstrap_retries() -> usize {
    2
}
