use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use shared::protocol::DeploymentFile;
use url::Url;

use crate::{gateway::ContractDirectory, session::SessionOptions};

pub const SETTINGS_FILE: &str = "sale.toml";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub rpc_url: String,
    pub contracts_path: PathBuf,
    pub confirmation_timeout_secs: u64,
    pub receipt_poll_interval_ms: u64,
    pub refresh_interval_secs: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            rpc_url: "http://127.0.0.1:8545".into(),
            contracts_path: PathBuf::from("config.json"),
            confirmation_timeout_secs: 120,
            receipt_poll_interval_ms: 1000,
            refresh_interval_secs: None,
        }
    }
}

impl Settings {
    pub fn rpc_url(&self) -> anyhow::Result<Url> {
        Url::parse(&self.rpc_url).with_context(|| format!("invalid rpc url '{}'", self.rpc_url))
    }

    pub fn receipt_poll_interval(&self) -> Duration {
        Duration::from_millis(self.receipt_poll_interval_ms.max(1))
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            confirmation_timeout: Duration::from_secs(self.confirmation_timeout_secs),
            refresh_interval: self
                .refresh_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct FileSettings {
    rpc_url: Option<String>,
    contracts_path: Option<PathBuf>,
    confirmation_timeout_secs: Option<u64>,
    receipt_poll_interval_ms: Option<u64>,
    refresh_interval_secs: Option<u64>,
}

/// Defaults, then `sale.toml` in the working directory, then environment.
pub fn load_settings() -> Settings {
    let mut settings = Settings::default();
    if let Ok(raw) = fs::read_to_string(SETTINGS_FILE) {
        apply_file_settings(&mut settings, &raw);
    }
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

fn apply_file_settings(settings: &mut Settings, raw: &str) {
    let Ok(file_cfg) = toml::from_str::<FileSettings>(raw) else {
        tracing::warn!("ignoring malformed {SETTINGS_FILE}");
        return;
    };
    if let Some(v) = file_cfg.rpc_url {
        settings.rpc_url = v;
    }
    if let Some(v) = file_cfg.contracts_path {
        settings.contracts_path = v;
    }
    if let Some(v) = file_cfg.confirmation_timeout_secs {
        settings.confirmation_timeout_secs = v;
    }
    if let Some(v) = file_cfg.receipt_poll_interval_ms {
        settings.receipt_poll_interval_ms = v;
    }
    if file_cfg.refresh_interval_secs.is_some() {
        settings.refresh_interval_secs = file_cfg.refresh_interval_secs;
    }
}

fn apply_env_overrides(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(v) = lookup("SALE_RPC_URL") {
        settings.rpc_url = v;
    }
    if let Some(v) = lookup("APP__RPC_URL") {
        settings.rpc_url = v;
    }

    if let Some(v) = lookup("SALE_CONTRACTS") {
        settings.contracts_path = PathBuf::from(v);
    }
    if let Some(v) = lookup("APP__CONTRACTS_PATH") {
        settings.contracts_path = PathBuf::from(v);
    }

    if let Some(parsed) = lookup("APP__CONFIRMATION_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        settings.confirmation_timeout_secs = parsed;
    }
    if let Some(parsed) = lookup("APP__RECEIPT_POLL_INTERVAL_MS").and_then(|v| v.parse().ok()) {
        settings.receipt_poll_interval_ms = parsed;
    }
    if let Some(parsed) = lookup("APP__REFRESH_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        settings.refresh_interval_secs = Some(parsed);
    }
}

pub fn parse_contract_directory(raw: &str) -> anyhow::Result<ContractDirectory> {
    let file: DeploymentFile =
        serde_json::from_str(raw).context("failed to parse deployment file")?;
    ContractDirectory::from_deployments(&file)
}

pub fn load_contract_directory(path: &Path) -> anyhow::Result<ContractDirectory> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed to read deployment file '{}'", path.display()))?;
    parse_contract_directory(&raw)
        .with_context(|| format!("invalid deployment file '{}'", path.display()))
}
