use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::info;

use crate::credits::{CreditsFetcher, HttpLedger};
use crate::dedup::{Deduplicator, DEFAULT_UPTIME_TOLERANCE};
use crate::error::{PulseError, PulseResult};
use crate::geo::{GeoLookup, GeoResolver, HttpGeoBatch, OfflineGeoDb};
use crate::orchestrator::{ChannelConfig, RpcChannel};
use crate::pulse::PulseEngine;
use crate::rpc::JsonRpcSource;

#[derive(Deserialize, Debug, Default)]
pub struct ServerConfig {
    pub listen_ip: Option<String>,
    pub port: Option<u16>,
}

#[derive(Deserialize, Debug)]
pub struct PrivateConfig {
    pub hero: String,
}

#[derive(Deserialize, Debug)]
pub struct PublicConfig {
    pub hero: String,
    #[serde(default)]
    pub backups: Vec<String>,
    #[serde(default = "default_race_width")]
    pub race_width: usize,
}

#[derive(Deserialize, Debug)]
pub struct CreditsConfig {
    pub mainnet_url: String,
    pub devnet_url: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct GeoConfig {
    /// Remote batch endpoint; leave unset to rely on the offline database.
    pub batch_url: Option<String>,
    pub offline_db: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct TimingConfig {
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_ledger_timeout_ms")]
    pub ledger_timeout_ms: u64,
    #[serde(default = "default_geo_timeout_ms")]
    pub geo_timeout_ms: u64,
    #[serde(default = "default_freshness_secs")]
    pub freshness_secs: u64,
    #[serde(default = "default_discovery_interval_secs")]
    pub discovery_interval_secs: u64,
    #[serde(default = "default_discovery_sample")]
    pub discovery_sample: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            rpc_timeout_ms: default_rpc_timeout_ms(),
            ledger_timeout_ms: default_ledger_timeout_ms(),
            geo_timeout_ms: default_geo_timeout_ms(),
            freshness_secs: default_freshness_secs(),
            discovery_interval_secs: default_discovery_interval_secs(),
            discovery_sample: default_discovery_sample(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct DedupConfig {
    #[serde(default = "default_uptime_tolerance")]
    pub uptime_tolerance: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            uptime_tolerance: default_uptime_tolerance(),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    pub private: PrivateConfig,
    pub public: PublicConfig,
    pub credits: CreditsConfig,
    #[serde(default)]
    pub geo: GeoConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    #[serde(default)]
    pub dedup: DedupConfig,
}

fn default_race_width() -> usize {
    3
}
fn default_rpc_timeout_ms() -> u64 {
    8_000
}
fn default_ledger_timeout_ms() -> u64 {
    8_000
}
fn default_geo_timeout_ms() -> u64 {
    5_000
}
fn default_freshness_secs() -> u64 {
    10
}
fn default_discovery_interval_secs() -> u64 {
    30
}
fn default_discovery_sample() -> usize {
    2
}
fn default_uptime_tolerance() -> u64 {
    DEFAULT_UPTIME_TOLERANCE
}

pub fn load_config(path: impl AsRef<Path>) -> PulseResult<AppConfig> {
    let config_str = fs::read_to_string(path)?;
    parse_config(&config_str)
}

pub fn parse_config(config_str: &str) -> PulseResult<AppConfig> {
    let config: AppConfig = toml::from_str(config_str)?;
    config.validate()?;
    Ok(config)
}

impl AppConfig {
    fn validate(&self) -> PulseResult<()> {
        if self.private.hero.trim().is_empty() {
            return Err(PulseError::Config("private.hero must be set".to_string()));
        }
        if self.public.hero.trim().is_empty() {
            return Err(PulseError::Config("public.hero must be set".to_string()));
        }
        if self.timing.rpc_timeout_ms == 0 {
            return Err(PulseError::Config("timing.rpc_timeout_ms must be positive".to_string()));
        }
        Ok(())
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.timing.discovery_interval_secs.max(1))
    }

    fn channel(&self, name: &str, hero: &str, backups: &[String], race_width: usize) -> ChannelConfig {
        ChannelConfig {
            name: name.to_string(),
            hero: hero.to_string(),
            backups: backups.to_vec(),
            call_timeout: Duration::from_millis(self.timing.rpc_timeout_ms),
            freshness: Duration::from_secs(self.timing.freshness_secs),
            race_width,
            discovery_sample: self.timing.discovery_sample,
        }
    }

    /// Wires every component from this configuration. Reading the offline
    /// geo database is the only fallible step.
    pub fn build_engine(&self) -> PulseResult<PulseEngine> {
        let source = Arc::new(JsonRpcSource);
        let private = RpcChannel::new(self.channel("private", &self.private.hero, &[], 0), source.clone());
        let public = RpcChannel::new(
            self.channel("public", &self.public.hero, &self.public.backups, self.public.race_width),
            source,
        );

        let credits = CreditsFetcher::new(
            Arc::new(HttpLedger {
                mainnet_url: self.credits.mainnet_url.clone(),
                devnet_url: self.credits.devnet_url.clone(),
            }),
            Duration::from_millis(self.timing.ledger_timeout_ms),
        );

        let remote = self
            .geo
            .batch_url
            .as_ref()
            .map(|url| Arc::new(HttpGeoBatch { url: url.clone() }) as Arc<dyn GeoLookup>);
        let offline = self.geo.offline_db.as_ref().map(OfflineGeoDb::load).transpose()?;
        if let Some(db) = &offline {
            info!(ranges = db.len(), "offline geo database loaded");
        }
        let geo = GeoResolver::new(remote, offline, Duration::from_millis(self.timing.geo_timeout_ms));

        Ok(PulseEngine::new(
            private,
            public,
            credits,
            geo,
            Deduplicator::new(self.dedup.uptime_tolerance),
        ))
    }
}
