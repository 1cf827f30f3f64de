//! Gateway settings, configurable using environment variables.
//!
//! Mirrors the teacher's `figment`-based configuration loading: a single
//! `Figment` merging environment variables under one prefix, extracted into a
//! typed settings struct.

use camino::Utf8PathBuf;
use figment::providers::Env;
use figment::Figment;
use serde::Deserialize;
use std::net::Ipv4Addr;
use std::num::NonZeroUsize;
use std::sync::OnceLock;
use std::time::Duration;

use crate::ids::AeTitle;

static CONFIG: OnceLock<Figment> = OnceLock::new();

/// Returns the process-wide configuration source. Environment variables are
/// read once and cached; this mirrors the teacher's `get_config`.
pub fn get_config() -> &'static Figment {
    CONFIG.get_or_init(|| Figment::new().merge(Env::prefixed("GATEWAY_")))
}

/// Top-level settings for the gateway, loaded from the `GATEWAY_*` environment
/// variables named in spec.md §6 plus the ambient additions from
/// SPEC_FULL.md §6.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewaySettings {
    #[serde(default = "default_scp_ip")]
    pub scp_ip: Ipv4Addr,
    #[serde(default = "default_scp_port")]
    pub scp_port: u16,
    #[serde(default = "default_scp_ae_title")]
    pub scp_ae_title: AeTitle,
    #[serde(default = "default_max_pdu_length")]
    pub scp_max_pdu_length: usize,

    pub temporary_storage: Utf8PathBuf,
    pub db_basedir: Utf8PathBuf,

    #[serde(with = "humantime_serde", default = "default_daemon_run_interval")]
    pub daemon_run_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_timeout")]
    pub timeout: Duration,

    #[serde(default)]
    pub cert_file: TlsTrust,

    #[serde(default = "default_log_level")]
    pub log_level: u8,

    #[serde(default = "default_poll_fanout")]
    pub poll_fanout: NonZeroUsize,
    #[serde(default = "default_http_retries")]
    pub http_retries: u16,
    #[serde(default = "default_handoff_queue_capacity")]
    pub handoff_queue_capacity: NonZeroUsize,
}

/// TLS trust root, normalized per DESIGN NOTES §9: a string/bool hybrid in the
/// source is replaced with an explicit enum.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum TlsTrust {
    /// Use the operating system's trust store.
    #[default]
    System,
    /// Use the PEM bundle at this path as the sole trust root.
    Path(Utf8PathBuf),
    /// Accept any server certificate. Refused outside of debug builds.
    Insecure,
}

impl<'de> Deserialize<'de> for TlsTrust {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::from(raw.as_str()))
    }
}

impl From<&str> for TlsTrust {
    fn from(value: &str) -> Self {
        match value {
            "" => TlsTrust::System,
            "insecure" => TlsTrust::Insecure,
            path => TlsTrust::Path(Utf8PathBuf::from(path)),
        }
    }
}

impl TlsTrust {
    /// Refuse [`TlsTrust::Insecure`] outside of debug builds.
    pub fn validate_for_production(&self) -> anyhow::Result<()> {
        if matches!(self, TlsTrust::Insecure) && !cfg!(debug_assertions) {
            anyhow::bail!("GATEWAY_CERT_FILE=insecure is not allowed in release builds");
        }
        Ok(())
    }
}

fn default_scp_ip() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_scp_port() -> u16 {
    11112
}

fn default_scp_ae_title() -> AeTitle {
    AeTitle::from_static("GATEWAY")
}

fn default_max_pdu_length() -> usize {
    16384
}

fn default_daemon_run_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_timeout() -> Duration {
    Duration::from_secs(2 * 60 * 60)
}

fn default_log_level() -> u8 {
    1
}

fn default_poll_fanout() -> NonZeroUsize {
    NonZeroUsize::new(4).unwrap()
}

fn default_http_retries() -> u16 {
    3
}

fn default_handoff_queue_capacity() -> NonZeroUsize {
    NonZeroUsize::new(16).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_trust_from_str() {
        assert_eq!(TlsTrust::from(""), TlsTrust::System);
        assert_eq!(TlsTrust::from("insecure"), TlsTrust::Insecure);
        assert_eq!(
            TlsTrust::from("/etc/ssl/certs/ca.pem"),
            TlsTrust::Path(Utf8PathBuf::from("/etc/ssl/certs/ca.pem"))
        );
    }

    #[test]
    fn test_insecure_rejected_outside_debug() {
        let result = TlsTrust::Insecure.validate_for_production();
        if cfg!(debug_assertions) {
            assert!(result.is_ok());
        } else {
            assert!(result.is_err());
        }
    }
}
