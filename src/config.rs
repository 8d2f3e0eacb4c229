//! Configuration management for the PBX core
//!
//! Primary format is YAML (`serde_yaml`); a `config::Environment` overlay
//! with a fixed prefix layers deployment-time overrides on top of a loaded
//! file, matching the approach the wider stack uses for its TOML config.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PbxConfig {
    pub server: ServerConfig,
    pub dialplan: DialplanConfig,
    pub voicemail: VoicemailConfig,
    pub features: FeaturesConfig,
    pub trunk: TrunkConfig,
    pub lcr: LcrConfig,
    pub logging: LoggingConfig,
    #[serde(default)]
    pub database: serde_yaml::Value,
    #[serde(default)]
    pub api: serde_yaml::Value,
    #[serde(default)]
    pub security: serde_yaml::Value,
    #[serde(default)]
    pub extensions: Vec<ExtensionConfig>,
}

/// Transport binding and advertised IP (§6 `server` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub sip_host: String,
    pub sip_port: u16,
    pub sip_transport: SipTransport,
    pub rtp_port_range_start: u16,
    pub rtp_port_range_end: u16,
    pub external_ip: Option<String>,
    pub max_concurrent_calls: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum SipTransport {
    #[serde(rename = "udp")]
    Udp,
    #[serde(rename = "tcp")]
    Tcp,
    #[serde(rename = "tls")]
    Tls,
}

/// Dial-plan patterns (§4.6, §6 `dialplan` section). All are regular
/// expressions evaluated in order; the router returns the first match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DialplanConfig {
    pub internal_pattern: String,
    pub conference_pattern: String,
    pub voicemail_pattern: String,
    pub parking_pattern: String,
    pub paging_prefix: String,
    pub emergency_numbers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoicemailConfig {
    pub no_answer_timeout: u32,
    pub storage_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    pub dtmf: DtmfConfig,
    pub dns_srv_failover: DnsSrvFailoverConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtmfConfig {
    /// Negotiated RFC 2833 telephone-event payload type, 96-127.
    pub payload_type: u8,
}

impl Default for DtmfConfig {
    fn default() -> Self {
        Self { payload_type: 101 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsSrvFailoverConfig {
    pub enabled: bool,
    pub check_interval: u32,
    pub max_failures: u32,
}

impl Default for DnsSrvFailoverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            check_interval: 30,
            max_failures: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkConfig {
    #[serde(default)]
    pub trunks: Vec<TrunkEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrunkEntry {
    pub id: String,
    pub domain: String,
    pub transport: SipTransport,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LcrConfig {
    pub enabled: bool,
}

impl Default for LcrConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
    pub max_size: u64,
    pub max_files: u32,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogFormat {
    #[serde(rename = "json")]
    Json,
    #[serde(rename = "compact")]
    Compact,
    #[serde(rename = "full")]
    Full,
}

/// Static extension definition (§6 `extensions[]` section).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtensionConfig {
    pub number: String,
    pub name: String,
    pub password: String,
    pub voicemail_pin: Option<String>,
    pub email: Option<String>,
    #[serde(default)]
    pub allow_external: bool,
    #[serde(default)]
    pub is_admin: bool,
}

impl PbxConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: PbxConfig = serde_yaml::from_str(&contents)?;
        Ok(config)
    }

    pub fn load_from_env() -> Result<Self> {
        let settings = config::Config::builder().add_source(
            config::Environment::with_prefix("REDFIRE_PBX").separator("_"),
        );

        let config = settings.build()?;
        let pbx_config = config.try_deserialize()?;
        Ok(pbx_config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.rtp_port_range_start >= self.server.rtp_port_range_end {
            return Err(Error::parse("Invalid RTP port range"));
        }
        if self.server.rtp_port_range_start % 2 != 0 {
            return Err(Error::parse("RTP port range must start on an even port"));
        }

        for (name, pattern) in [
            ("internal_pattern", &self.dialplan.internal_pattern),
            ("conference_pattern", &self.dialplan.conference_pattern),
            ("voicemail_pattern", &self.dialplan.voicemail_pattern),
            ("parking_pattern", &self.dialplan.parking_pattern),
        ] {
            regex::Regex::new(pattern)
                .map_err(|e| Error::parse(format!("Invalid dial-plan pattern {name}: {e}")))?;
        }

        if !(96..=127).contains(&(self.features.dtmf.payload_type as u16)) {
            return Err(Error::parse("DTMF payload type must be in range 96-127"));
        }

        Ok(())
    }

    pub fn default_config() -> Self {
        Self {
            server: ServerConfig {
                sip_host: "0.0.0.0".to_string(),
                sip_port: 5060,
                sip_transport: SipTransport::Udp,
                rtp_port_range_start: 10000,
                rtp_port_range_end: 20000,
                external_ip: None,
                max_concurrent_calls: 500,
            },
            dialplan: DialplanConfig {
                internal_pattern: r"^1\d{3}$".to_string(),
                conference_pattern: r"^2\d{3}$".to_string(),
                voicemail_pattern: r"^\*\d{3}$".to_string(),
                parking_pattern: r"^70\d{2}$".to_string(),
                paging_prefix: "7".to_string(),
                emergency_numbers: vec!["911".to_string(), "112".to_string()],
            },
            voicemail: VoicemailConfig {
                no_answer_timeout: 30,
                storage_path: "/var/lib/redfire-pbx/voicemail".to_string(),
            },
            features: FeaturesConfig {
                dtmf: DtmfConfig::default(),
                dns_srv_failover: DnsSrvFailoverConfig::default(),
            },
            trunk: TrunkConfig { trunks: vec![] },
            lcr: LcrConfig::default(),
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("/var/log/redfire-pbx/pbx.log".to_string()),
                max_size: 100 * 1024 * 1024,
                max_files: 10,
                format: LogFormat::Json,
            },
            database: serde_yaml::Value::Null,
            api: serde_yaml::Value::Null,
            security: serde_yaml::Value::Null,
            extensions: vec![
                ExtensionConfig {
                    number: "1001".to_string(),
                    name: "Extension 1001".to_string(),
                    password: "changeme".to_string(),
                    voicemail_pin: None,
                    email: None,
                    allow_external: true,
                    is_admin: false,
                },
                ExtensionConfig {
                    number: "1002".to_string(),
                    name: "Extension 1002".to_string(),
                    password: "changeme".to_string(),
                    voicemail_pin: None,
                    email: None,
                    allow_external: true,
                    is_admin: false,
                },
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = PbxConfig::default_config();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_port_range_rejected() {
        let mut config = PbxConfig::default_config();
        config.server.rtp_port_range_start = 20000;
        config.server.rtp_port_range_end = 10000;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_odd_start_port_rejected() {
        let mut config = PbxConfig::default_config();
        config.server.rtp_port_range_start = 10001;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_dialplan_pattern_rejected() {
        let mut config = PbxConfig::default_config();
        config.dialplan.internal_pattern = "(unterminated".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = PbxConfig::default_config();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: PbxConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.server.sip_port, config.server.sip_port);
    }
}
