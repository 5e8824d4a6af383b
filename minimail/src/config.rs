use crate::error::{MailError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::warn;

/// Example configuration written next to the binary when no config file is
/// found, so a fresh install has something to edit.
pub const EXAMPLE_CONFIG: &str = r#"[general]
# Host name announced in greetings and EHLO/HELO exchanges
server_address = ""
# Domain considered local; senders and recipients under it are ours
mail_domain = ""
mail_storage_path = "./mail"
cache_path = "./cache"

[smtp.inbound]
enable_plain = true
plain_listen_addr = "0.0.0.0:25"
plain_enable_starttls = false
starttls_cert_path = ""
starttls_key_path = ""
enable_tls = false
tls_listen_addr = "0.0.0.0:465"
tls_cert_path = ""
tls_key_path = ""

[smtp.outbound]
remote_connect_retry_times = 5
remote_connect_timeout_ms = 500
enable_dkim = false
dkim_private_key_pem_path = ""
dkim_domain = ""
dkim_selector = ""

[pop3]
enable_plain = true
plain_listen_addr = "0.0.0.0:110"
plain_enable_starttls = false
starttls_cert_path = ""
starttls_key_path = ""
enable_tls = false
tls_listen_addr = "0.0.0.0:995"
tls_cert_path = ""
tls_key_path = ""

[auth]
# Created automatically if missing
database_url = "sqlite://accounts.db?mode=rwc"
"#;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub general: GeneralConfig,
    pub smtp: SmtpConfig,
    pub pop3: ListenerConfig,
    pub auth: AuthConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralConfig {
    pub server_address: String,
    pub mail_domain: String,
    pub mail_storage_path: String,
    pub cache_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SmtpConfig {
    pub inbound: ListenerConfig,
    pub outbound: OutboundConfig,
}

/// Listener settings shared by the SMTP and POP3 front ends: an optional
/// plaintext listener (STARTTLS-capable when certificates are given) and an
/// optional implicit-TLS listener.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub enable_plain: bool,
    pub plain_listen_addr: String,
    #[serde(default)]
    pub plain_enable_starttls: bool,
    #[serde(default)]
    pub starttls_cert_path: String,
    #[serde(default)]
    pub starttls_key_path: String,
    #[serde(default)]
    pub enable_tls: bool,
    #[serde(default)]
    pub tls_listen_addr: String,
    #[serde(default)]
    pub tls_cert_path: String,
    #[serde(default)]
    pub tls_key_path: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutboundConfig {
    #[serde(default)]
    pub remote_connect_retry_times: u32,
    #[serde(default)]
    pub remote_connect_timeout_ms: u64,
    #[serde(default)]
    pub enable_dkim: bool,
    #[serde(default)]
    pub dkim_private_key_pem_path: String,
    #[serde(default)]
    pub dkim_domain: String,
    #[serde(default)]
    pub dkim_selector: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    pub database_url: String,
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| MailError::Config(format!("read config file: {}", e)))?;

        toml::from_str(&content).map_err(|e| MailError::Config(e.to_string()))
    }

    /// Check mandatory settings and fill defaults.
    ///
    /// Missing general settings are fatal; everything listener- or
    /// feature-specific degrades later (at bind or key-load time) with a
    /// warning instead of aborting startup.
    pub fn validate(&mut self) -> Result<()> {
        if self.general.server_address.is_empty() {
            return Err(MailError::Config(
                "general.server_address is required".to_string(),
            ));
        }
        if self.general.mail_domain.is_empty() {
            return Err(MailError::Config(
                "general.mail_domain is required".to_string(),
            ));
        }
        if self.general.mail_storage_path.is_empty() {
            return Err(MailError::Config(
                "general.mail_storage_path is required".to_string(),
            ));
        }
        if self.general.cache_path.is_empty() {
            return Err(MailError::Config("general.cache_path is required".to_string()));
        }

        if self.smtp.outbound.remote_connect_retry_times == 0 {
            warn!("smtp.outbound.remote_connect_retry_times is 0, using default 5");
            self.smtp.outbound.remote_connect_retry_times = 5;
        }
        if self.smtp.outbound.remote_connect_timeout_ms == 0 {
            warn!("smtp.outbound.remote_connect_timeout_ms is 0, using default 500");
            self.smtp.outbound.remote_connect_timeout_ms = 500;
        }

        Ok(())
    }
}
