/// Configuration management
///
/// All settings load from `PDS_`-prefixed environment variables (with
/// `.env` support in dev). Secrets are validated at startup; a bad
/// configuration exits the process non-zero before anything binds.
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::error::{PdsError, PdsResult};

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub storage: StorageConfig,
    pub auth: AuthConfig,
    pub identity: IdentityConfig,
    pub invites: InviteConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub hostname: String,
    pub port: u16,
    pub service_did: String,
    pub version: String,
    /// Maximum accepted blob upload, bytes
    pub blob_upload_limit: usize,
    /// Dev mode loosens PLC registration and well-known probing
    pub dev_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_directory: PathBuf,
    pub account_db: PathBuf,
    pub sequencer_db: PathBuf,
    pub did_cache_db: PathBuf,
    pub actor_store_directory: PathBuf,
    pub blob_directory: PathBuf,
    pub identity_file_cache_directory: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret for session tokens
    pub jwt_secret: String,
    /// Basic-auth password for admin endpoints
    pub admin_password: String,
    /// Hex-encoded secp256k1 key for PLC rotation; required in production
    pub plc_rotation_key_hex: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityConfig {
    pub did_plc_url: String,
    /// Suffixes (leading dot) under which this server issues handles
    pub service_handle_domains: Vec<String>,
    /// Seconds before a cached identity is considered stale
    pub cache_stale_ttl_secs: u64,
    /// Seconds before a cached identity is unusable
    pub cache_max_ttl_secs: u64,
    /// Per-leg handle resolution timeout, seconds
    pub resolution_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InviteConfig {
    pub required: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> PdsResult<Self> {
        dotenv::dotenv().ok();

        let hostname = env_or("PDS_HOSTNAME", "localhost");
        let port = env_parse("PDS_PORT", 2583u16);
        let service_did = env::var("PDS_SERVICE_DID")
            .unwrap_or_else(|_| format!("did:web:{}", hostname));
        let dev_mode = env_parse("PDS_DEV_MODE", hostname == "localhost");

        let data_directory: PathBuf = env_or("PDS_DATA_DIRECTORY", "./data").into();
        let storage = StorageConfig {
            account_db: env::var("PDS_ACCOUNT_DB_LOCATION")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("account.sqlite")),
            sequencer_db: env::var("PDS_SEQUENCER_DB_LOCATION")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("sequencer.sqlite")),
            did_cache_db: env::var("PDS_DID_CACHE_DB_LOCATION")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("did_cache.sqlite")),
            actor_store_directory: env::var("PDS_ACTOR_STORE_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("actors")),
            blob_directory: env::var("PDS_BLOBSTORE_DISK_LOCATION")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("blobs")),
            identity_file_cache_directory: env::var("PDS_IDENTITY_CACHE_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|_| data_directory.join("identity_cache")),
            data_directory,
        };

        let jwt_secret = env::var("PDS_JWT_SECRET")
            .map_err(|_| PdsError::invalid_request("PDS_JWT_SECRET is required"))?;
        let admin_password = env::var("PDS_ADMIN_PASSWORD")
            .map_err(|_| PdsError::invalid_request("PDS_ADMIN_PASSWORD is required"))?;
        let plc_rotation_key_hex = env::var("PDS_PLC_ROTATION_KEY_K256_PRIVATE_KEY_HEX").ok();

        let service_handle_domains = env::var("PDS_SERVICE_HANDLE_DOMAINS")
            .unwrap_or_else(|_| format!(".{}", hostname))
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(ServerConfig {
            service: ServiceConfig {
                hostname,
                port,
                service_did,
                version: env!("CARGO_PKG_VERSION").to_string(),
                blob_upload_limit: env_parse("PDS_BLOB_UPLOAD_LIMIT", 5 * 1024 * 1024),
                dev_mode,
            },
            storage,
            auth: AuthConfig {
                jwt_secret,
                admin_password,
                plc_rotation_key_hex,
            },
            identity: IdentityConfig {
                did_plc_url: env_or("PDS_DID_PLC_URL", "https://plc.directory"),
                service_handle_domains,
                cache_stale_ttl_secs: env_parse("PDS_DID_CACHE_STALE_TTL", 3600),
                cache_max_ttl_secs: env_parse("PDS_DID_CACHE_MAX_TTL", 86400),
                resolution_timeout_secs: env_parse("PDS_HANDLE_RESOLUTION_TIMEOUT", 5),
            },
            invites: InviteConfig {
                required: env_parse("PDS_INVITE_REQUIRED", false),
            },
            logging: LoggingConfig {
                level: env_or("RUST_LOG", "info"),
            },
        })
    }

    /// Validate configuration before anything starts
    pub fn validate(&self) -> PdsResult<()> {
        if self.service.hostname.is_empty() {
            return Err(PdsError::invalid_request("Hostname cannot be empty"));
        }
        if self.auth.jwt_secret.len() < 32 {
            return Err(PdsError::invalid_request(
                "JWT secret must be at least 32 characters",
            ));
        }
        if self.auth.admin_password.is_empty() {
            return Err(PdsError::invalid_request("Admin password cannot be empty"));
        }
        if !self.service.dev_mode && self.auth.plc_rotation_key_hex.is_none() {
            return Err(PdsError::invalid_request(
                "PDS_PLC_ROTATION_KEY_K256_PRIVATE_KEY_HEX is required in production",
            ));
        }
        if self.identity.cache_stale_ttl_secs > self.identity.cache_max_ttl_secs {
            return Err(PdsError::invalid_request(
                "Identity cache stale TTL cannot exceed its max TTL",
            ));
        }
        Ok(())
    }

    pub fn public_url(&self) -> String {
        if self.service.dev_mode {
            format!("http://{}:{}", self.service.hostname, self.service.port)
        } else {
            format!("https://{}", self.service.hostname)
        }
    }
}

#[cfg(test)]
impl ServerConfig {
    /// Configuration rooted in a temp directory, for tests
    pub fn test_config(root: &std::path::Path) -> Self {
        ServerConfig {
            service: ServiceConfig {
                hostname: "localhost".to_string(),
                port: 2583,
                service_did: "did:web:localhost".to_string(),
                version: "0.0.0-test".to_string(),
                blob_upload_limit: 5 * 1024 * 1024,
                dev_mode: true,
            },
            storage: StorageConfig {
                data_directory: root.to_path_buf(),
                account_db: root.join("account.sqlite"),
                sequencer_db: root.join("sequencer.sqlite"),
                did_cache_db: root.join("did_cache.sqlite"),
                actor_store_directory: root.join("actors"),
                blob_directory: root.join("blobs"),
                identity_file_cache_directory: root.join("identity_cache"),
            },
            auth: AuthConfig {
                jwt_secret: "test-secret-test-secret-test-secret!".to_string(),
                admin_password: "admin-pass".to_string(),
                plc_rotation_key_hex: None,
            },
            identity: IdentityConfig {
                did_plc_url: "https://plc.directory".to_string(),
                service_handle_domains: vec![".test".to_string()],
                cache_stale_ttl_secs: 3600,
                cache_max_ttl_secs: 86400,
                resolution_timeout_secs: 5,
            },
            invites: InviteConfig { required: false },
            logging: LoggingConfig {
                level: "info".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_catches_short_secret() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::test_config(dir.path());
        assert!(config.validate().is_ok());
        config.auth.jwt_secret = "short".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_production_requires_rotation_key() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig::test_config(dir.path());
        config.service.dev_mode = false;
        assert!(config.validate().is_err());
        config.auth.plc_rotation_key_hex = Some("ab".repeat(32));
        assert!(config.validate().is_ok());
    }
}
