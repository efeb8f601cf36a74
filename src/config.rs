//! Declarative configuration for the image relay

use crate::backend::{FileStorage, HttpLoader, Loader, MemoryStorage, Storage};
use crate::error::{Result, RelayError};
use crate::options::{OrchestratorBuilder, Setting};
use crate::orchestrator::Orchestrator;
use crate::result_key::{DefaultResultKey, HashedResultKey};
use crate::signer::HmacSigner;
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;

/// Configuration for the relay service
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayConfig {
    /// Address the HTTP front end binds to (default: 0.0.0.0:8000)
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Verbose diagnostics: per-stage timings and DEBUG log level
    #[serde(default)]
    pub debug: bool,

    /// Accept `/unsafe/` requests without a signature (default: false)
    #[serde(default, rename = "unsafe")]
    pub allow_unsafe: bool,

    /// Secret for the HMAC request signer; signed requests fail without it
    #[serde(default)]
    pub secret: Option<String>,

    /// Truncate signatures to this many characters (0 = full length)
    #[serde(default)]
    pub signature_truncate: usize,

    /// Overall per-request deadline in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Per-stage deadlines in seconds (default: 20, capped by the request timeout)
    #[serde(default = "default_stage_timeout")]
    pub load_timeout_secs: u64,

    #[serde(default = "default_stage_timeout")]
    pub save_timeout_secs: u64,

    #[serde(default = "default_stage_timeout")]
    pub process_timeout_secs: u64,

    /// Max requests inside the processing stage (0 = unbounded)
    #[serde(default)]
    pub process_concurrency: usize,

    #[serde(default)]
    pub auto_webp: bool,

    #[serde(default)]
    pub auto_avif: bool,

    /// Cache-Control max-age in seconds (default: 7 days)
    #[serde(default = "default_cache_ttl")]
    pub cache_header_ttl_secs: u64,

    /// Cache-Control stale-while-revalidate in seconds (default: 1 day)
    #[serde(default = "default_cache_swr")]
    pub cache_header_swr_secs: u64,

    #[serde(default)]
    pub cache_header_no_cache: bool,

    #[serde(default)]
    pub modified_time_check: bool,

    #[serde(default)]
    pub result_key: ResultKeyConfig,

    #[serde(default)]
    pub disable_error_body: bool,

    /// Where `GET /` redirects to
    #[serde(default)]
    pub base_path_redirect: Option<String>,

    #[serde(default)]
    pub loaders: Vec<BackendConfig>,

    #[serde(default)]
    pub storages: Vec<BackendConfig>,

    #[serde(default)]
    pub result_storages: Vec<BackendConfig>,
}

/// Result-key strategy
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum ResultKeyConfig {
    #[default]
    Default,
    Hashed {
        #[serde(default)]
        with_extension: bool,
    },
}

/// A backend declaration
///
/// ```yaml
/// loaders:
///   - type: http
///     base_url: "https://origin.example.com/images"
///     max_retries: 2
/// result_storages:
///   - type: file
///     base_dir: /var/cache/image-relay
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendConfig {
    File {
        base_dir: String,
        /// Entries older than this are treated as absent (0 = never)
        #[serde(default)]
        expiration_secs: u64,
    },
    Http {
        #[serde(default)]
        base_url: Option<String>,
        /// Accept absolute `http(s)://` keys
        #[serde(default)]
        allow_absolute: bool,
        /// Reject bodies larger than this (0 = unlimited)
        #[serde(default)]
        max_body_bytes: u64,
        #[serde(default)]
        max_retries: usize,
    },
    Memory {
        /// Byte budget before LRU eviction (0 = unbounded)
        #[serde(default)]
        max_size_bytes: usize,
        /// Entry lifetime (0 = no expiry)
        #[serde(default)]
        ttl_secs: u64,
    },
}

impl BackendConfig {
    pub fn kind(&self) -> &'static str {
        match self {
            BackendConfig::File { .. } => "file",
            BackendConfig::Http { .. } => "http",
            BackendConfig::Memory { .. } => "memory",
        }
    }

    fn validate(&self, list: &str) -> Result<()> {
        match self {
            BackendConfig::File { base_dir, .. } if base_dir.is_empty() => Err(
                RelayError::ConfigError(format!("{}: file base_dir must not be empty", list)),
            ),
            BackendConfig::Http {
                base_url,
                allow_absolute,
                ..
            } => {
                if list != "loaders" {
                    return Err(RelayError::ConfigError(format!(
                        "{}: http backends can only be used as loaders",
                        list
                    )));
                }
                if base_url.as_deref().map_or(true, str::is_empty) && !allow_absolute {
                    return Err(RelayError::ConfigError(
                        "loaders: http loader needs base_url or allow_absolute".to_string(),
                    ));
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn build_loader(&self) -> Result<Arc<dyn Loader>> {
        match self {
            BackendConfig::Http {
                base_url,
                allow_absolute,
                max_body_bytes,
                max_retries,
            } => {
                let loader = match base_url {
                    Some(url) if !url.is_empty() => HttpLoader::new(url.clone())?,
                    _ => HttpLoader::absolute()?,
                };
                Ok(Arc::new(
                    loader
                        .with_allow_absolute(*allow_absolute)
                        .with_max_body_bytes(*max_body_bytes)
                        .with_retries(*max_retries),
                ))
            }
            BackendConfig::File {
                base_dir,
                expiration_secs,
            } => Ok(Arc::new(build_file(base_dir, *expiration_secs))),
            BackendConfig::Memory {
                max_size_bytes,
                ttl_secs,
            } => Ok(Arc::new(build_memory(*max_size_bytes, *ttl_secs))),
        }
    }

    fn build_storage(&self) -> Result<Arc<dyn Storage>> {
        match self {
            BackendConfig::File {
                base_dir,
                expiration_secs,
            } => Ok(Arc::new(build_file(base_dir, *expiration_secs))),
            BackendConfig::Memory {
                max_size_bytes,
                ttl_secs,
            } => Ok(Arc::new(build_memory(*max_size_bytes, *ttl_secs))),
            BackendConfig::Http { .. } => Err(RelayError::ConfigError(
                "http backends can only be used as loaders".to_string(),
            )),
        }
    }
}

fn build_file(base_dir: &str, expiration_secs: u64) -> FileStorage {
    FileStorage::new(base_dir).with_expiration(Duration::from_secs(expiration_secs))
}

fn build_memory(max_size_bytes: usize, ttl_secs: u64) -> MemoryStorage {
    let storage = MemoryStorage::new().with_ttl(Duration::from_secs(ttl_secs));
    if max_size_bytes > 0 {
        storage.with_max_size(max_size_bytes)
    } else {
        storage
    }
}

// Default value functions for serde
fn default_listen_address() -> String {
    "0.0.0.0:8000".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_stage_timeout() -> u64 {
    20
}

fn default_cache_ttl() -> u64 {
    7 * 24 * 3600 // 7 days
}

fn default_cache_swr() -> u64 {
    24 * 3600 // 1 day
}

impl Default for RelayConfig {
    fn default() -> Self {
        RelayConfig {
            listen_address: default_listen_address(),
            debug: false,
            allow_unsafe: false,
            secret: None,
            signature_truncate: 0,
            request_timeout_secs: default_request_timeout(),
            load_timeout_secs: default_stage_timeout(),
            save_timeout_secs: default_stage_timeout(),
            process_timeout_secs: default_stage_timeout(),
            process_concurrency: 0,
            auto_webp: false,
            auto_avif: false,
            cache_header_ttl_secs: default_cache_ttl(),
            cache_header_swr_secs: default_cache_swr(),
            cache_header_no_cache: false,
            modified_time_check: false,
            result_key: ResultKeyConfig::Default,
            disable_error_body: false,
            base_path_redirect: None,
            loaders: Vec::new(),
            storages: Vec::new(),
            result_storages: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// Load configuration from a YAML file
    ///
    /// # Returns
    /// * `Ok(RelayConfig)` if loading and validation succeed
    /// * `Err(RelayError)` if the file cannot be read or the config is invalid
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            RelayError::ConfigError(format!("Failed to read config file: {}", e))
        })?;
        Self::from_yaml(&content)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(content: &str) -> Result<Self> {
        let config: RelayConfig = serde_yaml::from_str(content).map_err(|e| {
            RelayError::ConfigError(format!("Failed to parse config file: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    ///
    /// # Validation Rules
    /// - listen_address must be a socket address
    /// - request_timeout_secs must be > 0
    /// - file backends need a base_dir
    /// - http backends are loaders only and need base_url or allow_absolute
    /// - base_path_redirect, when set, must not be empty
    pub fn validate(&self) -> Result<()> {
        self.listen_address.parse::<SocketAddr>().map_err(|e| {
            RelayError::ConfigError(format!(
                "listen_address '{}' is invalid: {}",
                self.listen_address, e
            ))
        })?;

        if self.request_timeout_secs == 0 {
            return Err(RelayError::ConfigError(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.process_concurrency > Semaphore::MAX_PERMITS {
            return Err(RelayError::ConfigError(format!(
                "process_concurrency must be at most {}",
                Semaphore::MAX_PERMITS
            )));
        }

        for backend in &self.loaders {
            backend.validate("loaders")?;
        }
        for backend in &self.storages {
            backend.validate("storages")?;
        }
        for backend in &self.result_storages {
            backend.validate("result_storages")?;
        }

        if let Some(redirect) = &self.base_path_redirect {
            if redirect.is_empty() {
                return Err(RelayError::ConfigError(
                    "base_path_redirect must not be empty when set".to_string(),
                ));
            }
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn socket_addr(&self) -> Result<SocketAddr> {
        self.listen_address
            .parse()
            .map_err(|e| RelayError::ConfigError(format!("listen_address: {}", e)))
    }

    /// The settings this configuration describes, in application order
    pub fn settings(&self) -> Result<Vec<Setting>> {
        self.validate()?;

        let mut settings = vec![
            Setting::RequestTimeout(Duration::from_secs(self.request_timeout_secs)),
            Setting::LoadTimeout(Duration::from_secs(self.load_timeout_secs)),
            Setting::SaveTimeout(Duration::from_secs(self.save_timeout_secs)),
            Setting::ProcessTimeout(Duration::from_secs(self.process_timeout_secs)),
            Setting::ProcessConcurrency(self.process_concurrency),
            Setting::Unsafe(self.allow_unsafe),
            Setting::AutoWebp(self.auto_webp),
            Setting::AutoAvif(self.auto_avif),
            Setting::CacheHeaderTtl(Duration::from_secs(self.cache_header_ttl_secs)),
            Setting::CacheHeaderSwr(Duration::from_secs(self.cache_header_swr_secs)),
            Setting::CacheHeaderNoCache(self.cache_header_no_cache),
            Setting::ModifiedTimeCheck(self.modified_time_check),
            Setting::DisableErrorBody(self.disable_error_body),
            Setting::Debug(self.debug),
        ];

        settings.push(match self.result_key {
            ResultKeyConfig::Default => Setting::ResultKey(Arc::new(DefaultResultKey)),
            ResultKeyConfig::Hashed { with_extension } => {
                Setting::ResultKey(Arc::new(HashedResultKey::new(with_extension)))
            }
        });

        if let Some(secret) = self.secret.as_deref().filter(|s| !s.is_empty()) {
            let signer = HmacSigner::new(secret).with_truncate(self.signature_truncate);
            settings.push(Setting::Signer(Arc::new(signer)));
        }

        if let Some(redirect) = &self.base_path_redirect {
            settings.push(Setting::BasePathRedirect(redirect.clone()));
        }

        for backend in &self.loaders {
            settings.push(Setting::Loader(backend.build_loader()?));
        }
        for backend in &self.storages {
            settings.push(Setting::Storage(backend.build_storage()?));
        }
        for backend in &self.result_storages {
            settings.push(Setting::ResultStorage(backend.build_storage()?));
        }

        Ok(settings)
    }

    /// A builder preloaded with this configuration
    ///
    /// Processors are not declarative; register them on the returned builder.
    pub fn orchestrator_builder(&self) -> Result<OrchestratorBuilder> {
        Ok(OrchestratorBuilder::new().apply(self.settings()?))
    }

    pub fn build_orchestrator(&self) -> Result<Orchestrator> {
        self.orchestrator_builder()?.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RelayConfig::default();
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.load_timeout_secs, 20);
        assert_eq!(config.cache_header_ttl_secs, 7 * 24 * 3600);
        assert_eq!(config.cache_header_swr_secs, 24 * 3600);
        assert_eq!(config.process_concurrency, 0);
        assert!(!config.allow_unsafe);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config = RelayConfig::from_yaml("{}").unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_validate_zero_request_timeout() {
        let config = RelayConfig {
            request_timeout_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_listen_address() {
        let config = RelayConfig {
            listen_address: "not an address".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_process_concurrency() {
        let config = RelayConfig {
            process_concurrency: Semaphore::MAX_PERMITS + 1,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("process_concurrency"));

        let config = RelayConfig {
            process_concurrency: Semaphore::MAX_PERMITS,
            ..Default::default()
        };
        assert!(config.validate().is_ok());

        let yaml = format!("process_concurrency: {}\n", usize::MAX);
        assert!(RelayConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_http_storage_rejected() {
        let config = RelayConfig {
            storages: vec![BackendConfig::Http {
                base_url: Some("http://origin".to_string()),
                allow_absolute: false,
                max_body_bytes: 0,
                max_retries: 0,
            }],
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("only be used as loaders"));
    }

    #[test]
    fn test_http_loader_needs_target() {
        let config = RelayConfig {
            loaders: vec![BackendConfig::Http {
                base_url: None,
                allow_absolute: false,
                max_body_bytes: 0,
                max_retries: 0,
            }],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_settings_order_and_backends() {
        let yaml = r#"
secret: "s3cret"
loaders:
  - type: memory
  - type: file
    base_dir: /tmp/originals
result_storages:
  - type: memory
    max_size_bytes: 1048576
    ttl_secs: 60
result_key:
  strategy: hashed
  with_extension: true
"#;
        let config = RelayConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.loaders.len(), 2);
        assert_eq!(config.loaders[1].kind(), "file");
        assert_eq!(
            config.result_key,
            ResultKeyConfig::Hashed {
                with_extension: true
            }
        );

        let builder = config.orchestrator_builder().unwrap();
        let settings = builder.settings();
        assert_eq!(settings.loaders.len(), 2);
        assert_eq!(settings.loaders[0].name(), "memory");
        assert_eq!(settings.loaders[1].name(), "file");
        assert_eq!(settings.result_storages.len(), 1);
        assert!(settings.signer.is_some());
    }
}
