//! Application configuration

use std::env;

use time::Duration;
use url::Url;

use crate::auth::{DevBypass, SessionPolicy};

/// Deployment environment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnv {
    Development,
    Production,
    Testing,
}

/// Where sessions are kept
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Application configuration loaded from environment variables
#[derive(Clone)]
pub struct Config {
    // Server
    pub bind_address: String,
    pub public_url: String,
    pub app_env: AppEnv,

    // Development bypass
    pub dev_auth_token: Option<String>,

    // Identity provider
    pub identity_provider_url: String,
    pub identity_provider_api_key: String,
    pub identity_jwt_secret: String,
    pub identity_jwt_audience: String,
    pub verifier_timeout_ms: u64,

    // Sessions
    pub session_backend: SessionBackend,
    pub redis_url: Option<String>,
    pub session_ttl_secs: i64,
    pub session_refresh_secs: i64,

    // Logging
    pub log_format: LogFormat,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        let public_url = env::var("PUBLIC_URL").unwrap_or_else(|_| "http://localhost:8080".to_string());
        if Url::parse(&public_url).is_err() {
            return Err(ConfigError::Invalid("PUBLIC_URL must be an absolute URL"));
        }

        let session_backend = match env::var("SESSION_BACKEND").as_deref() {
            Err(_) | Ok("memory") => SessionBackend::Memory,
            Ok("redis") => SessionBackend::Redis,
            Ok(_) => return Err(ConfigError::Invalid("SESSION_BACKEND must be 'memory' or 'redis'")),
        };
        let redis_url = non_empty_var("REDIS_URL");
        if session_backend == SessionBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing("REDIS_URL"));
        }

        let session_ttl_secs = env::var("SESSION_TTL_SECS")
            .unwrap_or_else(|_| "86400".to_string())
            .parse()
            .unwrap_or(86_400);
        let session_refresh_secs = env::var("SESSION_REFRESH_SECS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .unwrap_or(3_600);
        if session_ttl_secs <= 0 || session_refresh_secs <= 0 || session_refresh_secs >= session_ttl_secs {
            return Err(ConfigError::Invalid(
                "SESSION_REFRESH_SECS must be positive and below SESSION_TTL_SECS",
            ));
        }

        Ok(Self {
            // Server
            bind_address: env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
            public_url,
            app_env: match env::var("APP_ENV").as_deref() {
                Err(_) | Ok("production") => AppEnv::Production,
                Ok("development") => AppEnv::Development,
                Ok("testing") => AppEnv::Testing,
                Ok(_) => {
                    return Err(ConfigError::Invalid(
                        "APP_ENV must be 'development', 'production' or 'testing'",
                    ))
                }
            },

            dev_auth_token: match non_empty_var("DEV_AUTH_TOKEN") {
                Some(token) if token.len() < 16 => {
                    return Err(ConfigError::WeakSecret(
                        "DEV_AUTH_TOKEN must be at least 16 characters",
                    ))
                }
                other => other,
            },

            // Identity provider
            identity_provider_url: env::var("IDENTITY_PROVIDER_URL")
                .unwrap_or_else(|_| "https://identitytoolkit.googleapis.com".to_string()),
            identity_provider_api_key: env::var("IDENTITY_PROVIDER_API_KEY").unwrap_or_default(),
            identity_jwt_secret: {
                let secret = env::var("IDENTITY_JWT_SECRET").unwrap_or_default();
                if !secret.is_empty() && secret.len() < 32 {
                    return Err(ConfigError::WeakSecret(
                        "IDENTITY_JWT_SECRET must be at least 32 characters",
                    ));
                }
                secret
            },
            identity_jwt_audience: env::var("IDENTITY_JWT_AUDIENCE")
                .unwrap_or_else(|_| "authenticated".to_string()),
            verifier_timeout_ms: env::var("VERIFIER_TIMEOUT_MS")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .unwrap_or(3000),

            // Sessions
            session_backend,
            redis_url,
            session_ttl_secs,
            session_refresh_secs,

            // Logging
            log_format: match env::var("LOG_FORMAT").as_deref() {
                Ok("json") => LogFormat::Json,
                _ => LogFormat::Text,
            },
        })
    }

    pub fn is_development(&self) -> bool {
        self.app_env == AppEnv::Development
    }

    /// Cookies get `Secure` when the site is served over https
    pub fn secure_cookies(&self) -> bool {
        self.public_url.starts_with("https://")
    }

    /// Host of the public URL, for same-site referer checks
    pub fn public_host(&self) -> Option<String> {
        Url::parse(&self.public_url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_lowercase))
    }

    pub fn session_policy(&self) -> SessionPolicy {
        SessionPolicy {
            ttl: Duration::seconds(self.session_ttl_secs),
            refresh_after: Duration::seconds(self.session_refresh_secs),
        }
    }

    pub fn verifier_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.verifier_timeout_ms)
    }

    /// The development bypass, only outside production-like environments
    pub fn dev_bypass(&self) -> Option<DevBypass> {
        match (&self.dev_auth_token, self.is_development()) {
            (Some(token), true) => Some(DevBypass::new(token.clone())),
            (Some(_), false) => {
                tracing::warn!("DEV_AUTH_TOKEN is set but ignored outside development");
                None
            }
            (None, _) => None,
        }
    }
}

// Secrets stay out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("public_url", &self.public_url)
            .field("app_env", &self.app_env)
            .field("dev_auth_token", &self.dev_auth_token.as_ref().map(|_| "<redacted>"))
            .field("identity_provider_url", &self.identity_provider_url)
            .field("identity_provider_api_key", &(!self.identity_provider_api_key.is_empty()))
            .field("identity_jwt_secret", &(!self.identity_jwt_secret.is_empty()))
            .field("identity_jwt_audience", &self.identity_jwt_audience)
            .field("verifier_timeout_ms", &self.verifier_timeout_ms)
            .field("session_backend", &self.session_backend)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("session_refresh_secs", &self.session_refresh_secs)
            .field("log_format", &self.log_format)
            .finish()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
    #[error("Weak secret: {0}")]
    WeakSecret(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const VARS: &[&str] = &[
        "BIND_ADDRESS",
        "PUBLIC_URL",
        "APP_ENV",
        "DEV_AUTH_TOKEN",
        "IDENTITY_PROVIDER_URL",
        "IDENTITY_PROVIDER_API_KEY",
        "IDENTITY_JWT_SECRET",
        "IDENTITY_JWT_AUDIENCE",
        "VERIFIER_TIMEOUT_MS",
        "SESSION_BACKEND",
        "REDIS_URL",
        "SESSION_TTL_SECS",
        "SESSION_REFRESH_SECS",
        "LOG_FORMAT",
    ];

    /// Helper to clear env vars before and after tests
    fn cleanup_config() {
        for var in VARS {
            env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        cleanup_config();
        let config = Config::from_env().unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:8080");
        assert_eq!(config.app_env, AppEnv::Production);
        assert_eq!(config.session_backend, SessionBackend::Memory);
        assert_eq!(config.session_policy(), SessionPolicy::default());
        assert_eq!(config.verifier_timeout(), std::time::Duration::from_millis(3000));
        assert_eq!(config.public_host().as_deref(), Some("localhost"));
        assert!(!config.secure_cookies());
        assert!(config.dev_bypass().is_none());
        assert_eq!(config.log_format, LogFormat::Text);
    }

    #[test]
    #[serial]
    fn test_dev_bypass_only_in_development() {
        cleanup_config();
        env::set_var("DEV_AUTH_TOKEN", "dev-secret-token-123");

        let config = Config::from_env().unwrap();
        assert!(config.dev_bypass().is_none());

        env::set_var("APP_ENV", "development");
        let config = Config::from_env().unwrap();
        assert!(config.dev_bypass().is_some_and(|b| b.matches("dev-secret-token-123")));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_weak_secrets_rejected() {
        cleanup_config();

        env::set_var("DEV_AUTH_TOKEN", "short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));
        env::remove_var("DEV_AUTH_TOKEN");

        env::set_var("IDENTITY_JWT_SECRET", "too-short");
        assert!(matches!(Config::from_env(), Err(ConfigError::WeakSecret(_))));

        env::set_var("IDENTITY_JWT_SECRET", "a-secret-that-is-at-least-32-characters");
        assert!(Config::from_env().is_ok());

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_invalid_values_rejected() {
        cleanup_config();

        env::set_var("APP_ENV", "staging");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));
        env::remove_var("APP_ENV");

        env::set_var("SESSION_BACKEND", "memcached");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));
        env::remove_var("SESSION_BACKEND");

        env::set_var("SESSION_REFRESH_SECS", "90000");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));
        env::remove_var("SESSION_REFRESH_SECS");

        env::set_var("PUBLIC_URL", "not a url");
        assert!(matches!(Config::from_env(), Err(ConfigError::Invalid(_))));

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_redis_backend_requires_url() {
        cleanup_config();
        env::set_var("SESSION_BACKEND", "redis");
        assert!(matches!(Config::from_env(), Err(ConfigError::Missing("REDIS_URL"))));

        env::set_var("REDIS_URL", "redis://localhost:6379");
        let config = Config::from_env().unwrap();
        assert_eq!(config.session_backend, SessionBackend::Redis);

        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_https_public_url() {
        cleanup_config();
        env::set_var("PUBLIC_URL", "https://Huerto.App");
        let config = Config::from_env().unwrap();
        assert!(config.secure_cookies());
        assert_eq!(config.public_host().as_deref(), Some("huerto.app"));
        cleanup_config();
    }

    #[test]
    #[serial]
    fn test_debug_redacts_secrets() {
        cleanup_config();
        env::set_var("IDENTITY_JWT_SECRET", "a-secret-that-is-at-least-32-characters");
        let config = Config::from_env().unwrap();
        assert!(!format!("{:?}", config).contains("a-secret-that"));
        cleanup_config();
    }
}
