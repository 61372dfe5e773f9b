use serde::Deserialize;
use std::env;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Mongo,
    Memory,
}

impl StorageBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageBackend::Mongo => "mongo",
            StorageBackend::Memory => "memory",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub resources_url: String,
    pub python_sandbox_url: String,
    pub script_sandbox_url: String,
    pub sandbox_timeout_secs: u64,
    pub storage_backend: StorageBackend,
    pub server_addr: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        let env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let lookup = |key: &str, var: &str, default: &str| -> String {
            settings
                .get_string(key)
                .or_else(|_| env::var(var))
                .unwrap_or_else(|_| default.to_string())
        };

        let mongo_uri = lookup("database.mongo_uri", "MONGO_URI", "mongodb://localhost:27017");
        let mongo_database = lookup("database.mongo_database", "MONGO_DATABASE", "player");
        let redis_uri = lookup("redis.uri", "REDIS_URI", "redis://127.0.0.1:6379/0");

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let resources_url = lookup("resources.url", "RESOURCES_API_URL", "http://localhost:8000");
        let python_sandbox_url =
            lookup("sandbox.python_url", "PYTHON_SANDBOX_URL", "http://localhost:7000");
        let script_sandbox_url =
            lookup("sandbox.script_url", "SCRIPT_SANDBOX_URL", "http://localhost:7001");

        let sandbox_timeout_secs = lookup("sandbox.timeout_secs", "SANDBOX_TIMEOUT_SECS", "60")
            .parse::<u64>()
            .ok()
            .filter(|secs| *secs > 0)
            .unwrap_or(60);

        let storage_backend = match lookup("storage.backend", "STORAGE_BACKEND", "mongo")
            .to_lowercase()
            .as_str()
        {
            "mongo" => StorageBackend::Mongo,
            "memory" => StorageBackend::Memory,
            other => {
                return Err(config::ConfigError::Message(format!(
                    "Unknown storage backend: {}",
                    other
                )))
            }
        };

        let server_addr = lookup("server.addr", "SERVER_ADDR", "0.0.0.0:8081");

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            resources_url,
            python_sandbox_url,
            script_sandbox_url,
            sandbox_timeout_secs,
            storage_backend,
            server_addr,
        })
    }

    /// Settings for single-process runs and tests: in-memory storage, local endpoints.
    pub fn local(jwt_secret: &str) -> Self {
        Config {
            mongo_uri: "mongodb://localhost:27017".to_string(),
            redis_uri: "redis://127.0.0.1:6379/0".to_string(),
            mongo_database: "player".to_string(),
            jwt_secret: jwt_secret.to_string(),
            resources_url: "http://localhost:8000".to_string(),
            python_sandbox_url: "http://localhost:7000".to_string(),
            script_sandbox_url: "http://localhost:7001".to_string(),
            sandbox_timeout_secs: 60,
            storage_backend: StorageBackend::Memory,
            server_addr: "127.0.0.1:0".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn defaults_apply_without_overrides() {
        env::set_var("SKIP_ROOT_ENV", "1");
        env::remove_var("SANDBOX_TIMEOUT_SECS");
        env::remove_var("STORAGE_BACKEND");
        env::remove_var("APP_ENV");

        let config = Config::load().unwrap();
        assert_eq!(config.sandbox_timeout_secs, 60);
        assert_eq!(config.storage_backend, StorageBackend::Mongo);
    }

    #[test]
    #[serial]
    fn env_fallback_overrides_defaults() {
        env::set_var("SKIP_ROOT_ENV", "1");
        env::set_var("SANDBOX_TIMEOUT_SECS", "5");
        env::set_var("STORAGE_BACKEND", "memory");

        let config = Config::load().unwrap();
        assert_eq!(config.sandbox_timeout_secs, 5);
        assert_eq!(config.storage_backend, StorageBackend::Memory);

        env::remove_var("SANDBOX_TIMEOUT_SECS");
        env::remove_var("STORAGE_BACKEND");
    }

    #[test]
    #[serial]
    fn missing_secret_fails_in_prod() {
        env::set_var("SKIP_ROOT_ENV", "1");
        env::set_var("APP_ENV", "prod");
        env::remove_var("JWT_SECRET");

        let result = Config::load();
        env::remove_var("APP_ENV");
        assert!(result.is_err());
    }
}
