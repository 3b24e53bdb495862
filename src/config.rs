use std::net::SocketAddr;

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub access_secret: String,
    pub refresh_secret: String,
    pub issuer: String,
    pub audience: String,
    pub access_ttl_minutes: i64,
    pub refresh_ttl_minutes: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    pub endpoint: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    /// Base URL objects are publicly served from, e.g. `https://cdn.example.com/media`.
    pub public_base_url: String,
}

/// Argon2id work factor.
#[derive(Debug, Clone, Deserialize)]
pub struct PasswordConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for PasswordConfig {
    fn default() -> Self {
        Self {
            memory_kib: argon2::Params::DEFAULT_M_COST,
            iterations: argon2::Params::DEFAULT_T_COST,
            parallelism: argon2::Params::DEFAULT_P_COST,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub database_url: String,
    pub jwt: JwtConfig,
    pub storage: StorageConfig,
    pub password: PasswordConfig,
    pub upload_tmp_dir: String,
    pub host: String,
    pub port: u16,
}

impl AppConfig {
    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("invalid APP_HOST/APP_PORT: {}:{}", self.host, self.port))
    }

    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(get: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> anyhow::Result<String> {
            get(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| anyhow::anyhow!("missing required environment variable: {key}"))
        };
        let parse_or = |key: &str, default: i64| -> i64 {
            get(key)
                .and_then(|v| v.parse::<i64>().ok())
                .unwrap_or(default)
        };
        let parse_u32_or = |key: &str, default: u32| -> u32 {
            get(key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(default)
        };

        let database_url = required("DATABASE_URL")?;

        let jwt = JwtConfig {
            access_secret: required("ACCESS_TOKEN_SECRET")?,
            refresh_secret: required("REFRESH_TOKEN_SECRET")?,
            issuer: get("JWT_ISSUER").unwrap_or_else(|| "accounts".into()),
            audience: get("JWT_AUDIENCE").unwrap_or_else(|| "accounts-users".into()),
            access_ttl_minutes: parse_or("ACCESS_TOKEN_TTL_MINUTES", 60 * 24),
            refresh_ttl_minutes: parse_or("REFRESH_TOKEN_TTL_MINUTES", 60 * 24 * 10),
        };

        // Storage credentials are all-or-nothing: report every missing one at once.
        let storage_keys = [
            "STORAGE_ENDPOINT",
            "STORAGE_BUCKET",
            "STORAGE_ACCESS_KEY",
            "STORAGE_SECRET_KEY",
            "STORAGE_PUBLIC_URL",
        ];
        let missing: Vec<&str> = storage_keys
            .iter()
            .copied()
            .filter(|k| get(k).map_or(true, |v| v.trim().is_empty()))
            .collect();
        if !missing.is_empty() {
            anyhow::bail!(
                "missing required environment variables: {}",
                missing.join(", ")
            );
        }
        let storage = StorageConfig {
            endpoint: required("STORAGE_ENDPOINT")?,
            bucket: required("STORAGE_BUCKET")?,
            access_key: required("STORAGE_ACCESS_KEY")?,
            secret_key: required("STORAGE_SECRET_KEY")?,
            region: get("STORAGE_REGION").unwrap_or_else(|| "us-east-1".into()),
            public_base_url: required("STORAGE_PUBLIC_URL")?,
        };

        let defaults = PasswordConfig::default();
        let password = PasswordConfig {
            memory_kib: parse_u32_or("PASSWORD_MEMORY_KIB", defaults.memory_kib),
            iterations: parse_u32_or("PASSWORD_ITERATIONS", defaults.iterations),
            parallelism: parse_u32_or("PASSWORD_PARALLELISM", defaults.parallelism),
        };

        let upload_tmp_dir = get("UPLOAD_TMP_DIR").unwrap_or_else(|| "./public/temp".into());
        let host = get("APP_HOST").unwrap_or_else(|| "0.0.0.0".into());
        let port = match get("APP_PORT") {
            Some(raw) => raw
                .trim()
                .parse::<u16>()
                .with_context(|| format!("APP_PORT is not a port number: {raw}"))?,
            None => 8080,
        };

        Ok(Self {
            database_url,
            jwt,
            storage,
            password,
            upload_tmp_dir,
            host,
            port,
        })
    }
}
