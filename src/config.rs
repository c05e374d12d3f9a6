//! Process configuration, read once from the environment at boot.
//! Mission: one immutable config struct, no runtime mutation once loaded.

use anyhow::{bail, Context, Result};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct CustodianConfig {
    pub name: String,
    pub client_id: String,
    pub client_secret: String,
    pub webhook_secret: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub environment: String,
    pub database_path: String,
    pub port: u16,
    pub broker_api_key: String,
    pub broker_api_secret: String,
    pub broker_base_url: String,
    pub custodians: Vec<CustodianConfig>,
    pub allowed_cors_origins: Vec<String>,
    pub jwt_signing_key: String,
    pub log_level: String,
    pub debug: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let environment =
            std::env::var("APP_ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let database_path =
            std::env::var("DATABASE_PATH").unwrap_or_else(|_| "./vp_core.db".to_string());

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("PORT must be a valid u16")?;

        let broker_api_key = std::env::var("BROKER_API_KEY").unwrap_or_default();
        let broker_api_secret = std::env::var("BROKER_API_SECRET").unwrap_or_default();
        let broker_base_url = std::env::var("BROKER_BASE_URL")
            .unwrap_or_else(|_| "https://broker.invalid".to_string());

        let custodians = Self::parse_custodians()?;

        let allowed_cors_origins = std::env::var("ALLOWED_CORS_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let jwt_signing_key = std::env::var("JWT_SIGNING_KEY")
            .unwrap_or_else(|_| "dev-only-insecure-signing-key-change-me!!".to_string());
        if jwt_signing_key.len() < 32 {
            bail!("JWT_SIGNING_KEY must be at least 32 bytes");
        }

        let log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let debug = std::env::var("DEBUG")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on"))
            .unwrap_or(false);
        // Debug flags are only honored outside production, per §6.
        let debug = debug && environment != "production";

        Ok(Self {
            environment,
            database_path,
            port,
            broker_api_key,
            broker_api_secret,
            broker_base_url,
            custodians,
            allowed_cors_origins,
            jwt_signing_key,
            log_level,
            debug,
        })
    }

    /// Custodians are configured as `CUSTODIAN_<NAME>_CLIENT_ID` /
    /// `_CLIENT_SECRET` / `_WEBHOOK_SECRET` triples; a name with no secret
    /// present is a configuration error per §6 ("missing secret is a
    /// configuration error, not a bypass").
    fn parse_custodians() -> Result<Vec<CustodianConfig>> {
        let names: Vec<String> = std::env::var("CUSTODIAN_NAMES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let env: HashMap<String, String> = std::env::vars().collect();
        let mut out = Vec::new();
        for name in names {
            let upper = name.to_uppercase();
            let client_id = env
                .get(&format!("CUSTODIAN_{upper}_CLIENT_ID"))
                .cloned()
                .with_context(|| format!("missing CUSTODIAN_{upper}_CLIENT_ID"))?;
            let client_secret = env
                .get(&format!("CUSTODIAN_{upper}_CLIENT_SECRET"))
                .cloned()
                .with_context(|| format!("missing CUSTODIAN_{upper}_CLIENT_SECRET"))?;
            let webhook_secret = env
                .get(&format!("CUSTODIAN_{upper}_WEBHOOK_SECRET"))
                .cloned()
                .with_context(|| format!("missing CUSTODIAN_{upper}_WEBHOOK_SECRET"))?;
            out.push(CustodianConfig {
                name,
                client_id,
                client_secret,
                webhook_secret,
            });
        }
        Ok(out)
    }

    pub fn is_production(&self) -> bool {
        self.environment == "production"
    }
}
