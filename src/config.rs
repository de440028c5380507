use anyhow::{Context, Result};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
};

use crate::photo::{PhotoResolver, PLACEHOLDER_SENTINEL};

pub const DEFAULT_BIND: &str = "0.0.0.0:8000";

/// Runtime settings, read from the environment (and `.env`).
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub bind: SocketAddr,
    pub db_path: PathBuf,
    /// Prefix for relative photo paths. Relative photos are dropped when unset.
    pub api_base_url: Option<String>,
    pub photo_sentinels: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bind = get("HERMES_BIND").unwrap_or_else(|| DEFAULT_BIND.to_string());
        let bind = bind
            .parse::<SocketAddr>()
            .with_context(|| format!("Invalid HERMES_BIND address: {bind}"))?;

        // We use ~/.hermes/hermes.db unless told otherwise
        let db_path = get("HERMES_DB_PATH").map(PathBuf::from).unwrap_or_else(|| {
            let home = get("HOME").unwrap_or_else(|| ".".into());
            Path::new(&home).join(".hermes").join("hermes.db")
        });

        let api_base_url = get("HERMES_API_BASE_URL").or_else(|| get("API_BASE_URL"));

        let photo_sentinels = match get("HERMES_PHOTO_SENTINELS") {
            Some(list) => list
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            None => vec![PLACEHOLDER_SENTINEL.to_string()],
        };

        Ok(Self {
            bind,
            db_path,
            api_base_url,
            photo_sentinels,
        })
    }

    pub fn photo_resolver(&self) -> PhotoResolver {
        PhotoResolver::new(self.api_base_url.clone()).with_sentinels(self.photo_sentinels.clone())
    }
}
