use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Client;

use crate::platform::{aliases::DbPool, config::AppConfig};

/// Shared handles every handler receives through `State`.
#[derive(Clone)]
pub struct AppState {
    pub db_pool: DbPool,
    pub http_client: Client,
    pub config: Arc<AppConfig>,
}

impl AppState {
    pub fn new(db_pool: DbPool, config: AppConfig) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            db_pool,
            http_client,
            config: Arc::new(config),
        })
    }
}
