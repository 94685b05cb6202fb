use std::sync::Arc;

use anyhow::Result;
use diesel_migrations::{EmbeddedMigrations, embed_migrations};
use tastebud_foodservice::{
    build_app, consumers,
    platform::{app_state::AppState, bootstrap, config, db, outbox},
};

/// Migrations embedded into the binary which helps with streamlining image building process
const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

#[tokio::main]
async fn main() -> Result<()> {
    bootstrap::init_tracing();
    bootstrap::init_env();

    let config = config::load()?;

    tracing::info!("Running migrations...");
    let migrations_count = db::run_migrations_blocking(MIGRATIONS, &config.database.url).await?;
    tracing::info!("Run {} new migrations successfully", migrations_count);

    let db_pool = db::create_pool(&config.database).await?;
    let addr = config.server.socket_addr();
    let poll_interval = config.notifications.poll_interval;
    let state = AppState::new(db_pool, config)?;

    tracing::info!("Starting outbox dispatcher...");
    tokio::spawn(outbox::run_dispatcher(
        Arc::new(state.clone()),
        consumers::HANDLERS,
        poll_interval,
    ));

    tracing::info!("Bootstrapping...");
    let app = build_app(state)?;
    bootstrap::serve("FoodService", app, addr).await
}
