use anyhow::{bail, Context};
use sea_orm_migration::MigratorTrait;
use tracing::info;

use gasdesk_api::{config, db, migrator::Migrator};

/// Applies or inspects the schema for the configured database.
///
/// Usage: `migration [up|down|fresh|status]`, defaulting to `up`.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = config::load_config().context("failed to load configuration")?;
    config::init_tracing(cfg.log_level(), cfg.log_json);

    let pool = db::establish_connection_from_app_config(&cfg)
        .await
        .context("failed to connect to the database")?;

    let command = std::env::args().nth(1).unwrap_or_else(|| "up".to_string());
    match command.as_str() {
        "up" => db::run_migrations(&pool).await?,
        "down" => {
            Migrator::down(&pool, Some(1))
                .await
                .context("rolling back the last migration")?;
            info!("Rolled back the last migration");
        }
        "fresh" => {
            if cfg.is_production() {
                bail!("refusing to drop all tables in production");
            }
            Migrator::fresh(&pool)
                .await
                .context("recreating the schema")?;
            info!("Schema dropped and recreated");
        }
        "status" => Migrator::status(&pool)
            .await
            .context("reading migration status")?,
        other => bail!("unknown command `{other}`; expected up, down, fresh or status"),
    }

    db::close_pool(pool).await?;
    Ok(())
}
