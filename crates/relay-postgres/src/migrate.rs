use anyhow::Context;
use sqlx::PgPool;

/// Run the substrate migrations against one database.
///
/// Hosts that gate dispatch on schema readiness run this first and then
/// flip the polling loop's ready signal.
pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("run relay migrations")?;
    tracing::info!(event = "relay.migrate.complete", "migrations complete");
    Ok(())
}
