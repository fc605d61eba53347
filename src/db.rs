use eyre::{Context, Result};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Builds the bounded connection pool shared by candidate selection and settlement (spec §5:
/// "database connection pool (bounded, e.g. 20)").
pub async fn connect(database_url: &str, max_connections: u32) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await
        .wrap_err("failed to connect to the settlement database")
}
