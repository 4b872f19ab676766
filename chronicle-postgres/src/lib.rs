//! PostgreSQL-backed [`chronicle::EventStore`] and
//! [`chronicle::projection::ProjectionStore`]: one registry table mapping
//! real stream names to a hash-derived physical table, one per-stream table
//! holding its events, and a `projections` table for projection bookkeeping.

mod projection;
mod store;

pub use projection::PgProjectionStore;
pub use store::{Error, PgEventStore};

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Runs the embedded schema migrations (the `event_streams` and
/// `projections` registry tables) against `pool`. Per-stream tables are
/// created dynamically by [`PgEventStore::create`], not through a static
/// migration, since their name depends on the stream name's hash digest.
pub async fn migrate(
    pool: &bb8::Pool<bb8_postgres::PostgresConnectionManager<tokio_postgres::NoTls>>,
) -> anyhow::Result<()> {
    let mut conn = pool.get().await?;
    embedded::migrations::runner()
        .run_async(&mut *conn)
        .await?;
    Ok(())
}
