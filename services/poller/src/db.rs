use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

/// Pool that defers connecting until first use; state writes fail soft and
/// the next tick retries, so the poller can start before Postgres is up.
pub fn create_lazy_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new().max_connections(10).connect_lazy(database_url)
}
