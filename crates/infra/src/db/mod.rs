//! Database bootstrap for the Postgres-backed stores.

pub mod schema;

use sqlx::PgPool;
use tracing::instrument;

/// Create every table and index the Postgres stores need. Safe to run on
/// every startup.
#[instrument(skip(pool), err)]
pub async fn migrate(pool: &PgPool) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;
    for statement in schema::ALL {
        sqlx::query(statement).execute(&mut *tx).await?;
    }
    tx.commit().await?;

    tracing::info!(statements = schema::ALL.len(), "database schema ensured");
    Ok(())
}

/// `true` when `err` is a Postgres unique violation (SQLSTATE 23505).
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}

/// The constraint a Postgres unique violation was raised on, if reported.
pub(crate) fn violated_constraint(err: &sqlx::Error) -> Option<&str> {
    match err {
        sqlx::Error::Database(db_err) if is_unique_violation(err) => db_err.constraint(),
        _ => None,
    }
}
