use thiserror::Error;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("{}", format_pg_error(.0))]
    Postgres(#[from] tokio_postgres::Error),

    #[error("pool build error: {0}")]
    Build(#[from] deadpool_postgres::BuildError),

    #[error("invalid connection string: {0}")]
    InvalidConnectionString(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("unknown entity type: {0}")]
    UnknownEntityType(String),

    #[error("failed to decode row for {entity_type}/{id}: {reason}")]
    RowDecode {
        entity_type: String,
        id: String,
        reason: String,
    },
}

fn format_pg_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = format!(
            "postgres error [{}]: {}",
            db_err.code().code(),
            db_err.message()
        );
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  detail: {detail}"));
        }
        if let Some(table) = db_err.table() {
            msg.push_str(&format!("\n  table: {table}"));
        }
        if let Some(constraint) = db_err.constraint() {
            msg.push_str(&format!("\n  constraint: {constraint}"));
        }
        msg
    } else {
        format!("postgres error: {e}")
    }
}
