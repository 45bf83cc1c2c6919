use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("sequence conflict")]
    Conflict,

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("patch path not allowed: {0}")]
    PatchPathNotAllowed(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Whether a raw sqlx error is the losing side of a write race: either
    /// the UNIQUE(project_id, sequence_number) violation, or SQLite refusing
    /// the write-lock upgrade of a transaction that read a stale snapshot.
    pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
        match err {
            sqlx::Error::Database(db) => {
                let msg = db.message();
                msg.contains("UNIQUE constraint failed") || msg.contains("database is locked")
            }
            _ => false,
        }
    }
}
