use thiserror::Error;

#[derive(Error, Debug)]
pub enum SQLError {
    #[error("query error: {0}")]
    Query(String),

    #[error("execution error: {0}")]
    Execution(String),

    /// The transaction body failed and everything it wrote was rolled back.
    #[error("transaction aborted: {0}")]
    Aborted(String),

    #[error("connection error: {0}")]
    Connection(String),

    /// The connection mutex was poisoned by a panicking holder.
    #[error("connection lock poisoned: {0}")]
    Poisoned(String),
}
