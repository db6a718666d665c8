use thiserror::Error;

#[derive(Debug, Error)]
pub enum LsmError {
    #[error("{operation} rule table is full (capacity {capacity})")]
    TableFull { operation: &'static str, capacity: usize },
    #[error("malformed kernel event: {0}")]
    MalformedEvent(&'static str),
    #[error("kernel backend error: {0}")]
    Backend(String),
}
