use std::fmt::Write as _;

pub type Result<T> = std::result::Result<T, Error>;

/// Crate-wide error type. Errors carry an optional chain of causes which
/// [`Error::chain`] renders as `outer: inner: root`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A message prefixed onto an underlying cause.
    #[error("{0}")]
    Context(String, #[source] Box<Error>),

    /// Invalid or inconsistent configuration. Fatal at startup.
    #[error("{0}")]
    Config(String),

    /// Embedded controller I/O failure. Transient; counted per tick.
    #[error("{0}")]
    Ec(String),

    /// Temperature sensor lookup or read failure. Recoverable.
    #[error("{0}")]
    Sensor(String),

    /// Malformed IPC request. Returned to the client, never fatal.
    #[error("{0}")]
    Protocol(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Render the full cause chain, outermost first.
    pub fn chain(&self) -> String {
        let mut out = String::new();
        let mut current: &dyn std::error::Error = self;
        let _ = write!(out, "{current}");
        while let Some(source) = current.source() {
            let _ = write!(out, ": {source}");
            current = source;
        }
        out
    }
}

/// Attach a context message to the error of a `Result`.
pub trait Context<T> {
    fn context<S: Into<String>>(self, msg: S) -> Result<T>;
}

impl<T, E: Into<Error>> Context<T> for std::result::Result<T, E> {
    fn context<S: Into<String>>(self, msg: S) -> Result<T> {
        self.map_err(|e| Error::Context(msg.into(), Box::new(e.into())))
    }
}
