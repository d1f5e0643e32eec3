use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum PveError {
    #[error("failed to load config from {path}")]
    #[diagnostic(help("pass --config or create {path}"))]
    ConfigLoad {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config from {path}: {message}")]
    ConfigParse { path: String, message: String },

    #[error("validation error: {message}")]
    Validation { message: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("task {upid} failed: {message}")]
    TaskFailed { upid: String, message: String },

    /// The server refused the request. Conflicts (e.g. an id already in
    /// use) arrive here with the server's message untouched.
    #[error("{context}: HTTP {status}: {message}")]
    Api {
        context: String,
        status: u16,
        message: String,
    },

    #[error("{context}")]
    #[diagnostic(help("check that the cluster host is reachable"))]
    Http {
        context: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{context}: unexpected response: {message}")]
    Decode { context: String, message: String },

    #[error("I/O error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cancelled")]
    Cancelled,
}

impl PveError {
    pub fn not_found(what: impl Into<String>) -> Self {
        PveError::NotFound { what: what.into() }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PveError::InvalidArgument {
            message: message.into(),
        }
    }

    /// True when the server answered but the addressed object does not exist.
    pub fn is_absent(&self) -> bool {
        match self {
            PveError::NotFound { .. } => true,
            PveError::Api {
                status, message, ..
            } => *status == 404 || message.contains("does not exist"),
            _ => false,
        }
    }
}
