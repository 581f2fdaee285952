use thiserror::Error;

/// A bus envelope that can never become a canonical archive record.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractViolation {
    #[error("envelope is not a JSON object")]
    NotAMapping,
    #[error("required field `{0}` is missing")]
    MissingField(&'static str),
    #[error("required field `{0}` must be a string")]
    NotAString(&'static str),
    #[error("required field `{0}` is blank")]
    BlankField(&'static str),
    #[error("seed must be a non-negative integer")]
    InvalidSeed,
    #[error("origin offset field `{0}` is blank")]
    BlankOrigin(&'static str),
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("sqlite ledger error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("postgres ledger error: {0}")]
    Postgres(#[from] sqlx::Error),
    #[error("ledger runtime error: {0}")]
    Runtime(#[from] std::io::Error),
    #[error("invalid ledger locator: {0}")]
    InvalidLocator(String),
    #[error("offset `{offset}` of kind `{offset_kind}` is not a linear cursor")]
    InvalidCursor { offset: String, offset_kind: String },
    #[error("ledger row decode failed: {0}")]
    Decode(String),
    #[error("ledger statement failed: {0}")]
    Statement(String),
}

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    /// The create-if-absent primitive found the path occupied.
    #[error("object already exists: {reference}")]
    AlreadyExists { reference: String },
    #[error("object store io error at {reference}: {source}")]
    Io {
        reference: String,
        #[source]
        source: std::io::Error,
    },
    #[error("object store request failed at {reference}: status={status} body={body}")]
    Http {
        reference: String,
        status: u16,
        body: String,
    },
    #[error("object store transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("object store misconfigured: {0}")]
    Config(String),
    #[error("document serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

impl ObjectStoreError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("bus request {action} failed: status={status} body={body}")]
    Http {
        action: &'static str,
        status: u16,
        body: String,
    },
    #[error("bus transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("bus response could not be decoded: {0}")]
    Decode(String),
    #[error("bus misconfigured: {0}")]
    Config(String),
    #[error(transparent)]
    Signing(#[from] SigningError),
}

#[derive(Debug, Error)]
pub enum SigningError {
    #[error("AWS credentials missing: set {0}")]
    MissingCredentials(&'static str),
    #[error("request URL has no host: {0}")]
    MissingHost(String),
    #[error("HMAC initialisation failed: {0}")]
    Hmac(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown metrics counter `{0}`")]
pub struct UnknownCounter(pub String);
