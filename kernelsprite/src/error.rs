use common::types::Domain;
use thiserror::Error;

/// Anything that keeps the bot from reaching its first cycle. Always fatal.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("opening record store at {path}: {source}")]
    StoreOpen {
        path: String,
        #[source]
        source: sled::Error,
    },
    #[error("creating collection '{collection}': {source}")]
    Collection {
        collection: &'static str,
        #[source]
        source: sled::Error,
    },
    #[error("authorization failed: {0}")]
    Authorization(String),
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("building http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Snapshot retrieval failed. The cycle for that domain is abandoned.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {endpoint} failed: {source}")]
    Transport {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{endpoint} returned {status}")]
    Status { endpoint: String, status: u16 },
    #[error("{endpoint} is rate limited (resets at {})", .reset.as_deref().unwrap_or("unknown"))]
    RateLimited {
        endpoint: String,
        reset: Option<String>,
    },
    #[error("decoding {endpoint} response: {source}")]
    Decode {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
}

/// A reblog or follow call failed. The item stays unsettled.
#[derive(Debug, Error)]
pub enum ActionError {
    #[error("{action} {id} failed: {source}")]
    Transport {
        action: &'static str,
        id: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{action} {id} rejected with {status}")]
    Rejected {
        action: &'static str,
        id: String,
        status: u16,
    },
}

/// The record store could not be read or written.
#[derive(Debug, Error)]
#[error("{op} on '{target}' failed: {source}")]
pub struct PersistError {
    pub op: &'static str,
    pub target: String,
    #[source]
    pub source: sled::Error,
}

impl PersistError {
    pub fn new(op: &'static str, target: impl Into<String>, source: sled::Error) -> Self {
        Self {
            op,
            target: target.into(),
            source,
        }
    }
}

/// Why a reconciliation cycle ended early.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("fetching {domain}: {source}")]
    Fetch {
        domain: Domain,
        #[source]
        source: FetchError,
    },
    #[error("batch for {domain} discarded after {source}")]
    BatchDiscarded {
        domain: Domain,
        #[source]
        source: ActionError,
    },
    #[error(transparent)]
    Persist(#[from] PersistError),
    #[error("cycle for {0} cancelled")]
    Cancelled(Domain),
}
