use std::path::PathBuf;
use std::time::Duration;

use url::Url;

use crate::error::StartupError;
use crate::reconcile::FailurePolicy;

/// The hashtag whose timeline gets boosted.
pub const HASHTAG: &str = "HomestuckReread2020";

const DEFAULT_DB_PATH: &str = "./ks.db";
const DEFAULT_SERVER: &str = "https://botsin.space";
const DEFAULT_CREDENTIALS: &str = "./ks-credentials.json";
const DEFAULT_CYCLE_DELAY_SECS: u64 = 10;
const DEFAULT_MAX_PAGES: usize = 4;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub server: Url,
    pub credentials_path: PathBuf,
    pub cycle_delay: Duration,
    pub max_pages: usize,
    pub failure_policy: FailurePolicy,
}

impl Config {
    /// Store path from the first argument, everything else from `KS_*`
    /// environment variables.
    pub fn from_env() -> Result<Self, StartupError> {
        Self::from_lookup(std::env::args().nth(1), |name| std::env::var(name).ok())
    }

    pub fn from_lookup(
        db_arg: Option<String>,
        var: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, StartupError> {
        let server = var("KS_SERVER").unwrap_or_else(|| DEFAULT_SERVER.into());
        let server = Url::parse(&server)
            .map_err(|e| StartupError::Config(format!("KS_SERVER '{server}': {e}")))?;
        if server.scheme() != "http" && server.scheme() != "https" {
            return Err(StartupError::Config(
                "KS_SERVER must start with http:// or https://".into(),
            ));
        }

        let cycle_delay = match var("KS_CYCLE_DELAY_SECS") {
            Some(raw) => raw.parse::<u64>().map_err(|e| {
                StartupError::Config(format!("KS_CYCLE_DELAY_SECS '{raw}': {e}"))
            })?,
            None => DEFAULT_CYCLE_DELAY_SECS,
        };

        let max_pages = match var("KS_MAX_PAGES") {
            Some(raw) => match raw.parse::<usize>() {
                Ok(n) if n > 0 => n,
                _ => {
                    return Err(StartupError::Config(format!(
                        "KS_MAX_PAGES '{raw}' must be a positive integer"
                    )))
                }
            },
            None => DEFAULT_MAX_PAGES,
        };

        let failure_policy = match var("KS_FAILURE_POLICY") {
            Some(raw) => raw
                .parse::<FailurePolicy>()
                .map_err(|e| StartupError::Config(e.to_string()))?,
            None => FailurePolicy::default(),
        };

        Ok(Self {
            db_path: db_arg.unwrap_or_else(|| DEFAULT_DB_PATH.into()).into(),
            server,
            credentials_path: var("KS_CREDENTIALS")
                .unwrap_or_else(|| DEFAULT_CREDENTIALS.into())
                .into(),
            cycle_delay: Duration::from_secs(cycle_delay),
            max_pages,
            failure_policy,
        })
    }
}
