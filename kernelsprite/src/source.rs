use async_trait::async_trait;
use common::types::{Domain, Snapshot, TrackedItem};

use crate::error::{ActionError, FetchError};

/// The remote side of reconciliation: where snapshots come from and where
/// actions go.
#[async_trait]
pub trait RemoteSource: Send + Sync {
    /// Fetches the current snapshot for `domain`. `cursor` is the newest id
    /// already settled, for domains that keep one.
    async fn fetch_snapshot(
        &self,
        domain: Domain,
        cursor: Option<&str>,
    ) -> Result<Snapshot, FetchError>;

    /// Reblogs or follows `item`, addressed by its marker.
    async fn act(&self, domain: Domain, item: &TrackedItem) -> Result<(), ActionError>;
}
