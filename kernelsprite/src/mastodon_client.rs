use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::types::{Domain, Snapshot, TrackedItem};
use reqwest::{header, Client, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::sync::OnceCell;
use url::Url;

use crate::error::{ActionError, FetchError};
use crate::source::RemoteSource;

const TIMELINE_PAGE_SIZE: &str = "40";
const FOLLOWERS_PAGE_SIZE: &str = "80";

#[derive(Deserialize, Debug)]
pub struct Status {
    pub id: String,
    pub uri: String,
    pub url: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<Status> for TrackedItem {
    fn from(status: Status) -> Self {
        TrackedItem {
            // remote statuses without a web page only carry their ActivityPub uri
            key: status.url.unwrap_or(status.uri),
            marker: status.id,
            created_at: Some(status.created_at),
        }
    }
}

#[derive(Deserialize, Debug)]
pub struct Account {
    pub id: String,
    pub acct: String,
    pub url: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

impl From<Account> for TrackedItem {
    fn from(account: Account) -> Self {
        TrackedItem {
            key: account.url,
            marker: account.id,
            created_at: account.created_at,
        }
    }
}

pub struct MastodonClient {
    base_url: Url,
    hashtag: String,
    token: SecretString,
    max_pages: usize,
    client: Client,
    own_id: OnceCell<String>,
}

impl MastodonClient {
    pub fn new(
        base_url: Url,
        hashtag: impl Into<String>,
        token: SecretString,
        max_pages: usize,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            base_url,
            hashtag: hashtag.into(),
            token,
            max_pages: max_pages.max(1),
            client: Client::builder()
                .timeout(Duration::from_secs(20))
                .user_agent(concat!("kernelsprite/", env!("CARGO_PKG_VERSION")))
                .build()?,
            own_id: OnceCell::new(),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Url {
        endpoint(&self.base_url, segments)
    }

    /// Statuses tagged with the tracked hashtag, oldest page first after
    /// `min_id` when one is given.
    pub async fn hashtag_timeline(&self, min_id: Option<&str>) -> Result<Vec<Status>, FetchError> {
        let mut url = self.endpoint(&["api", "v1", "timelines", "tag", &self.hashtag]);
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", TIMELINE_PAGE_SIZE);
            if let Some(min_id) = min_id {
                query.append_pair("min_id", min_id);
            }
        }
        let (statuses, _) = self.get_page(url).await?;
        Ok(statuses)
    }

    pub async fn verify_credentials(&self) -> Result<Account, FetchError> {
        let url = self.endpoint(&["api", "v1", "accounts", "verify_credentials"]);
        let (account, _) = self.get_page(url).await?;
        Ok(account)
    }

    async fn own_account_id(&self) -> Result<&str, FetchError> {
        let id = self
            .own_id
            .get_or_try_init(|| async {
                let account = self.verify_credentials().await?;
                tracing::info!(acct = %account.acct, id = %account.id, "resolved own account");
                Ok::<_, FetchError>(account.id)
            })
            .await?;
        Ok(id.as_str())
    }

    /// Followers of `account_id`, following `Link: rel="next"` for at most
    /// `max_pages` pages.
    pub async fn followers(&self, account_id: &str) -> Result<Vec<Account>, FetchError> {
        let mut url = self.endpoint(&["api", "v1", "accounts", account_id, "followers"]);
        url.query_pairs_mut().append_pair("limit", FOLLOWERS_PAGE_SIZE);

        let mut accounts = Vec::new();
        let mut next = Some(url);
        let mut pages = 0;
        while let Some(url) = next.take() {
            let (page, link): (Vec<Account>, _) = self.get_page(url).await?;
            pages += 1;
            let exhausted = page.is_empty();
            accounts.extend(page);
            if exhausted || pages >= self.max_pages {
                if link.is_some() && !exhausted {
                    tracing::debug!(pages, "follower page limit reached");
                }
                break;
            }
            next = link;
        }
        Ok(accounts)
    }

    pub async fn reblog(&self, status_id: &str) -> Result<(), ActionError> {
        let url = self.endpoint(&["api", "v1", "statuses", status_id, "reblog"]);
        self.post_action("reblog", status_id, url).await
    }

    pub async fn follow(&self, account_id: &str) -> Result<(), ActionError> {
        let url = self.endpoint(&["api", "v1", "accounts", account_id, "follow"]);
        self.post_action("follow", account_id, url).await
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        url: Url,
    ) -> Result<(T, Option<Url>), FetchError> {
        let endpoint = url.path().to_string();
        let res = self
            .client
            .get(url)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|source| FetchError::Transport {
                endpoint: endpoint.clone(),
                source,
            })?;

        let status = res.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let reset = res
                .headers()
                .get("x-ratelimit-reset")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string);
            return Err(FetchError::RateLimited { endpoint, reset });
        }
        if !status.is_success() {
            return Err(FetchError::Status {
                endpoint,
                status: status.as_u16(),
            });
        }

        let next = res
            .headers()
            .get(header::LINK)
            .and_then(|v| v.to_str().ok())
            .and_then(next_link);
        let body = res
            .json::<T>()
            .await
            .map_err(|source| FetchError::Decode { endpoint, source })?;
        Ok((body, next))
    }

    async fn post_action(&self, action: &'static str, id: &str, url: Url) -> Result<(), ActionError> {
        let res = self
            .client
            .post(url)
            .bearer_auth(self.token.expose_secret())
            .send()
            .await
            .map_err(|source| ActionError::Transport {
                action,
                id: id.to_string(),
                source,
            })?;

        let status = res.status();
        if !status.is_success() {
            return Err(ActionError::Rejected {
                action,
                id: id.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteSource for MastodonClient {
    async fn fetch_snapshot(
        &self,
        domain: Domain,
        cursor: Option<&str>,
    ) -> Result<Snapshot, FetchError> {
        match domain {
            Domain::Posts => {
                let statuses = self.hashtag_timeline(cursor).await?;
                Ok(statuses.into_iter().map(TrackedItem::from).collect())
            }
            Domain::Followers => {
                let own_id = self.own_account_id().await?;
                let accounts = self.followers(own_id).await?;
                Ok(accounts.into_iter().map(TrackedItem::from).collect())
            }
        }
    }

    async fn act(&self, domain: Domain, item: &TrackedItem) -> Result<(), ActionError> {
        match domain {
            Domain::Posts => self.reblog(&item.marker).await,
            Domain::Followers => self.follow(&item.marker).await,
        }
    }
}

/// Appends path segments to `base`, percent-encoding each one.
pub(crate) fn endpoint(base: &Url, segments: &[&str]) -> Url {
    let mut url = base.clone();
    if let Ok(mut path) = url.path_segments_mut() {
        path.pop_if_empty().extend(segments);
    }
    url
}

/// Extracts the `rel="next"` target of an RFC 8288 `Link` header.
pub(crate) fn next_link(header: &str) -> Option<Url> {
    header.split(',').find_map(|entry| {
        let mut parts = entry.split(';');
        let target = parts
            .next()?
            .trim()
            .strip_prefix('<')?
            .strip_suffix('>')?;
        let is_next = parts.any(|param| {
            let param = param.trim();
            param.eq_ignore_ascii_case("rel=\"next\"") || param.eq_ignore_ascii_case("rel=next")
        });
        if is_next {
            Url::parse(target).ok()
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_link_picks_the_next_relation() {
        let header = "<https://botsin.space/api/v1/accounts/1/followers?max_id=7>; rel=\"next\", \
                      <https://botsin.space/api/v1/accounts/1/followers?since_id=9>; rel=\"prev\"";
        let next = next_link(header).unwrap();
        assert_eq!(next.query(), Some("max_id=7"));
    }

    #[test]
    fn next_link_absent_on_last_page() {
        let header = "<https://botsin.space/api/v1/accounts/1/followers?since_id=9>; rel=\"prev\"";
        assert!(next_link(header).is_none());
        assert!(next_link("garbage").is_none());
    }

    #[test]
    fn endpoint_encodes_the_hashtag_segment() {
        let base = Url::parse("https://botsin.space/").unwrap();
        let url = endpoint(&base, &["api", "v1", "timelines", "tag", "HomestuckReread2020"]);
        assert_eq!(
            url.as_str(),
            "https://botsin.space/api/v1/timelines/tag/HomestuckReread2020"
        );

        let odd = endpoint(&base, &["api", "v1", "timelines", "tag", "a/b"]);
        assert_eq!(odd.path(), "/api/v1/timelines/tag/a%2Fb");
    }

    #[test]
    fn status_keys_on_url_and_falls_back_to_uri() {
        let json = r#"[
            {"id": "1", "uri": "https://a.example/users/x/statuses/1",
             "url": "https://a.example/@x/1", "created_at": "2020-04-13T10:00:00.000Z"},
            {"id": "2", "uri": "https://b.example/objects/2",
             "url": null, "created_at": "2020-04-13T11:00:00.000Z"}
        ]"#;
        let statuses: Vec<Status> = serde_json::from_str(json).unwrap();
        let items: Vec<TrackedItem> = statuses.into_iter().map(TrackedItem::from).collect();

        assert_eq!(items[0].key, "https://a.example/@x/1");
        assert_eq!(items[0].marker, "1");
        assert_eq!(items[1].key, "https://b.example/objects/2");
        assert_eq!(items[1].marker, "2");
    }

    #[test]
    fn account_keys_on_profile_url() {
        let json = r#"{"id": "109", "acct": "rose@lalonde.example",
                       "url": "https://lalonde.example/@rose",
                       "created_at": "2019-12-01T00:00:00.000Z",
                       "display_name": "Rose"}"#;
        let account: Account = serde_json::from_str(json).unwrap();
        let item = TrackedItem::from(account);

        assert_eq!(item.key, "https://lalonde.example/@rose");
        assert_eq!(item.marker, "109");
        assert!(item.created_at.is_some());
    }
}
