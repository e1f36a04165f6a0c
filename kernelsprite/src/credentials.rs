use std::{
    fs::{self, OpenOptions},
    io::Write,
    os::unix::fs::OpenOptionsExt,
    path::Path,
    time::Duration,
};

use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

use crate::error::StartupError;
use crate::mastodon_client::endpoint;

const CLIENT_NAME: &str = "kernelsprite";
const SCOPES: &str = "read write follow";
const WEBSITE: &str = "https://github.com/oct2pus/kernelsprite";
const OOB_REDIRECT: &str = "urn:ietf:wg:oauth:2.0:oob";

#[derive(Debug)]
pub struct Credentials {
    pub client_id: String,
    pub client_secret: SecretString,
    pub access_token: SecretString,
}

/// On-disk form. Only ever written with mode 0600.
#[derive(Serialize, Deserialize)]
struct StoredCredentials {
    server: String,
    client_id: String,
    client_secret: String,
    access_token: String,
}

#[derive(Deserialize)]
struct RegisteredApp {
    client_id: String,
    client_secret: String,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Reuses the credentials saved at `path` for `server`, or runs the
/// interactive authorization and saves the result.
pub async fn load_or_authorize(server: &Url, path: &Path) -> Result<Credentials, StartupError> {
    if let Some(credentials) = load(server, path)? {
        tracing::info!("Using saved credentials from {}", path.display());
        return Ok(credentials);
    }

    let credentials = authorize(server).await?;
    persist(server, path, &credentials)?;
    tracing::info!("Saved credentials to {}", path.display());
    Ok(credentials)
}

fn load(server: &Url, path: &Path) -> Result<Option<Credentials>, StartupError> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path).map_err(|e| {
        StartupError::Authorization(format!("reading {}: {e}", path.display()))
    })?;
    let stored: StoredCredentials = serde_json::from_str(&raw).map_err(|e| {
        StartupError::Authorization(format!("parsing {}: {e}", path.display()))
    })?;

    if stored.server != server.as_str() {
        tracing::warn!(
            "Saved credentials belong to {}, not {}; authorizing again",
            stored.server,
            server
        );
        return Ok(None);
    }

    Ok(Some(Credentials {
        client_id: stored.client_id,
        client_secret: stored.client_secret.into(),
        access_token: stored.access_token.into(),
    }))
}

fn persist(server: &Url, path: &Path, credentials: &Credentials) -> Result<(), StartupError> {
    let stored = StoredCredentials {
        server: server.to_string(),
        client_id: credentials.client_id.clone(),
        client_secret: credentials.client_secret.expose_secret().to_string(),
        access_token: credentials.access_token.expose_secret().to_string(),
    };
    let body = serde_json::to_vec_pretty(&stored)
        .map_err(|e| StartupError::Authorization(format!("serializing credentials: {e}")))?;

    let write = || -> std::io::Result<()> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?
            .write_all(&body)
    };
    write().map_err(|e| StartupError::Authorization(format!("writing {}: {e}", path.display())))
}

async fn authorize(server: &Url) -> Result<Credentials, StartupError> {
    let client = Client::builder().timeout(Duration::from_secs(20)).build()?;

    let app: RegisteredApp = client
        .post(endpoint(server, &["api", "v1", "apps"]))
        .form(&[
            ("client_name", CLIENT_NAME),
            ("redirect_uris", OOB_REDIRECT),
            ("scopes", SCOPES),
            ("website", WEBSITE),
        ])
        .send()
        .await
        .and_then(|res| res.error_for_status())
        .map_err(handshake_error("registering app"))?
        .json()
        .await
        .map_err(handshake_error("decoding app registration"))?;

    let code = prompt_for_code(&authorize_url(server, &app.client_id)).await?;

    let token: TokenResponse = client
        .post(endpoint(server, &["oauth", "token"]))
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("client_id", app.client_id.as_str()),
            ("client_secret", app.client_secret.as_str()),
            ("redirect_uri", OOB_REDIRECT),
            ("scope", SCOPES),
        ])
        .send()
        .await
        .and_then(|res| res.error_for_status())
        .map_err(handshake_error("exchanging authorization code"))?
        .json()
        .await
        .map_err(handshake_error("decoding access token"))?;

    Ok(Credentials {
        client_id: app.client_id,
        client_secret: app.client_secret.into(),
        access_token: token.access_token.into(),
    })
}

async fn prompt_for_code(url: &Url) -> Result<String, StartupError> {
    print!("Authenticate: {url}\nEnter authorization: ");
    std::io::stdout()
        .flush()
        .map_err(|e| StartupError::Authorization(format!("writing prompt: {e}")))?;

    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| StartupError::Authorization(format!("reading authorization code: {e}")))?;

    let code = line.trim();
    if code.is_empty() {
        return Err(StartupError::Authorization(
            "no authorization code entered".into(),
        ));
    }
    Ok(code.to_string())
}

pub(crate) fn authorize_url(server: &Url, client_id: &str) -> Url {
    let mut url = endpoint(server, &["oauth", "authorize"]);
    url.query_pairs_mut()
        .append_pair("client_id", client_id)
        .append_pair("redirect_uri", OOB_REDIRECT)
        .append_pair("response_type", "code")
        .append_pair("scope", SCOPES);
    url
}

fn handshake_error(step: &'static str) -> impl Fn(reqwest::Error) -> StartupError {
    move |e| StartupError::Authorization(format!("{step}: {e}"))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::*;

    fn server() -> Url {
        Url::parse("https://botsin.space").unwrap()
    }

    fn sample() -> Credentials {
        Credentials {
            client_id: "cid".into(),
            client_secret: "csecret".to_string().into(),
            access_token: "token".to_string().into(),
        }
    }

    #[test]
    fn missing_file_means_no_credentials() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(&server(), &dir.path().join("creds.json")).unwrap().is_none());
    }

    #[test]
    fn persisted_credentials_load_back_privately() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("creds.json");

        persist(&server(), &path, &sample()).unwrap();
        let loaded = load(&server(), &path).unwrap().unwrap();

        assert_eq!(loaded.client_id, "cid");
        assert_eq!(loaded.access_token.expose_secret(), "token");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn credentials_for_another_server_are_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        persist(&server(), &path, &sample()).unwrap();

        let other = Url::parse("https://mastodon.social").unwrap();
        assert!(load(&other, &path).unwrap().is_none());
    }

    #[test]
    fn corrupt_file_is_a_startup_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        fs::write(&path, "not json").unwrap();

        assert!(matches!(
            load(&server(), &path),
            Err(StartupError::Authorization(_))
        ));
    }

    #[test]
    fn authorize_url_requests_an_oob_code() {
        let url = authorize_url(&server(), "cid");
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();

        assert_eq!(url.path(), "/oauth/authorize");
        assert!(pairs.contains(&("client_id".into(), "cid".into())));
        assert!(pairs.contains(&("redirect_uri".into(), OOB_REDIRECT.into())));
        assert!(pairs.contains(&("response_type".into(), "code".into())));
        assert!(pairs.contains(&("scope".into(), SCOPES.into())));
    }
}
