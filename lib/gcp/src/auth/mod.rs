mod file;
mod metadata;

use std::fmt::{Debug, Formatter};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use headers::{Authorization, HeaderMapExt};
use http::Request;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

pub use file::{AuthorizedUser, ServiceAccountKey};

use crate::client::{self, HttpClient};

/// Grants read access to every API this crate calls.
pub const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

const CREDENTIALS_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Tokens are refreshed this long before they expire.
const EXPIRY_DELTA: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read credentials file '{1:?}': {0}")]
    ReadFile(#[source] std::io::Error, PathBuf),

    #[error("failed to parse credentials file: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("invalid private key: {0}")]
    InvalidPrivateKey(#[source] jsonwebtoken::errors::Error),

    #[error("failed to sign token assertion: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("invalid access token")]
    InvalidToken,

    #[error("could not find default credentials")]
    NotFound,
}

/// A source of short-lived access tokens.
#[derive(Clone, Debug)]
pub enum TokenSource {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
    /// The metadata server of the VM, e.g. `http://169.254.169.254`
    Metadata { endpoint: String },
}

#[derive(Clone, Debug)]
pub enum Credentials {
    None,
    Bearer { token: String },
    Refreshable(TokenSource),
}

impl Credentials {
    /// Load a `service_account` or `authorized_user` JSON file.
    pub fn from_file(path: impl Into<PathBuf>) -> Result<Self, Error> {
        let path = path.into();
        let data = std::fs::read(&path).map_err(|err| Error::ReadFile(err, path))?;

        file::parse(&data).map(Credentials::Refreshable)
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    /// Seconds
    #[serde(default)]
    pub expires_in: u64,
}

struct Token {
    value: String,
    expire_at: Instant,
}

pub(crate) struct Auth {
    credentials: Credentials,
    cached: Mutex<Option<Token>>,
}

impl Debug for Auth {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auth")
            .field("credentials", &self.credentials)
            .finish()
    }
}

impl Auth {
    pub fn new(credentials: Credentials) -> Self {
        Auth {
            credentials,
            cached: Mutex::new(None),
        }
    }

    pub async fn apply<T>(
        &self,
        http_client: &HttpClient,
        req: &mut Request<T>,
    ) -> Result<(), client::Error> {
        let token = match &self.credentials {
            Credentials::None => return Ok(()),
            Credentials::Bearer { token } => token.clone(),
            Credentials::Refreshable(source) => self.token(http_client, source).await?,
        };

        let header = Authorization::bearer(&token).map_err(|_| Error::InvalidToken)?;
        req.headers_mut().typed_insert(header);

        Ok(())
    }

    async fn token(
        &self,
        http_client: &HttpClient,
        source: &TokenSource,
    ) -> Result<String, client::Error> {
        // held across the refresh, concurrent callers share one token request
        let mut cached = self.cached.lock().await;

        let now = Instant::now();
        if let Some(token) = cached.as_ref()
            && token.expire_at > now + EXPIRY_DELTA
        {
            return Ok(token.value.clone());
        }

        let resp = match source {
            TokenSource::ServiceAccount(key) => file::exchange(http_client, key).await?,
            TokenSource::AuthorizedUser(user) => file::refresh(http_client, user).await?,
            TokenSource::Metadata { endpoint } => metadata::token(http_client, endpoint).await?,
        };

        debug!(message = "access token refreshed", expires_in = resp.expires_in);

        let value = resp.access_token;
        *cached = Some(Token {
            value: value.clone(),
            expire_at: now + Duration::from_secs(resp.expires_in),
        });

        Ok(value)
    }
}

/// Find the Application Default Credentials.
///
/// The lookup order is
/// 1. the file named by `GOOGLE_APPLICATION_CREDENTIALS`
/// 2. the gcloud well-known file, `~/.config/gcloud/application_default_credentials.json`
/// 3. the metadata server, when running on Google Compute Engine
pub(crate) async fn find_default_credentials(
    http_client: &HttpClient,
) -> Result<Credentials, client::Error> {
    if let Ok(path) = std::env::var(CREDENTIALS_ENV) {
        debug!(message = "load credentials from env", %path);
        return Credentials::from_file(path).map_err(Into::into);
    }

    if let Ok(home) = std::env::var("HOME") {
        let path = PathBuf::from(home)
            .join(".config/gcloud")
            .join("application_default_credentials.json");
        if path.exists() {
            debug!(message = "load credentials from well-known file", ?path);
            return Credentials::from_file(path).map_err(Into::into);
        }
    }

    let endpoint = metadata::endpoint();
    if metadata::on_gce(http_client, &endpoint).await {
        debug!(message = "use metadata server credentials", %endpoint);
        return Ok(Credentials::Refreshable(TokenSource::Metadata { endpoint }));
    }

    Err(Error::NotFound.into())
}
