use std::sync::Arc;

use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, PercentEncode, utf8_percent_encode};
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::CertificateResult;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, trace, warn};

use super::auth::{self, Auth, Credentials};
use super::compute::{INSTANCE_FIELDS, InstanceAggregatedList, RegionList};
use super::resourcemanager::ListProjectsResponse;

pub const COMPUTE_ENDPOINT: &str = "https://compute.googleapis.com/compute/v1";
pub const RESOURCE_MANAGER_ENDPOINT: &str = "https://cloudresourcemanager.googleapis.com/v1";

/// Everything but the unreserved characters of RFC 3986.
const PATH_SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

fn path_segment(value: &str) -> PercentEncode<'_> {
    utf8_percent_encode(value, PATH_SEGMENT)
}

pub(crate) type HttpClient =
    hyper_util::client::legacy::Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Auth(#[from] auth::Error),
    #[error("build http request failed, {0}")]
    BuildRequest(http::Error),
    #[error("read http response failed, {0}")]
    ReadResponse(hyper::Error),
    #[error(transparent)]
    Http(hyper_util::client::legacy::Error),
    #[error("api error, code: {}, status: {}, message: {}", .0.code, .0.status, .0.message)]
    Api(ErrorResponse),
    #[error("token endpoint error, {error}: {description}")]
    OAuth { error: String, description: String },
    #[error("unexpected status code {0}")]
    UnexpectedStatus(StatusCode),
    #[error("deserialize response failed, {0}")]
    Deserialize(serde_json::Error),
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Deserialize(err)
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::ReadResponse(err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::BuildRequest(err)
    }
}

impl Error {
    /// The HTTP status reported by the remote side, if any.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Error::Api(resp) => StatusCode::from_u16(resp.code).ok(),
            Error::UnexpectedStatus(status) => Some(*status),
            _ => None,
        }
    }
}

/// An error response from a Google API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// The HTTP status code
    pub code: u16,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The canonical status, e.g. `PERMISSION_DENIED`
    #[serde(default)]
    pub status: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Api {
        error: ErrorResponse,
    },
    OAuth {
        error: String,
        #[serde(default)]
        error_description: String,
    },
}

/// Paginated list responses.
pub trait Page {
    /// The token of the next page, `None` on the last page.
    fn next_page_token(&self) -> Option<&str>;
}

/// Common query parameters of list calls.
#[derive(Debug, Default)]
pub struct ListParams {
    /// A filter expression, e.g. `(labels.prometheus eq .*)`
    pub filter: Option<String>,

    /// Fetch the page after the one which returned this token.
    pub page_token: Option<String>,
}

impl ListParams {
    pub fn page(mut self, token: Option<&str>) -> Self {
        self.page_token = token.map(ToString::to_string);
        self
    }

    fn query(&self, fields: Option<&str>) -> String {
        let mut builder = form_urlencoded::Serializer::new(String::new());

        if let Some(fields) = fields {
            builder.append_pair("fields", fields);
        }
        if let Some(filter) = &self.filter {
            builder.append_pair("filter", filter);
        }
        if let Some(page_token) = &self.page_token {
            builder.append_pair("pageToken", page_token);
        }

        builder.finish()
    }
}

/// Where and how the client talks to Google APIs.
#[derive(Debug)]
pub struct Config {
    /// Stores information to tell the APIs who you are.
    pub credentials: Credentials,

    /// Base URL of the Compute Engine API, without the trailing slash.
    pub compute_endpoint: String,

    /// Base URL of the Cloud Resource Manager API, without the trailing slash.
    pub resource_manager_endpoint: String,
}

impl Config {
    pub fn new(credentials: Credentials) -> Self {
        Config {
            credentials,
            compute_endpoint: COMPUTE_ENDPOINT.to_string(),
            resource_manager_endpoint: RESOURCE_MANAGER_ENDPOINT.to_string(),
        }
    }
}

#[derive(Clone)]
pub struct Client {
    http_client: HttpClient,
    auth: Arc<Auth>,
    compute_endpoint: String,
    resource_manager_endpoint: String,
}

impl Client {
    /// Build a client with the Application Default Credentials.
    pub async fn new() -> Result<Self, Error> {
        let http_client = build_http_client();
        let credentials = auth::find_default_credentials(&http_client).await?;

        Ok(Self::from_parts(http_client, Config::new(credentials)))
    }

    pub fn with_config(config: Config) -> Self {
        Self::from_parts(build_http_client(), config)
    }

    fn from_parts(http_client: HttpClient, config: Config) -> Self {
        Client {
            http_client,
            auth: Arc::new(Auth::new(config.credentials)),
            compute_endpoint: config.compute_endpoint.trim_end_matches('/').to_string(),
            resource_manager_endpoint: config
                .resource_manager_endpoint
                .trim_end_matches('/')
                .to_string(),
        }
    }

    /// List one page of instances of every zone of the project.
    pub async fn instances(
        &self,
        project: &str,
        params: &ListParams,
    ) -> Result<InstanceAggregatedList, Error> {
        let uri = format!(
            "{}/projects/{}/aggregated/instances?{}",
            self.compute_endpoint,
            path_segment(project),
            params.query(Some(INSTANCE_FIELDS))
        );

        self.get(uri).await
    }

    /// List one page of regions of the project.
    pub async fn regions(&self, project: &str, params: &ListParams) -> Result<RegionList, Error> {
        let uri = format!(
            "{}/projects/{}/regions?{}",
            self.compute_endpoint,
            path_segment(project),
            params.query(None)
        );

        self.get(uri).await
    }

    /// List one page of the projects visible to the credentials.
    pub async fn projects(&self, params: &ListParams) -> Result<ListProjectsResponse, Error> {
        let uri = format!(
            "{}/projects?{}",
            self.resource_manager_endpoint,
            params.query(None)
        );

        self.get(uri).await
    }

    async fn get<T: DeserializeOwned>(&self, uri: String) -> Result<T, Error> {
        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;

        self.auth.apply(&self.http_client, &mut req).await?;

        send(&self.http_client, req).await
    }
}

/// Send the request and decode the JSON body of a successful response,
/// or the error envelope of a failed one.
pub(crate) async fn send<T: DeserializeOwned>(
    http_client: &HttpClient,
    req: Request<Full<Bytes>>,
) -> Result<T, Error> {
    trace!(message = "doing http request", method = %req.method(), uri = %req.uri());

    let resp = http_client.request(req).await.map_err(Error::Http)?;
    let (parts, incoming) = resp.into_parts();
    let body = incoming.collect().await?.to_bytes();

    if parts.status.is_success() {
        return serde_json::from_slice(&body).map_err(Error::Deserialize);
    }

    match serde_json::from_slice::<ErrorBody>(&body) {
        Ok(ErrorBody::Api { error }) => Err(Error::Api(error)),
        Ok(ErrorBody::OAuth {
            error,
            error_description,
        }) => Err(Error::OAuth {
            error,
            description: error_description,
        }),
        Err(_) => Err(Error::UnexpectedStatus(parts.status)),
    }
}

fn build_http_client() -> HttpClient {
    let CertificateResult { certs, errors, .. } = rustls_native_certs::load_native_certs();
    for err in errors {
        warn!(message = "load native certificate failed", %err);
    }

    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(certs);
    debug!(message = "native root certificates loaded", added, ignored);

    let tls = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();

    let builder = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http();
    let mut inner = HttpConnector::new();
    inner.enforce_http(false);
    let connector = builder.enable_http1().wrap_connector(inner);

    hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector)
}
