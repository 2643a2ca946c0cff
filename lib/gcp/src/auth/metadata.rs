use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request};
use http_body_util::Full;

use super::TokenResponse;
use crate::client::{self, HttpClient};

const METADATA_HOST_ENV: &str = "GCE_METADATA_HOST";
const METADATA_IP: &str = "169.254.169.254";
const METADATA_FLAVOR: &str = "Metadata-Flavor";
const TOKEN_PATH: &str = "/computeMetadata/v1/instance/service-accounts/default/token";

const DETECT_TIMEOUT: Duration = Duration::from_secs(2);

pub(super) fn endpoint() -> String {
    let host = std::env::var(METADATA_HOST_ENV).unwrap_or_else(|_| METADATA_IP.to_string());

    format!("http://{host}")
}

/// The metadata server answers every request with `Metadata-Flavor: Google`,
/// anything else means we are not running on GCE.
pub(super) async fn on_gce(http_client: &HttpClient, endpoint: &str) -> bool {
    let Ok(req) = Request::builder()
        .method(Method::GET)
        .uri(endpoint)
        .header(METADATA_FLAVOR, "Google")
        .body(Full::<Bytes>::default())
    else {
        return false;
    };

    match tokio::time::timeout(DETECT_TIMEOUT, http_client.request(req)).await {
        Ok(Ok(resp)) => resp
            .headers()
            .get(METADATA_FLAVOR)
            .is_some_and(|value| value == "Google"),
        _ => false,
    }
}

pub(super) async fn token(
    http_client: &HttpClient,
    endpoint: &str,
) -> Result<TokenResponse, client::Error> {
    let req = Request::builder()
        .method(Method::GET)
        .uri(format!("{endpoint}{TOKEN_PATH}"))
        .header(METADATA_FLAVOR, "Google")
        .body(Full::<Bytes>::default())?;

    client::send(http_client, req).await
}
