use std::fmt::{Debug, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http::header::CONTENT_TYPE;
use http::{Method, Request};
use http_body_util::Full;
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use serde::{Deserialize, Serialize};

use super::{CLOUD_PLATFORM_SCOPE, Error, TokenResponse, TokenSource};
use crate::client::{self, HttpClient};

const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";

/// Lifetime of a signed assertion, Google rejects anything above one hour.
const ASSERTION_LIFETIME: u64 = 3600;

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount(ServiceAccountKey),
    AuthorizedUser(AuthorizedUser),
}

/// A JSON key of a service account, created with
/// `gcloud iam service-accounts keys create`.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    /// PKCS#8 PEM
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key_id", &self.private_key_id)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

/// Written by `gcloud auth application-default login`.
#[derive(Clone, Deserialize)]
pub struct AuthorizedUser {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

impl Debug for AuthorizedUser {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizedUser")
            .field("client_id", &self.client_id)
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

pub(super) fn parse(data: &[u8]) -> Result<TokenSource, Error> {
    let file = serde_json::from_slice::<CredentialsFile>(data).map_err(Error::Parse)?;

    Ok(match file {
        CredentialsFile::ServiceAccount(key) => TokenSource::ServiceAccount(key),
        CredentialsFile::AuthorizedUser(user) => TokenSource::AuthorizedUser(user),
    })
}

/// Claims of the assertion exchanged for an access token.
#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: u64,
    exp: u64,
}

/// Build a self-signed RS256 JWT asserting the identity of the service account.
pub(super) fn assertion(key: &ServiceAccountKey, now: u64) -> Result<String, Error> {
    let header = Header {
        kid: (!key.private_key_id.is_empty()).then(|| key.private_key_id.clone()),
        ..Header::new(Algorithm::RS256)
    };
    let claims = Claims {
        iss: &key.client_email,
        scope: CLOUD_PLATFORM_SCOPE,
        aud: &key.token_uri,
        iat: now,
        exp: now + ASSERTION_LIFETIME,
    };

    let encoding_key =
        EncodingKey::from_rsa_pem(key.private_key.as_bytes()).map_err(Error::InvalidPrivateKey)?;

    encode(&header, &claims, &encoding_key).map_err(Error::Sign)
}

pub(super) async fn exchange(
    http_client: &HttpClient,
    key: &ServiceAccountKey,
) -> Result<TokenResponse, client::Error> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    let assertion = assertion(key, now)?;

    let body = form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", JWT_BEARER_GRANT)
        .append_pair("assertion", &assertion)
        .finish();

    post_form(http_client, &key.token_uri, body).await
}

pub(super) async fn refresh(
    http_client: &HttpClient,
    user: &AuthorizedUser,
) -> Result<TokenResponse, client::Error> {
    let body = form_urlencoded::Serializer::new(String::new())
        .append_pair("grant_type", "refresh_token")
        .append_pair("client_id", &user.client_id)
        .append_pair("client_secret", &user.client_secret)
        .append_pair("refresh_token", &user.refresh_token)
        .finish();

    post_form(http_client, &user.token_uri, body).await
}

async fn post_form(
    http_client: &HttpClient,
    uri: &str,
    body: String,
) -> Result<TokenResponse, client::Error> {
    let req = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Full::new(Bytes::from(body)))?;

    client::send(http_client, req).await
}

#[cfg(test)]
mod tests {
    use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
    use serde_json::json;

    use super::*;

    const PRIVATE_KEY: &str = include_str!("../../tests/fixtures/private_key.pem");
    const PUBLIC_KEY: &str = include_str!("../../tests/fixtures/public_key.pem");

    fn service_account_key() -> ServiceAccountKey {
        ServiceAccountKey {
            client_email: "sd@example.iam.gserviceaccount.com".to_string(),
            private_key: PRIVATE_KEY.to_string(),
            private_key_id: "key-1".to_string(),
            token_uri: DEFAULT_TOKEN_URI.to_string(),
        }
    }

    #[test]
    fn parse_service_account() {
        let data = json!({
            "type": "service_account",
            "project_id": "p",
            "client_email": "sd@example.iam.gserviceaccount.com",
            "private_key": PRIVATE_KEY,
            "private_key_id": "key-1",
        })
        .to_string();

        match parse(data.as_bytes()).unwrap() {
            TokenSource::ServiceAccount(key) => {
                assert_eq!(key.client_email, "sd@example.iam.gserviceaccount.com");
                assert_eq!(key.token_uri, DEFAULT_TOKEN_URI);
            }
            other => panic!("unexpected token source {other:?}"),
        }
    }

    #[test]
    fn parse_authorized_user() {
        let data = r#"{
            "type": "authorized_user",
            "client_id": "id",
            "client_secret": "secret",
            "refresh_token": "refresh"
        }"#;

        match parse(data.as_bytes()).unwrap() {
            TokenSource::AuthorizedUser(user) => {
                assert_eq!(user.refresh_token, "refresh");
                assert_eq!(user.token_uri, DEFAULT_TOKEN_URI);
            }
            other => panic!("unexpected token source {other:?}"),
        }
    }

    #[test]
    fn parse_unknown_type() {
        let data = r#"{"type": "external_account"}"#;
        assert!(matches!(parse(data.as_bytes()), Err(Error::Parse(_))));
    }

    #[test]
    fn debug_hides_secrets() {
        let text = format!("{:?}", service_account_key());
        assert!(!text.contains("PRIVATE KEY"));
    }

    #[test]
    fn signed_assertion() {
        let key = service_account_key();
        let jwt = assertion(&key, 1_700_000_000).unwrap();

        let header = decode_header(&jwt).unwrap();
        assert_eq!(header.alg, Algorithm::RS256);
        assert_eq!(header.typ.as_deref(), Some("JWT"));
        assert_eq!(header.kid.as_deref(), Some("key-1"));

        // the assertion is long expired by now, only the signature matters
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_exp = false;
        validation.set_audience(&[DEFAULT_TOKEN_URI]);
        let decoding_key = DecodingKey::from_rsa_pem(PUBLIC_KEY.as_bytes()).unwrap();
        let claims = decode::<serde_json::Value>(&jwt, &decoding_key, &validation)
            .unwrap()
            .claims;

        assert_eq!(claims["iss"], "sd@example.iam.gserviceaccount.com");
        assert_eq!(claims["scope"], CLOUD_PLATFORM_SCOPE);
        assert_eq!(claims["aud"], DEFAULT_TOKEN_URI);
        assert_eq!(claims["iat"], 1_700_000_000u64);
        assert_eq!(claims["exp"], 1_700_000_000u64 + ASSERTION_LIFETIME);
    }

    #[test]
    fn no_key_id() {
        let mut key = service_account_key();
        key.private_key_id = String::new();

        let header = decode_header(&assertion(&key, 0).unwrap()).unwrap();
        assert_eq!(header.kid, None);
    }

    #[test]
    fn invalid_private_key() {
        let mut key = service_account_key();
        key.private_key = "not a pem".to_string();

        assert!(matches!(
            assertion(&key, 0),
            Err(Error::InvalidPrivateKey(_))
        ));
    }
}
