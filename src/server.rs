//! The on demand HTTP refresh driver.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use http::header::{ALLOW, CONTENT_TYPE};
use http::{HeaderValue, Method, Request, Response, StatusCode};
use http_body_util::Full;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::collector::collect;
use crate::pool::Pool;
use crate::projects::{ProjectLister, ProjectSet};

pub const STATUS_PATH: &str = "/status";
pub const INSTANCES_PATH: &str = "/v1/gce/instances";

/// Set when the response holds only part of the requested projects.
pub const INCOMPLETE_HEADER: &str = "x-targets-incomplete";

const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
const APPLICATION_JSON: &str = "application/json; charset=utf-8";

#[derive(Debug, Default, PartialEq)]
struct InstancesQuery {
    projects: String,
    excludes: Option<String>,
    auto_discovery: bool,
}

impl InstancesQuery {
    /// The first occurrence of every parameter wins.
    fn parse(query: Option<&str>) -> Self {
        let mut projects = None;
        let mut excludes = None;
        let mut auto_discovery = None;

        for (key, value) in form_urlencoded::parse(query.unwrap_or_default().as_bytes()) {
            let slot = match key.as_ref() {
                "projects" => &mut projects,
                "projects-excludes" => &mut excludes,
                "projects-auto-discovery" => &mut auto_discovery,
                _ => continue,
            };

            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }

        InstancesQuery {
            projects: projects.unwrap_or_default(),
            excludes: excludes.filter(|pattern| !pattern.is_empty()),
            auto_discovery: auto_discovery
                .map(|value| matches!(value.to_lowercase().as_str(), "true" | "1"))
                .unwrap_or_default(),
        }
    }
}

fn text(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(body.into()));
    *resp.status_mut() = status;
    resp.headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(TEXT_PLAIN));
    resp
}

#[derive(Clone)]
pub struct Server {
    pool: Pool,
    lister: Arc<dyn ProjectLister>,

    /// every collection is cancelled with this
    shutdown: CancellationToken,
}

impl Server {
    pub fn new(pool: Pool, lister: Arc<dyn ProjectLister>, shutdown: CancellationToken) -> Self {
        Self {
            pool,
            lister,
            shutdown,
        }
    }

    pub async fn handle<B>(&self, req: Request<B>) -> Result<Response<Full<Bytes>>, Infallible> {
        let start = Instant::now();
        let (parts, _) = req.into_parts();
        // inserted by `http::serve`, absent when the handler is called directly
        let peer = parts.extensions.get::<SocketAddr>().copied();
        let method = parts.method;
        let path = parts.uri.path();

        let resp = match path {
            STATUS_PATH => text(StatusCode::OK, "I'm fine."),
            INSTANCES_PATH => {
                if method == Method::GET || method == Method::HEAD {
                    self.instances(parts.uri.query()).await
                } else {
                    let mut resp = text(StatusCode::METHOD_NOT_ALLOWED, "method not allowed");
                    resp.headers_mut()
                        .insert(ALLOW, HeaderValue::from_static("GET, HEAD"));
                    resp
                }
            }
            _ => text(StatusCode::NOT_FOUND, "not found"),
        };

        info!(
            message = "request served",
            peer = ?peer,
            %method,
            path,
            status = resp.status().as_u16(),
            elapsed = ?start.elapsed(),
        );

        Ok(resp)
    }

    async fn instances(&self, query: Option<&str>) -> Response<Full<Bytes>> {
        let query = InstancesQuery::parse(query);

        let excludes = match query.excludes.as_deref().map(Regex::new).transpose() {
            Ok(excludes) => excludes,
            Err(err) => return text(StatusCode::BAD_REQUEST, err.to_string()),
        };

        let mut projects = ProjectSet::parse(&query.projects);
        if query.auto_discovery {
            match self.lister.projects().await {
                Ok(discovered) => projects.extend(discovered),
                Err(err) => {
                    error!(message = "projects auto discovery failed", %err);
                    return text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
                }
            }
        }
        let projects = projects.exclude(excludes.as_ref());

        let cancel = self.shutdown.child_token();
        let collection = collect(&self.pool, &projects, &cancel).await;

        let mut body = match serde_json::to_vec(&collection.targets) {
            Ok(body) => body,
            Err(err) => {
                error!(message = "encode targets failed", %err);
                return text(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
            }
        };
        body.push(b'\n');

        let mut resp = Response::new(Full::new(Bytes::from(body)));
        resp.headers_mut()
            .insert(CONTENT_TYPE, HeaderValue::from_static(APPLICATION_JSON));
        if !collection.complete {
            resp.headers_mut()
                .insert(INCOMPLETE_HEADER, HeaderValue::from_static("true"));
        }

        resp
    }
}
