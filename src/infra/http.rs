//! `reqwest` implementation of the sync [`Transport`].
//!
//! Routes:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | list      | `GET {base}/{resource}?status=&page=&search=` |
//! | detail    | `GET {base}/{resource}/{id}` |
//! | create    | `POST {base}/{resource}` |
//! | update    | `PATCH {base}/{resource}/{id}` |
//! | delete    | `DELETE {base}/{resource}/{id}` |
//! | action    | `POST {base}/{resource}/{id}/{name}` |

use std::time::Duration;

use almanac_api_types::ApiErrorBody;
use async_trait::async_trait;
use metrics::counter;
use reqwest::{Client, Method, StatusCode, Url};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ApiSettings;
use crate::sync::{Descriptor, ErrorKind, MutationTarget, Operation, Transport, TransportError, View};

use super::error::InfraError;

const METRIC_HTTP_RETRY: &str = "almanac_http_retry_total";

#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    base: Url,
    token: Option<String>,
    max_retries: u32,
    retry_backoff: Duration,
}

impl HttpTransport {
    pub fn new(settings: &ApiSettings) -> Result<Self, InfraError> {
        let client = Client::builder()
            .user_agent(Self::user_agent())
            .timeout(settings.timeout)
            .build()
            .map_err(|err| InfraError::http_client(err.to_string()))?;

        Ok(Self {
            client,
            base: settings.base_url.clone(),
            token: settings.token.clone(),
            max_retries: settings.max_retries,
            retry_backoff: settings.retry_backoff,
        })
    }

    pub fn user_agent() -> &'static str {
        concat!("almanac/", env!("CARGO_PKG_VERSION"))
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|()| TransportError::validation(format!("base URL {} cannot be a base", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn fetch_request(&self, descriptor: &Descriptor) -> Result<Url, TransportError> {
        let resource = descriptor.resource.as_str();
        match &descriptor.view {
            View::List(params) => {
                let mut url = self.url(&[resource])?;
                let pairs = params.query_pairs();
                if !pairs.is_empty() {
                    let mut query = url.query_pairs_mut();
                    for (name, value) in &pairs {
                        query.append_pair(name, value);
                    }
                }
                Ok(url)
            }
            View::Detail(id) => self.url(&[resource, id]),
        }
    }

    fn mutation_request(&self, target: &MutationTarget) -> Result<(Method, Url), TransportError> {
        let resource = target.resource.as_str();
        match &target.operation {
            Operation::Create => Ok((Method::POST, self.url(&[resource])?)),
            Operation::Update { id } => Ok((Method::PATCH, self.url(&[resource, id])?)),
            Operation::Delete { id } => Ok((Method::DELETE, self.url(&[resource, id])?)),
            Operation::Action { id, name } => Ok((Method::POST, self.url(&[resource, id, name])?)),
        }
    }

    /// Send with retries of network and server failures.
    async fn request(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        let mut attempt = 0;
        loop {
            match self.send_once(method.clone(), url.clone(), body).await {
                Err(err) if err.kind.is_retryable() && attempt < self.max_retries => {
                    attempt += 1;
                    counter!(METRIC_HTTP_RETRY, "kind" => err.kind.as_str()).increment(1);
                    warn!(
                        method = %method,
                        url = %url,
                        attempt,
                        error = %err,
                        "Retrying request"
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                }
                result => return result,
            }
        }
    }

    async fn send_once(
        &self,
        method: Method,
        url: Url,
        body: Option<&Value>,
    ) -> Result<Value, TransportError> {
        debug!(method = %method, url = %url, "Sending request");
        let mut request = self.client.request(method, url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        if let Some(body) = body.filter(|body| !body.is_null()) {
            request = request.json(body);
        }

        let response = request
            .send()
            .await
            .map_err(|err| TransportError::network(err.to_string()))?;
        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|err| TransportError::network(err.to_string()))?;

        if !status.is_success() {
            let message = serde_json::from_slice::<ApiErrorBody>(&bytes)
                .map(|body| body.message)
                .unwrap_or_else(|_| {
                    format!("status {status} body {}", String::from_utf8_lossy(&bytes))
                });
            return Err(TransportError::new(kind_for_status(status), message));
        }

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes)
            .map_err(|err| TransportError::server(format!("failed to parse body: {err}")))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, descriptor: &Descriptor) -> Result<Value, TransportError> {
        let url = self.fetch_request(descriptor)?;
        self.request(Method::GET, url, None).await
    }

    async fn mutate(
        &self,
        target: &MutationTarget,
        payload: &Value,
    ) -> Result<Value, TransportError> {
        let (method, url) = self.mutation_request(target)?;
        self.request(method, url, Some(payload)).await
    }
}

/// Failure class of a non-success status.
pub fn kind_for_status(status: StatusCode) -> ErrorKind {
    match status.as_u16() {
        401 | 403 => ErrorKind::Unauthorized,
        404 | 410 => ErrorKind::NotFound,
        408 => ErrorKind::Network,
        429 => ErrorKind::Server,
        400..=499 => ErrorKind::Validation,
        _ => ErrorKind::Server,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::{ListParams, Resource};

    fn transport(base: &str) -> HttpTransport {
        HttpTransport::new(&ApiSettings {
            base_url: Url::parse(base).expect("url"),
            token: None,
            timeout: Duration::from_secs(1),
            max_retries: 0,
            retry_backoff: Duration::ZERO,
        })
        .expect("client")
    }

    #[test]
    fn status_mapping() {
        assert_eq!(kind_for_status(StatusCode::UNAUTHORIZED), ErrorKind::Unauthorized);
        assert_eq!(kind_for_status(StatusCode::FORBIDDEN), ErrorKind::Unauthorized);
        assert_eq!(kind_for_status(StatusCode::NOT_FOUND), ErrorKind::NotFound);
        assert_eq!(kind_for_status(StatusCode::UNPROCESSABLE_ENTITY), ErrorKind::Validation);
        assert_eq!(kind_for_status(StatusCode::CONFLICT), ErrorKind::Validation);
        assert_eq!(kind_for_status(StatusCode::REQUEST_TIMEOUT), ErrorKind::Network);
        assert_eq!(kind_for_status(StatusCode::BAD_GATEWAY), ErrorKind::Server);
    }

    #[test]
    fn list_url_carries_filters() {
        let transport = transport("https://admin.example/api/");
        let descriptor = Descriptor {
            resource: Resource::Sellers,
            view: View::List(ListParams {
                status: Some("pending".to_string()),
                page: Some(2),
                search: None,
            }),
        };

        let url = transport.fetch_request(&descriptor).expect("url");
        assert_eq!(
            url.as_str(),
            "https://admin.example/api/sellers?status=pending&page=2"
        );
    }

    #[test]
    fn ids_are_percent_encoded() {
        let transport = transport("https://admin.example/api/");
        let descriptor = Descriptor {
            resource: Resource::Blogs,
            view: View::Detail("a b/c".to_string()),
        };

        let url = transport.fetch_request(&descriptor).expect("url");
        assert_eq!(url.as_str(), "https://admin.example/api/blogs/a%20b%2Fc");
    }

    #[test]
    fn mutation_routes() {
        let transport = transport("https://admin.example/api/");
        let route = |operation: Operation| {
            let (method, url) = transport
                .mutation_request(&MutationTarget {
                    resource: Resource::Users,
                    operation,
                })
                .expect("route");
            (method, url.path().to_string())
        };

        assert_eq!(route(Operation::Create), (Method::POST, "/api/users".to_string()));
        assert_eq!(
            route(Operation::Update { id: "u1".to_string() }),
            (Method::PATCH, "/api/users/u1".to_string())
        );
        assert_eq!(
            route(Operation::Delete { id: "u1".to_string() }),
            (Method::DELETE, "/api/users/u1".to_string())
        );
        assert_eq!(
            route(Operation::Action {
                id: "u1".to_string(),
                name: "status".to_string()
            }),
            (Method::POST, "/api/users/u1/status".to_string())
        );
    }
}
