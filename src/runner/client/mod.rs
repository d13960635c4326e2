//! The api server client used by the operator. `ClusterApi` is its whole surface for reconciles,
//! and the informers use `list` and `watch`.
mod request;
mod tls;
mod watch;

pub use self::watch::{WatchEvent, WatchStream};

use crate::config::ClientConfig;
use crate::k8s_types::K8sType;
use crate::reconcile::ClusterApi;
use crate::resource::ObjectIdRef;
use crate::runner::metrics::ClientMetrics;

use async_trait::async_trait;
use http::{Request, Response, StatusCode};
use hyper::client::Client as HyperClient;
use hyper::client::HttpConnector;
use hyper::Body;
use hyper_openssl::HttpsConnector;
use serde::de::DeserializeOwned;
use serde_json::Value;

use std::io;
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug)]
pub enum Error {
    Io(hyper::Error),
    Serde(serde_json::Error),
    /// A non-success response. `status` is the `Status` object from the body, when it had one.
    Http {
        code: StatusCode,
        status: Option<ApiError>,
    },
    Request(http::Error),
    InvalidUrl(String),
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Serde(e) => Some(e),
            Error::Request(e) => Some(e),
            Error::Http {
                status: Some(status),
                ..
            } => Some(status),
            Error::Http { .. } | Error::InvalidUrl(_) => None,
        }
    }
}

impl Error {
    pub fn http(code: StatusCode) -> Error {
        Error::Http { code, status: None }
    }

    pub fn is_http_410(&self) -> bool {
        self.is_http_status(410)
    }

    pub fn is_http_status(&self, expected: u16) -> bool {
        match self {
            Error::Http { code, .. } => code.as_u16() == expected,
            _ => false,
        }
    }

    async fn from_response(response: Response<Body>) -> Error {
        let code = response.status();
        let body = match hyper::body::to_bytes(response.into_body()).await {
            Ok(body) => body,
            Err(err) => return Error::Io(err),
        };
        if code != StatusCode::NOT_FOUND {
            log::warn!(
                "Response status: {}, body: {}",
                code,
                String::from_utf8_lossy(body.as_ref())
            );
        }
        Error::Http {
            code,
            status: serde_json::from_slice(body.as_ref()).ok(),
        }
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match *self {
            Error::Io(ref e) => write!(f, "Io Error: {}", e),
            Error::Serde(ref e) => write!(f, "(De)Serialization error: {}", e),
            Error::Http {
                ref code,
                status: Some(ref status),
            } => write!(f, "Http Error: {}: {}", code, status.message),
            Error::Http { ref code, .. } => write!(f, "Http Error: {}", code),
            Error::Request(ref e) => write!(f, "Invalid request: {}", e),
            Error::InvalidUrl(ref url) => write!(f, "Invalid api server url: '{}'", url),
        }
    }
}

impl From<hyper::Error> for Error {
    fn from(e: hyper::Error) -> Error {
        Error::Io(e)
    }
}
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Error {
        Error::Serde(e)
    }
}
impl From<http::Error> for Error {
    fn from(e: http::Error) -> Error {
        Error::Request(e)
    }
}

#[derive(Debug)]
struct ClientInner {
    http_client: HyperClient<HttpsConnector<HttpConnector>>,
    config: ClientConfig,
    metrics: ClientMetrics,
}

#[derive(Debug, Clone)]
pub struct Client(Arc<ClientInner>);

impl Client {
    pub fn new(config: ClientConfig, metrics: ClientMetrics) -> Result<Client, io::Error> {
        let https = tls::https_connector(&config)?;
        let inner = ClientInner {
            http_client: HyperClient::builder().build(https),
            config,
            metrics,
        };
        Ok(Client(Arc::new(inner)))
    }

    pub async fn list(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<ObjectList<Value>, Error> {
        let req = request::list_request(&self.0.config, k8s_type, label_selector, namespace)?;
        self.send_json(req).await
    }

    /// Starts a watch. Events are decoded as they arrive, until the server ends the response.
    pub async fn watch(
        &self,
        k8s_type: &K8sType,
        namespace: Option<&str>,
        resource_version: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<WatchStream, Error> {
        let req = request::watch_request(
            &self.0.config,
            k8s_type,
            resource_version,
            label_selector,
            None,
            namespace,
        )?;
        let response = self.send(req).await?;
        Ok(WatchStream::new(response.into_body()))
    }

    /// Executes the request, turning any non-success response into an `Error::Http`
    async fn send(&self, req: Request<Body>) -> Result<Response<Body>, Error> {
        let method = req.method().clone();
        let uri = req.uri().clone();
        log::debug!("Starting {} request to: {}", method, uri);

        let start_time = Instant::now();
        let timer = self.0.metrics.request_started();
        let result = self.0.http_client.request(req).await;
        timer.observe_duration();

        let response = result.map_err(|err| {
            log::error!("Failed to execute {} request to: {}, err: {}", method, uri, err);
            Error::from(err)
        })?;
        log::debug!(
            "Finished {} request to: {}, status: {}, duration: {}ms",
            method,
            uri,
            response.status(),
            start_time.elapsed().as_millis()
        );
        if response.status().is_success() {
            Ok(response)
        } else {
            Err(Error::from_response(response).await)
        }
    }

    async fn send_json<T: DeserializeOwned>(&self, req: Request<Body>) -> Result<T, Error> {
        let response = self.send(req).await?;
        let body = hyper::body::to_bytes(response.into_body()).await?;
        log::trace!("Got response body: {}", String::from_utf8_lossy(body.as_ref()));
        Ok(serde_json::from_slice(body.as_ref())?)
    }
}

#[async_trait]
impl ClusterApi for Client {
    async fn get(&self, k8s_type: &K8sType, id: &ObjectIdRef<'_>) -> Result<Option<Value>, Error> {
        let req = request::get_request(&self.0.config, k8s_type, id)?;
        match self.send_json(req).await {
            Ok(object) => Ok(Some(object)),
            Err(ref err) if err.is_http_status(404) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create(&self, k8s_type: &K8sType, object: &Value) -> Result<Value, Error> {
        let req = request::create_request(&self.0.config, k8s_type, object)?;
        self.send_json(req).await
    }

    async fn replace(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        object: &Value,
    ) -> Result<Value, Error> {
        let req = request::replace_request(&self.0.config, k8s_type, id, object)?;
        self.send_json(req).await
    }

    async fn replace_status(
        &self,
        k8s_type: &K8sType,
        id: &ObjectIdRef<'_>,
        object: &Value,
    ) -> Result<Value, Error> {
        let req = request::replace_status_request(&self.0.config, k8s_type, id, object)?;
        self.send_json(req).await
    }
}

/// The `Status` object the api server returns with failed requests and in watch error events
#[derive(Deserialize, Serialize, Debug, Clone, Eq, PartialEq)]
pub struct ApiError {
    pub status: String,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub reason: String,
    pub code: u16,
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "Api Error: status: '{}', code: {}, reason: '{}', message: '{}'",
            self.status, self.code, self.reason, self.message
        )
    }
}
impl std::error::Error for ApiError {}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ListMeta {
    #[serde(rename = "resourceVersion")]
    pub resource_version: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Clone)]
pub struct ObjectList<T> {
    pub metadata: ListMeta,
    pub items: Vec<T>,
}
