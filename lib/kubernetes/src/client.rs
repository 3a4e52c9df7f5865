use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use http::header::CONTENT_TYPE;
use http::{Method, Request};
use http_body_util::{BodyExt, Full};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HttpClient;
use hyper_util::rt::TokioExecutor;
use serde::Deserialize;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;
use tracing::trace;

use super::config::{Auth, Config};
use super::resource::Resource;
use super::version::Version;
use super::{config, ObjectList};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(config::Error),
    #[error("build http request failed, {0}")]
    BuildRequest(http::Error),
    #[error("read http response failed, {0}")]
    ReadResponse(hyper::Error),
    #[error(transparent)]
    Http(hyper_util::client::legacy::Error),
    #[error("api server error, status: {}, reason: {}, message: {}", .0.status, .0.reason, .0.message)]
    Api(ErrorResponse),
    #[error("serialize request failed, {0}")]
    Serialize(serde_json::Error),
    #[error("deserialize response failed, {0}")]
    Deserialize(serde_json::Error),
    #[error("read watch event failed, {0}")]
    ReadEvents(std::io::Error),
    #[error("chunk line is too large")]
    LinesCodecMaxLineLengthExceeded,
    #[error("refresh token failed, {0}")]
    RefreshToken(std::io::Error),
}

impl Error {
    /// HTTP status code when the API server rejected the request.
    pub fn api_status(&self) -> Option<u16> {
        match self {
            Error::Api(resp) => Some(resp.code),
            _ => None,
        }
    }

    /// API machinery reason string, e.g. "NotFound" or "AlreadyExists".
    pub fn api_reason(&self) -> Option<&str> {
        match self {
            Error::Api(resp) => Some(resp.reason.as_str()),
            _ => None,
        }
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

/// An error response from the API.
#[derive(Debug, Deserialize)]
pub struct ErrorResponse {
    /// The status
    #[serde(default)]
    pub status: String,
    /// A message about the error
    #[serde(default)]
    pub message: String,
    /// The reason for the error
    #[serde(default)]
    pub reason: String,
    /// The error code
    pub code: u16,
}

/// Common query parameters used in list calls on collections
#[derive(Debug, Default)]
pub struct ListParams {
    /// A selector to restrict the list of returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict the list of returned objects by their fields.
    pub field_selector: Option<String>,

    /// Limit the number of results.
    ///
    /// If there are more results, the server will respond with a continue
    /// token which can be used to fetch another page of results.
    ///
    /// See [Kubernetes API docs](https://kubernetes.io/docs/reference/using-api/api-concepts/#retrieving-large-results-sets-in-chunks)
    pub limit: Option<u32>,

    /// Fetch a second page of results using a continue token returned from
    /// a previous limited list.
    pub continue_token: Option<String>,
}

/// Common query parameters used in watch calls on collections
#[derive(Debug, Default)]
pub struct WatchParams {
    /// A selector to restrict returned objects by their labels.
    pub label_selector: Option<String>,

    /// A selector to restrict returned objects by their fields.
    pub field_selector: Option<String>,

    /// Server-side timeout of the watch call, in seconds. The server closes
    /// the stream when it expires regardless of activity.
    pub timeout: Option<u32>,
}

/// A raw event returned from a watch query
///
/// Note that a watch query returns many of these as newline separated JSON
#[derive(Deserialize)]
#[serde(tag = "type", content = "object", rename_all = "UPPERCASE")]
pub enum WatchEvent<K> {
    /// Resource was added
    Added(K),
    /// Resource was modified
    Modified(K),
    /// Resource was deleted
    Deleted(K),
    /// There was some kind of error
    Error(ErrorResponse),
}

#[derive(Clone)]
pub struct Client {
    http_client: HttpClient<HttpsConnector<HttpConnector>, Full<Bytes>>,
    auth: Auth,
    endpoint: String,
    namespace: Option<String>,
}

impl Client {
    /// Build a client from the ambient cluster configuration, scoped to
    /// `namespace` (`None` watches and lists across all namespaces).
    pub fn new(namespace: Option<String>) -> Result<Self, Error> {
        let config = Config::load().map_err(Error::Config)?;

        Ok(Self::with_config(config, namespace))
    }

    pub fn with_config(config: Config, namespace: Option<String>) -> Self {
        let builder = HttpsConnectorBuilder::new()
            .with_tls_config(config.tls)
            .https_or_http();
        let mut inner = HttpConnector::new();
        inner.enforce_http(false);
        let connector = builder.enable_http1().wrap_connector(inner);

        let http_client =
            hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(connector);

        let endpoint = config
            .cluster_url
            .to_string()
            .trim_end_matches('/')
            .to_string();

        Client {
            http_client,
            endpoint,
            auth: config.auth,
            namespace,
        }
    }

    /// Retrieve version info of the API server; doubles as a connectivity
    /// and credentials probe.
    pub async fn version(&self) -> Result<Version, Error> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(format!("{}/version", self.endpoint))
            .body(Full::<Bytes>::default())?;

        self.unary(req).await
    }

    /// List a collection of a resource.
    pub async fn list<R: Resource>(&self, params: &ListParams) -> Result<ObjectList<R>, Error> {
        let query = {
            let mut builder = form_urlencoded::Serializer::new(String::new());

            if let Some(field_selector) = &params.field_selector {
                builder.append_pair("fieldSelector", field_selector);
            }
            if let Some(label_selector) = &params.label_selector {
                builder.append_pair("labelSelector", label_selector);
            }
            if let Some(limit) = &params.limit {
                builder.append_pair("limit", &limit.to_string());
            }
            if let Some(continue_token) = &params.continue_token {
                builder.append_pair("continue", continue_token);
            }

            builder.finish()
        };

        let req = Request::builder()
            .method(Method::GET)
            .uri(format!(
                "{}{}?{}",
                self.endpoint,
                R::url_path(self.namespace.as_deref()),
                query
            ))
            .body(Full::<Bytes>::default())?;

        self.unary(req).await
    }

    /// Fetch a single object by namespace and name. An empty namespace
    /// addresses a cluster-scoped resource.
    pub async fn get<R: Resource>(&self, namespace: &str, name: &str) -> Result<R, Error> {
        let req = Request::builder()
            .method(Method::GET)
            .uri(self.object_url::<R>(namespace, name))
            .body(Full::<Bytes>::default())?;

        self.unary(req).await
    }

    /// Apply an RFC 6902 JSON Patch to a single object. `patch` must be the
    /// serialized operation array.
    pub async fn patch<R: Resource>(
        &self,
        namespace: &str,
        name: &str,
        patch: &serde_json::Value,
    ) -> Result<R, Error> {
        let body = serde_json::to_vec(patch).map_err(Error::Serialize)?;
        let req = Request::builder()
            .method(Method::PATCH)
            .uri(self.object_url::<R>(namespace, name))
            .header(CONTENT_TYPE, "application/json-patch+json")
            .body(Full::from(Bytes::from(body)))?;

        self.unary(req).await
    }

    /// Create an object in the namespace carried by its metadata.
    pub async fn create<R: Resource>(&self, resource: &R) -> Result<R, Error> {
        let namespace = resource.metadata().namespace.clone();
        let mut body = serde_json::to_value(resource).map_err(Error::Serialize)?;
        body["apiVersion"] = R::api_version().into();
        body["kind"] = R::KIND.into();
        let body = serde_json::to_vec(&body).map_err(Error::Serialize)?;

        let namespace = (!namespace.is_empty()).then_some(namespace);
        let req = Request::builder()
            .method(Method::POST)
            .uri(format!(
                "{}{}",
                self.endpoint,
                R::url_path(namespace.as_deref())
            ))
            .header(CONTENT_TYPE, "application/json")
            .body(Full::from(Bytes::from(body)))?;

        self.unary(req).await
    }

    /// Delete a single object. The API error for a missing object is
    /// returned as-is; idempotency is the caller's policy.
    pub async fn delete<R: Resource>(&self, namespace: &str, name: &str) -> Result<(), Error> {
        let req = Request::builder()
            .method(Method::DELETE)
            .uri(self.object_url::<R>(namespace, name))
            .body(Full::<Bytes>::default())?;

        // The response body is a Status or the deleted object; neither is
        // of interest.
        let _ = self.unary::<serde_json::Value>(req).await?;

        Ok(())
    }

    /// watch returns a stream of WatchEvent<R> that ends on the server-side
    /// timeout, an error, or connection loss. There is no recovery here;
    /// the caller owns re-opening and backoff.
    pub async fn watch<R: Resource>(
        &self,
        params: &WatchParams,
        version: &str,
    ) -> Result<BoxStream<'static, Result<WatchEvent<R>, Error>>, Error> {
        let query = {
            let mut builder = form_urlencoded::Serializer::new(String::new());

            builder.append_pair("resourceVersion", version);
            builder.append_pair("watch", "true");
            if let Some(timeout) = params.timeout {
                builder.append_pair("timeoutSeconds", timeout.to_string().as_str());
            }

            if let Some(label_selector) = params.label_selector.as_ref() {
                builder.append_pair("labelSelector", label_selector);
            }
            if let Some(field_selector) = params.field_selector.as_ref() {
                builder.append_pair("fieldSelector", field_selector);
            }

            builder.finish()
        };
        let uri = format!(
            "{}{}?{}",
            self.endpoint,
            R::url_path(self.namespace.as_deref()),
            query
        );

        trace!(message = "doing http request", uri);

        let mut req = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::<Bytes>::default())?;

        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        self.request_events(req).await
    }

    fn object_url<R: Resource>(&self, namespace: &str, name: &str) -> String {
        let namespace = (!namespace.is_empty()).then_some(namespace);

        format!("{}{}/{}", self.endpoint, R::url_path(namespace), name)
    }

    /// Send a request, read the whole response, deserialize success or
    /// surface the API error payload.
    async fn unary<T: serde::de::DeserializeOwned>(
        &self,
        mut req: Request<Full<Bytes>>,
    ) -> Result<T, Error> {
        self.auth.apply(&mut req).map_err(Error::RefreshToken)?;

        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        let body = incoming.collect().await?.to_bytes();

        if parts.status.is_success() {
            serde_json::from_slice(&body).map_err(Error::Deserialize)
        } else {
            match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(err) => Err(Error::Api(err)),
                Err(_) => Err(Error::Api(ErrorResponse {
                    status: "Failure".into(),
                    message: String::from_utf8_lossy(&body).into_owned(),
                    reason: String::new(),
                    code: parts.status.as_u16(),
                })),
            }
        }
    }

    async fn request_events<R: Resource>(
        &self,
        req: Request<Full<Bytes>>,
    ) -> Result<BoxStream<'static, Result<WatchEvent<R>, Error>>, Error> {
        let resp = self.http_client.request(req).await.map_err(Error::Http)?;
        let (parts, incoming) = resp.into_parts();
        if !parts.status.is_success() {
            let body = incoming.collect().await?.to_bytes();
            return match serde_json::from_slice::<ErrorResponse>(&body) {
                Ok(err) => Err(Error::Api(err)),
                Err(err) => Err(Error::Deserialize(err)),
            };
        }

        let frames = FramedRead::new(
            StreamReader::new(incoming.into_data_stream().map_err(|err| {
                // Unexpected EOF from chunked decoder.
                // Tends to happen when watching for 300+s. This will be ignored
                if err.to_string().contains("unexpected EOF during chunk") {
                    return std::io::Error::new(std::io::ErrorKind::UnexpectedEof, err);
                }

                std::io::Error::other(err)
            })),
            LinesCodec::new(),
        );

        Ok(Box::pin(frames.filter_map(|result| async {
            match result {
                Ok(line) => {
                    match serde_json::from_str::<WatchEvent<R>>(&line) {
                        Ok(event) => Some(Ok(event)),
                        Err(err) => {
                            // Ignore EOF error that can happen for incomplete line from `decode_eof`.
                            if err.is_eof() {
                                return None;
                            }

                            // Got general error response
                            if let Ok(e_resp) = serde_json::from_str::<ErrorResponse>(&line) {
                                return Some(Err(Error::Api(e_resp)));
                            }
                            // Parsing error
                            Some(Err(Error::Deserialize(err)))
                        }
                    }
                }
                Err(LinesCodecError::Io(err)) => match err.kind() {
                    // Client timeout
                    std::io::ErrorKind::TimedOut => {
                        tracing::warn!("timeout in poll: {}", err);
                        None
                    }
                    // Unexpected EOF from chunked decoder.
                    // Tends to happen after 300+s of watching.
                    std::io::ErrorKind::UnexpectedEof => {
                        tracing::warn!("eof in poll: {}", err);
                        None
                    }
                    _ => Some(Err(Error::ReadEvents(err))),
                },

                // Reached the maximum line length without finding a newline.
                // This should never happen because we're using the default `usize::MAX`.
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    Some(Err(Error::LinesCodecMaxLineLengthExceeded))
                }
            }
        })))
    }
}
