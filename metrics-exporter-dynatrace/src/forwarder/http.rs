use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Collected, Full};
use hyper::{
    header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE, USER_AGENT},
    Method, Request, Uri,
};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tracing::warn;

use super::{Transport, TransportError, TransportFuture, TransportResponse};
use crate::builder::BuildError;

const CONTENT_TYPE_VALUE: &str = "text/plain; charset=UTF-8";
const USER_AGENT_VALUE: &str = concat!("metrics-exporter-dynatrace/", env!("CARGO_PKG_VERSION"));

/// Sends request bodies to the ingest API over HTTP or HTTPS.
pub struct HttpTransport {
    client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    endpoint: Uri,
    authorization: Option<HeaderValue>,
}

impl HttpTransport {
    /// Creates a new `HttpTransport` posting to the given endpoint.
    ///
    /// # Errors
    ///
    /// If the API token is not a valid header value, an error will be returned.
    pub fn new(endpoint: Uri, api_token: Option<&str>) -> Result<Self, BuildError> {
        // Fall back to the bundled Mozilla roots on hosts without a usable certificate store.
        let tls = HttpsConnectorBuilder::new().with_native_roots().unwrap_or_else(|e| {
            warn!(error = %e, "Failed to load native root certificates, using bundled roots.");
            HttpsConnectorBuilder::new().with_webpki_roots()
        });
        let https = tls.https_or_http().enable_http1().build();
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(https);

        let authorization = api_token.map(api_token_auth).transpose()?;

        Ok(Self { client, endpoint, authorization })
    }

    /// Returns the endpoint requests are sent to.
    pub fn endpoint(&self) -> &Uri {
        &self.endpoint
    }
}

impl Transport for HttpTransport {
    fn send(&self, body: Bytes) -> TransportFuture<'_> {
        Box::pin(async move {
            let request = build_request(&self.endpoint, self.authorization.as_ref(), body)?;
            let response = self.client.request(request).await.map_err(TransportError::Request)?;

            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map(Collected::to_bytes)
                .map_err(TransportError::Body)?;

            Ok(TransportResponse { status, body })
        })
    }
}

fn build_request(
    endpoint: &Uri,
    authorization: Option<&HeaderValue>,
    body: Bytes,
) -> Result<Request<Full<Bytes>>, TransportError> {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri(endpoint.clone())
        .header(CONTENT_TYPE, CONTENT_TYPE_VALUE)
        .header(USER_AGENT, USER_AGENT_VALUE);
    if let Some(auth) = authorization {
        builder = builder.header(AUTHORIZATION, auth.clone());
    }

    builder.body(Full::new(body)).map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

fn api_token_auth(api_token: &str) -> Result<HeaderValue, BuildError> {
    let mut header = HeaderValue::try_from(format!("Api-Token {api_token}"))
        .map_err(|_| BuildError::InvalidApiToken)?;
    header.set_sensitive(true);
    Ok(header)
}
