use std::time::Duration;

use reelsync_protocol::constants::{DELETE_PATH, SIGN_PATH};
use reelsync_protocol::{DeleteRequest, SignQuery, SignResponse};
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use tracing::debug;

use crate::{SignFuture, SignRequest, SignRequestError, SignedDestination, SignedRequestProvider};

/// HTTP client for the signing and deletion endpoints.
pub struct HttpSigner {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpSigner {
    /// Creates a signer for the API at `base_url`.
    ///
    /// When `auth_token` is set every request carries it as a bearer token.
    pub fn new(
        base_url: &str,
        auth_token: Option<&str>,
        timeout: Duration,
    ) -> Result<Self, SignRequestError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = auth_token {
            headers.insert(
                AUTHORIZATION,
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|_| SignRequestError::InvalidToken)?,
            );
        }

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn map_send_error(&self, e: reqwest::Error) -> SignRequestError {
        if e.is_timeout() {
            SignRequestError::Timeout(self.timeout)
        } else {
            SignRequestError::Http(e)
        }
    }

    async fn check(resp: reqwest::Response) -> Result<Vec<u8>, SignRequestError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SignRequestError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn sign_inner(&self, request: &SignRequest) -> Result<SignedDestination, SignRequestError> {
        if request.resource_name.trim().is_empty() {
            return Err(SignRequestError::InvalidRequest(
                "resource name must not be empty".into(),
            ));
        }

        let query = SignQuery {
            file_name: request.resource_name.clone(),
            file_type: request.mime_type.clone(),
            folder_name: request.folder.clone(),
            is_static: request.is_static,
        };
        debug!(
            resource = %request.resource_name,
            folder = %request.folder,
            is_static = request.is_static,
            "requesting signed destination"
        );

        let resp = self
            .http
            .get(self.endpoint(SIGN_PATH))
            .query(&query)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        let body = Self::check(resp).await?;
        parse_sign_response(&body)
    }

    async fn delete_inner(
        &self,
        folder: &str,
        filename: &str,
        is_static: bool,
    ) -> Result<(), SignRequestError> {
        if filename.trim().is_empty() {
            return Err(SignRequestError::InvalidRequest(
                "filename must not be empty".into(),
            ));
        }

        let body = DeleteRequest {
            folder: folder.to_string(),
            filename: filename.to_string(),
            is_static,
        };
        debug!(folder, filename, "requesting remote deletion");

        let resp = self
            .http
            .post(self.endpoint(DELETE_PATH))
            .json(&body)
            .send()
            .await
            .map_err(|e| self.map_send_error(e))?;
        Self::check(resp).await?;
        Ok(())
    }
}

impl SignedRequestProvider for HttpSigner {
    fn sign<'a>(&'a self, request: &'a SignRequest) -> SignFuture<'a, SignedDestination> {
        Box::pin(self.sign_inner(request))
    }

    fn delete<'a>(&'a self, folder: &'a str, filename: &'a str, is_static: bool) -> SignFuture<'a, ()> {
        Box::pin(self.delete_inner(folder, filename, is_static))
    }
}

/// Decodes a signing response, rejecting ones without a write URL.
fn parse_sign_response(body: &[u8]) -> Result<SignedDestination, SignRequestError> {
    let resp: SignResponse =
        serde_json::from_slice(body).map_err(|e| SignRequestError::Malformed(e.to_string()))?;
    if resp.signed_request.is_empty() {
        return Err(SignRequestError::Malformed("empty signedRequest".into()));
    }
    Ok(SignedDestination {
        write_url: resp.signed_request,
        public_url: resp.url,
    })
}
