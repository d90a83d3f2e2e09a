use crate::{
    types::{AuthRequest, AuthToken, Envelope},
    Client, Egress, EgressReq, Error, Host, Node, Result,
};
use parking_lot::RwLock;
use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// How much of an error response body is carried in error messages.
const BODY_SNIPPET_LEN: usize = 256;

/// Netmaker REST transport. Holds the last bearer token and refreshes it
/// transparently when a request comes back unauthorized.
pub struct HttpClient {
    base_url: String,
    username: String,
    password: String,
    client: reqwest::Client,
    token: RwLock<Option<String>>,
}

impl HttpClient {
    pub fn new(
        base_url: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Result<Self> {
        let base_url = base_url.into();
        let username = username.into();
        let password = password.into();
        if base_url.is_empty() {
            return Err(Error::Config("base URL is required"));
        }
        if username.is_empty() {
            return Err(Error::Config("username is required"));
        }
        if password.is_empty() {
            return Err(Error::Config("password is required"));
        }

        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .build()
            .map_err(|source| Error::Http {
                op: "client",
                source,
            })?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            username,
            password,
            client,
            token: RwLock::new(None),
        })
    }

    /// Obtains a fresh token and stores it in the credential slot.
    async fn refresh_token(&self) -> Result<()> {
        const OP: &str = "authenticate";
        let url = format!("{}/api/users/adm/authenticate", self.base_url);
        let rsp = self
            .client
            .post(&url)
            .json(&AuthRequest {
                username: &self.username,
                password: &self.password,
            })
            .send()
            .await
            .map_err(|source| Error::Http { op: OP, source })?;

        let body: Envelope<AuthToken> = decode_json(OP, rsp, &[StatusCode::OK]).await?;
        check_code(OP, body.code, &body.message, &[StatusCode::OK])?;
        if body.response.auth_token.is_empty() {
            return Err(Error::MissingToken);
        }

        *self.token.write() = Some(body.response.auth_token);
        tracing::debug!("refreshed bearer token");
        Ok(())
    }

    /// Returns the current token, authenticating first if none is held.
    async fn token(&self) -> Result<String> {
        if let Some(token) = self.token.read().clone() {
            return Ok(token);
        }
        self.refresh_token().await?;
        self.token.read().clone().ok_or(Error::MissingToken)
    }

    fn request(
        &self,
        method: &Method,
        url: &str,
        body: Option<&EgressReq>,
        token: &str,
    ) -> reqwest::RequestBuilder {
        let mut req = self.client.request(method.clone(), url).bearer_auth(token);
        if let Some(body) = body {
            req = req.json(body);
        }
        req
    }

    /// Sends a request with the held token. On a 401 the token is refreshed
    /// and the request retried exactly once; a second 401 is terminal.
    async fn send(
        &self,
        op: &'static str,
        method: Method,
        url: String,
        body: Option<&EgressReq>,
    ) -> Result<reqwest::Response> {
        let token = self.token().await?;
        let rsp = self
            .request(&method, &url, body, &token)
            .send()
            .await
            .map_err(|source| Error::Http { op, source })?;
        if rsp.status() != StatusCode::UNAUTHORIZED {
            return Ok(rsp);
        }

        tracing::debug!(%op, "token rejected; re-authenticating");
        self.refresh_token().await?;
        let token = self.token().await?;
        let rsp = self
            .request(&method, &url, body, &token)
            .send()
            .await
            .map_err(|source| Error::Http { op, source })?;
        if rsp.status() == StatusCode::UNAUTHORIZED {
            return Err(Error::Unauthorized { op });
        }
        Ok(rsp)
    }
}

#[async_trait::async_trait]
impl Client for HttpClient {
    async fn authenticate(&self) -> Result<()> {
        self.refresh_token().await
    }

    async fn list_hosts(&self) -> Result<Vec<Host>> {
        const OP: &str = "list_hosts";
        let url = format!("{}/api/hosts", self.base_url);
        let rsp = self.send(OP, Method::GET, url, None).await?;
        decode_json(OP, rsp, &[StatusCode::OK]).await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>> {
        const OP: &str = "list_nodes";
        let url = format!("{}/api/nodes", self.base_url);
        let rsp = self.send(OP, Method::GET, url, None).await?;
        decode_json(OP, rsp, &[StatusCode::OK]).await
    }

    async fn list_egress(&self, network: &str) -> Result<Vec<Egress>> {
        const OP: &str = "list_egress";
        let url = format!("{}/api/v1/egress?network={network}", self.base_url);
        let rsp = self.send(OP, Method::GET, url, None).await?;
        let body: Envelope<Vec<Egress>> = decode_json(OP, rsp, &[StatusCode::OK]).await?;
        check_code(OP, body.code, &body.message, &[StatusCode::OK])?;
        Ok(body.response)
    }

    async fn create_egress(&self, req: EgressReq) -> Result<Egress> {
        const OP: &str = "create_egress";
        const ACCEPT: &[StatusCode] = &[StatusCode::OK, StatusCode::CREATED];
        let url = format!("{}/api/v1/egress", self.base_url);
        let rsp = self.send(OP, Method::POST, url, Some(&req)).await?;
        let body: Envelope<Egress> = decode_json(OP, rsp, ACCEPT).await?;
        check_code(OP, body.code, &body.message, ACCEPT)?;
        Ok(body.response)
    }

    async fn update_egress(&self, req: EgressReq) -> Result<Egress> {
        const OP: &str = "update_egress";
        let url = format!("{}/api/v1/egress", self.base_url);
        let rsp = self.send(OP, Method::PUT, url, Some(&req)).await?;
        let body: Envelope<Egress> = decode_json(OP, rsp, &[StatusCode::OK]).await?;
        check_code(OP, body.code, &body.message, &[StatusCode::OK])?;
        Ok(body.response)
    }

    async fn delete_egress(&self, id: &str) -> Result<()> {
        const OP: &str = "delete_egress";
        let url = format!("{}/api/v1/egress?id={id}", self.base_url);
        let rsp = self.send(OP, Method::DELETE, url, None).await?;
        let status = rsp.status();
        // A 204 carries no body, so the JSON tiers do not apply here.
        if status != StatusCode::OK && status != StatusCode::NO_CONTENT {
            let body = snippet(&rsp.text().await.unwrap_or_default());
            return Err(Error::Status {
                op: OP,
                status,
                body,
            });
        }
        Ok(())
    }
}

/// Applies the status and content-type tiers, then decodes the body.
async fn decode_json<T: DeserializeOwned>(
    op: &'static str,
    rsp: reqwest::Response,
    accept: &[StatusCode],
) -> Result<T> {
    let status = rsp.status();
    if !accept.contains(&status) {
        let body = snippet(&rsp.text().await.unwrap_or_default());
        return Err(Error::Status { op, status, body });
    }

    let content_type = rsp
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !content_type.contains("application/json") {
        return Err(Error::ContentType { op, content_type });
    }

    rsp.json().await.map_err(|source| Error::Http { op, source })
}

/// Third validation tier: a non-zero body `Code` must be in the accepted set.
fn check_code(op: &'static str, code: i64, message: &str, accept: &[StatusCode]) -> Result<()> {
    if code == 0 || accept.iter().any(|status| i64::from(status.as_u16()) == code) {
        return Ok(());
    }
    Err(Error::Code {
        op,
        code,
        message: message.to_string(),
    })
}

fn snippet(body: &str) -> String {
    if body.len() <= BODY_SNIPPET_LEN {
        return body.to_string();
    }
    let mut end = BODY_SNIPPET_LEN;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &body[..end])
}
