//! Outbound HTTP calls to the summarization backend.

use std::{collections::BTreeMap, time::Duration};

use async_trait::async_trait;
use reqwest::{
    multipart::{Form, Part},
    Client, Response, StatusCode,
};
use serde::de::DeserializeOwned;
use shared::{
    domain::Credential,
    error::ApiException,
    protocol::{
        AdminLoginRequest, AuthReply, ErrorResponse, ProfileResponse, PromptTemplate,
        TemplatesResponse, VideoSummary, UPLOAD_FILE_FIELD, UPLOAD_PROMPT_FIELD,
    },
};
use thiserror::Error;
use tracing::debug;
use url::Url;

/// Key/value pairs handed over by the identity provider's login widget.
pub type ProviderPayload = BTreeMap<String, String>;

const MAX_ERROR_BODY_CHARS: usize = 200;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("request to {endpoint} failed: {message}")]
    Transport {
        endpoint: &'static str,
        message: String,
    },
    #[error(transparent)]
    Api(#[from] ApiException),
    #[error("unexpected response from {endpoint}: {message}")]
    Decode {
        endpoint: &'static str,
        message: String,
    },
    #[error("invalid gateway url: {0}")]
    InvalidUrl(String),
}

#[derive(Debug, Clone)]
pub struct VideoFile {
    pub filename: String,
    pub mime_type: Option<String>,
    pub bytes: Vec<u8>,
}

impl VideoFile {
    pub fn new(filename: impl Into<String>, bytes: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            mime_type: None,
            bytes,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// A fully assembled upload request: the multipart fields plus the optional
/// bearer credential.
#[derive(Debug, Clone)]
pub struct VideoUpload {
    pub file: VideoFile,
    pub prompt: String,
    pub bearer: Option<Credential>,
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn fetch_templates(&self) -> Result<Vec<PromptTemplate>, GatewayError>;
    async fn upload_video(&self, upload: VideoUpload) -> Result<VideoSummary, GatewayError>;
    async fn authenticate(&self, payload: &ProviderPayload) -> Result<AuthReply, GatewayError>;
    async fn admin_login(&self, request: &AdminLoginRequest) -> Result<AuthReply, GatewayError>;
    async fn fetch_profile(&self, credential: &Credential)
        -> Result<ProfileResponse, GatewayError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEndpoints {
    pub templates: String,
    pub upload: String,
    pub authenticate: String,
    pub admin_login: String,
    pub profile: String,
}

impl Default for GatewayEndpoints {
    fn default() -> Self {
        Self {
            templates: "/static/prompts.json".into(),
            upload: "/upload_video/".into(),
            authenticate: "/auth/telegram".into(),
            admin_login: "/auth/admin".into(),
            profile: "/profile".into(),
        }
    }
}

pub struct HttpGateway {
    http: Client,
    base_url: Url,
    endpoints: GatewayEndpoints,
}

impl HttpGateway {
    pub fn new(base_url: &str) -> Result<Self, GatewayError> {
        Self::with_options(base_url, GatewayEndpoints::default(), None)
    }

    pub fn with_options(
        base_url: &str,
        endpoints: GatewayEndpoints,
        timeout: Option<Duration>,
    ) -> Result<Self, GatewayError> {
        let mut base_url = Url::parse(base_url)
            .map_err(|err| GatewayError::InvalidUrl(format!("{base_url}: {err}")))?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidUrl(format!(
                "{base_url} cannot be used as a base url"
            )));
        }
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let mut builder = Client::builder();
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let http = builder.build().map_err(|err| GatewayError::Transport {
            endpoint: "client",
            message: format!("failed to build http client: {err}"),
        })?;

        Ok(Self {
            http,
            base_url,
            endpoints,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url(&self, path: &str) -> Result<Url, GatewayError> {
        self.base_url
            .join(path.trim_start_matches('/'))
            .map_err(|err| GatewayError::InvalidUrl(format!("{path}: {err}")))
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn fetch_templates(&self) -> Result<Vec<PromptTemplate>, GatewayError> {
        const ENDPOINT: &str = "templates";
        let url = self.url(&self.endpoints.templates)?;
        debug!(%url, "gateway: fetching prompt templates");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| transport(ENDPOINT, err))?;
        let body: TemplatesResponse = read_json(ENDPOINT, response).await?;
        Ok(body.templates)
    }

    async fn upload_video(&self, upload: VideoUpload) -> Result<VideoSummary, GatewayError> {
        const ENDPOINT: &str = "upload";
        let url = self.url(&self.endpoints.upload)?;
        let VideoUpload {
            file,
            prompt,
            bearer,
        } = upload;
        debug!(
            %url,
            filename = %file.filename,
            size_bytes = file.bytes.len(),
            authorized = bearer.is_some(),
            "gateway: uploading video"
        );

        let mut part = Part::bytes(file.bytes).file_name(file.filename);
        if let Some(mime_type) = file.mime_type.as_deref() {
            part = part.mime_str(mime_type).map_err(|err| GatewayError::Decode {
                endpoint: ENDPOINT,
                message: format!("invalid mime type '{mime_type}': {err}"),
            })?;
        }
        let form = Form::new()
            .part(UPLOAD_FILE_FIELD, part)
            .text(UPLOAD_PROMPT_FIELD, prompt);

        let mut request = self.http.post(url).multipart(form);
        if let Some(credential) = bearer.as_ref() {
            request = request.bearer_auth(credential.as_str());
        }
        let response = request
            .send()
            .await
            .map_err(|err| transport(ENDPOINT, err))?;
        read_json(ENDPOINT, response).await
    }

    async fn authenticate(&self, payload: &ProviderPayload) -> Result<AuthReply, GatewayError> {
        const ENDPOINT: &str = "authenticate";
        let url = self.url(&self.endpoints.authenticate)?;
        debug!(
            %url,
            fields = payload.len(),
            "gateway: authenticating with identity provider payload"
        );
        let response = self
            .http
            .get(url)
            .query(payload)
            .send()
            .await
            .map_err(|err| transport(ENDPOINT, err))?;
        read_auth_reply(ENDPOINT, response).await
    }

    async fn admin_login(&self, request: &AdminLoginRequest) -> Result<AuthReply, GatewayError> {
        const ENDPOINT: &str = "admin_login";
        let url = self.url(&self.endpoints.admin_login)?;
        debug!(%url, username = %request.username, "gateway: admin login");
        let response = self
            .http
            .post(url)
            .json(request)
            .send()
            .await
            .map_err(|err| transport(ENDPOINT, err))?;
        read_auth_reply(ENDPOINT, response).await
    }

    async fn fetch_profile(
        &self,
        credential: &Credential,
    ) -> Result<ProfileResponse, GatewayError> {
        const ENDPOINT: &str = "profile";
        let url = self.url(&self.endpoints.profile)?;
        debug!(%url, "gateway: fetching profile");
        let response = self
            .http
            .get(url)
            .bearer_auth(credential.as_str())
            .send()
            .await
            .map_err(|err| transport(ENDPOINT, err))?;
        read_json(ENDPOINT, response).await
    }
}

fn transport(endpoint: &'static str, err: reqwest::Error) -> GatewayError {
    GatewayError::Transport {
        endpoint,
        message: err.to_string(),
    }
}

async fn read_body(
    endpoint: &'static str,
    response: Response,
) -> Result<(StatusCode, String), GatewayError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|err| transport(endpoint, err))?;
    Ok((status, body))
}

async fn read_json<T: DeserializeOwned>(
    endpoint: &'static str,
    response: Response,
) -> Result<T, GatewayError> {
    let (status, body) = read_body(endpoint, response).await?;
    if !status.is_success() {
        return Err(api_exception(status, &body).into());
    }
    serde_json::from_str(&body).map_err(|err| GatewayError::Decode {
        endpoint,
        message: err.to_string(),
    })
}

/// Auth endpoints answer refusals with `{"error": ...}` and a 4xx status; the
/// body decides, the status only matters when the body is unreadable.
async fn read_auth_reply(
    endpoint: &'static str,
    response: Response,
) -> Result<AuthReply, GatewayError> {
    let (status, body) = read_body(endpoint, response).await?;
    match serde_json::from_str::<AuthReply>(&body) {
        Ok(reply) => Ok(reply),
        Err(_) if !status.is_success() => Err(api_exception(status, &body).into()),
        Err(err) => Err(GatewayError::Decode {
            endpoint,
            message: err.to_string(),
        }),
    }
}

fn api_exception(status: StatusCode, body: &str) -> ApiException {
    let message = serde_json::from_str::<ErrorResponse>(body)
        .map(|payload| payload.error)
        .ok()
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.chars().take(MAX_ERROR_BODY_CHARS).collect())
        })
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("request failed")
                .to_string()
        });
    ApiException::new(status.as_u16(), message)
}

#[cfg(test)]
#[path = "tests/gateway_tests.rs"]
mod tests;
