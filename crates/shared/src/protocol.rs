use serde::{Deserialize, Serialize};

use crate::domain::{Identity, TemplateId};

/// Multipart field carrying the video bytes on upload.
pub const UPLOAD_FILE_FIELD: &str = "file";
/// Multipart field carrying the prompt text on upload.
pub const UPLOAD_PROMPT_FIELD: &str = "prompt";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTemplate {
    pub id: TemplateId,
    pub name: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TemplatesResponse {
    pub templates: Vec<PromptTemplate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoSummary {
    pub summary: String,
    pub transcription: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthResponse {
    pub token: String,
    pub user: Identity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// Body of `/auth/*` answers. The backend reports refusals in-band, so a
/// non-blank `error` field wins over everything else in the payload.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(try_from = "RawAuthReply")]
pub enum AuthReply {
    Rejected(ErrorResponse),
    Granted(AuthResponse),
}

#[derive(Deserialize)]
struct RawAuthReply {
    #[serde(default)]
    error: Option<String>,
    token: Option<String>,
    user: Option<Identity>,
}

impl TryFrom<RawAuthReply> for AuthReply {
    type Error = String;

    fn try_from(raw: RawAuthReply) -> Result<Self, Self::Error> {
        if let Some(error) = raw.error.filter(|error| !error.trim().is_empty()) {
            return Ok(Self::Rejected(ErrorResponse { error }));
        }
        match (raw.token, raw.user) {
            (Some(token), Some(user)) => Ok(Self::Granted(AuthResponse { token, user })),
            (None, _) => Err("auth reply carries neither an error nor a token".into()),
            (Some(_), None) => Err("auth reply carries a token but no user".into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProfileResponse {
    pub user: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remaining_usage_seconds: Option<u64>,
}

impl ProfileResponse {
    /// The backend's own figure when it sent one, else derived from the user.
    pub fn remaining_secs(&self) -> Option<u64> {
        self.remaining_usage_seconds
            .or_else(|| self.user.usage_remaining_secs())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdminLoginRequest {
    pub username: String,
    pub password: String,
}
