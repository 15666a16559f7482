//! Scripted gateway shared by the store tests.

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result as AnyResult};
use async_trait::async_trait;
use serde_json::Value;
use shared::{
    domain::{Credential, Identity},
    error::ApiException,
    protocol::{
        AdminLoginRequest, AuthReply, AuthResponse, ErrorResponse, ProfileResponse,
        PromptTemplate, VideoSummary,
    },
};
use storage::{KeyValueStore, MemoryStore, SlotWrite};
use tokio::sync::Notify;

use crate::gateway::{Gateway, GatewayError, ProviderPayload, VideoFile, VideoUpload};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum GatewayCall {
    FetchTemplates,
    Upload {
        filename: String,
        prompt: String,
        bearer: Option<String>,
    },
    Authenticate(ProviderPayload),
    AdminLogin(String),
    FetchProfile(String),
}

#[derive(Default)]
pub(crate) struct ScriptedGateway {
    templates: Mutex<VecDeque<Result<Vec<PromptTemplate>, GatewayError>>>,
    uploads: Mutex<VecDeque<Result<VideoSummary, GatewayError>>>,
    logins: Mutex<VecDeque<Result<AuthReply, GatewayError>>>,
    profiles: Mutex<VecDeque<Result<ProfileResponse, GatewayError>>>,
    calls: Mutex<Vec<GatewayCall>>,
    upload_gate: Option<Arc<Notify>>,
    profile_gate: Option<Arc<Notify>>,
}

impl ScriptedGateway {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Uploads park until the returned handle is notified.
    pub(crate) fn gated() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let gateway = Self {
            upload_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (gateway, gate)
    }

    /// Profile checks park until the returned handle is notified.
    pub(crate) fn gated_profile() -> (Self, Arc<Notify>) {
        let gate = Arc::new(Notify::new());
        let gateway = Self {
            profile_gate: Some(Arc::clone(&gate)),
            ..Self::default()
        };
        (gateway, gate)
    }

    pub(crate) fn push_templates(&self, outcome: Result<Vec<PromptTemplate>, GatewayError>) {
        self.templates.lock().expect("lock").push_back(outcome);
    }

    pub(crate) fn push_upload(&self, outcome: Result<VideoSummary, GatewayError>) {
        self.uploads.lock().expect("lock").push_back(outcome);
    }

    pub(crate) fn push_login(&self, outcome: Result<AuthReply, GatewayError>) {
        self.logins.lock().expect("lock").push_back(outcome);
    }

    pub(crate) fn push_profile(&self, outcome: Result<ProfileResponse, GatewayError>) {
        self.profiles.lock().expect("lock").push_back(outcome);
    }

    pub(crate) fn calls(&self) -> Vec<GatewayCall> {
        self.calls.lock().expect("lock").clone()
    }

    fn record(&self, call: GatewayCall) {
        self.calls.lock().expect("lock").push(call);
    }

    fn next<T>(
        queue: &Mutex<VecDeque<Result<T, GatewayError>>>,
        endpoint: &'static str,
    ) -> Result<T, GatewayError> {
        queue
            .lock()
            .expect("lock")
            .pop_front()
            .unwrap_or_else(|| Err(transport(endpoint, "unscripted call")))
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn fetch_templates(&self) -> Result<Vec<PromptTemplate>, GatewayError> {
        self.record(GatewayCall::FetchTemplates);
        Self::next(&self.templates, "templates")
    }

    async fn upload_video(&self, upload: VideoUpload) -> Result<VideoSummary, GatewayError> {
        self.record(GatewayCall::Upload {
            filename: upload.file.filename.clone(),
            prompt: upload.prompt.clone(),
            bearer: upload.bearer.as_ref().map(|c| c.as_str().to_string()),
        });
        if let Some(gate) = &self.upload_gate {
            gate.notified().await;
        }
        Self::next(&self.uploads, "upload")
    }

    async fn authenticate(&self, payload: &ProviderPayload) -> Result<AuthReply, GatewayError> {
        self.record(GatewayCall::Authenticate(payload.clone()));
        Self::next(&self.logins, "authenticate")
    }

    async fn admin_login(&self, request: &AdminLoginRequest) -> Result<AuthReply, GatewayError> {
        self.record(GatewayCall::AdminLogin(request.username.clone()));
        Self::next(&self.logins, "admin_login")
    }

    async fn fetch_profile(
        &self,
        credential: &Credential,
    ) -> Result<ProfileResponse, GatewayError> {
        self.record(GatewayCall::FetchProfile(credential.as_str().to_string()));
        if let Some(gate) = &self.profile_gate {
            gate.notified().await;
        }
        Self::next(&self.profiles, "profile")
    }
}

pub(crate) fn transport(endpoint: &'static str, message: &str) -> GatewayError {
    GatewayError::Transport {
        endpoint,
        message: message.to_string(),
    }
}

pub(crate) fn rejected_status(status: u16, message: &str) -> GatewayError {
    GatewayError::Api(ApiException::new(status, message))
}

pub(crate) fn identity(value: Value) -> Identity {
    Identity::from_value(value).expect("identity must be a json object")
}

pub(crate) fn granted(token: &str, user: Value) -> AuthReply {
    AuthReply::Granted(AuthResponse {
        token: token.to_string(),
        user: identity(user),
    })
}

pub(crate) fn refused(message: &str) -> AuthReply {
    AuthReply::Rejected(ErrorResponse {
        error: message.to_string(),
    })
}

pub(crate) fn template(id: &str) -> PromptTemplate {
    PromptTemplate {
        id: id.into(),
        name: format!("Template {id}"),
        body: format!("Prompt body for {id}"),
    }
}

pub(crate) fn video() -> VideoFile {
    VideoFile::new("meeting.mp4", b"not really a video".to_vec()).with_mime_type("video/mp4")
}

pub(crate) fn summary(summary: &str, transcription: &str) -> VideoSummary {
    VideoSummary {
        summary: summary.to_string(),
        transcription: transcription.to_string(),
    }
}

/// Memory-backed slots whose writes can be switched to fail.
#[derive(Default)]
pub(crate) struct FlakyStore {
    inner: MemoryStore,
    fail_set: AtomicBool,
    fail_remove: AtomicBool,
    fail_apply: AtomicBool,
}

impl FlakyStore {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn fail_set(&self, fail: bool) {
        self.fail_set.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_remove(&self, fail: bool) {
        self.fail_remove.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_apply(&self, fail: bool) {
        self.fail_apply.store(fail, Ordering::SeqCst);
    }

    pub(crate) async fn slot(&self, key: &str) -> Option<String> {
        self.inner.snapshot().await.get(key).cloned()
    }

    pub(crate) async fn slot_count(&self) -> usize {
        self.inner.snapshot().await.len()
    }
}

#[async_trait]
impl KeyValueStore for FlakyStore {
    async fn get(&self, key: &str) -> AnyResult<Option<String>> {
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> AnyResult<()> {
        if self.fail_set.load(Ordering::SeqCst) {
            return Err(anyhow!("disk full"));
        }
        self.inner.set(key, value).await
    }

    async fn remove(&self, key: &str) -> AnyResult<()> {
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(anyhow!("read-only volume"));
        }
        self.inner.remove(key).await
    }

    async fn apply(&self, writes: &[SlotWrite]) -> AnyResult<()> {
        if self.fail_apply.load(Ordering::SeqCst) {
            return Err(anyhow!("database is locked"));
        }
        self.inner.apply(writes).await
    }
}
