use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::{
    domain::{Identity, SessionStatus},
    protocol::{AuthResponse, ProfileResponse, PromptTemplate, VideoSummary},
};
use storage::KeyValueStore;
use tokio::sync::broadcast;
use tracing::info;

pub mod gateway;
pub mod session;
pub mod task;

pub use gateway::{
    Gateway, GatewayEndpoints, GatewayError, HttpGateway, ProviderPayload, VideoFile, VideoUpload,
};
pub use session::{SessionError, SessionSnapshot, SessionStore};
pub use task::{TaskError, TaskSnapshot, TaskStore, TemplatesLoad};

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum ClientEvent {
    SessionChanged(SessionSnapshot),
    TaskChanged(TaskSnapshot),
    TemplatesChanged(Vec<PromptTemplate>),
    Notice(String),
}

/// Everything the presentation layer renders from, rebuilt from both stores
/// on every read.
#[derive(Debug, Clone, PartialEq)]
pub struct CoordinatorView {
    pub templates: Vec<PromptTemplate>,
    pub templates_notice: Option<String>,
    pub is_running: bool,
    pub result: Option<VideoSummary>,
    pub failure: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
    pub session_status: SessionStatus,
    pub identity: Option<Identity>,
    pub is_authenticated: bool,
}

/// Composition root over the session and task stores. Holds no state of its
/// own; the session credential reaches uploads only through
/// [`Coordinator::submit_video`].
pub struct Coordinator {
    session: SessionStore,
    tasks: TaskStore,
    events: broadcast::Sender<ClientEvent>,
}

impl Coordinator {
    pub fn new(gateway: Arc<dyn Gateway>, storage: Arc<dyn KeyValueStore>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            session: SessionStore::new(Arc::clone(&gateway), storage, events.clone()),
            tasks: TaskStore::new(gateway, events.clone()),
            events,
        }
    }

    pub fn session(&self) -> &SessionStore {
        &self.session
    }

    pub fn tasks(&self) -> &TaskStore {
        &self.tasks
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }

    pub async fn initialize(&self) -> SessionSnapshot {
        self.session.initialize().await
    }

    pub async fn authenticate(
        &self,
        payload: &ProviderPayload,
    ) -> Result<AuthResponse, SessionError> {
        self.session.authenticate(payload).await
    }

    pub async fn authenticate_admin(
        &self,
        username: &str,
        password: &str,
    ) -> Result<AuthResponse, SessionError> {
        self.session.authenticate_admin(username, password).await
    }

    pub async fn validate(&self) -> Result<ProfileResponse, SessionError> {
        self.session.validate().await
    }

    pub async fn logout(&self) -> Result<(), SessionError> {
        self.session.clear().await
    }

    pub async fn load_templates(&self) -> TemplatesLoad {
        self.tasks.load_templates().await
    }

    pub async fn submit_video(
        &self,
        file: VideoFile,
        prompt: impl Into<String>,
    ) -> Result<VideoSummary, TaskError> {
        let credential = self.session.credential().await;
        info!(
            authorized = credential.is_some(),
            "coordinator: forwarding video submission"
        );
        self.tasks.submit(file, prompt, credential).await
    }

    pub async fn view(&self) -> CoordinatorView {
        let session = self.session.snapshot().await;
        let task = self.tasks.snapshot();
        CoordinatorView {
            templates: self.tasks.templates(),
            templates_notice: self.tasks.templates_notice(),
            is_running: task.is_running,
            result: task.result,
            failure: task.failure,
            finished_at: task.finished_at,
            session_status: session.status,
            is_authenticated: session.is_authenticated(),
            identity: session.identity,
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
