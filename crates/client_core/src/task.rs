use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use shared::{
    domain::{Credential, TemplateId},
    protocol::{PromptTemplate, VideoSummary},
};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::{
    gateway::{Gateway, VideoFile, VideoUpload},
    ClientEvent,
};

const VIDEO_FAILURE_PREFIX: &str = "video processing failed";
const TEMPLATES_FAILURE_PREFIX: &str = "could not load prompt templates";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskSnapshot {
    pub is_running: bool,
    pub result: Option<VideoSummary>,
    pub failure: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TaskSnapshot {
    fn running() -> Self {
        Self {
            is_running: true,
            ..Self::default()
        }
    }

    fn succeeded(summary: VideoSummary) -> Self {
        Self {
            is_running: false,
            result: Some(summary),
            failure: None,
            finished_at: Some(Utc::now()),
        }
    }

    fn failed(message: String) -> Self {
        Self {
            is_running: false,
            result: None,
            failure: Some(message),
            finished_at: Some(Utc::now()),
        }
    }
}

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("a video is already being processed")]
    AlreadyRunning,
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatesLoad {
    Loaded(usize),
    /// The fetch failed; the previous list is still served.
    Kept { cached: usize, message: String },
}

#[derive(Default)]
struct TaskState {
    task: TaskSnapshot,
    templates: Vec<PromptTemplate>,
    templates_notice: Option<String>,
}

/// Single-flight video submission plus the prompt template cache.
///
/// State lives behind a plain mutex: no mutation awaits, so every change is
/// observed whole.
pub struct TaskStore {
    gateway: Arc<dyn Gateway>,
    state: Mutex<TaskState>,
    events: broadcast::Sender<ClientEvent>,
}

impl TaskStore {
    pub fn new(gateway: Arc<dyn Gateway>, events: broadcast::Sender<ClientEvent>) -> Self {
        Self {
            gateway,
            state: Mutex::new(TaskState::default()),
            events,
        }
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.lock_state().task.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock_state().task.is_running
    }

    pub fn templates(&self) -> Vec<PromptTemplate> {
        self.lock_state().templates.clone()
    }

    pub fn templates_notice(&self) -> Option<String> {
        self.lock_state().templates_notice.clone()
    }

    /// The server lists its default template first.
    pub fn default_template(&self) -> Option<PromptTemplate> {
        self.lock_state().templates.first().cloned()
    }

    pub fn template(&self, id: &TemplateId) -> Option<PromptTemplate> {
        self.lock_state()
            .templates
            .iter()
            .find(|template| &template.id == id)
            .cloned()
    }

    pub async fn load_templates(&self) -> TemplatesLoad {
        match self.gateway.fetch_templates().await {
            Ok(templates) => {
                let count = templates.len();
                {
                    let mut guard = self.lock_state();
                    guard.templates = templates.clone();
                    guard.templates_notice = None;
                }
                let _ = self.events.send(ClientEvent::TemplatesChanged(templates));
                info!(count, "tasks: prompt templates loaded");
                TemplatesLoad::Loaded(count)
            }
            Err(err) => {
                let message = format!("{TEMPLATES_FAILURE_PREFIX}: {err}");
                let cached = {
                    let mut guard = self.lock_state();
                    guard.templates_notice = Some(message.clone());
                    guard.templates.len()
                };
                let _ = self.events.send(ClientEvent::Notice(message.clone()));
                warn!(cached, "tasks: keeping cached prompt templates: {err}");
                TemplatesLoad::Kept { cached, message }
            }
        }
    }

    /// Uploads `file` with `prompt`. Rejected without touching state while
    /// another submission is in flight.
    pub async fn submit(
        &self,
        file: VideoFile,
        prompt: impl Into<String>,
        credential: Option<Credential>,
    ) -> Result<VideoSummary, TaskError> {
        {
            let mut guard = self.lock_state();
            if guard.task.is_running {
                warn!("tasks: submission rejected; another video is still processing");
                return Err(TaskError::AlreadyRunning);
            }
            guard.task = TaskSnapshot::running();
            self.publish(&guard.task);
        }

        let mut settle = SettleGuard { store: self, armed: true };
        info!(
            filename = %file.filename,
            size_bytes = file.bytes.len(),
            authorized = credential.is_some(),
            "tasks: video submitted"
        );
        let upload = VideoUpload {
            file,
            prompt: prompt.into(),
            bearer: credential,
        };
        let outcome = self.gateway.upload_video(upload).await;
        settle.armed = false;

        match outcome {
            Ok(summary) => {
                self.settle(TaskSnapshot::succeeded(summary.clone()));
                info!(
                    summary_chars = summary.summary.chars().count(),
                    "tasks: video processed"
                );
                Ok(summary)
            }
            Err(err) => {
                let message = format!("{VIDEO_FAILURE_PREFIX}: {err}");
                self.settle(TaskSnapshot::failed(message.clone()));
                warn!("tasks: {message}");
                Err(TaskError::Failed(message))
            }
        }
    }

    fn settle(&self, task: TaskSnapshot) {
        let mut guard = self.lock_state();
        guard.task = task;
        self.publish(&guard.task);
    }

    fn publish(&self, task: &TaskSnapshot) {
        let _ = self.events.send(ClientEvent::TaskChanged(task.clone()));
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Settles a submission whose future was dropped before the upload finished,
/// so `is_running` can never outlive its request.
struct SettleGuard<'a> {
    store: &'a TaskStore,
    armed: bool,
}

impl Drop for SettleGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.store
                .settle(TaskSnapshot::failed(format!("{VIDEO_FAILURE_PREFIX}: cancelled")));
        }
    }
}

#[cfg(test)]
#[path = "tests/task_tests.rs"]
mod tests;
