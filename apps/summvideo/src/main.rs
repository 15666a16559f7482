use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    Coordinator, GatewayEndpoints, HttpGateway, ProviderPayload, TemplatesLoad, VideoFile,
};
use shared::domain::{Identity, TemplateId};
use storage::Storage;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;

use config::{load_settings, normalize_storage_url, Settings};

#[derive(Parser, Debug)]
#[command(name = "summvideo", about = "Video summary client")]
struct Args {
    /// Overrides the configured backend base url.
    #[arg(long, global = true)]
    api_url: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Log in with the identity provider's signed payload.
    Login {
        #[arg(long = "param", value_name = "KEY=VALUE", value_parser = parse_param, required = true)]
        params: Vec<(String, String)>,
    },
    /// Log in with administrator credentials.
    AdminLogin {
        #[arg(long)]
        username: String,
        #[arg(long)]
        password: String,
    },
    /// Checks the stored credential against the backend.
    Whoami,
    /// Forgets the stored session.
    Logout,
    /// Lists the backend's prompt templates.
    Templates,
    /// Uploads a video and prints its summary.
    Submit {
        #[arg(long)]
        file: PathBuf,
        #[arg(long, conflicts_with = "template")]
        prompt: Option<String>,
        #[arg(long)]
        template: Option<String>,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got '{raw}'")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(api_url) = args.api_url {
        settings.api_url = api_url;
    }
    let coordinator = build_coordinator(&settings).await?;
    coordinator.initialize().await;

    match args.command {
        Command::Login { params } => {
            let payload: ProviderPayload = params.into_iter().collect();
            let response = coordinator.authenticate(&payload).await?;
            println!("Logged in as {}", describe(&response.user));
        }
        Command::AdminLogin { username, password } => {
            let response = coordinator.authenticate_admin(&username, &password).await?;
            println!("Logged in as {} (admin)", describe(&response.user));
        }
        Command::Whoami => {
            let profile = coordinator.validate().await?;
            println!("{}", describe(&profile.user));
            match profile.remaining_secs() {
                Some(remaining) => println!(
                    "Usage: {}s used, {remaining}s remaining",
                    profile.user.usage_total_secs()
                ),
                None => println!("Usage: {}s used, no limit", profile.user.usage_total_secs()),
            }
        }
        Command::Logout => {
            coordinator.logout().await?;
            println!("Logged out");
        }
        Command::Templates => {
            if let TemplatesLoad::Kept { message, .. } = coordinator.load_templates().await {
                bail!(message);
            }
            for (index, template) in coordinator.tasks().templates().iter().enumerate() {
                let marker = if index == 0 { " (default)" } else { "" };
                println!("{}\t{}{marker}", template.id.as_str(), template.name);
            }
        }
        Command::Submit {
            file,
            prompt,
            template,
        } => {
            let prompt = match (prompt, template) {
                (Some(prompt), _) => prompt,
                (None, template) => template_prompt(&coordinator, template).await?,
            };
            let video = read_video(&file, settings.max_upload_bytes).await?;
            let summary = coordinator.submit_video(video, prompt).await?;
            println!("# Summary\n\n{}\n", summary.summary);
            println!("# Transcription\n\n{}", summary.transcription);
            if let Some(finished_at) = coordinator.view().await.finished_at {
                println!("\nFinished at {}", finished_at.to_rfc3339());
            }
        }
    }

    Ok(())
}

async fn build_coordinator(settings: &Settings) -> Result<Coordinator> {
    let storage_url = normalize_storage_url(&settings.storage_url);
    let storage = Storage::new(&storage_url).await?;
    let gateway = HttpGateway::with_options(
        &settings.api_url,
        GatewayEndpoints::default(),
        settings.request_timeout(),
    )?;
    info!(api_url = %gateway.base_url(), %storage_url, "summvideo: starting");
    Ok(Coordinator::new(Arc::new(gateway), Arc::new(storage)))
}

/// Body of the chosen template, or of the default one.
async fn template_prompt(coordinator: &Coordinator, template: Option<String>) -> Result<String> {
    if let TemplatesLoad::Kept { message, .. } = coordinator.load_templates().await {
        bail!(message);
    }
    let tasks = coordinator.tasks();
    let chosen = match template {
        Some(id) => tasks
            .template(&TemplateId::from(id.as_str()))
            .ok_or_else(|| anyhow!("unknown template '{id}'"))?,
        None => tasks
            .default_template()
            .ok_or_else(|| anyhow!("backend offers no prompt templates; pass --prompt"))?,
    };
    Ok(chosen.body)
}

async fn read_video(path: &Path, max_upload_bytes: u64) -> Result<VideoFile> {
    let metadata = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("failed to stat '{}'", path.display()))?;
    if metadata.len() > max_upload_bytes {
        bail!(
            "'{}' is {} bytes; the backend accepts at most {max_upload_bytes}",
            path.display(),
            metadata.len()
        );
    }
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read '{}'", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "video".to_string());
    let mut video = VideoFile::new(filename, bytes);
    if let Some(mime_type) = mime_guess::from_path(path).first() {
        video = video.with_mime_type(mime_type.essence_str());
    }
    Ok(video)
}

fn describe(identity: &Identity) -> String {
    identity
        .display_name()
        .unwrap_or_else(|| "<unnamed user>".to_string())
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
