use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chartside::{
    ChatManager, Config, FileTabStore, HttpBackend, TranscribeConfig, TranscribeEvent,
    Transcriber,
};
use clap::Parser;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "chartside", about = "Clinical side-panel assistant service")]
struct Args {
    /// Config file to load (without extension)
    #[arg(long, default_value = "config/chartside")]
    config: String,

    /// Backend session to attach the chat panel to
    #[arg(long)]
    session_id: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("{} v0.1.0", cfg.service.name);
    info!("Backend: {}", cfg.backend.base_url);

    let backend = Arc::new(HttpBackend::new(cfg.backend.base_url.clone()));
    let store = Arc::new(FileTabStore::new(cfg.storage.active_tab_path.clone()));
    let manager = Arc::new(ChatManager::new(backend, store, args.session_id));
    manager.init().await?;

    if let Some(active) = manager.active_tab().await {
        info!("Active tab: {}", active);
    } else {
        info!("No backend session attached, chat panel idle");
    }

    let transcribe_cfg = TranscribeConfig {
        ws_url: cfg.backend.ws_url.clone(),
        idle_timeout: Duration::from_secs(cfg.transcription.idle_timeout_secs),
        sample_rate: cfg.audio.sample_rate,
    };
    let (_transcriber, mut events) = Transcriber::new(transcribe_cfg);

    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TranscribeEvent::Partial(text) => info!("partial: {}", text),
                TranscribeEvent::Complete(text) => info!("transcript: {}", text),
                TranscribeEvent::Status(status) => info!("recording status: {:?}", status),
                TranscribeEvent::Error(err) => info!("transcription error: {}", err),
                TranscribeEvent::IdleTimeout => info!("recording stopped after idle timeout"),
            }
        }
    });

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    Ok(())
}
