//! Parley - A real-time voice agent client for Linux
//!
//! This is the main entry point for the Parley application.

mod app;
mod audio;
mod cli;
mod error;
mod session;
mod settings;
mod tokio_runtime;
mod transport;
mod visual;

use anyhow::Context as _;
use app::VoiceApp;
use clap::Parser;
use gpui::prelude::*;
use gpui::*;
use log::{error, info};

const APP_ID: &str = "com.parley.VoiceAgent";

fn main() -> anyhow::Result<()> {
    // Parse command-line arguments and initialize logging
    let args = cli::Args::parse();
    cli::init_logging(&args);

    info!("Starting Parley voice agent");

    // TLS for wss:// endpoints
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        info!("A rustls crypto provider was already installed");
    }

    if args.save {
        settings::save_overrides(&args);
    }
    let config = settings::session_config(settings::StoredSettings::load(), &args);
    if config.credential.is_none() {
        info!("No API key configured; connecting will report missing credentials");
    }

    // Global Tokio runtime for the session controller and WebSocket transport
    let runtime = tokio_runtime::init().context("Failed to create Tokio runtime")?;

    Application::new().run(move |cx: &mut App| {
        let bounds = Bounds::centered(None, size(px(480.0), px(640.0)), cx);
        let result = cx.open_window(
            WindowOptions {
                window_bounds: Some(WindowBounds::Windowed(bounds)),
                // No titlebar - we'll draw our own
                titlebar: None,
                // Use client-side decorations so we can draw our own titlebar
                window_decorations: Some(WindowDecorations::Client),
                // App ID for Wayland/GNOME desktop integration - matches .desktop file
                app_id: Some(APP_ID.to_string()),
                ..Default::default()
            },
            |window, cx| {
                window.set_app_id(APP_ID);
                cx.new(|cx| VoiceApp::new(config, runtime, window, cx))
            },
        );
        if let Err(e) = result {
            error!("Failed to open window: {}", e);
            cx.quit();
        }
    });

    Ok(())
}
