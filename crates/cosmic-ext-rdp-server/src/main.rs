use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use rdp_audio::AudioConfig;

mod dbus;
mod egfx;
mod server;
mod sound;
mod tls;

/// RDP server for the COSMIC Desktop Environment.
///
/// Allows remote access to COSMIC desktops using standard RDP clients
/// (Windows `mstsc.exe`, `FreeRDP`, Remmina), with H.264 display delivery
/// over EGFX and audio redirection over RDPSND.
#[derive(Parser, Debug)]
#[command(name = "cosmic-ext-rdp-server", version, about)]
struct Cli {
    /// Address to bind the RDP server to
    #[arg(long, default_value = "0.0.0.0")]
    addr: String,

    /// Port to listen on
    #[arg(long, default_value_t = 3389)]
    port: u16,

    /// Path to TLS certificate file (PEM format).
    /// If not provided, a self-signed certificate will be generated.
    #[arg(long)]
    cert: Option<PathBuf>,

    /// Path to TLS private key file (PEM format).
    /// Required if --cert is provided.
    #[arg(long)]
    key: Option<PathBuf>,

    /// Path to configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Use a static blue screen instead of live capture (for testing)
    #[arg(long)]
    static_display: bool,

    /// NLA username. If set, NLA auth is required and --nla-password must
    /// also be set.
    #[arg(long)]
    nla_username: Option<String>,

    /// NLA password.
    #[arg(long)]
    nla_password: Option<String>,

    /// NLA domain (optional).
    #[arg(long)]
    nla_domain: Option<String>,

    /// Disable audio redirection over RDPSND.
    #[arg(long)]
    no_audio: bool,

    /// Directory to write per-client WAV captures of redirected audio, for
    /// debugging. Disabled by default.
    #[arg(long)]
    audio_log_dir: Option<PathBuf>,
}

fn audio_config(cli: &Cli) -> AudioConfig {
    let mut config = AudioConfig::default();
    config.log_path = cli.audio_log_dir.clone();
    config
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let bind_addr: SocketAddr = format!("{}:{}", cli.addr, cli.port)
        .parse()
        .context("invalid bind address")?;

    let auth = match (&cli.nla_username, &cli.nla_password) {
        (Some(username), Some(password)) => Some(server::AuthCredentials {
            username: username.clone(),
            password: password.clone(),
            domain: cli.nla_domain.clone(),
        }),
        (None, None) => None,
        _ => bail!("--nla-username requires --nla-password (and vice versa)"),
    };

    // Set up TLS
    let tls_context = match (&cli.cert, &cli.key) {
        (Some(cert), Some(key)) => tls::load_from_files(cert, key)?,
        (None, None) => tls::generate_self_signed(bind_addr.ip())?,
        (Some(_), None) => bail!("--cert requires --key"),
        (None, Some(_)) => bail!("--key requires --cert"),
    };

    tracing::info!(%bind_addr, "Starting cosmic-ext-rdp-server");

    let sound_factory = if cli.no_audio {
        None
    } else {
        Some(Box::new(sound::PipelinedAudioFactory::new(2, 44100, audio_config(&cli)))
            as Box<dyn ironrdp_server::SoundServerFactory>)
    };

    if cli.static_display {
        tracing::info!("Using static blue screen display");
        let mut rdp_server = server::build_server(bind_addr, &tls_context, auth.as_ref(), None, sound_factory, None);
        rdp_server.run().await.context("RDP server error")?;
        return Ok(());
    }

    // Try to start live screen capture via ScreenCast portal + PipeWire
    match rdp_capture::start_capture(None, 4).await {
        Ok((capture_handle, frame_rx, desktop_info)) => {
            tracing::info!(
                width = desktop_info.width,
                height = desktop_info.height,
                node_id = desktop_info.node_id,
                "Live screen capture active"
            );

            let (egfx_factory, egfx_controller, egfx_event_setter) =
                egfx::create_egfx(desktop_info.width, desktop_info.height);

            let mut live_display = server::LiveDisplay::new(frame_rx, &desktop_info);
            live_display.set_egfx(egfx_controller);

            // Try to set up input injection via libei
            let input_handler = match rdp_input::EiInput::new().await {
                Ok(ei) => {
                    tracing::info!("Input injection active (libei)");
                    server::LiveInputHandler::new(ei)
                }
                Err(e) => {
                    tracing::warn!("Failed to initialize input injection: {e}");
                    tracing::warn!("Input events will be logged but not injected");
                    // Fall back to view-only mode since we can't inject input
                    // but still show the live desktop.
                    let mut rdp_server = server::build_view_only_server(
                        bind_addr,
                        &tls_context,
                        auth.as_ref(),
                        live_display,
                        None,
                        sound_factory,
                    );
                    egfx_event_setter.set_event_sender(rdp_server.event_sender());
                    let _capture = capture_handle;
                    rdp_server.run().await.context("RDP server error")?;
                    return Ok(());
                }
            };

            let mut rdp_server = server::build_live_server(
                bind_addr,
                &tls_context,
                auth.as_ref(),
                live_display,
                input_handler,
                None,
                sound_factory,
                Some(Box::new(egfx_factory)),
            );
            egfx_event_setter.set_event_sender(rdp_server.event_sender());

            // Keep capture handle alive for the duration of the server
            let _capture = capture_handle;
            rdp_server.run().await.context("RDP server error")?;
        }
        Err(e) => {
            tracing::warn!("Failed to start screen capture: {e:#}");
            tracing::info!("Falling back to static blue screen display");

            let mut rdp_server =
                server::build_server(bind_addr, &tls_context, auth.as_ref(), None, sound_factory, None);
            rdp_server.run().await.context("RDP server error")?;
        }
    }

    Ok(())
}
