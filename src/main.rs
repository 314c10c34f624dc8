//! kasane
//!
//! An X11 compositing manager: it redirects every top-level window, tracks
//! what changed on screen and repaints it once per frame through an XRender
//! backend, with effect plugins hooked into events and painting.

mod atoms;
mod compositor;
mod config;
mod dbus;
mod display;
mod plugin;
mod server;
#[cfg(test)]
mod testing;
mod vsync;
mod x11_async;

use std::path::PathBuf;
use std::rc::Rc;

use anyhow::{Context, Result, bail};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use compositor::Compositor;
use compositor::renderer::XRenderBackend;
use config::Config;
use dbus::ControlRequest;
use display::{ScreenFacts, Session};
use plugin::Plugins;
use server::XServer;
use server::x11::X11Server;
use x11_async::X11EventStream;

/// Command line options
#[derive(Debug, Default, PartialEq)]
struct Args {
    /// Take over from a running compositing manager
    replace: bool,
    config: Option<PathBuf>,
}

impl Args {
    fn parse(mut args: impl Iterator<Item = String>) -> Result<Self> {
        let mut parsed = Self::default();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--replace" | "-r" => parsed.replace = true,
                "--config" | "-c" => {
                    let path = args.next().context("--config needs a path")?;
                    parsed.config = Some(PathBuf::from(path));
                }
                other => bail!(
                    "Unknown argument {:?} (usage: kasane [--replace] [--config <path>])",
                    other
                ),
            }
        }
        Ok(parsed)
    }
}

fn repaint_interval(facts: &ScreenFacts) -> Interval {
    let mut interval = tokio::time::interval(facts.refresh_interval);
    // A slow frame delays the next one instead of bunching frames up
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

fn log_screen_facts(facts: &ScreenFacts) {
    info!(
        "Repainting every {:.2}ms over {} output(s): {:?}",
        facts.refresh_interval.as_secs_f64() * 1000.0,
        facts.outputs.len(),
        facts.outputs
    );
}

/// Next control request, never resolves without a control channel
async fn next_request(
    control: &mut Option<mpsc::Receiver<ControlRequest>>,
) -> Option<ControlRequest> {
    match control {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Set up the compositor on a connected session and run the event loop
async fn run(session: Session, config: Config, mut shutdown_rx: mpsc::Receiver<()>) -> Result<()> {
    let mut plugins = Plugins::load(&config.compositor.plugins);
    plugins.check_requirements(&session.extensions);

    let server: Rc<dyn XServer> = Rc::new(X11Server::new(
        session.conn.clone(),
        session.extensions.has_shape(),
    ));
    let backend = XRenderBackend::new(
        session.conn.clone(),
        &session.screen,
        session.overlay,
        session.atoms,
        config.compositor.background_color,
    )
    .context("Failed to initialize XRender backend")?;
    let frame_clock = vsync::frame_clock(config.compositor.vsync, &config.compositor.drm_device);

    let mut compositor = Compositor::new(
        server.clone(),
        session.screen,
        session.atoms,
        session.extensions,
        plugins,
        Box::new(backend),
        frame_clock,
    );
    compositor.ignore(session.cm_window);
    compositor.ignore(session.overlay);

    let events = X11EventStream::new(session.conn.clone())?;

    // Redirect first: windows created from now on arrive as CreateNotify,
    // the ones listed below that also do are rejected as duplicates
    session.redirect()?;
    let existing = server
        .query_tree(session.screen.root)
        .finish_if_sent(&*server)
        .context("Failed to list existing windows")?;
    compositor.manage_existing(&existing);

    let facts = session.query_screen_facts();
    log_screen_facts(&facts);
    let mut repaint = repaint_interval(&facts);

    let (mut control, _bus) = if config.control.dbus {
        let (tx, rx) = dbus::channel();
        match dbus::serve(tx).await {
            Ok(bus) => (Some(rx), Some(bus)),
            Err(e) => {
                warn!("Plugin control channel unavailable: {:#}", e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    info!("Starting main event loop");
    loop {
        tokio::select! {
            () = events.wait_readable() => {}

            _ = repaint.tick() => {
                compositor.repaint();
            }

            Some(request) = next_request(&mut control) => {
                let result = compositor
                    .control(&request.plugin, &request.member, &request.args)
                    .map_err(|e| e.to_string());
                request.respond(result);
            }

            _ = shutdown_rx.recv() => {
                info!("Shutdown signal received, cleaning up...");
                compositor.shutdown();
                return Ok(());
            }
        }

        // Waiting for replies may have queued events behind the socket's back
        while let Some(event) = events.poll_next_event().context("X11 connection lost")? {
            compositor.handle_event(&event);
        }

        if compositor.take_screen_changed() {
            let facts = session.query_screen_facts();
            log_screen_facts(&facts);
            repaint = repaint_interval(&facts);
        }

        server.flush().context("X11 connection lost")?;
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "kasane=info,warn".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting kasane {}", env!("CARGO_PKG_VERSION"));

    let args = Args::parse(std::env::args().skip(1))?;
    if args.replace {
        info!("--replace flag detected: will replace a running compositing manager");
    }
    let config = Config::load(args.config)?;

    // Setup signal handlers for graceful shutdown
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                _ = sigint.recv() => info!("Received SIGINT, shutting down gracefully"),
            }
            let _ = shutdown_tx.send(()).await;
        });
    }

    let session = Session::connect(args.replace)?;
    if let Err(e) = run(session, config, shutdown_rx).await {
        error!("Compositor stopped: {:#}", e);
        return Err(e);
    }
    Ok(())
}
