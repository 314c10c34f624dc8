//! D-Bus plugin control channel
//!
//! The service only relays: each `PluginMessage` call becomes a
//! [`ControlRequest`] handed to the event loop, which owns the plugins and
//! answers through the request's oneshot channel.

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};
use zbus::{Connection, fdo, interface};

pub const SERVICE_NAME: &str = "org.kasane.Compositor";
pub const OBJECT_PATH: &str = "/org/kasane/Compositor";

/// Pending requests before callers start waiting on the channel
const QUEUE_DEPTH: usize = 16;

/// A control message waiting for the event loop
#[derive(Debug)]
pub struct ControlRequest {
    pub plugin: String,
    pub member: String,
    pub args: Vec<String>,
    pub reply: oneshot::Sender<Result<String, String>>,
}

impl ControlRequest {
    pub fn respond(self, result: Result<String, String>) {
        if self.reply.send(result).is_err() {
            debug!("Caller of {}.{} went away before the reply", self.plugin, self.member);
        }
    }
}

struct CompositorInterface {
    requests: mpsc::Sender<ControlRequest>,
}

#[interface(name = "org.kasane.Compositor")]
impl CompositorInterface {
    /// Send `member(args)` to `plugin`
    async fn plugin_message(
        &self,
        plugin: String,
        member: String,
        args: Vec<String>,
    ) -> fdo::Result<String> {
        let (reply, response) = oneshot::channel();
        let request = ControlRequest {
            plugin,
            member,
            args,
            reply,
        };

        self.requests
            .send(request)
            .await
            .map_err(|_| fdo::Error::Failed("compositor is shutting down".to_string()))?;

        match response.await {
            Ok(result) => result.map_err(fdo::Error::Failed),
            Err(_) => Err(fdo::Error::Failed("compositor dropped the request".to_string())),
        }
    }
}

/// Control channel before it is exposed on the bus
pub fn channel() -> (mpsc::Sender<ControlRequest>, mpsc::Receiver<ControlRequest>) {
    mpsc::channel(QUEUE_DEPTH)
}

/// Claim the service name on the session bus and serve the interface
///
/// The returned connection must be kept alive for as long as the service
/// should answer.
pub async fn serve(requests: mpsc::Sender<ControlRequest>) -> Result<Connection> {
    let conn = zbus::connection::Builder::session()
        .context("Failed to connect to D-Bus session bus")?
        .name(SERVICE_NAME)
        .context("Invalid D-Bus service name")?
        .serve_at(OBJECT_PATH, CompositorInterface { requests })
        .context("Failed to register the control interface")?
        .build()
        .await
        .with_context(|| format!("Failed to claim {} on the session bus", SERVICE_NAME))?;

    info!("Control service {} ready at {}", SERVICE_NAME, OBJECT_PATH);
    Ok(conn)
}
