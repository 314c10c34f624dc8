//! X11 event readiness
//!
//! A blocking task polls the X11 socket with mio and wakes the event loop
//! through a [`Notify`] when it becomes readable. Events are then drained
//! without blocking with [`X11EventStream::poll_next_event`].
//!
//! Replies waited for on the main task may pull events into the connection
//! buffer without the socket ever signalling readiness again, so callers
//! drain after every wakeup of their loop, not only after readiness.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Notify, oneshot};
use tracing::{info, warn};
use x11rb::connection::Connection;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

const X11_TOKEN: mio::Token = mio::Token(0);

/// Poll timeout, bounds how long the polling task outlives the stream
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct X11EventStream {
    conn: Arc<RustConnection>,
    notify: Arc<Notify>,
    /// Dropped with the stream, which stops the polling task
    _task_guard: oneshot::Receiver<()>,
}

impl X11EventStream {
    pub fn new(conn: Arc<RustConnection>) -> Result<Self> {
        let fd = conn.stream().as_raw_fd();
        let notify = Arc::new(Notify::new());
        let task_notify = notify.clone();

        let (guard, task_guard) = oneshot::channel::<()>();
        let mut poll = mio::Poll::new().context("Failed to create mio Poll")?;
        let mut events = mio::Events::with_capacity(1);

        poll.registry()
            .register(&mut mio::unix::SourceFd(&fd), X11_TOKEN, mio::Interest::READABLE)
            .context("Failed to register X11 socket with mio")?;

        tokio::task::spawn_blocking(move || {
            loop {
                if guard.is_closed() {
                    info!("X11 socket polling task shutting down");
                    return;
                }

                if let Err(err) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                    if err.kind() != std::io::ErrorKind::Interrupted {
                        warn!("X11 socket poll failed: {:?}", err);
                    }
                    continue;
                }

                if events.iter().any(|event| event.token() == X11_TOKEN) {
                    task_notify.notify_one();
                }
            }
        });

        Ok(Self {
            conn,
            notify,
            _task_guard: task_guard,
        })
    }

    /// Next queued event, `None` once the queue is empty
    pub fn poll_next_event(&self) -> Result<Option<Event>> {
        Ok(self.conn.poll_for_event()?)
    }

    /// Wait until the X11 socket has become readable
    pub async fn wait_readable(&self) {
        self.notify.notified().await;
    }
}
