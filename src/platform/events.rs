//! Async X11 event source
//!
//! A blocking task polls the connection's socket with mio and wakes the main
//! loop through a `Notify`. Events are then drained without blocking.

use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};
use x11rb::connection::Connection;
use x11rb::errors::ConnectionError;
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;

const POLL_TIMEOUT: Duration = Duration::from_millis(100);

pub struct EventStream {
    conn: Arc<RustConnection>,
    notify: Arc<Notify>,
    /// Dropping it stops the polling task
    _guard: oneshot::Receiver<()>,
}

impl EventStream {
    pub fn new(conn: Arc<RustConnection>) -> Result<Self> {
        let fd = conn.stream().as_raw_fd();
        let notify = Arc::new(Notify::new());
        let task_notify = notify.clone();

        let (guard, task_guard) = oneshot::channel::<()>();
        let mut poll = mio::Poll::new().context("Failed to create mio Poll")?;
        let mut events = mio::Events::with_capacity(1);
        poll.registry()
            .register(&mut mio::unix::SourceFd(&fd), mio::Token(0), mio::Interest::READABLE)
            .context("Failed to register X11 socket with mio")?;

        tokio::task::spawn_blocking(move || {
            while !guard.is_closed() {
                if let Err(e) = poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                    warn!("X11 socket poll failed: {:?}", e);
                    continue;
                }
                if events.iter().any(|event| event.token() == mio::Token(0)) {
                    task_notify.notify_one();
                }
            }
            debug!("X11 socket polling task stopped");
        });

        Ok(Self {
            conn,
            notify,
            _guard: task_guard,
        })
    }

    /// Wait until the socket has data. Events may already be queued in the
    /// connection; drain before waiting.
    pub async fn readable(&self) {
        self.notify.notified().await;
    }

    /// Every event queued so far, without blocking
    pub fn drain(&self) -> Result<Vec<Event>, ConnectionError> {
        let mut events = Vec::new();
        while let Some(event) = self.conn.poll_for_event()? {
            events.push(event);
        }
        Ok(events)
    }

    pub fn flush(&self) -> Result<(), ConnectionError> {
        self.conn.flush()
    }
}

/// The server went away; there is nothing left to composite
pub fn is_disconnect(error: &ConnectionError) -> bool {
    matches!(error, ConnectionError::IoError(e) if matches!(
        e.kind(),
        std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset | std::io::ErrorKind::UnexpectedEof
    ))
}
