/*!
 * The background polling loop.
 *
 * One dedicated task drains the transport continuously: every available
 * byte flows through the frame decoder and dispatcher, then the task yields
 * briefly before checking again. Stop requests are a cooperative flag,
 * observed within one sleep interval. Channel-level faults terminate the
 * poller and mark the session closed rather than propagating anywhere else.
 */
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::board::Shared;
use crate::decoder::FrameDecoder;

/// How long the poller sleeps when no bytes are available
const IDLE_SLEEP: Duration = Duration::from_micros(500);

/// Handle to the background polling task
#[derive(Debug, Default)]
pub(crate) struct Poller {
    running: Arc<AtomicBool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Poller {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the polling task; a no-op if it is already running
    pub(crate) fn start(&self, shared: Arc<Shared>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(run(shared, running));
        *self.handle.lock().unwrap() = Some(handle);
    }

    /// Request a cooperative stop
    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    /// Wait for the polling task to exit, if one was started
    pub(crate) async fn join(&self) {
        let handle = self.handle.lock().unwrap().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

async fn run(shared: Arc<Shared>, running: Arc<AtomicBool>) {
    let mut decoder = FrameDecoder::new();
    debug!("poller started");
    while running.load(Ordering::SeqCst) {
        match shared.drain(&mut decoder) {
            Ok(0) => tokio::time::sleep(IDLE_SLEEP).await,
            Ok(_) => tokio::task::yield_now().await,
            Err(err) => {
                warn!(%err, "poller terminating on channel fault");
                shared.mark_closed(&err.to_string());
                break;
            }
        }
    }
    running.store(false, Ordering::SeqCst);
    debug!("poller stopped");
}
