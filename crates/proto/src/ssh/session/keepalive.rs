//! Keep-alive heartbeat.
//!
//! Sends SSH_MSG_IGNORE at a fixed interval so that idle connections are
//! not dropped by the server or by middleboxes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use skiff_platform::SkiffResult;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::ssh::message::ignore_message;

/// Random bytes carried by each keep-alive message.
const KEEPALIVE_PADDING: usize = 16;

/// Keep-alive task handle.
///
/// Stops the task when dropped.
#[derive(Debug)]
pub struct KeepaliveTask {
    interval: Duration,
    stop_signal: Arc<AtomicBool>,
    task_handle: Option<JoinHandle<()>>,
}

impl KeepaliveTask {
    /// Creates a keep-alive task without starting it.
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            stop_signal: Arc::new(AtomicBool::new(false)),
            task_handle: None,
        }
    }

    /// Starts sending.
    ///
    /// `send` queues one message on the transport. The task stops at the
    /// first error, which means the transport has closed.
    pub fn start<F>(&mut self, send: F)
    where
        F: Fn(Vec<u8>) -> SkiffResult<()> + Send + 'static,
    {
        let interval = self.interval;
        let stop_signal = Arc::clone(&self.stop_signal);

        let handle = tokio::spawn(async move {
            debug!(interval_ms = interval.as_millis() as u64, "Keep-alive task started");

            loop {
                tokio::time::sleep(interval).await;

                if stop_signal.load(Ordering::Relaxed) {
                    break;
                }

                if let Err(e) = send(create_keepalive_message(KEEPALIVE_PADDING)) {
                    warn!(error = %e, "Keep-alive failed, stopping");
                    break;
                }
            }

            debug!("Keep-alive task stopped");
        });

        self.task_handle = Some(handle);
    }

    /// Stops the task.
    pub fn stop(&mut self) {
        self.stop_signal.store(true, Ordering::Relaxed);

        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }

    /// Returns whether the task is running.
    pub fn is_running(&self) -> bool {
        self.task_handle
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false)
    }
}

impl Drop for KeepaliveTask {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Creates an SSH_MSG_IGNORE carrying `data_len` random bytes.
///
/// # Example
///
/// ```rust
/// use skiff_proto::ssh::session::create_keepalive_message;
///
/// let msg = create_keepalive_message(32);
/// assert_eq!(msg[0], 2); // SSH_MSG_IGNORE
/// ```
pub fn create_keepalive_message(data_len: usize) -> Vec<u8> {
    let mut rng = rand::thread_rng();
    let data: Vec<u8> = (0..data_len).map(|_| rng.gen()).collect();
    ignore_message(&data)
}
