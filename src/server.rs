//! Front-facing responder: live result subscriptions over the channel.
//!
//! A single cooperative loop polls `GetResults` on a fixed interval and
//! pushes a notification to subscribers only when the serialized result set
//! differs from the last pushed snapshot, bounding notification volume
//! independent of poll frequency.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::channel::{ClientConn, Request, Response};
use crate::errors::HarnessError;
use crate::types::StatusMessage;

/// Fixed polling interval for the subscription loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How long one poll may wait on the worker before being skipped.
const POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Push payload delivered to subscribers on change.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// Worker status line at poll time.
    pub status: StatusMessage,
    /// The serialized result rows, exactly as compared for change detection.
    pub results: String,
}

/// Explicit lifecycle handle for the subscription loop.
///
/// Owned by the caller; dropping the handle stops the loop. There is no
/// process-global server reference.
pub struct ServerHandle {
    stop: Arc<AtomicBool>,
    subscribers: Arc<Mutex<Vec<Sender<Notification>>>>,
    join: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Start the polling loop against the worker behind `conn`.
    pub fn start(conn: Arc<ClientConn>) -> Self {
        Self::start_with_interval(conn, POLL_INTERVAL)
    }

    /// Start with a custom interval (tests shorten it).
    pub fn start_with_interval(conn: Arc<ClientConn>, interval: Duration) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let subscribers: Arc<Mutex<Vec<Sender<Notification>>>> = Arc::new(Mutex::new(Vec::new()));
        let loop_stop = stop.clone();
        let loop_subscribers = subscribers.clone();
        let join = thread::spawn(move || {
            poll_loop(&conn, &loop_stop, &loop_subscribers, interval);
        });
        Self {
            stop,
            subscribers,
            join: Some(join),
        }
    }

    /// Register a subscriber; the returned receiver sees only changes.
    ///
    /// Dropping the receiver ends only that subscription; in-flight worker
    /// computations and other subscribers are unaffected.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .expect("subscriber list poisoned")
            .push(tx);
        rx
    }

    /// Stop the loop and join it.
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn poll_loop(
    conn: &ClientConn,
    stop: &AtomicBool,
    subscribers: &Mutex<Vec<Sender<Notification>>>,
    interval: Duration,
) {
    let mut previous: Option<String> = None;
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(interval);
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let notification = match poll_once(conn) {
            Ok(notification) => notification,
            Err(HarnessError::Channel(reason)) if reason.contains("closed") => {
                debug!("worker endpoint closed, subscription loop exiting");
                break;
            }
            Err(err) => {
                warn!(error = %err, "result poll failed, retrying next interval");
                continue;
            }
        };
        // Push only when the serialized result set changed.
        if previous.as_deref() == Some(notification.results.as_str()) {
            continue;
        }
        previous = Some(notification.results.clone());
        deliver(subscribers, &notification);
    }
}

fn poll_once(conn: &ClientConn) -> Result<Notification, HarnessError> {
    match conn.request_timeout(Request::GetResults, POLL_TIMEOUT)? {
        Response::Results { status, rows } => Ok(Notification {
            status,
            results: serde_json::to_string(&rows)?,
        }),
        other => Err(HarnessError::Channel(format!(
            "expected results response, got {other:?}"
        ))),
    }
}

/// Deliver to every live subscriber; a closed subscriber is dropped without
/// stalling the loop or the others.
fn deliver(subscribers: &Mutex<Vec<Sender<Notification>>>, notification: &Notification) {
    let mut list = subscribers.lock().expect("subscriber list poisoned");
    list.retain(|subscriber| subscriber.send(notification.clone()).is_ok());
    debug!(subscribers = list.len(), "pushed result notification");
}
