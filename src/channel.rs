//! Duplex request/response channel between the computation worker and the
//! front-facing responder.
//!
//! One shared channel carries strict request/response pairs: a requester
//! blocks until exactly one matching response arrives, and concurrent
//! requesters serialize on the endpoint so framing can never interleave.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::HarnessError;
use crate::types::{MetricName, ModelName, SliceName, StatusMessage};

/// Request messages understood by the worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Request {
    /// List distill functions and the slices each produced.
    GetSlicers,
    /// List user-facing metric functions.
    GetTesters,
    /// List registered slices with their sizes.
    GetSlices,
    /// Fetch the full dataset snapshot as JSON.
    GetData,
    /// Fetch a bounded row sample for the named slice.
    GetSample(SliceName),
    /// Fetch the current result rows plus the worker status line.
    GetResults,
}

/// One slicer (distill function) listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SlicerInfo {
    /// Distill-function name.
    pub name: String,
    /// Where the function came from (`programmatic` for registered code).
    pub source: String,
    /// Names of the slices attributed to this slicer.
    pub slices: Vec<SliceName>,
}

/// One tester (metric function) listing.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TesterInfo {
    /// Metric-function name.
    pub name: MetricName,
    /// Where the function came from (`programmatic` for registered code).
    pub source: String,
}

/// One slice listing with its materialized cardinality.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SliceInfo {
    /// Slice name.
    pub name: SliceName,
    /// Number of rows the slice's predicates select.
    pub size: usize,
}

/// One serialized result row of the `GetResults` payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultRow {
    /// Metric this row reports.
    pub tester_name: MetricName,
    /// Slice this row reports on.
    pub slice_name: SliceName,
    /// Number of rows in the slice.
    pub slice_size: usize,
    /// Metric value per model; `None` marks a recorded per-key error.
    pub model_results: IndexMap<ModelName, Option<f64>>,
}

/// Response messages produced by the worker, one per request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    /// Answer to [`Request::GetSlicers`].
    Slicers(Vec<SlicerInfo>),
    /// Answer to [`Request::GetTesters`].
    Testers(Vec<TesterInfo>),
    /// Answer to [`Request::GetSlices`].
    Slices(Vec<SliceInfo>),
    /// Dataset snapshot serialized as a JSON array of row objects.
    Data(String),
    /// Sampled slice rows serialized as a JSON array of row objects.
    Sample(String),
    /// Current result rows with the worker status line.
    Results {
        /// Worker status at the time the rows were assembled.
        status: StatusMessage,
        /// One row per (metric, slice) pairing.
        rows: Vec<ResultRow>,
    },
}

/// Front-facing endpoint of the duplex channel.
pub struct ClientConn {
    tx: Sender<Request>,
    rx: Mutex<Receiver<Response>>,
}

/// Worker-facing endpoint of the duplex channel.
pub struct WorkerConn {
    rx: Receiver<Request>,
    tx: Sender<Response>,
}

/// Create a connected client/worker endpoint pair.
pub fn pair() -> (ClientConn, WorkerConn) {
    let (request_tx, request_rx) = mpsc::channel();
    let (response_tx, response_rx) = mpsc::channel();
    (
        ClientConn {
            tx: request_tx,
            rx: Mutex::new(response_rx),
        },
        WorkerConn {
            rx: request_rx,
            tx: response_tx,
        },
    )
}

impl ClientConn {
    /// Send one request and block until its response arrives.
    ///
    /// The receive side is held for the whole exchange, so concurrent
    /// callers serialize and responses can never be claimed out of order.
    pub fn request(&self, request: Request) -> Result<Response, HarnessError> {
        let rx = self.rx.lock().expect("client channel poisoned");
        self.tx
            .send(request)
            .map_err(|_| HarnessError::Channel("worker endpoint closed".to_string()))?;
        rx.recv()
            .map_err(|_| HarnessError::Channel("worker endpoint closed".to_string()))
    }

    /// Like [`ClientConn::request`] but gives up after `timeout`.
    ///
    /// An unanswered request times out here rather than corrupting framing
    /// for subsequent requests: the stale response, if it ever arrives, is
    /// drained before the next request is sent.
    pub fn request_timeout(
        &self,
        request: Request,
        timeout: Duration,
    ) -> Result<Response, HarnessError> {
        let rx = self.rx.lock().expect("client channel poisoned");
        // Drop any stale response left by a previous timeout.
        while rx.try_recv().is_ok() {}
        self.tx
            .send(request)
            .map_err(|_| HarnessError::Channel("worker endpoint closed".to_string()))?;
        match rx.recv_timeout(timeout) {
            Ok(response) => Ok(response),
            Err(RecvTimeoutError::Timeout) => {
                Err(HarnessError::Channel("request timed out".to_string()))
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(HarnessError::Channel("worker endpoint closed".to_string()))
            }
        }
    }
}

impl WorkerConn {
    /// Block for the next request; `None` when every client is gone.
    pub fn next_request(&self) -> Option<Request> {
        self.rx.recv().ok()
    }

    /// Send the response for the request currently being served.
    pub fn respond(&self, response: Response) -> Result<(), HarnessError> {
        self.tx
            .send(response)
            .map_err(|_| HarnessError::Channel("client endpoint closed".to_string()))
    }
}
