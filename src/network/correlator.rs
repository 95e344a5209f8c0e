//! Request correlation
//!
//! Maps outstanding request ids to the callers awaiting them. Every entry is
//! removed exactly once: by its matching response or by a teardown sweep.

use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::protocol::{
    BatchRequestItem, BatchResult, Message, Request, RequestBatch, RequestBatchResponse,
    RequestFailure, RequestResponse,
};

/// Failure delivered to a pending caller
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RequestError {
    #[error("Request failed: {0}")]
    Failed(#[from] RequestFailure),

    #[error("Connection closed ({code}): {reason}")]
    ConnectionClosed { code: u16, reason: String },

    #[error("Batch returned {received} of {expected} results")]
    IncompleteBatch { expected: usize, received: usize },
}

pub type RequestResult = Result<Option<Value>, RequestError>;
pub type BatchOutcome = Result<Vec<Option<Value>>, RequestError>;

/// A member of a batch as supplied by the caller
#[derive(Debug, Clone, PartialEq)]
pub struct BatchRequest {
    pub request_type: String,
    pub request_data: Option<Value>,
}

impl BatchRequest {
    pub fn new(request_type: impl Into<String>, request_data: Option<Value>) -> Self {
        Self {
            request_type: request_type.into(),
            request_data,
        }
    }
}

/// Options forwarded untouched in the RequestBatch frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOptions {
    pub halt_on_failure: Option<bool>,
    pub execution_type: Option<i32>,
}

enum Pending {
    Single {
        request_type: String,
        tx: oneshot::Sender<RequestResult>,
    },
    Batch {
        member_ids: Vec<String>,
        tx: oneshot::Sender<BatchOutcome>,
    },
}

#[derive(Default)]
pub struct RequestCorrelator {
    pending: HashMap<String, Pending>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    fn fresh_id(&self) -> String {
        loop {
            let id = uuid::Uuid::new_v4().to_string();
            if !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    /// Record a pending request and build its frame
    pub fn register_request(
        &mut self,
        request_type: &str,
        request_data: Option<Value>,
    ) -> (String, Message, oneshot::Receiver<RequestResult>) {
        let id = self.fresh_id();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(
            id.clone(),
            Pending::Single {
                request_type: request_type.to_string(),
                tx,
            },
        );

        let message = Message::Request(Request {
            request_type: request_type.to_string(),
            request_id: id.clone(),
            request_data,
        });
        (id, message, rx)
    }

    /// Record a pending batch and build its frame. Every member gets a fresh id.
    pub fn register_batch(
        &mut self,
        requests: Vec<BatchRequest>,
        options: BatchOptions,
    ) -> (String, Message, oneshot::Receiver<BatchOutcome>) {
        let id = self.fresh_id();
        let items: Vec<BatchRequestItem> = requests
            .into_iter()
            .map(|r| BatchRequestItem {
                request_type: r.request_type,
                request_id: Some(uuid::Uuid::new_v4().to_string()),
                request_data: r.request_data,
            })
            .collect();
        let member_ids = items
            .iter()
            .filter_map(|item| item.request_id.clone())
            .collect();

        let (tx, rx) = oneshot::channel();
        self.pending
            .insert(id.clone(), Pending::Batch { member_ids, tx });

        let message = Message::RequestBatch(RequestBatch {
            request_id: id.clone(),
            halt_on_failure: options.halt_on_failure,
            execution_type: options.execution_type,
            requests: items,
        });
        (id, message, rx)
    }

    /// Drop a pending entry without resolving it (e.g. the send failed)
    pub fn cancel(&mut self, id: &str) -> bool {
        self.pending.remove(id).is_some()
    }

    /// Resolve the caller matching a RequestResponse. Returns false if unmatched.
    pub fn resolve_response(&mut self, response: RequestResponse) -> bool {
        let Some(pending) = self.take_matching(&response.request_id, false) else {
            tracing::warn!(
                "Discarding response to unknown request {} ({})",
                response.request_id,
                response.request_type
            );
            return false;
        };
        let Pending::Single { request_type, tx } = pending else {
            return false;
        };

        let result = if response.request_status.result {
            Ok(response.response_data)
        } else {
            let failure = response.request_status.to_failure(&request_type);
            tracing::debug!("Request {} rejected: {}", response.request_id, failure);
            Err(RequestError::Failed(failure))
        };
        let _ = tx.send(result);
        true
    }

    /// Resolve the caller matching a RequestBatchResponse. Returns false if unmatched.
    pub fn resolve_batch(&mut self, response: RequestBatchResponse) -> bool {
        let Some(pending) = self.take_matching(&response.request_id, true) else {
            tracing::warn!(
                "Discarding response to unknown batch {}",
                response.request_id
            );
            return false;
        };
        let Pending::Batch { member_ids, tx } = pending else {
            return false;
        };

        let _ = tx.send(aggregate_batch(&member_ids, response.results));
        true
    }

    /// Fail every outstanding entry. Returns how many were failed.
    pub fn fail_all(&mut self, error: RequestError) -> usize {
        let count = self.pending.len();
        for (_, pending) in self.pending.drain() {
            match pending {
                Pending::Single { tx, .. } => {
                    let _ = tx.send(Err(error.clone()));
                }
                Pending::Batch { tx, .. } => {
                    let _ = tx.send(Err(error.clone()));
                }
            }
        }
        count
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove the entry for `id` only if it is of the expected kind
    fn take_matching(&mut self, id: &str, batch: bool) -> Option<Pending> {
        let matches = match self.pending.get(id)? {
            Pending::Single { .. } => !batch,
            Pending::Batch { .. } => batch,
        };
        if matches {
            self.pending.remove(id)
        } else {
            None
        }
    }
}

/// Map batch results back to the caller's order. The first failure in
/// server order wins; results beyond the member list are ignored.
fn aggregate_batch(member_ids: &[String], results: Vec<BatchResult>) -> BatchOutcome {
    let mut collected: Vec<Option<Option<Value>>> = vec![None; member_ids.len()];
    let mut received = 0;

    for (index, result) in results.into_iter().enumerate() {
        let position = result
            .request_id
            .as_ref()
            .and_then(|id| member_ids.iter().position(|m| m == id))
            .unwrap_or(index);

        let Some(slot) = collected.get_mut(position) else {
            tracing::warn!("Ignoring batch result beyond {} members", member_ids.len());
            continue;
        };
        if slot.is_some() {
            continue;
        }

        if !result.request_status.result {
            return Err(RequestError::Failed(
                result.request_status.to_failure(&result.request_type),
            ));
        }
        *slot = Some(result.response_data);
        received += 1;
    }

    if received < member_ids.len() {
        return Err(RequestError::IncompleteBatch {
            expected: member_ids.len(),
            received,
        });
    }

    Ok(collected.into_iter().flatten().collect())
}
