//! A scripted in-memory transport

use async_trait::async_trait;
use refsync_store::HttpMethod;
use refsync_sync::{OutboundRequest, SyncError, Transport, TransportResponse};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

type Scripted = Result<TransportResponse, SyncError>;

/// Answers requests from a per-route script
///
/// Routes are `(method, path)`. A path is matched exactly first and then
/// without its query string. Responses for a route are consumed in order;
/// the last one keeps answering. Unscripted routes get a 404.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<HashMap<(HttpMethod, String), VecDeque<Scripted>>>,
    log: Mutex<Vec<OutboundRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond(self, method: HttpMethod, path: &str, response: TransportResponse) -> Self {
        self.push(method, path, Ok(response));
        self
    }

    /// Answer a GET with a 200 and `body`
    pub fn get(self, path: &str, body: impl Into<String>) -> Self {
        self.respond(HttpMethod::Get, path, TransportResponse::new(200, body))
    }

    pub fn fail(self, method: HttpMethod, path: &str, error: SyncError) -> Self {
        self.push(method, path, Err(error));
        self
    }

    fn push(&self, method: HttpMethod, path: &str, scripted: Scripted) {
        self.routes
            .lock()
            .unwrap()
            .entry((method, path.to_string()))
            .or_default()
            .push_back(scripted);
    }

    /// Every request executed so far, in order
    pub fn requests(&self) -> Vec<OutboundRequest> {
        self.log.lock().unwrap().clone()
    }

    /// How many times `path` (with or without query) was requested
    pub fn count(&self, method: HttpMethod, path: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method && (r.path == path || strip_query(&r.path) == path))
            .count()
    }

    fn next_for(&self, method: HttpMethod, path: &str) -> Option<Scripted> {
        let mut routes = self.routes.lock().unwrap();
        let exact = (method, path.to_string());
        let route = if routes.contains_key(&exact) {
            exact
        } else {
            (method, strip_query(path).to_string())
        };
        let queue = routes.get_mut(&route)?;
        if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().map(|scripted| match scripted {
                Ok(response) => Ok(response.clone()),
                Err(error) => Err(replay(error)),
            })
        }
    }
}

fn strip_query(path: &str) -> &str {
    path.split('?').next().unwrap_or(path)
}

/// `SyncError` is not `Clone`; repeated failures are rebuilt
fn replay(error: &SyncError) -> SyncError {
    match error {
        SyncError::Transport { message, retryable } => SyncError::Transport {
            message: message.clone(),
            retryable: *retryable,
        },
        SyncError::Http { status, message } => SyncError::Http {
            status: *status,
            message: message.clone(),
        },
        other => SyncError::MalformedResponse(other.to_string()),
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn execute(&self, request: &OutboundRequest) -> refsync_sync::Result<TransportResponse> {
        self.log.lock().unwrap().push(request.clone());
        match self.next_for(request.method, &request.path) {
            Some(scripted) => scripted,
            None => Ok(TransportResponse::new(404, "not scripted")),
        }
    }
}
