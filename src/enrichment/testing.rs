//! Scripted transport for client and builder tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::enrichment::transport::{
    AbortSignal, HttpRequest, HttpResponse, HttpTransport, TransportError,
};

type Route = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync>;

/// Replays queued responses in order, then falls back to an optional route.
pub(crate) struct ScriptedTransport {
    queue: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
    route: Option<Route>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            route: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn routed(
        route: impl Fn(&HttpRequest) -> Result<HttpResponse, TransportError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            route: Some(Box::new(route)),
            ..Self::new()
        }
    }

    pub(crate) fn push(&self, outcome: Result<HttpResponse, TransportError>) {
        self.queue.lock().expect("queue lock").push_back(outcome);
    }

    pub(crate) fn push_json(&self, status: u16, body: &str) {
        self.push(Ok(json_response(status, body)));
    }

    pub(crate) fn request_count(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub(crate) fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

pub(crate) fn json_response(status: u16, body: &str) -> HttpResponse {
    HttpResponse {
        status,
        retry_after_ms: None,
        body: body.to_string(),
    }
}

impl HttpTransport for ScriptedTransport {
    fn get(
        &self,
        request: &HttpRequest,
        abort: &AbortSignal,
    ) -> Result<HttpResponse, TransportError> {
        if abort.is_aborted() {
            return Err(TransportError::Aborted);
        }
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        if let Some(outcome) = self.queue.lock().expect("queue lock").pop_front() {
            return outcome;
        }
        match &self.route {
            Some(route) => route(request),
            None => Err(TransportError::Network("script exhausted".to_string())),
        }
    }
}
