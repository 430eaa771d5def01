#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::StreamExt;
use llm_relay::error::{ErrorKind, LLMError};
use llm_relay::http::{HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport};
use llm_relay::ratelimit::{DynClock, ManualClock, RateLimitTracker};
use llm_relay::{
    BackendConfig, BackendPool, CapabilityDescriptor, ChatChunk, ChatRequest, ChatResponse,
    ChatStream, DynProvider, FinishReason, Orchestrator, ProviderClient, TokenUsage,
};

/// What a stub backend does on its next call.
#[derive(Debug, Clone)]
pub enum Outcome {
    Reply(String),
    Fail(ErrorKind),
    /// Streams `partial` and then ends with an error chunk. Blocking calls fail outright.
    StreamCut(Vec<String>, ErrorKind),
}

pub fn reply(text: &str) -> Outcome {
    Outcome::Reply(text.to_string())
}

/// Deterministic backend driven by a script, falling back to a default outcome.
pub struct StubProvider {
    config: BackendConfig,
    caps: CapabilityDescriptor,
    limiter: RateLimitTracker,
    script: Mutex<VecDeque<Outcome>>,
    default: Outcome,
    calls: AtomicUsize,
    open_streams: Arc<AtomicUsize>,
    last_request: Mutex<Option<ChatRequest>>,
}

/// Counts a live upstream stream until dropped.
struct OpenStream(Arc<AtomicUsize>);

impl OpenStream {
    fn new(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for OpenStream {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl StubProvider {
    pub fn new(id: &str, clock: &ManualClock) -> Self {
        Self {
            config: BackendConfig::new(id, "stub"),
            caps: CapabilityDescriptor::default(),
            limiter: RateLimitTracker::new(1_000, 10_000_000, Arc::new(clock.clone())),
            script: Mutex::new(VecDeque::new()),
            default: reply("ok"),
            calls: AtomicUsize::new(0),
            open_streams: Arc::new(AtomicUsize::new(0)),
            last_request: Mutex::new(None),
        }
    }

    pub fn with_rpm(mut self, rpm: u64, clock: &ManualClock) -> Self {
        let shared: DynClock = Arc::new(clock.clone());
        self.limiter = RateLimitTracker::new(rpm, 10_000_000, shared);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.config.enabled = false;
        self
    }

    pub fn with_strengths(mut self, strengths: &[&str]) -> Self {
        self.caps.strengths = strengths.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_script(self, outcomes: Vec<Outcome>) -> Self {
        *self.script.lock().unwrap() = outcomes.into();
        self
    }

    pub fn always(mut self, outcome: Outcome) -> Self {
        self.default = outcome;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Upstream streams handed out and not yet dropped.
    pub fn open_streams(&self) -> usize {
        self.open_streams.load(Ordering::SeqCst)
    }

    pub fn last_request(&self) -> Option<ChatRequest> {
        self.last_request.lock().unwrap().clone()
    }

    fn next_outcome(&self, request: &ChatRequest) -> Outcome {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_request.lock().unwrap() = Some(request.clone());
        self.script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.default.clone())
    }

    fn error(&self, kind: ErrorKind) -> LLMError {
        LLMError::classified(kind, self.id(), None, "scripted failure".to_string(), None)
    }
}

fn usage_for(text: &str) -> TokenUsage {
    TokenUsage::new(5, text.split_whitespace().count() as u64)
}

#[async_trait]
impl ProviderClient for StubProvider {
    fn id(&self) -> &str {
        &self.config.id
    }

    fn config(&self) -> &BackendConfig {
        &self.config
    }

    fn capabilities(&self) -> &CapabilityDescriptor {
        &self.caps
    }

    fn rate_limiter(&self) -> &RateLimitTracker {
        &self.limiter
    }

    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, LLMError> {
        match self.next_outcome(&request) {
            Outcome::Reply(text) => Ok(ChatResponse::new(
                self.id(),
                text.clone(),
                FinishReason::Stop,
                usage_for(&text),
            )),
            Outcome::Fail(kind) | Outcome::StreamCut(_, kind) => Err(self.error(kind)),
        }
    }

    async fn stream_chat(&self, request: ChatRequest) -> Result<ChatStream, LLMError> {
        let id = "upstream";
        let backend = self.id().to_string();
        let chunks: Vec<ChatChunk> = match self.next_outcome(&request) {
            Outcome::Reply(text) => text
                .split_inclusive(' ')
                .map(|piece| ChatChunk::delta(id, &backend, piece))
                .chain(std::iter::once(ChatChunk::terminal(
                    id,
                    &backend,
                    FinishReason::Stop,
                    usage_for(&text),
                )))
                .collect(),
            Outcome::Fail(kind) => return Err(self.error(kind)),
            Outcome::StreamCut(partial, kind) => partial
                .iter()
                .map(|piece| ChatChunk::delta(id, &backend, piece.as_str()))
                .chain(std::iter::once(ChatChunk::failed(id, &backend, &self.error(kind))))
                .collect(),
        };
        let guard = OpenStream::new(&self.open_streams);
        Ok(Box::pin(futures_util::stream::iter(chunks).map(move |chunk| {
            let _held = &guard;
            chunk
        })))
    }

    async fn health_check(&self) -> bool {
        self.config.enabled
    }
}

pub fn orchestrator(backends: &[Arc<StubProvider>]) -> Orchestrator {
    orchestrator_with(backends, |builder| builder)
}

pub fn orchestrator_with(
    backends: &[Arc<StubProvider>],
    configure: impl FnOnce(llm_relay::orchestrator::OrchestratorBuilder) -> llm_relay::orchestrator::OrchestratorBuilder,
) -> Orchestrator {
    let mut pool = BackendPool::builder();
    for backend in backends {
        pool = pool.register(backend.clone() as DynProvider);
    }
    configure(Orchestrator::builder(pool.build().expect("pool")))
        .build()
        .expect("orchestrator")
}

pub async fn collect(stream: ChatStream) -> Vec<ChatChunk> {
    stream.collect().await
}

pub fn text_of(chunks: &[ChatChunk]) -> String {
    chunks.iter().map(|chunk| chunk.delta.as_str()).collect()
}

/// Canned HTTP exchange for the in-memory transport.
#[derive(Debug, Clone)]
pub enum CannedResponse {
    Json(u16, String),
    JsonWithHeaders(u16, String, HashMap<String, String>),
    Sse(Vec<String>),
}

/// Transport that records requests and replies from a queue per URL substring.
#[derive(Default)]
pub struct MockTransport {
    routes: Mutex<Vec<(String, VecDeque<CannedResponse>)>>,
    pub requests: Mutex<Vec<HttpRequest>>,
}

impl MockTransport {
    pub fn route(self, url_fragment: &str, responses: Vec<CannedResponse>) -> Self {
        self.routes
            .lock()
            .unwrap()
            .push((url_fragment.to_string(), responses.into()));
        self
    }

    pub fn recorded(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn next(&self, request: &HttpRequest) -> Result<CannedResponse, LLMError> {
        self.requests.lock().unwrap().push(request.clone());
        let mut routes = self.routes.lock().unwrap();
        routes
            .iter_mut()
            .find(|(fragment, _)| request.url.contains(fragment.as_str()))
            .and_then(|(_, queue)| queue.pop_front())
            .ok_or_else(|| LLMError::transport(format!("no canned response for {}", request.url)))
    }
}

#[async_trait]
impl HttpTransport for MockTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, LLMError> {
        match self.next(&request)? {
            CannedResponse::Json(status, body) => Ok(HttpResponse {
                status,
                headers: HashMap::new(),
                body: body.into_bytes(),
            }),
            CannedResponse::JsonWithHeaders(status, body, headers) => Ok(HttpResponse {
                status,
                headers,
                body: body.into_bytes(),
            }),
            CannedResponse::Sse(_) => Err(LLMError::transport("stream response on blocking call")),
        }
    }

    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, LLMError> {
        let (status, headers, pieces) = match self.next(&request)? {
            CannedResponse::Sse(events) => (200, HashMap::new(), events),
            CannedResponse::Json(status, body) => (status, HashMap::new(), vec![body]),
            CannedResponse::JsonWithHeaders(status, body, headers) => (status, headers, vec![body]),
        };
        let body: HttpBodyStream = Box::pin(futures_util::stream::iter(
            pieces.into_iter().map(|piece| Ok(piece.into_bytes())),
        ));
        Ok(HttpStreamResponse {
            status,
            headers,
            body,
        })
    }
}
