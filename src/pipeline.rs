//! Single-flight generation queue.
//!
//! [`Pipeline::submit`] validates a request, appends it to the queue and
//! returns its 1-based position right away. A drain task then services the
//! queue head-first, one remote call at a time, and hands every entry's
//! [`GenerationResult`] to the [`ResultSink`] it was submitted with.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::image_processor::MetadataStripper;
use crate::models::{
    GenerationRequest, GenerationResult, Model, ModelFamily, SizeLimits, SubmitError,
};
use crate::nai::{extract_first_image, ApiResponse, GenerationError, ImageApi};
use crate::payload::{build_payload, resolve_seed, PayloadDocument};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Receives the outcome of one submission.
pub trait ResultSink: Send + 'static {
    fn deliver(self: Box<Self>, result: GenerationResult);
}

impl<F> ResultSink for F
where
    F: FnOnce(GenerationResult) + Send + 'static,
{
    fn deliver(self: Box<Self>, result: GenerationResult) {
        (*self)(result)
    }
}

/// Sink backed by a oneshot channel, for callers that want to await the result.
pub fn channel_sink() -> (impl ResultSink, oneshot::Receiver<GenerationResult>) {
    let (tx, rx) = oneshot::channel();
    let sink = move |result: GenerationResult| {
        // The caller may have stopped waiting; the result is dropped then.
        let _ = tx.send(result);
    };
    (sink, rx)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Generating,
}

pub struct QueueEntry {
    pub id: Uuid,
    pub request: GenerationRequest,
    pub enqueued_at: DateTime<Utc>,
    sink: Box<dyn ResultSink>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingEntry {
    pub id: Uuid,
    pub position: usize,
    pub model: Model,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub phase: Phase,
    pub pending: Vec<PendingEntry>,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub limits: SizeLimits,
    pub request_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self { limits: SizeLimits::default(), request_timeout: DEFAULT_REQUEST_TIMEOUT }
    }
}

struct QueueState {
    phase: Phase,
    entries: VecDeque<QueueEntry>,
}

struct Shared {
    state: Mutex<QueueState>,
    api: Arc<dyn ImageApi>,
    stripper: Arc<dyn MetadataStripper>,
    config: PipelineConfig,
}

/// Cheap to clone; all clones share one queue.
#[derive(Clone)]
pub struct Pipeline {
    shared: Arc<Shared>,
}

impl Pipeline {
    pub fn new(
        api: Arc<dyn ImageApi>,
        stripper: Arc<dyn MetadataStripper>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState { phase: Phase::Idle, entries: VecDeque::new() }),
                api,
                stripper,
                config,
            }),
        }
    }

    pub fn limits(&self) -> &SizeLimits {
        &self.shared.config.limits
    }

    /// Queue a request. Must be called from within a tokio runtime.
    pub fn submit(
        &self,
        request: GenerationRequest,
        sink: impl ResultSink,
    ) -> Result<(Uuid, usize), SubmitError> {
        request.validate(&self.shared.config.limits)?;

        let id = Uuid::new_v4();
        let position = {
            let mut state = self.shared.state.lock();
            let sink = Box::new(sink);
            state.entries.push_back(QueueEntry { id, request, enqueued_at: Utc::now(), sink });
            state.entries.len()
        };
        info!(%id, position, "📥 Request queued");

        self.try_start();
        Ok((id, position))
    }

    pub fn phase(&self) -> Phase {
        self.shared.state.lock().phase
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let state = self.shared.state.lock();
        QueueSnapshot {
            phase: state.phase,
            pending: state.entries.iter().enumerate().map(|(i, e)| PendingEntry {
                id: e.id,
                position: i + 1,
                model: e.request.model,
                enqueued_at: e.enqueued_at,
            }).collect(),
        }
    }

    /// Leave `Idle` if there is work. The check and the flag flip happen under
    /// one lock, so concurrent callers start at most one drain.
    fn try_start(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.phase != Phase::Idle || state.entries.is_empty() {
                return;
            }
            state.phase = Phase::Generating;
        }
        let pipeline = self.clone();
        tokio::spawn(async move { pipeline.drain().await });
    }

    async fn drain(self) {
        while let Some(entry) = self.next_entry() {
            let QueueEntry { id, request, sink, .. } = entry;
            info!(%id, model = request.model.id(), "🚀 Generating image");
            let result = self.run_isolated(id, request).await;
            match &result {
                GenerationResult::Success { seed, image } => {
                    info!(%id, seed, bytes = image.len(), "✅ Generation finished")
                }
                GenerationResult::Failure { reason } => {
                    error!(%id, "❌ Generation failed: {}", reason)
                }
            }
            if panic::catch_unwind(AssertUnwindSafe(|| sink.deliver(result))).is_err() {
                error!(%id, "❌ Result sink panicked");
            }
        }
    }

    /// Runs one entry on its own task so a panic in the transport or the
    /// stripper becomes a `Failure` instead of taking the drain down with it.
    async fn run_isolated(&self, id: Uuid, request: GenerationRequest) -> GenerationResult {
        let pipeline = self.clone();
        match tokio::spawn(async move { pipeline.run_one(&request).await }).await {
            Ok(result) => result,
            Err(e) => {
                error!(%id, "❌ Generation task aborted: {}", e);
                GenerationResult::Failure { reason: format!("internal error: {e}") }
            }
        }
    }

    /// Called with the phase at `Generating`, after the previous result (if
    /// any) was delivered. Either claims the new head or returns to `Idle`;
    /// both happen under the queue lock so a concurrent `submit` sees one or
    /// the other, never a window where two drains could run.
    fn next_entry(&self) -> Option<QueueEntry> {
        let mut state = self.shared.state.lock();
        let entry = state.entries.pop_front();
        state.phase = if entry.is_some() { Phase::Generating } else { Phase::Idle };
        entry
    }

    async fn run_one(&self, request: &GenerationRequest) -> GenerationResult {
        let seed = resolve_seed(request.seed, &mut rand::thread_rng());
        let payload = build_payload(request, seed);

        match self.generate_with_retry(request, &payload).await {
            Ok(image) => GenerationResult::Success { image, seed },
            Err(e) => GenerationResult::Failure { reason: e.to_string() },
        }
    }

    async fn generate_with_retry(
        &self,
        request: &GenerationRequest,
        payload: &PayloadDocument,
    ) -> Result<Bytes, GenerationError> {
        let response = self.call(payload).await?;
        if response.status == 500 && request.model.family() == ModelFamily::V4 {
            warn!("🔄 V4 model 500 error, retrying with simplified params");
            let retry = self.call(&payload.without_v4_captions()).await?;
            return self.unpack(request, retry).await;
        }
        self.unpack(request, response).await
    }

    async fn call(&self, payload: &PayloadDocument) -> Result<ApiResponse, GenerationError> {
        let timeout = self.shared.config.request_timeout;
        match tokio::time::timeout(timeout, self.shared.api.generate(payload)).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Transport(format!(
                "request timed out after {}s",
                timeout.as_secs()
            ))),
        }
    }

    /// Archive extraction and re-encoding are CPU-bound, so both run on the
    /// blocking pool.
    async fn unpack(
        &self,
        request: &GenerationRequest,
        response: ApiResponse,
    ) -> Result<Bytes, GenerationError> {
        if response.status != 200 {
            let detail = response.body_text();
            return Err(GenerationError::Remote { status: response.status, detail });
        }
        let body = response.body;
        let image = tokio::task::spawn_blocking(move || extract_first_image(&body))
            .await
            .map_err(|e| GenerationError::InvalidArchive(e.to_string()))??
            .ok_or(GenerationError::EmptyResponse)?;
        let image = Bytes::from(image);
        if !request.strip_metadata {
            return Ok(image);
        }

        let stripper = self.shared.stripper.clone();
        let original = image.clone();
        match tokio::task::spawn_blocking(move || stripper.strip(&image)).await {
            Ok(cleaned) => Ok(Bytes::from(cleaned)),
            Err(e) => {
                warn!("⚠️ Metadata stripping aborted, keeping original image: {}", e);
                Ok(original)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SizePreset;
    use crate::nai::tests::zip_with;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Replays scripted responses and records every payload it receives.
    struct ScriptedApi {
        responses: Mutex<VecDeque<Result<ApiResponse, GenerationError>>>,
        payloads: Mutex<Vec<serde_json::Value>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedApi {
        fn new(responses: Vec<Result<ApiResponse, GenerationError>>) -> Arc<Self> {
            Self::with_delay(responses, Duration::ZERO)
        }

        fn with_delay(
            responses: Vec<Result<ApiResponse, GenerationError>>,
            delay: Duration,
        ) -> Arc<Self> {
            Arc::new(Self {
                responses: Mutex::new(responses.into()),
                payloads: Mutex::new(Vec::new()),
                delay,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            })
        }

        fn payloads(&self) -> Vec<serde_json::Value> {
            self.payloads.lock().clone()
        }
    }

    #[async_trait]
    impl ImageApi for ScriptedApi {
        async fn generate(
            &self,
            payload: &PayloadDocument,
        ) -> Result<ApiResponse, GenerationError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            self.payloads.lock().push(serde_json::to_value(payload).unwrap());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.responses.lock().pop_front().unwrap_or_else(|| Ok(ok_png(b"default")))
        }
    }

    struct TaggingStripper;

    impl MetadataStripper for TaggingStripper {
        fn strip(&self, image: &[u8]) -> Vec<u8> {
            [b"clean:".as_slice(), image].concat()
        }
    }

    fn ok_archive(entries: &[(&str, &[u8])]) -> ApiResponse {
        ApiResponse { status: 200, body: Bytes::from(zip_with(entries)) }
    }

    fn ok_png(data: &[u8]) -> ApiResponse {
        ok_archive(&[("image_0.png", data)])
    }

    fn failure(reason: &str) -> GenerationResult {
        GenerationResult::Failure { reason: reason.into() }
    }

    fn status(code: u16, body: &str) -> ApiResponse {
        ApiResponse { status: code, body: Bytes::from(body.to_string()) }
    }

    fn pipeline(api: Arc<ScriptedApi>) -> Pipeline {
        Pipeline::new(api, Arc::new(TaggingStripper), PipelineConfig::default())
    }

    async fn run(pipeline: &Pipeline, request: GenerationRequest) -> GenerationResult {
        let (sink, rx) = channel_sink();
        pipeline.submit(request, sink).unwrap();
        rx.await.unwrap()
    }

    #[tokio::test]
    async fn positions_count_up_while_busy() {
        let api = ScriptedApi::with_delay(Vec::new(), Duration::from_millis(20));
        let pipeline = pipeline(api);

        let mut receivers = Vec::new();
        for expected in 1..=3 {
            let (sink, rx) = channel_sink();
            let request = GenerationRequest::new("a cat", Model::V3);
            let (_, position) = pipeline.submit(request, sink).unwrap();
            assert_eq!(position, expected);
            assert_eq!(pipeline.queue_len(), expected);
            receivers.push(rx);
        }
        assert_eq!(pipeline.phase(), Phase::Generating);

        for rx in receivers {
            assert!(rx.await.unwrap().is_success());
        }
        tokio::task::yield_now().await;
        assert_eq!(pipeline.phase(), Phase::Idle);
        assert_eq!(pipeline.queue_len(), 0);
    }

    #[tokio::test]
    async fn oversized_request_never_enters_queue() {
        let api = ScriptedApi::new(Vec::new());
        let pipeline = pipeline(api.clone());

        let mut request = GenerationRequest::new("a cat", Model::V3);
        request.width = Some(2000);
        request.height = Some(2000);
        let err = pipeline
            .submit(request, |_result: GenerationResult| panic!("must not be delivered"))
            .unwrap_err();

        assert!(matches!(err, SubmitError::SizeLimitExceeded { .. }));
        assert_eq!(pipeline.queue_len(), 0);
        assert_eq!(pipeline.phase(), Phase::Idle);
        assert!(api.payloads().is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn fifo_and_single_flight() {
        let api = ScriptedApi::with_delay(Vec::new(), Duration::from_millis(5));
        let pipeline = pipeline(api.clone());

        let mut handles = Vec::new();
        for i in 0..8u32 {
            let pipeline = pipeline.clone();
            handles.push(tokio::spawn(async move {
                let mut request = GenerationRequest::new(format!("prompt {i}"), Model::V3);
                request.seed = i64::from(i);
                let (sink, rx) = channel_sink();
                pipeline.submit(request, sink).unwrap();
                rx.await.unwrap()
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_success());
        }

        assert_eq!(api.max_in_flight.load(Ordering::SeqCst), 1);
        let sent: Vec<_> =
            api.payloads().iter().map(|p| p["parameters"]["seed"].as_u64().unwrap()).collect();
        assert_eq!(sent.len(), 8);
        let mut sorted = sent.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), 8, "every entry serviced exactly once");
    }

    #[tokio::test]
    async fn delivery_order_matches_submission_order() {
        let api = ScriptedApi::with_delay(Vec::new(), Duration::from_millis(2));
        let pipeline = pipeline(api.clone());
        let order = Arc::new(Mutex::new(Vec::new()));

        let (last_sink, last_rx) = channel_sink();
        for i in 0..5 {
            let order = order.clone();
            let request = GenerationRequest::new(format!("p{i}"), Model::V3);
            pipeline.submit(request, move |_r: GenerationResult| order.lock().push(i)).unwrap();
        }
        pipeline.submit(GenerationRequest::new("last", Model::V3), last_sink).unwrap();
        last_rx.await.unwrap();

        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        let inputs: Vec<_> =
            api.payloads().iter().map(|p| p["input"].as_str().unwrap().to_string()).collect();
        assert_eq!(inputs.last().unwrap(), "masterpiece, best quality, last");
    }

    #[tokio::test]
    async fn success_reports_resolved_seed() {
        let api = ScriptedApi::new(vec![Ok(ok_png(b"img"))]);
        let pipeline = pipeline(api.clone());

        match run(&pipeline, GenerationRequest::new("a cat", Model::V3)).await {
            GenerationResult::Success { image, seed } => {
                assert_eq!(image.as_ref(), b"img");
                assert_eq!(api.payloads()[0]["parameters"]["seed"], seed);
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn strip_flag_routes_through_stripper() {
        let api = ScriptedApi::new(vec![Ok(ok_png(b"img"))]);
        let pipeline = pipeline(api);

        let mut request = GenerationRequest::new("a cat", Model::V3);
        request.strip_metadata = true;
        match run(&pipeline, request).await {
            GenerationResult::Success { image, .. } => assert_eq!(image.as_ref(), b"clean:img"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn v4_server_error_retries_without_captions() {
        let api = ScriptedApi::new(vec![Ok(status(500, "boom")), Ok(ok_png(b"retry"))]);
        let pipeline = pipeline(api.clone());

        let mut request = GenerationRequest::new("a cat", Model::V4Full);
        request.seed = 77;
        let result = run(&pipeline, request).await;
        let expected = GenerationResult::Success { image: Bytes::from_static(b"retry"), seed: 77 };
        assert_eq!(result, expected);

        let payloads = api.payloads();
        assert_eq!(payloads.len(), 2);
        assert!(payloads[0]["parameters"].get("v4_prompt").is_some());
        assert!(payloads[1]["parameters"].get("v4_prompt").is_none());
        assert!(payloads[1]["parameters"].get("v4_negative_prompt").is_none());
        assert_eq!(payloads[1]["parameters"]["seed"], 77);
        assert_eq!(payloads[1]["input"], "a cat");
    }

    #[tokio::test]
    async fn failed_retry_reports_retry_detail() {
        let api = ScriptedApi::new(vec![Ok(status(500, "first")), Ok(status(503, "second"))]);
        let pipeline = pipeline(api.clone());

        let result = run(&pipeline, GenerationRequest::new("a cat", Model::V45Curated)).await;
        assert_eq!(result, GenerationResult::Failure { reason: "API error: 503 - second".into() });
        assert_eq!(api.payloads().len(), 2);
    }

    #[tokio::test]
    async fn v4_retry_without_image_fails() {
        let empty = ok_archive(&[("readme.txt", b"hi")]);
        let api = ScriptedApi::new(vec![Ok(status(500, "boom")), Ok(empty)]);
        let pipeline = pipeline(api.clone());

        let result = run(&pipeline, GenerationRequest::new("a cat", Model::V4Curated)).await;
        assert_eq!(result, GenerationResult::Failure { reason: "no image in response".into() });
        assert_eq!(api.payloads().len(), 2);
    }

    #[tokio::test]
    async fn v4_retry_transport_error_is_final() {
        let api = ScriptedApi::new(vec![
            Ok(status(500, "boom")),
            Err(GenerationError::Transport("connection reset".into())),
            Ok(ok_png(b"never")),
        ]);
        let pipeline = pipeline(api.clone());

        let result = run(&pipeline, GenerationRequest::new("a cat", Model::V45Full)).await;
        assert_eq!(result, failure("network error: connection reset"));
        assert_eq!(api.payloads().len(), 2);
    }

    #[tokio::test]
    async fn legacy_server_error_is_not_retried() {
        let api = ScriptedApi::new(vec![Ok(status(500, "boom")), Ok(ok_png(b"never"))]);
        let pipeline = pipeline(api.clone());

        let result = run(&pipeline, GenerationRequest::new("a cat", Model::V3)).await;
        assert_eq!(result, GenerationResult::Failure { reason: "API error: 500 - boom".into() });
        assert_eq!(api.payloads().len(), 1);
    }

    #[tokio::test]
    async fn archive_without_image_fails() {
        let empty = ok_archive(&[("readme.txt", b"hi")]);
        let api = ScriptedApi::new(vec![Ok(empty)]);
        let result = run(&pipeline(api), GenerationRequest::new("a cat", Model::V3)).await;
        assert_eq!(result, GenerationResult::Failure { reason: "no image in response".into() });
    }

    #[tokio::test]
    async fn transport_failure_does_not_stall_queue() {
        let api = ScriptedApi::new(vec![
            Err(GenerationError::Transport("connection reset".into())),
            Ok(ok_png(b"next")),
        ]);
        let pipeline = pipeline(api.clone());

        let (first_sink, first_rx) = channel_sink();
        let (second_sink, second_rx) = channel_sink();
        pipeline.submit(GenerationRequest::new("one", Model::V4Full), first_sink).unwrap();
        pipeline.submit(GenerationRequest::new("two", Model::V3), second_sink).unwrap();

        assert_eq!(first_rx.await.unwrap(), failure("network error: connection reset"));
        assert!(second_rx.await.unwrap().is_success());
        assert_eq!(api.payloads().len(), 2, "transport errors are not retried");
    }

    /// Panics on its first call, then behaves.
    struct FlakyApi {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageApi for FlakyApi {
        async fn generate(
            &self,
            _payload: &PayloadDocument,
        ) -> Result<ApiResponse, GenerationError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("transport blew up");
            }
            Ok(ok_png(b"fine"))
        }
    }

    #[tokio::test]
    async fn panicking_generation_fails_entry_and_queue_recovers() {
        let api = Arc::new(FlakyApi { calls: AtomicUsize::new(0) });
        let pipeline = Pipeline::new(api, Arc::new(TaggingStripper), PipelineConfig::default());

        let (first_sink, first_rx) = channel_sink();
        let (second_sink, second_rx) = channel_sink();
        pipeline.submit(GenerationRequest::new("one", Model::V3), first_sink).unwrap();
        pipeline.submit(GenerationRequest::new("two", Model::V3), second_sink).unwrap();

        match first_rx.await.unwrap() {
            GenerationResult::Failure { reason } => {
                assert!(reason.starts_with("internal error"), "{reason}")
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(second_rx.await.unwrap().is_success());

        tokio::task::yield_now().await;
        assert_eq!(pipeline.phase(), Phase::Idle);
        assert!(run(&pipeline, GenerationRequest::new("three", Model::V3)).await.is_success());
    }

    struct PanickingStripper;

    impl MetadataStripper for PanickingStripper {
        fn strip(&self, _image: &[u8]) -> Vec<u8> {
            panic!("encoder blew up");
        }
    }

    #[tokio::test]
    async fn stripper_panic_keeps_original_image() {
        let api = ScriptedApi::new(vec![Ok(ok_png(b"raw"))]);
        let pipeline = Pipeline::new(api, Arc::new(PanickingStripper), PipelineConfig::default());

        let mut request = GenerationRequest::new("a cat", Model::V3);
        request.strip_metadata = true;
        match run(&pipeline, request).await {
            GenerationResult::Success { image, .. } => assert_eq!(image.as_ref(), b"raw"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out() {
        let api = ScriptedApi::with_delay(vec![Ok(ok_png(b"late"))], Duration::from_secs(120));
        let pipeline = pipeline(api);

        let result = run(&pipeline, GenerationRequest::new("a cat", Model::V3)).await;
        assert_eq!(result, failure("network error: request timed out after 60s"));
        assert_eq!(pipeline.queue_len(), 0);
    }

    #[tokio::test]
    async fn snapshot_lists_pending_in_order() {
        let api = ScriptedApi::with_delay(Vec::new(), Duration::from_millis(50));
        let pipeline = pipeline(api);

        let mut request = GenerationRequest::new("a", Model::V2);
        request.size_preset = Some(SizePreset::SquareS);
        let (first, _) = pipeline.submit(request, |_r: GenerationResult| {}).unwrap();
        let (second, _) = pipeline
            .submit(GenerationRequest::new("b", Model::V4Full), |_r: GenerationResult| {})
            .unwrap();

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.phase, Phase::Generating);
        let ids: Vec<_> = snapshot.pending.iter().map(|p| (p.id, p.position, p.model)).collect();
        assert_eq!(ids, vec![(first, 1, Model::V2), (second, 2, Model::V4Full)]);
    }
}
