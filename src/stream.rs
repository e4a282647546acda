//! Stream manager: turns backend output into an ordered event stream of
//! chunks with heartbeats and per-stream cancellation.
//!
//! Backends with native streaming are forwarded with a re-assigned
//! monotonic `chunk_index`; buffered backends are simulated by chopping
//! the full response into fixed-size segments with a configurable delay.
//! When nothing has been emitted for the heartbeat interval while the
//! upstream call is still open, a heartbeat marker is emitted to keep
//! transport connections alive (heartbeats are not indexed).

use crate::backend::{Backend, StreamChunk};
use crate::config::StreamConfig;
use crate::types::GatewayRequest;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// One event on a managed stream.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Chunk(StreamChunk),
    /// Keep-alive marker; carries no content and no index.
    Heartbeat,
}

impl StreamEvent {
    /// Wire format: chunks as `data:` frames, heartbeats as SSE comments.
    pub fn to_sse(&self) -> String {
        match self {
            StreamEvent::Chunk(chunk) => chunk.to_sse(),
            StreamEvent::Heartbeat => ": heartbeat\n\n".to_string(),
        }
    }
}

pub struct StreamManager {
    config: StreamConfig,
    active: Arc<Mutex<HashMap<String, AbortHandle>>>,
}

impl StreamManager {
    pub fn new(config: StreamConfig) -> Self {
        Self {
            config,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Open a managed stream for the request on the given backend.
    ///
    /// The returned receiver yields content chunks in `chunk_index` order,
    /// heartbeats during silence, and exactly one final chunk — unless the
    /// stream is cancelled, in which case the channel just closes.
    pub fn open_stream(
        &self,
        request: &GatewayRequest,
        backend: Arc<dyn Backend>,
    ) -> mpsc::Receiver<StreamEvent> {
        let (chunk_tx, mut chunk_rx) = mpsc::channel::<StreamChunk>(64);
        let (event_tx, event_rx) = mpsc::channel::<StreamEvent>(64);

        let producer = tokio::spawn(produce(
            request.clone(),
            backend,
            chunk_tx,
            self.config.clone(),
        ));
        let request_id = request.id.clone();
        self.active
            .lock()
            .unwrap()
            .insert(request_id.clone(), producer.abort_handle());

        let heartbeat = Duration::from_secs_f64(self.config.heartbeat_interval_s.max(0.001));
        let active = Arc::clone(&self.active);
        tokio::spawn(async move {
            loop {
                match tokio::time::timeout(heartbeat, chunk_rx.recv()).await {
                    Ok(Some(chunk)) => {
                        let is_final = chunk.is_final;
                        if event_tx.send(StreamEvent::Chunk(chunk)).await.is_err() {
                            break;
                        }
                        if is_final {
                            break;
                        }
                    }
                    // Producer finished or was aborted; close the stream.
                    Ok(None) => break,
                    Err(_) => {
                        if event_tx.send(StreamEvent::Heartbeat).await.is_err() {
                            break;
                        }
                    }
                }
            }
            active.lock().unwrap().remove(&request_id);
        });

        event_rx
    }

    /// Cancel an active stream: aborts the upstream task, which closes the
    /// chunk channel. Returns whether a stream was found.
    pub fn cancel(&self, request_id: &str) -> bool {
        match self.active.lock().unwrap().remove(request_id) {
            Some(handle) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Cancel every active stream (shutdown path).
    pub fn cancel_all(&self) {
        let mut active = self.active.lock().unwrap();
        for (_, handle) in active.drain() {
            handle.abort();
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

async fn produce(
    request: GatewayRequest,
    backend: Arc<dyn Backend>,
    tx: mpsc::Sender<StreamChunk>,
    config: StreamConfig,
) {
    match backend.execute_stream(&request).await {
        Some(mut stream) => {
            use futures::StreamExt;
            let mut index: u64 = 0;
            let mut sent_final = false;
            while let Some(mut chunk) = stream.next().await {
                chunk.chunk_index = index;
                if chunk.is_final {
                    // A final chunk that still carries content keeps its
                    // content position and the final marker.
                    if tx.send(chunk).await.is_err() {
                        return;
                    }
                    sent_final = true;
                    break;
                }
                if chunk.content.is_empty() {
                    continue;
                }
                if tx.send(chunk).await.is_err() {
                    return;
                }
                index += 1;
            }
            if !sent_final {
                let mut last = StreamChunk::final_chunk(&request.id, index);
                last.provider = Some(backend.name().to_string());
                let _ = tx.send(last).await;
            }
        }
        None => {
            let result = backend.execute(&request).await;
            if !result.success {
                let _ = tx
                    .send(StreamChunk::error_chunk(
                        &request.id,
                        0,
                        result.error.unwrap_or_else(|| "unknown error".to_string()),
                    ))
                    .await;
                return;
            }

            let content = result.response.unwrap_or_default();
            let delay = Duration::from_secs_f64(config.chunk_delay_ms.max(0.0) / 1000.0);
            let chars: Vec<char> = content.chars().collect();
            let mut index: u64 = 0;
            for segment in chars.chunks(config.chunk_size.max(1)) {
                let segment: String = segment.iter().collect();
                if tx
                    .send(StreamChunk::content(&request.id, segment, index))
                    .await
                    .is_err()
                {
                    return;
                }
                index += 1;
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            let mut last = StreamChunk::final_chunk(&request.id, index);
            last.tokens_used = result.tokens_used;
            last.provider = Some(backend.name().to_string());
            let _ = tx.send(last).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BackendResult, ChunkStream, MockBackend};
    use crate::types::BackendKind;
    use async_trait::async_trait;

    fn manager(chunk_size: usize, chunk_delay_ms: f64, heartbeat_s: f64) -> Arc<StreamManager> {
        Arc::new(StreamManager::new(StreamConfig {
            chunk_size,
            chunk_delay_ms,
            heartbeat_interval_s: heartbeat_s,
            ..StreamConfig::default()
        }))
    }

    async fn collect(mut rx: mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        events
    }

    fn chunks(events: &[StreamEvent]) -> Vec<&StreamChunk> {
        events
            .iter()
            .filter_map(|e| match e {
                StreamEvent::Chunk(c) => Some(c),
                StreamEvent::Heartbeat => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_simulated_chunking_reconstructs_response() {
        let body: String = "x".repeat(1024);
        let backend = Arc::new(MockBackend::fixed("alpha", body.clone()));
        let manager = manager(64, 10.0, 15.0);
        let request = GatewayRequest::new("alpha", "q");

        let start = std::time::Instant::now();
        let events = collect(manager.open_stream(&request, backend)).await;
        let elapsed = start.elapsed();

        let chunks = chunks(&events);
        // 16 content chunks (index 0..15) then one terminal chunk.
        assert_eq!(chunks.len(), 17);
        for (i, chunk) in chunks.iter().take(16).enumerate() {
            assert_eq!(chunk.chunk_index, i as u64);
            assert_eq!(chunk.content.len(), 64);
            assert!(!chunk.is_final);
        }
        let last = chunks.last().unwrap();
        assert!(last.is_final);
        assert_eq!(last.chunk_index, 16);
        assert_eq!(last.provider.as_deref(), Some("alpha"));

        let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rebuilt, body);
        assert!(elapsed >= Duration::from_millis(150), "elapsed {:?}", elapsed);
    }

    #[tokio::test]
    async fn test_simulated_short_response() {
        let backend = Arc::new(MockBackend::fixed("alpha", "tiny"));
        let manager = manager(64, 0.0, 15.0);
        let events = collect(manager.open_stream(&GatewayRequest::new("alpha", "q"), backend)).await;
        let chunks = chunks(&events);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].content, "tiny");
        assert!(chunks[1].is_final);
    }

    #[tokio::test]
    async fn test_error_emits_terminal_chunk() {
        let backend = Arc::new(MockBackend::failing("alpha", "API error 500: dead"));
        let manager = manager(64, 0.0, 15.0);
        let events = collect(manager.open_stream(&GatewayRequest::new("alpha", "q"), backend)).await;
        let chunks = chunks(&events);
        assert_eq!(chunks.len(), 1);
        assert!(chunks[0].is_final);
        let error = chunks[0].metadata.as_ref().unwrap()["error"].as_str().unwrap();
        assert!(error.contains("500"));
    }

    struct NativeStreamBackend;

    #[async_trait]
    impl Backend for NativeStreamBackend {
        async fn execute(&self, _request: &GatewayRequest) -> BackendResult {
            BackendResult::ok("unused")
        }

        async fn execute_stream(&self, request: &GatewayRequest) -> Option<ChunkStream> {
            let id = request.id.clone();
            let mut last = StreamChunk::final_chunk(&id, 99);
            last.tokens_used = Some(7);
            let chunks = vec![
                StreamChunk::content(&id, "he", 40),
                StreamChunk::content(&id, "llo", 41),
                last,
            ];
            Some(Box::pin(futures::stream::iter(chunks)))
        }

        async fn health_check(&self) -> bool {
            true
        }

        fn name(&self) -> &str {
            "native"
        }

        fn kind(&self) -> BackendKind {
            BackendKind::HttpApi
        }
    }

    #[tokio::test]
    async fn test_native_stream_reindexed() {
        let manager = manager(64, 0.0, 15.0);
        let events = collect(
            manager.open_stream(&GatewayRequest::new("native", "q"), Arc::new(NativeStreamBackend)),
        )
        .await;
        let chunks = chunks(&events);
        assert_eq!(chunks.len(), 3);
        // Upstream indexes are replaced with a clean monotonic sequence.
        assert_eq!(chunks[0].chunk_index, 0);
        assert_eq!(chunks[1].chunk_index, 1);
        assert_eq!(chunks[2].chunk_index, 2);
        assert!(chunks[2].is_final);
        assert_eq!(chunks[2].tokens_used, Some(7));

        let rebuilt: String = chunks.iter().map(|c| c.content.as_str()).collect();
        assert_eq!(rebuilt, "hello");
    }

    #[tokio::test]
    async fn test_cancellation_closes_channel() {
        let backend = Arc::new(MockBackend::script(
            "slow",
            vec![MockBackend::success_after("late", Duration::from_secs(30))],
        ));
        let manager = manager(64, 0.0, 15.0);
        let request = GatewayRequest::new("slow", "q");
        let mut rx = manager.open_stream(&request, backend);

        assert_eq!(manager.active_count(), 1);
        assert!(manager.cancel(&request.id));
        // Channel closes without a final chunk.
        assert!(rx.recv().await.is_none());
        assert_eq!(manager.active_count(), 0);
        // Cancelling again is a no-op.
        assert!(!manager.cancel(&request.id));
    }

    #[tokio::test]
    async fn test_heartbeat_during_silence() {
        let backend = Arc::new(MockBackend::script(
            "slow",
            vec![MockBackend::success_after("eventually", Duration::from_millis(120))],
        ));
        let manager = manager(64, 0.0, 0.03);
        let events = collect(manager.open_stream(&GatewayRequest::new("slow", "q"), backend)).await;

        let heartbeats = events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Heartbeat))
            .count();
        assert!(heartbeats >= 1, "expected heartbeats, got none");
        // The real chunks still arrive after the silence.
        let chunks = chunks(&events);
        assert_eq!(chunks.last().unwrap().is_final, true);
    }

    #[test]
    fn test_heartbeat_sse_is_comment() {
        assert_eq!(StreamEvent::Heartbeat.to_sse(), ": heartbeat\n\n");
    }
}
