use std::time::Instant;

use futures_util::StreamExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::context::ConversationContext;
use crate::error::LLMError;
use crate::provider::ChatStream;
use crate::types::ChatChunk;

use super::chain::AttemptPlan;
use super::{Orchestrator, ProcessOptions, StreamFallbackMode, UNROUTED_BACKEND};

impl Orchestrator {
    /// Streams the reply from the best available backend.
    ///
    /// Failures never surface as `Err`: a stream that cannot be served ends with a single
    /// terminal error chunk. When a backend fails before its terminal chunk, generation
    /// restarts on the next candidate and forwarding continues on the same stream. Chunks
    /// carry one stream id throughout.
    ///
    /// Dropping the returned stream drops the upstream stream and its connection.
    pub fn stream_process(
        &self,
        content: impl Into<String>,
        branch_id: impl Into<String>,
        preferred: Option<&str>,
        context: Option<ConversationContext>,
        options: ProcessOptions,
    ) -> ChatStream {
        let this = self.clone();
        let content = content.into();
        let branch_id = branch_id.into();
        let preferred = preferred.map(str::to_string);
        let stream_id = Uuid::new_v4().to_string();
        let mode = self.stream_fallback_mode();

        let stream = async_stream::stream! {
            let prepared = match this
                .prepare(&content, &branch_id, preferred.as_deref(), context, &options)
                .await
            {
                Ok(prepared) => prepared,
                Err(err) => {
                    warn!(error = %err, "stream could not be prepared");
                    let backend = preferred
                        .as_deref()
                        .or(options.preferred_backend.as_deref())
                        .or(this.inner.default_backend.as_deref())
                        .unwrap_or(UNROUTED_BACKEND);
                    yield ChatChunk::failed(&stream_id, backend, &err);
                    return;
                }
            };
            let inner = &this.inner;
            let mut plan = AttemptPlan::new(prepared.chain.clone(), prepared.max_attempts);
            let mut last_backend = prepared.selected.clone();
            let mut delivered = false;

            loop {
                let dispatch = match plan.next(&inner.pool) {
                    Ok(dispatch) => dispatch,
                    Err(err) => {
                        warn!(attempts = plan.attempts(), error = %err, "stream fallback exhausted");
                        yield ChatChunk::failed(&stream_id, &last_backend, &err);
                        return;
                    }
                };
                let backend = dispatch.backend;
                let id = backend.id().to_string();
                last_backend = id.clone();
                if let Some(wait) = dispatch.backoff {
                    debug!(backend = %id, wait_ms = wait.as_millis() as u64, "backing off before retry");
                    tokio::time::sleep(wait).await;
                }

                let attempt_started = Instant::now();
                let mut restart = delivered && mode == StreamFallbackMode::Replace;
                let failure = match backend.stream_chat(prepared.request.retarget(&id)).await {
                    Err(err) => err,
                    Ok(mut upstream) => {
                        let mut failure = None;
                        while let Some(mut chunk) = upstream.next().await {
                            if chunk.is_error() {
                                failure = Some(match &chunk.error {
                                    Some(error) => error.to_error(&id),
                                    None => LLMError::provider(&id, "stream ended with an error"),
                                });
                                break;
                            }

                            chunk.id = stream_id.clone();
                            chunk.backend = id.clone();
                            if restart {
                                chunk.restart = true;
                                restart = false;
                            }

                            if chunk.finished {
                                let latency = attempt_started.elapsed();
                                let tokens = chunk.usage.map(|usage| usage.total_tokens).unwrap_or(0);
                                backend.record_usage(tokens);
                                inner.metrics.record_success(&id, latency, tokens);
                                this.finish_turn(&prepared, &id);
                                info!(
                                    backend = %id,
                                    attempt = dispatch.attempt,
                                    latency_ms = latency.as_millis() as u64,
                                    tokens,
                                    "stream served"
                                );
                                yield chunk;
                                return;
                            }

                            if !chunk.delta.is_empty() {
                                delivered = true;
                            }
                            yield chunk;
                        }
                        failure.unwrap_or_else(|| LLMError::StreamClosed {
                            message: format!("{id} ended the stream without a terminal chunk"),
                        })
                    }
                };

                backend.record_usage(0);
                inner.metrics.record_failure(&id, attempt_started.elapsed());
                warn!(
                    backend = %id,
                    attempt = dispatch.attempt,
                    kind = %failure.kind(),
                    error = %failure,
                    partial = delivered,
                    "stream attempt failed"
                );
                if let Err(err) = plan.failed(&id, failure) {
                    yield ChatChunk::failed(&stream_id, &id, &err);
                    return;
                }
            }
        };

        Box::pin(stream)
    }
}
