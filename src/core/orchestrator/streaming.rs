//! Streaming execution with mid-stream recovery
//!
//! Tees provider chunks through the plugin filters, records
//! time-to-first-token exactly once, accumulates content up to a byte
//! cap, and on mid-stream failure either surfaces the error, reissues
//! the original request on another deployment, or continues from the
//! accumulated partial assistant message. The client always sees a
//! well-formed delta sequence: one role header, one finish reason, one
//! terminator.

use super::{AttemptOutcome, DeploymentAdmission, OrchestratorInner, RequestOrchestrator};
use crate::config::streaming::StreamRecoveryMode;
use crate::core::pipeline::{PluginContext, RequestOutcome};
use crate::core::providers::{ChunkStream, ProviderResult, UnifiedRequest};
use crate::core::router::Deployment;
use crate::core::telemetry::{CallType, FallbackEvent};
use crate::core::types::{ChatChunk, ChatRequest, ChatResponse, RequestContext, Usage};
use crate::utils::error::{GatewayError, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use super::GatewayReply;

/// Estimate completion tokens from accumulated text
fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f64 / 4.0).ceil() as u32
}

/// Convert a buffered response into an equivalent chunk sequence
fn response_to_chunks(request_id: &str, response: ChatResponse) -> Vec<ChatChunk> {
    let id = format!("chatcmpl-{request_id}");
    let content = response.first_content().unwrap_or_default().to_string();
    let model = response.model.clone();
    vec![
        ChatChunk::content(&id, &model, content, true),
        ChatChunk::finish(&id, &model, "stop", response.usage),
    ]
}

/// Bookkeeping for the deployment currently feeding the stream
///
/// If the client drops the stream mid-flight, the `Drop` impl settles
/// the in-flight counter and admission slot from a spawned task, so
/// `active_requests` stays balanced on every control path.
struct CurrentAttempt {
    inner: Arc<OrchestratorInner>,
    deployment: Deployment,
    admission: Arc<DeploymentAdmission>,
    started: Instant,
    settled: bool,
}

impl CurrentAttempt {
    fn new(inner: Arc<OrchestratorInner>, deployment: Deployment) -> Self {
        let admission = inner.admission(&deployment);
        Self {
            inner,
            deployment,
            admission,
            started: Instant::now(),
            settled: false,
        }
    }

    async fn settle_ok(mut self, ttft_ms: Option<f64>, total_tokens: u64) {
        self.settled = true;
        let rtt = self.started.elapsed();
        self.admission.release_ok(rtt);
        self.inner.stats.end_request(&self.deployment.id).await;
        self.inner
            .stats
            .report_success(
                &self.deployment.id,
                rtt.as_secs_f64() * 1000.0,
                ttft_ms,
                total_tokens,
            )
            .await;
    }

    async fn settle_err(mut self, error: &GatewayError) -> String {
        self.settled = true;
        self.admission.release_err();
        self.inner.stats.end_request(&self.deployment.id).await;
        if !matches!(error, GatewayError::Cancelled(_)) {
            self.inner
                .cooldown
                .on_failure(&*self.inner.stats, &self.deployment.id, error)
                .await;
        }
        self.deployment.id.clone()
    }

    async fn settle_cancelled(mut self) {
        self.settled = true;
        self.admission.release_err();
        self.inner.stats.end_request(&self.deployment.id).await;
    }
}

impl Drop for CurrentAttempt {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let inner = Arc::clone(&self.inner);
        let admission = Arc::clone(&self.admission);
        let deployment_id = self.deployment.id.clone();
        debug!(deployment_id = %deployment_id, "stream dropped mid-flight, settling");
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                admission.release_err();
                inner.stats.end_request(&deployment_id).await;
            });
        }
    }
}

/// Run the streaming path for one chat request
pub(crate) async fn run_streaming(
    orchestrator: RequestOrchestrator,
    ctx: RequestContext,
    plugin_ctx: Box<PluginContext>,
    request: ChatRequest,
) -> Result<GatewayReply> {
    let inner = Arc::clone(&orchestrator.inner);
    let requested_model = request.model.clone();

    let preflight = inner
        .pipeline
        .run_pre_stream_hooks(&plugin_ctx, UnifiedRequest::Chat(request))
        .await;
    let run_from = preflight.run_from;
    let UnifiedRequest::Chat(request) = preflight.request else {
        return Err(GatewayError::Internal(
            "stream pre-hooks changed the request kind".to_string(),
        ));
    };

    let mut fallback_events: Vec<FallbackEvent> = Vec::new();

    // Short-circuits: a chunk source streams as-is, a buffered response
    // is reframed as chunks, an error ends the request here.
    let initial: Option<(ChunkStream, Option<CurrentAttempt>)> =
        if let Some(short_circuit) = preflight.short_circuit {
            if let Some(error) = short_circuit.error {
                finish_failed(
                    &orchestrator,
                    &ctx,
                    plugin_ctx,
                    run_from,
                    &requested_model,
                    &error,
                    fallback_events,
                )
                .await;
                return Err(error);
            }
            if let Some(stream) = short_circuit.stream {
                Some((stream, None))
            } else if let Some(response) = short_circuit.response {
                let chunks = match response {
                    crate::core::providers::UnifiedResponse::Chat(resp) => {
                        response_to_chunks(&ctx.request_id, resp)
                    }
                    other => {
                        warn!(?other, "non-chat short-circuit on a streaming request");
                        Vec::new()
                    }
                };
                let stream: ChunkStream =
                    Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
                Some((stream, None))
            } else {
                None
            }
        } else {
            None
        };

    let initial = match initial {
        Some(initial) => initial,
        None => {
            // Caller budgets after PreHooks, before selection
            if let Some(limiter) = &inner.rate_limiter {
                if let Err(error) = limiter
                    .check(&ctx, &requested_model, request.estimate_input_tokens())
                    .await
                {
                    finish_failed(
                        &orchestrator,
                        &ctx,
                        plugin_ctx,
                        run_from,
                        &requested_model,
                        &error,
                        fallback_events,
                    )
                    .await;
                    return Err(error);
                }
            }

            match orchestrator
                .selection_loop(&ctx, &UnifiedRequest::Chat(request.clone()), &mut fallback_events)
                .await
            {
                Ok((ProviderResult::Stream(stream), deployment, _)) => {
                    let attempt = CurrentAttempt::new(Arc::clone(&inner), deployment);
                    (stream, Some(attempt))
                }
                Ok((ProviderResult::Buffered(response), _deployment, _)) => {
                    // Provider ignored the stream flag; reframe. Success
                    // bookkeeping already ran in the selection loop.
                    let chunks = match response {
                        crate::core::providers::UnifiedResponse::Chat(resp) => {
                            response_to_chunks(&ctx.request_id, resp)
                        }
                        _ => Vec::new(),
                    };
                    let stream: ChunkStream =
                        Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
                    (stream, None)
                }
                Err(error) => {
                    finish_failed(
                        &orchestrator,
                        &ctx,
                        plugin_ctx,
                        run_from,
                        &requested_model,
                        &error,
                        fallback_events,
                    )
                    .await;
                    return Err(error);
                }
            }
        }
    };

    Ok(GatewayReply::Stream(session_stream(
        orchestrator,
        ctx,
        plugin_ctx,
        run_from,
        request,
        requested_model,
        initial,
        fallback_events,
    )))
}

/// Failure before any stream was opened: mirror the stream hooks, emit
/// telemetry, release the context
async fn finish_failed(
    orchestrator: &RequestOrchestrator,
    ctx: &RequestContext,
    plugin_ctx: Box<PluginContext>,
    run_from: usize,
    requested_model: &str,
    error: &GatewayError,
    fallback_events: Vec<FallbackEvent>,
) {
    let inner = &orchestrator.inner;
    inner
        .pipeline
        .run_post_stream_hooks(&plugin_ctx, run_from)
        .await;
    let outcome = RequestOutcome::err(error.clone());
    let payload = orchestrator.build_payload(
        ctx,
        &plugin_ctx,
        CallType::Chat,
        requested_model,
        None,
        &outcome,
        fallback_events,
        None,
    );
    inner.callbacks.fire(Arc::new(payload)).await;
    inner.pipeline.context_pool().release(plugin_ctx);
}

/// The live session: tee, filter, recover, settle
#[allow(clippy::too_many_arguments)]
fn session_stream(
    orchestrator: RequestOrchestrator,
    ctx: RequestContext,
    plugin_ctx: Box<PluginContext>,
    run_from: usize,
    original_request: ChatRequest,
    requested_model: String,
    initial: (ChunkStream, Option<CurrentAttempt>),
    initial_events: Vec<FallbackEvent>,
) -> ChunkStream {
    let inner = Arc::clone(&orchestrator.inner);
    let recovery = inner.config.stream_recovery.clone();
    let prompt_tokens = original_request.estimate_input_tokens();

    let stream = async_stream::stream! {
        let (mut current_stream, mut attempt) = initial;
        let mut fallback_events = initial_events;
        let mut accumulated = String::new();
        let mut over_cap = false;
        let mut first_delta_at: Option<DateTime<Utc>> = None;
        let mut ttft_ms: Option<f64> = None;
        let session_started = Instant::now();
        let mut role_sent = false;
        let mut finish_sent = false;
        let mut recovery_attempts_left = inner.config.router.retry_count.max(1);
        let mut final_error: Option<GatewayError> = None;
        let mut served_by: Option<Deployment> = attempt.as_ref().map(|a| a.deployment.clone());
        let mut cancelled = false;

        'session: loop {
            let next = tokio::select! {
                item = current_stream.next() => item,
                _ = ctx.cancellation.cancelled() => {
                    cancelled = true;
                    None
                }
            };

            match next {
                _ if cancelled => {
                    if let Some(attempt) = attempt.take() {
                        attempt.settle_cancelled().await;
                    }
                    final_error = Some(GatewayError::Cancelled(
                        "client disconnected mid-stream".to_string(),
                    ));
                    break 'session;
                }
                Some(Ok(chunk)) => {
                    // TTFT is recorded once; recovered chunks never reset it
                    if first_delta_at.is_none()
                        && chunk.delta_content().is_some_and(|c| !c.is_empty())
                    {
                        first_delta_at = Some(Utc::now());
                        ttft_ms = Some(session_started.elapsed().as_secs_f64() * 1000.0);
                    }

                    // Bounded accumulation for append-mode recovery
                    if recovery.max_accumulated_bytes > 0 && !over_cap {
                        if let Some(content) = chunk.delta_content() {
                            if accumulated.len() + content.len() > recovery.max_accumulated_bytes {
                                over_cap = true;
                                debug!("stream accumulator over cap, recovery disabled");
                            } else {
                                accumulated.push_str(content);
                            }
                        }
                    }

                    let Some(mut chunk) = inner
                        .pipeline
                        .apply_stream_chunk(&plugin_ctx, run_from, chunk)
                        .await
                    else {
                        continue;
                    };

                    // One role header, one finish reason, stream-wide
                    for choice in &mut chunk.choices {
                        if choice.delta.role.is_some() {
                            if role_sent {
                                choice.delta.role = None;
                            } else {
                                role_sent = true;
                            }
                        }
                    }
                    if chunk.is_final() {
                        if finish_sent {
                            continue;
                        }
                        finish_sent = true;
                    }
                    yield Ok(chunk);
                }
                Some(Err(error)) => {
                    let failed_from = match attempt.take() {
                        Some(attempt) => Some(attempt.settle_err(&error).await),
                        None => None,
                    };

                    let mode = if over_cap || matches!(error, GatewayError::Cancelled(_)) {
                        StreamRecoveryMode::Off
                    } else {
                        recovery.mode
                    };
                    if mode == StreamRecoveryMode::Off || recovery_attempts_left == 0 {
                        if let Some(from) = failed_from {
                            fallback_events.push(FallbackEvent {
                                from_deployment: from,
                                to_deployment: None,
                                error: error.to_string(),
                                success: false,
                            });
                        }
                        final_error = Some(GatewayError::StreamInterrupted(error.to_string()));
                        break 'session;
                    }
                    recovery_attempts_left -= 1;

                    // Continuation request per recovery mode
                    let recovery_request = match mode {
                        StreamRecoveryMode::Retry => original_request.clone(),
                        StreamRecoveryMode::Append => {
                            let mut continuation = original_request.clone();
                            continuation.messages.push(
                                crate::core::types::ChatMessage::text(
                                    crate::core::types::MessageRole::Assistant,
                                    accumulated.clone(),
                                ),
                            );
                            continuation
                        }
                        StreamRecoveryMode::Off => unreachable!("off handled above"),
                    };

                    let mut failed: Vec<String> = fallback_events
                        .iter()
                        .map(|event| event.from_deployment.clone())
                        .collect();
                    if let Some(from) = &failed_from {
                        failed.push(from.clone());
                    }
                    let spliced = orchestrator
                        .attempt_once(
                            &ctx,
                            &UnifiedRequest::Chat(recovery_request.clone()),
                            &requested_model,
                            recovery_request.estimate_input_tokens(),
                            &mut failed,
                        )
                        .await;

                    match spliced {
                        Ok(AttemptOutcome::Done(ProviderResult::Stream(stream), deployment, _)) => {
                            debug!(
                                from = failed_from.as_deref().unwrap_or(""),
                                to = %deployment.id,
                                mode = ?mode,
                                "stream recovered on another deployment"
                            );
                            if let Some(from) = failed_from {
                                fallback_events.push(FallbackEvent {
                                    from_deployment: from,
                                    to_deployment: Some(deployment.id.clone()),
                                    error: error.to_string(),
                                    success: true,
                                });
                            }
                            served_by = Some(deployment.clone());
                            attempt = Some(CurrentAttempt::new(Arc::clone(&inner), deployment));
                            current_stream = stream;
                        }
                        Ok(AttemptOutcome::Done(
                            ProviderResult::Buffered(response),
                            deployment,
                            _,
                        )) => {
                            if let Some(from) = failed_from {
                                fallback_events.push(FallbackEvent {
                                    from_deployment: from,
                                    to_deployment: Some(deployment.id.clone()),
                                    error: error.to_string(),
                                    success: true,
                                });
                            }
                            served_by = Some(deployment);
                            let chunks = match response {
                                crate::core::providers::UnifiedResponse::Chat(resp) => {
                                    response_to_chunks(&ctx.request_id, resp)
                                }
                                _ => Vec::new(),
                            };
                            current_stream =
                                Box::pin(futures::stream::iter(chunks.into_iter().map(Ok)));
                        }
                        Ok(AttemptOutcome::Failed(recovery_error)) | Err(recovery_error) => {
                            if let Some(from) = failed_from {
                                fallback_events.push(FallbackEvent {
                                    from_deployment: from,
                                    to_deployment: None,
                                    error: error.to_string(),
                                    success: false,
                                });
                            }
                            warn!(%recovery_error, "stream recovery failed");
                            final_error =
                                Some(GatewayError::StreamInterrupted(error.to_string()));
                            break 'session;
                        }
                    }
                }
                None => {
                    // Clean end of the provider stream
                    let completion_tokens = estimate_tokens(&accumulated);
                    if !finish_sent {
                        let id = format!("chatcmpl-{}", ctx.request_id);
                        yield Ok(ChatChunk::finish(
                            id,
                            &requested_model,
                            "stop",
                            Some(Usage::new(prompt_tokens as u32, completion_tokens)),
                        ));
                    }
                    if let Some(attempt) = attempt.take() {
                        attempt
                            .settle_ok(
                                ttft_ms,
                                prompt_tokens + completion_tokens as u64,
                            )
                            .await;
                    }
                    break 'session;
                }
            }
        }

        // Wrap-up: LIFO stream post hooks, telemetry, context release
        inner
            .pipeline
            .run_post_stream_hooks(&plugin_ctx, run_from)
            .await;

        let completion_tokens = estimate_tokens(&accumulated);
        let usage = first_delta_at
            .is_some()
            .then(|| Usage::new(prompt_tokens as u32, completion_tokens));
        let outcome = match &final_error {
            Some(error) => RequestOutcome::err(error.clone()),
            None => RequestOutcome {
                response: None,
                error: None,
            },
        };
        let serving = served_by.map(|deployment| (deployment, usage));
        let payload = orchestrator.build_payload(
            &ctx,
            &plugin_ctx,
            CallType::Chat,
            &requested_model,
            serving.as_ref(),
            &outcome,
            fallback_events,
            first_delta_at,
        );
        inner.callbacks.fire(Arc::new(payload)).await;
        inner.pipeline.context_pool().release(plugin_ctx);

        if let Some(error) = final_error {
            yield Err(error);
        }
    };

    Box::pin(stream)
}
