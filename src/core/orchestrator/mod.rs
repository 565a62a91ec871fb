//! Request orchestrator
//!
//! Glues the pipeline, router, resilience layer, and telemetry together:
//! acquires a pooled context, runs PreHooks, checks caller budgets,
//! drives the selection loop with admission control and fallback, and
//! emits one telemetry payload per request.

pub mod streaming;

use crate::config::GatewayConfig;
use crate::core::limits::{
    DistributedRateLimiter, FifoSemaphore, GradientLimiter, RetrySchedule, TokenBucket,
};
use crate::core::pipeline::cache::{CTX_CACHE_HIT, CTX_CACHE_KEY};
use crate::core::pipeline::{PluginContext, PluginPipeline, RequestOutcome};
use crate::core::providers::{ProviderResult, UnifiedRequest, UnifiedResponse};
use crate::core::router::{
    CooldownManager, Deployment, DeploymentId, DeploymentRegistry, Router, RoutingStrategy,
    StatsStore,
};
use crate::core::telemetry::{
    CallType, CallbackManager, FallbackEvent, PayloadBuilder, StandardLoggingPayload,
};
use crate::core::types::{
    ChatRequest, ChatResponse, EmbeddingRequest, EmbeddingResponse, RequestContext, Usage,
};
use crate::utils::error::{GatewayError, Result};
use chrono::Utc;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// What the orchestrator hands back to the front-end
pub enum GatewayReply {
    /// Buffered chat completion
    Completion(ChatResponse),
    /// Live chunk stream; the front-end frames it as SSE and appends the
    /// terminator
    Stream(crate::core::providers::ChunkStream),
}

impl fmt::Debug for GatewayReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayReply::Completion(resp) => f.debug_tuple("Completion").field(resp).finish(),
            GatewayReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Per-deployment admission controls, created lazily from the
/// deployment config
pub(crate) struct DeploymentAdmission {
    pub(crate) limiter: GradientLimiter,
    pub(crate) semaphore: Option<FifoSemaphore>,
    pub(crate) bucket: Option<TokenBucket>,
}

impl DeploymentAdmission {
    fn for_deployment(deployment: &Deployment) -> Self {
        let semaphore = (deployment.config.max_concurrency > 0)
            .then(|| FifoSemaphore::new(deployment.config.max_concurrency as usize));
        // Burst smoothing on top of the minute budget: a sixth of the
        // RPM budget may arrive at once, refilled at the per-second rate
        let bucket = (deployment.config.rpm_limit > 0).then(|| {
            TokenBucket::new(
                (deployment.config.rpm_limit / 6).max(1),
                deployment.config.rpm_limit as f64 / 60.0,
            )
        });
        Self {
            limiter: GradientLimiter::default(),
            semaphore,
            bucket,
        }
    }

    /// Non-blocking admission; failure skips the deployment for this
    /// attempt only
    pub(crate) fn try_admit(&self) -> bool {
        if !self.limiter.try_acquire() {
            return false;
        }
        if let Some(semaphore) = &self.semaphore {
            if !semaphore.try_acquire() {
                self.limiter.release_failed();
                return false;
            }
        }
        if let Some(bucket) = &self.bucket {
            if !bucket.allow(1) {
                if let Some(semaphore) = &self.semaphore {
                    semaphore.release();
                }
                self.limiter.release_failed();
                return false;
            }
        }
        true
    }

    /// Release after a successful call
    pub(crate) fn release_ok(&self, rtt: std::time::Duration) {
        self.limiter.release(rtt);
        if let Some(semaphore) = &self.semaphore {
            semaphore.release();
        }
    }

    /// Release after a failed call
    pub(crate) fn release_err(&self) {
        self.limiter.release_failed();
        if let Some(semaphore) = &self.semaphore {
            semaphore.release();
        }
    }
}

pub(crate) struct OrchestratorInner {
    pub(crate) config: GatewayConfig,
    pub(crate) registry: Arc<DeploymentRegistry>,
    pub(crate) stats: Arc<dyn StatsStore>,
    pub(crate) router: Router,
    pub(crate) cooldown: CooldownManager,
    pub(crate) retry: RetrySchedule,
    pub(crate) pipeline: Arc<PluginPipeline>,
    pub(crate) callbacks: Arc<CallbackManager>,
    pub(crate) rate_limiter: Option<Arc<DistributedRateLimiter>>,
    pub(crate) admissions: DashMap<DeploymentId, Arc<DeploymentAdmission>>,
}

impl OrchestratorInner {
    pub(crate) fn admission(&self, deployment: &Deployment) -> Arc<DeploymentAdmission> {
        self.admissions
            .entry(deployment.id.clone())
            .or_insert_with(|| Arc::new(DeploymentAdmission::for_deployment(deployment)))
            .clone()
    }

    /// Projected dollar cost from usage and deployment rates
    pub(crate) fn cost_of(&self, deployment: &Deployment, usage: Option<Usage>) -> f64 {
        let Some(usage) = usage else { return 0.0 };
        usage.prompt_tokens as f64 / 1000.0 * deployment.config.cost_per_1k_prompt
            + usage.completion_tokens as f64 / 1000.0 * deployment.config.cost_per_1k_completion
    }
}

/// One attempt's outcome inside the selection loop
enum AttemptOutcome {
    Done(ProviderResult, Deployment, std::time::Duration),
    Failed(GatewayError),
}

/// The request orchestrator
///
/// Cheap to clone; all state is shared behind one inner Arc so streams
/// can outlive the handle that created them.
#[derive(Clone)]
pub struct RequestOrchestrator {
    inner: Arc<OrchestratorInner>,
}

impl fmt::Debug for RequestOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RequestOrchestrator")
            .field("router", &self.inner.router)
            .finish_non_exhaustive()
    }
}

/// Builder wiring the orchestrator's collaborators
pub struct OrchestratorBuilder {
    config: GatewayConfig,
    registry: Arc<DeploymentRegistry>,
    stats: Arc<dyn StatsStore>,
    pipeline: Option<Arc<PluginPipeline>>,
    callbacks: Option<Arc<CallbackManager>>,
    rate_limiter: Option<Arc<DistributedRateLimiter>>,
}

impl OrchestratorBuilder {
    /// Start from config, a registry, and a stats store
    pub fn new(
        config: GatewayConfig,
        registry: Arc<DeploymentRegistry>,
        stats: Arc<dyn StatsStore>,
    ) -> Self {
        Self {
            config,
            registry,
            stats,
            pipeline: None,
            callbacks: None,
            rate_limiter: None,
        }
    }

    /// Use a prepared plugin pipeline
    pub fn pipeline(mut self, pipeline: Arc<PluginPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Use a prepared callback manager
    pub fn callbacks(mut self, callbacks: Arc<CallbackManager>) -> Self {
        self.callbacks = Some(callbacks);
        self
    }

    /// Enable the caller-side distributed rate limiter
    pub fn rate_limiter(mut self, limiter: Arc<DistributedRateLimiter>) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    /// Assemble the orchestrator
    pub fn build(self) -> RequestOrchestrator {
        let strategy = RoutingStrategy::from(&self.config.router.strategy);
        let router = Router::new(self.registry.clone(), self.stats.clone(), strategy)
            .with_default_provider(self.config.router.default_provider.clone());
        let cooldown = CooldownManager::new(self.config.router.cooldown_period());
        let retry = RetrySchedule::new(
            self.config.router.retry_backoff(),
            self.config.router.retry_max_backoff(),
            self.config.router.retry_jitter,
        );
        let pipeline = self.pipeline.unwrap_or_else(|| {
            Arc::new(PluginPipeline::new(self.config.plugin_pipeline.clone()))
        });
        RequestOrchestrator {
            inner: Arc::new(OrchestratorInner {
                registry: self.registry,
                stats: self.stats,
                router,
                cooldown,
                retry,
                pipeline,
                callbacks: self.callbacks.unwrap_or_default(),
                rate_limiter: self.rate_limiter,
                admissions: DashMap::new(),
                config: self.config,
            }),
        }
    }
}

impl RequestOrchestrator {
    /// Borrow the deployment registry
    pub fn registry(&self) -> &Arc<DeploymentRegistry> {
        &self.inner.registry
    }

    /// Borrow the plugin pipeline (for registration)
    pub fn pipeline(&self) -> &Arc<PluginPipeline> {
        &self.inner.pipeline
    }

    /// Borrow the callback manager (for registration)
    pub fn callbacks(&self) -> &Arc<CallbackManager> {
        &self.inner.callbacks
    }

    /// Handle one chat completion request
    pub async fn chat(&self, ctx: &RequestContext, request: ChatRequest) -> Result<GatewayReply> {
        let streaming = request.stream;
        let inner = &self.inner;

        let mut plugin_ctx = inner.pipeline.context_pool().acquire();
        plugin_ctx.request_id = ctx.request_id.clone();
        plugin_ctx.model = request.model.clone();
        plugin_ctx.principal = ctx.api_key_id.clone();
        plugin_ctx.streaming = streaming;
        plugin_ctx.started_at = Some(Instant::now());
        plugin_ctx.start_time = Some(Utc::now());
        plugin_ctx.cancellation = ctx.cancellation.clone();
        plugin_ctx.deadline = ctx.deadline;

        if streaming {
            return streaming::run_streaming(self.clone(), ctx.clone(), plugin_ctx, request).await;
        }

        let requested_model = request.model.clone();
        let unified = UnifiedRequest::Chat(request);

        // PreHooks, ascending priority
        let preflight = inner.pipeline.run_pre_hooks(&plugin_ctx, unified).await;
        let run_from = preflight.run_from;

        let mut fallback_events = Vec::new();
        let mut serving: Option<(Deployment, Option<Usage>)> = None;

        let outcome = if let Some(short_circuit) = preflight.short_circuit {
            RequestOutcome {
                response: short_circuit.response,
                error: short_circuit.error,
            }
        } else {
            // Caller budgets after PreHooks, before selection
            let admitted = match &inner.rate_limiter {
                Some(limiter) => {
                    limiter
                        .check(ctx, &requested_model, preflight.request.estimate_input_tokens())
                        .await
                }
                None => Ok(()),
            };
            match admitted {
                Err(err) => RequestOutcome::err(err),
                Ok(()) => {
                    match self
                        .selection_loop(ctx, &preflight.request, &mut fallback_events)
                        .await
                    {
                        Ok((ProviderResult::Buffered(response), deployment, _rtt)) => {
                            serving = Some((deployment, response.usage()));
                            RequestOutcome {
                                response: Some(response),
                                error: None,
                            }
                        }
                        Ok((ProviderResult::Stream(_), _, _)) => RequestOutcome::err(
                            GatewayError::Internal(
                                "provider streamed a non-streaming request".to_string(),
                            ),
                        ),
                        Err(err) => RequestOutcome::err(err),
                    }
                }
            }
        };

        // PostHooks, LIFO over the hooks that ran
        let outcome = inner
            .pipeline
            .run_post_hooks(&plugin_ctx, run_from, outcome)
            .await;

        let payload = self.build_payload(
            ctx,
            &plugin_ctx,
            CallType::Chat,
            &requested_model,
            serving.as_ref(),
            &outcome,
            fallback_events,
            None,
        );
        inner.callbacks.fire(Arc::new(payload)).await;
        inner.pipeline.context_pool().release(plugin_ctx);

        match (outcome.response, outcome.error) {
            (_, Some(error)) => Err(error),
            (Some(UnifiedResponse::Chat(response)), None) => {
                Ok(GatewayReply::Completion(response))
            }
            (Some(UnifiedResponse::Embedding(_)), None) => Err(GatewayError::Internal(
                "embedding response on the chat path".to_string(),
            )),
            (None, None) => Err(GatewayError::Internal(
                "pipeline produced neither response nor error".to_string(),
            )),
        }
    }

    /// Handle one embedding request
    pub async fn embed(
        &self,
        ctx: &RequestContext,
        request: EmbeddingRequest,
    ) -> Result<EmbeddingResponse> {
        let inner = &self.inner;
        let requested_model = request.model.clone();

        let mut plugin_ctx = inner.pipeline.context_pool().acquire();
        plugin_ctx.request_id = ctx.request_id.clone();
        plugin_ctx.model = requested_model.clone();
        plugin_ctx.principal = ctx.api_key_id.clone();
        plugin_ctx.started_at = Some(Instant::now());
        plugin_ctx.start_time = Some(Utc::now());
        plugin_ctx.cancellation = ctx.cancellation.clone();
        plugin_ctx.deadline = ctx.deadline;

        let unified = UnifiedRequest::Embedding(request);
        let preflight = inner.pipeline.run_pre_hooks(&plugin_ctx, unified).await;
        let run_from = preflight.run_from;

        let mut fallback_events = Vec::new();
        let mut serving: Option<(Deployment, Option<Usage>)> = None;

        let outcome = if let Some(short_circuit) = preflight.short_circuit {
            RequestOutcome {
                response: short_circuit.response,
                error: short_circuit.error,
            }
        } else {
            let admitted = match &inner.rate_limiter {
                Some(limiter) => {
                    limiter
                        .check(ctx, &requested_model, preflight.request.estimate_input_tokens())
                        .await
                }
                None => Ok(()),
            };
            match admitted {
                Err(err) => RequestOutcome::err(err),
                Ok(()) => match self
                    .selection_loop(ctx, &preflight.request, &mut fallback_events)
                    .await
                {
                    Ok((ProviderResult::Buffered(response), deployment, _rtt)) => {
                        serving = Some((deployment, response.usage()));
                        RequestOutcome {
                            response: Some(response),
                            error: None,
                        }
                    }
                    Ok((ProviderResult::Stream(_), _, _)) => RequestOutcome::err(
                        GatewayError::Internal("provider streamed an embedding".to_string()),
                    ),
                    Err(err) => RequestOutcome::err(err),
                },
            }
        };

        let outcome = inner
            .pipeline
            .run_post_hooks(&plugin_ctx, run_from, outcome)
            .await;

        let payload = self.build_payload(
            ctx,
            &plugin_ctx,
            CallType::Embedding,
            &requested_model,
            serving.as_ref(),
            &outcome,
            fallback_events,
            None,
        );
        inner.callbacks.fire(Arc::new(payload)).await;
        inner.pipeline.context_pool().release(plugin_ctx);

        match (outcome.response, outcome.error) {
            (_, Some(error)) => Err(error),
            (Some(UnifiedResponse::Embedding(response)), None) => Ok(response),
            _ => Err(GatewayError::Internal(
                "embedding pipeline produced no usable outcome".to_string(),
            )),
        }
    }

    /// The selection loop: pick, admit, invoke, retry with backoff
    ///
    /// Attempts = 1 + `retry_count`. A deployment that fails admission is
    /// skipped for the current attempt only; a deployment that fails the
    /// call is excluded for the rest of the request and cooled per
    /// policy. Every transition to another deployment is recorded as a
    /// fallback event.
    async fn selection_loop(
        &self,
        ctx: &RequestContext,
        request: &UnifiedRequest,
        fallback_events: &mut Vec<FallbackEvent>,
    ) -> Result<(ProviderResult, Deployment, std::time::Duration)> {
        let inner = &self.inner;
        let model = request.model().to_string();
        let input_tokens = request.estimate_input_tokens();
        let attempts = 1 + inner.config.router.retry_count;

        let mut failed: Vec<DeploymentId> = Vec::new();
        let mut pending_transition: Option<(DeploymentId, GatewayError)> = None;
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..attempts {
            if ctx.is_cancelled() {
                let err = GatewayError::Cancelled("client gave up".to_string());
                if let Some((from, cause)) = pending_transition.take() {
                    fallback_events.push(FallbackEvent {
                        from_deployment: from,
                        to_deployment: None,
                        error: cause.to_string(),
                        success: false,
                    });
                }
                return Err(err);
            }

            let attempt_result = self
                .attempt_once(ctx, request, &model, input_tokens, &mut failed)
                .await;

            match attempt_result {
                Ok(AttemptOutcome::Done(result, deployment, rtt)) => {
                    if let Some((from, cause)) = pending_transition.take() {
                        fallback_events.push(FallbackEvent {
                            from_deployment: from,
                            to_deployment: Some(deployment.id.clone()),
                            error: cause.to_string(),
                            success: true,
                        });
                    }
                    return Ok((result, deployment, rtt));
                }
                Ok(AttemptOutcome::Failed(err)) => {
                    // Provider failure on a concrete deployment
                    let failed_id = failed.last().cloned().unwrap_or_default();
                    if let Some((from, cause)) = pending_transition.take() {
                        fallback_events.push(FallbackEvent {
                            from_deployment: from,
                            to_deployment: Some(failed_id.clone()),
                            error: cause.to_string(),
                            success: false,
                        });
                    }

                    let fatal = err.is_request_fatal();
                    let out_of_attempts = attempt + 1 >= attempts;
                    if fatal || !inner.config.router.fallback_enabled || out_of_attempts {
                        if !fatal {
                            fallback_events.push(FallbackEvent {
                                from_deployment: failed_id,
                                to_deployment: None,
                                error: err.to_string(),
                                success: false,
                            });
                        }
                        return Err(err);
                    }

                    pending_transition = Some((failed_id, err.clone()));
                    last_error = Some(err);

                    // Backoff before the next attempt, cancellable
                    let backoff = inner.retry.backoff(attempt);
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = ctx.cancellation.cancelled() => {}
                    }
                }
                Err(routing_err) => {
                    // No candidate left; surface the more informative of
                    // (last provider error, routing error)
                    if let Some((from, cause)) = pending_transition.take() {
                        fallback_events.push(FallbackEvent {
                            from_deployment: from,
                            to_deployment: None,
                            error: cause.to_string(),
                            success: false,
                        });
                    }
                    return Err(last_error.unwrap_or(routing_err));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| GatewayError::NoAvailableDeployment(model)))
    }

    /// One attempt: pick an admitted deployment and invoke it
    async fn attempt_once(
        &self,
        ctx: &RequestContext,
        request: &UnifiedRequest,
        model: &str,
        input_tokens: u64,
        failed: &mut Vec<DeploymentId>,
    ) -> Result<AttemptOutcome> {
        let inner = &self.inner;

        // Admission-failed deployments are skipped for this attempt only
        let mut skipped: Vec<DeploymentId> = Vec::new();
        let (deployment, admission) = loop {
            let mut exclude = failed.clone();
            exclude.extend(skipped.iter().cloned());
            let deployment = inner
                .router
                .pick_excluding(model, &ctx.tags, input_tokens, &exclude)
                .await?;

            inner.stats.start_request(&deployment.id).await;
            let admission = inner.admission(&deployment);
            if admission.try_admit() {
                break (deployment, admission);
            }
            inner.stats.end_request(&deployment.id).await;
            debug!(deployment_id = %deployment.id, "admission failed, skipping for this attempt");
            skipped.push(deployment.id.clone());
        };

        let started = Instant::now();
        let invoke = async {
            match request {
                UnifiedRequest::Chat(chat) => {
                    deployment.provider.service.chat(ctx, chat).await
                }
                UnifiedRequest::Embedding(embedding) => deployment
                    .provider
                    .service
                    .embed(ctx, embedding)
                    .await
                    .map(|response| {
                        ProviderResult::Buffered(UnifiedResponse::Embedding(response))
                    }),
            }
        };

        // Attempt-level deadline: the tighter of the per-attempt limit
        // and the request deadline, plus client cancellation
        let attempt_limit = match (ctx.remaining(), inner.config.router.attempt_timeout()) {
            (Some(remaining), Some(per_attempt)) => Some(remaining.min(per_attempt)),
            (Some(remaining), None) => Some(remaining),
            (None, per_attempt) => per_attempt,
        };
        let result = if let Some(remaining) = attempt_limit {
            tokio::select! {
                outcome = tokio::time::timeout(remaining, invoke) => match outcome {
                    Ok(inner_result) => inner_result,
                    Err(_) => Err(GatewayError::Timeout(format!(
                        "deadline exceeded calling {}",
                        deployment.id
                    ))),
                },
                _ = ctx.cancellation.cancelled() => {
                    Err(GatewayError::Cancelled("client disconnected".to_string()))
                }
            }
        } else {
            tokio::select! {
                outcome = invoke => outcome,
                _ = ctx.cancellation.cancelled() => {
                    Err(GatewayError::Cancelled("client disconnected".to_string()))
                }
            }
        };
        let rtt = started.elapsed();

        match result {
            Ok(ProviderResult::Buffered(response)) => {
                admission.release_ok(rtt);
                inner.stats.end_request(&deployment.id).await;
                let tokens = response
                    .usage()
                    .map(|usage| usage.total_tokens as u64)
                    .unwrap_or(input_tokens);
                inner
                    .stats
                    .report_success(&deployment.id, rtt.as_secs_f64() * 1000.0, None, tokens)
                    .await;
                Ok(AttemptOutcome::Done(
                    ProviderResult::Buffered(response),
                    deployment,
                    rtt,
                ))
            }
            Ok(ProviderResult::Stream(stream)) => {
                // The streaming session owns the remaining bookkeeping
                Ok(AttemptOutcome::Done(
                    ProviderResult::Stream(stream),
                    deployment,
                    rtt,
                ))
            }
            Err(err) => {
                admission.release_err();
                inner.stats.end_request(&deployment.id).await;
                if matches!(err, GatewayError::Cancelled(_)) {
                    // User cancellation is not a deployment fault
                    return Err(err);
                }
                inner.cooldown.on_failure(&*inner.stats, &deployment.id, &err).await;
                warn!(deployment_id = %deployment.id, %err, "provider call failed");
                failed.push(deployment.id.clone());
                Ok(AttemptOutcome::Failed(err))
            }
        }
    }

    /// Assemble the telemetry payload for a finished request
    #[allow(clippy::too_many_arguments)]
    fn build_payload(
        &self,
        ctx: &RequestContext,
        plugin_ctx: &PluginContext,
        call_type: CallType,
        requested_model: &str,
        serving: Option<&(Deployment, Option<Usage>)>,
        outcome: &RequestOutcome,
        fallback_events: Vec<FallbackEvent>,
        completion_start: Option<chrono::DateTime<Utc>>,
    ) -> StandardLoggingPayload {
        let mut builder = PayloadBuilder::new(&ctx.request_id, call_type, requested_model)
            .timing(
                plugin_ctx.start_time.unwrap_or_else(Utc::now),
                Utc::now(),
            )
            .completion_start(completion_start)
            .principals(ctx.api_key_id.clone(), ctx.user_id.clone())
            .tags(ctx.tags.clone())
            .cache(
                plugin_ctx.get(CTX_CACHE_HIT).and_then(|v| v.as_bool()) == Some(true),
                plugin_ctx
                    .get(CTX_CACHE_KEY)
                    .and_then(|v| v.as_str().map(String::from)),
            );

        if let Some((deployment, usage)) = serving {
            builder = builder
                .deployment(
                    &deployment.id,
                    deployment.provider_type(),
                    &deployment.model_name,
                    deployment.api_base.clone(),
                )
                .usage(*usage)
                .cost(self.inner.cost_of(deployment, *usage));
        }
        if let Some(error) = &outcome.error {
            builder = builder.failure(error);
        }
        for event in fallback_events {
            builder = builder.fallback_event(event);
        }
        builder.build()
    }
}
