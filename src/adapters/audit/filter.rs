use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use async_trait::async_trait;
use axum::{body::Body, response::IntoResponse};
use bytes::{Bytes, BytesMut};
use http_body::{Body as HttpBody, Frame, SizeHint};
use http_body_util::{BodyExt, Limited};
use hyper::{Request, Response, StatusCode, header};

use super::pipeline::AuditPipeline;
use crate::{
    adapters::filter_chain::{Filter, Next},
    config::models::AuditingOptions,
    core::{
        audit::{AuditEvent, AuditLevel, HostIdentity, RequestMeta, Stage, needs_request_body},
        context::RequestContext,
        error::GatewayError,
    },
};

struct AuditSettings {
    level: AuditLevel,
    audit_kubernetes_requests: bool,
    max_body_bytes: usize,
    host: HostIdentity,
    pipeline: Arc<AuditPipeline>,
}

/// Records one event per audited request and hands it to the pipeline once the
/// response body has been sent.
pub struct AuditFilter {
    settings: Option<Arc<AuditSettings>>,
}

impl AuditFilter {
    /// A stage that passes every request through untouched.
    pub fn disabled() -> Self {
        Self { settings: None }
    }

    pub fn new(options: &AuditingOptions, host: HostIdentity, pipeline: Arc<AuditPipeline>) -> Self {
        if options.level == AuditLevel::None {
            return Self::disabled();
        }
        Self {
            settings: Some(Arc::new(AuditSettings {
                level: options.level,
                audit_kubernetes_requests: options.audit_kubernetes_requests,
                max_body_bytes: options.max_body_bytes,
                host,
                pipeline,
            })),
        }
    }
}

/// `dryRun` with any non-empty value never persists, so it is not worth recording.
fn is_dry_run(query: Option<&str>) -> bool {
    query.is_some_and(|query| {
        url::form_urlencoded::parse(query.as_bytes())
            .any(|(key, value)| key == "dryRun" && !value.is_empty())
    })
}

fn declared_length(req: &Request<Body>) -> usize {
    req.headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

#[async_trait]
impl Filter for AuditFilter {
    fn name(&self) -> &'static str {
        "audit"
    }

    async fn filter(&self, req: Request<Body>, ctx: RequestContext, next: Next<'_>) -> Response<Body> {
        let Some(settings) = &self.settings else {
            return next.run(req, ctx).await;
        };
        if ctx.info.is_kubernetes_request
            && (!settings.audit_kubernetes_requests || is_dry_run(req.uri().query()))
        {
            return next.run(req, ctx).await;
        }

        let request_uri = req.uri().to_string();
        let (user_agent, forwarded_for) = {
            let header_str = |name: header::HeaderName| {
                req.headers()
                    .get(name)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
            };
            (
                header_str(header::USER_AGENT).unwrap_or_default(),
                header_str(header::HeaderName::from_static("x-forwarded-for")),
            )
        };
        let mut event = AuditEvent::begin(
            settings.level,
            &ctx.info,
            ctx.user.as_deref(),
            RequestMeta {
                request_uri: &request_uri,
                user_agent: &user_agent,
                forwarded_for: forwarded_for.as_deref(),
                client_ip: ctx.client_addr.map(|addr| addr.ip()),
                received_at: Some(ctx.received_at),
            },
            &settings.host,
        );

        let mut req = req;
        let length = declared_length(&req);
        if length > 0
            && length <= settings.max_body_bytes
            && needs_request_body(settings.level, &ctx.info)
        {
            let (parts, body) = req.into_parts();
            let bytes = match Limited::new(body, settings.max_body_bytes).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read request body for audit");
                    return GatewayError::Internal(format!("failed to read request body: {e}"))
                        .into_response();
                }
            };
            event.enrich_from_request_body(&bytes);
            if settings.level.records_request_body() {
                event.request_object = Some(bytes.clone());
            }
            req = Request::from_parts(parts, Body::from(bytes));
        }

        let response = next.run(req, ctx).await;
        let status = response.status();
        if status == StatusCode::SWITCHING_PROTOCOLS {
            // The tunnel outlives any reasonable event lifetime.
            event.complete(status.as_u16(), Stage::ResponseStarted);
            settings.pipeline.enqueue(event);
            return response;
        }

        let capture = settings.level.records_response_body().then(BytesMut::new);
        let settings = settings.clone();
        response.map(move |inner| {
            Body::new(CaptureBody {
                inner,
                state: Some(CaptureState {
                    event,
                    status: status.as_u16(),
                    buffer: capture,
                    limit: settings.max_body_bytes,
                    pipeline: settings.pipeline.clone(),
                }),
            })
        })
    }
}

struct CaptureState {
    event: AuditEvent,
    status: u16,
    /// `None` when response bodies are not recorded or the body outgrew the limit.
    buffer: Option<BytesMut>,
    limit: usize,
    pipeline: Arc<AuditPipeline>,
}

/// Passes the response body through, teeing it when required, and emits the event
/// when the stream ends or the body is dropped.
struct CaptureBody {
    inner: Body,
    state: Option<CaptureState>,
}

impl CaptureBody {
    fn capture(&mut self, data: &Bytes) {
        let Some(state) = self.state.as_mut() else {
            return;
        };
        let Some(buffer) = state.buffer.as_mut() else {
            return;
        };
        if buffer.len() + data.len() > state.limit {
            state.buffer = None;
            return;
        }
        buffer.extend_from_slice(data);
    }

    fn finish(&mut self) {
        let Some(mut state) = self.state.take() else {
            return;
        };
        state.event.complete(state.status, Stage::ResponseComplete);
        if let Some(buffer) = state.buffer {
            if !buffer.is_empty() {
                state.event.response_object = Some(buffer.freeze());
            }
        }
        state.pipeline.enqueue(state.event);
    }
}

impl HttpBody for CaptureBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_frame(cx);
        match &poll {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.capture(data);
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.finish(),
            Poll::Pending => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for CaptureBody {
    fn drop(&mut self) {
        self.finish();
    }
}
