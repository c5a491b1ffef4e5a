//! The interceptor pipeline (section 4.9) and its scope-matching helper
//! (section 4.11, added).

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::FutureExt;

use crate::metadata::Metadata;

/// Which calls a declared interceptor applies to (section 4.9).
#[derive(Debug, Clone)]
pub enum InterceptorScope {
    All,
    Services(HashSet<String>),
    Methods(HashSet<String>),
}

impl InterceptorScope {
    /// The single predicate both client and server pipelines use to decide
    /// whether this scope applies to `service`/`method` (section 4.11),
    /// declared once so the two construction sites can't drift apart.
    pub fn matches(&self, service: &str, method: &str) -> bool {
        match self {
            InterceptorScope::All => true,
            InterceptorScope::Services(services) => services.contains(service),
            InterceptorScope::Methods(methods) => {
                methods.contains(&format!("{service}/{method}"))
            }
        }
    }
}

/// What an interceptor sees and may rewrite on the way in.
#[derive(Debug, Clone)]
pub struct InterceptedRequest {
    pub service: String,
    pub method: String,
    pub metadata: Metadata,
    pub payload: Bytes,
}

/// What an interceptor sees and may rewrite on the way out.
#[derive(Debug, Clone)]
pub struct InterceptedResponse {
    pub metadata: Metadata,
    pub payload: Bytes,
}

/// A pure onion layer: `intercept(request, next) -> response` (section
/// 4.9). Interceptors must not retain the request past their own scope and
/// must propagate cancellation downstream (i.e. simply `await` `next`
/// rather than detaching it onto another task).
#[async_trait]
pub trait Interceptor: Send + Sync {
    async fn intercept(
        &self,
        request: InterceptedRequest,
        next: Next<'_>,
    ) -> InterceptedResponse;
}

/// The remaining chain, from the current interceptor's point of view.
pub struct Next<'a> {
    remaining: &'a [(InterceptorScope, Arc<dyn Interceptor>)],
    service: &'a str,
    method: &'a str,
    innermost: &'a (dyn Fn(InterceptedRequest) -> futures_util::future::BoxFuture<'a, InterceptedResponse>
          + Send
          + Sync),
}

impl<'a> Next<'a> {
    pub async fn call(self, request: InterceptedRequest) -> InterceptedResponse {
        match self
            .remaining
            .iter()
            .find(|(scope, _)| scope.matches(self.service, self.method))
        {
            Some((_, interceptor)) => {
                let rest = find_rest(self.remaining, interceptor);
                let next = Next {
                    remaining: rest,
                    service: self.service,
                    method: self.method,
                    innermost: self.innermost,
                };
                interceptor.intercept(request, next).await
            }
            None => (self.innermost)(request).await,
        }
    }
}

fn find_rest<'a>(
    remaining: &'a [(InterceptorScope, Arc<dyn Interceptor>)],
    current: &Arc<dyn Interceptor>,
) -> &'a [(InterceptorScope, Arc<dyn Interceptor>)] {
    let idx = remaining
        .iter()
        .position(|(_, i)| Arc::ptr_eq(i, current))
        .expect("current interceptor must be within remaining");
    &remaining[idx + 1..]
}

/// The ordered set of interceptors declared at client/server construction
/// time (section 4.9: "constructed at client/server init by iterating the
/// declared interceptors in order").
#[derive(Clone, Default)]
pub struct InterceptorPipeline {
    layers: Vec<(InterceptorScope, Arc<dyn Interceptor>)>,
}

impl InterceptorPipeline {
    pub fn new() -> InterceptorPipeline {
        InterceptorPipeline { layers: Vec::new() }
    }

    pub fn push(&mut self, scope: InterceptorScope, interceptor: Arc<dyn Interceptor>) {
        self.layers.push((scope, interceptor));
    }

    /// Run the whole chain for one call, delegating to `innermost` (the
    /// actual transport invocation) once every applicable interceptor has
    /// run.
    pub async fn run<'a, F>(
        &'a self,
        service: &'a str,
        method: &'a str,
        request: InterceptedRequest,
        innermost: F,
    ) -> InterceptedResponse
    where
        F: Fn(InterceptedRequest) -> futures_util::future::BoxFuture<'a, InterceptedResponse>
            + Send
            + Sync
            + 'a,
    {
        let next = Next {
            remaining: &self.layers,
            service,
            method,
            innermost: &innermost,
        };
        next.call(request).await
    }

    /// Run the chain over metadata alone, for call shapes that don't fit
    /// `InterceptedRequest`'s single-payload form (streaming RPCs, and the
    /// server side's already-decoded message list). The payload travels
    /// through as an empty, unused `Bytes` so the same onion in `run` still
    /// does the work; only the metadata an interceptor rewrote is kept.
    pub async fn apply_metadata(&self, service: &str, method: &str, metadata: Metadata) -> Metadata {
        let request = InterceptedRequest {
            service: service.to_string(),
            method: method.to_string(),
            metadata,
            payload: Bytes::new(),
        };
        let response = self
            .run(service, method, request, |req| {
                async move {
                    InterceptedResponse {
                        metadata: req.metadata,
                        payload: req.payload,
                    }
                }
                .boxed()
            })
            .await;
        response.metadata
    }
}
