use std::{fmt::Debug, future::Future, sync::Arc};

use futures::{future::BoxFuture, FutureExt};

use crate::error::InvalidRequest;

/// Merges a new request body into the body accumulated so far for a batch.
///
/// Takes the current body by reference so a failed combine leaves the batch intact.
pub type CombineFn<B, E> = Arc<dyn Fn(&B, B) -> Result<B, E> + Send + Sync>;

/// Sends a fully combined body downstream. Called once per batch.
pub type SendFn<B, R, E> =
    Arc<dyn Fn(String, B) -> BoxFuture<'static, Result<R, E>> + Send + Sync>;

/// A single logical request to be combined with others sharing the same batch key.
///
/// All requests submitted under one key must carry interchangeable `combine` and `send`
/// functions. Each joining request's own `combine` merges it into the batch, but only the `send`
/// of the request that started the batch is ever called. A different `send` on a later request
/// is silently ignored.
pub struct BatchRequest<B, R, E> {
    /// Passed through to `send`, e.g. the resource the call concerns.
    pub resource_name: String,
    /// This request's payload.
    pub body: B,
    /// How to merge this request's body into a pending batch.
    pub combine: Option<CombineFn<B, E>>,
    /// Performs the downstream call for the combined body.
    pub send: Option<SendFn<B, R, E>>,
    /// Diagnostic label, used in errors and logs.
    pub debug_id: String,
}

/// A request with both functions present.
pub(crate) struct ValidRequest<B, R, E> {
    pub resource_name: String,
    pub body: B,
    pub combine: CombineFn<B, E>,
    pub send: SendFn<B, R, E>,
    pub debug_id: String,
}

impl<B, R, E> BatchRequest<B, R, E> {
    /// Create a request with no functions attached yet.
    pub fn new(resource_name: impl Into<String>, body: B) -> Self {
        Self {
            resource_name: resource_name.into(),
            body,
            combine: None,
            send: None,
            debug_id: String::new(),
        }
    }

    /// Set the combine function.
    pub fn with_combine<F>(mut self, combine: F) -> Self
    where
        F: Fn(&B, B) -> Result<B, E> + Send + Sync + 'static,
    {
        self.combine = Some(Arc::new(combine));
        self
    }

    /// Set the send function.
    pub fn with_send<F, Fut>(mut self, send: F) -> Self
    where
        F: Fn(String, B) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.send = Some(Arc::new(move |resource_name, body| {
            send(resource_name, body).boxed()
        }));
        self
    }

    /// Set the debug ID.
    pub fn with_debug_id(mut self, debug_id: impl Into<String>) -> Self {
        self.debug_id = debug_id.into();
        self
    }

    pub(crate) fn validate(self) -> Result<ValidRequest<B, R, E>, InvalidRequest> {
        let combine = self.combine.ok_or(InvalidRequest::MissingCombine)?;
        let send = self.send.ok_or(InvalidRequest::MissingSend)?;
        Ok(ValidRequest {
            resource_name: self.resource_name,
            body: self.body,
            combine,
            send,
            debug_id: self.debug_id,
        })
    }
}

impl<B: Debug, R, E> Debug for BatchRequest<B, R, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let BatchRequest {
            resource_name,
            body,
            combine,
            send,
            debug_id,
        } = self;
        f.debug_struct("BatchRequest")
            .field("resource_name", resource_name)
            .field("body", body)
            .field("combine", &combine.is_some())
            .field("send", &send.is_some())
            .field("debug_id", debug_id)
            .finish()
    }
}
