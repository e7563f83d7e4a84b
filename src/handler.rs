// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Handlers
//!
//! Application-side traits invoked by the consumers. A handler receives the decoded
//! message body together with the OpenTelemetry context extracted from the delivery
//! and reports failures with a [`HandlerError`], which decides how the delivery is
//! settled.

use crate::errors::HandlerError;
use async_trait::async_trait;
use opentelemetry::Context;
use std::{future::Future, marker::PhantomData};

/// Handles one message at a time.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, ctx: &Context, body: &[u8]) -> Result<(), HandlerError>;
}

/// Handles a whole batch with a single outcome.
///
/// Success acks every message of the batch, failure requeues every message.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle_batch(&self, ctx: &Context, bodies: &[Vec<u8>]) -> Result<(), HandlerError>;
}

/// Handles a batch reporting one outcome per message, in input order.
#[async_trait]
pub trait BatchResultHandler: Send + Sync {
    async fn handle_batch(
        &self,
        ctx: &Context,
        bodies: &[Vec<u8>],
    ) -> Vec<Result<(), HandlerError>>;
}

/// [`MessageHandler`] backed by an async closure taking the owned body.
pub struct FnHandler<F, Fut> {
    f: F,
    _fut: PhantomData<fn() -> Fut>,
}

/// Wraps an async closure into a [`MessageHandler`].
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    FnHandler {
        f,
        _fut: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F, Fut>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle_message(&self, _ctx: &Context, body: &[u8]) -> Result<(), HandlerError> {
        (self.f)(body.to_vec()).await
    }
}

/// Runs a [`MessageHandler`] over every message of a batch, sequentially.
pub(crate) struct EachMessage<H: ?Sized>(pub(crate) std::sync::Arc<H>);

#[async_trait]
impl<H> BatchResultHandler for EachMessage<H>
where
    H: MessageHandler + ?Sized,
{
    async fn handle_batch(
        &self,
        ctx: &Context,
        bodies: &[Vec<u8>],
    ) -> Vec<Result<(), HandlerError>> {
        let mut results = Vec::with_capacity(bodies.len());
        for body in bodies {
            results.push(self.0.handle_message(ctx, body).await);
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    };

    #[tokio::test]
    async fn closure_handler_sees_body() {
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let handler = handler_fn(move |body: Vec<u8>| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(body.len(), Ordering::SeqCst);
                if body.is_empty() {
                    return Err(HandlerError::failed("empty"));
                }
                Ok(())
            }
        });

        assert!(handler.handle_message(&Context::new(), b"abc").await.is_ok());
        assert!(handler.handle_message(&Context::new(), b"").await.is_err());
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn each_message_keeps_input_order() {
        let mut mock = MockMessageHandler::new();
        mock.expect_handle_message()
            .times(3)
            .returning(|_, body| match body {
                b"bad" => Err(HandlerError::failed("bad")),
                _ => Ok(()),
            });

        let batch = EachMessage(Arc::new(mock));
        let results = batch
            .handle_batch(
                &Context::new(),
                &[b"ok".to_vec(), b"bad".to_vec(), b"ok".to_vec()],
            )
            .await;

        assert!(results[0].is_ok());
        assert!(results[1].is_err());
        assert!(results[2].is_ok());
    }
}
