// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Call Handlers
//!
//! A [`CallHandler`] is the unit of dispatch: given an envelope it produces an
//! optional reply envelope. The set of variants is closed:
//!
//! | Kind          | Sees                         | Replies |
//! |---------------|------------------------------|---------|
//! | `Raw`         | the full [`Envelope`]        | maybe   |
//! | `Action`      | decoded payload              | no      |
//! | `Function`    | decoded payload              | yes     |
//! | `BusAction`   | [`BusMessage`] (payload + metadata) | no |
//! | `BusFunction` | [`BusMessage`]               | yes     |
//!
//! each with a synchronous and an asynchronous form. The decode and encode
//! steps for typed variants are captured once, when the handler is built.

use crate::{
    envelope::{BusMessage, Contract, Envelope},
    errors::BusError,
    serializer::Serializers,
};
use futures_util::{future::BoxFuture, FutureExt};
use std::{fmt, future::Future, panic::AssertUnwindSafe, sync::Arc};

/// Outcome of one handler invocation: an optional reply, or a fault.
pub type HandlerResult = Result<Option<Envelope>, BusError>;

type SyncFn = Arc<dyn Fn(&Envelope, &Serializers) -> HandlerResult + Send + Sync>;
type AsyncFn =
    Arc<dyn Fn(Envelope, Arc<Serializers>) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Raw,
    Action,
    Function,
    BusAction,
    BusFunction,
}

#[derive(Clone)]
enum Execution {
    Sync(SyncFn),
    Async(AsyncFn),
}

/// A registered unit of dispatch. Cheap to clone; clones share the
/// underlying closure.
#[derive(Clone)]
pub struct CallHandler {
    kind: HandlerKind,
    exec: Execution,
}

impl fmt::Debug for CallHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallHandler")
            .field("kind", &self.kind)
            .field("async", &self.is_async())
            .finish()
    }
}

fn encode_reply<R: Contract>(
    request: &Envelope,
    value: &R,
    serializers: &Serializers,
) -> HandlerResult {
    let mut reply = request.reply_skeleton();
    serializers.encode_into(value, &mut reply)?;
    Ok(Some(reply))
}

impl CallHandler {
    fn sync<F>(kind: HandlerKind, f: F) -> Self
    where
        F: Fn(&Envelope, &Serializers) -> HandlerResult + Send + Sync + 'static,
    {
        let f: SyncFn = Arc::new(f);
        CallHandler {
            kind,
            exec: Execution::Sync(f),
        }
    }

    fn asynchronous<F>(kind: HandlerKind, f: F) -> Self
    where
        F: Fn(Envelope, Arc<Serializers>) -> BoxFuture<'static, HandlerResult>
            + Send
            + Sync
            + 'static,
    {
        let f: AsyncFn = Arc::new(f);
        CallHandler {
            kind,
            exec: Execution::Async(f),
        }
    }

    pub fn kind(&self) -> HandlerKind {
        self.kind
    }

    pub fn is_async(&self) -> bool {
        matches!(self.exec, Execution::Async(_))
    }

    /// Runs the handler. Faults, including panics, come back as errors.
    pub async fn dispatch(&self, env: Envelope, serializers: Arc<Serializers>) -> HandlerResult {
        let run = async {
            match &self.exec {
                Execution::Sync(f) => f(&env, &serializers),
                Execution::Async(f) => f(env.clone(), serializers.clone()).await,
            }
        };

        match AssertUnwindSafe(run).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(BusError::Handler("handler panicked".to_owned())),
        }
    }

    /// Creates a handler that receives the undecoded envelope.
    ///
    /// # Parameters
    /// * `f` - Called with the delivery; may return a reply envelope
    ///
    /// # Returns
    /// A synchronous [`HandlerKind::Raw`] handler
    pub fn raw<F, E>(f: F) -> Self
    where
        F: Fn(&Envelope) -> Result<Option<Envelope>, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self::sync(
            HandlerKind::Raw,
            move |env, _| f(env).map_err(BusError::handler),
        )
    }

    /// Asynchronous form of [`Self::raw`].
    pub fn raw_async<F, Fut, E>(f: F) -> Self
    where
        F: Fn(Envelope) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Option<Envelope>, E>> + Send + 'static,
        E: fmt::Display,
    {
        Self::asynchronous(
            HandlerKind::Raw,
            move |env, _| {
                let fut = f(env);
                Box::pin(async move { fut.await.map_err(BusError::handler) })
            },
        )
    }

    /// Creates a fire-and-forget handler for contract `T`.
    ///
    /// The payload is decoded before `f` runs; a payload that does not decode
    /// fails with [`BusError::Deserialize`] and `f` is not called.
    ///
    /// # Parameters
    /// * `f` - Called with the decoded message
    ///
    /// # Returns
    /// A synchronous [`HandlerKind::Action`] handler
    pub fn action<T, F, E>(f: F) -> Self
    where
        T: Contract,
        F: Fn(T) -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self::sync(
            HandlerKind::Action,
            move |env, serializers| {
                let data: T = serializers.decode(env)?;
                f(data).map_err(BusError::handler)?;
                Ok(None)
            },
        )
    }

    /// Asynchronous form of [`Self::action`]. The returned future runs inside
    /// the ambient transaction of the delivery, if any.
    pub fn action_async<T, F, Fut, E>(f: F) -> Self
    where
        T: Contract,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        let f = Arc::new(f);
        Self::asynchronous(
            HandlerKind::Action,
            move |env, serializers| {
                let f = f.clone();
                Box::pin(async move {
                    let data: T = serializers.decode(&env)?;
                    f(data).await.map_err(BusError::handler)?;
                    Ok(None)
                })
            },
        )
    }

    /// Creates a request/reply handler: `f` maps a `T` to an `R` that is sent
    /// back to the request's `reply_to`.
    ///
    /// # Parameters
    /// * `f` - Called with the decoded request
    ///
    /// # Returns
    /// A synchronous [`HandlerKind::Function`] handler. Its reply keeps the
    /// request's correlation id.
    pub fn function<T, R, F, E>(f: F) -> Self
    where
        T: Contract,
        R: Contract,
        F: Fn(T) -> Result<R, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self::sync(
            HandlerKind::Function,
            move |env, serializers| {
                let data: T = serializers.decode(env)?;
                let out = f(data).map_err(BusError::handler)?;
                encode_reply(env, &out, serializers)
            },
        )
    }

    /// Asynchronous form of [`Self::function`].
    pub fn function_async<T, R, F, Fut, E>(f: F) -> Self
    where
        T: Contract,
        R: Contract,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: fmt::Display,
    {
        let f = Arc::new(f);
        Self::asynchronous(
            HandlerKind::Function,
            move |env, serializers| {
                let f = f.clone();
                Box::pin(async move {
                    let data: T = serializers.decode(&env)?;
                    let out = f(data).await.map_err(BusError::handler)?;
                    encode_reply(&env, &out, &serializers)
                })
            },
        )
    }

    /// Like [`Self::action`], but `f` also sees the delivery metadata through
    /// [`BusMessage`].
    pub fn bus_action<T, F, E>(f: F) -> Self
    where
        T: Contract,
        F: Fn(BusMessage<T>) -> Result<(), E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self::sync(
            HandlerKind::BusAction,
            move |env, serializers| {
                let data: T = serializers.decode(env)?;
                f(BusMessage::from_envelope(data, env)).map_err(BusError::handler)?;
                Ok(None)
            },
        )
    }

    /// Asynchronous form of [`Self::bus_action`].
    pub fn bus_action_async<T, F, Fut, E>(f: F) -> Self
    where
        T: Contract,
        F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display,
    {
        let f = Arc::new(f);
        Self::asynchronous(
            HandlerKind::BusAction,
            move |env, serializers| {
                let f = f.clone();
                Box::pin(async move {
                    let data: T = serializers.decode(&env)?;
                    f(BusMessage::from_envelope(data, &env))
                        .await
                        .map_err(BusError::handler)?;
                    Ok(None)
                })
            },
        )
    }

    /// Like [`Self::function`], but `f` also sees the delivery metadata
    /// through [`BusMessage`].
    pub fn bus_function<T, R, F, E>(f: F) -> Self
    where
        T: Contract,
        R: Contract,
        F: Fn(BusMessage<T>) -> Result<R, E> + Send + Sync + 'static,
        E: fmt::Display,
    {
        Self::sync(
            HandlerKind::BusFunction,
            move |env, serializers| {
                let data: T = serializers.decode(env)?;
                let out = f(BusMessage::from_envelope(data, env)).map_err(BusError::handler)?;
                encode_reply(env, &out, serializers)
            },
        )
    }

    pub fn bus_function_async<T, R, F, Fut, E>(f: F) -> Self
    where
        T: Contract,
        R: Contract,
        F: Fn(BusMessage<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
        E: fmt::Display,
    {
        let f = Arc::new(f);
        Self::asynchronous(
            HandlerKind::BusFunction,
            move |env, serializers| {
                let f = f.clone();
                Box::pin(async move {
                    let data: T = serializers.decode(&env)?;
                    let out = f(BusMessage::from_envelope(data, &env))
                        .await
                        .map_err(BusError::handler)?;
                    encode_reply(&env, &out, &serializers)
                })
            },
        )
    }
}
