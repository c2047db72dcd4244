//! Typed call/await wrapper for data request commands.
//!
//! [`AsyncRequestCommand`] turns "send request, await eventual response"
//! into a single asynchronous call with strict parameter and return typing,
//! without altering wire behaviour: it registers the command's one response
//! handler at construction and resolves a one-shot channel keyed by the
//! generated request id when the first real (non keep-alive) response
//! arrives.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::command::Command;
use crate::error::{BotlinkError, Result};
use crate::protocol::{Packet, PacketParam};
use crate::sender::CommandSender;

/// One element of a typed parameter list. `Option<T>` encodes optional
/// trailing arguments; `None` is omitted from the wire entirely.
pub trait IntoParam {
    /// Convert into a wire parameter, or nothing for an absent optional.
    fn into_param(self) -> Option<PacketParam>;
}

impl IntoParam for PacketParam {
    fn into_param(self) -> Option<PacketParam> {
        Some(self)
    }
}

impl IntoParam for i32 {
    fn into_param(self) -> Option<PacketParam> {
        Some(PacketParam::Int(self))
    }
}

impl IntoParam for f32 {
    fn into_param(self) -> Option<PacketParam> {
        Some(PacketParam::Float(self))
    }
}

impl IntoParam for String {
    fn into_param(self) -> Option<PacketParam> {
        Some(PacketParam::Str(self))
    }
}

impl IntoParam for &str {
    fn into_param(self) -> Option<PacketParam> {
        Some(PacketParam::Str(self.to_string()))
    }
}

impl<T: IntoParam> IntoParam for Option<T> {
    fn into_param(self) -> Option<PacketParam> {
        self.and_then(IntoParam::into_param)
    }
}

/// A complete typed parameter list for one request.
pub trait IntoParams {
    /// Convert into the wire parameter list; absent optionals are dropped.
    fn into_params(self) -> Vec<PacketParam>;
}

impl IntoParams for () {
    fn into_params(self) -> Vec<PacketParam> {
        Vec::new()
    }
}

impl IntoParams for Vec<PacketParam> {
    fn into_params(self) -> Vec<PacketParam> {
        self
    }
}

macro_rules! impl_into_params_for_tuple {
    ($($name:ident),+) => {
        impl<$($name: IntoParam),+> IntoParams for ($($name,)+) {
            fn into_params(self) -> Vec<PacketParam> {
                #[allow(non_snake_case)]
                let ($($name,)+) = self;
                [$($name.into_param()),+].into_iter().flatten().collect()
            }
        }
    };
}

impl_into_params_for_tuple!(A);
impl_into_params_for_tuple!(A, B);
impl_into_params_for_tuple!(A, B, C);
impl_into_params_for_tuple!(A, B, C, D);

/// One element of a typed return value.
pub trait FromParam: Sized {
    /// Convert from a wire parameter, failing on a type mismatch.
    fn from_param(param: &PacketParam) -> Result<Self>;
}

impl FromParam for PacketParam {
    fn from_param(param: &PacketParam) -> Result<Self> {
        Ok(param.clone())
    }
}

impl FromParam for i32 {
    fn from_param(param: &PacketParam) -> Result<Self> {
        match param {
            PacketParam::Int(v) => Ok(*v),
            other => Err(BotlinkError::UnexpectedResponse(format!(
                "expected int param, got {other:?}"
            ))),
        }
    }
}

impl FromParam for f32 {
    fn from_param(param: &PacketParam) -> Result<Self> {
        match param {
            PacketParam::Float(v) => Ok(*v),
            other => Err(BotlinkError::UnexpectedResponse(format!(
                "expected float param, got {other:?}"
            ))),
        }
    }
}

impl FromParam for String {
    fn from_param(param: &PacketParam) -> Result<Self> {
        match param {
            PacketParam::Str(s) => Ok(s.clone()),
            other => Err(BotlinkError::UnexpectedResponse(format!(
                "expected string param, got {other:?}"
            ))),
        }
    }
}

/// A complete typed return value decoded from a response's parameter list.
pub trait FromParams: Sized {
    /// Convert from the response parameter list.
    fn from_params(params: &[PacketParam]) -> Result<Self>;
}

impl FromParams for () {
    fn from_params(_params: &[PacketParam]) -> Result<Self> {
        Ok(())
    }
}

impl FromParams for Vec<PacketParam> {
    fn from_params(params: &[PacketParam]) -> Result<Self> {
        Ok(params.to_vec())
    }
}

/// Homogeneous string list, e.g. a page of fetched log lines.
impl FromParams for Vec<String> {
    fn from_params(params: &[PacketParam]) -> Result<Self> {
        params.iter().map(String::from_param).collect()
    }
}

macro_rules! impl_from_params_for_tuple {
    ($count:literal, $($name:ident @ $idx:tt),+) => {
        impl<$($name: FromParam),+> FromParams for ($($name,)+) {
            fn from_params(params: &[PacketParam]) -> Result<Self> {
                if params.len() != $count {
                    return Err(BotlinkError::UnexpectedResponse(format!(
                        "expected {} params, got {}", $count, params.len()
                    )));
                }
                Ok(($($name::from_param(&params[$idx])?,)+))
            }
        }
    };
}

impl_from_params_for_tuple!(1, A @ 0);
impl_from_params_for_tuple!(2, A @ 0, B @ 1);
impl_from_params_for_tuple!(3, A @ 0, B @ 1, C @ 2);
impl_from_params_for_tuple!(4, A @ 0, B @ 1, C @ 2, D @ 3);

type ResolverMap = Arc<Mutex<HashMap<i32, oneshot::Sender<Vec<Packet>>>>>;

/// Removes an abandoned resolver if the awaiting future is dropped before
/// its response arrives, so abandoned requests do not leak map entries.
struct ResolverGuard {
    resolvers: ResolverMap,
    request_id: i32,
}

impl Drop for ResolverGuard {
    fn drop(&mut self) {
        self.resolvers.lock().remove(&self.request_id);
    }
}

/// Asynchronous typed wrapper for a data request command.
pub struct AsyncRequestCommand<P, R> {
    command: Arc<Command>,
    resolvers: ResolverMap,
    _marker: PhantomData<fn(P) -> R>,
}

impl<P: IntoParams, R: FromParams> AsyncRequestCommand<P, R> {
    /// Wrap `command`, installing its response handler.
    ///
    /// Fails if the command already has a response handler — at most one
    /// wrapper (or raw handler) per command.
    pub fn new(command: Arc<Command>) -> Result<Self> {
        let resolvers: ResolverMap = Arc::new(Mutex::new(HashMap::new()));
        let map = resolvers.clone();
        command.set_response_handler(move |request, responses| {
            let map = map.clone();
            async move {
                if let Some(tx) = map.lock().remove(&request.request_id) {
                    let _ = tx.send(responses);
                }
            }
        })?;
        Ok(Self {
            command,
            resolvers,
            _marker: PhantomData,
        })
    }

    /// The wrapped command.
    pub fn command(&self) -> &Arc<Command> {
        &self.command
    }

    /// Issue the request through `sender` and await the first real
    /// response, converted to `R`.
    ///
    /// Keep-alive responses refresh the pending request but do not resolve
    /// the call; only a functional response does.
    pub async fn request(&self, sender: &Arc<CommandSender>, params: P) -> Result<R> {
        let (tx, rx) = oneshot::channel();
        // The packet waits in the debounce queue for at least one tick, so
        // the resolver is registered before anything hits the wire.
        let request_id = sender
            .make_request(&self.command, params.into_params(), false)
            .await?;
        self.resolvers.lock().insert(request_id, tx);
        let _guard = ResolverGuard {
            resolvers: self.resolvers.clone(),
            request_id,
        };

        let responses = rx.await.map_err(|_| BotlinkError::ConnectionClosed)?;
        let first = responses.first().ok_or_else(|| {
            BotlinkError::UnexpectedResponse("response list was empty".to_string())
        })?;
        R::from_params(&first.params)
    }
}
