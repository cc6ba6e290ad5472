/*
 *
 * Copyright 2025 gRPC authors.
 *
 * Permission is hereby granted, free of charge, to any person obtaining a copy
 * of this software and associated documentation files (the "Software"), to
 * deal in the Software without restriction, including without limitation the
 * rights to use, copy, modify, merge, publish, distribute, sublicense, and/or
 * sell copies of the Software, and to permit persons to whom the Software is
 * furnished to do so, subject to the following conditions:
 *
 * The above copyright notice and this permission notice shall be included in
 * all copies or substantial portions of the Software.
 *
 * THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
 * IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
 * FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
 * AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
 * LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
 * FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS
 * IN THE SOFTWARE.
 *
 */

//! Out-of-band channels: channels that load balancers create to talk to
//! servers other than the backends, e.g. a look-aside balancer.
//!
//! An [`OobChannel`] has a single subchannel and no resolver or load
//! balancer of its own.  The parent channel tracks it and does not terminate
//! before it has.

use std::fmt::{self, Debug};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tonic::Status;

use crate::client::channel::ChannelShared;
use crate::client::delayed_transport::{
    BufferListener, BufferShutdown, DelayedTransport, pick_with_deadline, start_call,
};
use crate::client::load_balancing::{FailingPicker, Pick, PickArgs, PickResult, Picker, SubchannelState};
use crate::client::name_resolution::AddressGroup;
use crate::client::subchannel::InternalSubchannel;
use crate::client::{CallOptions, ConnectivityState, Subchannel};
use crate::rt::GrpcRuntime;
use crate::service::{Request, Response, error_response};

static NEXT_OOB_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

struct OobInner {
    id: u64,
    authority: String,
    buffer: Arc<DelayedTransport>,
    subchannel: OnceLock<Subchannel>,
    picker: OnceLock<Arc<dyn Picker>>,
    shutdown: AtomicBool,
    terminated: watch::Sender<bool>,
    runtime: GrpcRuntime,
}

/// A channel to a single address group, created through
/// [`Helper::create_oob_channel`](crate::client::load_balancing::Helper::create_oob_channel).
///
/// Calls wait until the subchannel is Ready.  While it is in
/// TransientFailure they fail, unless they are wait-for-ready.
#[derive(Clone)]
pub struct OobChannel {
    inner: Arc<OobInner>,
}

impl OobChannel {
    pub(crate) fn new(authority: String, parent: Weak<ChannelShared>, runtime: GrpcRuntime) -> Self {
        let id = NEXT_OOB_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(oob_channel = id, %authority, "oob channel created");
        let inner = Arc::new_cyclic(|oob: &Weak<OobInner>| OobInner {
            id,
            authority,
            buffer: Arc::new(DelayedTransport::new(Arc::new(OobBufferListener {
                oob: oob.clone(),
                parent,
                runtime: runtime.clone(),
            }))),
            subchannel: OnceLock::new(),
            picker: OnceLock::new(),
            shutdown: AtomicBool::new(false),
            terminated: watch::Sender::new(false),
            runtime,
        });
        Self { inner }
    }

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn downgrade(&self) -> WeakOobChannel {
        WeakOobChannel(Arc::downgrade(&self.inner))
    }

    pub(crate) fn set_subchannel(&self, subchannel: Subchannel) {
        let _ = self.inner.picker.set(Arc::new(OobPicker {
            subchannel: subchannel.clone(),
        }));
        let _ = self.inner.subchannel.set(subchannel);
    }

    pub(crate) fn internal_subchannel(&self) -> Option<&Arc<InternalSubchannel>> {
        self.inner.subchannel.get().map(Subchannel::internal)
    }

    pub(crate) fn update_addresses(&self, group: AddressGroup) {
        if let Some(internal) = self.internal_subchannel() {
            internal.update_addresses(group);
        }
    }

    /// Re-picks queued calls for the subchannel's new state.  Runs in the
    /// parent channel's serializer.
    pub(crate) fn handle_subchannel_state_change(&self, state: &SubchannelState) {
        match state.connectivity_state {
            ConnectivityState::Ready | ConnectivityState::Idle => {
                if let Some(picker) = self.inner.picker.get() {
                    self.inner.buffer.reprocess(Some(picker.clone()));
                }
            }
            ConnectivityState::TransientFailure => {
                let status = state
                    .last_connection_error
                    .clone()
                    .unwrap_or_else(|| Status::unavailable("oob channel subchannel failed"));
                self.inner
                    .buffer
                    .reprocess(Some(Arc::new(FailingPicker::new(status))));
            }
            ConnectivityState::Connecting | ConnectivityState::Shutdown => {}
        }
    }

    pub(crate) fn handle_subchannel_terminated(&self) {
        tracing::debug!(oob_channel = self.inner.id, "oob channel terminated");
        self.inner.terminated.send_replace(true);
    }

    /// Performs a call on the oob channel's subchannel.
    pub async fn call(&self, method: impl Into<String>, request: Request, options: CallOptions) -> Response {
        let method = method.into();
        if !self.is_shutdown() {
            let transport = self
                .inner
                .subchannel
                .get()
                .and_then(Subchannel::obtain_active_transport);
            if let Some(transport) = transport {
                return transport.call(method, request).await;
            }
        }
        let args = PickArgs::new(method.clone(), request.metadata().clone(), options.clone());
        let picked =
            pick_with_deadline(&self.inner.runtime, options.deadline, self.inner.buffer.pick(args))
                .await;
        match picked {
            Ok(picked) => start_call(picked, &method, request).await,
            Err(status) => error_response(status),
        }
    }

    /// Fails new calls and shuts the subchannel down once queued calls are
    /// done.
    pub fn shutdown(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner
            .buffer
            .shutdown(Status::unavailable("OobChannel.shutdown() called"));
    }

    /// Like [`shutdown`](Self::shutdown), and fails queued calls as well.
    pub fn shutdown_now(&self) {
        self.inner.shutdown.store(true, Ordering::SeqCst);
        self.inner
            .buffer
            .shutdown_now(Status::unavailable("OobChannel.shutdownNow() called"));
    }

    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    pub fn is_terminated(&self) -> bool {
        *self.inner.terminated.borrow()
    }

    /// Waits up to `timeout` for the oob channel to terminate.  Returns
    /// whether it did.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut terminated = self.inner.terminated.subscribe();
        tokio::select! {
            result = terminated.wait_for(|terminated| *terminated) => result.is_ok(),
            _ = self.inner.runtime.sleep(timeout) => self.is_terminated(),
        }
    }

    pub fn authority(&self) -> &str {
        &self.inner.authority
    }

    /// The state of the subchannel.  If `request_connection` is set and it is
    /// Idle, it starts connecting.
    pub fn state(&self, request_connection: bool) -> ConnectivityState {
        let Some(subchannel) = self.inner.subchannel.get() else {
            return ConnectivityState::Idle;
        };
        let state = subchannel.state();
        if request_connection && state == ConnectivityState::Idle {
            subchannel.request_connection();
        }
        state
    }
}

impl Debug for OobChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OobChannel")
            .field("id", &self.inner.id)
            .field("authority", &self.inner.authority)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub(crate) struct WeakOobChannel(Weak<OobInner>);

impl WeakOobChannel {
    pub(crate) fn upgrade(&self) -> Option<OobChannel> {
        self.0.upgrade().map(|inner| OobChannel { inner })
    }
}

struct OobPicker {
    subchannel: Subchannel,
}

impl Picker for OobPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Pick(Pick::new(self.subchannel.clone()))
    }
}

struct OobBufferListener {
    oob: Weak<OobInner>,
    parent: Weak<ChannelShared>,
    runtime: GrpcRuntime,
}

impl BufferListener for OobBufferListener {
    // Oob channels never keep the parent out of idle mode.
    fn in_use(&self, _in_use: bool) {}

    // Called with the buffer locked: the subchannel shutdown is only queued.
    fn terminated(&self) {
        let Some(internal) = self
            .oob
            .upgrade()
            .and_then(|oob| oob.subchannel.get().map(|s| s.internal().clone()))
        else {
            return;
        };
        let status = Status::unavailable("OobChannel is shutdown");
        match self.parent.upgrade() {
            Some(parent) => parent.execute_later(move |_, _| internal.shutdown(status)),
            None => {
                self.runtime
                    .spawn(Box::pin(async move { internal.shutdown(status) }));
            }
        }
    }

    fn drain(&self) {
        if let Some(parent) = self.parent.upgrade() {
            parent.drain();
        }
    }
}
