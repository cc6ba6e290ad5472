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

//! The managed channel.
//!
//! A [`Channel`] owns one resolver and, while it is active, one load
//! balancer.  Everything that touches them, and every lifecycle transition,
//! runs in the channel's work serializer.  Calls only read the current picker
//! and fall back to the call buffer, so they never wait on the serializer.

use std::any::Any;
use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{oneshot, watch};
use tonic::{Status, async_trait};

use crate::attributes::Attributes;
use crate::client::backoff::{BackoffConfig, ExponentialBackoff};
use crate::client::connectivity_state::ConnectivityStateManager;
use crate::client::delayed_transport::{
    BufferListener, DelayedTransport, PickOutcome, PickedTransport, pick_with_deadline,
    start_call, transport_from_pick,
};
use crate::client::diagnostics::{LeakHandle, LeakTracker};
use crate::client::in_use::{InUseStateAggregator, InUseTransition};
use crate::client::load_balancing::{
    GLOBAL_LB_REGISTRY, LoadBalancer, LoadBalancerBuilder, PickArgs, PickResult, Picker,
    SubchannelState, pick_first,
};
use crate::client::name_resolution::{
    AddressGroup, GLOBAL_RESOLVER_REGISTRY, Resolver, ResolverBuilder, ResolverListener,
    ResolverOptions, ResolverRegistry, Target, looks_like_uri,
};
use crate::client::oob_channel::OobChannel;
use crate::client::retry::{
    CallAttempt, DefaultRetryPolicyProvider, RetryPolicyProvider, UncommittedRetryRegistry,
    retriable_call,
};
use crate::client::subchannel::{InternalSubchannel, SubchannelImpl};
use crate::client::transport::{TransportFactory, TransportOptions, UnsupportedTransportFactory};
use crate::client::work_serializer::{WorkSerializer, panic_message};
use crate::client::{CallOptions, ConnectivityState, Subchannel};
use crate::rt::GrpcRuntime;
use crate::service::{Request, Response, error_response};

mod helper;
mod timer;


use helper::{ChannelResolverListener, LbHelper};
use timer::ChannelTimer;

/// How long a channel may go without calls before it releases its resolver,
/// load balancer and connections.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// The smallest idle timeout a channel accepts.
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn shutdown_status() -> Status {
    Status::unavailable("Channel shutdown invoked")
}

pub(crate) fn shutdown_now_status() -> Status {
    Status::unavailable("Channel shutdownNow invoked")
}

static NEXT_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned when a channel cannot be created.
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("cannot find a resolver for {target}{}", uri_errors_suffix(.uri_errors))]
    NoResolver { target: String, uri_errors: String },

    #[error("idle timeout {0:?} is below the minimum of {MIN_IDLE_TIMEOUT:?}")]
    InvalidIdleTimeout(Duration),

    #[error("invalid backoff configuration: {0}")]
    InvalidBackoff(&'static str),

    #[error("no load balancing policy registered as {0:?}")]
    UnknownLoadBalancer(String),

    #[error("no runtime configured and not called from within a tokio runtime")]
    NoRuntime,
}

fn uri_errors_suffix(uri_errors: &str) -> String {
    if uri_errors.is_empty() {
        String::new()
    } else {
        format!(" ({uri_errors})")
    }
}

/// Configuration for a [`Channel`].
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use grpc_channel::client::ChannelOptions;
///
/// let options = ChannelOptions::default()
///     .with_idle_timeout(Some(Duration::from_secs(60)))
///     .with_authority("example.com");
/// ```
#[derive(Clone)]
pub struct ChannelOptions {
    idle_timeout: Option<Duration>,
    load_balancer: String,
    load_balancer_builder: Option<Arc<dyn LoadBalancerBuilder>>,
    resolver_registry: Option<Arc<ResolverRegistry>>,
    resolver_attributes: Attributes,
    transport_factory: Option<Arc<dyn TransportFactory>>,
    runtime: Option<GrpcRuntime>,
    backoff: BackoffConfig,
    retry_enabled: bool,
    retry_policy_provider: Option<Arc<dyn RetryPolicyProvider>>,
    authority: Option<String>,
    user_agent: Option<String>,
    leak_tracker: Option<&'static LeakTracker>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
            load_balancer: pick_first::POLICY_NAME.to_string(),
            load_balancer_builder: None,
            resolver_registry: None,
            resolver_attributes: Attributes::new(),
            transport_factory: None,
            runtime: None,
            backoff: BackoffConfig::default(),
            retry_enabled: true,
            retry_policy_provider: None,
            authority: None,
            user_agent: None,
            leak_tracker: Some(LeakTracker::global()),
        }
    }
}

impl ChannelOptions {
    /// Sets how long the channel may go unused before entering idle mode.
    /// `None` disables idleness.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Selects a load balancing policy from the global LB registry by name.
    pub fn with_load_balancer(mut self, name: impl Into<String>) -> Self {
        self.load_balancer = name.into();
        self
    }

    /// Uses `builder` for load balancing, bypassing the registry.
    pub fn with_load_balancer_builder(mut self, builder: Arc<dyn LoadBalancerBuilder>) -> Self {
        self.load_balancer_builder = Some(builder);
        self
    }

    /// Looks up resolvers in `registry` instead of the global one.
    pub fn with_resolver_registry(mut self, registry: Arc<ResolverRegistry>) -> Self {
        self.resolver_registry = Some(registry);
        self
    }

    pub fn with_resolver_attributes(mut self, attributes: Attributes) -> Self {
        self.resolver_attributes = attributes;
        self
    }

    /// Sets the factory used to create connections.  Without one every
    /// connection attempt fails.
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.transport_factory = Some(factory);
        self
    }

    pub fn with_runtime(mut self, runtime: GrpcRuntime) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Sets the reconnect backoff of subchannels and the backoff between
    /// name resolution attempts after a resolution error.
    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_retry_enabled(mut self, enabled: bool) -> Self {
        self.retry_enabled = enabled;
        self
    }

    pub fn with_retry_policy_provider(mut self, provider: Arc<dyn RetryPolicyProvider>) -> Self {
        self.retry_policy_provider = Some(provider);
        self
    }

    /// Overrides the authority reported by the resolver.
    pub fn with_authority(mut self, authority: impl Into<String>) -> Self {
        self.authority = Some(authority.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Controls whether a channel dropped without being shut down is
    /// reported.  Enabled by default.
    pub fn with_leak_tracking(mut self, enabled: bool) -> Self {
        self.leak_tracker = enabled.then(LeakTracker::global);
        self
    }

    /// Registers the channel with `tracker` instead of the global one.
    pub fn with_leak_tracker(mut self, tracker: &'static LeakTracker) -> Self {
        self.leak_tracker = Some(tracker);
        self
    }
}

impl Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("idle_timeout", &self.idle_timeout)
            .field("load_balancer", &self.load_balancer)
            .field("backoff", &self.backoff)
            .field("retry_enabled", &self.retry_enabled)
            .field("authority", &self.authority)
            .field("user_agent", &self.user_agent)
            .field("leak_tracking", &self.leak_tracker.is_some())
            .finish_non_exhaustive()
    }
}

/// What every subchannel of a channel is created with.
#[derive(Clone)]
pub(crate) struct SubchannelConfig {
    pub(crate) factory: Arc<dyn TransportFactory>,
    pub(crate) options: TransportOptions,
    pub(crate) runtime: GrpcRuntime,
    pub(crate) backoff: ExponentialBackoff,
    // Set once the call buffer has terminated.  From then on subchannel
    // shutdowns are no longer delayed.
    pub(crate) terminating: Arc<AtomicBool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum InUseObject {
    Buffer,
    Subchannel(u64),
}

struct ActiveLb {
    helper_id: u64,
    balancer: Box<dyn LoadBalancer>,
}

/// The channel state owned by the work serializer.
pub(crate) struct ChannelState {
    resolver: Option<Box<dyn Resolver>>,
    resolver_started: bool,
    resolver_backoff: ExponentialBackoff,
    resolver_refresh: Option<ChannelTimer>,
    lb: Option<ActiveLb>,
    next_helper_id: u64,
    subchannels: HashMap<u64, Arc<InternalSubchannel>>,
    oob_channels: HashMap<u64, OobChannel>,
    in_use: InUseStateAggregator<InUseObject>,
    idle_timer: Option<ChannelTimer>,
    panic_mode: bool,
    shutdown_now_requested: bool,
    terminated: bool,
    // Keeps the channel alive from shutdown until it terminates, so that
    // dropping every handle right after shutdown() still lets it finish.
    keepalive: Option<Arc<ChannelShared>>,
}

impl ChannelState {
    fn is_current(&self, helper_id: u64) -> bool {
        self.lb.as_ref().is_some_and(|lb| lb.helper_id == helper_id)
    }
}

pub(crate) struct ChannelShared {
    log_id: u64,
    target: String,
    authority: String,
    weak_self: Weak<ChannelShared>,
    runtime: GrpcRuntime,
    serializer: WorkSerializer<ChannelState>,
    subchannel_config: SubchannelConfig,
    lb_builder: Arc<dyn LoadBalancerBuilder>,
    resolver_builder: Arc<dyn ResolverBuilder>,
    resolver_target: Target,
    resolver_options: ResolverOptions,
    idle_timeout: Option<Duration>,
    retry: Option<Arc<dyn RetryPolicyProvider>>,
    picker: ArcSwapOption<Arc<dyn Picker>>,
    buffer: Arc<DelayedTransport>,
    retry_registry: UncommittedRetryRegistry,
    shutdown: AtomicBool,
    terminated: watch::Sender<bool>,
    connectivity: Mutex<ConnectivityStateManager>,
    leak: OnceLock<LeakHandle>,
}

impl ChannelShared {
    /// Queues `task` on the channel's serializer.  It runs on the next
    /// `drain()`, unless the channel is gone by then.
    pub(crate) fn execute_later(
        &self,
        task: impl FnOnce(&Arc<ChannelShared>, &mut ChannelState) + Send + 'static,
    ) {
        let channel = self.weak_self.clone();
        self.serializer.execute_later(move |state| {
            if let Some(channel) = channel.upgrade() {
                task(&channel, state);
            }
        });
    }

    pub(crate) fn drain(&self) {
        self.serializer.drain();
    }

    /// Queues `task` and drains.  When called from inside the serializer the
    /// task runs after the current one.
    pub(crate) fn run_serialized(
        &self,
        task: impl FnOnce(&Arc<ChannelShared>, &mut ChannelState) + Send + 'static,
    ) {
        self.execute_later(task);
        self.drain();
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn is_terminated(&self) -> bool {
        *self.terminated.borrow()
    }

    fn is_terminating(&self) -> bool {
        self.subchannel_config.terminating.load(Ordering::SeqCst)
    }

    fn goto_state(&self, new_state: ConnectivityState) {
        self.connectivity.lock().goto_state(new_state);
    }

    fn build_resolver(&self) -> Result<Box<dyn Resolver>, String> {
        self.resolver_builder
            .build(&self.resolver_target, &self.resolver_options)
            .ok_or_else(|| format!("resolver builder returned no resolver for {}", self.resolver_target))
    }

    fn exit_idle_mode(&self, state: &mut ChannelState) {
        if self.is_shutdown() || state.panic_mode {
            return;
        }
        if state.in_use.is_in_use() {
            // Cancelled here so a timer that is already due cannot idle the
            // channel right after the caller starts using it.
            Self::cancel_idle_timer(state);
        } else {
            self.reschedule_idle_timer(state);
        }
        if state.lb.is_some() {
            return;
        }
        tracing::debug!(channel = self.log_id, "exiting idle mode");
        let helper_id = state.next_helper_id;
        state.next_helper_id += 1;
        let balancer = self
            .lb_builder
            .build(Arc::new(LbHelper::new(self, helper_id)));
        state.lb = Some(ActiveLb {
            helper_id,
            balancer,
        });
        self.goto_state(ConnectivityState::Connecting);
        if state.resolver.is_none() {
            self.panic(state, "no resolver to start when exiting idle mode".to_string());
            return;
        }
        let listener = ChannelResolverListener::new(self.weak_self.clone(), helper_id);
        if let Some(resolver) = state.resolver.as_mut() {
            // A resolver that fails to start, by error or by panic, reports
            // it like any other resolution error.
            let started = catch_unwind(AssertUnwindSafe(|| {
                resolver.start(Box::new(listener.clone()))
            }))
            .unwrap_or_else(|payload| {
                Err(Status::internal(format!(
                    "resolver panicked on start: {}",
                    panic_message(payload.as_ref())
                )))
            });
            if let Err(status) = started {
                listener.on_error(status);
            }
        }
        state.resolver_started = true;
    }

    fn enter_idle_mode(&self, state: &mut ChannelState) -> Result<(), String> {
        if !state.resolver_started {
            return Err("resolver is not started".to_string());
        }
        if state.lb.is_none() {
            return Err("load balancer is not active".to_string());
        }
        self.shutdown_resolver_and_balancer(state);
        state.resolver = Some(self.build_resolver()?);
        self.buffer.reprocess(None);
        tracing::debug!(channel = self.log_id, "entering idle mode");
        self.goto_state(ConnectivityState::Idle);
        // Calls that were queued while the balancer was torn down still need
        // one.
        if state.in_use.is_object_in_use(&InUseObject::Buffer) {
            self.exit_idle_mode(state);
        }
        Ok(())
    }

    fn shutdown_resolver_and_balancer(&self, state: &mut ChannelState) {
        if let Some(mut resolver) = state.resolver.take() {
            Self::cancel_resolver_refresh(state);
            resolver.shutdown();
            state.resolver_started = false;
        }
        if let Some(mut lb) = state.lb.take() {
            lb.balancer.shutdown();
        }
        self.picker.store(None);
    }

    fn reschedule_idle_timer(&self, state: &mut ChannelState) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        Self::cancel_idle_timer(state);
        state.idle_timer = Some(ChannelTimer::start(self, timeout, |channel, state| {
            state.idle_timer = None;
            // The timer may have been armed by an in-use change after the
            // channel already went idle.
            if state.lb.is_none() {
                return;
            }
            if let Err(cause) = channel.enter_idle_mode(state) {
                channel.panic(state, cause);
            }
        }));
    }

    fn cancel_idle_timer(state: &mut ChannelState) {
        if let Some(timer) = state.idle_timer.take() {
            timer.cancel();
        }
    }

    fn update_in_use(&self, state: &mut ChannelState, object: InUseObject, in_use: bool) {
        match state.in_use.update_object_in_use(object, in_use) {
            Some(InUseTransition::InUse) => self.exit_idle_mode(state),
            Some(InUseTransition::NotInUse) if !self.is_shutdown() => {
                self.reschedule_idle_timer(state);
            }
            _ => {}
        }
    }

    fn update_picker(&self, picker: Arc<dyn Picker>) {
        self.picker.store(Some(Arc::new(picker.clone())));
        self.buffer.reprocess(Some(picker));
    }

    fn refresh_name_resolution(&self, state: &mut ChannelState) {
        if !state.resolver_started {
            return;
        }
        if let Some(resolver) = state.resolver.as_mut() {
            resolver.refresh();
        }
    }

    fn refresh_and_reset_name_resolution(&self, state: &mut ChannelState) {
        Self::cancel_resolver_refresh(state);
        self.refresh_name_resolution(state);
    }

    fn cancel_resolver_refresh(state: &mut ChannelState) {
        if let Some(timer) = state.resolver_refresh.take() {
            timer.cancel();
            state.resolver_backoff.reset();
        }
    }

    // A resolver may report several errors in a row; only one refresh is
    // scheduled at a time.
    fn schedule_resolver_refresh(&self, state: &mut ChannelState) {
        if state.resolver_refresh.is_some() {
            return;
        }
        let delay = state.resolver_backoff.next_delay();
        tracing::debug!(channel = self.log_id, ?delay, "scheduling name resolution refresh");
        state.resolver_refresh = Some(ChannelTimer::start(self, delay, |channel, state| {
            state.resolver_refresh = None;
            channel.refresh_name_resolution(state);
        }));
    }

    fn handle_resolved_addresses(
        &self,
        state: &mut ChannelState,
        helper_id: u64,
        groups: Vec<AddressGroup>,
        attributes: Attributes,
    ) {
        if !state.is_current(helper_id) {
            return;
        }
        tracing::debug!(channel = self.log_id, groups = groups.len(), "resolved addresses");
        state.resolver_backoff.reset();
        if let Some(lb) = state.lb.as_mut() {
            lb.balancer
                .handle_resolved_address_groups(groups, attributes);
        }
    }

    fn handle_resolution_error(&self, state: &mut ChannelState, helper_id: u64, status: Status) {
        tracing::warn!(channel = self.log_id, %status, "failed to resolve name");
        if !state.is_current(helper_id) {
            return;
        }
        if let Some(lb) = state.lb.as_mut() {
            lb.balancer.handle_name_resolution_error(status);
        }
        self.schedule_resolver_refresh(state);
    }

    fn handle_balancing_state(
        &self,
        state: &mut ChannelState,
        helper_id: u64,
        new_state: ConnectivityState,
        picker: Arc<dyn Picker>,
    ) {
        if !state.is_current(helper_id) || state.panic_mode {
            return;
        }
        self.update_picker(picker);
        // Balancers do not get to shut the channel down.
        if new_state != ConnectivityState::Shutdown {
            self.goto_state(new_state);
        }
    }

    fn handle_subchannel_state(
        &self,
        state: &mut ChannelState,
        helper_id: u64,
        subchannel: &Weak<SubchannelImpl>,
        new_state: SubchannelState,
    ) {
        if !state.is_current(helper_id) {
            return;
        }
        if matches!(
            new_state.connectivity_state,
            ConnectivityState::TransientFailure | ConnectivityState::Idle
        ) {
            self.refresh_and_reset_name_resolution(state);
        }
        let Some(subchannel) = subchannel.upgrade().map(Subchannel::from_impl) else {
            return;
        };
        if let Some(lb) = state.lb.as_mut() {
            lb.balancer
                .handle_subchannel_state(&subchannel, &new_state);
        }
    }

    fn handle_subchannel_terminated(&self, state: &mut ChannelState, id: u64) {
        state.subchannels.remove(&id);
        self.maybe_terminate_channel(state);
    }

    fn on_buffer_terminated(&self, state: &mut ChannelState) {
        if !self.is_shutdown() {
            self.panic(state, "call buffer terminated before the channel was shut down".to_string());
            return;
        }
        tracing::debug!(channel = self.log_id, "call buffer terminated");
        self.subchannel_config
            .terminating
            .store(true, Ordering::SeqCst);
        self.shutdown_resolver_and_balancer(state);
        // The balancer may have created subchannels right up to its shutdown.
        self.maybe_shutdown_now_subchannels(state);
        self.maybe_terminate_channel(state);
    }

    fn maybe_shutdown_now_subchannels(&self, state: &mut ChannelState) {
        if !state.shutdown_now_requested {
            return;
        }
        for subchannel in state.subchannels.values() {
            subchannel.shutdown_now(shutdown_now_status());
        }
        for oob in state.oob_channels.values() {
            if let Some(internal) = oob.internal_subchannel() {
                internal.shutdown_now(shutdown_now_status());
            }
        }
    }

    fn maybe_terminate_channel(&self, state: &mut ChannelState) {
        if state.terminated
            || !self.is_shutdown()
            || !self.is_terminating()
            || !state.subchannels.is_empty()
            || !state.oob_channels.is_empty()
        {
            return;
        }
        tracing::debug!(channel = self.log_id, "terminated");
        state.terminated = true;
        self.subchannel_config.factory.close();
        if let Some(leak) = self.leak.get() {
            leak.release();
        }
        self.terminated.send_replace(true);
        state.keepalive = None;
    }

    fn panic(&self, state: &mut ChannelState, cause: String) {
        if state.panic_mode {
            return;
        }
        state.panic_mode = true;
        tracing::error!(channel = self.log_id, %cause, "PANIC! entering TransientFailure");
        Self::cancel_idle_timer(state);
        if catch_unwind(AssertUnwindSafe(|| self.shutdown_resolver_and_balancer(state))).is_err() {
            tracing::error!(channel = self.log_id, "panicked while tearing down after a panic");
            self.picker.store(None);
        }
        let mut status = Status::internal("Panic! This is a bug!");
        status.set_source(Arc::new(PanicCause(cause)));
        self.update_picker(Arc::new(DropPicker { status }));
        self.goto_state(ConnectivityState::TransientFailure);
    }

    // Returns a transport for the call, queuing it in the buffer until the
    // picker finds one.
    async fn pick_transport(&self, args: PickArgs) -> Result<PickedTransport, Status> {
        if !self.is_shutdown() {
            match self.picker.load_full() {
                None => self.run_serialized(|channel, state| channel.exit_idle_mode(state)),
                Some(picker) => {
                    match transport_from_pick(picker.pick(&args), args.options.wait_for_ready) {
                        PickOutcome::Ready(picked) => return Ok(picked),
                        PickOutcome::Fail(status) => return Err(status),
                        PickOutcome::Queue => {}
                    }
                }
            }
        }
        self.buffer.pick(args).await
    }
}

#[async_trait]
impl CallAttempt for ChannelShared {
    async fn attempt(&self, method: &str, request: Request, options: &CallOptions) -> Response {
        let args = PickArgs::new(method, request.metadata().clone(), options.clone());
        match pick_with_deadline(&self.runtime, options.deadline, self.pick_transport(args)).await {
            Ok(picked) => start_call(picked, method, request).await,
            Err(status) => error_response(status),
        }
    }
}

/// The cause attached to the status of calls dropped after a panic.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct PanicCause(pub String);

struct DropPicker {
    status: Status,
}

impl Picker for DropPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Drop(self.status.clone())
    }
}

struct ChannelBufferListener {
    channel: Weak<ChannelShared>,
}

impl BufferListener for ChannelBufferListener {
    fn in_use(&self, in_use: bool) {
        if let Some(channel) = self.channel.upgrade() {
            channel.execute_later(move |channel, state| {
                channel.update_in_use(state, InUseObject::Buffer, in_use)
            });
        }
    }

    fn terminated(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.execute_later(|channel, state| channel.on_buffer_terminated(state));
        }
    }

    fn drain(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.drain();
        }
    }
}

/// A virtual connection to a target, backed by a pool of connections that
/// a load balancer manages.
///
/// A channel starts idle.  The first call (or [`state(true)`](Self::state))
/// starts name resolution and load balancing; after `idle_timeout` without
/// calls the channel releases them again.  Cloning a channel is cheap and all
/// clones share the same connections.
///
/// Channels must be shut down.  A channel dropped without [`shutdown`] is
/// reported as leaked.
///
/// [`shutdown`]: Self::shutdown
#[derive(Clone)]
pub struct Channel {
    shared: Arc<ChannelShared>,
}

impl Channel {
    /// Creates a channel for `target`.
    ///
    /// The target is looked up as a URI in the resolver registry.  If no
    /// resolver handles it and it does not look like a URI (e.g.
    /// `localhost:50051`), it is retried as
    /// `<default scheme>:///<target>`.
    pub fn new(target: &str, options: ChannelOptions) -> Result<Self, ChannelError> {
        let runtime = match options.runtime.clone() {
            Some(runtime) => runtime,
            None => default_runtime()?,
        };
        if let Some(timeout) = options.idle_timeout {
            if timeout < MIN_IDLE_TIMEOUT {
                return Err(ChannelError::InvalidIdleTimeout(timeout));
            }
        }
        let backoff =
            ExponentialBackoff::new(options.backoff.clone()).map_err(ChannelError::InvalidBackoff)?;
        let lb_builder = match &options.load_balancer_builder {
            Some(builder) => builder.clone(),
            None => GLOBAL_LB_REGISTRY
                .get_policy(&options.load_balancer)
                .ok_or_else(|| ChannelError::UnknownLoadBalancer(options.load_balancer.clone()))?,
        };
        let resolver_options = ResolverOptions {
            runtime: runtime.clone(),
            attributes: options.resolver_attributes.clone(),
        };
        let registry: &ResolverRegistry = match &options.resolver_registry {
            Some(registry) => registry,
            None => &GLOBAL_RESOLVER_REGISTRY,
        };
        let (resolver_target, resolver_builder, resolver) =
            find_resolver(target, registry, &resolver_options)?;
        let authority = options
            .authority
            .clone()
            .unwrap_or_else(|| resolver.service_authority());
        let log_id = NEXT_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        let retry = options.retry_enabled.then(|| {
            options
                .retry_policy_provider
                .clone()
                .unwrap_or_else(|| Arc::new(DefaultRetryPolicyProvider))
        });
        let subchannel_config = SubchannelConfig {
            factory: options
                .transport_factory
                .clone()
                .unwrap_or_else(|| Arc::new(UnsupportedTransportFactory)),
            options: TransportOptions {
                authority: authority.clone(),
                user_agent: options.user_agent.clone(),
            },
            runtime: runtime.clone(),
            backoff: backoff.clone(),
            terminating: Arc::new(AtomicBool::new(false)),
        };

        let shared = Arc::new_cyclic(|weak_self: &Weak<ChannelShared>| {
            let buffer = Arc::new(DelayedTransport::new(Arc::new(ChannelBufferListener {
                channel: weak_self.clone(),
            })));
            let panic_target = weak_self.clone();
            let state = ChannelState {
                resolver: Some(resolver),
                resolver_started: false,
                resolver_backoff: backoff,
                resolver_refresh: None,
                lb: None,
                next_helper_id: 0,
                subchannels: HashMap::new(),
                oob_channels: HashMap::new(),
                in_use: InUseStateAggregator::new(),
                idle_timer: None,
                panic_mode: false,
                shutdown_now_requested: false,
                terminated: false,
                keepalive: None,
            };
            ChannelShared {
                log_id,
                target: target.to_string(),
                authority,
                weak_self: weak_self.clone(),
                runtime: runtime.clone(),
                serializer: WorkSerializer::new(
                    state,
                    move |state: &mut ChannelState, cause| {
                        if let Some(channel) = panic_target.upgrade() {
                            channel.panic(state, cause);
                        }
                    },
                ),
                subchannel_config,
                lb_builder,
                resolver_builder,
                resolver_target,
                resolver_options,
                idle_timeout: options.idle_timeout,
                retry,
                picker: ArcSwapOption::empty(),
                retry_registry: UncommittedRetryRegistry::new(buffer.clone()),
                buffer,
                shutdown: AtomicBool::new(false),
                terminated: watch::Sender::new(false),
                connectivity: Mutex::new(ConnectivityStateManager::new(runtime.clone())),
                leak: OnceLock::new(),
            }
        });
        // Registered only once the channel is reachable: a sweep sees a
        // channel that is still being built as already dropped.
        if let Some(tracker) = options.leak_tracker {
            let weak = Arc::downgrade(&shared);
            let weak: Weak<dyn Any + Send + Sync> = weak;
            let _ = shared
                .leak
                .set(tracker.register(weak, log_id, target.to_string()));
        }
        tracing::debug!(channel = log_id, target, authority = %shared.authority, "channel created");
        Ok(Self { shared })
    }

    /// Performs a call.  Errors, including those raised before the call
    /// reaches a server, are reported through the response stream.
    pub async fn call(&self, method: impl Into<String>, request: Request, options: CallOptions) -> Response {
        let method = method.into();
        let shared = &self.shared;
        match &shared.retry {
            Some(provider) => {
                let policy = provider.policy(&method);
                retriable_call(
                    shared.as_ref(),
                    &shared.retry_registry,
                    &shared.runtime,
                    policy,
                    method,
                    request,
                    options,
                )
                .await
            }
            None => shared.attempt(&method, request, &options).await,
        }
    }

    /// Starts an orderly shutdown.  New calls fail at once; calls already
    /// started or queued are allowed to finish.  Idempotent.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        tracing::debug!(channel = shared.log_id, "shutdown() called");
        if shared.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(leak) = shared.leak.get() {
            leak.mark_shutdown();
        }
        let keepalive = shared.clone();
        shared.run_serialized(move |channel, state| {
            tracing::debug!(channel = channel.log_id, "entering Shutdown state");
            channel.goto_state(ConnectivityState::Shutdown);
            state.keepalive = Some(keepalive);
        });
        shared.retry_registry.on_shutdown(shutdown_status());
        shared.run_serialized(|_, state| ChannelShared::cancel_idle_timer(state));
    }

    /// Shuts the channel down and cancels every call it still has: queued
    /// calls, calls waiting to retry and calls in flight on its transports.
    pub fn shutdown_now(&self) {
        let shared = &self.shared;
        tracing::debug!(channel = shared.log_id, "shutdown_now() called");
        self.shutdown();
        if let Some(leak) = shared.leak.get() {
            leak.mark_shutdown_now();
        }
        shared.retry_registry.on_shutdown_now(shutdown_now_status());
        shared.run_serialized(|channel, state| {
            if state.shutdown_now_requested {
                return;
            }
            state.shutdown_now_requested = true;
            channel.maybe_shutdown_now_subchannels(state);
        });
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    /// Whether the channel has released all of its resources.  Once true,
    /// stays true.
    pub fn is_terminated(&self) -> bool {
        self.shared.is_terminated()
    }

    /// Waits up to `timeout` for the channel to terminate.  Returns whether
    /// it did.
    pub async fn await_termination(&self, timeout: Duration) -> bool {
        let mut terminated = self.shared.terminated.subscribe();
        tokio::select! {
            result = terminated.wait_for(|terminated| *terminated) => result.is_ok(),
            _ = self.shared.runtime.sleep(timeout) => self.is_terminated(),
        }
    }

    /// Returns the current connectivity state.  If `request_connection` is
    /// set and the channel is idle, it starts connecting.
    pub fn state(&self, request_connection: bool) -> ConnectivityState {
        let state = self.shared.connectivity.lock().state();
        if request_connection && state == ConnectivityState::Idle {
            self.shared
                .run_serialized(|channel, state| channel.exit_idle_mode(state));
        }
        state
    }

    /// Runs `callback` once the state differs from `source`.  The callback
    /// runs on the channel's runtime, never inline.
    pub fn notify_when_state_changed(
        &self,
        source: ConnectivityState,
        callback: impl FnOnce() + Send + 'static,
    ) {
        self.shared
            .connectivity
            .lock()
            .notify_when_state_changed(source, Box::new(callback));
    }

    /// Waits until the state differs from `source` and returns the new
    /// state.
    pub async fn wait_for_state_change(&self, source: ConnectivityState) -> ConnectivityState {
        let (tx, rx) = oneshot::channel();
        self.notify_when_state_changed(source, move || {
            let _ = tx.send(());
        });
        let _ = rx.await;
        self.state(false)
    }

    /// Makes subchannels in backoff reconnect now and asks a started resolver
    /// to resolve again.
    pub fn reset_connect_backoff(&self) {
        self.shared.run_serialized(|channel, state| {
            if channel.is_shutdown() {
                return;
            }
            channel.refresh_and_reset_name_resolution(state);
            for subchannel in state.subchannels.values() {
                subchannel.reset_connect_backoff();
            }
            for oob in state.oob_channels.values() {
                if let Some(internal) = oob.internal_subchannel() {
                    internal.reset_connect_backoff();
                }
            }
        });
    }

    /// Moves the channel to idle at once, for instance because the network is
    /// about to change.  The next call reconnects.
    pub fn prepare_to_lose_network(&self) {
        self.shared.run_serialized(|channel, state| {
            if channel.is_shutdown() || state.lb.is_none() {
                return;
            }
            ChannelShared::cancel_idle_timer(state);
            if let Err(cause) = channel.enter_idle_mode(state) {
                channel.panic(state, cause);
            }
        });
    }

    /// The authority used by calls on this channel.
    pub fn authority(&self) -> &str {
        &self.shared.authority
    }

    pub fn target(&self) -> &str {
        &self.shared.target
    }
}

impl Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.log_id)
            .field("target", &self.shared.target)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "_runtime-tokio")]
fn default_runtime() -> Result<GrpcRuntime, ChannelError> {
    crate::rt::tokio::TokioRuntime::try_current()
        .map(|runtime| Arc::new(runtime) as GrpcRuntime)
        .ok_or(ChannelError::NoRuntime)
}

#[cfg(not(feature = "_runtime-tokio"))]
fn default_runtime() -> Result<GrpcRuntime, ChannelError> {
    Err(ChannelError::NoRuntime)
}

type FoundResolver = (Target, Arc<dyn ResolverBuilder>, Box<dyn Resolver>);

fn find_resolver(
    target: &str,
    registry: &ResolverRegistry,
    options: &ResolverOptions,
) -> Result<FoundResolver, ChannelError> {
    let mut uri_errors = String::new();
    match Target::from_str(target) {
        Ok(parsed) => {
            if let Some(found) = resolver_for(parsed, registry, options) {
                return Ok(found);
            }
        }
        // Happens for targets such as "127.0.0.1:1234".
        Err(err) => uri_errors = err,
    }
    if !looks_like_uri(target) {
        let with_scheme = format!("{}:///{}", registry.default_scheme(), target);
        if let Ok(parsed) = Target::from_str(&with_scheme) {
            if let Some(found) = resolver_for(parsed, registry, options) {
                return Ok(found);
            }
        }
    }
    Err(ChannelError::NoResolver {
        target: target.to_string(),
        uri_errors,
    })
}

fn resolver_for(
    target: Target,
    registry: &ResolverRegistry,
    options: &ResolverOptions,
) -> Option<FoundResolver> {
    let builder = registry.get(target.scheme())?;
    let resolver = builder.build(&target, options)?;
    Some((target, builder, resolver))
}
