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

//! Subchannels: the connection to one logical server.
//!
//! [`InternalSubchannel`] runs the connection state machine.  It tries the
//! addresses of its group in order, backs off once all of them have failed,
//! and keeps track of every transport it created until each has terminated.
//! The public [`Subchannel`] handle given to load balancers wraps it and adds
//! the delayed shutdown.

use std::collections::HashMap;
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tonic::Status;

use crate::attributes::Attributes;
use crate::client::ConnectivityState;
use crate::client::backoff::ExponentialBackoff;
use crate::client::channel::shutdown_status;
use crate::client::in_use::{InUseStateAggregator, InUseTransition};
use crate::client::load_balancing::SubchannelState;
use crate::client::name_resolution::AddressGroup;
use crate::client::transport::{ManagedTransport, TransportFactory, TransportListener, TransportOptions};
use crate::rt::{BoxedTaskHandle, GrpcRuntime, schedule};

/// How long a subchannel stays usable after a load balancer shuts it down.
/// Calls that picked it just before the shutdown still find a transport.
pub const SUBCHANNEL_SHUTDOWN_DELAY: Duration = Duration::from_secs(5);

pub(crate) fn subchannel_shutdown_status() -> Status {
    Status::unavailable("Subchannel shutdown invoked")
}

static NEXT_SUBCHANNEL_ID: AtomicU64 = AtomicU64::new(1);

/// Receives the events of one internal subchannel.
///
/// The first three methods are called with the subchannel's lock held and may
/// only queue work.  `drain` is called after the lock is released and runs it.
pub(crate) trait SubchannelCallback: Send + Sync {
    fn on_state_change(&self, state: SubchannelState);
    fn on_terminated(&self);
    fn on_in_use(&self, in_use: bool);
    fn drain(&self);
}

type TransportEntry = (u64, Arc<dyn ManagedTransport>);

struct Inner {
    addresses: AddressGroup,
    address_index: usize,
    state: SubchannelState,
    backoff: ExponentialBackoff,
    connect_started: Instant,
    // The generation lets a backoff timer that already fired detect that it
    // was cancelled.
    reconnect_task: Option<(u64, BoxedTaskHandle)>,
    reconnect_generation: u64,
    pending: Option<TransportEntry>,
    active: Option<TransportEntry>,
    transports: HashMap<u64, Arc<dyn ManagedTransport>>,
    in_use: InUseStateAggregator<u64>,
    shutdown_status: Option<Status>,
    next_transport_id: u64,
}

// Transport calls that must not happen with the lock held, since transports
// may call their listener synchronously.
enum Action {
    Start(u64, Arc<dyn ManagedTransport>),
    Shutdown(Arc<dyn ManagedTransport>, Status),
    ShutdownNow(Arc<dyn ManagedTransport>, Status),
}

/// Manages the transports to one address group.
pub(crate) struct InternalSubchannel {
    id: u64,
    options: TransportOptions,
    factory: Arc<dyn TransportFactory>,
    runtime: GrpcRuntime,
    callback: Arc<dyn SubchannelCallback>,
    weak_self: Weak<InternalSubchannel>,
    inner: Mutex<Inner>,
}

impl InternalSubchannel {
    pub(crate) fn new(
        addresses: AddressGroup,
        options: TransportOptions,
        factory: Arc<dyn TransportFactory>,
        runtime: GrpcRuntime,
        backoff: ExponentialBackoff,
        callback: Arc<dyn SubchannelCallback>,
    ) -> Arc<Self> {
        let id = NEXT_SUBCHANNEL_ID.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(subchannel = id, %addresses, "subchannel created");
        Arc::new_cyclic(|weak_self| Self {
            id,
            options,
            factory,
            runtime,
            callback,
            weak_self: weak_self.clone(),
            inner: Mutex::new(Inner {
                addresses,
                address_index: 0,
                state: SubchannelState::new(ConnectivityState::Idle),
                backoff,
                connect_started: Instant::now(),
                reconnect_task: None,
                reconnect_generation: 0,
                pending: None,
                active: None,
                transports: HashMap::new(),
                in_use: InUseStateAggregator::new(),
                shutdown_status: None,
                next_transport_id: 0,
            }),
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.inner.lock().state.connectivity_state
    }

    pub(crate) fn addresses(&self) -> AddressGroup {
        self.inner.lock().addresses.clone()
    }

    // Runs `f` under the lock, then performs the transport calls it asked for
    // and drains the work the callback queued.
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner, &mut Vec<Action>) -> R) -> R {
        let mut actions = Vec::new();
        let result = {
            let mut inner = self.inner.lock();
            f(&mut inner, &mut actions)
        };
        for action in actions {
            match action {
                Action::Start(id, transport) => transport.start(Box::new(SubchannelTransportListener {
                    subchannel: self.weak_self.clone(),
                    transport_id: id,
                })),
                Action::Shutdown(transport, status) => transport.shutdown(status),
                Action::ShutdownNow(transport, status) => transport.shutdown_now(status),
            }
        }
        self.callback.drain();
        result
    }

    /// Returns the Ready transport, if there is one.  Otherwise starts
    /// connecting if the subchannel is Idle and returns None.
    pub(crate) fn obtain_active_transport(&self) -> Option<Arc<dyn ManagedTransport>> {
        self.with_inner(|inner, actions| {
            if let Some((_, transport)) = &inner.active {
                return Some(transport.clone());
            }
            if inner.state.connectivity_state == ConnectivityState::Idle {
                self.goto_state(inner, SubchannelState::new(ConnectivityState::Connecting));
                self.start_new_transport(inner, actions);
            }
            None
        })
    }

    fn start_new_transport(&self, inner: &mut Inner, actions: &mut Vec<Action>) {
        if inner.address_index == 0 {
            inner.connect_started = Instant::now();
        }
        let Some(address) = inner.addresses.addresses.get(inner.address_index) else {
            inner.address_index = 0;
            self.schedule_backoff(inner, Status::unavailable("subchannel has no addresses"));
            return;
        };
        tracing::debug!(subchannel = self.id, %address, "creating transport");
        let transport = self.factory.new_transport(address, &self.options);
        let id = inner.next_transport_id;
        inner.next_transport_id += 1;
        inner.pending = Some((id, transport.clone()));
        inner.transports.insert(id, transport.clone());
        actions.push(Action::Start(id, transport));
    }

    fn schedule_backoff(&self, inner: &mut Inner, status: Status) {
        self.goto_state(inner, SubchannelState::failure(status.clone()));
        let delay = inner
            .backoff
            .next_delay()
            .saturating_sub(inner.connect_started.elapsed());
        tracing::debug!(subchannel = self.id, ?delay, %status, "connection failed, backing off");
        inner.reconnect_generation += 1;
        let generation = inner.reconnect_generation;
        let subchannel = self.weak_self.clone();
        let handle = schedule(&self.runtime, delay, move || {
            if let Some(subchannel) = subchannel.upgrade() {
                subchannel.end_of_backoff(generation);
            }
        });
        inner.reconnect_task = Some((generation, handle));
    }

    fn end_of_backoff(&self, generation: u64) {
        self.with_inner(|inner, actions| {
            match &inner.reconnect_task {
                Some((g, _)) if *g == generation => inner.reconnect_task = None,
                _ => return,
            }
            if inner.state.connectivity_state == ConnectivityState::Shutdown {
                return;
            }
            self.goto_state(inner, SubchannelState::new(ConnectivityState::Connecting));
            self.start_new_transport(inner, actions);
        });
    }

    fn cancel_reconnect_task(inner: &mut Inner) {
        if let Some((_, handle)) = inner.reconnect_task.take() {
            handle.abort();
        }
    }

    /// Skips the remaining backoff and reconnects now if the subchannel is in
    /// TransientFailure.
    pub(crate) fn reset_connect_backoff(&self) {
        self.with_inner(|inner, actions| {
            if inner.state.connectivity_state != ConnectivityState::TransientFailure {
                return;
            }
            Self::cancel_reconnect_task(inner);
            tracing::debug!(subchannel = self.id, "backoff interrupted");
            self.goto_state(inner, SubchannelState::new(ConnectivityState::Connecting));
            self.start_new_transport(inner, actions);
        });
    }

    /// Replaces the address group.  A connection (or connection attempt) to an
    /// address that is still in the new group is kept; otherwise it is closed.
    pub(crate) fn update_addresses(&self, addresses: AddressGroup) {
        self.with_inner(|inner, actions| {
            let previous = std::mem::replace(&mut inner.addresses, addresses);
            let state = inner.state.connectivity_state;
            if state != ConnectivityState::Ready && state != ConnectivityState::Connecting {
                inner.address_index = 0;
                return;
            }
            let current = previous.addresses.get(inner.address_index);
            let new_index =
                current.and_then(|a| inner.addresses.addresses.iter().position(|b| a == b));
            if let Some(index) = new_index {
                inner.address_index = index;
                return;
            }
            let dropped = if state == ConnectivityState::Ready {
                let dropped = inner.active.take();
                inner.address_index = 0;
                self.goto_state(inner, SubchannelState::new(ConnectivityState::Idle));
                dropped
            } else {
                let dropped = inner.pending.take();
                inner.address_index = 0;
                self.start_new_transport(inner, actions);
                dropped
            };
            if let Some((_, transport)) = dropped {
                actions.push(Action::Shutdown(
                    transport,
                    Status::unavailable("InternalSubchannel closed transport due to address change"),
                ));
            }
        });
    }

    /// Shuts the subchannel down.  Its transports are shut down gracefully;
    /// it terminates once all of them have terminated.
    pub(crate) fn shutdown(&self, status: Status) {
        self.with_inner(|inner, actions| {
            if inner.state.connectivity_state == ConnectivityState::Shutdown {
                return;
            }
            tracing::debug!(subchannel = self.id, %status, "subchannel shutdown");
            inner.shutdown_status = Some(status.clone());
            self.goto_state(inner, SubchannelState::new(ConnectivityState::Shutdown));
            for (_, transport) in inner.active.take().into_iter().chain(inner.pending.take()) {
                actions.push(Action::Shutdown(transport, status.clone()));
            }
            inner.address_index = 0;
            if inner.transports.is_empty() {
                self.handle_termination();
            }
            Self::cancel_reconnect_task(inner);
        });
    }

    /// Shuts the subchannel down and forcefully closes all of its transports.
    pub(crate) fn shutdown_now(&self, status: Status) {
        self.shutdown(status.clone());
        self.with_inner(|inner, actions| {
            for transport in inner.transports.values() {
                actions.push(Action::ShutdownNow(transport.clone(), status.clone()));
            }
        });
    }

    fn handle_termination(&self) {
        tracing::debug!(subchannel = self.id, "subchannel terminated");
        self.callback.on_terminated();
    }

    // Notifies only actual changes.  Shutdown is never left.
    fn goto_state(&self, inner: &mut Inner, state: SubchannelState) {
        let current = inner.state.connectivity_state;
        if current == state.connectivity_state {
            return;
        }
        if current == ConnectivityState::Shutdown {
            tracing::error!(
                subchannel = self.id,
                "cannot transition out of Shutdown to {}",
                state.connectivity_state
            );
            return;
        }
        tracing::debug!(subchannel = self.id, "{} -> {}", current, state.connectivity_state);
        inner.state = state.clone();
        self.callback.on_state_change(state);
    }

    fn transport_ready(&self, id: u64) {
        self.with_inner(|inner, actions| {
            inner.backoff.reset();
            if let Some(status) = &inner.shutdown_status {
                // Became ready after the subchannel was shut down.
                if let Some(transport) = inner.transports.get(&id) {
                    actions.push(Action::Shutdown(transport.clone(), status.clone()));
                }
                return;
            }
            if inner.pending.as_ref().is_some_and(|(p, _)| *p == id) {
                inner.active = inner.pending.take();
                self.goto_state(inner, SubchannelState::new(ConnectivityState::Ready));
            }
        });
    }

    fn transport_shutdown(&self, id: u64, status: Status) {
        self.with_inner(|inner, actions| {
            if inner.state.connectivity_state == ConnectivityState::Shutdown {
                return;
            }
            if inner.active.as_ref().is_some_and(|(a, _)| *a == id) {
                tracing::debug!(subchannel = self.id, %status, "ready transport shut down");
                inner.active = None;
                inner.address_index = 0;
                self.goto_state(inner, SubchannelState::new(ConnectivityState::Idle));
            } else if inner.pending.as_ref().is_some_and(|(p, _)| *p == id) {
                inner.address_index += 1;
                if inner.address_index >= inner.addresses.addresses.len() {
                    inner.pending = None;
                    inner.address_index = 0;
                    self.schedule_backoff(inner, status);
                } else {
                    self.start_new_transport(inner, actions);
                }
            }
        });
    }

    fn transport_terminated(&self, id: u64) {
        self.transport_in_use(id, false);
        self.with_inner(|inner, _| {
            if inner.transports.remove(&id).is_none() {
                return;
            }
            if inner.active.as_ref().is_some_and(|(a, _)| *a == id) {
                inner.active = None;
            }
            if inner.pending.as_ref().is_some_and(|(p, _)| *p == id) {
                inner.pending = None;
            }
            if inner.state.connectivity_state == ConnectivityState::Shutdown
                && inner.transports.is_empty()
            {
                self.handle_termination();
            }
        });
    }

    fn transport_in_use(&self, id: u64, in_use: bool) {
        self.with_inner(|inner, _| {
            if let Some(transition) = inner.in_use.update_object_in_use(id, in_use) {
                self.callback
                    .on_in_use(transition == InUseTransition::InUse);
            }
        });
    }
}

impl Debug for InternalSubchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InternalSubchannel")
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

struct SubchannelTransportListener {
    subchannel: Weak<InternalSubchannel>,
    transport_id: u64,
}

impl TransportListener for SubchannelTransportListener {
    fn transport_ready(&self) {
        if let Some(subchannel) = self.subchannel.upgrade() {
            subchannel.transport_ready(self.transport_id);
        }
    }

    fn transport_shutdown(&self, status: Status) {
        if let Some(subchannel) = self.subchannel.upgrade() {
            subchannel.transport_shutdown(self.transport_id, status);
        }
    }

    fn transport_terminated(&self) {
        if let Some(subchannel) = self.subchannel.upgrade() {
            subchannel.transport_terminated(self.transport_id);
        }
    }

    fn transport_in_use(&self, in_use: bool) {
        if let Some(subchannel) = self.subchannel.upgrade() {
            subchannel.transport_in_use(self.transport_id, in_use);
        }
    }
}

#[derive(Default)]
struct ShutdownState {
    requested: bool,
    delayed: Option<BoxedTaskHandle>,
}

pub(crate) struct SubchannelImpl {
    internal: Arc<InternalSubchannel>,
    attributes: Attributes,
    shutdown: Mutex<ShutdownState>,
    // Set once the owning channel is terminating.  Shutdowns are no longer
    // delayed from then on.
    terminating: Arc<AtomicBool>,
    delay_shutdown: bool,
    runtime: GrpcRuntime,
}

impl SubchannelImpl {
    // Records the shutdown request.  Returns true if the internal subchannel
    // must be shut down right away.
    fn request_shutdown(&self) -> bool {
        let mut shutdown = self.shutdown.lock();
        let terminating = self.terminating.load(Ordering::SeqCst);
        if shutdown.requested {
            match shutdown.delayed.take() {
                // Terminating started after the delayed shutdown was
                // scheduled: expedite it.
                Some(handle) if terminating => handle.abort(),
                delayed => {
                    shutdown.delayed = delayed;
                    return false;
                }
            }
        } else {
            shutdown.requested = true;
        }
        if self.delay_shutdown && !terminating {
            let internal = self.internal.clone();
            shutdown.delayed = Some(schedule(
                &self.runtime,
                SUBCHANNEL_SHUTDOWN_DELAY,
                move || internal.shutdown(subchannel_shutdown_status()),
            ));
            return false;
        }
        true
    }

    fn shutdown(&self) {
        if self.request_shutdown() {
            self.internal.shutdown(shutdown_status());
        }
    }
}

impl Drop for SubchannelImpl {
    // The last handle may be released while some other component's lock is
    // held, so the shutdown itself runs as a separate task.
    fn drop(&mut self) {
        if self.request_shutdown() {
            let internal = self.internal.clone();
            self.runtime.spawn(Box::pin(async move {
                internal.shutdown(shutdown_status());
            }));
        }
    }
}

/// A logical connection to a server, created by a load balancer through its
/// [`Helper`](crate::client::load_balancing::Helper).
///
/// Subchannels start Idle and only connect when asked to, either by
/// [`request_connection`](Self::request_connection) or by a call being routed
/// to them.  Dropping the last clone of a subchannel shuts it down.
#[derive(Clone)]
pub struct Subchannel {
    inner: Arc<SubchannelImpl>,
}

impl Subchannel {
    pub(crate) fn new(
        internal: Arc<InternalSubchannel>,
        attributes: Attributes,
        terminating: Arc<AtomicBool>,
        delay_shutdown: bool,
        runtime: GrpcRuntime,
    ) -> Self {
        Self {
            inner: Arc::new(SubchannelImpl {
                internal,
                attributes,
                shutdown: Mutex::default(),
                terminating,
                delay_shutdown,
                runtime,
            }),
        }
    }

    pub(crate) fn from_impl(inner: Arc<SubchannelImpl>) -> Self {
        Self { inner }
    }

    pub(crate) fn downgrade(&self) -> Weak<SubchannelImpl> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn internal(&self) -> &Arc<InternalSubchannel> {
        &self.inner.internal
    }

    /// Starts connecting if the subchannel is Idle.
    pub fn request_connection(&self) {
        self.inner.internal.obtain_active_transport();
    }

    pub fn addresses(&self) -> AddressGroup {
        self.inner.internal.addresses()
    }

    pub fn attributes(&self) -> &Attributes {
        &self.inner.attributes
    }

    pub fn state(&self) -> ConnectivityState {
        self.inner.internal.state()
    }

    /// Shuts the subchannel down.  Unless its channel is terminating, the
    /// subchannel keeps serving calls for [`SUBCHANNEL_SHUTDOWN_DELAY`] first.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub(crate) fn obtain_active_transport(&self) -> Option<Arc<dyn ManagedTransport>> {
        self.inner.internal.obtain_active_transport()
    }
}

impl PartialEq for Subchannel {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Subchannel {}

impl Hash for Subchannel {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::ptr::hash(Arc::as_ptr(&self.inner), state);
    }
}

impl Display for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Subchannel({}, {})", self.inner.internal.id, self.addresses())
    }
}

impl Debug for Subchannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self}")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tonic::Status;

    use super::{InternalSubchannel, Subchannel, SubchannelCallback};
    use crate::attributes::Attributes;
    use crate::client::ConnectivityState;
    use crate::client::backoff::{BackoffConfig, ExponentialBackoff};
    use crate::client::load_balancing::SubchannelState;
    use crate::client::test_utils::{
        FakeTransportFactory, TestEvent, addresses, settle, test_runtime, wait_for,
    };
    use crate::client::transport::TransportOptions;

    #[derive(Debug)]
    enum Event {
        State(ConnectivityState),
        Terminated,
        InUse(bool),
    }

    struct TestCallback {
        tx: mpsc::UnboundedSender<Event>,
    }

    impl SubchannelCallback for TestCallback {
        fn on_state_change(&self, state: SubchannelState) {
            self.tx.send(Event::State(state.connectivity_state)).unwrap();
        }
        fn on_terminated(&self) {
            self.tx.send(Event::Terminated).unwrap();
        }
        fn on_in_use(&self, in_use: bool) {
            self.tx.send(Event::InUse(in_use)).unwrap();
        }
        fn drain(&self) {}
    }

    struct Fixture {
        subchannel: Arc<InternalSubchannel>,
        factory: Arc<FakeTransportFactory>,
        events: mpsc::UnboundedReceiver<Event>,
        transport_events: mpsc::UnboundedReceiver<TestEvent>,
    }

    fn setup(addrs: &[&str]) -> Fixture {
        let (tx_events, transport_events) = mpsc::unbounded_channel();
        let factory = FakeTransportFactory::new(tx_events);
        let (tx, events) = mpsc::unbounded_channel();
        let backoff = ExponentialBackoff::new(BackoffConfig {
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: Duration::from_secs(10),
        })
        .unwrap();
        let subchannel = InternalSubchannel::new(
            addresses(addrs),
            TransportOptions::default(),
            factory.clone(),
            test_runtime(),
            backoff,
            Arc::new(TestCallback { tx }),
        );
        Fixture {
            subchannel,
            factory,
            events,
            transport_events,
        }
    }

    fn next_state(events: &mut mpsc::UnboundedReceiver<Event>) -> ConnectivityState {
        match events.try_recv().unwrap() {
            Event::State(state) => state,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn connects_on_demand() {
        let mut f = setup(&["a"]);
        assert_eq!(f.subchannel.state(), ConnectivityState::Idle);
        assert_eq!(f.factory.transport_count(), 0);

        assert!(f.subchannel.obtain_active_transport().is_none());
        assert_eq!(next_state(&mut f.events), ConnectivityState::Connecting);
        assert_eq!(f.factory.transport_count(), 1);

        f.factory.transport(0).ready();
        assert_eq!(next_state(&mut f.events), ConnectivityState::Ready);
        assert!(f.subchannel.obtain_active_transport().is_some());
        // Asking again while connected creates nothing new.
        assert_eq!(f.factory.transport_count(), 1);
    }

    #[tokio::test]
    async fn tries_addresses_in_order() {
        let mut f = setup(&["a", "b"]);
        f.subchannel.obtain_active_transport();
        assert_eq!(next_state(&mut f.events), ConnectivityState::Connecting);
        f.factory.transport(0).fail(Status::unavailable("a down"));
        assert_eq!(f.factory.transport(1).address, "b");
        // Still connecting: no state change between addresses.
        assert!(f.events.try_recv().is_err());
        f.factory.transport(1).ready();
        assert_eq!(next_state(&mut f.events), ConnectivityState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn backs_off_after_every_address_failed() {
        let mut f = setup(&["a"]);
        f.subchannel.obtain_active_transport();
        assert_eq!(next_state(&mut f.events), ConnectivityState::Connecting);
        f.factory.transport(0).fail(Status::unavailable("a down"));
        assert_eq!(next_state(&mut f.events), ConnectivityState::TransientFailure);

        tokio::time::sleep(Duration::from_millis(900)).await;
        assert_eq!(f.factory.transport_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        settle().await;
        assert_eq!(next_state(&mut f.events), ConnectivityState::Connecting);
        assert_eq!(f.factory.transport_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_connect_backoff_reconnects_at_once() {
        let mut f = setup(&["a"]);
        f.subchannel.obtain_active_transport();
        f.factory.transport(0).fail(Status::unavailable("a down"));
        assert_eq!(next_state(&mut f.events), ConnectivityState::Connecting);
        assert_eq!(next_state(&mut f.events), ConnectivityState::TransientFailure);

        f.subchannel.reset_connect_backoff();
        assert_eq!(next_state(&mut f.events), ConnectivityState::Connecting);
        assert_eq!(f.factory.transport_count(), 2);

        // The cancelled timer must not start a third attempt.
        tokio::time::sleep(Duration::from_secs(5)).await;
        settle().await;
        assert_eq!(f.factory.transport_count(), 2);
    }

    #[tokio::test]
    async fn ready_transport_lost_goes_idle() {
        let mut f = setup(&["a"]);
        f.subchannel.obtain_active_transport();
        f.factory.transport(0).ready();
        f.factory.transport(0).fail(Status::unavailable("goaway"));
        assert_eq!(next_state(&mut f.events), ConnectivityState::Connecting);
        assert_eq!(next_state(&mut f.events), ConnectivityState::Ready);
        assert_eq!(next_state(&mut f.events), ConnectivityState::Idle);
        assert!(f.subchannel.obtain_active_transport().is_none());
        assert_eq!(f.factory.transport_count(), 2);
    }

    #[tokio::test]
    async fn address_update_keeps_live_connection() {
        let mut f = setup(&["a", "b"]);
        f.subchannel.obtain_active_transport();
        f.factory.transport(0).ready();
        f.subchannel.update_addresses(addresses(&["c", "a"]));
        assert!(f.subchannel.obtain_active_transport().is_some());

        f.subchannel.update_addresses(addresses(&["c"]));
        let (address, status) = wait_for(&mut f.transport_events, |e| match e {
            TestEvent::TransportShutdown(address, status) => Some((address, status)),
            _ => None,
        })
        .await;
        assert_eq!(address, "a");
        assert!(status.message().contains("address change"));
        assert_eq!(f.subchannel.state(), ConnectivityState::Idle);
        while f.events.try_recv().is_ok() {}
        f.subchannel.obtain_active_transport();
        assert_eq!(f.factory.last_transport().address, "c");
    }

    #[tokio::test]
    async fn terminates_after_transports_terminate() {
        let mut f = setup(&["a"]);
        f.subchannel.obtain_active_transport();
        f.factory.transport(0).ready();
        f.factory.transport(0).in_use(true);
        while f.events.try_recv().is_ok() {}

        f.subchannel.shutdown(Status::unavailable("bye"));
        // The fake transport terminates as soon as it is shut down.
        let mut saw_terminated = false;
        let mut saw_not_in_use = false;
        while let Ok(event) = f.events.try_recv() {
            match event {
                Event::Terminated => saw_terminated = true,
                Event::InUse(false) => saw_not_in_use = true,
                Event::State(state) => assert_eq!(state, ConnectivityState::Shutdown),
                other => panic!("unexpected event {other:?}"),
            }
        }
        assert!(saw_terminated);
        assert!(saw_not_in_use);

        // Shutdown is terminal.
        f.subchannel.reset_connect_backoff();
        assert!(f.subchannel.obtain_active_transport().is_none());
        assert_eq!(f.subchannel.state(), ConnectivityState::Shutdown);
        assert_eq!(f.factory.transport_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn handle_shutdown_is_delayed() {
        let mut f = setup(&["a"]);
        let terminating = Arc::new(AtomicBool::new(false));
        let subchannel = Subchannel::new(
            f.subchannel.clone(),
            Attributes::new(),
            terminating.clone(),
            true,
            test_runtime(),
        );
        subchannel.request_connection();
        f.factory.transport(0).ready();
        while f.events.try_recv().is_ok() {}

        subchannel.shutdown();
        assert_eq!(f.subchannel.state(), ConnectivityState::Ready);
        tokio::time::sleep(super::SUBCHANNEL_SHUTDOWN_DELAY + Duration::from_millis(1)).await;
        settle().await;
        assert_eq!(f.subchannel.state(), ConnectivityState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn terminating_channel_expedites_delayed_shutdown() {
        let f = setup(&["a"]);
        let terminating = Arc::new(AtomicBool::new(false));
        let subchannel = Subchannel::new(
            f.subchannel.clone(),
            Attributes::new(),
            terminating.clone(),
            true,
            test_runtime(),
        );
        subchannel.shutdown();
        assert_eq!(f.subchannel.state(), ConnectivityState::Idle);
        terminating.store(true, std::sync::atomic::Ordering::SeqCst);
        subchannel.shutdown();
        assert_eq!(f.subchannel.state(), ConnectivityState::Shutdown);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_last_handle_requests_shutdown() {
        let f = setup(&["a"]);
        let subchannel = Subchannel::new(
            f.subchannel.clone(),
            Attributes::new(),
            Arc::new(AtomicBool::new(true)),
            true,
            test_runtime(),
        );
        let clone = subchannel.clone();
        drop(subchannel);
        settle().await;
        assert_eq!(f.subchannel.state(), ConnectivityState::Idle);
        drop(clone);
        settle().await;
        assert_eq!(f.subchannel.state(), ConnectivityState::Shutdown);
    }
}
