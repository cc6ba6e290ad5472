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

//! Fakes shared by the channel tests.  Every fake reports what happens to it
//! as a [`TestEvent`] on an unbounded channel so tests can assert on the
//! sequence of interactions.

use std::collections::VecDeque;
use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::StreamExt;
use tonic::{Status, async_trait};

use crate::attributes::Attributes;
use crate::client::ConnectivityState;
use crate::client::load_balancing::{Helper, LoadBalancer, LoadBalancerBuilder, SubchannelState};
use crate::client::name_resolution::{
    Address, AddressGroup, Resolver, ResolverBuilder, ResolverListener, ResolverOptions, Target,
};
use crate::client::transport::{ManagedTransport, TransportFactory, TransportListener, TransportOptions};
use crate::client::Subchannel;
use crate::rt::GrpcRuntime;
use crate::rt::tokio::TokioRuntime;
use crate::service::{Request, Response, Service, error_response};

#[derive(Debug)]
pub(crate) enum TestEvent {
    TransportStarted(String),
    TransportShutdown(String, Status),
    TransportShutdownNow(String),
    Call {
        address: String,
        method: String,
        messages: Vec<Bytes>,
    },
    FactoryClosed,
    ResolverBuilt(String),
    ResolverStarted,
    ResolverRefreshed,
    ResolverShutdown,
    LbBuilt,
    LbAddresses(Vec<AddressGroup>),
    LbError(Status),
    LbSubchannelState(ConnectivityState),
    LbShutdown,
}

pub(crate) type EventSender = mpsc::UnboundedSender<TestEvent>;
pub(crate) type EventReceiver = mpsc::UnboundedReceiver<TestEvent>;

pub(crate) fn test_runtime() -> GrpcRuntime {
    Arc::new(TokioRuntime::try_current().unwrap())
}

pub(crate) fn addresses(addrs: &[&str]) -> AddressGroup {
    AddressGroup::new(addrs.iter().map(|a| Address::tcp(*a)).collect())
}

/// Lets spawned work (listener notifications, timers that already fired) run
/// before the test continues.
pub(crate) async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

/// Drains events that are not interesting to the test until one matching `f`
/// arrives.
pub(crate) async fn wait_for<T>(rx: &mut EventReceiver, mut f: impl FnMut(TestEvent) -> Option<T>) -> T {
    loop {
        let event = rx.recv().await.unwrap();
        if let Some(v) = f(event) {
            return v;
        }
    }
}

/// A transport factory whose transports only change state when a test tells
/// them to.
pub(crate) struct FakeTransportFactory {
    tx: EventSender,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
    failures: Arc<Mutex<VecDeque<Status>>>,
}

impl FakeTransportFactory {
    pub(crate) fn new(tx: EventSender) -> Arc<Self> {
        Arc::new(Self {
            tx,
            transports: Mutex::default(),
            failures: Arc::default(),
        })
    }

    pub(crate) fn transport(&self, i: usize) -> Arc<FakeTransport> {
        self.transports.lock()[i].clone()
    }

    pub(crate) fn last_transport(&self) -> Arc<FakeTransport> {
        self.transports.lock().last().unwrap().clone()
    }

    pub(crate) fn transport_count(&self) -> usize {
        self.transports.lock().len()
    }

    /// Makes the next call on any transport fail with `status` before it
    /// produces a response message.
    pub(crate) fn fail_next_call(&self, status: Status) {
        self.failures.lock().push_back(status);
    }
}

impl TransportFactory for FakeTransportFactory {
    fn new_transport(
        &self,
        address: &Address,
        _options: &TransportOptions,
    ) -> Arc<dyn ManagedTransport> {
        let transport = Arc::new(FakeTransport {
            address: address.address.clone(),
            tx: self.tx.clone(),
            listener: Mutex::default(),
            shut_down: Mutex::default(),
            failures: self.failures.clone(),
            calls: AtomicUsize::new(0),
        });
        self.transports.lock().push(transport.clone());
        transport
    }

    fn close(&self) {
        let _ = self.tx.send(TestEvent::FactoryClosed);
    }
}

pub(crate) struct FakeTransport {
    pub(crate) address: String,
    tx: EventSender,
    listener: Mutex<Option<Arc<dyn TransportListener>>>,
    shut_down: Mutex<Option<Status>>,
    failures: Arc<Mutex<VecDeque<Status>>>,
    calls: AtomicUsize,
}

impl FakeTransport {
    fn listener(&self) -> Arc<dyn TransportListener> {
        self.listener.lock().clone().unwrap()
    }

    pub(crate) fn ready(&self) {
        self.listener().transport_ready();
    }

    /// Reports a failed connection attempt or a lost connection.
    pub(crate) fn fail(&self, status: Status) {
        let listener = self.listener();
        listener.transport_shutdown(status);
        listener.transport_terminated();
    }

    pub(crate) fn in_use(&self, in_use: bool) {
        self.listener().transport_in_use(in_use);
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn terminate(&self, status: Status) {
        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            listener.transport_shutdown(status);
            listener.transport_terminated();
        }
    }
}

#[async_trait]
impl Service for FakeTransport {
    async fn call(&self, method: String, request: Request) -> Response {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let messages: Vec<Bytes> = request.into_inner().collect().await;
        let _ = self.tx.send(TestEvent::Call {
            address: self.address.clone(),
            method,
            messages,
        });
        let failure = self.failures.lock().pop_front();
        match failure {
            Some(status) => error_response(status),
            None => Response::new(Box::pin(tokio_stream::once(Ok(Bytes::from(
                self.address.clone(),
            ))))),
        }
    }
}

impl ManagedTransport for FakeTransport {
    fn start(&self, listener: Box<dyn TransportListener>) {
        let _ = self.tx.send(TestEvent::TransportStarted(self.address.clone()));
        *self.listener.lock() = Some(Arc::from(listener));
        let pending = self.shut_down.lock().clone();
        if let Some(status) = pending {
            self.terminate(status);
        }
    }

    // Graceful shutdown completes at once: fake transports carry no streams.
    fn shutdown(&self, status: Status) {
        let _ = self
            .tx
            .send(TestEvent::TransportShutdown(self.address.clone(), status.clone()));
        {
            let mut shut_down = self.shut_down.lock();
            if shut_down.is_some() {
                return;
            }
            *shut_down = Some(status.clone());
        }
        self.terminate(status);
    }

    fn shutdown_now(&self, status: Status) {
        let _ = self
            .tx
            .send(TestEvent::TransportShutdownNow(self.address.clone()));
        self.shutdown(status);
    }
}

#[derive(Default)]
struct FakeResolverState {
    listener: Mutex<Option<Arc<dyn ResolverListener>>>,
    start_error: Mutex<Option<Status>>,
    panic_on_start: AtomicBool,
}

/// Builds resolvers for the `fake` scheme.  Each channel that resolves
/// through it is driven with the paired [`FakeResolverHandle`].
pub(crate) struct FakeResolverBuilder {
    tx: EventSender,
    state: Arc<FakeResolverState>,
}

impl FakeResolverBuilder {
    pub(crate) fn new(tx: EventSender) -> (Self, FakeResolverHandle) {
        let state = Arc::new(FakeResolverState::default());
        (
            Self {
                tx,
                state: state.clone(),
            },
            FakeResolverHandle { state },
        )
    }
}

impl ResolverBuilder for FakeResolverBuilder {
    fn build(&self, target: &Target, _options: &ResolverOptions) -> Option<Box<dyn Resolver>> {
        let _ = self.tx.send(TestEvent::ResolverBuilt(target.to_string()));
        Some(Box::new(FakeResolver {
            tx: self.tx.clone(),
            state: self.state.clone(),
            authority: target.path().trim_start_matches('/').to_string(),
        }))
    }

    fn scheme(&self) -> &str {
        "fake"
    }
}

struct FakeResolver {
    tx: EventSender,
    state: Arc<FakeResolverState>,
    authority: String,
}

impl Resolver for FakeResolver {
    fn start(&mut self, listener: Box<dyn ResolverListener>) -> Result<(), Status> {
        let _ = self.tx.send(TestEvent::ResolverStarted);
        if let Some(status) = self.state.start_error.lock().take() {
            return Err(status);
        }
        if self.state.panic_on_start.swap(false, Ordering::SeqCst) {
            panic!("resolver exploded on start");
        }
        *self.state.listener.lock() = Some(Arc::from(listener));
        Ok(())
    }

    fn refresh(&mut self) {
        let _ = self.tx.send(TestEvent::ResolverRefreshed);
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(TestEvent::ResolverShutdown);
        self.state.listener.lock().take();
    }

    fn service_authority(&self) -> String {
        self.authority.clone()
    }
}

#[derive(Clone)]
pub(crate) struct FakeResolverHandle {
    state: Arc<FakeResolverState>,
}

impl FakeResolverHandle {
    fn listener(&self) -> Arc<dyn ResolverListener> {
        self.state.listener.lock().clone().unwrap()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.state.listener.lock().is_some()
    }

    pub(crate) fn resolve(&self, groups: Vec<AddressGroup>) {
        self.listener().on_addresses(groups, Attributes::new());
    }

    pub(crate) fn fail(&self, status: Status) {
        self.listener().on_error(status);
    }

    /// Makes the next `start()` fail synchronously with `status`.
    pub(crate) fn fail_next_start(&self, status: Status) {
        *self.state.start_error.lock() = Some(status);
    }

    /// Makes the next `start()` panic.
    pub(crate) fn panic_on_next_start(&self) {
        self.state.panic_on_start.store(true, Ordering::SeqCst);
    }
}

/// A balancer that only reports what it is told.  Tests drive the channel
/// through the helper it was built with.
pub(crate) struct TestLbBuilder {
    tx: EventSender,
    helper: Arc<Mutex<Option<Arc<dyn Helper>>>>,
}

impl TestLbBuilder {
    pub(crate) fn new(tx: EventSender) -> (Self, TestLbHandle) {
        let helper: Arc<Mutex<Option<Arc<dyn Helper>>>> = Arc::default();
        (
            Self {
                tx,
                helper: helper.clone(),
            },
            TestLbHandle { helper },
        )
    }
}

impl LoadBalancerBuilder for TestLbBuilder {
    fn build(&self, helper: Arc<dyn Helper>) -> Box<dyn LoadBalancer> {
        let _ = self.tx.send(TestEvent::LbBuilt);
        *self.helper.lock() = Some(helper);
        Box::new(TestLb {
            tx: self.tx.clone(),
        })
    }

    fn name(&self) -> &'static str {
        "test_lb"
    }
}

struct TestLb {
    tx: EventSender,
}

impl LoadBalancer for TestLb {
    fn handle_resolved_address_groups(&mut self, groups: Vec<AddressGroup>, _attributes: Attributes) {
        let _ = self.tx.send(TestEvent::LbAddresses(groups));
    }

    fn handle_name_resolution_error(&mut self, status: Status) {
        let _ = self.tx.send(TestEvent::LbError(status));
    }

    fn handle_subchannel_state(&mut self, _subchannel: &Subchannel, state: &SubchannelState) {
        let _ = self
            .tx
            .send(TestEvent::LbSubchannelState(state.connectivity_state));
    }

    fn shutdown(&mut self) {
        let _ = self.tx.send(TestEvent::LbShutdown);
    }
}

#[derive(Clone)]
pub(crate) struct TestLbHandle {
    helper: Arc<Mutex<Option<Arc<dyn Helper>>>>,
}

impl TestLbHandle {
    /// The helper of the most recently built balancer.
    pub(crate) fn helper(&self) -> Arc<dyn Helper> {
        self.helper.lock().clone().unwrap()
    }
}

impl Debug for TestLbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestLbHandle").finish_non_exhaustive()
    }
}
