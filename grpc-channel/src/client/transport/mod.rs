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

//! The boundary between the channel and the wire.
//!
//! A [`TransportFactory`] creates one [`ManagedTransport`] per connection
//! attempt.  The transport reports its lifecycle through the
//! [`TransportListener`] it is started with; subchannels use those events to
//! drive their connectivity state.

use std::sync::Arc;

use tonic::{Status, async_trait};

use crate::client::name_resolution::Address;
use crate::service::{Request, Response, Service, error_response};

/// Settings handed to every transport created by a channel.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct TransportOptions {
    /// The `:authority` to use for calls on this transport.
    pub authority: String,
    pub user_agent: Option<String>,
}

/// Creates transports for subchannels.
pub trait TransportFactory: Send + Sync {
    /// Creates a transport that will connect to `address` once started.
    fn new_transport(
        &self,
        address: &Address,
        options: &TransportOptions,
    ) -> Arc<dyn ManagedTransport>;

    /// Releases any resources held by the factory.  Called once, when the
    /// channel that owns it terminates.
    fn close(&self) {}
}

/// A single connection attempt and, if it succeeds, the connection itself.
///
/// Lifecycle events must be reported in order: at most one of
/// `transport_ready`, then `transport_shutdown`, then `transport_terminated`.
/// `shutdown` may be called before `start`; the transport must still report
/// shutdown and termination once started.
pub trait ManagedTransport: Service {
    /// Begins connecting.  Events are reported to `listener`, possibly from
    /// within this call.
    fn start(&self, listener: Box<dyn TransportListener>);

    /// Stops accepting new calls.  Existing calls run to completion, after
    /// which the transport terminates.
    fn shutdown(&self, status: Status);

    /// Like `shutdown`, but also fails all existing calls with `status`.
    fn shutdown_now(&self, status: Status);
}

/// Receives lifecycle events from a [`ManagedTransport`].
pub trait TransportListener: Send + Sync {
    /// The transport is connected and may carry calls.
    fn transport_ready(&self);

    /// The transport will not accept new calls.
    fn transport_shutdown(&self, status: Status);

    /// The transport has released all resources and will report nothing more.
    fn transport_terminated(&self);

    /// Whether the transport has calls in flight.
    fn transport_in_use(&self, in_use: bool);
}

/// The factory used when none is configured: every connection attempt fails.
pub(crate) struct UnsupportedTransportFactory;

impl TransportFactory for UnsupportedTransportFactory {
    fn new_transport(
        &self,
        address: &Address,
        _options: &TransportOptions,
    ) -> Arc<dyn ManagedTransport> {
        Arc::new(FailingTransport {
            status: Status::unavailable(format!(
                "no transport factory configured to connect to {address}"
            )),
        })
    }
}

struct FailingTransport {
    status: Status,
}

#[async_trait]
impl Service for FailingTransport {
    async fn call(&self, _method: String, _request: Request) -> Response {
        error_response(self.status.clone())
    }
}

impl ManagedTransport for FailingTransport {
    fn start(&self, listener: Box<dyn TransportListener>) {
        listener.transport_shutdown(self.status.clone());
        listener.transport_terminated();
    }

    fn shutdown(&self, _status: Status) {}

    fn shutdown_now(&self, _status: Status) {}
}
