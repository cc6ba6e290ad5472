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

//! The buffer that holds calls while the load balancer has no connection for
//! them.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::client::load_balancing::{PickArgs, PickResult, Picker};
use crate::client::transport::ManagedTransport;
use crate::rt::GrpcRuntime;
use crate::service::{Request, Response, Service};

/// A transport chosen for a call, plus the metadata the picker wants added.
pub(crate) struct PickedTransport {
    pub(crate) transport: Arc<dyn ManagedTransport>,
    pub(crate) metadata: MetadataMap,
}

pub(crate) enum PickOutcome {
    Ready(PickedTransport),
    Queue,
    Fail(Status),
}

/// Turns a picker's answer into what happens to the call.  A picked
/// subchannel that is not Ready keeps the call queued (and starts connecting
/// if it was Idle).
pub(crate) fn transport_from_pick(result: PickResult, wait_for_ready: bool) -> PickOutcome {
    match result {
        PickResult::Pick(pick) => match pick.subchannel.obtain_active_transport() {
            Some(transport) => PickOutcome::Ready(PickedTransport {
                transport,
                metadata: pick.metadata,
            }),
            None => PickOutcome::Queue,
        },
        PickResult::Queue => PickOutcome::Queue,
        PickResult::Fail(_) if wait_for_ready => PickOutcome::Queue,
        PickResult::Fail(status) | PickResult::Drop(status) => PickOutcome::Fail(status),
    }
}

/// Waits for `pick` to produce a transport, failing with DEADLINE_EXCEEDED
/// once `deadline` passes.
pub(crate) async fn pick_with_deadline<F>(
    runtime: &GrpcRuntime,
    deadline: Option<Instant>,
    pick: F,
) -> Result<PickedTransport, Status>
where
    F: Future<Output = Result<PickedTransport, Status>>,
{
    let Some(deadline) = deadline else {
        return pick.await;
    };
    let remaining = deadline.saturating_duration_since(Instant::now());
    let expired = || Status::deadline_exceeded("deadline exceeded while waiting for a connection");
    if remaining.is_zero() {
        return Err(expired());
    }
    tokio::select! {
        picked = pick => picked,
        _ = runtime.sleep(remaining) => Err(expired()),
    }
}

/// Starts the call on the picked transport, adding the picker's metadata to
/// the request.
pub(crate) async fn start_call(picked: PickedTransport, method: &str, mut request: Request) -> Response {
    if !picked.metadata.is_empty() {
        let mut headers = std::mem::take(request.metadata_mut()).into_headers();
        headers.extend(picked.metadata.into_headers());
        *request.metadata_mut() = MetadataMap::from_headers(headers);
    }
    picked.transport.call(method.to_string(), request).await
}

/// Receives the buffer's lifecycle events.  `in_use` and `terminated` are
/// called with the buffer's lock held and may only queue work, which `drain`
/// runs once the lock is released.
pub(crate) trait BufferListener: Send + Sync {
    fn in_use(&self, in_use: bool);
    fn terminated(&self);
    fn drain(&self);
}

/// What the uncommitted-retry registry needs from the buffer.
pub(crate) trait BufferShutdown: Send + Sync {
    fn shutdown(&self, status: Status);
    fn shutdown_now(&self, status: Status);
}

struct PendingCall {
    args: Arc<PickArgs>,
    tx: oneshot::Sender<Result<PickedTransport, Status>>,
}

#[derive(Default)]
struct Inner {
    // Ordered by arrival, so reprocessing is first-come first-served.
    pending: BTreeMap<u64, PendingCall>,
    next_id: u64,
    last_picker: Option<Arc<dyn Picker>>,
    picker_version: u64,
    shutdown_status: Option<Status>,
    terminated: bool,
}

/// Holds calls that could not be assigned a transport yet and re-picks them
/// whenever the load balancer publishes a new picker.
pub(crate) struct DelayedTransport {
    inner: Mutex<Inner>,
    listener: Arc<dyn BufferListener>,
}

impl DelayedTransport {
    pub(crate) fn new(listener: Arc<dyn BufferListener>) -> Self {
        Self {
            inner: Mutex::default(),
            listener,
        }
    }

    /// Waits until a picker assigns the call a Ready transport.  Fails if the
    /// picker fails the call or the buffer is shut down.  Dropping the
    /// returned future removes the call from the buffer.
    pub(crate) async fn pick(&self, args: PickArgs) -> Result<PickedTransport, Status> {
        let args = Arc::new(args);
        loop {
            let (picker, version) = {
                let inner = self.inner.lock();
                if let Some(status) = &inner.shutdown_status {
                    return Err(status.clone());
                }
                (inner.last_picker.clone(), inner.picker_version)
            };
            if let Some(picker) = picker {
                match transport_from_pick(picker.pick(&args), args.options.wait_for_ready) {
                    PickOutcome::Ready(picked) => return Ok(picked),
                    PickOutcome::Fail(status) => return Err(status),
                    PickOutcome::Queue => {}
                }
            }
            let (id, rx) = {
                let mut inner = self.inner.lock();
                if let Some(status) = &inner.shutdown_status {
                    return Err(status.clone());
                }
                // A new picker arrived while this one was picking.  It may
                // already have reprocessed the queue, so try it first.
                if inner.picker_version != version {
                    continue;
                }
                let id = inner.next_id;
                inner.next_id += 1;
                let (tx, rx) = oneshot::channel();
                inner.pending.insert(
                    id,
                    PendingCall {
                        args: args.clone(),
                        tx,
                    },
                );
                if inner.pending.len() == 1 {
                    self.listener.in_use(true);
                }
                (id, rx)
            };
            self.listener.drain();
            let _guard = RemoveOnDrop { buffer: self, id };
            return match rx.await {
                Ok(result) => result,
                Err(_) => Err(Status::unavailable("call buffer closed")),
            };
        }
    }

    /// Installs `picker` and re-picks every queued call with it.  With no
    /// picker, calls queue until the next one arrives.
    pub(crate) fn reprocess(&self, picker: Option<Arc<dyn Picker>>) {
        let to_process: Vec<(u64, Arc<PickArgs>)> = {
            let mut inner = self.inner.lock();
            inner.last_picker = picker.clone();
            inner.picker_version += 1;
            if picker.is_none() {
                return;
            }
            inner
                .pending
                .iter()
                .map(|(id, call)| (*id, call.args.clone()))
                .collect()
        };
        let Some(picker) = picker else {
            return;
        };
        if to_process.is_empty() {
            return;
        }
        let mut done = Vec::new();
        for (id, args) in to_process {
            match transport_from_pick(picker.pick(&args), args.options.wait_for_ready) {
                PickOutcome::Queue => {}
                PickOutcome::Ready(picked) => done.push((id, Ok(picked))),
                PickOutcome::Fail(status) => done.push((id, Err(status))),
            }
        }
        {
            let mut inner = self.inner.lock();
            let mut removed = false;
            for (id, result) in done {
                // Calls that went away in the meantime are skipped.
                if let Some(call) = inner.pending.remove(&id) {
                    removed = true;
                    let _ = call.tx.send(result);
                }
            }
            if removed {
                self.after_removal(&mut inner);
            }
        }
        self.listener.drain();
    }

    fn remove(&self, id: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.pending.remove(&id).is_none() {
                return;
            }
            self.after_removal(&mut inner);
        }
        self.listener.drain();
    }

    fn after_removal(&self, inner: &mut Inner) {
        if !inner.pending.is_empty() {
            return;
        }
        self.listener.in_use(false);
        self.maybe_terminate(inner);
    }

    fn maybe_terminate(&self, inner: &mut Inner) {
        if inner.shutdown_status.is_some() && inner.pending.is_empty() && !inner.terminated {
            inner.terminated = true;
            self.listener.terminated();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.lock().pending.len()
    }
}

impl BufferShutdown for DelayedTransport {
    /// Fails new calls with `status`.  Queued calls keep waiting for a
    /// picker; the buffer terminates once they are all gone.
    fn shutdown(&self, status: Status) {
        {
            let mut inner = self.inner.lock();
            if inner.shutdown_status.is_some() {
                return;
            }
            inner.shutdown_status = Some(status);
            self.maybe_terminate(&mut inner);
        }
        self.listener.drain();
    }

    /// Like `shutdown`, and also fails every queued call with `status`.
    fn shutdown_now(&self, status: Status) {
        self.shutdown(status.clone());
        {
            let mut inner = self.inner.lock();
            let pending = std::mem::take(&mut inner.pending);
            if !pending.is_empty() {
                for call in pending.into_values() {
                    let _ = call.tx.send(Err(status.clone()));
                }
                self.listener.in_use(false);
            }
            self.maybe_terminate(&mut inner);
        }
        self.listener.drain();
    }
}

struct RemoveOnDrop<'a> {
    buffer: &'a DelayedTransport,
    id: u64,
}

impl Drop for RemoveOnDrop<'_> {
    fn drop(&mut self) {
        self.buffer.remove(self.id);
    }
}
