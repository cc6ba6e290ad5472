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

//! Transparent retries of calls that failed before receiving a response.
//!
//! Every call made while retries are enabled registers itself with the
//! channel's [`UncommittedRetryRegistry`] until it commits to an attempt.  The
//! registry holds off the buffer's shutdown until all uncommitted calls are
//! done, and cancels them on a forced shutdown.

use std::collections::{HashMap, HashSet};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::watch;
use tokio_stream::{Stream, StreamExt};
use tonic::{Code, Status, async_trait};

use crate::client::CallOptions;
use crate::client::delayed_transport::BufferShutdown;
use crate::rt::GrpcRuntime;
use crate::service::{Request, RequestStream, Response, error_response};

/// How a method's calls are retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// The total number of attempts, including the first.  1 disables
    /// retries.
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Only failures with these codes are retried.
    pub retryable_status_codes: HashSet<Code>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retryable_status_codes: HashSet::new(),
        }
    }
}

impl RetryPolicy {
    // The backoff before attempt `attempt + 1`, randomized over
    // [0, min(initial * multiplier^(attempt - 1), max)].
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let cap = (self.initial_backoff.as_secs_f64() * exp).min(self.max_backoff.as_secs_f64());
        Duration::try_from_secs_f64(cap.max(0.0) * rand::rng().random::<f64>())
            .unwrap_or(self.max_backoff)
    }
}

/// Chooses the retry policy for each call.
pub trait RetryPolicyProvider: Send + Sync {
    fn policy(&self, method: &str) -> RetryPolicy;
}

/// Never retries.
#[derive(Debug, Default)]
pub struct DefaultRetryPolicyProvider;

impl RetryPolicyProvider for DefaultRetryPolicyProvider {
    fn policy(&self, _method: &str) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Applies the same policy to every method.
impl RetryPolicyProvider for RetryPolicy {
    fn policy(&self, _method: &str) -> RetryPolicy {
        self.clone()
    }
}

/// A call that has not committed to an attempt yet.
pub(crate) trait RetriableStream: Send + Sync {
    fn cancel(&self, status: Status);
}

#[derive(Default)]
struct RegistryInner {
    streams: HashMap<u64, Arc<dyn RetriableStream>>,
    next_id: u64,
    shutdown_status: Option<Status>,
}

/// Tracks uncommitted calls so that the buffer is only shut down once none
/// of them can start another attempt.
pub(crate) struct UncommittedRetryRegistry {
    inner: Mutex<RegistryInner>,
    buffer: Arc<dyn BufferShutdown>,
}

impl UncommittedRetryRegistry {
    pub(crate) fn new(buffer: Arc<dyn BufferShutdown>) -> Self {
        Self {
            inner: Mutex::default(),
            buffer,
        }
    }

    /// Registers `stream`, or returns the shutdown status if shutdown has
    /// started.
    pub(crate) fn add(&self, stream: Arc<dyn RetriableStream>) -> Result<u64, Status> {
        let mut inner = self.inner.lock();
        if let Some(status) = &inner.shutdown_status {
            return Err(status.clone());
        }
        let id = inner.next_id;
        inner.next_id += 1;
        inner.streams.insert(id, stream);
        Ok(id)
    }

    pub(crate) fn remove(&self, id: u64) {
        let shutdown_status = {
            let mut inner = self.inner.lock();
            inner.streams.remove(&id);
            if !inner.streams.is_empty() {
                return;
            }
            inner.shutdown_status.clone()
        };
        if let Some(status) = shutdown_status {
            self.buffer.shutdown(status);
        }
    }

    pub(crate) fn on_shutdown(&self, status: Status) {
        let shutdown_buffer = {
            let mut inner = self.inner.lock();
            if inner.shutdown_status.is_some() {
                return;
            }
            inner.shutdown_status = Some(status.clone());
            inner.streams.is_empty()
        };
        if shutdown_buffer {
            self.buffer.shutdown(status);
        }
    }

    pub(crate) fn on_shutdown_now(&self, status: Status) {
        self.on_shutdown(status.clone());
        let streams: Vec<_> = self.inner.lock().streams.values().cloned().collect();
        for stream in streams {
            stream.cancel(status.clone());
        }
        self.buffer.shutdown_now(status);
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.lock().streams.len()
    }
}

/// Makes one attempt of a call: waits for a transport, then calls it.
#[async_trait]
pub(crate) trait CallAttempt: Send + Sync {
    async fn attempt(&self, method: &str, request: Request, options: &CallOptions) -> Response;
}

struct CancelHandle {
    tx: watch::Sender<Option<Status>>,
}

impl RetriableStream for CancelHandle {
    fn cancel(&self, status: Status) {
        self.tx.send_replace(Some(status));
    }
}

struct Registration<'a> {
    registry: &'a UncommittedRetryRegistry,
    id: u64,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
    }
}

async fn cancelled(rx: &mut watch::Receiver<Option<Status>>) -> Status {
    loop {
        if let Some(status) = rx.borrow_and_update().clone() {
            return status;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

// Request messages seen so far, kept so that a retry can send them again.
struct ReplayBuffer {
    messages: Vec<Bytes>,
    source: RequestStream,
    done: bool,
}

struct AttemptStream {
    buffer: Arc<Mutex<ReplayBuffer>>,
    position: usize,
}

impl Stream for AttemptStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Bytes>> {
        let buffer = self.buffer.clone();
        let mut buffer = buffer.lock();
        if let Some(message) = buffer.messages.get(self.position) {
            let message = message.clone();
            self.position += 1;
            return Poll::Ready(Some(message));
        }
        if buffer.done {
            return Poll::Ready(None);
        }
        match buffer.source.as_mut().poll_next(cx) {
            Poll::Ready(Some(message)) => {
                buffer.messages.push(message.clone());
                self.position += 1;
                Poll::Ready(Some(message))
            }
            Poll::Ready(None) => {
                buffer.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Runs a call with retries under `policy`.
///
/// The call stays registered in `registry` until it commits: on its first
/// response message, on a failure that is not retried, or when its last
/// attempt starts responding.
pub(crate) async fn retriable_call(
    attempts: &dyn CallAttempt,
    registry: &UncommittedRetryRegistry,
    runtime: &GrpcRuntime,
    policy: RetryPolicy,
    method: String,
    request: Request,
    options: CallOptions,
) -> Response {
    let (tx, mut cancel_rx) = watch::channel(None);
    let id = match registry.add(Arc::new(CancelHandle { tx })) {
        Ok(id) => id,
        Err(status) => return error_response(status),
    };
    let registration = Registration { registry, id };

    if policy.max_attempts <= 1 {
        let response = tokio::select! {
            response = attempts.attempt(&method, request, &options) => response,
            status = cancelled(&mut cancel_rx) => return error_response(status),
        };
        drop(registration);
        return response;
    }

    let (metadata, _, source) = request.into_parts();
    let buffer = Arc::new(Mutex::new(ReplayBuffer {
        messages: Vec::new(),
        source,
        done: false,
    }));
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut request = Request::new(Box::pin(AttemptStream {
            buffer: buffer.clone(),
            position: 0,
        }) as RequestStream);
        *request.metadata_mut() = metadata.clone();

        let (response, first) = tokio::select! {
            response = async {
                let response = attempts.attempt(&method, request, &options).await;
                let (metadata, mut stream, extensions) = response.into_parts();
                let first = stream.next().await;
                ((metadata, stream, extensions), first)
            } => response,
            status = cancelled(&mut cancel_rx) => return error_response(status),
        };

        let retry = attempt < policy.max_attempts
            && matches!(&first, Some(Err(status)) if policy.retryable_status_codes.contains(&status.code()));
        if !retry {
            drop(registration);
            let (metadata, stream, extensions) = response;
            let stream = tokio_stream::iter(first).chain(stream);
            return Response::from_parts(metadata, Box::pin(stream), extensions);
        }

        let delay = policy.backoff(attempt);
        tracing::debug!(%method, attempt, ?delay, "retrying call");
        tokio::select! {
            _ = runtime.sleep(delay) => {}
            status = cancelled(&mut cancel_rx) => return error_response(status),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;
    use tokio_stream::StreamExt;
    use tonic::{Code, Status, async_trait};

    use super::{
        CallAttempt, RetriableStream, RetryPolicy, UncommittedRetryRegistry, retriable_call,
    };
    use crate::client::CallOptions;
    use crate::client::delayed_transport::BufferShutdown;
    use crate::client::test_utils::{settle, test_runtime};
    use crate::service::{Request, Response, error_response, request_from_messages};

    #[derive(Debug, PartialEq)]
    enum BufferEvent {
        Shutdown(String),
        ShutdownNow(String),
    }

    struct TestBuffer {
        tx: mpsc::UnboundedSender<BufferEvent>,
    }

    impl BufferShutdown for TestBuffer {
        fn shutdown(&self, status: Status) {
            self.tx
                .send(BufferEvent::Shutdown(status.message().to_string()))
                .unwrap();
        }
        fn shutdown_now(&self, status: Status) {
            self.tx
                .send(BufferEvent::ShutdownNow(status.message().to_string()))
                .unwrap();
        }
    }

    struct NopStream;

    impl RetriableStream for NopStream {
        fn cancel(&self, _status: Status) {}
    }

    fn registry() -> (Arc<UncommittedRetryRegistry>, mpsc::UnboundedReceiver<BufferEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(UncommittedRetryRegistry::new(Arc::new(TestBuffer { tx }))),
            rx,
        )
    }

    #[test]
    fn shutdown_waits_for_uncommitted_streams() {
        let (registry, mut rx) = registry();
        let a = registry.add(Arc::new(NopStream)).unwrap();
        let b = registry.add(Arc::new(NopStream)).unwrap();

        registry.on_shutdown(Status::unavailable("Channel shutdown invoked"));
        assert!(rx.try_recv().is_err());
        let err = registry.add(Arc::new(NopStream)).unwrap_err();
        assert_eq!(err.message(), "Channel shutdown invoked");

        registry.remove(a);
        assert!(rx.try_recv().is_err());
        registry.remove(b);
        assert_eq!(
            rx.try_recv().unwrap(),
            BufferEvent::Shutdown("Channel shutdown invoked".to_string())
        );
    }

    #[test]
    fn shutdown_with_no_streams_is_immediate_and_idempotent() {
        let (registry, mut rx) = registry();
        registry.on_shutdown(Status::unavailable("first"));
        registry.on_shutdown(Status::unavailable("second"));
        assert_eq!(rx.try_recv().unwrap(), BufferEvent::Shutdown("first".to_string()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn shutdown_now_cancels_streams() {
        struct Recording(Mutex<Option<Status>>);
        impl RetriableStream for Recording {
            fn cancel(&self, status: Status) {
                *self.0.lock() = Some(status);
            }
        }
        let (registry, mut rx) = registry();
        let stream = Arc::new(Recording(Mutex::new(None)));
        registry.add(stream.clone()).unwrap();

        registry.on_shutdown_now(Status::unavailable("Channel shutdownNow invoked"));
        assert_eq!(
            stream.0.lock().as_ref().unwrap().message(),
            "Channel shutdownNow invoked"
        );
        assert_eq!(
            rx.try_recv().unwrap(),
            BufferEvent::ShutdownNow("Channel shutdownNow invoked".to_string())
        );
    }

    // Fails attempts with the scripted statuses, then succeeds.  Records the
    // messages each attempt sent.
    struct ScriptedAttempts {
        failures: Mutex<VecDeque<Status>>,
        seen: Mutex<Vec<Vec<Bytes>>>,
    }

    impl ScriptedAttempts {
        fn new(failures: Vec<Status>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                seen: Mutex::default(),
            }
        }
    }

    #[async_trait]
    impl CallAttempt for ScriptedAttempts {
        async fn attempt(&self, _method: &str, request: Request, _options: &CallOptions) -> Response {
            let messages: Vec<Bytes> = request.into_inner().collect().await;
            self.seen.lock().push(messages);
            let failure = self.failures.lock().pop_front();
            match failure {
                Some(status) => error_response(status),
                None => Response::new(Box::pin(tokio_stream::once(Ok(Bytes::from("ok"))))),
            }
        }
    }

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            retryable_status_codes: [Code::Unavailable].into_iter().collect(),
        }
    }

    #[test]
    fn backoff_stays_within_max() {
        let policy = policy(5);
        for attempt in 1..10 {
            assert!(policy.backoff(attempt) <= Duration::from_secs(1));
        }
    }

    #[test]
    fn huge_backoff_does_not_overflow() {
        let policy = RetryPolicy {
            initial_backoff: Duration::MAX,
            max_backoff: Duration::MAX,
            backoff_multiplier: 10.0,
            ..policy(5)
        };
        for attempt in 1..5 {
            assert!(policy.backoff(attempt) <= Duration::MAX);
        }
    }

    fn request() -> Request {
        request_from_messages(vec![Bytes::from("m1"), Bytes::from("m2")])
    }

    async fn first_item(response: Response) -> Result<Bytes, Status> {
        response.into_inner().next().await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn retries_replay_the_request() {
        let (registry, _rx) = registry();
        let attempts = ScriptedAttempts::new(vec![
            Status::unavailable("try again"),
            Status::unavailable("try again"),
        ]);
        let response = retriable_call(
            &attempts,
            &registry,
            &test_runtime(),
            policy(3),
            "/svc/M".to_string(),
            request(),
            CallOptions::default(),
        )
        .await;
        assert_eq!(first_item(response).await.unwrap(), Bytes::from("ok"));
        let seen = attempts.seen.lock();
        assert_eq!(seen.len(), 3);
        for messages in seen.iter() {
            assert_eq!(messages, &vec![Bytes::from("m1"), Bytes::from("m2")]);
        }
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_failure_commits() {
        let (registry, _rx) = registry();
        let attempts = ScriptedAttempts::new(vec![Status::permission_denied("no")]);
        let response = retriable_call(
            &attempts,
            &registry,
            &test_runtime(),
            policy(3),
            "/svc/M".to_string(),
            request(),
            CallOptions::default(),
        )
        .await;
        assert_eq!(first_item(response).await.unwrap_err().code(), Code::PermissionDenied);
        assert_eq!(attempts.seen.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_attempt_failure_is_returned() {
        let (registry, _rx) = registry();
        let attempts = ScriptedAttempts::new(vec![
            Status::unavailable("1"),
            Status::unavailable("2"),
        ]);
        let response = retriable_call(
            &attempts,
            &registry,
            &test_runtime(),
            policy(2),
            "/svc/M".to_string(),
            request(),
            CallOptions::default(),
        )
        .await;
        assert_eq!(first_item(response).await.unwrap_err().message(), "2");
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_now_cancels_call_in_backoff() {
        let (registry, _rx) = registry();
        let attempts = Arc::new(ScriptedAttempts::new(vec![Status::unavailable("down")]));
        let mut policy = policy(5);
        policy.initial_backoff = Duration::from_secs(100);
        policy.max_backoff = Duration::from_secs(100);
        let (r, a) = (registry.clone(), attempts.clone());
        let call = tokio::spawn(async move {
            let response = retriable_call(
                a.as_ref(),
                &r,
                &test_runtime(),
                policy,
                "/svc/M".to_string(),
                request(),
                CallOptions::default(),
            )
            .await;
            first_item(response).await
        });
        while attempts.seen.lock().is_empty() {
            settle().await;
        }
        assert_eq!(registry.len(), 1);

        registry.on_shutdown_now(Status::unavailable("Channel shutdownNow invoked"));
        let err = call.await.unwrap().unwrap_err();
        assert_eq!(err.message(), "Channel shutdownNow invoked");
        assert_eq!(attempts.seen.lock().len(), 1);
        assert_eq!(registry.len(), 0);
    }

    #[tokio::test]
    async fn single_attempt_registers_until_response() {
        let (registry, mut rx) = registry();
        let attempts = ScriptedAttempts::new(vec![]);
        registry.on_shutdown(Status::unavailable("Channel shutdown invoked"));
        let response = retriable_call(
            &attempts,
            &registry,
            &test_runtime(),
            RetryPolicy::default(),
            "/svc/M".to_string(),
            request(),
            CallOptions::default(),
        )
        .await;
        // Registration is refused once shutdown started.
        assert_eq!(
            first_item(response).await.unwrap_err().message(),
            "Channel shutdown invoked"
        );
        assert!(attempts.seen.lock().is_empty());
        assert!(matches!(rx.try_recv(), Ok(BufferEvent::Shutdown(_))));
    }
}
