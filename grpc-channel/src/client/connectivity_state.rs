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

use crate::client::ConnectivityState;
use crate::rt::GrpcRuntime;

pub(crate) type StateCallback = Box<dyn FnOnce() + Send>;

struct Listener {
    source: ConnectivityState,
    callback: StateCallback,
}

/// Holds the channel's current connectivity state and the callbacks waiting
/// for it to change.
///
/// Not synchronized on its own: the channel keeps it behind a mutex and only
/// changes the state from inside its work serializer.  Callbacks are spawned
/// on the runtime rather than invoked inline, so they may call back into the
/// channel.
pub(crate) struct ConnectivityStateManager {
    state: ConnectivityState,
    listeners: Vec<Listener>,
    runtime: GrpcRuntime,
}

impl ConnectivityStateManager {
    pub(crate) fn new(runtime: GrpcRuntime) -> Self {
        Self {
            state: ConnectivityState::Idle,
            listeners: Vec::new(),
            runtime,
        }
    }

    pub(crate) fn state(&self) -> ConnectivityState {
        self.state
    }

    /// Registers `callback` to run once the state is no longer `source`.
    pub(crate) fn notify_when_state_changed(
        &mut self,
        source: ConnectivityState,
        callback: StateCallback,
    ) {
        if self.state != source {
            self.fire(callback);
        } else {
            self.listeners.push(Listener { source, callback });
        }
    }

    /// Moves to `new_state`.  Shutdown is terminal: once entered, further
    /// transitions are ignored.  Returns whether the state changed.
    pub(crate) fn goto_state(&mut self, new_state: ConnectivityState) -> bool {
        if self.state == new_state {
            return false;
        }
        if self.state == ConnectivityState::Shutdown {
            tracing::debug!(%new_state, "ignoring transition out of Shutdown");
            return false;
        }
        self.state = new_state;
        let listeners = std::mem::take(&mut self.listeners);
        for listener in listeners {
            // Every listener was registered against the previous state.
            debug_assert_ne!(listener.source, new_state);
            self.fire(listener.callback);
        }
        true
    }

    fn fire(&self, callback: StateCallback) {
        self.runtime.spawn(Box::pin(async move { callback() }));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::mpsc;

    use super::ConnectivityStateManager;
    use crate::client::ConnectivityState;
    use crate::rt::tokio::TokioRuntime;

    fn manager() -> ConnectivityStateManager {
        ConnectivityStateManager::new(Arc::new(TokioRuntime::try_current().unwrap()))
    }

    #[tokio::test]
    async fn listener_fires_once_on_change() {
        let mut csm = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        csm.notify_when_state_changed(
            ConnectivityState::Idle,
            Box::new(move || tx.send("changed").unwrap()),
        );
        assert!(csm.goto_state(ConnectivityState::Connecting));
        assert!(csm.goto_state(ConnectivityState::Ready));
        assert_eq!(rx.recv().await, Some("changed"));
        // The sender was consumed by the only invocation.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn listener_for_stale_state_fires_immediately() {
        let mut csm = manager();
        csm.goto_state(ConnectivityState::Ready);
        let (tx, mut rx) = mpsc::unbounded_channel();
        csm.notify_when_state_changed(ConnectivityState::Idle, Box::new(move || tx.send(()).unwrap()));
        assert_eq!(rx.recv().await, Some(()));
        assert_eq!(csm.state(), ConnectivityState::Ready);
    }

    #[tokio::test]
    async fn same_state_is_not_a_change() {
        let mut csm = manager();
        let (tx, mut rx) = mpsc::unbounded_channel();
        csm.notify_when_state_changed(ConnectivityState::Idle, Box::new(move || tx.send(()).unwrap()));
        assert!(!csm.goto_state(ConnectivityState::Idle));
        tokio::task::yield_now().await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn shutdown_is_terminal() {
        let mut csm = manager();
        assert!(csm.goto_state(ConnectivityState::Shutdown));
        assert!(!csm.goto_state(ConnectivityState::TransientFailure));
        assert!(!csm.goto_state(ConnectivityState::Idle));
        assert_eq!(csm.state(), ConnectivityState::Shutdown);
    }
}
