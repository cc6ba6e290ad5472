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

use std::any::Any;
use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;

type Task<S> = Box<dyn FnOnce(&mut S) + Send>;
type PanicHandler<S> = Box<dyn Fn(&mut S, String) + Send + Sync>;

struct Queue<S> {
    tasks: VecDeque<Task<S>>,
    draining: bool,
}

/// A FIFO of work items that all operate on a single piece of state `S`.
///
/// Work is executed on whichever thread calls `drain()`, one item at a time.
/// At most one thread drains at once: a thread that finds a drain in progress
/// leaves its work in the queue for the current drainer and returns
/// immediately.  Work queued by a running task (including through a nested
/// `execute()`) is appended to the same queue and runs after the current task
/// returns, so tasks never re-enter each other.
///
/// A panic inside a task is caught, handed to the panic handler together with
/// the state, and draining continues with the next task.
pub(crate) struct WorkSerializer<S> {
    queue: Mutex<Queue<S>>,
    // Only ever locked by the thread that owns the drain, so this lock is
    // never contended.
    state: Mutex<S>,
    on_panic: PanicHandler<S>,
}

impl<S: Send> WorkSerializer<S> {
    pub(crate) fn new(state: S, on_panic: impl Fn(&mut S, String) + Send + Sync + 'static) -> Self {
        Self {
            queue: Mutex::new(Queue {
                tasks: VecDeque::new(),
                draining: false,
            }),
            state: Mutex::new(state),
            on_panic: Box::new(on_panic),
        }
    }

    /// Queues `task` without running it.  Pair with `drain()`.
    pub(crate) fn execute_later(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        self.queue.lock().tasks.push_back(Box::new(task));
    }

    /// Queues `task` and drains the queue.
    pub(crate) fn execute(&self, task: impl FnOnce(&mut S) + Send + 'static) {
        self.execute_later(task);
        self.drain();
    }

    /// Runs queued work on the calling thread until the queue is empty, unless
    /// another thread is already doing so.
    pub(crate) fn drain(&self) {
        {
            let mut queue = self.queue.lock();
            if queue.draining {
                return;
            }
            queue.draining = true;
        }
        loop {
            let task = {
                let mut queue = self.queue.lock();
                match queue.tasks.pop_front() {
                    Some(task) => task,
                    None => {
                        queue.draining = false;
                        return;
                    }
                }
            };
            let mut state = self.state.lock();
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| task(&mut state))) {
                let cause = panic_message(payload.as_ref());
                tracing::error!(%cause, "uncaught panic in serialized work");
                if catch_unwind(AssertUnwindSafe(|| (self.on_panic)(&mut state, cause))).is_err()
                {
                    tracing::error!("panic handler panicked");
                }
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
