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

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use super::{ChannelShared, ChannelState};
use crate::rt::{BoxedTaskHandle, schedule};

/// A one-shot timer whose task runs in the channel's serializer.
///
/// Aborting the runtime task is not enough to cancel it: the timer may have
/// fired and queued its task already.  The flag is checked inside the
/// serializer, so a timer cancelled from there never runs its task.
pub(super) struct ChannelTimer {
    cancelled: Arc<AtomicBool>,
    handle: BoxedTaskHandle,
}

impl ChannelTimer {
    pub(super) fn start(
        channel: &ChannelShared,
        delay: Duration,
        task: impl FnOnce(&Arc<ChannelShared>, &mut ChannelState) + Send + 'static,
    ) -> Self {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let weak = channel.weak_self.clone();
        let handle = schedule(&channel.runtime, delay, move || {
            let Some(channel) = weak.upgrade() else {
                return;
            };
            channel.run_serialized(move |channel, state| {
                if !flag.load(Ordering::SeqCst) {
                    task(channel, state);
                }
            });
        });
        Self { cancelled, handle }
    }

    pub(super) fn cancel(self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.handle.abort();
    }
}
