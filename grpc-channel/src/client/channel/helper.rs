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

//! The channel's side of its load balancer and resolver.

use std::sync::{Arc, OnceLock, Weak};

use tonic::Status;

use super::{ChannelShared, ChannelState, InUseObject, SubchannelConfig, shutdown_status};
use crate::attributes::Attributes;
use crate::client::load_balancing::{Helper, Picker, SubchannelState};
use crate::client::name_resolution::{AddressGroup, ResolverListener};
use crate::client::oob_channel::{OobChannel, WeakOobChannel};
use crate::client::subchannel::{InternalSubchannel, SubchannelCallback, SubchannelImpl};
use crate::client::transport::TransportOptions;
use crate::client::{ConnectivityState, Subchannel};
use crate::rt::GrpcRuntime;

/// The helper handed to one load balancer instance.  A new one is created
/// every time the channel leaves idle mode; requests from an older one are
/// ignored.
pub(super) struct LbHelper {
    channel: Weak<ChannelShared>,
    id: u64,
    authority: String,
    config: SubchannelConfig,
}

impl LbHelper {
    pub(super) fn new(channel: &ChannelShared, id: u64) -> Self {
        Self {
            channel: channel.weak_self.clone(),
            id,
            authority: channel.authority.clone(),
            config: channel.subchannel_config.clone(),
        }
    }

    fn run(&self, task: impl FnOnce(&Arc<ChannelShared>, &mut ChannelState) + Send + 'static) {
        if let Some(channel) = self.channel.upgrade() {
            channel.run_serialized(task);
        }
    }

    // The channel to register a new subchannel with, or None if it is gone
    // or has terminated.
    fn live_channel(&self) -> Option<Arc<ChannelShared>> {
        self.channel
            .upgrade()
            .filter(|channel| !channel.is_terminated())
    }

    fn new_internal_subchannel(
        &self,
        group: AddressGroup,
        options: TransportOptions,
        callback: Arc<dyn SubchannelCallback>,
    ) -> Arc<InternalSubchannel> {
        InternalSubchannel::new(
            group,
            options,
            self.config.factory.clone(),
            self.config.runtime.clone(),
            self.config.backoff.clone(),
            callback,
        )
    }
}

impl Helper for LbHelper {
    fn create_subchannel(&self, group: AddressGroup, attributes: Attributes) -> Subchannel {
        let events = Arc::new(SubchannelEvents {
            channel: self.channel.clone(),
            helper_id: self.id,
            target: OnceLock::new(),
        });
        let internal =
            self.new_internal_subchannel(group, self.config.options.clone(), events.clone());
        let subchannel = Subchannel::new(
            internal.clone(),
            attributes,
            self.config.terminating.clone(),
            true,
            self.config.runtime.clone(),
        );
        let _ = events.target.set(SubchannelRef {
            id: internal.id(),
            handle: subchannel.downgrade(),
        });
        let Some(channel) = self.live_channel() else {
            tracing::error!(subchannel = internal.id(), "subchannel created on a terminated channel");
            internal.shutdown(shutdown_status());
            return subchannel;
        };
        channel.run_serialized(move |channel, state| {
            // The balancer may still create subchannels until it is shut
            // down, after the buffer has terminated.
            if channel.is_terminating() {
                internal.shutdown(shutdown_status());
            }
            if !state.terminated {
                state.subchannels.insert(internal.id(), internal);
            }
        });
        subchannel
    }

    fn create_oob_channel(&self, group: AddressGroup, authority: String) -> OobChannel {
        let oob = OobChannel::new(
            authority.clone(),
            self.channel.clone(),
            self.config.runtime.clone(),
        );
        let events = Arc::new(OobEvents {
            channel: self.channel.clone(),
            oob: oob.downgrade(),
            oob_id: oob.id(),
            runtime: self.config.runtime.clone(),
        });
        let options = TransportOptions {
            authority,
            user_agent: self.config.options.user_agent.clone(),
        };
        let internal = self.new_internal_subchannel(group, options, events);
        oob.set_subchannel(Subchannel::new(
            internal,
            Attributes::new(),
            self.config.terminating.clone(),
            false,
            self.config.runtime.clone(),
        ));
        let Some(channel) = self.live_channel() else {
            tracing::error!(oob_channel = oob.id(), "oob channel created on a terminated channel");
            oob.shutdown();
            return oob;
        };
        let tracked = oob.clone();
        channel.run_serialized(move |channel, state| {
            if channel.is_terminating() {
                tracked.shutdown();
            }
            if !state.terminated {
                state.oob_channels.insert(tracked.id(), tracked);
            }
        });
        oob
    }

    fn update_balancing_state(&self, new_state: ConnectivityState, picker: Arc<dyn Picker>) {
        let helper_id = self.id;
        self.run(move |channel, state| {
            channel.handle_balancing_state(state, helper_id, new_state, picker)
        });
    }

    fn update_subchannel_addresses(&self, subchannel: &Subchannel, group: AddressGroup) {
        subchannel.internal().update_addresses(group);
    }

    fn update_oob_channel_addresses(&self, channel: &OobChannel, group: AddressGroup) {
        channel.update_addresses(group);
    }

    fn authority(&self) -> String {
        self.authority.clone()
    }

    fn run_serialized(&self, task: Box<dyn FnOnce() + Send>) {
        self.run(move |_, _| task());
    }
}

struct SubchannelRef {
    id: u64,
    handle: Weak<SubchannelImpl>,
}

// Funnels the events of a balancer's subchannel into the channel's
// serializer.
struct SubchannelEvents {
    channel: Weak<ChannelShared>,
    helper_id: u64,
    target: OnceLock<SubchannelRef>,
}

impl SubchannelEvents {
    fn execute_later(
        &self,
        task: impl FnOnce(&Arc<ChannelShared>, &mut ChannelState, &SubchannelRef) + Send + 'static,
    ) {
        let Some(channel) = self.channel.upgrade() else {
            return;
        };
        let Some(target) = self.target.get() else {
            return;
        };
        let target = SubchannelRef {
            id: target.id,
            handle: target.handle.clone(),
        };
        channel.execute_later(move |channel, state| task(channel, state, &target));
    }
}

impl SubchannelCallback for SubchannelEvents {
    fn on_state_change(&self, new_state: SubchannelState) {
        let helper_id = self.helper_id;
        self.execute_later(move |channel, state, target| {
            channel.handle_subchannel_state(state, helper_id, &target.handle, new_state)
        });
    }

    fn on_terminated(&self) {
        self.execute_later(|channel, state, target| {
            channel.handle_subchannel_terminated(state, target.id)
        });
    }

    fn on_in_use(&self, in_use: bool) {
        self.execute_later(move |channel, state, target| {
            channel.update_in_use(state, InUseObject::Subchannel(target.id), in_use)
        });
    }

    fn drain(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.drain();
        }
    }
}

// Events of an oob channel's subchannel.  They go through the parent's
// serializer as well: the oob channel's buffer must never be locked while a
// subchannel lock is held.  Once the parent is gone they run as separate
// tasks instead.
struct OobEvents {
    channel: Weak<ChannelShared>,
    oob: WeakOobChannel,
    oob_id: u64,
    runtime: GrpcRuntime,
}

impl SubchannelCallback for OobEvents {
    fn on_state_change(&self, new_state: SubchannelState) {
        let oob = self.oob.clone();
        let Some(channel) = self.channel.upgrade() else {
            self.runtime.spawn(Box::pin(async move {
                if let Some(oob) = oob.upgrade() {
                    oob.handle_subchannel_state_change(&new_state);
                }
            }));
            return;
        };
        channel.execute_later(move |channel, state| {
            if matches!(
                new_state.connectivity_state,
                ConnectivityState::TransientFailure | ConnectivityState::Idle
            ) {
                channel.refresh_and_reset_name_resolution(state);
            }
            if let Some(oob) = oob.upgrade() {
                oob.handle_subchannel_state_change(&new_state);
            }
        });
    }

    fn on_terminated(&self) {
        let oob = self.oob.clone();
        let oob_id = self.oob_id;
        let Some(channel) = self.channel.upgrade() else {
            if let Some(oob) = oob.upgrade() {
                oob.handle_subchannel_terminated();
            }
            return;
        };
        channel.execute_later(move |channel, state| {
            if let Some(oob) = state.oob_channels.remove(&oob_id).or_else(|| oob.upgrade()) {
                oob.handle_subchannel_terminated();
            }
            channel.maybe_terminate_channel(state);
        });
    }

    // Oob channels never keep the parent out of idle mode.
    fn on_in_use(&self, _in_use: bool) {}

    fn drain(&self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.drain();
        }
    }
}

/// Forwards resolver results into the channel's serializer, tagged with the
/// helper that was current when the resolver was started.
#[derive(Clone)]
pub(super) struct ChannelResolverListener {
    channel: Weak<ChannelShared>,
    helper_id: u64,
}

impl ChannelResolverListener {
    pub(super) fn new(channel: Weak<ChannelShared>, helper_id: u64) -> Self {
        Self { channel, helper_id }
    }

    fn run(&self, task: impl FnOnce(&Arc<ChannelShared>, &mut ChannelState) + Send + 'static) {
        if let Some(channel) = self.channel.upgrade() {
            channel.run_serialized(task);
        }
    }
}

impl ResolverListener for ChannelResolverListener {
    fn on_addresses(&self, groups: Vec<AddressGroup>, attributes: Attributes) {
        if groups.is_empty() {
            self.on_error(Status::unavailable("resolver returned an empty address list"));
            return;
        }
        let helper_id = self.helper_id;
        self.run(move |channel, state| {
            channel.handle_resolved_addresses(state, helper_id, groups, attributes)
        });
    }

    fn on_error(&self, status: Status) {
        let helper_id = self.helper_id;
        self.run(move |channel, state| channel.handle_resolution_error(state, helper_id, status));
    }
}
