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

//! Load balancing for gRPC.
//!
//! A [`LoadBalancer`] receives the resolver's address groups, creates
//! [`Subchannel`]s through its [`Helper`] and publishes [`Picker`]s that route
//! each call onto one of them.

use std::fmt::Debug;
use std::sync::Arc;

use tonic::Status;
use tonic::metadata::MetadataMap;

use crate::attributes::Attributes;
use crate::client::name_resolution::AddressGroup;
use crate::client::{CallOptions, ConnectivityState, OobChannel, Subchannel};

pub mod pick_first;
mod registry;

pub use registry::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};

/// An LB policy factory that produces LoadBalancer instances used by the
/// channel to manage connections and pick connections for RPCs.
pub trait LoadBalancerBuilder: Send + Sync {
    /// Builds a new load balancer bound to `helper`.  Called each time the
    /// channel leaves idle mode.
    fn build(&self, helper: Arc<dyn Helper>) -> Box<dyn LoadBalancer>;

    /// Reports the name of the LB Policy.
    fn name(&self) -> &'static str;
}

/// A load balancer instance.
///
/// All methods are called from the channel's work serializer, never
/// concurrently.  Calls into the [`Helper`] made from these methods are
/// queued and take effect after the method returns.
pub trait LoadBalancer: Send {
    /// Called when the resolver produces a new, non-empty set of address
    /// groups.
    fn handle_resolved_address_groups(&mut self, groups: Vec<AddressGroup>, attributes: Attributes);

    /// Called when the resolver reports an error.
    fn handle_name_resolution_error(&mut self, status: Status);

    /// Called when a subchannel created by this balancer changes state.
    fn handle_subchannel_state(&mut self, subchannel: &Subchannel, state: &SubchannelState);

    /// Releases everything the balancer holds, including its subchannels.
    fn shutdown(&mut self);
}

/// The channel's side of a load balancer.  May be called from any thread.
pub trait Helper: Send + Sync {
    /// Creates a subchannel in the Idle state for `group`.
    fn create_subchannel(&self, group: AddressGroup, attributes: Attributes) -> Subchannel;

    /// Creates an out-of-band channel for side-band calls (e.g. to a
    /// look-aside load balancer), connected to `group`.
    fn create_oob_channel(&self, group: AddressGroup, authority: String) -> OobChannel;

    /// Publishes a new picker.  Calls queued on the channel are re-picked with
    /// it.  Updates from a balancer that has since been shut down are ignored.
    fn update_balancing_state(&self, state: ConnectivityState, picker: Arc<dyn Picker>);

    /// Replaces the addresses of `subchannel` without dropping an existing
    /// connection to an address that is still present.
    fn update_subchannel_addresses(&self, subchannel: &Subchannel, group: AddressGroup);

    fn update_oob_channel_addresses(&self, channel: &OobChannel, group: AddressGroup);

    /// The authority of the channel.
    fn authority(&self) -> String;

    /// Runs `task` in the channel's work serializer.
    fn run_serialized(&self, task: Box<dyn FnOnce() + Send>);
}

/// Represents the current state of a Subchannel.
#[derive(Debug, Clone)]
pub struct SubchannelState {
    /// The connectivity state of the subchannel.  See [`Subchannel`] for a
    /// description of the various states and their valid transitions.
    pub connectivity_state: ConnectivityState,
    // Set if connectivity state is TransientFailure to describe the most recent
    // connection error.  None for any other connectivity_state value.
    pub last_connection_error: Option<Status>,
}

impl SubchannelState {
    pub(crate) fn new(connectivity_state: ConnectivityState) -> Self {
        Self {
            connectivity_state,
            last_connection_error: None,
        }
    }

    pub(crate) fn failure(status: Status) -> Self {
        Self {
            connectivity_state: ConnectivityState::TransientFailure,
            last_connection_error: Some(status),
        }
    }
}

/// The data a picker sees for each call.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PickArgs {
    /// The full method name, e.g. `/helloworld.Greeter/SayHello`.
    pub method: String,
    pub metadata: MetadataMap,
    pub options: CallOptions,
}

impl PickArgs {
    pub fn new(method: impl Into<String>, metadata: MetadataMap, options: CallOptions) -> Self {
        Self {
            method: method.into(),
            metadata,
            options,
        }
    }
}

/// A Picker is responsible for deciding what Subchannel to use for any given
/// request.  If pick() returns Queue, the channel will queue the RPC until a
/// new Picker is produced by the LoadBalancer, and will call pick() on the
/// new Picker for the request.
///
/// Pickers are always paired with a ConnectivityState which the channel will
/// expose to applications so they can predict what might happens when
/// performing RPCs:
///
/// If the ConnectivityState is Idle, the Picker should ensure connections are
/// initiated by the LoadBalancer that produced the Picker, and return a Queue
/// result so the request is attempted the next time a Picker is produced.
///
/// If the ConnectivityState is Connecting, the Picker should return a Queue
/// result and continue to wait for pending connections.
///
/// If the ConnectivityState is Ready, the Picker should return a Ready
/// Subchannel.
///
/// If the ConnectivityState is TransientFailure, the Picker should return a
/// Fail with a status that describes why connections are failing.
pub trait Picker: Send + Sync {
    /// Picks a connection to use for the request.
    ///
    /// This function should not block.  If the Picker needs to do blocking or
    /// time-consuming work to service this request, it should return Queue, and
    /// the Pick call will be repeated by the channel when a new Picker is
    /// produced by the LoadBalancer.
    fn pick(&self, args: &PickArgs) -> PickResult;
}

#[derive(Debug)]
pub enum PickResult {
    /// Indicates the Subchannel in the Pick should be used for the request.
    /// If the subchannel is not Ready the call stays queued.
    Pick(Pick),
    /// Indicates the LoadBalancer is attempting to connect to a server to use
    /// for the request.
    Queue,
    /// Indicates that the request should fail with the included status.  If
    /// the RPC is wait-for-ready, then it will not be terminated, but instead
    /// attempted on a new picker if one is produced before it is cancelled.
    Fail(Status),
    /// Indicates that the request should fail with the included status
    /// immediately, even if the RPC is wait-for-ready.
    Drop(Status),
}

/// A collection of data used by the channel for routing a request.
#[derive(Debug)]
pub struct Pick {
    /// The Subchannel for the request.
    pub subchannel: Subchannel,
    // Metadata to be added to existing outgoing metadata.
    pub metadata: MetadataMap,
}

impl Pick {
    pub fn new(subchannel: Subchannel) -> Self {
        Self {
            subchannel,
            metadata: MetadataMap::new(),
        }
    }
}

/// QueuingPicker always returns Queue.  LB policies that are not actively
/// Connecting should not use this picker.
#[derive(Debug, Default)]
pub struct QueuingPicker {}

impl Picker for QueuingPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Queue
    }
}

/// Fails every call with the same status.
#[derive(Debug)]
pub struct FailingPicker {
    status: Status,
}

impl FailingPicker {
    pub fn new(status: Status) -> Self {
        Self { status }
    }
}

impl Picker for FailingPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Fail(self.status.clone())
    }
}
