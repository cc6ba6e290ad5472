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

//! The default load balancing policy: a single subchannel over every resolved
//! address, which connects to the first address that works.

use std::sync::Arc;

use tonic::Status;

use super::{
    FailingPicker, Helper, LoadBalancer, LoadBalancerBuilder, Pick, PickArgs, PickResult, Picker,
    QueuingPicker, SubchannelState,
};
use crate::attributes::Attributes;
use crate::client::name_resolution::AddressGroup;
use crate::client::{ConnectivityState, Subchannel};

pub static POLICY_NAME: &str = "pick_first";

#[derive(Debug, Default)]
pub struct PickFirstBuilder;

impl LoadBalancerBuilder for PickFirstBuilder {
    fn build(&self, helper: Arc<dyn Helper>) -> Box<dyn LoadBalancer> {
        Box::new(PickFirstPolicy {
            helper,
            subchannel: None,
        })
    }

    fn name(&self) -> &'static str {
        POLICY_NAME
    }
}

struct PickFirstPolicy {
    helper: Arc<dyn Helper>,
    subchannel: Option<Subchannel>,
}

impl LoadBalancer for PickFirstPolicy {
    fn handle_resolved_address_groups(&mut self, groups: Vec<AddressGroup>, _attributes: Attributes) {
        // All addresses go into one group, so the subchannel tries them in
        // order and sticks with the first one that connects.
        let flattened = AddressGroup::new(
            groups
                .into_iter()
                .flat_map(|group| group.addresses)
                .collect(),
        );
        match &self.subchannel {
            Some(subchannel) => {
                self.helper
                    .update_subchannel_addresses(subchannel, flattened);
            }
            None => {
                let subchannel = self
                    .helper
                    .create_subchannel(flattened, Attributes::new());
                self.helper.update_balancing_state(
                    ConnectivityState::Connecting,
                    Arc::new(PickPicker {
                        subchannel: subchannel.clone(),
                    }),
                );
                subchannel.request_connection();
                self.subchannel = Some(subchannel);
            }
        }
    }

    fn handle_name_resolution_error(&mut self, status: Status) {
        tracing::debug!(%status, "pick_first: name resolution failed");
        if let Some(subchannel) = self.subchannel.take() {
            subchannel.shutdown();
        }
        self.helper.update_balancing_state(
            ConnectivityState::TransientFailure,
            Arc::new(FailingPicker::new(status)),
        );
    }

    fn handle_subchannel_state(&mut self, subchannel: &Subchannel, state: &SubchannelState) {
        if self.subchannel.as_ref() != Some(subchannel)
            || state.connectivity_state == ConnectivityState::Shutdown
        {
            return;
        }
        let picker: Arc<dyn Picker> = match state.connectivity_state {
            ConnectivityState::Idle => Arc::new(RequestConnectionPicker {
                subchannel: subchannel.clone(),
            }),
            ConnectivityState::Connecting => Arc::new(QueuingPicker {}),
            ConnectivityState::Ready => Arc::new(PickPicker {
                subchannel: subchannel.clone(),
            }),
            ConnectivityState::TransientFailure => Arc::new(FailingPicker::new(
                state
                    .last_connection_error
                    .clone()
                    .unwrap_or_else(|| Status::unavailable("subchannel in transient failure")),
            )),
            ConnectivityState::Shutdown => return,
        };
        self.helper
            .update_balancing_state(state.connectivity_state, picker);
    }

    fn shutdown(&mut self) {
        if let Some(subchannel) = self.subchannel.take() {
            subchannel.shutdown();
        }
    }
}

// Always picks the one subchannel.  Calls stay queued until it is Ready.
struct PickPicker {
    subchannel: Subchannel,
}

impl Picker for PickPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        PickResult::Pick(Pick::new(self.subchannel.clone()))
    }
}

/// Picker that requests a connection on the first pick and queues the call.
struct RequestConnectionPicker {
    subchannel: Subchannel,
}

impl Picker for RequestConnectionPicker {
    fn pick(&self, _args: &PickArgs) -> PickResult {
        self.subchannel.request_connection();
        PickResult::Queue
    }
}
