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

use tonic::Status;

use super::{
    Address, AddressGroup, Resolver, ResolverBuilder, ResolverListener, ResolverOptions, Target,
};
use crate::attributes::Attributes;

/// Resolves `passthrough:///host:port` to exactly that address, without any
/// lookup.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassthroughResolverBuilder;

impl ResolverBuilder for PassthroughResolverBuilder {
    fn build(&self, target: &Target, _options: &ResolverOptions) -> Option<Box<dyn Resolver>> {
        let path = target.path();
        let endpoint = path.strip_prefix('/').unwrap_or(path);
        if endpoint.is_empty() {
            return None;
        }
        Some(Box::new(PassthroughResolver {
            endpoint: endpoint.to_string(),
            listener: None,
        }))
    }

    fn scheme(&self) -> &str {
        "passthrough"
    }
}

struct PassthroughResolver {
    endpoint: String,
    listener: Option<Box<dyn ResolverListener>>,
}

impl PassthroughResolver {
    fn deliver(&self) {
        if let Some(listener) = &self.listener {
            let group = AddressGroup::new(vec![Address::tcp(self.endpoint.clone())]);
            listener.on_addresses(vec![group], Attributes::new());
        }
    }
}

impl Resolver for PassthroughResolver {
    fn start(&mut self, listener: Box<dyn ResolverListener>) -> Result<(), Status> {
        self.listener = Some(listener);
        self.deliver();
        Ok(())
    }

    fn refresh(&mut self) {
        self.deliver();
    }

    fn shutdown(&mut self) {
        self.listener = None;
    }

    fn service_authority(&self) -> String {
        self.endpoint.clone()
    }
}
