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

use std::collections::HashMap;
use std::sync::{Arc, LazyLock};

use parking_lot::Mutex;

use super::LoadBalancerBuilder;
use super::pick_first::PickFirstBuilder;

/// A registry to store and retrieve LB policies.  LB policies are indexed by
/// their names.
pub struct LbPolicyRegistry {
    m: Mutex<HashMap<String, Arc<dyn LoadBalancerBuilder>>>,
}

impl LbPolicyRegistry {
    /// Construct an empty LB policy registry.
    pub fn new() -> Self {
        Self {
            m: Mutex::default(),
        }
    }

    /// Add a LB policy into the registry.  A policy registered under an
    /// existing name replaces the old one.
    pub fn add_builder(&self, builder: impl LoadBalancerBuilder + 'static) {
        self.m
            .lock()
            .insert(builder.name().to_string(), Arc::new(builder));
    }

    /// Retrieve a LB policy from the registry, or None if not found.
    pub fn get_policy(&self, name: &str) -> Option<Arc<dyn LoadBalancerBuilder>> {
        self.m.lock().get(name).cloned()
    }
}

impl Default for LbPolicyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The registry used if a local registry is not provided to a channel or if it
/// does not exist in the local registry.  `pick_first` is always present.
pub static GLOBAL_LB_REGISTRY: LazyLock<LbPolicyRegistry> = LazyLock::new(|| {
    let registry = LbPolicyRegistry::new();
    registry.add_builder(PickFirstBuilder);
    registry
});

#[cfg(test)]
mod tests {
    use super::{GLOBAL_LB_REGISTRY, LbPolicyRegistry};
    use crate::client::load_balancing::pick_first::{POLICY_NAME, PickFirstBuilder};

    #[test]
    fn global_registry_has_pick_first() {
        let builder = GLOBAL_LB_REGISTRY.get_policy(POLICY_NAME).unwrap();
        assert_eq!(builder.name(), "pick_first");
        assert!(GLOBAL_LB_REGISTRY.get_policy("round_robin").is_none());
    }

    #[test]
    fn local_registry_starts_empty() {
        let registry = LbPolicyRegistry::new();
        assert!(registry.get_policy(POLICY_NAME).is_none());
        registry.add_builder(PickFirstBuilder);
        assert!(registry.get_policy(POLICY_NAME).is_some());
    }
}
