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

use super::{PassthroughResolverBuilder, ResolverBuilder};

/// The scheme applied to targets that are not written as URIs.
pub const DEFAULT_SCHEME: &str = "dns";

/// A registry to store and retrieve name resolvers.  Resolvers are indexed by
/// the URI scheme they are intended to handle.
pub struct ResolverRegistry {
    m: Mutex<HashMap<String, Arc<dyn ResolverBuilder>>>,
    default_scheme: Mutex<String>,
}

impl ResolverRegistry {
    /// Construct an empty name resolver registry whose default scheme is
    /// `dns`.
    pub fn new() -> Self {
        Self {
            m: Mutex::default(),
            default_scheme: Mutex::new(DEFAULT_SCHEME.to_string()),
        }
    }

    /// Add a name resolver into the registry. builder.scheme() will
    // be used as the scheme registered with this builder. If multiple
    // resolvers are registered with the same name, the one registered last
    // will take effect. Panics if the given scheme contains uppercase
    // characters.
    pub fn add_builder(&self, builder: impl ResolverBuilder + 'static) {
        let scheme = builder.scheme();
        if scheme.chars().any(|c| c.is_ascii_uppercase()) {
            panic!("Scheme must not contain uppercase characters: {scheme}");
        }
        let scheme = scheme.to_string();
        self.m.lock().insert(scheme, Arc::new(builder));
    }

    /// Returns the resolver builder registered for the given scheme, if any.
    ///
    /// The provided scheme is case-insensitive; any uppercase characters
    /// will be converted to lowercase before lookup.
    pub fn get(&self, scheme: &str) -> Option<Arc<dyn ResolverBuilder>> {
        self.m.lock().get(&scheme.to_lowercase()).cloned()
    }

    /// The scheme used for targets that are not URIs, e.g. `localhost:50051`.
    pub fn default_scheme(&self) -> String {
        self.default_scheme.lock().clone()
    }

    pub fn set_default_scheme(&self, scheme: impl Into<String>) {
        *self.default_scheme.lock() = scheme.into();
    }
}

impl Default for ResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global registry for resolver builders.  Used by channels that are not
/// configured with their own registry.  Starts out with the `passthrough`
/// resolver registered.
pub static GLOBAL_RESOLVER_REGISTRY: LazyLock<ResolverRegistry> = LazyLock::new(|| {
    let registry = ResolverRegistry::new();
    registry.add_builder(PassthroughResolverBuilder);
    registry
});
