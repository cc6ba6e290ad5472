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

use std::collections::HashSet;
use std::hash::Hash;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InUseTransition {
    /// The first object became in use.
    InUse,
    /// The last object stopped being in use.
    NotInUse,
}

/// Aggregates the in-use state of a set of objects.  Reports a transition
/// only when the set goes from empty to non-empty or back.
#[derive(Debug)]
pub(crate) struct InUseStateAggregator<T> {
    in_use: HashSet<T>,
}

impl<T: Hash + Eq> InUseStateAggregator<T> {
    pub(crate) fn new() -> Self {
        Self {
            in_use: HashSet::new(),
        }
    }

    pub(crate) fn update_object_in_use(&mut self, object: T, in_use: bool) -> Option<InUseTransition> {
        let was_in_use = !self.in_use.is_empty();
        if in_use {
            self.in_use.insert(object);
            if !was_in_use {
                return Some(InUseTransition::InUse);
            }
        } else if self.in_use.remove(&object) && self.in_use.is_empty() {
            return Some(InUseTransition::NotInUse);
        }
        None
    }

    pub(crate) fn is_in_use(&self) -> bool {
        !self.in_use.is_empty()
    }

    pub(crate) fn is_object_in_use(&self, object: &T) -> bool {
        self.in_use.contains(object)
    }
}

#[cfg(test)]
mod tests {
    use super::{InUseStateAggregator, InUseTransition};

    #[test]
    fn reports_only_edges() {
        let mut agg = InUseStateAggregator::new();
        assert_eq!(agg.update_object_in_use("a", true), Some(InUseTransition::InUse));
        assert_eq!(agg.update_object_in_use("b", true), None);
        assert_eq!(agg.update_object_in_use("a", true), None);
        assert_eq!(agg.update_object_in_use("a", false), None);
        assert!(agg.is_in_use());
        assert_eq!(agg.update_object_in_use("b", false), Some(InUseTransition::NotInUse));
        assert!(!agg.is_in_use());
    }

    #[test]
    fn removing_unknown_object_is_ignored() {
        let mut agg = InUseStateAggregator::new();
        assert_eq!(agg.update_object_in_use(1, false), None);
        agg.update_object_in_use(2, true);
        assert_eq!(agg.update_object_in_use(3, false), None);
        assert!(agg.is_in_use());
    }
}
