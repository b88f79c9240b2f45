// Copyright 2024 GPU Scheduler contributors.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::BTreeMap;
use std::ops::{Add, AddAssign, Sub};

use crate::ResourceTag;

///
/// A value-typed mapping from `ResourceTag` to an amount. `Resources` are freely copied and
/// merged pointwise; zero-valued entries are pruned on every mutation so that two maps
/// describing the same requirement compare equal regardless of how they were built up.
///
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Resources {
    amounts: BTreeMap<ResourceTag, u64>,
}

impl Resources {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.amounts.is_empty()
    }

    pub fn get(&self, tag: &ResourceTag) -> u64 {
        self.amounts.get(tag).copied().unwrap_or(0)
    }

    pub fn set(&mut self, tag: ResourceTag, amount: u64) {
        if amount == 0 {
            self.amounts.remove(&tag);
        } else {
            self.amounts.insert(tag, amount);
        }
    }

    pub fn add(&mut self, tag: ResourceTag, amount: u64) {
        if amount == 0 {
            return;
        }
        *self.amounts.entry(tag).or_insert(0) += amount;
    }

    /// Subtracts `amount` from `tag`, clamping at zero. Returns the amount actually removed.
    pub fn subtract_bounded(&mut self, tag: ResourceTag, amount: u64) -> u64 {
        let Some(current) = self.amounts.get_mut(&tag) else {
            return 0;
        };
        let removed = (*current).min(amount);
        *current -= removed;
        if *current == 0 {
            self.amounts.remove(&tag);
        }
        removed
    }

    pub fn contains_tag(&self, tag: &ResourceTag) -> bool {
        self.amounts.contains_key(tag)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ResourceTag, &u64)> {
        self.amounts.iter()
    }

    pub fn tags(&self) -> impl Iterator<Item = &ResourceTag> {
        self.amounts.keys()
    }

    /// True iff `self` can cover every entry of `other`: for every tag in `other`,
    /// `self[tag] >= other[tag]`.
    pub fn covers(&self, other: &Resources) -> bool {
        other
            .amounts
            .iter()
            .all(|(tag, amount)| self.get(tag) >= *amount)
    }

    /// For every tag in `required` that `self` cannot cover, the deficit
    /// `max(0, required[tag] - self[tag])`. Tags present in `required` but absent from `self`
    /// contribute their full amount.
    pub fn deficit(&self, required: &Resources) -> Resources {
        let mut missing = Resources::new();
        for (tag, amount) in required.iter() {
            let have = self.get(tag);
            if have < *amount {
                missing.set(*tag, amount - have);
            }
        }
        missing
    }

    /// Merges `other` into `self` pointwise, adding amounts.
    pub fn merge(&mut self, other: &Resources) {
        for (tag, amount) in other.iter() {
            self.add(*tag, *amount);
        }
    }

    /// Builds a one-entry `Resources` map.
    pub fn single(tag: ResourceTag, amount: u64) -> Self {
        let mut r = Self::new();
        r.set(tag, amount);
        r
    }
}

impl Add for Resources {
    type Output = Resources;

    fn add(mut self, rhs: Resources) -> Resources {
        self.merge(&rhs);
        self
    }
}

impl AddAssign<&Resources> for Resources {
    fn add_assign(&mut self, rhs: &Resources) {
        self.merge(rhs);
    }
}

impl Sub for Resources {
    type Output = Resources;

    /// Bounded subtraction: a tag that would go negative is clamped to zero and then pruned.
    fn sub(mut self, rhs: Resources) -> Resources {
        for (tag, amount) in rhs.iter() {
            self.subtract_bounded(*tag, *amount);
        }
        self
    }
}

/// A small fluent builder used by call sites that assemble a `Resources` map from a handful of
/// known tags (task estimation, device capacity defaults).
#[derive(Debug, Default)]
pub struct ResourcesBuilder {
    inner: Resources,
}

impl ResourcesBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: ResourceTag, amount: u64) -> Self {
        self.inner.add(tag, amount);
        self
    }

    pub fn build(self) -> Resources {
        self.inner
    }
}
