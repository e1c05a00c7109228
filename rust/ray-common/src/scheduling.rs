// Copyright 2024 The Ray Authors.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0

//! Resource quantities used for bundle demands and node capacities.
//!
//! Speculative holds subtract a demand and later add it back, so quantities
//! are kept in fixed point: the pair always restores the exact original.

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};

use crate::constants::RESOURCE_UNIT_SCALING;

/// A resource quantity in units of `1 / RESOURCE_UNIT_SCALING`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct FixedPoint(i64);

impl FixedPoint {
    pub const ZERO: Self = Self(0);

    /// Round `value` to the nearest representable quantity.
    pub fn from_f64(value: f64) -> Self {
        Self((value * RESOURCE_UNIT_SCALING as f64).round() as i64)
    }

    pub fn to_f64(self) -> f64 {
        self.0 as f64 / RESOURCE_UNIT_SCALING as f64
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl Add for FixedPoint {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self(self.0 + rhs.0)
    }
}

impl AddAssign for FixedPoint {
    fn add_assign(&mut self, rhs: Self) {
        self.0 += rhs.0;
    }
}

impl Sub for FixedPoint {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self(self.0 - rhs.0)
    }
}

impl SubAssign for FixedPoint {
    fn sub_assign(&mut self, rhs: Self) {
        self.0 -= rhs.0;
    }
}

impl fmt::Debug for FixedPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_f64())
    }
}

/// Named resource quantities, e.g. a bundle demand or a node's capacity.
///
/// Only positive quantities are stored, so two sets describing the same
/// amounts always compare equal.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSet {
    resources: HashMap<String, FixedPoint>,
}

impl ResourceSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a set from `(name, amount)` pairs; non-positive amounts are dropped.
    pub fn from_pairs<'a>(pairs: impl IntoIterator<Item = (&'a str, f64)>) -> Self {
        let mut set = Self::new();
        for (name, amount) in pairs {
            set.set(name.to_string(), FixedPoint::from_f64(amount));
        }
        set
    }

    /// Quantity of `resource`, zero when absent.
    pub fn get(&self, resource: &str) -> FixedPoint {
        self.resources
            .get(resource)
            .copied()
            .unwrap_or(FixedPoint::ZERO)
    }

    /// Set the quantity of `resource`. Non-positive values remove it.
    pub fn set(&mut self, resource: String, value: FixedPoint) {
        if value > FixedPoint::ZERO {
            self.resources.insert(resource, value);
        } else {
            self.resources.remove(&resource);
        }
    }

    pub fn add(&mut self, other: &ResourceSet) {
        for (name, amount) in &other.resources {
            *self.resources.entry(name.clone()).or_default() += *amount;
        }
    }

    /// Take `other` away. Quantities that reach zero or below are removed.
    pub fn subtract(&mut self, other: &ResourceSet) {
        for (name, amount) in &other.resources {
            let Some(entry) = self.resources.get_mut(name) else {
                continue;
            };
            *entry -= *amount;
            if *entry <= FixedPoint::ZERO {
                self.resources.remove(name);
            }
        }
    }

    /// Add `other`, never exceeding `cap`. Resources absent from `cap` are
    /// not added.
    pub fn add_capped(&mut self, other: &ResourceSet, cap: &ResourceSet) {
        for (name, amount) in &other.resources {
            let next = (self.get(name) + *amount).min(cap.get(name));
            self.set(name.clone(), next);
        }
    }

    /// Whether every quantity of `other` fits in this set.
    pub fn is_superset_of(&self, other: &ResourceSet) -> bool {
        other
            .resources
            .iter()
            .all(|(name, amount)| self.get(name) >= *amount)
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, FixedPoint)> {
        self.resources.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.resources.keys().map(String::as_str)
    }
}
