// Copyright (C) 2025 The Forgeci Authors
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Matrix strategy expansion.

/// One concrete matrix combination: axis → value, in declared axis order.
pub type Combination = Vec<(String, String)>;

/// Cartesian product of the axes, in declared order.
///
/// An empty axis list produces zero combinations (the job vanishes), not a
/// single empty combination. An axis with no values also collapses the
/// product to nothing.
pub fn cartesian(axes: &[(String, Vec<String>)]) -> Vec<Combination> {
    if axes.is_empty() || axes.iter().any(|(_, values)| values.is_empty()) {
        return Vec::new();
    }

    let mut combos: Vec<Combination> = vec![Vec::new()];
    for (axis, values) in axes {
        let mut next = Vec::with_capacity(combos.len() * values.len());
        for combo in &combos {
            for value in values {
                let mut extended = combo.clone();
                extended.push((axis.clone(), value.clone()));
                next.push(extended);
            }
        }
        combos = next;
    }
    combos
}

/// Display name for an expanded job: `<base> (<v1>, <v2>, …)`.
pub fn job_name(base: &str, combo: &Combination) -> String {
    if combo.is_empty() {
        return base.to_string();
    }
    let values: Vec<&str> = combo.iter().map(|(_, v)| v.as_str()).collect();
    format!("{} ({})", base, values.join(", "))
}
