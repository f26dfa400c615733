//! # Relations
//!
//! Typed navigation descriptors used for eager loading.
//!
//! A relation says how to find the related rows for a batch of parents and
//! where to put them. Both one-to-many and many-to-one navigations reduce to
//! the same lookup:
//!
//! ```text
//! SELECT * FROM <child table> WHERE <foreign column> IN (<parent local values>)
//! ```
//!
//! followed by matching `foreign_value(child) == local_value(parent)`.
//!
//! ## Example
//! ```text
//! AssetHierarchyLevel ──has_many──► BridgeAssetHierarchy   (level key)
//! BridgeAssetHierarchy ──belongs_to──► DimFund             (fund_key)
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::entity::Entity;
use crate::value::Value;

/// How matched children are written back onto the parent.
pub enum Attach<P, C> {
    /// Collection navigation: all matches.
    Many(fn(&mut P, Vec<C>)),
    /// Reference navigation: first match, or `None`.
    One(fn(&mut P, Option<C>)),
}

impl<P, C> Clone for Attach<P, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, C> Copy for Attach<P, C> {}

/// Navigation from parent `P` to related `C`.
pub struct Relation<P, C> {
    name: &'static str,
    foreign_column: &'static str,
    local_value: fn(&P) -> Value,
    foreign_value: fn(&C) -> Value,
    attach: Attach<P, C>,
}

impl<P, C> Clone for Relation<P, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<P, C> Copy for Relation<P, C> {}

impl<P, C> fmt::Debug for Relation<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relation")
            .field("name", &self.name)
            .field("foreign_column", &self.foreign_column)
            .finish()
    }
}

impl<P: Entity, C: Entity> Relation<P, C> {
    /// One-to-many: children whose `foreign_column` equals the parent's key.
    ///
    /// ## Arguments
    /// * `name` - Navigation name, used in logs
    /// * `foreign_column` - Column on the child table pointing at the parent
    /// * `foreign_value` - Reads that column from a decoded child
    /// * `attach` - Stores the loaded children on the parent
    pub fn has_many(
        name: &'static str,
        foreign_column: &'static str,
        foreign_value: fn(&C) -> Value,
        attach: fn(&mut P, Vec<C>),
    ) -> Self {
        Relation {
            name,
            foreign_column,
            local_value: P::key,
            foreign_value,
            attach: Attach::Many(attach),
        }
    }

    /// Many-to-one: the row of `C` whose key equals the parent's foreign key.
    pub fn belongs_to(
        name: &'static str,
        local_value: fn(&P) -> Value,
        attach: fn(&mut P, Option<C>),
    ) -> Self {
        Relation {
            name,
            foreign_column: C::KEY,
            local_value,
            foreign_value: C::key,
            attach: Attach::One(attach),
        }
    }
}

impl<P, C> Relation<P, C> {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn foreign_column(&self) -> &'static str {
        self.foreign_column
    }

    /// Distinct non-NULL lookup values for a batch of parents, in first-seen
    /// order.
    pub fn lookup_values(&self, parents: &[P]) -> Vec<Value> {
        let mut seen = HashSet::new();
        parents
            .iter()
            .map(self.local_value)
            .filter(|v| !v.is_null())
            .filter(|v| seen.insert(v.clone()))
            .collect()
    }
}

impl<P, C: Clone> Relation<P, C> {
    /// Distributes `children` over `parents`. Parents with no match get an
    /// empty collection (or `None`).
    ///
    /// Children are grouped by foreign value once, so the cost is linear in
    /// parents plus children. Within a group, children keep their input order.
    pub fn attach(&self, parents: &mut [P], children: &[C]) {
        let mut groups: HashMap<Value, Vec<&C>> = HashMap::new();
        for child in children {
            let foreign = (self.foreign_value)(child);
            if !foreign.is_null() {
                groups.entry(foreign).or_default().push(child);
            }
        }

        for parent in parents.iter_mut() {
            let local = (self.local_value)(parent);
            let matches = groups.get(&local).map(Vec::as_slice).unwrap_or(&[]);

            match self.attach {
                Attach::Many(store) => {
                    store(parent, matches.iter().map(|&c| c.clone()).collect())
                }
                Attach::One(store) => store(parent, matches.first().map(|&c| c.clone())),
            }
        }
    }
}
