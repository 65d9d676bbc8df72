//! Container access levels.

use serde::{Deserialize, Serialize};

/// Access level of an [`Object`](crate::Object) or [`Array`](crate::Array).
///
/// Levels are ordered `Writable < ReadOnly < Constant` and a container only ever
/// moves up the lattice.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Access {
    /// Entries can be added, replaced and removed.
    #[default]
    Writable,
    /// The container itself rejects writes; nested containers are unaffected.
    ReadOnly,
    /// The container and everything reachable from it is frozen.
    Constant,
}

impl Access {
    /// Returns true if moving from `self` to `target` is allowed.
    pub fn can_change_to(self, target: Access) -> bool {
        target >= self
    }
}
