//! Domain types shared by the local tree and the remote object.

use std::collections::BTreeMap;
use std::fmt;

/// Keyed byte-map held by the remote object and produced by a tree snapshot.
///
/// Keys are `/`-separated paths relative to the mirrored root. The map is
/// ordered so that two snapshots compare equal exactly when they hold the
/// same key set with the same bytes per key.
pub type Entries = BTreeMap<String, Vec<u8>>;

/// Identity of the tracked remote object.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    pub namespace: String,
    pub name: String,
}

impl ObjectRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    /// True when `namespace`/`name` identify this object.
    pub fn matches(&self, namespace: &str, name: &str) -> bool {
        self.namespace == namespace && self.name == name
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Typed payload delivered with remote change notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub target: ObjectRef,
    pub entries: Entries,
}

impl RemoteObject {
    pub fn new(target: ObjectRef, entries: Entries) -> Self {
        Self { target, entries }
    }
}
