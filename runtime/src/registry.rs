//! Process-wide record of artifacts that are already mapped.
//!
//! The dynamic loader returns the existing mapping when the same file is
//! opened twice, so a second instance would share the first one's globals.
//! The registry remembers which artifact identities (canonical paths) have a
//! direct mapping; later loads of the same identity go through a fresh alias.
//!
//! The whole load runs under the registry lock, so two threads can never both
//! decide they are first.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};

static REGISTRY: Lazy<LoaderRegistry> = Lazy::new(LoaderRegistry::new);

/// The process-wide loader registry.
pub fn registry() -> &'static LoaderRegistry {
    &REGISTRY
}

/// Set of artifact identities with a live direct mapping.
#[derive(Debug, Default)]
pub struct LoaderRegistry {
    loaded: Mutex<HashSet<PathBuf>>,
}

impl LoaderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take the registry lock for the duration of one load.
    pub fn lock(&self) -> RegistryGuard<'_> {
        RegistryGuard { loaded: self.loaded.lock() }
    }

    /// Whether `identity` has been mapped before. Takes the lock briefly.
    pub fn contains(&self, identity: &Path) -> bool {
        self.loaded.lock().contains(identity)
    }
}

/// Exclusive access to the registry while a load is in progress.
pub struct RegistryGuard<'a> {
    loaded: MutexGuard<'a, HashSet<PathBuf>>,
}

impl RegistryGuard<'_> {
    pub fn contains(&self, identity: &Path) -> bool {
        self.loaded.contains(identity)
    }

    /// Record a successful direct mapping.
    pub fn record(&mut self, identity: PathBuf) {
        self.loaded.insert(identity);
    }
}
