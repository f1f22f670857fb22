//! Process-wide table of named backend templates.
//!
//! Mirrors `bst_list`/`register_backingstore_template`/`get_backingstore_template`
//! in `usr/bs.c`: populated once at startup as each backend module registers
//! itself, then read-only for the rest of the process, so no lock is needed
//! once startup is done.

use std::sync::RwLock;

/// A named backend. `T` is whatever vtable-ish type the backend wants to
/// carry (open/close/submit callbacks, a config struct, ...); the registry
/// itself only cares about the name.
pub struct BackendTemplate<T> {
    pub name: String,
    pub ops: T,
}

impl<T> BackendTemplate<T> {
    pub fn new(name: impl Into<String>, ops: T) -> Self {
        BackendTemplate {
            name: name.into(),
            ops,
        }
    }
}

/// Set of registered backend templates, keyed by name.
///
/// `register` does not check for duplicate names — same as the original,
/// which simply appends to `bst_list`. Callers are expected to arrange
/// uniqueness by construction (each backend module registers itself exactly
/// once).
pub struct Registry<T> {
    templates: RwLock<Vec<BackendTemplate<T>>>,
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Registry {
            templates: RwLock::new(Vec::new()),
        }
    }
}

impl<T> Registry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `template` to the registry. Infallible aside from allocation.
    pub fn register(&self, template: BackendTemplate<T>) {
        self.templates
            .write()
            .expect("registry lock poisoned")
            .push(template);
    }

    /// First exact-name match, or `None` if no backend with that name was
    /// ever registered.
    pub fn lookup(&self, name: &str) -> Option<T>
    where
        T: Clone,
    {
        self.templates
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|t| t.name == name)
            .map(|t| t.ops.clone())
    }

    /// Like [`Registry::lookup`], but runs `f` against the matching template
    /// in place instead of requiring `T: Clone`.
    pub fn with_lookup<R>(&self, name: &str, f: impl FnOnce(Option<&T>) -> R) -> R {
        let templates = self.templates.read().expect("registry lock poisoned");
        f(templates.iter().find(|t| t.name == name).map(|t| &t.ops))
    }
}
