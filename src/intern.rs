//! Process-wide interning of message names decoded off the wire.
//!
//! [`Envelope::name`](crate::message::Envelope::name) is a `&'static str`,
//! matching the closed, compile-time-known names most callers construct
//! envelopes with. A decoded wire message's name is runtime data, though, so
//! reconstructing an envelope from bytes needs to manufacture a `'static`
//! reference somehow; [`intern`] leaks the backing allocation at most once
//! per distinct name and returns the same pointer for every repeat, so a
//! long-running decode loop (a projection reading Postgres, say) leaks
//! memory bounded by the number of distinct names it has ever seen, not by
//! the number of messages decoded.

use std::collections::HashSet;
use std::sync::{OnceLock, RwLock};

fn table() -> &'static RwLock<HashSet<&'static str>> {
    static TABLE: OnceLock<RwLock<HashSet<&'static str>>> = OnceLock::new();
    TABLE.get_or_init(|| RwLock::new(HashSet::new()))
}

/// Returns a `'static` reference to `name`, reusing a prior leak for the
/// same name instead of leaking a fresh allocation every call.
pub fn intern(name: String) -> &'static str {
    let table = table();

    let existing = table.read().expect("intern table lock poisoned").get(name.as_str()).copied();
    if let Some(existing) = existing {
        return existing;
    }

    let mut table = table.write().expect("intern table lock poisoned");
    if let Some(existing) = table.get(name.as_str()).copied() {
        return existing;
    }
    let leaked: &'static str = Box::leak(name.into_boxed_str());
    table.insert(leaked);
    leaked
}
