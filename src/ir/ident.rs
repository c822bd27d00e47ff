//! Interned identifiers.
//!
//! The pool is process wide so that entity and type names compare by handle
//! across graphs compiled on different threads. Writers serialize on a
//! mutex; the pool is append only, so handed-out string references stay
//! valid for the process lifetime.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, OnceLock};

use rustc_hash::FxHashMap;

/// Handle of an interned string.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ident(u32);

struct Pool {
    map: FxHashMap<&'static str, u32>,
    strings: Vec<&'static str>,
}

static POOL: OnceLock<Mutex<Pool>> = OnceLock::new();
static UNIQUE: AtomicU64 = AtomicU64::new(0);

fn pool() -> &'static Mutex<Pool> {
    POOL.get_or_init(|| {
        Mutex::new(Pool {
            map: FxHashMap::default(),
            strings: Vec::new(),
        })
    })
}

impl Ident {
    /// Intern `s`, returning the existing handle when already present.
    pub fn new(s: &str) -> Ident {
        let mut pool = pool().lock().unwrap();
        if let Some(&idx) = pool.map.get(s) {
            return Ident(idx);
        }
        let leaked: &'static str = Box::leak(s.to_owned().into_boxed_str());
        let idx = pool.strings.len() as u32;
        pool.strings.push(leaked);
        pool.map.insert(leaked, idx);
        Ident(idx)
    }

    /// Intern a fresh identifier `prefix.N` guaranteed not to collide with
    /// previous calls.
    pub fn unique(prefix: &str) -> Ident {
        let n = UNIQUE.fetch_add(1, Ordering::Relaxed);
        Ident::new(&format!("{}.{}", prefix, n))
    }

    pub fn as_str(self) -> &'static str {
        pool().lock().unwrap().strings[self.0 as usize]
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ident({:?})", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_deduplicates() {
        let a = Ident::new("frobnicate");
        let b = Ident::new("frobnicate");
        let c = Ident::new("other");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), "frobnicate");
    }

    #[test]
    fn unique_idents_differ() {
        let a = Ident::unique("tmp");
        let b = Ident::unique("tmp");
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("tmp."));
    }
}
