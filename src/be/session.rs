//! Arena-backed codegen session.
//!
//! One session spans the code generation of a compilation unit: it owns a
//! bump arena for scratch storage whose lifetime questions would otherwise
//! leak into every stage (interned label names, per-function buffers) and
//! collects statistics across procedures.

use std::cell::RefCell;
use std::fmt;

use bumpalo::Bump;
use rustc_hash::FxHashMap;

pub struct CodegenSession {
    arena: Bump,
    stats: RefCell<SessionStats>,
    labels: RefCell<FxHashMap<String, *const str>>,
}

impl CodegenSession {
    pub fn new() -> CodegenSession {
        CodegenSession {
            arena: Bump::new(),
            stats: RefCell::new(SessionStats::default()),
            labels: RefCell::new(FxHashMap::default()),
        }
    }

    pub fn arena(&self) -> &Bump {
        &self.arena
    }

    /// Intern a label string in the arena; repeated requests return the
    /// same storage.
    pub fn intern_label(&self, s: &str) -> &str {
        let mut labels = self.labels.borrow_mut();
        if let Some(&ptr) = labels.get(s) {
            // lives in the arena, which outlives the borrow
            return unsafe { &*ptr };
        }
        let stored: &str = self.arena.alloc_str(s);
        labels.insert(s.to_string(), stored as *const str);
        stored
    }

    pub fn record_function(&self, code_bytes: usize) {
        let mut stats = self.stats.borrow_mut();
        stats.functions += 1;
        stats.code_bytes += code_bytes;
    }

    pub fn record_spill(&self) {
        self.stats.borrow_mut().spills += 1;
    }

    pub fn record_reload(&self) {
        self.stats.borrow_mut().reloads += 1;
    }

    pub fn record_copy(&self) {
        self.stats.borrow_mut().copies += 1;
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }
}

impl Default for CodegenSession {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default, Clone)]
pub struct SessionStats {
    pub functions: usize,
    pub code_bytes: usize,
    pub spills: usize,
    pub reloads: usize,
    pub copies: usize,
}

impl fmt::Display for SessionStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} functions, {} spills, {} reloads, {} copies",
            self.functions, self.spills, self.reloads, self.copies
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_are_interned() {
        let s = CodegenSession::new();
        let a = s.intern_label(".L0");
        let b = s.intern_label(".L0");
        assert_eq!(a.as_ptr(), b.as_ptr());
        let c = s.intern_label(".L1");
        assert_ne!(a.as_ptr(), c.as_ptr());
    }

    #[test]
    fn stats_accumulate() {
        let s = CodegenSession::new();
        s.record_function(64);
        s.record_spill();
        s.record_reload();
        s.record_copy();
        let st = s.stats();
        assert_eq!(st.functions, 1);
        assert_eq!(st.spills, 1);
        assert_eq!(st.reloads, 1);
        assert_eq!(st.copies, 1);
    }
}
