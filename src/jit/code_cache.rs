//! Installed compiled bodies, addressed by entry.
//!
//! An entry is the body's index plus one, so it is never zero and fits the
//! run-target encoding. Bodies are never removed; invalidation only marks
//! them and sends the method back to counting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use super::code::CompiledCode;
use super::{JitError, JitResult, TransitionCounters};
use crate::vm::method::{Method, MethodId};

/// Default number of bodies a cache accepts.
pub const DEFAULT_CAPACITY: usize = 4096;

pub struct CompiledBody {
    pub entry: usize,
    pub method: Arc<Method>,
    pub code: CompiledCode,
    invalidated: AtomicBool,
}

impl CompiledBody {
    #[inline]
    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CompiledBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledBody")
            .field("entry", &self.entry)
            .field("method", &self.method.full_name())
            .field("ops", &self.code.len())
            .field("invalidated", &self.is_invalidated())
            .finish()
    }
}

pub struct CodeCache {
    bodies: RwLock<Vec<Arc<CompiledBody>>>,
    capacity: usize,
}

impl Default for CodeCache {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl CodeCache {
    pub fn with_capacity(capacity: usize) -> Self {
        CodeCache {
            bodies: RwLock::new(Vec::new()),
            capacity,
        }
    }

    /// Install `code` for `method` and return its entry.
    pub fn install(&self, method: Arc<Method>, code: CompiledCode) -> JitResult<usize> {
        let mut bodies = self.bodies.write();
        if bodies.len() >= self.capacity {
            return Err(JitError::CacheFull {
                capacity: self.capacity,
            });
        }
        let entry = bodies.len() + 1;
        bodies.push(Arc::new(CompiledBody {
            entry,
            method,
            code,
            invalidated: AtomicBool::new(false),
        }));
        Ok(entry)
    }

    pub fn body(&self, entry: usize) -> Option<Arc<CompiledBody>> {
        entry
            .checked_sub(1)
            .and_then(|i| self.bodies.read().get(i).cloned())
    }

    pub fn len(&self) -> usize {
        self.bodies.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark the body at `entry` invalid without touching its method's run
    /// target. Returns false if it already was.
    pub fn invalidate_entry(&self, entry: usize, counters: &TransitionCounters) -> bool {
        let Some(body) = self.body(entry) else {
            return false;
        };
        if body.invalidated.swap(true, Ordering::AcqRel) {
            return false;
        }
        TransitionCounters::bump(&counters.invalidations);
        debug!(
            target: "jexec::jit",
            method = %body.method.full_name(),
            entry,
            "compiled body invalidated before publishing"
        );
        true
    }

    /// Invalidate every live body that assumed `method` has no overriders.
    /// Their methods restart counting from `recount`. Returns how many
    /// bodies were invalidated.
    pub fn invalidate_assumption(
        &self,
        method: MethodId,
        recount: u32,
        counters: &TransitionCounters,
    ) -> usize {
        let bodies = self.bodies.read();
        let mut count = 0;
        for body in bodies.iter() {
            if !body.code.assumptions.contains(&method) {
                continue;
            }
            if body.invalidated.swap(true, Ordering::AcqRel) {
                continue;
            }
            body.method.run_target.invalidate(body.entry, recount);
            TransitionCounters::bump(&counters.invalidations);
            debug!(
                target: "jexec::jit",
                method = %body.method.full_name(),
                entry = body.entry,
                "compiled body invalidated"
            );
            count += 1;
        }
        count
    }
}

impl std::fmt::Debug for CodeCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CodeCache")
            .field("bodies", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::code::Op;
    use crate::vm::class::ClassId;
    use crate::vm::classfile::{ACC_STATIC, MethodDef};
    use crate::vm::run_target::RunState;
    use crate::vm::value::ReturnType;

    fn method(id: u32) -> Arc<Method> {
        let def = MethodDef {
            name: format!("m{}", id),
            descriptor: "()V".into(),
            flags: ACC_STATIC,
            code: vec![0xb1],
            ..MethodDef::default()
        };
        Arc::new(Method::from_def(&def, MethodId(id), ClassId(0), "T", Some(3)).unwrap())
    }

    fn code(assumptions: Vec<MethodId>) -> CompiledCode {
        CompiledCode {
            ops: vec![Op::Return(ReturnType::Void)],
            pcs: vec![0],
            assumptions,
        }
    }

    #[test]
    fn test_entries_are_nonzero_and_resolve() {
        let cache = CodeCache::default();
        let m = method(0);
        let entry = cache.install(Arc::clone(&m), code(Vec::new())).unwrap();
        assert_ne!(entry, 0);
        assert_eq!(cache.body(entry).unwrap().method.id, m.id);
        assert!(cache.body(0).is_none());
        assert!(cache.body(entry + 1).is_none());
    }

    #[test]
    fn test_capacity_is_enforced() {
        let cache = CodeCache::with_capacity(1);
        cache.install(method(0), code(Vec::new())).unwrap();
        assert_eq!(
            cache.install(method(1), code(Vec::new())),
            Err(JitError::CacheFull { capacity: 1 })
        );
    }

    #[test]
    fn test_invalidation_resets_run_target_once() {
        let cache = CodeCache::default();
        let counters = TransitionCounters::default();
        let m = method(0);
        let entry = cache.install(Arc::clone(&m), code(vec![MethodId(7)])).unwrap();
        m.run_target.publish_compiled(entry);

        assert_eq!(cache.invalidate_assumption(MethodId(8), 5, &counters), 0);
        assert_eq!(cache.invalidate_assumption(MethodId(7), 5, &counters), 1);
        assert_eq!(m.run_target.load(), RunState::Counting(5));
        assert!(cache.body(entry).unwrap().is_invalidated());
        assert_eq!(cache.invalidate_assumption(MethodId(7), 5, &counters), 0);
        assert_eq!(counters.snapshot().invalidations, 1);
    }

    #[test]
    fn test_entry_invalidation_leaves_run_target_alone() {
        let cache = CodeCache::default();
        let counters = TransitionCounters::default();
        let m = method(0);
        let entry = cache.install(Arc::clone(&m), code(vec![MethodId(7)])).unwrap();

        assert!(cache.invalidate_entry(entry, &counters));
        assert!(!cache.invalidate_entry(entry, &counters));
        assert!(!cache.invalidate_entry(entry + 1, &counters));
        assert!(cache.body(entry).unwrap().is_invalidated());
        assert_eq!(m.run_target.load(), RunState::Counting(3));
        assert_eq!(counters.snapshot().invalidations, 1);
        // The assumption walk skips bodies already marked.
        assert_eq!(cache.invalidate_assumption(MethodId(7), 5, &counters), 0);
    }
}
