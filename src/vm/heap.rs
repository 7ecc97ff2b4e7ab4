//! The object heap: a handle table of objects with mark/sweep collection.
//!
//! Threads allocate against a private byte budget (the inline fast path)
//! and only touch the shared accounting when the budget runs out. The
//! refill path enforces the heap limit; the caller runs a collection and
//! retries once before throwing `OutOfMemoryError`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use super::class::{Class, ClassId};
use super::debug::StackTraceElement;
use super::method_handle::{MethodHandleData, MethodTypeDesc};
use super::value::{ObjectRef, Word};

/// Budget handed to a thread per refill.
pub const ALLOCATION_BUDGET: usize = 64 * 1024;

const OBJECT_HEADER_BYTES: usize = 16;

// =============================================================================
// Objects
// =============================================================================

pub enum ObjectBody {
    /// Instance fields, one word per field.
    Instance(Box<[AtomicU64]>),
    /// Array elements, one word per element.
    Array(Box<[AtomicU64]>),
    String(String),
    /// `java/lang/Class` mirror of a class.
    Mirror(ClassId),
    MethodType(MethodTypeDesc),
    MethodHandle(MethodHandleData),
}

pub struct HeapObject {
    pub class: Arc<Class>,
    pub body: ObjectBody,
    /// Captured when a throwable is created.
    pub(crate) stack_trace: OnceCell<Vec<StackTraceElement>>,
    marked: AtomicBool,
}

impl HeapObject {
    pub fn new(class: Arc<Class>, body: ObjectBody) -> Self {
        HeapObject {
            class,
            body,
            stack_trace: OnceCell::new(),
            marked: AtomicBool::new(false),
        }
    }

    /// A zeroed instance of `class`.
    pub fn instance(class: Arc<Class>) -> Self {
        let fields = zeroed(class.instance_slots);
        HeapObject::new(class, ObjectBody::Instance(fields))
    }

    /// A zeroed array of `class` (an array class).
    pub fn array(class: Arc<Class>, length: usize) -> Self {
        HeapObject::new(class, ObjectBody::Array(zeroed(length)))
    }

    /// Approximate footprint charged against the heap limit.
    pub fn size_bytes(&self) -> usize {
        OBJECT_HEADER_BYTES
            + match &self.body {
                ObjectBody::Instance(words) | ObjectBody::Array(words) => words.len() * 8,
                ObjectBody::String(s) => s.len(),
                ObjectBody::MethodType(mt) => mt.descriptor.len(),
                ObjectBody::MethodHandle(_) | ObjectBody::Mirror(_) => 16,
            }
    }

    pub fn field(&self, slot: usize) -> Word {
        match &self.body {
            ObjectBody::Instance(words) => words[slot].load(Ordering::Acquire),
            _ => 0,
        }
    }

    pub fn set_field(&self, slot: usize, value: Word) {
        if let ObjectBody::Instance(words) = &self.body {
            words[slot].store(value, Ordering::Release);
        }
    }

    /// Array length, or `None` for non-arrays.
    pub fn array_length(&self) -> Option<usize> {
        match &self.body {
            ObjectBody::Array(words) => Some(words.len()),
            _ => None,
        }
    }

    /// Element `index`, checked with a single unsigned comparison:
    /// a negative index wraps to a huge value and fails the same test.
    #[inline]
    pub fn element(&self, index: i32) -> Result<Word, i32> {
        match &self.body {
            ObjectBody::Array(words) => {
                if (index as u32 as usize) < words.len() {
                    Ok(words[index as usize].load(Ordering::Acquire))
                } else {
                    Err(words.len() as i32)
                }
            }
            _ => Err(0),
        }
    }

    #[inline]
    pub fn set_element(&self, index: i32, value: Word) -> Result<(), i32> {
        match &self.body {
            ObjectBody::Array(words) => {
                if (index as u32 as usize) < words.len() {
                    words[index as usize].store(value, Ordering::Release);
                    Ok(())
                } else {
                    Err(words.len() as i32)
                }
            }
            _ => Err(0),
        }
    }

    /// Raw element words; for bulk copies.
    pub fn elements(&self) -> Option<&[AtomicU64]> {
        match &self.body {
            ObjectBody::Array(words) => Some(words),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match &self.body {
            ObjectBody::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn stack_trace(&self) -> Option<&[StackTraceElement]> {
        self.stack_trace.get().map(Vec::as_slice)
    }

    /// Reference-typed words this object holds.
    fn trace(&self, out: &mut Vec<ObjectRef>) {
        match &self.body {
            ObjectBody::Instance(words) => {
                for field in self.class.instance_fields.iter().filter(|f| f.ty.is_reference()) {
                    out.push(ObjectRef::from_word(words[field.slot].load(Ordering::Relaxed)));
                }
            }
            ObjectBody::Array(words) => {
                let holds_refs = self
                    .class
                    .element
                    .as_ref()
                    .is_some_and(|e| e.java_type().is_reference());
                if holds_refs {
                    out.extend(words.iter().map(|w| ObjectRef::from_word(w.load(Ordering::Relaxed))));
                }
            }
            _ => {}
        }
    }
}

fn zeroed(len: usize) -> Box<[AtomicU64]> {
    (0..len).map(|_| AtomicU64::new(0)).collect()
}

// =============================================================================
// Heap
// =============================================================================

#[derive(Default)]
struct HandleTable {
    objects: Vec<Option<Arc<HeapObject>>>,
    free: Vec<usize>,
}

pub struct Heap {
    table: RwLock<HandleTable>,
    /// Bytes handed out as thread budgets since the last collection.
    bytes_reserved: AtomicUsize,
    /// Hard limit on heap size (None = unlimited)
    heap_limit: Option<usize>,
    collections: AtomicUsize,
}

/// Statistics of one collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CollectionStats {
    pub live_objects: usize,
    pub freed_objects: usize,
    pub live_bytes: usize,
}

impl Heap {
    pub fn new(heap_limit: Option<usize>) -> Self {
        Heap {
            table: RwLock::new(HandleTable::default()),
            bytes_reserved: AtomicUsize::new(0),
            heap_limit,
            collections: AtomicUsize::new(0),
        }
    }

    /// Store `object` and return its handle. Accounting happened against
    /// the caller's budget.
    pub fn insert(&self, object: HeapObject) -> ObjectRef {
        let mut table = self.table.write();
        let object = Some(Arc::new(object));
        match table.free.pop() {
            Some(index) => {
                table.objects[index] = object;
                ObjectRef::from_index(index)
            }
            None => {
                table.objects.push(object);
                ObjectRef::from_index(table.objects.len() - 1)
            }
        }
    }

    #[inline]
    pub fn get(&self, r: ObjectRef) -> Option<Arc<HeapObject>> {
        let index = r.index()?;
        self.table.read().objects.get(index).cloned().flatten()
    }

    /// Reserve a new budget of at least `min_bytes`. Fails when the heap
    /// limit leaves less than that.
    pub fn refill_budget(&self, min_bytes: usize) -> Option<usize> {
        let want = ALLOCATION_BUDGET.max(min_bytes);
        let mut granted = 0;
        self.bytes_reserved
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |reserved| {
                granted = match self.heap_limit {
                    Some(limit) => want.min(limit.saturating_sub(reserved)),
                    None => want,
                };
                (granted >= min_bytes).then(|| reserved + granted)
            })
            .ok()?;
        Some(granted)
    }

    /// Bytes reserved by thread budgets.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_reserved.load(Ordering::Acquire)
    }

    pub fn object_count(&self) -> usize {
        self.table.read().objects.iter().filter(|o| o.is_some()).count()
    }

    pub fn collections(&self) -> usize {
        self.collections.load(Ordering::Relaxed)
    }

    /// Mark phase: mark everything reachable from `roots`. Root words are
    /// scanned conservatively: any word naming a live handle keeps it alive.
    fn mark(&self, table: &HandleTable, roots: impl IntoIterator<Item = Word>) {
        let is_live = |r: ObjectRef| {
            r.index()
                .and_then(|i| table.objects.get(i))
                .is_some_and(Option::is_some)
        };
        let mut worklist: Vec<ObjectRef> = roots
            .into_iter()
            .map(ObjectRef::from_word)
            .filter(|r| is_live(*r))
            .collect();

        while let Some(r) = worklist.pop() {
            let Some(Some(object)) = r.index().and_then(|i| table.objects.get(i)) else {
                continue;
            };
            if object.marked.swap(true, Ordering::Relaxed) {
                continue;
            }
            let mut children = Vec::new();
            object.trace(&mut children);
            worklist.extend(children.into_iter().filter(|c| is_live(*c)));
        }
    }

    /// Sweep phase: free every unmarked object and reset marks.
    fn sweep(&self, table: &mut HandleTable) -> CollectionStats {
        let mut stats = CollectionStats::default();
        let HandleTable { objects, free } = table;
        for (index, slot) in objects.iter_mut().enumerate() {
            let Some(object) = slot else {
                continue;
            };
            if object.marked.swap(false, Ordering::Relaxed) {
                stats.live_objects += 1;
                stats.live_bytes += object.size_bytes();
            } else {
                *slot = None;
                free.push(index);
                stats.freed_objects += 1;
            }
        }
        stats
    }

    /// Perform a full collection. The caller must hold exclusive VM access
    /// and supply every root. Outstanding thread budgets are forfeited.
    pub fn collect(&self, roots: impl IntoIterator<Item = Word>) -> CollectionStats {
        let mut table = self.table.write();
        self.mark(&table, roots);
        let stats = self.sweep(&mut table);
        self.bytes_reserved.store(stats.live_bytes, Ordering::Release);
        self.collections.fetch_add(1, Ordering::Relaxed);
        stats
    }

    /// Whether `r` names a live object.
    pub fn is_live(&self, r: ObjectRef) -> bool {
        self.get(r).is_some()
    }
}

impl std::fmt::Debug for Heap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Heap")
            .field("objects", &self.object_count())
            .field("bytes_allocated", &self.bytes_allocated())
            .field("heap_limit", &self.heap_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::class::{ElementType, LinkRequest};
    use crate::vm::classfile::{ClassDef, FieldDef};
    use crate::vm::method::Method;
    use crate::vm::value::JavaType;

    fn class_with_ref_field() -> Arc<Class> {
        let mut def = ClassDef::new("Node");
        def.fields.push(FieldDef {
            name: "next".into(),
            descriptor: "LNode;".into(),
            flags: 0,
        });
        def.fields.push(FieldDef {
            name: "value".into(),
            descriptor: "I".into(),
            flags: 0,
        });
        let request = LinkRequest {
            id: ClassId(0),
            def: &def,
            super_class: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
        };
        Arc::new(Class::link(request, &mut |m: &Arc<Method>| Arc::clone(m)).unwrap())
    }

    #[test]
    fn test_collect_keeps_reachable_chain() {
        let heap = Heap::new(None);
        let node = class_with_ref_field();
        let a = heap.insert(HeapObject::instance(Arc::clone(&node)));
        let b = heap.insert(HeapObject::instance(Arc::clone(&node)));
        let garbage = heap.insert(HeapObject::instance(Arc::clone(&node)));
        heap.get(a).unwrap().set_field(0, b.to_word());

        let stats = heap.collect([a.to_word()]);
        assert_eq!(stats.live_objects, 2);
        assert_eq!(stats.freed_objects, 1);
        assert!(heap.is_live(b));
        assert!(!heap.is_live(garbage));

        // Freed handles are reused.
        let c = heap.insert(HeapObject::instance(node));
        assert_eq!(c, garbage);
    }

    #[test]
    fn test_int_fields_are_not_traced() {
        let heap = Heap::new(None);
        let node = class_with_ref_field();
        let a = heap.insert(HeapObject::instance(Arc::clone(&node)));
        let b = heap.insert(HeapObject::instance(node));
        heap.get(a).unwrap().set_field(1, b.to_word());
        heap.collect([a.to_word()]);
        assert!(!heap.is_live(b));
    }

    #[test]
    fn test_element_bounds_use_unsigned_compare() {
        let node = class_with_ref_field();
        let int_array = Arc::new(Class::new_array(
            ClassId(1),
            ElementType::Primitive(JavaType::Int),
            &node,
        ));
        let array = HeapObject::array(int_array, 3);
        assert!(array.set_element(2, 9).is_ok());
        assert_eq!(array.element(2), Ok(9));
        assert_eq!(array.element(3), Err(3));
        assert_eq!(array.element(-1), Err(3));
        assert_eq!(array.element(i32::MIN), Err(3));
    }

    #[test]
    fn test_budget_refill_respects_limit() {
        let heap = Heap::new(Some(1000));
        assert_eq!(heap.refill_budget(100), Some(1000));
        assert_eq!(heap.refill_budget(1), None);
        heap.collect(std::iter::empty());
        assert_eq!(heap.refill_budget(200), Some(1000));

        let unlimited = Heap::new(None);
        assert_eq!(unlimited.refill_budget(16), Some(ALLOCATION_BUDGET));
    }
}
