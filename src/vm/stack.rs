//! The Java stack: one contiguous word arena per thread holding operand
//! stacks, locals and frame metadata.
//!
//! Slots are addressed by virtual word addresses that count down from the
//! fixed [`STACK_END`]. The arena covers `[STACK_END - capacity, STACK_END)`,
//! so growing it (which copies the contents to the tail of a larger buffer)
//! keeps every saved stack pointer and frame base valid.

use thiserror::Error;

use super::value::Word;

/// Virtual address one past the highest stack slot.
pub const STACK_END: usize = 1 << (usize::BITS - 2);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum StackGrowError {
    #[error("stack limit of {limit} words reached")]
    LimitReached { limit: usize },
    #[error("could not allocate a stack segment of {words} words")]
    AllocationFailed { words: usize },
}

pub struct JavaStack {
    words: Vec<Word>,
}

impl JavaStack {
    pub fn new(capacity: usize) -> Self {
        JavaStack {
            words: vec![0; capacity],
        }
    }

    /// Lowest valid address.
    #[inline]
    pub fn base(&self) -> usize {
        STACK_END - self.words.len()
    }

    #[inline]
    pub fn end(&self) -> usize {
        STACK_END
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.words.len()
    }

    /// Words in use for a stack pointer at `sp`.
    #[inline]
    pub fn used(&self, sp: usize) -> usize {
        STACK_END - sp
    }

    #[inline(always)]
    pub fn read(&self, addr: usize) -> Word {
        self.words[addr.wrapping_sub(self.base())]
    }

    #[inline(always)]
    pub fn write(&mut self, addr: usize, value: Word) {
        let base = self.base();
        self.words[addr.wrapping_sub(base)] = value;
    }

    /// Slots `[from, to)`.
    pub fn slice(&self, from: usize, to: usize) -> &[Word] {
        let base = self.base();
        &self.words[from - base..to - base]
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base() && addr < STACK_END
    }

    /// Move to a larger arena of `new_capacity` words. Contents keep their
    /// addresses.
    pub fn relocate(&mut self, new_capacity: usize) -> Result<(), StackGrowError> {
        if new_capacity <= self.words.len() {
            return Ok(());
        }
        let mut grown: Vec<Word> = Vec::new();
        grown
            .try_reserve_exact(new_capacity)
            .map_err(|_| StackGrowError::AllocationFailed {
                words: new_capacity,
            })?;
        grown.resize(new_capacity - self.words.len(), 0);
        grown.extend_from_slice(&self.words);
        self.words = grown;
        Ok(())
    }
}

impl std::fmt::Debug for JavaStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JavaStack")
            .field("base", &self.base())
            .field("capacity", &self.capacity())
            .finish()
    }
}

/// Supplies more stack when a thread crosses its soft watermark.
pub trait StackSegmentProvider: Send + Sync {
    fn grow(&self, stack: &mut JavaStack, new_capacity: usize) -> Result<(), StackGrowError>;
}

/// Default provider: reallocates the arena on the Rust heap.
#[derive(Debug, Default)]
pub struct HeapSegmentProvider;

impl StackSegmentProvider for HeapSegmentProvider {
    fn grow(&self, stack: &mut JavaStack, new_capacity: usize) -> Result<(), StackGrowError> {
        stack.relocate(new_capacity)
    }
}
