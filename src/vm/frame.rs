//! Frame layouts and the build/restore pairs that push and pop them.
//!
//! Every frame ends (at its highest addresses) with the same three words:
//!
//! ```text
//!   bp - 2   saved literals (method id + 1, 0 for none)
//!   bp - 1   saved pc
//!   bp       saved a0, shifted left by 2 with tag bits below
//! ```
//!
//! `bp` is the frame base for special frames and sits just below the locals
//! (and the monitor slot of synchronized methods) for interpreted frames. A
//! `buildX` call writes those words plus its own metadata below them, moves
//! `sp` down and returns the new frame base; `restoreX` reads the same words
//! back. For every frame kind, restore after build leaves the four registers
//! exactly as they were.
//!
//! Special frames leave a frame-type sentinel (< [`SPECIAL_FRAME_TYPE_LIMIT`])
//! in `pc`; real bytecode offsets are stored biased by [`PC_BIAS`] so the two
//! never collide.

use crate::jit::registers::CALLEE_SAVED_COUNT;

use super::context::ExecutionContext;
use super::method::{Method, MethodId};
use super::value::{ObjectRef, Word};

pub const SPECIAL_FRAME_TYPE_LIMIT: usize = 16;
pub const PC_BIAS: usize = SPECIAL_FRAME_TYPE_LIMIT;

/// Saved-a0 tag: the debugger asked to be told when this frame pops.
pub const A0_REPORT_FRAME_POP_TAG: Word = 1;
/// Saved-a0 tag: stack walkers must skip this frame.
pub const A0_INVISIBLE_TAG: Word = 2;
const A0_TAG_BITS: u32 = 2;
const A0_TAG_MASK: Word = (1 << A0_TAG_BITS) - 1;

/// Frame type sentinels stored in the pc register / saved-pc slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum FrameType {
    EndOfStack = 0,
    GenericSpecial = 1,
    Method = 2,
    NativeMethod = 3,
    J2I = 4,
    JitResolve = 5,
    CallIn = 6,
    JniNativeMethod = 7,
    MethodType = 8,
    /// A compiled body's frame; `a0` points at its tail.
    Compiled = 9,
}

impl FrameType {
    pub fn from_pc(pc: usize) -> Option<Self> {
        Some(match pc {
            0 => FrameType::EndOfStack,
            1 => FrameType::GenericSpecial,
            2 => FrameType::Method,
            3 => FrameType::NativeMethod,
            4 => FrameType::J2I,
            5 => FrameType::JitResolve,
            6 => FrameType::CallIn,
            7 => FrameType::JniNativeMethod,
            8 => FrameType::MethodType,
            9 => FrameType::Compiled,
            _ => return None,
        })
    }

    /// Fixed size in words, excluding variable trailing data.
    pub fn words(self) -> usize {
        match self {
            FrameType::EndOfStack => 0,
            FrameType::GenericSpecial => SPECIAL_FRAME_WORDS,
            FrameType::Method | FrameType::NativeMethod | FrameType::JniNativeMethod => {
                METHOD_FRAME_WORDS
            }
            FrameType::CallIn => CALL_IN_FRAME_WORDS,
            FrameType::MethodType => METHOD_TYPE_FRAME_WORDS,
            FrameType::JitResolve => JIT_RESOLVE_FRAME_WORDS,
            FrameType::J2I => J2I_FRAME_WORDS,
            FrameType::Compiled => COMPILED_FRAME_WORDS,
        }
    }

    /// Whether the frame carries a method pointer in its lowest word.
    pub fn carries_method(self) -> bool {
        matches!(
            self,
            FrameType::Method
                | FrameType::NativeMethod
                | FrameType::JniNativeMethod
                | FrameType::Compiled
        )
    }
}

/// Interpreted call: `[savedCP, savedPC, savedA0]`.
pub const STACK_FRAME_WORDS: usize = 3;
/// `[flags, tail]`
pub const SPECIAL_FRAME_WORDS: usize = 4;
/// `[method, flags, tail]`
pub const METHOD_FRAME_WORDS: usize = 5;
/// `[exitAddress, flags, tail]`
pub const CALL_IN_FRAME_WORDS: usize = 5;
/// `[methodType, argStackSlots, descriptionCount, flags, tail]`
pub const METHOD_TYPE_FRAME_WORDS: usize = 7;
/// `[savedJitException, flags, parmCount, returnAddress, taggedReturnSP, tail]`
pub const JIT_RESOLVE_FRAME_WORDS: usize = 8;
/// `[i2jState(4), previousJ2I, calleeSaved.., flags, exitPoint,
/// returnAddress, taggedReturnSP, tail]`
pub const J2I_FRAME_WORDS: usize = 4 + 1 + CALLEE_SAVED_COUNT + 4 + 3;
/// `[entry, bytecodePC, method, tail]`, below the locals.
pub const COMPILED_FRAME_WORDS: usize = 6;

// =============================================================================
// Tag helpers
// =============================================================================

#[inline]
pub fn tag_a0(a0: usize, tags: Word) -> Word {
    ((a0 as Word) << A0_TAG_BITS) | (tags & A0_TAG_MASK)
}

#[inline]
pub fn untag_a0(word: Word) -> usize {
    (word >> A0_TAG_BITS) as usize
}

#[inline]
pub fn a0_tags(word: Word) -> Word {
    word & A0_TAG_MASK
}

#[inline]
fn literals_word(literals: Option<MethodId>) -> Word {
    literals.map_or(0, MethodId::to_word)
}

/// Saved-a0 tags of the frame whose saved-a0 slot is at `bp`.
pub fn frame_tags(ctx: &ExecutionContext, bp: usize) -> Word {
    a0_tags(ctx.stack.read(bp))
}

pub fn set_frame_tags(ctx: &mut ExecutionContext, bp: usize, tags: Word) {
    let saved = ctx.stack.read(bp);
    ctx.stack.write(bp, tag_a0(untag_a0(saved), tags));
}

/// Registers saved in the tail of the frame whose saved-a0 slot is at `bp`.
pub fn saved_registers(ctx: &ExecutionContext, bp: usize) -> (Option<MethodId>, usize, usize) {
    (
        MethodId::from_word(ctx.stack.read(bp - 2)),
        ctx.stack.read(bp - 1) as usize,
        untag_a0(ctx.stack.read(bp)),
    )
}

// =============================================================================
// Shared tail
// =============================================================================

/// Push a special frame of `words` words and point the registers at it.
/// Returns the address of the frame's lowest word.
fn push_special(ctx: &mut ExecutionContext, words: usize, kind: FrameType, tags: Word) -> usize {
    let frame = ctx.sp - words;
    let bp = frame + words - 1;
    ctx.stack.write(bp - 2, literals_word(ctx.literals));
    ctx.stack.write(bp - 1, ctx.pc as Word);
    ctx.stack.write(bp, tag_a0(ctx.a0, tags));
    ctx.sp = frame;
    ctx.a0 = bp;
    ctx.pc = kind as usize;
    ctx.literals = None;
    frame
}

/// Inverse of the tail half of [`push_special`].
fn pop_tail(ctx: &mut ExecutionContext, bp: usize) {
    let (literals, pc, a0) = saved_registers(ctx, bp);
    ctx.literals = literals;
    ctx.pc = pc;
    ctx.a0 = a0;
    ctx.sp = bp + 1;
}

/// Lowest address of the special frame whose frame base is `bp`.
#[inline]
pub fn special_frame_start(kind: FrameType, bp: usize) -> usize {
    bp + 1 - kind.words()
}

// =============================================================================
// Generic special frame
// =============================================================================

pub fn build_special_frame(ctx: &mut ExecutionContext, flags: Word) -> usize {
    let frame = push_special(ctx, SPECIAL_FRAME_WORDS, FrameType::GenericSpecial, 0);
    ctx.stack.write(frame, flags);
    ctx.a0
}

/// Returns the frame's flags.
pub fn restore_special_frame(ctx: &mut ExecutionContext, frame_base: usize) -> Word {
    let flags = ctx.stack.read(frame_base - 3);
    pop_tail(ctx, frame_base);
    flags
}

// =============================================================================
// Interpreted method frame
// =============================================================================

/// Enter `method` with its arguments already on the operand stack.
///
/// Zeroes the temporaries, stores the monitor object of synchronized methods,
/// pushes `[savedCP, savedPC, savedA0]` and switches the registers to the new
/// method at bytecode offset 0.
pub fn build_method_frame(
    ctx: &mut ExecutionContext,
    method: &Method,
    sync_object: ObjectRef,
    tags: Word,
) -> usize {
    let new_a0 = ctx.sp + method.arg_slots - 1;
    for _ in 0..method.temp_count() {
        ctx.push(0);
    }
    if method.is_synchronized() {
        ctx.push(sync_object.to_word());
    }
    let frame = ctx.sp - STACK_FRAME_WORDS;
    ctx.stack.write(frame, literals_word(ctx.literals));
    ctx.stack.write(frame + 1, ctx.pc as Word);
    ctx.stack.write(frame + 2, tag_a0(ctx.a0, tags));
    ctx.sp = frame;
    ctx.a0 = new_a0;
    ctx.literals = Some(method.id);
    ctx.pc = PC_BIAS;
    new_a0
}

/// Address of the saved-a0 slot of an interpreted frame.
#[inline]
pub fn method_frame_bp(method: &Method, frame_base: usize) -> usize {
    frame_base - method.locals_and_sync()
}

/// Stack pointer of an empty operand stack in an interpreted frame.
#[inline]
pub fn operand_stack_base(method: &Method, frame_base: usize) -> usize {
    method_frame_bp(method, frame_base) - (STACK_FRAME_WORDS - 1)
}

/// The monitor slot of a synchronized method's frame.
pub fn sync_object(ctx: &ExecutionContext, method: &Method, frame_base: usize) -> ObjectRef {
    ObjectRef::from_word(ctx.stack.read(method_frame_bp(method, frame_base) + 1))
}

/// Pop an interpreted frame, leaving the caller with the arguments still on
/// its operand stack. Returns the saved-a0 tags.
pub fn restore_method_frame(ctx: &mut ExecutionContext, method: &Method, frame_base: usize) -> Word {
    let bp = method_frame_bp(method, frame_base);
    let tags = frame_tags(ctx, bp);
    pop_tail(ctx, bp);
    ctx.sp = frame_base + 1 - method.arg_slots;
    tags
}

// =============================================================================
// Method-carrying special frames (describing, native, JNI native)
// =============================================================================

pub fn build_method_special_frame(
    ctx: &mut ExecutionContext,
    kind: FrameType,
    method: MethodId,
    flags: Word,
    tags: Word,
) -> usize {
    debug_assert!(kind.carries_method());
    let frame = push_special(ctx, METHOD_FRAME_WORDS, kind, tags);
    ctx.stack.write(frame, method.to_word());
    ctx.stack.write(frame + 1, flags);
    ctx.a0
}

/// Returns the method and flags the frame carried.
pub fn restore_method_special_frame(
    ctx: &mut ExecutionContext,
    frame_base: usize,
) -> (Option<MethodId>, Word) {
    let frame = frame_base + 1 - METHOD_FRAME_WORDS;
    let method = MethodId::from_word(ctx.stack.read(frame));
    let flags = ctx.stack.read(frame + 1);
    pop_tail(ctx, frame_base);
    (method, flags)
}

// =============================================================================
// Call-in frame
// =============================================================================

/// Boundary between an embedder call and the interpreter. The saved a0 is
/// tagged invisible: the frame belongs to no Java method.
pub fn build_call_in_frame(ctx: &mut ExecutionContext, exit_address: Word, flags: Word) -> usize {
    let frame = push_special(ctx, CALL_IN_FRAME_WORDS, FrameType::CallIn, A0_INVISIBLE_TAG);
    ctx.stack.write(frame, exit_address);
    ctx.stack.write(frame + 1, flags);
    ctx.a0
}

/// Returns `(exit_address, flags)`.
pub fn restore_call_in_frame(ctx: &mut ExecutionContext, frame_base: usize) -> (Word, Word) {
    let frame = frame_base + 1 - CALL_IN_FRAME_WORDS;
    let exit_address = ctx.stack.read(frame);
    let flags = ctx.stack.read(frame + 1);
    pop_tail(ctx, frame_base);
    (exit_address, flags)
}

// =============================================================================
// Method-type frame
// =============================================================================

/// Saved while a method handle adapts its arguments. `description` words sit
/// above the frame, between it and the arguments.
pub fn build_method_type_frame(
    ctx: &mut ExecutionContext,
    method_type: ObjectRef,
    arg_slots: usize,
    description: &[Word],
) -> usize {
    for &word in description.iter().rev() {
        ctx.push(word);
    }
    let frame = push_special(ctx, METHOD_TYPE_FRAME_WORDS, FrameType::MethodType, 0);
    ctx.stack.write(frame, method_type.to_word());
    ctx.stack.write(frame + 1, arg_slots as Word);
    ctx.stack.write(frame + 2, description.len() as Word);
    ctx.stack.write(frame + 3, 0);
    ctx.a0
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTypeFrame {
    pub method_type: ObjectRef,
    pub arg_slots: usize,
    pub description: Vec<Word>,
}

pub fn restore_method_type_frame(ctx: &mut ExecutionContext, frame_base: usize) -> MethodTypeFrame {
    let frame = frame_base + 1 - METHOD_TYPE_FRAME_WORDS;
    let method_type = ObjectRef::from_word(ctx.stack.read(frame));
    let arg_slots = ctx.stack.read(frame + 1) as usize;
    let count = ctx.stack.read(frame + 2) as usize;
    let description = ctx.stack.slice(frame_base + 1, frame_base + 1 + count).to_vec();
    pop_tail(ctx, frame_base);
    ctx.sp += count;
    MethodTypeFrame {
        method_type,
        arg_slots,
        description,
    }
}

// =============================================================================
// JIT resolve frame
// =============================================================================

/// State a compiled-code helper saves before doing anything that may walk
/// the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JitResolveState {
    pub saved_exception: ObjectRef,
    pub flags: Word,
    pub parm_count: usize,
    pub return_address: Word,
    /// Stack pointer of the compiled code at the call.
    pub return_sp: usize,
}

pub fn build_jit_resolve_frame(ctx: &mut ExecutionContext, state: &JitResolveState) -> usize {
    let frame = push_special(ctx, JIT_RESOLVE_FRAME_WORDS, FrameType::JitResolve, 0);
    ctx.stack.write(frame, state.saved_exception.to_word());
    ctx.stack.write(frame + 1, state.flags);
    ctx.stack.write(frame + 2, state.parm_count as Word);
    ctx.stack.write(frame + 3, state.return_address);
    ctx.stack.write(frame + 4, state.return_sp as Word);
    ctx.a0
}

pub fn read_jit_resolve_frame(ctx: &ExecutionContext, frame_base: usize) -> JitResolveState {
    let frame = frame_base + 1 - JIT_RESOLVE_FRAME_WORDS;
    JitResolveState {
        saved_exception: ObjectRef::from_word(ctx.stack.read(frame)),
        flags: ctx.stack.read(frame + 1),
        parm_count: ctx.stack.read(frame + 2) as usize,
        return_address: ctx.stack.read(frame + 3),
        return_sp: ctx.stack.read(frame + 4) as usize,
    }
}

pub fn restore_jit_resolve_frame(ctx: &mut ExecutionContext, frame_base: usize) -> JitResolveState {
    let state = read_jit_resolve_frame(ctx, frame_base);
    pop_tail(ctx, frame_base);
    state
}

// =============================================================================
// J2I frame
// =============================================================================

/// Interpreter registers stashed by an i2j transition, restored when the
/// compiled callee returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct I2JState {
    pub return_sp: usize,
    pub a0: usize,
    pub literals: Option<MethodId>,
    pub pc: usize,
}

/// Everything a j2i transition must put back before compiled code resumes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct J2IState {
    /// The i2j record of the compiled region below this frame.
    pub i2j: Option<I2JState>,
    pub previous_j2i: usize,
    pub callee_saved: [Word; CALLEE_SAVED_COUNT],
    pub flags: Word,
    pub exit_point: Word,
    pub return_address: Word,
    pub return_sp: usize,
}

const J2I_CALLEE_SAVED_OFFSET: usize = 5;
const J2I_FLAGS_OFFSET: usize = J2I_CALLEE_SAVED_OFFSET + CALLEE_SAVED_COUNT;
const J2I_RETURN_ADDRESS_OFFSET: usize = J2I_FLAGS_OFFSET + 2;

pub fn build_j2i_frame(ctx: &mut ExecutionContext, state: &J2IState) -> usize {
    let frame = push_special(ctx, J2I_FRAME_WORDS, FrameType::J2I, 0);
    let i2j = state.i2j.unwrap_or_default();
    ctx.stack.write(frame, i2j.return_sp as Word);
    ctx.stack.write(frame + 1, i2j.a0 as Word);
    ctx.stack.write(frame + 2, literals_word(i2j.literals));
    ctx.stack.write(frame + 3, i2j.pc as Word);
    ctx.stack.write(frame + 4, state.previous_j2i as Word);
    for (i, &word) in state.callee_saved.iter().enumerate() {
        ctx.stack.write(frame + J2I_CALLEE_SAVED_OFFSET + i, word);
    }
    ctx.stack.write(frame + J2I_FLAGS_OFFSET, state.flags);
    ctx.stack.write(frame + J2I_FLAGS_OFFSET + 1, state.exit_point);
    ctx.stack.write(frame + J2I_RETURN_ADDRESS_OFFSET, state.return_address);
    ctx.stack.write(frame + J2I_RETURN_ADDRESS_OFFSET + 1, state.return_sp as Word);
    ctx.a0
}

pub fn read_j2i_frame(ctx: &ExecutionContext, frame_base: usize) -> J2IState {
    let frame = frame_base + 1 - J2I_FRAME_WORDS;
    let return_sp = ctx.stack.read(frame) as usize;
    let i2j = (return_sp != 0).then(|| I2JState {
        return_sp,
        a0: ctx.stack.read(frame + 1) as usize,
        literals: MethodId::from_word(ctx.stack.read(frame + 2)),
        pc: ctx.stack.read(frame + 3) as usize,
    });
    let mut callee_saved = [0; CALLEE_SAVED_COUNT];
    for (i, slot) in callee_saved.iter_mut().enumerate() {
        *slot = ctx.stack.read(frame + J2I_CALLEE_SAVED_OFFSET + i);
    }
    J2IState {
        i2j,
        previous_j2i: ctx.stack.read(frame + 4) as usize,
        callee_saved,
        flags: ctx.stack.read(frame + J2I_FLAGS_OFFSET),
        exit_point: ctx.stack.read(frame + J2I_FLAGS_OFFSET + 1),
        return_address: ctx.stack.read(frame + J2I_RETURN_ADDRESS_OFFSET),
        return_sp: ctx.stack.read(frame + J2I_RETURN_ADDRESS_OFFSET + 1) as usize,
    }
}

/// Redirect where the compiled caller of this J2I frame resumes.
pub fn patch_j2i_return_address(ctx: &mut ExecutionContext, frame_base: usize, address: Word) {
    let frame = frame_base + 1 - J2I_FRAME_WORDS;
    ctx.stack.write(frame + J2I_RETURN_ADDRESS_OFFSET, address);
}

pub fn restore_j2i_frame(ctx: &mut ExecutionContext, frame_base: usize) -> J2IState {
    let state = read_j2i_frame(ctx, frame_base);
    pop_tail(ctx, frame_base);
    state
}

// =============================================================================
// Compiled frame
// =============================================================================

/// Enter a compiled body with its arguments on the operand stack. The
/// locals keep the interpreter layout so the frame can be turned into an
/// interpreted one in place. Returns the frame base (`a0` while it runs).
pub fn build_compiled_frame(ctx: &mut ExecutionContext, method: &Method, entry: usize) -> usize {
    for _ in 0..method.temp_count() {
        ctx.push(0);
    }
    let frame = push_special(ctx, COMPILED_FRAME_WORDS, FrameType::Compiled, 0);
    ctx.stack.write(frame, entry as Word);
    ctx.stack.write(frame + 1, 0);
    ctx.stack.write(frame + 2, method.id.to_word());
    ctx.a0
}

/// Address of local 0 of the compiled frame at `frame_base`.
#[inline]
pub fn compiled_locals(method: &Method, frame_base: usize) -> usize {
    frame_base + method.max_locals
}

pub fn compiled_frame_method(ctx: &ExecutionContext, frame_base: usize) -> Option<MethodId> {
    MethodId::from_word(ctx.stack.read(frame_base - 3))
}

/// Bytecode offset the compiled frame last published.
pub fn compiled_frame_pc(ctx: &ExecutionContext, frame_base: usize) -> usize {
    ctx.stack.read(frame_base - 4) as usize
}

pub fn set_compiled_frame_pc(ctx: &mut ExecutionContext, frame_base: usize, pc: usize) {
    ctx.stack.write(frame_base - 4, pc as Word);
}

pub fn compiled_frame_entry(ctx: &ExecutionContext, frame_base: usize) -> usize {
    ctx.stack.read(frame_base - 5) as usize
}

/// Pop a compiled frame, leaving the caller with the arguments still on its
/// operand stack.
pub fn restore_compiled_frame(ctx: &mut ExecutionContext, method: &Method, frame_base: usize) {
    pop_tail(ctx, frame_base);
    ctx.sp = compiled_locals(method, frame_base) + 1 - method.arg_slots;
}

/// Rewrite the compiled frame on top into an interpreted frame resuming at
/// its published bytecode offset. Operand values move up over the header.
pub fn materialize_interpreter_frame(ctx: &mut ExecutionContext, method: &Method, frame_base: usize) {
    debug_assert!(!method.is_synchronized());
    let pc = compiled_frame_pc(ctx, frame_base);
    let header_low = special_frame_start(FrameType::Compiled, frame_base);
    let shift = COMPILED_FRAME_WORDS - STACK_FRAME_WORDS;
    let mut addr = header_low;
    while addr > ctx.sp {
        addr -= 1;
        let word = ctx.stack.read(addr);
        ctx.stack.write(addr + shift, word);
    }
    ctx.sp += shift;
    ctx.a0 = compiled_locals(method, frame_base);
    ctx.literals = Some(method.id);
    ctx.set_bytecode_pc(pc);
}

// =============================================================================
// Generic pop
// =============================================================================

/// Pop whatever special frame is on top, returning its type. Used by the
/// exception unwinder for frames that need no further processing.
pub fn restore_any_special_frame(ctx: &mut ExecutionContext) -> Option<FrameType> {
    let kind = FrameType::from_pc(ctx.pc)?;
    let bp = ctx.a0;
    match kind {
        FrameType::EndOfStack => return None,
        FrameType::MethodType => {
            restore_method_type_frame(ctx, bp);
        }
        _ => pop_tail(ctx, bp),
    }
    Some(kind)
}
