//! The Level Two IR: typed registers, instructions with static operand
//! roles, and chunks with invalidation bookkeeping.
//!
//! A chunk is an ordered instruction sequence; control flow targets are
//! instruction offsets within the same chunk. Boxed registers hold values,
//! int registers hold machine integers for the unboxed arithmetic paths.
//! Constants (values, types, atoms, code references) are embedded in the
//! instructions directly.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use smallvec::SmallVec;

use crate::mk_id;
use crate::types::code::{PrimitiveId, RawFunction};
use crate::types::ty::Ty;
use crate::types::value::{Atom, Value};

mk_id! {
  /// A chunk's index in the runtime's chunk arena.
  ChunkId,
  /// A boxed (value-holding) register.
  L2Reg,
  /// An unboxed machine-integer register.
  L2IntReg,
}

impl ChunkId {
  /// The shared default chunk: a loop stepping the L1 interpreter.
  pub const DEFAULT: Self = Self(0);
}

/// The register holding the caller continuation on chunk entry.
pub const REG_CALLER: L2Reg = L2Reg(0);
/// The register holding the running function on chunk entry.
pub const REG_FUNCTION: L2Reg = L2Reg(1);
/// The first register backing a continuation slot; slot `i` (one-based)
/// lives in architectural register `ARCH_FIXED + i - 1`.
pub const ARCH_FIXED: u32 = 2;

/// An offset into a chunk's instruction sequence.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct L2Pc(pub u32);

impl fmt::Debug for L2Pc {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "->{}", self.0) }
}

/// A Level Two instruction. Every operand declares its role by position:
/// read registers, write registers, embedded constants, and successor pcs.
#[derive(Clone, Debug)]
pub enum L2Instr {
  /// `dst ← src`.
  Move {
    /// Source register.
    src: L2Reg,
    /// Destination register.
    dst: L2Reg,
  },
  /// `dst ← constant`.
  MoveConstant {
    /// The constant value.
    value: Value,
    /// Destination register.
    dst: L2Reg,
  },
  /// `dst ← immediate` into an int register.
  MoveIntConstant {
    /// The immediate integer.
    value: i64,
    /// Destination int register.
    dst: L2IntReg,
  },
  /// `dst ← nil`.
  Clear {
    /// Destination register.
    dst: L2Reg,
  },
  /// `dst ← immutable(src)`.
  MakeImmutable {
    /// Source register.
    src: L2Reg,
    /// Destination register.
    dst: L2Reg,
  },
  /// `dst ← immutable(src)`, subobjects included.
  MakeSubobjectsImmutable {
    /// Source register.
    src: L2Reg,
    /// Destination register.
    dst: L2Reg,
  },
  /// Read a variable's contents; raises on an unassigned variable.
  GetVariable {
    /// The variable.
    var: L2Reg,
    /// Destination register.
    dst: L2Reg,
  },
  /// Read a variable's contents and clear it.
  GetVariableClearing {
    /// The variable.
    var: L2Reg,
    /// Destination register.
    dst: L2Reg,
  },
  /// Write a variable's contents.
  SetVariable {
    /// The variable.
    var: L2Reg,
    /// The value to write.
    value: L2Reg,
  },
  /// Create a fresh unassigned variable.
  CreateVariable {
    /// The content type.
    inner: Ty,
    /// Destination register.
    dst: L2Reg,
  },
  /// Build a function over `code`, capturing the outer registers.
  CreateFunction {
    /// The compiled code.
    code: Arc<RawFunction>,
    /// The captured outer values, in order.
    outers: Vec<L2Reg>,
    /// Destination register.
    dst: L2Reg,
  },
  /// `dst ← function.outers[index]` (one-based).
  ExtractOuter {
    /// The function.
    function: L2Reg,
    /// One-based outer index.
    index: u32,
    /// Destination register.
    dst: L2Reg,
  },
  /// `dst ← parameter type `index` of the function's declared type`.
  FunctionParameterType {
    /// The function.
    function: L2Reg,
    /// One-based parameter index.
    index: u32,
    /// Destination register.
    dst: L2Reg,
  },
  /// `dst ← type of src`.
  GetType {
    /// Source register.
    src: L2Reg,
    /// Destination register.
    dst: L2Reg,
  },
  /// Assemble a tuple from the element registers.
  CreateTuple {
    /// The elements, in order.
    elements: Vec<L2Reg>,
    /// Destination register.
    dst: L2Reg,
  },
  /// Reify the current frame into a continuation object. Slots past the
  /// listed registers are nil.
  CreateContinuation {
    /// The caller continuation (or nil).
    caller: L2Reg,
    /// The running function.
    function: L2Reg,
    /// The L1 pc to resume at.
    pc: u32,
    /// The stack pointer to resume with.
    stackp: u32,
    /// The leading frame slots, in order.
    slots: Vec<L2Reg>,
    /// The offset at which this chunk resumes when the continuation
    /// returns; `None` resumes at `pc` in the L1 interpreter instead.
    resume_offset: Option<u32>,
    /// Destination register.
    dst: L2Reg,
  },
  /// Validity gate at a translated chunk's entry. If the chunk has been
  /// invalidated, fall back to the default chunk at `default_offset`.
  EnterL2Chunk {
    /// The re-entry offset to use in the default chunk.
    default_offset: u32,
  },
  /// Resume a fiber's topmost continuation in the L1 interpreter.
  ReenterL1FromInterrupt,
  /// Return `value` into the `caller` continuation.
  Return {
    /// The caller continuation.
    caller: L2Reg,
    /// The value to return.
    value: L2Reg,
  },
  /// Invoke a known function value with evaluated arguments. The current
  /// frame is reified as the callee's caller, with the call-site expected
  /// type parked in the sentinel slot; on return (normal or after a
  /// suspension) the checked result replaces the sentinel and the chunk
  /// resumes at the next instruction.
  Invoke {
    /// The function to invoke.
    function: L2Reg,
    /// The arguments, in order.
    args: Vec<L2Reg>,
    /// Skip the return-type check when the static type already conforms.
    skip_return_check: bool,
    /// The call-site expected return type.
    expected: Ty,
    /// One-based frame slot receiving the sentinel, then the result.
    sentinel_slot: u32,
    /// The L1 pc a reified frame resumes at.
    reify_pc: u32,
    /// The stack pointer a reified frame resumes with.
    reify_stackp: u32,
  },
  /// Dynamic dispatch through a bundle: look up by argument values, then
  /// invoke as [`L2Instr::Invoke`] does.
  CallBundle {
    /// The message bundle.
    bundle: Atom,
    /// The arguments, in order.
    args: Vec<L2Reg>,
    /// The call-site expected return type.
    expected: Ty,
    /// One-based frame slot receiving the sentinel, then the result.
    sentinel_slot: u32,
    /// The L1 pc a reified frame resumes at.
    reify_pc: u32,
    /// The stack pointer a reified frame resumes with.
    reify_stackp: u32,
  },
  /// Dynamic dispatch by explicit argument types; the argument values do
  /// not participate in the lookup.
  SuperCallBundle {
    /// The message bundle.
    bundle: Atom,
    /// The arguments, in order.
    args: Vec<L2Reg>,
    /// The dispatch types, in order.
    types: Vec<L2Reg>,
    /// The call-site expected return type.
    expected: Ty,
    /// One-based frame slot receiving the sentinel, then the result.
    sentinel_slot: u32,
    /// The L1 pc a reified frame resumes at.
    reify_pc: u32,
    /// The stack pointer a reified frame resumes with.
    reify_stackp: u32,
  },
  /// Run a primitive that was proven infallible for these arguments.
  RunInfalliblePrimitive {
    /// The primitive.
    prim: PrimitiveId,
    /// The arguments, in order.
    args: Vec<L2Reg>,
    /// Check the result against the expected type.
    check: bool,
    /// The call-site expected return type.
    expected: Ty,
    /// The primitive's result.
    dst: L2Reg,
  },
  /// Attempt a fallible primitive inline.
  AttemptInlinePrimitive {
    /// The primitive.
    prim: PrimitiveId,
    /// The arguments, in order.
    args: Vec<L2Reg>,
    /// Check the result against the expected type.
    check: bool,
    /// The call-site expected return type.
    expected: Ty,
    /// The primitive's result, on success.
    dst: L2Reg,
    /// The failure code, on failure.
    failure_dst: L2Reg,
    /// Where to continue on success.
    on_success: L2Pc,
    /// Where to continue on failure.
    on_failure: L2Pc,
  },
  /// Invoke a primitive function's nybblecode fallback after its primitive
  /// failed, seeding the failure variable. Calling conventions are those of
  /// [`L2Instr::Invoke`].
  CallAfterFailedPrimitive {
    /// The function whose primitive failed.
    function: L2Reg,
    /// The original arguments.
    args: Vec<L2Reg>,
    /// The failure code produced by the attempt.
    failure: L2Reg,
    /// The call-site expected return type.
    expected: Ty,
    /// One-based frame slot receiving the sentinel, then the result.
    sentinel_slot: u32,
    /// The L1 pc a reified frame resumes at.
    reify_pc: u32,
    /// The stack pointer a reified frame resumes with.
    reify_stackp: u32,
  },
  /// Unconditional branch.
  Jump {
    /// The target.
    target: L2Pc,
  },
  /// Two-way branch on a type test against a constant type.
  JumpIfKindOfConstant {
    /// The value to test.
    value: L2Reg,
    /// The type tested against.
    ty: Ty,
    /// Taken when the value is an instance.
    if_kind: L2Pc,
    /// Taken otherwise.
    if_not: L2Pc,
  },
  /// Negated form, falling through when the value is an instance.
  JumpIfNotKindOfConstant {
    /// The value to test.
    value: L2Reg,
    /// The type tested against.
    ty: Ty,
    /// Taken when the value is not an instance.
    if_not: L2Pc,
  },
  /// Branch on `a >= b` over int registers.
  JumpIfGreaterOrEqual {
    /// Left operand.
    a: L2IntReg,
    /// Right operand.
    b: L2IntReg,
    /// Taken when `a >= b`.
    if_ge: L2Pc,
    /// Taken otherwise.
    if_lt: L2Pc,
  },
  /// `dst ← a + b` with an overflow edge.
  AddInt {
    /// Left operand.
    a: L2IntReg,
    /// Right operand.
    b: L2IntReg,
    /// The sum.
    dst: L2IntReg,
    /// Taken on overflow.
    on_overflow: L2Pc,
    /// Taken on success.
    on_ok: L2Pc,
  },
  /// `dst ← a - b` with an overflow edge.
  SubtractInt {
    /// Left operand.
    a: L2IntReg,
    /// Right operand.
    b: L2IntReg,
    /// The difference.
    dst: L2IntReg,
    /// Taken on overflow.
    on_overflow: L2Pc,
    /// Taken on success.
    on_ok: L2Pc,
  },
  /// `dst ← a × b` with an overflow edge.
  MultiplyInt {
    /// Left operand.
    a: L2IntReg,
    /// Right operand.
    b: L2IntReg,
    /// The product.
    dst: L2IntReg,
    /// Taken on overflow.
    on_overflow: L2Pc,
    /// Taken on success.
    on_ok: L2Pc,
  },
  /// Floored division with a non-negative remainder. The quotient rounds
  /// toward −∞; dividend = `i64::MIN` with divisor `-1` is out of range.
  DivideIntByInt {
    /// The dividend.
    dividend: L2IntReg,
    /// The divisor.
    divisor: L2IntReg,
    /// The quotient.
    quotient: L2IntReg,
    /// The remainder.
    remainder: L2IntReg,
    /// Taken when the quotient does not fit.
    on_out_of_range: L2Pc,
    /// Taken on a zero divisor.
    on_zero_divisor: L2Pc,
    /// Taken on success.
    on_ok: L2Pc,
  },
  /// Box an int register into a value.
  BoxInt {
    /// Source int register.
    src: L2IntReg,
    /// Destination register.
    dst: L2Reg,
  },
  /// Unbox a value into an int register, branching when it is not a
  /// machine-range integer.
  UnboxInt {
    /// Source register.
    src: L2Reg,
    /// Destination int register.
    dst: L2IntReg,
    /// Taken on success.
    on_ok: L2Pc,
    /// Taken when the value does not fit.
    on_fail: L2Pc,
  },
  /// Decrement the raw function's countdown; at zero, retranslate at
  /// `level` and re-enter the new chunk.
  DecrementCounterAndReoptimizeOnZero {
    /// The optimisation level to translate at.
    level: u8,
  },
  /// A note kept through optimisation for disassembly only.
  Comment(
    /// The text.
    String,
  ),
}

impl L2Instr {
  /// The explicit successor pcs. Empty for straight-line instructions,
  /// which fall through, and for `Return`/`ReenterL1FromInterrupt`.
  #[must_use] pub fn successors(&self) -> SmallVec<[L2Pc; 3]> {
    match *self {
      Self::Jump { target } => SmallVec::from_slice(&[target]),
      Self::JumpIfKindOfConstant { if_kind, if_not, .. } =>
        SmallVec::from_slice(&[if_kind, if_not]),
      Self::JumpIfNotKindOfConstant { if_not, .. } => SmallVec::from_slice(&[if_not]),
      Self::JumpIfGreaterOrEqual { if_ge, if_lt, .. } => SmallVec::from_slice(&[if_ge, if_lt]),
      Self::AddInt { on_overflow, on_ok, .. }
      | Self::SubtractInt { on_overflow, on_ok, .. }
      | Self::MultiplyInt { on_overflow, on_ok, .. } =>
        SmallVec::from_slice(&[on_overflow, on_ok]),
      Self::DivideIntByInt { on_out_of_range, on_zero_divisor, on_ok, .. } =>
        SmallVec::from_slice(&[on_out_of_range, on_zero_divisor, on_ok]),
      Self::UnboxInt { on_ok, on_fail, .. } => SmallVec::from_slice(&[on_ok, on_fail]),
      Self::AttemptInlinePrimitive { on_success, on_failure, .. } =>
        SmallVec::from_slice(&[on_success, on_failure]),
      _ => SmallVec::new(),
    }
  }

  /// Whether removing the instruction could change observable behaviour
  /// even when its destinations are dead. Conservatively true for any
  /// branch, invocation, primitive attempt, variable write or read (reads
  /// can raise), interrupt re-entry, counter, and chunk entry.
  #[must_use] pub fn has_side_effect(&self) -> bool {
    match self {
      Self::Move { .. }
      | Self::MoveConstant { .. }
      | Self::MoveIntConstant { .. }
      | Self::Clear { .. }
      | Self::MakeImmutable { .. }
      | Self::MakeSubobjectsImmutable { .. }
      | Self::CreateVariable { .. }
      | Self::CreateFunction { .. }
      | Self::ExtractOuter { .. }
      | Self::FunctionParameterType { .. }
      | Self::GetType { .. }
      | Self::CreateTuple { .. }
      | Self::BoxInt { .. }
      | Self::Comment(_) => false,
      _ => true,
    }
  }

  /// The boxed registers this instruction reads.
  #[must_use] pub fn sources(&self) -> SmallVec<[L2Reg; 4]> {
    let mut out = SmallVec::new();
    self.visit_sources(|r| out.push(r));
    out
  }

  fn visit_sources(&self, mut f: impl FnMut(L2Reg)) {
    match self {
      Self::Move { src, .. }
      | Self::MakeImmutable { src, .. }
      | Self::MakeSubobjectsImmutable { src, .. }
      | Self::GetType { src, .. }
      | Self::UnboxInt { src, .. } => f(*src),
      Self::GetVariable { var, .. } | Self::GetVariableClearing { var, .. } => f(*var),
      Self::SetVariable { var, value } => { f(*var); f(*value) }
      Self::CreateFunction { outers, .. } => outers.iter().copied().for_each(f),
      Self::ExtractOuter { function, .. } | Self::FunctionParameterType { function, .. } =>
        f(*function),
      Self::CreateTuple { elements, .. } => elements.iter().copied().for_each(f),
      Self::CreateContinuation { caller, function, slots, .. } => {
        f(*caller);
        f(*function);
        slots.iter().copied().for_each(f);
      }
      Self::Return { caller, value } => { f(*caller); f(*value) }
      Self::Invoke { function, args, .. } => {
        f(*function);
        args.iter().copied().for_each(f);
      }
      Self::CallBundle { args, .. } => args.iter().copied().for_each(f),
      Self::SuperCallBundle { args, types, .. } => {
        args.iter().copied().for_each(&mut f);
        types.iter().copied().for_each(f);
      }
      Self::RunInfalliblePrimitive { args, .. } => args.iter().copied().for_each(f),
      Self::AttemptInlinePrimitive { args, .. } => args.iter().copied().for_each(f),
      Self::CallAfterFailedPrimitive { function, args, failure, .. } => {
        f(*function);
        args.iter().copied().for_each(&mut f);
        f(*failure);
      }
      Self::JumpIfKindOfConstant { value, .. }
      | Self::JumpIfNotKindOfConstant { value, .. } => f(*value),
      _ => {}
    }
  }

  /// Rewrite every boxed read operand through `f`; used by move elimination.
  pub fn rewrite_sources(&mut self, mut f: impl FnMut(L2Reg) -> L2Reg) {
    match self {
      Self::Move { src, .. }
      | Self::MakeImmutable { src, .. }
      | Self::MakeSubobjectsImmutable { src, .. }
      | Self::GetType { src, .. }
      | Self::UnboxInt { src, .. } => *src = f(*src),
      Self::GetVariable { var, .. } | Self::GetVariableClearing { var, .. } => *var = f(*var),
      Self::SetVariable { var, value } => {
        *var = f(*var);
        *value = f(*value);
      }
      Self::CreateFunction { outers, .. } =>
        outers.iter_mut().for_each(|r| *r = f(*r)),
      Self::ExtractOuter { function, .. } | Self::FunctionParameterType { function, .. } =>
        *function = f(*function),
      Self::CreateTuple { elements, .. } =>
        elements.iter_mut().for_each(|r| *r = f(*r)),
      Self::CreateContinuation { caller, function, slots, .. } => {
        *caller = f(*caller);
        *function = f(*function);
        slots.iter_mut().for_each(|r| *r = f(*r));
      }
      Self::Return { caller, value } => {
        *caller = f(*caller);
        *value = f(*value);
      }
      Self::Invoke { function, args, .. } => {
        *function = f(*function);
        args.iter_mut().for_each(|r| *r = f(*r));
      }
      Self::CallBundle { args, .. } => args.iter_mut().for_each(|r| *r = f(*r)),
      Self::SuperCallBundle { args, types, .. } => {
        args.iter_mut().for_each(|r| *r = f(*r));
        types.iter_mut().for_each(|r| *r = f(*r));
      }
      Self::RunInfalliblePrimitive { args, .. } => args.iter_mut().for_each(|r| *r = f(*r)),
      Self::AttemptInlinePrimitive { args, .. } => args.iter_mut().for_each(|r| *r = f(*r)),
      Self::CallAfterFailedPrimitive { function, args, failure, .. } => {
        *function = f(*function);
        args.iter_mut().for_each(|r| *r = f(*r));
        *failure = f(*failure);
      }
      Self::JumpIfKindOfConstant { value, .. }
      | Self::JumpIfNotKindOfConstant { value, .. } => *value = f(*value),
      _ => {}
    }
  }

  /// Rewrite every register operand, boxed and int, read and write, for
  /// the final colouring pass.
  pub fn rewrite_regs(
    &mut self,
    mut fb: impl FnMut(L2Reg) -> L2Reg,
    mut fi: impl FnMut(L2IntReg) -> L2IntReg,
  ) {
    self.rewrite_sources(&mut fb);
    match self {
      Self::Move { dst, .. }
      | Self::MoveConstant { dst, .. }
      | Self::Clear { dst }
      | Self::MakeImmutable { dst, .. }
      | Self::MakeSubobjectsImmutable { dst, .. }
      | Self::GetVariable { dst, .. }
      | Self::GetVariableClearing { dst, .. }
      | Self::CreateVariable { dst, .. }
      | Self::CreateFunction { dst, .. }
      | Self::ExtractOuter { dst, .. }
      | Self::FunctionParameterType { dst, .. }
      | Self::GetType { dst, .. }
      | Self::CreateTuple { dst, .. }
      | Self::CreateContinuation { dst, .. }
      | Self::RunInfalliblePrimitive { dst, .. }
      | Self::BoxInt { dst, .. } => *dst = fb(*dst),
      Self::AttemptInlinePrimitive { dst, failure_dst, .. } => {
        *dst = fb(*dst);
        *failure_dst = fb(*failure_dst);
      }
      _ => {}
    }
    match self {
      Self::MoveIntConstant { dst, .. } => *dst = fi(*dst),
      Self::JumpIfGreaterOrEqual { a, b, .. } => {
        *a = fi(*a);
        *b = fi(*b);
      }
      Self::AddInt { a, b, dst, .. }
      | Self::SubtractInt { a, b, dst, .. }
      | Self::MultiplyInt { a, b, dst, .. } => {
        *a = fi(*a);
        *b = fi(*b);
        *dst = fi(*dst);
      }
      Self::DivideIntByInt { dividend, divisor, quotient, remainder, .. } => {
        *dividend = fi(*dividend);
        *divisor = fi(*divisor);
        *quotient = fi(*quotient);
        *remainder = fi(*remainder);
      }
      Self::BoxInt { src, .. } => *src = fi(*src),
      Self::UnboxInt { dst, .. } => *dst = fi(*dst),
      _ => {}
    }
  }

  /// Rewrite every explicit control-flow target, including a reified
  /// frame's resume offset; used when instructions are removed.
  pub fn rewrite_targets(&mut self, mut f: impl FnMut(u32) -> u32) {
    match self {
      Self::Jump { target } => target.0 = f(target.0),
      Self::JumpIfKindOfConstant { if_kind, if_not, .. } => {
        if_kind.0 = f(if_kind.0);
        if_not.0 = f(if_not.0);
      }
      Self::JumpIfNotKindOfConstant { if_not, .. } => if_not.0 = f(if_not.0),
      Self::JumpIfGreaterOrEqual { if_ge, if_lt, .. } => {
        if_ge.0 = f(if_ge.0);
        if_lt.0 = f(if_lt.0);
      }
      Self::AddInt { on_overflow, on_ok, .. }
      | Self::SubtractInt { on_overflow, on_ok, .. }
      | Self::MultiplyInt { on_overflow, on_ok, .. } => {
        on_overflow.0 = f(on_overflow.0);
        on_ok.0 = f(on_ok.0);
      }
      Self::DivideIntByInt { on_out_of_range, on_zero_divisor, on_ok, .. } => {
        on_out_of_range.0 = f(on_out_of_range.0);
        on_zero_divisor.0 = f(on_zero_divisor.0);
        on_ok.0 = f(on_ok.0);
      }
      Self::UnboxInt { on_ok, on_fail, .. } => {
        on_ok.0 = f(on_ok.0);
        on_fail.0 = f(on_fail.0);
      }
      Self::AttemptInlinePrimitive { on_success, on_failure, .. } => {
        on_success.0 = f(on_success.0);
        on_failure.0 = f(on_failure.0);
      }
      Self::CreateContinuation { resume_offset: Some(off), .. } => *off = f(*off),
      _ => {}
    }
  }

  /// Whether execution can continue at the next instruction. Branches with
  /// explicit edges, returns, and interrupt re-entries never fall through;
  /// invocations resume at the following instruction through their reified
  /// frame.
  #[must_use] pub fn falls_through(&self) -> bool {
    match self {
      Self::Jump { .. }
      | Self::JumpIfKindOfConstant { .. }
      | Self::JumpIfGreaterOrEqual { .. }
      | Self::AddInt { .. }
      | Self::SubtractInt { .. }
      | Self::MultiplyInt { .. }
      | Self::DivideIntByInt { .. }
      | Self::UnboxInt { .. }
      | Self::AttemptInlinePrimitive { .. }
      | Self::Return { .. }
      | Self::ReenterL1FromInterrupt => false,
      _ => true,
    }
  }

  /// Whether this instruction transfers control to a callee whose return
  /// re-enters the chunk from a reified frame. Temporaries do not survive
  /// it; only the architectural registers are restored.
  #[must_use] pub fn is_call(&self) -> bool {
    matches!(self,
      Self::Invoke { .. }
      | Self::CallBundle { .. }
      | Self::SuperCallBundle { .. }
      | Self::CallAfterFailedPrimitive { .. })
  }

  /// The int registers this instruction reads.
  #[must_use] pub fn int_sources(&self) -> SmallVec<[L2IntReg; 4]> {
    match *self {
      Self::JumpIfGreaterOrEqual { a, b, .. } => SmallVec::from_slice(&[a, b]),
      Self::AddInt { a, b, .. }
      | Self::SubtractInt { a, b, .. }
      | Self::MultiplyInt { a, b, .. } => SmallVec::from_slice(&[a, b]),
      Self::DivideIntByInt { dividend, divisor, .. } =>
        SmallVec::from_slice(&[dividend, divisor]),
      Self::BoxInt { src, .. } => SmallVec::from_slice(&[src]),
      _ => SmallVec::new(),
    }
  }

  /// The int register this instruction writes, if exactly one. The
  /// division writes two; it is side-effecting and never removed anyway.
  #[must_use] pub fn int_dest(&self) -> Option<L2IntReg> {
    match *self {
      Self::MoveIntConstant { dst, .. }
      | Self::AddInt { dst, .. }
      | Self::SubtractInt { dst, .. }
      | Self::MultiplyInt { dst, .. }
      | Self::UnboxInt { dst, .. } => Some(dst),
      _ => None,
    }
  }

  /// The boxed register this instruction writes, if exactly one.
  #[must_use] pub fn dest(&self) -> Option<L2Reg> {
    match self {
      Self::Move { dst, .. }
      | Self::MoveConstant { dst, .. }
      | Self::Clear { dst }
      | Self::MakeImmutable { dst, .. }
      | Self::MakeSubobjectsImmutable { dst, .. }
      | Self::GetVariable { dst, .. }
      | Self::GetVariableClearing { dst, .. }
      | Self::CreateVariable { dst, .. }
      | Self::CreateFunction { dst, .. }
      | Self::ExtractOuter { dst, .. }
      | Self::FunctionParameterType { dst, .. }
      | Self::GetType { dst, .. }
      | Self::CreateTuple { dst, .. }
      | Self::CreateContinuation { dst, .. }
      | Self::RunInfalliblePrimitive { dst, .. }
      | Self::BoxInt { dst, .. }
      | Self::AttemptInlinePrimitive { dst, .. } => Some(*dst),
      _ => None,
    }
  }
}

/// An optimised translation of a raw function's nybblecodes, or the shared
/// default chunk. Entry is always at offset 0.
pub struct Chunk {
  /// The raw function this chunk was produced for; `None` for the default
  /// chunk.
  pub code: Option<Arc<RawFunction>>,
  /// The instruction sequence.
  pub instructions: Vec<L2Instr>,
  /// The atoms whose method changes must invalidate this chunk.
  pub contingents: Vec<Atom>,
  /// The optimisation level this chunk was translated at.
  pub opt_level: u8,
  /// How many boxed registers the chunk uses.
  pub num_boxed: u32,
  /// How many int registers the chunk uses.
  pub num_int: u32,
  valid: AtomicBool,
}

impl Chunk {
  /// A fresh, valid chunk.
  #[must_use] pub fn new(
    code: Option<Arc<RawFunction>>,
    instructions: Vec<L2Instr>,
    contingents: Vec<Atom>,
    opt_level: u8,
    num_boxed: u32,
    num_int: u32,
  ) -> Self {
    Self {
      code, instructions, contingents, opt_level, num_boxed, num_int,
      valid: AtomicBool::new(true),
    }
  }

  /// Whether the chunk may still be entered or resumed.
  #[must_use] pub fn is_valid(&self) -> bool { self.valid.load(Ordering::Acquire) }

  /// Mark the chunk invalid; its entry gate will route execution back to
  /// the default chunk.
  pub fn invalidate(&self) { self.valid.store(false, Ordering::Release); }
}

impl fmt::Debug for Chunk {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "chunk (level {}, {}):", self.opt_level,
      if self.is_valid() { "valid" } else { "invalid" })?;
    for (i, inst) in self.instructions.iter().enumerate() {
      writeln!(f, "  {i}: {inst:?}")?;
    }
    Ok(())
  }
}
