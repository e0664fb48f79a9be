//! Compiled code: raw functions, the nybblecode instruction set and its
//! packed encoding, and reified continuations.
//!
//! Nybblecodes pack two 4-bit values per byte, high nybble first. Operand
//! integers are variable length: the first nybble selects a (count, offset)
//! pair from a fixed table; `count` further nybbles compose an integer,
//! high first, which is added to `offset`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use arrayvec::ArrayVec;

use crate::types::l2::ChunkId;
use crate::types::ty::Ty;
use crate::types::value::{Value, ValueKind};

/// How many further nybbles each first nybble implies.
pub const OPERAND_NYBBLE_COUNTS: [u32; 16] = [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 1, 1, 2, 4, 8];

/// The offset added to the composed integer for each first nybble.
pub const OPERAND_NYBBLE_OFFSETS: [u64; 16] =
  [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 26, 42, 58, 0, 0];

/// Decoding failures for nybblecode streams.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ReadError {
  /// The stream ended inside an instruction.
  #[error("truncated nybblecode stream")]
  Truncated,
  /// An extended opcode nybble has no assigned operation.
  #[error("unknown extended opcode {0}")]
  UnknownOpcode(u8),
  /// An operand does not fit the operand width.
  #[error("operand overflow")]
  OperandOverflow,
}

/// A Level One operation with decoded operands. Operand integers are
/// zero-based indices into the literal pool, local frame, or outer vector
/// as appropriate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum L1Op {
  /// Look up and invoke the bundle at literal `bundle`, popping the
  /// arguments; `expected` is the literal index of the call-site return
  /// type, pushed as a sentinel until the callee returns.
  Call {
    /// Literal index of the message bundle atom.
    bundle: u32,
    /// Literal index of the expected return type.
    expected: u32,
  },
  /// Push literal `n`.
  PushLiteral(u32),
  /// Push local `n` and clear the slot; the value's last use.
  PushLastLocal(u32),
  /// Push local `n`, made immutable.
  PushLocal(u32),
  /// Push outer `n`; a mutable holder would be cleared, a shared one kept.
  PushLastOuter(u32),
  /// Build a function over code literal `literal`, capturing the top
  /// `outers` stack values.
  Close {
    /// How many outers to pop.
    outers: u32,
    /// Literal index of the raw function.
    literal: u32,
  },
  /// Pop the stack into local variable `n`.
  SetLocal(u32),
  /// Read local variable `n` and clear it; the content's last use.
  GetLocalClearing(u32),
  /// Push outer `n`, made immutable.
  PushOuter(u32),
  /// Discard the top of stack; only legal at statement end.
  Pop,
  /// Read outer variable `n` and clear it.
  GetOuterClearing(u32),
  /// Pop the stack into outer variable `n`.
  SetOuter(u32),
  /// Read local variable `n`, result made immutable.
  GetLocal(u32),
  /// Pop `n` values and push the tuple of them.
  MakeTuple(u32),
  /// Read outer variable `n`, result made immutable.
  GetOuter(u32),
  /// Push a label continuation restarting the current frame, with only the
  /// arguments preserved.
  PushLabel,
  /// Read the variable at literal `n`.
  GetLiteral(u32),
  /// Pop the stack into the variable at literal `n`.
  SetLiteral(u32),
  /// Push the variable object at literal `n` itself.
  PushLiteralVar(u32),
  /// Duplicate the top of stack, made immutable.
  Duplicate,
  /// Push the type of the stack entry `n` slots below the top.
  GetType(u32),
  /// Look up and invoke by explicit argument types: pops the type tuple,
  /// then the arguments; only the types participate in dispatch.
  SuperCall {
    /// Literal index of the message bundle atom.
    bundle: u32,
    /// Literal index of the expected return type.
    expected: u32,
  },
}

const EXT_OPCODE: u8 = 15;

impl L1Op {
  /// Append this operation's nybbles to a writer.
  pub fn write(self, w: &mut NybbleWriter) {
    match self {
      Self::Call { bundle, expected } => { w.nybble(0); w.operand(bundle); w.operand(expected) }
      Self::PushLiteral(n) => { w.nybble(1); w.operand(n) }
      Self::PushLastLocal(n) => { w.nybble(2); w.operand(n) }
      Self::PushLocal(n) => { w.nybble(3); w.operand(n) }
      Self::PushLastOuter(n) => { w.nybble(4); w.operand(n) }
      Self::Close { outers, literal } => { w.nybble(5); w.operand(outers); w.operand(literal) }
      Self::SetLocal(n) => { w.nybble(6); w.operand(n) }
      Self::GetLocalClearing(n) => { w.nybble(7); w.operand(n) }
      Self::PushOuter(n) => { w.nybble(8); w.operand(n) }
      Self::Pop => w.nybble(9),
      Self::GetOuterClearing(n) => { w.nybble(10); w.operand(n) }
      Self::SetOuter(n) => { w.nybble(11); w.operand(n) }
      Self::GetLocal(n) => { w.nybble(12); w.operand(n) }
      Self::MakeTuple(n) => { w.nybble(13); w.operand(n) }
      Self::GetOuter(n) => { w.nybble(14); w.operand(n) }
      Self::PushLabel => { w.nybble(EXT_OPCODE); w.nybble(0) }
      Self::GetLiteral(n) => { w.nybble(EXT_OPCODE); w.nybble(1); w.operand(n) }
      Self::SetLiteral(n) => { w.nybble(EXT_OPCODE); w.nybble(2); w.operand(n) }
      Self::PushLiteralVar(n) => { w.nybble(EXT_OPCODE); w.nybble(3); w.operand(n) }
      Self::Duplicate => { w.nybble(EXT_OPCODE); w.nybble(4) }
      Self::GetType(n) => { w.nybble(EXT_OPCODE); w.nybble(5); w.operand(n) }
      Self::SuperCall { bundle, expected } => {
        w.nybble(EXT_OPCODE); w.nybble(6); w.operand(bundle); w.operand(expected)
      }
    }
  }

  /// Decode one operation.
  pub fn read(r: &mut NybbleReader<'_>) -> Result<Self, ReadError> {
    Ok(match r.next()? {
      0 => Self::Call { bundle: r.operand()?, expected: r.operand()? },
      1 => Self::PushLiteral(r.operand()?),
      2 => Self::PushLastLocal(r.operand()?),
      3 => Self::PushLocal(r.operand()?),
      4 => Self::PushLastOuter(r.operand()?),
      5 => Self::Close { outers: r.operand()?, literal: r.operand()? },
      6 => Self::SetLocal(r.operand()?),
      7 => Self::GetLocalClearing(r.operand()?),
      8 => Self::PushOuter(r.operand()?),
      9 => Self::Pop,
      10 => Self::GetOuterClearing(r.operand()?),
      11 => Self::SetOuter(r.operand()?),
      12 => Self::GetLocal(r.operand()?),
      13 => Self::MakeTuple(r.operand()?),
      14 => Self::GetOuter(r.operand()?),
      _ => match r.next()? {
        0 => Self::PushLabel,
        1 => Self::GetLiteral(r.operand()?),
        2 => Self::SetLiteral(r.operand()?),
        3 => Self::PushLiteralVar(r.operand()?),
        4 => Self::Duplicate,
        5 => Self::GetType(r.operand()?),
        6 => Self::SuperCall { bundle: r.operand()?, expected: r.operand()? },
        n => return Err(ReadError::UnknownOpcode(n)),
      },
    })
  }
}

/// Accumulates nybbles and packs them two per byte.
#[derive(Debug, Default)]
pub struct NybbleWriter {
  nybbles: Vec<u8>,
}

impl NybbleWriter {
  /// A fresh empty writer.
  #[must_use] pub fn new() -> Self { Self::default() }

  /// Append one raw nybble.
  pub fn nybble(&mut self, n: u8) {
    debug_assert!(n < 16);
    self.nybbles.push(n);
  }

  /// Append a variable-length operand in the shortest encoding.
  pub fn operand(&mut self, value: u32) {
    let value = u64::from(value);
    let first = (0..16u8)
      .find(|&i| {
        let count = OPERAND_NYBBLE_COUNTS[i as usize];
        let offset = OPERAND_NYBBLE_OFFSETS[i as usize];
        value >= offset && value - offset < 1 << (4 * count)
      })
      .expect("eight nybbles cover all u32 operands");
    self.nybble(first);
    let count = OPERAND_NYBBLE_COUNTS[first as usize];
    let payload = value - OPERAND_NYBBLE_OFFSETS[first as usize];
    let mut buf = ArrayVec::<u8, 8>::new();
    for i in 0..count {
      buf.push(((payload >> (4 * (count - 1 - i))) & 0xf) as u8);
    }
    for n in buf { self.nybble(n) }
  }

  /// The number of nybbles written so far; the next operation's pc.
  #[must_use] pub fn pc(&self) -> u32 { self.nybbles.len() as u32 }

  /// Pack into bytes, high nybble first.
  #[must_use] pub fn finish(self) -> (Box<[u8]>, u32) {
    let count = self.nybbles.len() as u32;
    let mut bytes = Vec::with_capacity(self.nybbles.len().div_ceil(2));
    for pair in self.nybbles.chunks(2) {
      bytes.push(pair[0] << 4 | pair.get(1).copied().unwrap_or(0));
    }
    (bytes.into(), count)
  }
}

/// Reads nybbles from a packed stream.
#[derive(Clone, Debug)]
pub struct NybbleReader<'a> {
  bytes: &'a [u8],
  count: u32,
  pos: u32,
}

impl<'a> NybbleReader<'a> {
  /// Start reading at nybble `pos`.
  #[must_use] pub fn new(bytes: &'a [u8], count: u32, pos: u32) -> Self {
    Self { bytes, count, pos }
  }

  /// The current nybble position; the pc of the next operation.
  #[must_use] pub fn pc(&self) -> u32 { self.pos }

  /// Whether the stream is exhausted.
  #[must_use] pub fn at_end(&self) -> bool { self.pos >= self.count }

  fn next(&mut self) -> Result<u8, ReadError> {
    if self.at_end() { return Err(ReadError::Truncated) }
    let byte = self.bytes[(self.pos / 2) as usize];
    let n = if self.pos % 2 == 0 { byte >> 4 } else { byte & 0xf };
    self.pos += 1;
    Ok(n)
  }

  fn operand(&mut self) -> Result<u32, ReadError> {
    let first = self.next()? as usize;
    let mut value = 0u64;
    for _ in 0..OPERAND_NYBBLE_COUNTS[first] {
      value = value << 4 | u64::from(self.next()?);
    }
    u32::try_from(value + OPERAND_NYBBLE_OFFSETS[first])
      .map_err(|_| ReadError::OperandOverflow)
  }
}

crate::mk_id! {
  /// A primitive's number in the registry manifest.
  PrimitiveId,
}

/// A raw function: the compiler's output for one block. Immutable except
/// for the starting chunk (replaced atomically on (re)optimisation or
/// invalidation) and the invocation countdown.
pub struct RawFunction {
  name: String,
  literals: Box<[Value]>,
  nybbles: Box<[u8]>,
  num_nybbles: u32,
  num_args: u32,
  local_types: Box<[Ty]>,
  max_stack: u32,
  func_ty: Ty,
  primitive: Option<PrimitiveId>,
  starting_chunk: AtomicU32,
  countdown: AtomicI64,
}

/// How many invocations a fresh or invalidated raw function makes before
/// the next translation is attempted.
pub const REOPTIMIZATION_THRESHOLD: i64 = 10;

impl RawFunction {
  /// Assemble a raw function. `ops` are encoded in order; the starting
  /// chunk is the shared default chunk until first translation.
  #[must_use] pub fn assemble(
    name: impl Into<String>,
    ops: &[L1Op],
    literals: Vec<Value>,
    num_args: u32,
    local_types: Vec<Ty>,
    max_stack: u32,
    func_ty: Ty,
    primitive: Option<PrimitiveId>,
  ) -> Arc<Self> {
    let mut w = NybbleWriter::new();
    for &op in ops { op.write(&mut w) }
    let (nybbles, num_nybbles) = w.finish();
    Arc::new(Self {
      name: name.into(),
      literals: literals.into(),
      nybbles,
      num_nybbles,
      num_args,
      local_types: local_types.into(),
      max_stack,
      func_ty,
      primitive,
      starting_chunk: AtomicU32::new(ChunkId::DEFAULT.0),
      countdown: AtomicI64::new(REOPTIMIZATION_THRESHOLD),
    })
  }

  /// The function's name, for logs and stack traces.
  #[must_use] pub fn name(&self) -> &str { &self.name }

  /// The literal pool.
  #[must_use] pub fn literals(&self) -> &[Value] { &self.literals }

  /// The literal at zero-based index `n`.
  #[must_use] pub fn literal(&self, n: u32) -> &Value { &self.literals[n as usize] }

  /// A reader positioned at nybble `pc`.
  #[must_use] pub fn reader(&self, pc: u32) -> NybbleReader<'_> {
    NybbleReader::new(&self.nybbles, self.num_nybbles, pc)
  }

  /// The total number of nybbles; the pc one past the last operation.
  #[must_use] pub fn num_nybbles(&self) -> u32 { self.num_nybbles }

  /// The number of arguments.
  #[must_use] pub fn num_args(&self) -> u32 { self.num_args }

  /// The number of local variables.
  #[must_use] pub fn num_locals(&self) -> u32 { self.local_types.len() as u32 }

  /// The declared content types of the locals.
  #[must_use] pub fn local_types(&self) -> &[Ty] { &self.local_types }

  /// The maximum operand stack depth.
  #[must_use] pub fn max_stack(&self) -> u32 { self.max_stack }

  /// Slots per frame: arguments, locals, then stack.
  #[must_use] pub fn num_slots(&self) -> u32 {
    self.num_args + self.num_locals() + self.max_stack
  }

  /// The declared function type.
  #[must_use] pub fn func_ty(&self) -> &Ty { &self.func_ty }

  /// The primitive to attempt before running the nybblecodes, if any.
  #[must_use] pub fn primitive(&self) -> Option<PrimitiveId> { self.primitive }

  /// The chunk executed on entry. Always valid to enter: invalidation
  /// swings this back to the default chunk first.
  #[must_use] pub fn starting_chunk(&self) -> ChunkId {
    ChunkId(self.starting_chunk.load(Ordering::Acquire))
  }

  /// Atomically replace the starting chunk.
  pub fn set_starting_chunk(&self, chunk: ChunkId) {
    self.starting_chunk.store(chunk.0, Ordering::Release);
  }

  /// Decrement the reoptimisation countdown; true exactly once, when it
  /// reaches zero.
  pub fn countdown_hit_zero(&self) -> bool {
    self.countdown.fetch_sub(1, Ordering::AcqRel) == 1
  }

  /// Reset the countdown after (re)translation or invalidation.
  pub fn reset_countdown(&self, n: i64) { self.countdown.store(n, Ordering::Release); }

  /// Wrap into a function value with the given captured outers.
  #[must_use] pub fn into_function(self: &Arc<Self>, outers: Vec<Value>) -> Value {
    Value::new(ValueKind::Fn(Arc::new(crate::types::value::FunctionData {
      code: self.clone(),
      outers,
    })))
  }
}

impl fmt::Debug for RawFunction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "rawfn {}/{} (locals {}, stack {}):",
      self.name, self.num_args, self.num_locals(), self.max_stack)?;
    let mut r = self.reader(0);
    while !r.at_end() {
      let pc = r.pc();
      match L1Op::read(&mut r) {
        Ok(op) => writeln!(f, "  {pc}: {op:?}")?,
        Err(e) => return writeln!(f, "  {pc}: <{e}>"),
      }
    }
    Ok(())
  }
}

/// A reified call frame. Mutable only through [`ContinuationBuilder`];
/// frozen on publish.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct Continuation {
  /// The frame to return into, if any.
  pub caller: Option<Arc<Continuation>>,
  /// The running function value.
  pub function: Value,
  /// The nybble pc to resume at.
  pub pc: u32,
  /// The operand stack pointer; `num_slots + 1` when the stack is empty.
  pub stackp: u32,
  /// The chunk that can resume this frame directly; the default chunk
  /// means resumption re-interprets at Level One from `pc`.
  pub resume_chunk: ChunkId,
  /// The instruction offset at which `resume_chunk` resumes.
  pub resume_offset: u32,
  /// Arguments, locals, then stack, in slot order.
  slots: Box<[Value]>,
}

impl Continuation {
  /// The slot at one-based index `i`.
  #[must_use] pub fn slot_at(&self, i: u32) -> &Value { &self.slots[i as usize - 1] }

  /// The number of frame slots.
  #[must_use] pub fn num_slots(&self) -> u32 { self.slots.len() as u32 }

  /// All slots in order.
  #[must_use] pub fn slots(&self) -> &[Value] { &self.slots }

  /// The raw function behind this frame's function value.
  #[must_use] pub fn code(&self) -> &Arc<RawFunction> {
    &self.function.as_function().expect("frame function is a function").code
  }

  /// The declared type of the frame's function, for continuation typing.
  #[must_use] pub fn function_ty(&self) -> Ty {
    self.function.as_function()
      .map_or_else(Ty::any, |f| f.code.func_ty().clone())
  }

  /// The number of frames in the caller chain, this one included.
  #[must_use] pub fn depth(&self) -> usize {
    let mut depth = 1;
    let mut cur = self;
    while let Some(caller) = &cur.caller {
      depth += 1;
      cur = caller;
    }
    depth
  }
}

/// Builds a continuation; the only mutation window a frame ever has.
#[derive(Debug)]
pub struct ContinuationBuilder {
  caller: Option<Arc<Continuation>>,
  function: Value,
  pc: u32,
  stackp: u32,
  resume_chunk: ChunkId,
  resume_offset: u32,
  slots: Vec<Value>,
}

impl ContinuationBuilder {
  /// Start a frame record for `function` with every slot nil.
  #[must_use] pub fn new(function: Value, num_slots: u32) -> Self {
    Self {
      caller: None,
      function,
      pc: 0,
      stackp: num_slots + 1,
      resume_chunk: ChunkId::DEFAULT,
      resume_offset: 0,
      slots: vec![Value::nil(); num_slots as usize],
    }
  }

  /// Set the chunk and offset that can resume this frame directly.
  #[must_use] pub fn resume_point(mut self, chunk: ChunkId, offset: u32) -> Self {
    self.resume_chunk = chunk;
    self.resume_offset = offset;
    self
  }

  /// Set the caller frame.
  #[must_use] pub fn caller(mut self, caller: Option<Arc<Continuation>>) -> Self {
    self.caller = caller;
    self
  }

  /// Set the resume pc.
  #[must_use] pub fn pc(mut self, pc: u32) -> Self {
    self.pc = pc;
    self
  }

  /// Set the stack pointer.
  #[must_use] pub fn stackp(mut self, stackp: u32) -> Self {
    self.stackp = stackp;
    self
  }

  /// Fill the slot at one-based index `i`.
  pub fn slot_at_put(&mut self, i: u32, v: Value) { self.slots[i as usize - 1] = v; }

  /// Freeze and publish.
  #[must_use] pub fn freeze(self) -> Arc<Continuation> {
    Arc::new(Continuation {
      caller: self.caller,
      function: self.function,
      pc: self.pc,
      stackp: self.stackp,
      resume_chunk: self.resume_chunk,
      resume_offset: self.resume_offset,
      slots: self.slots.into(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn operand_encoding_round_trips_at_table_boundaries() {
    let cases =
      [0, 1, 9, 10, 25, 26, 41, 42, 57, 58, 313, 314, 65535, 65536, u32::MAX];
    for &n in &cases {
      let mut w = NybbleWriter::new();
      w.operand(n);
      let (bytes, count) = w.finish();
      let mut r = NybbleReader::new(&bytes, count, 0);
      assert_eq!(r.operand(), Ok(n), "operand {n}");
      assert!(r.at_end());
    }
  }

  #[test]
  fn small_operands_are_single_nybbles() {
    for n in 0..10 {
      let mut w = NybbleWriter::new();
      w.operand(n);
      assert_eq!(w.pc(), 1);
    }
    let mut w = NybbleWriter::new();
    w.operand(10);
    assert_eq!(w.pc(), 2);
  }

  #[test]
  fn ops_round_trip_through_packing() {
    let ops = [
      L1Op::PushLiteral(0),
      L1Op::PushLocal(1),
      L1Op::GetType(3),
      L1Op::MakeTuple(300),
      L1Op::Call { bundle: 2, expected: 70000 },
      L1Op::PushLabel,
      L1Op::Duplicate,
      L1Op::SuperCall { bundle: 1, expected: 0 },
      L1Op::Pop,
    ];
    let mut w = NybbleWriter::new();
    for &op in &ops { op.write(&mut w) }
    let (bytes, count) = w.finish();
    let mut r = NybbleReader::new(&bytes, count, 0);
    let mut decoded = vec![];
    while !r.at_end() { decoded.push(L1Op::read(&mut r).expect("decodes")) }
    assert_eq!(decoded, ops);
  }

  #[test]
  fn truncated_stream_is_an_error() {
    let mut w = NybbleWriter::new();
    w.nybble(0); // call, missing both operands
    let (bytes, count) = w.finish();
    let mut r = NybbleReader::new(&bytes, count, 0);
    assert_eq!(L1Op::read(&mut r), Err(ReadError::Truncated));
  }

  #[test]
  fn continuation_freezes_with_slots() {
    let code = RawFunction::assemble(
      "t", &[L1Op::PushLiteral(0)], vec![Value::int(1)], 0, vec![], 1,
      Ty::function(vec![], Ty::any()), None);
    let f = code.into_function(vec![]);
    let mut b = ContinuationBuilder::new(f, code.num_slots());
    b.slot_at_put(1, Value::int(42));
    let cont = b.pc(0).stackp(code.num_slots() + 1).freeze();
    assert_eq!(*cont.slot_at(1), Value::int(42));
    assert_eq!(cont.depth(), 1);
  }
}
