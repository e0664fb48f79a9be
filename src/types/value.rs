//! The value model: tagged immutable values with a cheap-clone handle.
//!
//! Every value is an [`Arc`] around a [`ValueKind`]. Data kinds (integers,
//! tuples, sets, maps, strings, characters, tokens) compare structurally;
//! behavioral kinds (atoms, functions by identity of their captured state,
//! variables, fibers, continuations, pojos) compare by identity. Mutable
//! state appears only inside [`Variable`] and [`Fiber`], behind locks.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering as MemOrdering};

use hashbrown::HashSet;
use num::bigint::BigInt;
use num::{Integer, Signed, Zero};
use parking_lot::{Condvar, Mutex};

use crate::types::code::{Continuation, RawFunction};
use crate::types::l2::ChunkId;
use crate::types::ty::Ty;

/// An extended integer: an arbitrary-precision integer or one of the two
/// infinities. The infinities are instances of the extended-integer type
/// but most arithmetic involving them is partial.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ExtInt {
  /// Negative infinity.
  NegInf,
  /// A finite integer.
  Fin(BigInt),
  /// Positive infinity.
  PosInf,
}

impl ExtInt {
  /// The finite integer zero.
  #[must_use] pub fn zero() -> Self { Self::Fin(BigInt::ZERO) }

  /// Whether this is a finite integer.
  #[must_use] pub fn is_finite(&self) -> bool { matches!(self, Self::Fin(_)) }

  /// The finite payload, if any.
  #[must_use] pub fn as_finite(&self) -> Option<&BigInt> {
    if let Self::Fin(n) = self { Some(n) } else { None }
  }

  /// Extended sum. `∞ + -∞` is undefined.
  #[must_use] pub fn checked_add(&self, other: &Self) -> Option<Self> {
    match (self, other) {
      (Self::Fin(a), Self::Fin(b)) => Some(Self::Fin(a + b)),
      (Self::PosInf, Self::NegInf) | (Self::NegInf, Self::PosInf) => None,
      (Self::PosInf, _) | (_, Self::PosInf) => Some(Self::PosInf),
      (Self::NegInf, _) | (_, Self::NegInf) => Some(Self::NegInf),
    }
  }

  /// Extended negation.
  #[must_use] pub fn neg(&self) -> Self {
    match self {
      Self::Fin(n) => Self::Fin(-n),
      Self::PosInf => Self::NegInf,
      Self::NegInf => Self::PosInf,
    }
  }

  /// Extended difference. `∞ - ∞` is undefined.
  #[must_use] pub fn checked_sub(&self, other: &Self) -> Option<Self> {
    self.checked_add(&other.neg())
  }

  /// Extended product. `0 × ∞` is undefined.
  #[must_use] pub fn checked_mul(&self, other: &Self) -> Option<Self> {
    match (self, other) {
      (Self::Fin(a), Self::Fin(b)) => Some(Self::Fin(a * b)),
      (a, b) => {
        if a.as_finite().is_some_and(Zero::is_zero)
          || b.as_finite().is_some_and(Zero::is_zero) { return None }
        Some(if a.is_negative() == b.is_negative() { Self::PosInf } else { Self::NegInf })
      }
    }
  }

  /// Extended floored division. Division by zero and `∞ / ∞` are undefined;
  /// a finite dividend over an infinite divisor is zero.
  #[must_use] pub fn checked_div_floor(&self, other: &Self) -> Option<Self> {
    match (self, other) {
      (_, Self::Fin(b)) if b.is_zero() => None,
      (Self::Fin(a), Self::Fin(b)) => Some(Self::Fin(a.div_floor(b))),
      (Self::Fin(_), _) => Some(Self::zero()),
      (_, Self::Fin(b)) => Some(if self.is_negative() == b.is_negative()
        { Self::PosInf } else { Self::NegInf }),
      _ => None,
    }
  }

  /// Floored remainder; defined exactly when [`Self::checked_div_floor`] is,
  /// except that `x mod ±∞ = x` only for finite `x`.
  #[must_use] pub fn checked_mod_floor(&self, other: &Self) -> Option<Self> {
    match (self, other) {
      (_, Self::Fin(b)) if b.is_zero() => None,
      (Self::Fin(a), Self::Fin(b)) => Some(Self::Fin(a.mod_floor(b))),
      (Self::Fin(a), _) => Some(Self::Fin(a.clone())),
      _ => None,
    }
  }

  fn is_negative(&self) -> bool {
    match self {
      Self::Fin(n) => n.is_negative(),
      Self::PosInf => false,
      Self::NegInf => true,
    }
  }
}

impl PartialOrd for ExtInt {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> { Some(self.cmp(other)) }
}

impl Ord for ExtInt {
  fn cmp(&self, other: &Self) -> Ordering {
    match (self, other) {
      (Self::Fin(a), Self::Fin(b)) => a.cmp(b),
      (Self::NegInf, Self::NegInf) | (Self::PosInf, Self::PosInf) => Ordering::Equal,
      (Self::NegInf, _) | (_, Self::PosInf) => Ordering::Less,
      (Self::PosInf, _) | (_, Self::NegInf) => Ordering::Greater,
    }
  }
}

impl From<i64> for ExtInt {
  fn from(n: i64) -> Self { Self::Fin(n.into()) }
}

impl fmt::Display for ExtInt {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Fin(n) => n.fmt(f),
      Self::PosInf => write!(f, "\u{221e}"),
      Self::NegInf => write!(f, "-\u{221e}"),
    }
  }
}

/// An atom: a named identity used for method bundles, property keys, and
/// the boolean objects. Two atoms are equal exactly when they are the same
/// object. An atom records the chunks whose inlining decisions depend on
/// the method it names, so that redefinition can invalidate them.
#[derive(Clone)]
pub struct Atom(Arc<AtomInner>);

struct AtomInner {
  name: String,
  dependents: Mutex<HashSet<ChunkId>>,
}

impl Atom {
  /// Create a fresh atom with the given name. The name is not a key;
  /// distinct calls produce distinct atoms.
  #[must_use] pub fn fresh(name: impl Into<String>) -> Self {
    Self(Arc::new(AtomInner { name: name.into(), dependents: Mutex::new(HashSet::new()) }))
  }

  /// The atom's name, for display only.
  #[must_use] pub fn name(&self) -> &str { &self.0.name }

  /// Record that `chunk` inlined through this atom's method.
  pub fn add_dependent(&self, chunk: ChunkId) { self.0.dependents.lock().insert(chunk); }

  /// Remove a dependency record, when a chunk is discarded.
  pub fn remove_dependent(&self, chunk: ChunkId) { self.0.dependents.lock().remove(&chunk); }

  /// Drain the set of dependent chunks, for invalidation.
  #[must_use] pub fn take_dependents(&self) -> HashSet<ChunkId> {
    std::mem::take(&mut self.0.dependents.lock())
  }
}

impl PartialEq for Atom {
  fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}
impl Eq for Atom {}

impl Hash for Atom {
  fn hash<H: Hasher>(&self, state: &mut H) { (Arc::as_ptr(&self.0) as usize).hash(state) }
}

impl fmt::Debug for Atom {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "${}", self.0.name)
  }
}

/// A function: compiled code plus its captured outer values.
#[derive(Debug)]
pub struct FunctionData {
  /// The underlying raw function.
  pub code: Arc<RawFunction>,
  /// The captured outers, in declaration order.
  pub outers: Vec<Value>,
}

/// The failure modes of reading or writing a [`Variable`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum VariableError {
  /// The variable has no current value.
  #[error("read of unassigned variable")]
  Unassigned,
  /// The written value does not conform to the variable's content type.
  #[error("write of ill-typed value to variable")]
  WrongType,
}

/// A variable: a mutable cell with a content type. Reads observe the most
/// recently committed write under the cell's lock.
#[derive(Clone)]
pub struct Variable(Arc<VariableInner>);

struct VariableInner {
  content_ty: Ty,
  value: Mutex<Option<Value>>,
}

impl Variable {
  /// Create an unassigned variable with the given content type.
  #[must_use] pub fn new(content_ty: Ty) -> Self {
    Self(Arc::new(VariableInner { content_ty, value: Mutex::new(None) }))
  }

  /// The content type: values written must conform, reads conform.
  #[must_use] pub fn content_ty(&self) -> &Ty { &self.0.content_ty }

  /// Read the current value.
  pub fn read(&self) -> Result<Value, VariableError> {
    self.0.value.lock().clone().ok_or(VariableError::Unassigned)
  }

  /// Read and clear. Emitted by the compiler only where the content is dead.
  pub fn read_clearing(&self) -> Result<Value, VariableError> {
    self.0.value.lock().take().ok_or(VariableError::Unassigned)
  }

  /// Write a value, checking it against the content type.
  pub fn write(&self, value: Value) -> Result<(), VariableError> {
    if !value.is_instance_of(&self.0.content_ty) { return Err(VariableError::WrongType) }
    *self.0.value.lock() = Some(value);
    Ok(())
  }

  /// Whether the variable currently holds a value.
  #[must_use] pub fn is_assigned(&self) -> bool { self.0.value.lock().is_some() }
}

impl fmt::Debug for Variable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "var({:?})", *self.0.value.lock())
  }
}

bitflags::bitflags! {
  /// Interrupt requests, sampled at safe points only.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct InterruptBits: u8 {
    /// The fiber should raise a cancellation exception at the next safe point.
    const CANCEL = 1;
    /// The fiber should reify its frames at the next safe point.
    const REIFY = 2;
  }
}

/// The execution state of a fiber.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExecState {
  /// Forked but not yet picked by an executor.
  Unstarted,
  /// Runnable or currently running on an executor thread.
  Running,
  /// Parked by a primitive returning fiber-suspended.
  Suspended,
  /// Blocked joining another fiber.
  WaitingToJoin,
  /// Blocked on external I/O.
  WaitingOnIo,
  /// Completed, with the result slot filled.
  Terminated,
}

/// The kinds of exception a fiber can die with; see the error taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExceptionKind {
  /// An assertion failed or an emergency exit was requested.
  AssertionFailed,
  /// A callee returned a value that does not conform to the call site.
  InvalidResult,
  /// A dispatch found no unique applicable definition.
  UnresolvedDispatch,
  /// A read of an unassigned variable, or an ill-typed variable write.
  VariableAccess,
  /// The fiber was cancelled.
  Cancelled,
  /// An arithmetic operation was undefined for its operands.
  Arithmetic,
  /// A marshalling boundary failure carrying a foreign payload.
  Marshaling,
}

/// A fiber-terminating (unless handled) exception with a value payload.
#[derive(Clone, Debug)]
pub struct Exception {
  /// What went wrong, as a coarse kind.
  pub kind: ExceptionKind,
  /// The payload, e.g. the offending value or a message string.
  pub payload: Value,
}

impl Exception {
  /// An exception carrying a message string.
  #[must_use] pub fn msg(kind: ExceptionKind, message: impl AsRef<str>) -> Self {
    Self { kind, payload: Value::string(message) }
  }

  /// The cancellation exception raised at safe points.
  #[must_use] pub fn cancelled() -> Self {
    Self::msg(ExceptionKind::Cancelled, "fiber cancelled")
  }
}

/// The outcome a terminated fiber leaves in its result slot.
pub type FiberOutcome = Result<Value, Exception>;

pub(crate) struct FiberShared {
  /// The function and arguments to invoke when the fiber first runs.
  pub launch: Option<(Value, Vec<Value>)>,
  /// The reified frame chain, present whenever the fiber is not running live.
  pub continuation: Option<Arc<Continuation>>,
  /// Where the fiber is in its lifecycle.
  pub exec: ExecState,
  /// Fibers waiting on this one's termination.
  pub joiners: Vec<Fiber>,
  /// The result, filled exactly once at termination.
  pub result: Option<FiberOutcome>,
  /// A value passed by `resume`, to be pushed as the suspending primitive's
  /// result when the fiber next runs.
  pub resume_value: Option<Value>,
}

struct FiberInner {
  name: String,
  priority: u8,
  interrupts: AtomicU8,
  shared: Mutex<FiberShared>,
  terminated: Condvar,
}

/// A cooperatively scheduled task over a continuation chain. Cheap to clone;
/// equality is identity.
#[derive(Clone)]
pub struct Fiber(Arc<FiberInner>);

impl Fiber {
  /// Create a fiber in the unstarted state.
  #[must_use] pub fn new(name: impl Into<String>, priority: u8) -> Self {
    Self(Arc::new(FiberInner {
      name: name.into(),
      priority,
      interrupts: AtomicU8::new(0),
      shared: Mutex::new(FiberShared {
        launch: None,
        continuation: None,
        exec: ExecState::Unstarted,
        joiners: vec![],
        result: None,
        resume_value: None,
      }),
      terminated: Condvar::new(),
    }))
  }

  /// The fiber's name, for logs.
  #[must_use] pub fn name(&self) -> &str { &self.0.name }

  /// The scheduling priority; higher runs sooner.
  #[must_use] pub fn priority(&self) -> u8 { self.0.priority }

  /// The current execution state.
  #[must_use] pub fn exec_state(&self) -> ExecState { self.0.shared.lock().exec }

  /// Request an interrupt; it takes effect at the fiber's next safe point.
  pub fn request_interrupt(&self, bits: InterruptBits) {
    self.0.interrupts.fetch_or(bits.bits(), MemOrdering::AcqRel);
  }

  /// Sample and clear the given interrupt bits. Called at safe points only,
  /// so this is a single atomic fetch.
  pub fn take_interrupt(&self, bits: InterruptBits) -> bool {
    if self.0.interrupts.load(MemOrdering::Acquire) & bits.bits() == 0 { return false }
    self.0.interrupts.fetch_and(!bits.bits(), MemOrdering::AcqRel) & bits.bits() != 0
  }

  pub(crate) fn with_shared<R>(&self, f: impl FnOnce(&mut FiberShared) -> R) -> R {
    f(&mut self.0.shared.lock())
  }

  /// Record termination and wake joiners. Returns the fibers to reschedule.
  pub(crate) fn terminate(&self, outcome: FiberOutcome) -> Vec<Fiber> {
    let mut shared = self.0.shared.lock();
    debug_assert!(shared.result.is_none(), "fiber terminated twice");
    shared.exec = ExecState::Terminated;
    shared.result = Some(outcome);
    shared.continuation = None;
    let joiners = std::mem::take(&mut shared.joiners);
    drop(shared);
    self.0.terminated.notify_all();
    joiners
  }

  /// Block the calling host thread until the fiber terminates, returning a
  /// copy of its outcome.
  #[must_use] pub fn await_outcome(&self) -> FiberOutcome {
    let mut shared = self.0.shared.lock();
    while shared.result.is_none() { self.0.terminated.wait(&mut shared); }
    shared.result.clone().expect("checked above")
  }

  /// The outcome, if the fiber has terminated.
  #[must_use] pub fn outcome(&self) -> Option<FiberOutcome> { self.0.shared.lock().result.clone() }
}

impl PartialEq for Fiber {
  fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}
impl Eq for Fiber {}

impl Hash for Fiber {
  fn hash<H: Hasher>(&self, state: &mut H) { (Arc::as_ptr(&self.0) as usize).hash(state) }
}

impl fmt::Debug for Fiber {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "fiber({:?}, {:?})", self.0.name, self.exec_state())
  }
}

/// A lexical token, as captured in module comment tuples.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TokenData {
  /// The source text of the token.
  pub lexeme: Arc<str>,
  /// One-based character position in the module source.
  pub start: u32,
  /// One-based line number.
  pub line: u32,
}

/// A parse phrase; the engine only stores and moves these.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct PhraseData {
  /// The tokens the phrase covers, as token values.
  pub tokens: im::Vector<Value>,
}

/// A foreign host object, equal only to itself.
#[derive(Clone)]
pub struct Pojo(pub Arc<dyn std::any::Any + Send + Sync>);

impl PartialEq for Pojo {
  fn eq(&self, other: &Self) -> bool { Arc::ptr_eq(&self.0, &other.0) }
}
impl Eq for Pojo {}

impl Hash for Pojo {
  fn hash<H: Hasher>(&self, state: &mut H) {
    (Arc::as_ptr(&self.0).cast::<()>() as usize).hash(state)
  }
}

impl fmt::Debug for Pojo {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "pojo") }
}

/// The discriminated sum behind [`Value`].
#[derive(Clone, Debug)]
pub enum ValueKind {
  /// The out-of-band nil, used to clear dead slots. Not a user value.
  Nil,
  /// An extended integer.
  Int(ExtInt),
  /// A Unicode character.
  Char(char),
  /// A string.
  Str(Arc<str>),
  /// A tuple, indexed from 1.
  Tuple(im::Vector<Value>),
  /// A set.
  Set(im::HashSet<Value>),
  /// A map.
  Map(im::HashMap<Value, Value>),
  /// An atom.
  Atom(Atom),
  /// A function: raw code plus captured outers.
  Fn(Arc<FunctionData>),
  /// A raw function (compiled code) as a first-class value.
  Code(Arc<RawFunction>),
  /// A reified continuation.
  Cont(Arc<Continuation>),
  /// A fiber.
  Fiber(Fiber),
  /// A variable.
  Var(Variable),
  /// A type as a value.
  Ty(Ty),
  /// A parse phrase.
  Phrase(Arc<PhraseData>),
  /// A token.
  Token(Arc<TokenData>),
  /// A foreign host object.
  Pojo(Pojo),
}

/// A value handle. Clones are cheap and share the underlying object.
#[derive(Clone)]
pub struct Value(Arc<ValueKind>);

impl Value {
  /// Wrap a kind.
  #[must_use] pub fn new(kind: ValueKind) -> Self { Self(Arc::new(kind)) }

  /// The nil value.
  #[must_use] pub fn nil() -> Self {
    static NIL: once_cell::sync::Lazy<Value> =
      once_cell::sync::Lazy::new(|| Value::new(ValueKind::Nil));
    NIL.clone()
  }

  /// A finite integer value.
  #[must_use] pub fn int(n: impl Into<BigInt>) -> Self {
    Self::new(ValueKind::Int(ExtInt::Fin(n.into())))
  }

  /// An extended integer value.
  #[must_use] pub fn ext_int(n: ExtInt) -> Self { Self::new(ValueKind::Int(n)) }

  /// A string value.
  #[must_use] pub fn string(s: impl AsRef<str>) -> Self {
    Self::new(ValueKind::Str(s.as_ref().into()))
  }

  /// A character value.
  #[must_use] pub fn char(c: char) -> Self { Self::new(ValueKind::Char(c)) }

  /// A tuple value from an element iterator.
  #[must_use] pub fn tuple(elements: impl IntoIterator<Item = Value>) -> Self {
    Self::new(ValueKind::Tuple(elements.into_iter().collect()))
  }

  /// The process-wide boolean true object.
  #[must_use] pub fn true_object() -> Self {
    static TRUE: once_cell::sync::Lazy<Value> =
      once_cell::sync::Lazy::new(|| Value::new(ValueKind::Atom(Atom::fresh("true"))));
    TRUE.clone()
  }

  /// The process-wide boolean false object.
  #[must_use] pub fn false_object() -> Self {
    static FALSE: once_cell::sync::Lazy<Value> =
      once_cell::sync::Lazy::new(|| Value::new(ValueKind::Atom(Atom::fresh("false"))));
    FALSE.clone()
  }

  /// The boolean object for `b`.
  #[must_use] pub fn boolean(b: bool) -> Self {
    if b { Self::true_object() } else { Self::false_object() }
  }

  /// The underlying kind.
  #[must_use] pub fn kind(&self) -> &ValueKind { &self.0 }

  /// Whether this is the nil value.
  #[must_use] pub fn is_nil(&self) -> bool { matches!(*self.0, ValueKind::Nil) }

  /// Whether this is a type.
  #[must_use] pub fn is_type(&self) -> bool { matches!(*self.0, ValueKind::Ty(_)) }

  /// The finite integer payload, if this is a finite integer.
  #[must_use] pub fn as_int(&self) -> Option<&BigInt> {
    if let ValueKind::Int(n) = &*self.0 { n.as_finite() } else { None }
  }

  /// The extended integer payload, if any.
  #[must_use] pub fn as_ext_int(&self) -> Option<&ExtInt> {
    if let ValueKind::Int(n) = &*self.0 { Some(n) } else { None }
  }

  /// The type payload, if this is a type.
  #[must_use] pub fn as_ty(&self) -> Option<&Ty> {
    if let ValueKind::Ty(t) = &*self.0 { Some(t) } else { None }
  }

  /// The function payload, if this is a function.
  #[must_use] pub fn as_function(&self) -> Option<&Arc<FunctionData>> {
    if let ValueKind::Fn(f) = &*self.0 { Some(f) } else { None }
  }

  /// The variable payload, if this is a variable.
  #[must_use] pub fn as_variable(&self) -> Option<&Variable> {
    if let ValueKind::Var(v) = &*self.0 { Some(v) } else { None }
  }

  /// The tuple payload, if this is a tuple.
  #[must_use] pub fn as_tuple(&self) -> Option<&im::Vector<Value>> {
    if let ValueKind::Tuple(t) = &*self.0 { Some(t) } else { None }
  }

  /// The atom payload, if this is an atom.
  #[must_use] pub fn as_atom(&self) -> Option<&Atom> {
    if let ValueKind::Atom(a) = &*self.0 { Some(a) } else { None }
  }

  /// The continuation payload, if this is a continuation.
  #[must_use] pub fn as_continuation(&self) -> Option<&Arc<Continuation>> {
    if let ValueKind::Cont(c) = &*self.0 { Some(c) } else { None }
  }

  /// Whether this is one of the two boolean objects, and which.
  #[must_use] pub fn as_boolean(&self) -> Option<bool> {
    if *self == Self::true_object() { Some(true) }
    else if *self == Self::false_object() { Some(false) }
    else { None }
  }

  /// Tuple access, one-based. Returns `None` out of range.
  #[must_use] pub fn tuple_at(&self, index: usize) -> Option<Value> {
    self.as_tuple()?.get(index.checked_sub(1)?).cloned()
  }

  /// The number of elements, for tuples, sets, maps and strings.
  #[must_use] pub fn size(&self) -> Option<usize> {
    match &*self.0 {
      ValueKind::Tuple(t) => Some(t.len()),
      ValueKind::Set(s) => Some(s.len()),
      ValueKind::Map(m) => Some(m.len()),
      ValueKind::Str(s) => Some(s.chars().count()),
      _ => None,
    }
  }

  /// Mark the value immutable. Values are immutable already; this is the
  /// identity, kept for symmetry with the instruction set.
  #[must_use] pub fn make_immutable(self) -> Self { self }

  /// Whether `self` is an instance of `ty`.
  #[must_use] pub fn is_instance_of(&self, ty: &Ty) -> bool { ty.has_instance(self) }

  /// The value's most specific type: the instance type for non-types, the
  /// instance meta for types. Nil has no instance type; its type is ⊤.
  #[must_use] pub fn instance_ty(&self) -> Ty { Ty::instance(self) }

  /// The value's non-enumeration kind, e.g. `[n..n]` for an integer `n` and
  /// the declared function type for a function.
  #[must_use] pub fn base_kind(&self) -> Ty { Ty::base_kind(self) }
}

impl PartialEq for Value {
  fn eq(&self, other: &Self) -> bool {
    if Arc::ptr_eq(&self.0, &other.0) { return true }
    match (&*self.0, &*other.0) {
      (ValueKind::Nil, ValueKind::Nil) => true,
      (ValueKind::Int(a), ValueKind::Int(b)) => a == b,
      (ValueKind::Char(a), ValueKind::Char(b)) => a == b,
      (ValueKind::Str(a), ValueKind::Str(b)) => a == b,
      (ValueKind::Tuple(a), ValueKind::Tuple(b)) => a == b,
      (ValueKind::Set(a), ValueKind::Set(b)) => a == b,
      (ValueKind::Map(a), ValueKind::Map(b)) => a == b,
      (ValueKind::Atom(a), ValueKind::Atom(b)) => a == b,
      (ValueKind::Fn(a), ValueKind::Fn(b)) =>
        Arc::ptr_eq(&a.code, &b.code) && a.outers == b.outers,
      (ValueKind::Code(a), ValueKind::Code(b)) => Arc::ptr_eq(a, b),
      (ValueKind::Cont(a), ValueKind::Cont(b)) => a == b,
      (ValueKind::Fiber(a), ValueKind::Fiber(b)) => a == b,
      (ValueKind::Var(a), ValueKind::Var(b)) => Arc::ptr_eq(&a.0, &b.0),
      (ValueKind::Ty(a), ValueKind::Ty(b)) => a == b,
      (ValueKind::Phrase(a), ValueKind::Phrase(b)) => a == b,
      (ValueKind::Token(a), ValueKind::Token(b)) => a == b,
      (ValueKind::Pojo(a), ValueKind::Pojo(b)) => a == b,
      _ => false,
    }
  }
}
impl Eq for Value {}

impl Hash for Value {
  fn hash<H: Hasher>(&self, state: &mut H) {
    std::mem::discriminant(&*self.0).hash(state);
    match &*self.0 {
      ValueKind::Nil => {}
      ValueKind::Int(n) => n.hash(state),
      ValueKind::Char(c) => c.hash(state),
      ValueKind::Str(s) => s.hash(state),
      ValueKind::Tuple(t) => t.hash(state),
      ValueKind::Set(s) => s.hash(state),
      ValueKind::Map(m) => m.hash(state),
      ValueKind::Atom(a) => a.hash(state),
      ValueKind::Fn(f) => { (Arc::as_ptr(&f.code) as usize).hash(state); f.outers.hash(state) }
      ValueKind::Code(c) => (Arc::as_ptr(c) as usize).hash(state),
      ValueKind::Cont(c) => c.hash(state),
      ValueKind::Fiber(f) => f.hash(state),
      ValueKind::Var(v) => (Arc::as_ptr(&v.0) as usize).hash(state),
      ValueKind::Ty(t) => t.hash(state),
      ValueKind::Phrase(p) => p.hash(state),
      ValueKind::Token(t) => t.hash(state),
      ValueKind::Pojo(p) => p.hash(state),
    }
  }
}

impl fmt::Debug for Value {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &*self.0 {
      ValueKind::Nil => write!(f, "nil"),
      ValueKind::Int(n) => write!(f, "{n}"),
      ValueKind::Char(c) => write!(f, "{c:?}"),
      ValueKind::Str(s) => write!(f, "{s:?}"),
      ValueKind::Tuple(t) => f.debug_list().entries(t.iter()).finish(),
      ValueKind::Set(s) => f.debug_set().entries(s.iter()).finish(),
      ValueKind::Map(m) => f.debug_map().entries(m.iter()).finish(),
      ValueKind::Atom(a) => a.fmt(f),
      ValueKind::Fn(func) => write!(f, "fn/{}", func.code.num_args()),
      ValueKind::Code(c) => write!(f, "rawfn/{}", c.num_args()),
      ValueKind::Cont(c) => c.fmt(f),
      ValueKind::Fiber(fb) => fb.fmt(f),
      ValueKind::Var(v) => v.fmt(f),
      ValueKind::Ty(t) => t.fmt(f),
      ValueKind::Phrase(_) => write!(f, "phrase"),
      ValueKind::Token(t) => write!(f, "token({:?})", t.lexeme),
      ValueKind::Pojo(p) => p.fmt(f),
    }
  }
}
