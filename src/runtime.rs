//! The shared runtime: the method registry, the chunk arena, and the fiber
//! scheduler.
//!
//! Each executor thread runs at most one fiber at a time; a fiber runs
//! single-threaded between safe points and only migrates threads through a
//! reified continuation. Method definition changes invalidate every chunk
//! contingent on the changed atom before the write lock is released, so no
//! fiber dispatches through a stale inlining decision.

use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, trace};

use crate::interpreter::Interpreter;
use crate::types::IdxVec;
use crate::types::code::{RawFunction, REOPTIMIZATION_THRESHOLD};
use crate::types::l2::{Chunk, ChunkId};
use crate::types::ty::Ty;
use crate::types::value::{Atom, ExecState, Fiber, FiberOutcome, InterruptBits, Value};

/// Why a dispatch failed to choose an implementation.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum LookupError {
  /// No definition accepts the arguments.
  #[error("no applicable definition")]
  NoApplicable,
  /// More than one most-specific definition accepts the arguments.
  #[error("ambiguous dispatch")]
  Ambiguous,
  /// The winner is abstract.
  #[error("abstract method")]
  Abstract,
  /// The winner is a forward declaration without a body yet.
  #[error("forward method")]
  Forward,
}

/// Rejections from [`Runtime::define_method`].
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum DefinitionError {
  /// The definition's arity disagrees with the method's.
  #[error("definition arity disagrees with the method")]
  WrongArity,
  /// The definition's signature is not a function type.
  #[error("definition signature is not a function type")]
  NotAFunction,
}

/// One entry in a method: a concrete implementation, an abstract
/// declaration, or a forward declaration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Definition {
  /// A concrete implementation function.
  Method(Value),
  /// An abstract declaration with the given function type.
  Abstract(Ty),
  /// A forward declaration with the given function type.
  Forward(Ty),
}

impl Definition {
  /// The definition's function type.
  #[must_use] pub fn signature(&self) -> Ty {
    match self {
      Self::Method(f) => f.as_function()
        .map_or_else(Ty::bottom, |f| f.code.func_ty().clone()),
      Self::Abstract(ty) | Self::Forward(ty) => ty.clone(),
    }
  }

  fn params(&self) -> Ty {
    self.signature().as_func_ty().map_or_else(Ty::bottom, |f| f.params.clone())
  }
}

/// A multi-method: the ordered definitions reachable through one atom.
#[derive(Debug, Default)]
pub struct Method {
  /// Argument count shared by every definition.
  pub arity: u32,
  /// The definitions, in definition order.
  pub definitions: Vec<Definition>,
}

impl Method {
  fn select(&self, applicable: Vec<&Definition>) -> Result<Definition, LookupError> {
    let mut most_specific = vec![];
    for d in &applicable {
      if applicable.iter()
        .all(|e| d.params().subtype_of(&e.params())) {
        most_specific.push(*d);
      }
    }
    match most_specific.as_slice() {
      [] if applicable.is_empty() => Err(LookupError::NoApplicable),
      [] => Err(LookupError::Ambiguous),
      [d] => match d {
        Definition::Abstract(_) => Err(LookupError::Abstract),
        Definition::Forward(_) => Err(LookupError::Forward),
        Definition::Method(_) => Ok((*d).clone()),
      },
      _ => Err(LookupError::Ambiguous),
    }
  }

  /// The unique most-specific definition accepting the argument values.
  pub fn lookup_by_values(&self, args: &[Value]) -> Result<Definition, LookupError> {
    let arg_tuple = Value::tuple(args.iter().cloned());
    self.select(
      self.definitions.iter().filter(|d| d.params().has_instance(&arg_tuple)).collect())
  }

  /// The unique most-specific definition accepting the argument types.
  pub fn lookup_by_types(&self, tys: &[Ty]) -> Result<Definition, LookupError> {
    let args_ty = Ty::fixed_tuple(tys.to_vec());
    self.select(
      self.definitions.iter().filter(|d| args_ty.subtype_of(&d.params())).collect())
  }

  /// Every concrete implementation whose parameters intersect the given
  /// argument types; the set the translator may specialize against.
  #[must_use] pub fn implementations_for(&self, tys: &[Ty]) -> Vec<Value> {
    let args_ty = Ty::fixed_tuple(tys.to_vec());
    self.definitions.iter()
      .filter(|d| d.params().intersection(&args_ty) != Ty::bottom())
      .filter_map(|d| match d {
        Definition::Method(f) => Some(f.clone()),
        _ => None,
      })
      .collect()
  }
}

/// The hook invoked when a callee's result does not conform to the call
/// site's expected type.
pub type InvalidResultHandler = Arc<dyn Fn(&Value, &Ty, &Value) + Send + Sync>;

struct QueuedFiber {
  priority: u8,
  seq: u64,
  fiber: Fiber,
}

impl PartialEq for QueuedFiber {
  fn eq(&self, other: &Self) -> bool { self.priority == other.priority && self.seq == other.seq }
}
impl Eq for QueuedFiber {}
impl PartialOrd for QueuedFiber {
  fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> { Some(self.cmp(other)) }
}
impl Ord for QueuedFiber {
  fn cmp(&self, other: &Self) -> std::cmp::Ordering {
    self.priority.cmp(&other.priority).then(other.seq.cmp(&self.seq))
  }
}

struct Scheduler {
  queue: Mutex<BinaryHeap<QueuedFiber>>,
  available: Condvar,
  stopping: AtomicBool,
  seq: AtomicU64,
  workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
  fn push(&self, fiber: Fiber) {
    let entry = QueuedFiber {
      priority: fiber.priority(),
      seq: self.seq.fetch_add(1, Ordering::Relaxed),
      fiber,
    };
    self.queue.lock().push(entry);
    self.available.notify_one();
  }

  fn pop(&self) -> Option<Fiber> {
    let mut queue = self.queue.lock();
    loop {
      if let Some(entry) = queue.pop() { return Some(entry.fiber) }
      if self.stopping.load(Ordering::Acquire) { return None }
      self.available.wait(&mut queue);
    }
  }
}

/// The engine: chunk arena, method registry, and executors. Shared behind
/// an [`Arc`]; executor threads hold clones until [`Runtime::shutdown`].
pub struct Runtime {
  chunks: RwLock<IdxVec<ChunkId, Arc<Chunk>>>,
  methods: RwLock<HashMap<Atom, Method>>,
  invalid_result_handler: RwLock<Option<InvalidResultHandler>>,
  scheduler: Scheduler,
}

impl Runtime {
  /// Create a runtime with the given number of executor threads. The
  /// default chunk occupies arena slot zero.
  #[must_use] pub fn new(executor_threads: usize) -> Arc<Self> {
    let mut chunks = IdxVec::new();
    let default = chunks.push(Arc::new(Chunk::new(None, vec![], vec![], 0, 0, 0)));
    debug_assert_eq!(default, ChunkId::DEFAULT);
    let runtime = Arc::new(Self {
      chunks: RwLock::new(chunks),
      methods: RwLock::new(HashMap::new()),
      invalid_result_handler: RwLock::new(None),
      scheduler: Scheduler {
        queue: Mutex::new(BinaryHeap::new()),
        available: Condvar::new(),
        stopping: AtomicBool::new(false),
        seq: AtomicU64::new(0),
        workers: Mutex::new(vec![]),
      },
    });
    let mut workers = runtime.scheduler.workers.lock();
    for i in 0..executor_threads.max(1) {
      let rt = runtime.clone();
      workers.push(
        std::thread::Builder::new()
          .name(format!("avail-executor-{i}"))
          .spawn(move || rt.executor_loop())
          .expect("executor thread spawns"));
    }
    drop(workers);
    runtime
  }

  fn executor_loop(&self) {
    while let Some(fiber) = self.scheduler.pop() {
      trace!(fiber = fiber.name(), "executor picked fiber");
      Interpreter::new(self).run_fiber(&fiber);
    }
  }

  /// Stop the executors and join them. Queued fibers are abandoned.
  pub fn shutdown(&self) {
    self.scheduler.stopping.store(true, Ordering::Release);
    self.available_notify_all();
    let workers = std::mem::take(&mut *self.scheduler.workers.lock());
    for handle in workers {
      if handle.thread().id() != std::thread::current().id() {
        let _ = handle.join();
      }
    }
  }

  fn available_notify_all(&self) { self.scheduler.available.notify_all(); }

  // --- chunks ---

  /// Install a chunk, registering it with its contingent atoms. Returns
  /// the arena index.
  pub fn install_chunk(&self, chunk: Chunk) -> ChunkId {
    let contingents = chunk.contingents.clone();
    let id = self.chunks.write().push(Arc::new(chunk));
    for atom in &contingents { atom.add_dependent(id) }
    debug!(chunk = id.0, "installed chunk");
    id
  }

  /// The chunk at `id`.
  #[must_use] pub fn chunk(&self, id: ChunkId) -> Arc<Chunk> {
    self.chunks.read()[id].clone()
  }

  fn invalidate_dependents(&self, atom: &Atom) {
    let dependents = atom.take_dependents();
    if dependents.is_empty() { return }
    let chunks = self.chunks.read();
    for id in dependents {
      let chunk = &chunks[id];
      chunk.invalidate();
      if let Some(code) = &chunk.code {
        code.set_starting_chunk(ChunkId::DEFAULT);
        code.reset_countdown(REOPTIMIZATION_THRESHOLD);
      }
      debug!(chunk = id.0, atom = atom.name(), "invalidated chunk");
    }
  }

  // --- methods ---

  /// Add or replace a definition for `atom`'s method. A definition whose
  /// parameter types equal an existing one replaces it. Every chunk
  /// contingent on the atom is invalidated before this returns.
  pub fn define_method(&self, atom: &Atom, definition: Definition)
      -> Result<(), DefinitionError> {
    let sig = definition.signature();
    let func = sig.as_func_ty().ok_or(DefinitionError::NotAFunction)?;
    let arity = match func.params.as_tuple_ty() {
      Some(t) => t.leading.len() as u32,
      None => return Err(DefinitionError::NotAFunction),
    };
    let mut methods = self.methods.write();
    let method = methods.entry(atom.clone()).or_default();
    if method.definitions.is_empty() {
      method.arity = arity;
    } else if method.arity != arity {
      return Err(DefinitionError::WrongArity);
    }
    let params = definition.params();
    match method.definitions.iter_mut().find(|d| d.params() == params) {
      Some(existing) => *existing = definition,
      None => method.definitions.push(definition),
    }
    self.invalidate_dependents(atom);
    Ok(())
  }

  /// Remove every definition of `atom`'s method, invalidating dependents.
  pub fn forget_method(&self, atom: &Atom) {
    self.methods.write().remove(atom);
    self.invalidate_dependents(atom);
  }

  /// Run `f` on the method for `atom`, under the registry's read lock.
  pub fn with_method<R>(&self, atom: &Atom, f: impl FnOnce(Option<&Method>) -> R) -> R {
    f(self.methods.read().get(atom))
  }

  // --- hooks ---

  /// Install the invalid-message-result handler.
  pub fn set_invalid_result_handler(&self, handler: Option<InvalidResultHandler>) {
    *self.invalid_result_handler.write() = handler;
  }

  pub(crate) fn notify_invalid_result(&self, function: &Value, expected: &Ty, actual: &Value) {
    if let Some(handler) = self.invalid_result_handler.read().clone() {
      handler(function, expected, actual);
    }
  }

  // --- fibers ---

  /// Fork a fiber that will invoke `function` on `args`.
  pub fn fork(
    &self,
    name: impl Into<String>,
    function: Value,
    args: Vec<Value>,
    priority: u8,
  ) -> Fiber {
    debug_assert!(function.as_function().is_some(), "forked value must be a function");
    let fiber = Fiber::new(name, priority);
    fiber.with_shared(|shared| shared.launch = Some((function, args)));
    self.scheduler.push(fiber.clone());
    fiber
  }

  /// Resume a suspended fiber, delivering `value` as the suspending
  /// primitive's result.
  pub fn resume(&self, fiber: &Fiber, value: Value) {
    fiber.with_shared(|shared| {
      debug_assert_eq!(shared.exec, ExecState::Suspended, "resume of a non-suspended fiber");
      shared.resume_value = Some(value);
    });
    self.scheduler.push(fiber.clone());
  }

  /// Reschedule a runnable fiber; used internally after wakeups.
  pub(crate) fn reschedule(&self, fiber: Fiber) { self.scheduler.push(fiber) }

  /// Request cancellation; the fiber raises at its next safe point. A
  /// suspended fiber is woken to observe the request.
  pub fn cancel(&self, fiber: &Fiber) {
    fiber.request_interrupt(InterruptBits::CANCEL);
    if fiber.exec_state() == ExecState::Suspended {
      self.scheduler.push(fiber.clone());
    }
  }

  /// Fork `function` at normal priority and block the calling host thread
  /// for its outcome.
  #[must_use] pub fn run_to_outcome(&self, function: Value, args: Vec<Value>) -> FiberOutcome {
    self.fork("host fiber", function, args, 128).await_outcome()
  }

  /// Convenience: run a raw function with no outers.
  #[must_use] pub fn run_code(&self, code: &Arc<RawFunction>, args: Vec<Value>) -> FiberOutcome {
    self.run_to_outcome(code.into_function(vec![]), args)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::types::code::L1Op;

  fn implementation(params: Vec<Ty>) -> Definition {
    let code = RawFunction::assemble(
      "impl", &[L1Op::PushLiteral(0)], vec![Value::int(0)],
      params.len() as u32, vec![], 1,
      Ty::function(params, Ty::any()), None);
    Definition::Method(code.into_function(vec![]))
  }

  #[test]
  fn lookup_picks_the_most_specific_definition() {
    let mut method = Method::default();
    method.arity = 1;
    method.definitions.push(implementation(vec![Ty::integers()]));
    method.definitions.push(implementation(vec![Ty::any()]));
    let winner = method.lookup_by_values(&[Value::int(5)]).expect("resolves");
    assert_eq!(winner.params(), Ty::fixed_tuple(vec![Ty::integers()]));
    let general = method.lookup_by_values(&[Value::string("s")]).expect("resolves");
    assert_eq!(general.params(), Ty::fixed_tuple(vec![Ty::any()]));
  }

  #[test]
  fn incomparable_definitions_are_ambiguous() {
    let mut method = Method::default();
    method.arity = 2;
    method.definitions.push(implementation(vec![Ty::integers(), Ty::any()]));
    method.definitions.push(implementation(vec![Ty::any(), Ty::integers()]));
    assert_eq!(
      method.lookup_by_values(&[Value::int(1), Value::int(2)]),
      Err(LookupError::Ambiguous));
  }

  #[test]
  fn abstract_and_forward_definitions_do_not_dispatch() {
    let mut method = Method::default();
    method.arity = 0;
    method.definitions.push(Definition::Abstract(Ty::function(vec![], Ty::any())));
    assert_eq!(method.lookup_by_values(&[]), Err(LookupError::Abstract));
    method.definitions.clear();
    method.definitions.push(Definition::Forward(Ty::function(vec![], Ty::any())));
    assert_eq!(method.lookup_by_values(&[]), Err(LookupError::Forward));
    assert_eq!(Method::default().lookup_by_values(&[]), Err(LookupError::NoApplicable));
  }

  #[test]
  fn method_arity_mismatches_are_rejected() {
    let runtime = Runtime::new(1);
    let atom = Atom::fresh("mismatched");
    runtime.define_method(&atom, implementation(vec![Ty::any()])).expect("defines");
    assert_eq!(
      runtime.define_method(&atom, implementation(vec![Ty::any(), Ty::any()])),
      Err(DefinitionError::WrongArity));
    runtime.forget_method(&atom);
    runtime.define_method(&atom, implementation(vec![Ty::any(), Ty::any()]))
      .expect("redefinable after forgetting");
    runtime.shutdown();
  }
}
