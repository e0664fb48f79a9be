//! The per-thread interpreter: Level One stepping, Level Two chunk
//! stepping, invocation, return checking, and reification.
//!
//! Control is a small state machine over reified frames. Invocations push
//! the current frame as a continuation carrying the call-site sentinel;
//! returns pop one, validate the result against the sentinel, and resume
//! the caller either in the L1 interpreter or at its recorded chunk
//! offset. Suspension therefore never has to unwind live frames: the
//! chain is already reified.
//!
//! Safe points are every L1 operation boundary, every chunk entry, every
//! L2 back-edge, and every primitive boundary; cancellation is sampled
//! there and nowhere else.

use std::sync::Arc;

use tracing::{debug, trace};

use crate::build_l2;
use crate::primitive::{PrimitiveRegistry, PrimitiveResult};
use crate::runtime::{Definition, Runtime};
use crate::types::code::{
  Continuation, ContinuationBuilder, L1Op, RawFunction, REOPTIMIZATION_THRESHOLD,
};
use crate::types::l2::{Chunk, ChunkId, L2Instr, L2Reg, ARCH_FIXED};
use crate::types::ty::Ty;
use crate::types::value::{
  Exception, ExceptionKind, ExecState, Fiber, InterruptBits, Value, ValueKind, Variable,
};

/// A live Level One frame; exists only inside an executor's step loop.
struct Frame {
  function: Value,
  code: Arc<RawFunction>,
  caller: Option<Arc<Continuation>>,
  pc: u32,
  stackp: u32,
  slots: Vec<Value>,
}

impl Frame {
  /// Build a frame for an invocation: arguments in the leading slots,
  /// fresh local variables after them, nil stack above.
  fn new(function: Value, args: Vec<Value>, caller: Option<Arc<Continuation>>) -> Self {
    let code = function.as_function().expect("invoked value is a function").code.clone();
    let num_slots = code.num_slots() as usize;
    let mut slots = Vec::with_capacity(num_slots);
    slots.extend(args);
    for ty in code.local_types() {
      slots.push(Value::new(ValueKind::Var(Variable::new(ty.clone()))));
    }
    slots.resize(num_slots, Value::nil());
    let stackp = num_slots as u32 + 1;
    Self { function, code, caller, pc: 0, stackp, slots }
  }

  /// Rebuild a live frame from a reified one.
  fn from_continuation(cont: &Continuation) -> Self {
    Self {
      function: cont.function.clone(),
      code: cont.code().clone(),
      caller: cont.caller.clone(),
      pc: cont.pc,
      stackp: cont.stackp,
      slots: cont.slots().to_vec(),
    }
  }

  fn push(&mut self, v: Value) {
    debug_assert!(self.stackp > self.code.num_args() + self.code.num_locals() + 1,
      "operand stack overflow");
    self.stackp -= 1;
    self.slots[self.stackp as usize - 1] = v;
  }

  fn pop(&mut self) -> Value {
    debug_assert!(self.stackp <= self.code.num_slots(), "operand stack underflow");
    let v = std::mem::replace(&mut self.slots[self.stackp as usize - 1], Value::nil());
    self.stackp += 1;
    v
  }

  fn top(&self) -> &Value { &self.slots[self.stackp as usize - 1] }

  fn slot(&self, i: u32) -> &Value { &self.slots[i as usize - 1] }

  fn slot_put(&mut self, i: u32, v: Value) { self.slots[i as usize - 1] = v; }

  /// Reify into a continuation resuming at the current pc in L1.
  fn reify(&self) -> Arc<Continuation> {
    let mut b = ContinuationBuilder::new(self.function.clone(), self.code.num_slots());
    for (i, v) in self.slots.iter().enumerate() {
      b.slot_at_put(i as u32 + 1, v.clone());
    }
    b.caller(self.caller.clone()).pc(self.pc).stackp(self.stackp).freeze()
  }
}

/// How an invocation enters a function's body.
enum InvokeMode {
  /// Attempt the primitive first, then fall into the body.
  Normal,
  /// The primitive already failed; seed the failure variable and run the
  /// body.
  AfterFailure(Value),
}

enum Control {
  Invoke {
    function: Value,
    args: Vec<Value>,
    caller: Option<Arc<Continuation>>,
    mode: InvokeMode,
  },
  RunL1(Frame),
  RunL2 {
    chunk_id: ChunkId,
    chunk: Arc<Chunk>,
    offset: u32,
    regs: Regs,
  },
  ReturnTo {
    cont: Option<Arc<Continuation>>,
    value: Value,
  },
  Reenter(Arc<Continuation>),
  Park(Option<Arc<Continuation>>),
  Done(Value),
}

/// The register file of one L2 activation.
struct Regs {
  boxed: Vec<Value>,
  ints: Vec<i64>,
}

impl Regs {
  fn for_chunk(chunk: &Chunk, caller: &Option<Arc<Continuation>>, function: &Value,
      slots: &[Value]) -> Self {
    let mut boxed = vec![Value::nil(); chunk.num_boxed as usize];
    boxed[0] = match caller {
      Some(c) => Value::new(ValueKind::Cont(c.clone())),
      None => Value::nil(),
    };
    boxed[1] = function.clone();
    for (i, v) in slots.iter().enumerate() {
      boxed[ARCH_FIXED as usize + i] = v.clone();
    }
    Regs { boxed, ints: vec![0; chunk.num_int as usize] }
  }

  fn get(&self, r: L2Reg) -> &Value { &self.boxed[r.0 as usize] }
  fn set(&mut self, r: L2Reg, v: Value) { self.boxed[r.0 as usize] = v; }
  fn caller(&self) -> Option<Arc<Continuation>> {
    self.boxed[0].as_continuation().cloned()
  }
  fn function(&self) -> &Value { &self.boxed[1] }
  fn slot_reg(slot: u32) -> L2Reg { L2Reg(ARCH_FIXED + slot - 1) }
}

/// One executor thread's interpreter. Borrowed access to the runtime;
/// owns no fiber state beyond the one currently running.
pub struct Interpreter<'rt> {
  runtime: &'rt Runtime,
  fiber: Option<Fiber>,
  primitive_function: Option<Value>,
  switched: Option<Arc<Continuation>>,
}

impl<'rt> Interpreter<'rt> {
  /// A fresh interpreter over the runtime.
  #[must_use] pub fn new(runtime: &'rt Runtime) -> Self {
    Self { runtime, fiber: None, primitive_function: None, switched: None }
  }

  /// The runtime this interpreter executes against.
  #[must_use] pub fn runtime(&self) -> &'rt Runtime { self.runtime }

  /// The fiber currently running on this interpreter, if any.
  #[must_use] pub fn fiber(&self) -> Option<&Fiber> { self.fiber.as_ref() }

  /// The function whose primitive is being attempted; available to
  /// primitives with a special-return convention.
  #[must_use] pub fn primitive_function(&self) -> Option<&Value> {
    self.primitive_function.as_ref()
  }

  /// Replace the continuation the interpreter resumes after the current
  /// primitive returns continuation-changed.
  pub fn switch_continuation(&mut self, cont: Arc<Continuation>) {
    self.switched = Some(cont);
  }

  /// Attempt a primitive at translation time, for constant folding. The
  /// function is made visible for special-return conventions.
  pub(crate) fn attempt_for_fold(
    &mut self,
    prim: &dyn crate::primitive::Primitive,
    args: &[Value],
    function: Value,
  ) -> PrimitiveResult {
    self.primitive_function = Some(function);
    let result = prim.attempt(args, self, false);
    self.primitive_function = None;
    result
  }

  /// Run `fiber` until it terminates or parks. Called by executors, and by
  /// hosts that want to drive a fiber on the current thread.
  pub fn run_fiber(&mut self, fiber: &Fiber) {
    self.fiber = Some(fiber.clone());
    let start = fiber.with_shared(|shared| {
      shared.exec = ExecState::Running;
      if let Some((function, args)) = shared.launch.take() {
        Control::Invoke { function, args, caller: None, mode: InvokeMode::Normal }
      } else if let Some(value) = shared.resume_value.take() {
        let cont = shared.continuation.take();
        Control::ReturnTo { cont, value }
      } else if let Some(cont) = shared.continuation.take() {
        Control::Reenter(cont)
      } else {
        Control::Done(Value::nil())
      }
    });
    match self.drive(start) {
      Ok(None) => trace!(fiber = fiber.name(), "fiber parked"),
      Ok(Some(value)) => self.finish(fiber, Ok(value)),
      Err(ex) => self.finish(fiber, Err(ex)),
    }
    self.fiber = None;
  }

  fn finish(&self, fiber: &Fiber, outcome: Result<Value, Exception>) {
    trace!(fiber = fiber.name(), ok = outcome.is_ok(), "fiber terminated");
    for joiner in fiber.terminate(outcome) {
      self.runtime.reschedule(joiner);
    }
  }

  /// The state-machine loop: `Ok(Some(v))` terminated with `v`, `Ok(None)`
  /// parked.
  fn drive(&mut self, mut control: Control) -> Result<Option<Value>, Exception> {
    loop {
      control = match control {
        Control::Invoke { function, args, caller, mode } =>
          self.invoke(function, args, caller, mode)?,
        Control::RunL1(frame) => self.run_l1(frame)?,
        Control::RunL2 { chunk_id, chunk, offset, regs } =>
          self.run_l2(chunk_id, &chunk, offset, regs)?,
        Control::ReturnTo { cont, value } => self.return_to(cont, value)?,
        Control::Reenter(cont) => {
          self.check_cancel()?;
          Control::RunL1(Frame::from_continuation(&cont))
        }
        Control::Park(cont) => {
          let fiber = self.fiber.as_ref().expect("a fiber is running");
          fiber.with_shared(|shared| {
            shared.exec = ExecState::Suspended;
            shared.continuation = cont;
          });
          return Ok(None)
        }
        Control::Done(value) => return Ok(Some(value)),
      };
    }
  }

  fn check_cancel(&self) -> Result<(), Exception> {
    if let Some(fiber) = &self.fiber {
      if fiber.take_interrupt(InterruptBits::CANCEL) {
        return Err(Exception::cancelled())
      }
    }
    Ok(())
  }

  // --- invocation ---

  fn invoke(
    &mut self,
    function: Value,
    args: Vec<Value>,
    caller: Option<Arc<Continuation>>,
    mode: InvokeMode,
  ) -> Result<Control, Exception> {
    self.check_cancel()?;
    let Some(data) = function.as_function() else {
      return Err(Exception::msg(ExceptionKind::UnresolvedDispatch,
        "attempt to invoke a non-function"))
    };
    let code = data.code.clone();
    let mode = match mode {
      InvokeMode::Normal => {
        if let Some(id) = code.primitive() {
          let prim = PrimitiveRegistry::shared().get(id)
            .expect("raw function references a manifested primitive");
          self.primitive_function = Some(function.clone());
          let result = prim.attempt(&args, self, false);
          self.primitive_function = None;
          match result {
            PrimitiveResult::Success(v) => {
              let ret = code.func_ty().return_ty();
              if !v.is_instance_of(&ret) {
                self.runtime.notify_invalid_result(&function, &ret, &v);
                return Err(Exception {
                  kind: ExceptionKind::InvalidResult,
                  payload: v,
                })
              }
              return Ok(Control::ReturnTo { cont: caller, value: v })
            }
            PrimitiveResult::Failure(failure) => InvokeMode::AfterFailure(failure),
            PrimitiveResult::FiberSuspended => return Ok(Control::Park(caller)),
            PrimitiveResult::ContinuationChanged => {
              let cont = self.switched.take()
                .expect("continuation-switching primitive set a continuation");
              return Ok(Control::Reenter(cont))
            }
          }
        } else {
          InvokeMode::Normal
        }
      }
      seeded => seeded,
    };
    let mut frame = Frame::new(function, args, caller);
    if let InvokeMode::AfterFailure(failure) = mode {
      let failure_var = frame.slot(code.num_args() + 1).clone();
      failure_var.as_variable()
        .expect("a fallible primitive function declares a failure variable")
        .write(failure)
        .expect("failure codes conform to the failure variable type");
      frame.slot_put(code.num_args() + 1, failure_var);
    }
    self.enter_body(frame)
  }

  /// Select the starting chunk for a frame and enter it.
  fn enter_body(&mut self, frame: Frame) -> Result<Control, Exception> {
    let code = frame.code.clone();
    let mut chunk_id = code.starting_chunk();
    if chunk_id == ChunkId::DEFAULT {
      // The default chunk is the L1 loop plus the warm-up counter.
      if code.countdown_hit_zero() {
        chunk_id = build_l2::translate_and_install(self.runtime, &code, 0);
        code.set_starting_chunk(chunk_id);
        code.reset_countdown(REOPTIMIZATION_THRESHOLD);
        debug!(code = code.name(), chunk = chunk_id.0, "translated at level 0");
      }
      if chunk_id == ChunkId::DEFAULT {
        return Ok(Control::RunL1(frame))
      }
    }
    let chunk = self.runtime.chunk(chunk_id);
    if !chunk.is_valid() {
      return Ok(Control::RunL1(frame))
    }
    let regs = Regs::for_chunk(&chunk, &frame.caller, &frame.function, &frame.slots);
    Ok(Control::RunL2 { chunk_id, chunk, offset: 0, regs })
  }

  // --- returns ---

  fn return_to(&mut self, cont: Option<Arc<Continuation>>, value: Value)
      -> Result<Control, Exception> {
    let Some(cont) = cont else { return Ok(Control::Done(value)) };
    if cont.stackp > cont.num_slots() {
      // A label frame: returning into it restarts the function with the
      // preserved arguments.
      let code = cont.code().clone();
      let args =
        (1..=code.num_args()).map(|i| cont.slot_at(i).clone()).collect();
      return Ok(Control::Invoke {
        function: cont.function.clone(),
        args,
        caller: cont.caller.clone(),
        mode: InvokeMode::Normal,
      })
    }
    let sentinel = cont.slot_at(cont.stackp);
    let expected = sentinel.as_ty()
      .expect("call frames park the expected type under the result slot")
      .clone();
    if !value.is_instance_of(&expected) {
      self.runtime.notify_invalid_result(&cont.function, &expected, &value);
      return Err(Exception { kind: ExceptionKind::InvalidResult, payload: value })
    }
    if cont.resume_chunk != ChunkId::DEFAULT {
      let chunk = self.runtime.chunk(cont.resume_chunk);
      if chunk.is_valid() {
        let mut regs = Regs::for_chunk(&chunk, &cont.caller, &cont.function, cont.slots());
        regs.set(Regs::slot_reg(cont.stackp), value);
        return Ok(Control::RunL2 {
          chunk_id: cont.resume_chunk,
          chunk,
          offset: cont.resume_offset,
          regs,
        })
      }
    }
    let mut frame = Frame::from_continuation(&cont);
    frame.slot_put(cont.stackp, value);
    Ok(Control::RunL1(frame))
  }

  // --- Level One ---

  #[allow(clippy::too_many_lines)]
  fn run_l1(&mut self, mut frame: Frame) -> Result<Control, Exception> {
    loop {
      self.check_cancel()?;
      if frame.pc >= frame.code.num_nybbles() {
        let value = frame.pop();
        return Ok(Control::ReturnTo { cont: frame.caller, value })
      }
      let code = frame.code.clone();
      let mut reader = code.reader(frame.pc);
      let op = L1Op::read(&mut reader).map_err(|e|
        Exception::msg(ExceptionKind::AssertionFailed, e.to_string()))?;
      frame.pc = reader.pc();
      trace!(code = code.name(), pc = frame.pc, ?op, "step");
      match op {
        L1Op::PushLiteral(n) => frame.push(code.literal(n).clone()),
        L1Op::PushLocal(n) => {
          let v = frame.slot(n + 1).clone().make_immutable();
          frame.push(v);
        }
        L1Op::PushLastLocal(n) => {
          let v = std::mem::replace(&mut frame.slots[n as usize], Value::nil());
          frame.push(v);
        }
        L1Op::PushOuter(n) | L1Op::PushLastOuter(n) => {
          // Outers of a shared function stay intact; there is nothing to
          // nil out in an immutable holder.
          let outer = frame.function.as_function()
            .expect("frame function")
            .outers[n as usize].clone();
          frame.push(outer.make_immutable());
        }
        L1Op::GetLocal(n) => {
          let v = self.read_variable(frame.slot(n + 1), false)?;
          frame.push(v);
        }
        L1Op::GetLocalClearing(n) => {
          let v = self.read_variable(frame.slot(n + 1), true)?;
          frame.push(v);
        }
        L1Op::SetLocal(n) => {
          let v = frame.pop();
          self.write_variable(frame.slot(n + 1), v)?;
        }
        L1Op::GetOuter(n) => {
          let data = frame.function.as_function().expect("frame function");
          let v = self.read_variable(&data.outers[n as usize].clone(), false)?;
          frame.push(v);
        }
        L1Op::GetOuterClearing(n) => {
          let data = frame.function.as_function().expect("frame function");
          let v = self.read_variable(&data.outers[n as usize].clone(), true)?;
          frame.push(v);
        }
        L1Op::SetOuter(n) => {
          let v = frame.pop();
          let data = frame.function.as_function().expect("frame function");
          self.write_variable(&data.outers[n as usize].clone(), v)?;
        }
        L1Op::GetLiteral(n) => {
          let v = self.read_variable(code.literal(n), false)?;
          frame.push(v);
        }
        L1Op::SetLiteral(n) => {
          let v = frame.pop();
          self.write_variable(code.literal(n), v)?;
        }
        L1Op::PushLiteralVar(n) => {
          debug_assert!(code.literal(n).as_variable().is_some());
          frame.push(code.literal(n).clone());
        }
        L1Op::Close { outers, literal } => {
          let mut captured = vec![Value::nil(); outers as usize];
          for slot in captured.iter_mut().rev() { *slot = frame.pop() }
          let inner = code.literal(literal).clone();
          let ValueKind::Code(inner_code) = inner.kind() else {
            return Err(Exception::msg(ExceptionKind::AssertionFailed,
              "close literal is not compiled code"))
          };
          frame.push(inner_code.into_function(captured));
        }
        L1Op::MakeTuple(n) => {
          let mut elements = vec![Value::nil(); n as usize];
          for slot in elements.iter_mut().rev() { *slot = frame.pop() }
          frame.push(Value::tuple(elements));
        }
        L1Op::Pop => { frame.pop(); }
        L1Op::Duplicate => frame.push(frame.top().clone().make_immutable()),
        L1Op::GetType(n) => {
          let ty = frame.slot(frame.stackp + n).instance_ty();
          frame.push(Value::new(ValueKind::Ty(ty)));
        }
        L1Op::PushLabel => {
          let code_ref = &frame.code;
          let mut b = ContinuationBuilder::new(frame.function.clone(), code_ref.num_slots());
          for i in 1..=code_ref.num_args() {
            b.slot_at_put(i, frame.slot(i).clone());
          }
          let label = b.caller(frame.caller.clone()).freeze();
          frame.push(Value::new(ValueKind::Cont(label)));
        }
        L1Op::Call { bundle, expected } =>
          return self.l1_call(frame, bundle, expected, false),
        L1Op::SuperCall { bundle, expected } =>
          return self.l1_call(frame, bundle, expected, true),
      }
    }
  }

  fn read_variable(&self, var: &Value, clearing: bool) -> Result<Value, Exception> {
    let var = var.as_variable().ok_or_else(|| Exception::msg(
      ExceptionKind::VariableAccess, "value is not a variable"))?;
    let read = if clearing { var.read_clearing() } else { var.read() };
    read.map_err(|e| Exception::msg(ExceptionKind::VariableAccess, e.to_string()))
  }

  fn write_variable(&self, var: &Value, value: Value) -> Result<(), Exception> {
    let var = var.as_variable().ok_or_else(|| Exception::msg(
      ExceptionKind::VariableAccess, "value is not a variable"))?;
    var.write(value)
      .map_err(|e| Exception::msg(ExceptionKind::VariableAccess, e.to_string()))
  }

  /// The L1 call sequence: pop the dispatch inputs, look up, park the
  /// expected type as the sentinel, reify, and invoke.
  fn l1_call(&mut self, mut frame: Frame, bundle: u32, expected: u32, by_types: bool)
      -> Result<Control, Exception> {
    let code = frame.code.clone();
    let atom = code.literal(bundle).as_atom()
      .ok_or_else(|| Exception::msg(ExceptionKind::UnresolvedDispatch,
        "call bundle literal is not an atom"))?
      .clone();
    let expected = code.literal(expected).as_ty()
      .ok_or_else(|| Exception::msg(ExceptionKind::UnresolvedDispatch,
        "expected-type literal is not a type"))?
      .clone();
    let arity = self.runtime.with_method(&atom, |m| m.map(|m| m.arity))
      .ok_or_else(|| Exception::msg(ExceptionKind::UnresolvedDispatch,
        format!("undefined method {}", atom.name())))?;
    // The super-call pops the dispatch types first, then the argument
    // values; only the types take part in the lookup.
    let types = by_types.then(|| {
      let mut types = vec![Ty::bottom(); arity as usize];
      for slot in types.iter_mut().rev() {
        if let Some(t) = frame.pop().as_ty() { *slot = t.clone() }
      }
      types
    });
    let mut args = vec![Value::nil(); arity as usize];
    for slot in args.iter_mut().rev() { *slot = frame.pop() }
    let definition = self.runtime.with_method(&atom, |m| {
      let m = m.expect("checked above");
      match &types {
        Some(tys) => m.lookup_by_types(tys),
        None => m.lookup_by_values(&args),
      }
    }).map_err(|e| Exception::msg(ExceptionKind::UnresolvedDispatch, e.to_string()))?;
    let Definition::Method(callee) = definition else {
      unreachable!("lookup yields only concrete definitions")
    };
    frame.push(Value::new(ValueKind::Ty(expected)));
    let caller = frame.reify();
    Ok(Control::Invoke {
      function: callee,
      args,
      caller: Some(caller),
      mode: InvokeMode::Normal,
    })
  }

  // --- Level Two ---

  #[allow(clippy::too_many_lines)]
  fn run_l2(&mut self, chunk_id: ChunkId, chunk: &Arc<Chunk>, mut offset: u32, mut regs: Regs)
      -> Result<Control, Exception> {
    self.check_cancel()?;
    loop {
      let instr = &chunk.instructions[offset as usize];
      trace!(chunk = chunk_id.0, offset, ?instr, "l2 step");
      let mut next = offset + 1;
      match instr {
        L2Instr::Move { src, dst } => {
          let v = regs.get(*src).clone();
          regs.set(*dst, v);
        }
        L2Instr::MoveConstant { value, dst } => regs.set(*dst, value.clone()),
        L2Instr::MoveIntConstant { value, dst } => regs.ints[dst.0 as usize] = *value,
        L2Instr::Clear { dst } => regs.set(*dst, Value::nil()),
        L2Instr::MakeImmutable { src, dst }
        | L2Instr::MakeSubobjectsImmutable { src, dst } => {
          let v = regs.get(*src).clone().make_immutable();
          regs.set(*dst, v);
        }
        L2Instr::GetVariable { var, dst } => {
          let v = self.read_variable(regs.get(*var), false)?;
          regs.set(*dst, v);
        }
        L2Instr::GetVariableClearing { var, dst } => {
          let v = self.read_variable(regs.get(*var), true)?;
          regs.set(*dst, v);
        }
        L2Instr::SetVariable { var, value } => {
          let v = regs.get(*value).clone();
          self.write_variable(regs.get(*var), v)?;
        }
        L2Instr::CreateVariable { inner, dst } =>
          regs.set(*dst, Value::new(ValueKind::Var(Variable::new(inner.clone())))),
        L2Instr::CreateFunction { code, outers, dst } => {
          let captured = outers.iter().map(|r| regs.get(*r).clone()).collect();
          regs.set(*dst, code.into_function(captured));
        }
        L2Instr::ExtractOuter { function, index, dst } => {
          let data = regs.get(*function).as_function()
            .expect("extract-outer target is a function")
            .clone();
          regs.set(*dst, data.outers[*index as usize - 1].clone());
        }
        L2Instr::FunctionParameterType { function, index, dst } => {
          let data = regs.get(*function).as_function()
            .expect("parameter-type target is a function")
            .clone();
          let params = data.code.func_ty().as_func_ty()
            .map_or_else(Ty::any, |f| f.params.clone());
          let ty = params.as_tuple_ty()
            .map_or_else(Ty::any, |t| t.type_at(*index as usize));
          regs.set(*dst, Value::new(ValueKind::Ty(ty)));
        }
        L2Instr::GetType { src, dst } => {
          let ty = regs.get(*src).instance_ty();
          regs.set(*dst, Value::new(ValueKind::Ty(ty)));
        }
        L2Instr::CreateTuple { elements, dst } => {
          let tuple = Value::tuple(elements.iter().map(|r| regs.get(*r).clone()));
          regs.set(*dst, tuple);
        }
        L2Instr::CreateContinuation { caller, function, pc, stackp, slots, resume_offset,
            dst } => {
          let function_v = regs.get(*function).clone();
          let num_slots = function_v.as_function()
            .expect("reified frame function")
            .code.num_slots();
          let mut b = ContinuationBuilder::new(function_v, num_slots);
          for (i, r) in slots.iter().enumerate() {
            b.slot_at_put(i as u32 + 1, regs.get(*r).clone());
          }
          b = b.caller(regs.get(*caller).as_continuation().cloned())
            .pc(*pc)
            .stackp(*stackp);
          if let Some(off) = resume_offset {
            b = b.resume_point(chunk_id, *off);
          }
          regs.set(*dst, Value::new(ValueKind::Cont(b.freeze())));
        }
        L2Instr::EnterL2Chunk { default_offset } => {
          if !chunk.is_valid() {
            let frame = self.frame_from_regs(chunk, &regs, *default_offset);
            return Ok(Control::RunL1(frame))
          }
        }
        L2Instr::ReenterL1FromInterrupt => {
          let fiber = self.fiber.as_ref().expect("a fiber is running");
          let cont = fiber.with_shared(|shared| shared.continuation.take())
            .expect("interrupted fiber has a continuation");
          return Ok(Control::Reenter(cont))
        }
        L2Instr::Return { caller, value } => {
          return Ok(Control::ReturnTo {
            cont: regs.get(*caller).as_continuation().cloned(),
            value: regs.get(*value).clone(),
          })
        }
        L2Instr::Invoke { function, args, expected, sentinel_slot, reify_pc, reify_stackp,
            skip_return_check: _ } => {
          let callee = regs.get(*function).clone();
          let args = args.iter().map(|r| regs.get(*r).clone()).collect();
          return Ok(self.l2_call(chunk_id, chunk, &mut regs, next, callee, args,
            expected.clone(), *sentinel_slot, *reify_pc, *reify_stackp, InvokeMode::Normal))
        }
        L2Instr::CallBundle { bundle, args, expected, sentinel_slot, reify_pc,
            reify_stackp } => {
          let args: Vec<_> = args.iter().map(|r| regs.get(*r).clone()).collect();
          let definition = self.runtime.with_method(bundle, |m| {
            m.map_or(Err(crate::runtime::LookupError::NoApplicable),
              |m| m.lookup_by_values(&args))
          }).map_err(|e| Exception::msg(ExceptionKind::UnresolvedDispatch, e.to_string()))?;
          let Definition::Method(callee) = definition else {
            unreachable!("lookup yields only concrete definitions")
          };
          return Ok(self.l2_call(chunk_id, chunk, &mut regs, next, callee, args,
            expected.clone(), *sentinel_slot, *reify_pc, *reify_stackp, InvokeMode::Normal))
        }
        L2Instr::SuperCallBundle { bundle, args, types, expected, sentinel_slot, reify_pc,
            reify_stackp } => {
          let args: Vec<_> = args.iter().map(|r| regs.get(*r).clone()).collect();
          let types: Vec<_> = types.iter()
            .map(|r| regs.get(*r).as_ty().cloned().unwrap_or_else(Ty::bottom))
            .collect();
          let definition = self.runtime.with_method(bundle, |m| {
            m.map_or(Err(crate::runtime::LookupError::NoApplicable),
              |m| m.lookup_by_types(&types))
          }).map_err(|e| Exception::msg(ExceptionKind::UnresolvedDispatch, e.to_string()))?;
          let Definition::Method(callee) = definition else {
            unreachable!("lookup yields only concrete definitions")
          };
          return Ok(self.l2_call(chunk_id, chunk, &mut regs, next, callee, args,
            expected.clone(), *sentinel_slot, *reify_pc, *reify_stackp, InvokeMode::Normal))
        }
        L2Instr::CallAfterFailedPrimitive { function, args, failure, expected, sentinel_slot,
            reify_pc, reify_stackp } => {
          let callee = regs.get(*function).clone();
          let args = args.iter().map(|r| regs.get(*r).clone()).collect();
          let failure = regs.get(*failure).clone();
          return Ok(self.l2_call(chunk_id, chunk, &mut regs, next, callee, args,
            expected.clone(), *sentinel_slot, *reify_pc, *reify_stackp,
            InvokeMode::AfterFailure(failure)))
        }
        L2Instr::RunInfalliblePrimitive { prim, args, check, expected, dst } => {
          let args: Vec<_> = args.iter().map(|r| regs.get(*r).clone()).collect();
          let prim = PrimitiveRegistry::shared().get(*prim).expect("manifested");
          match prim.attempt(&args, self, !check) {
            PrimitiveResult::Success(v) => {
              if *check && !v.is_instance_of(expected) {
                self.runtime.notify_invalid_result(regs.function(), expected, &v);
                return Err(Exception { kind: ExceptionKind::InvalidResult, payload: v })
              }
              regs.set(*dst, v);
            }
            _ => return Err(Exception::msg(ExceptionKind::AssertionFailed,
              format!("infallible primitive {} failed", prim.name()))),
          }
        }
        L2Instr::AttemptInlinePrimitive { prim, args, check, expected, dst, failure_dst,
            on_success, on_failure } => {
          let args: Vec<_> = args.iter().map(|r| regs.get(*r).clone()).collect();
          let prim = PrimitiveRegistry::shared().get(*prim).expect("manifested");
          match prim.attempt(&args, self, !check) {
            PrimitiveResult::Success(v) => {
              if *check && !v.is_instance_of(expected) {
                self.runtime.notify_invalid_result(regs.function(), expected, &v);
                return Err(Exception { kind: ExceptionKind::InvalidResult, payload: v })
              }
              regs.set(*dst, v);
              next = on_success.0;
            }
            PrimitiveResult::Failure(code) => {
              regs.set(*failure_dst, code);
              next = on_failure.0;
            }
            _ => unreachable!("suspending and switching primitives are never inlined"),
          }
        }
        L2Instr::Jump { target } => next = target.0,
        L2Instr::JumpIfKindOfConstant { value, ty, if_kind, if_not } =>
          next = if regs.get(*value).is_instance_of(ty) { if_kind.0 } else { if_not.0 },
        L2Instr::JumpIfNotKindOfConstant { value, ty, if_not } => {
          if !regs.get(*value).is_instance_of(ty) { next = if_not.0 }
        }
        L2Instr::JumpIfGreaterOrEqual { a, b, if_ge, if_lt } => {
          next = if regs.ints[a.0 as usize] >= regs.ints[b.0 as usize] {
            if_ge.0
          } else {
            if_lt.0
          };
        }
        L2Instr::AddInt { a, b, dst, on_overflow, on_ok } => {
          match regs.ints[a.0 as usize].checked_add(regs.ints[b.0 as usize]) {
            Some(n) => { regs.ints[dst.0 as usize] = n; next = on_ok.0 }
            None => next = on_overflow.0,
          }
        }
        L2Instr::SubtractInt { a, b, dst, on_overflow, on_ok } => {
          match regs.ints[a.0 as usize].checked_sub(regs.ints[b.0 as usize]) {
            Some(n) => { regs.ints[dst.0 as usize] = n; next = on_ok.0 }
            None => next = on_overflow.0,
          }
        }
        L2Instr::MultiplyInt { a, b, dst, on_overflow, on_ok } => {
          match regs.ints[a.0 as usize].checked_mul(regs.ints[b.0 as usize]) {
            Some(n) => { regs.ints[dst.0 as usize] = n; next = on_ok.0 }
            None => next = on_overflow.0,
          }
        }
        L2Instr::DivideIntByInt { dividend, divisor, quotient, remainder, on_out_of_range,
            on_zero_divisor, on_ok } => {
          let a = regs.ints[dividend.0 as usize];
          let b = regs.ints[divisor.0 as usize];
          if b == 0 {
            next = on_zero_divisor.0;
          } else if a == i64::MIN && b == -1 {
            next = on_out_of_range.0;
          } else {
            regs.ints[quotient.0 as usize] = a.div_euclid(b);
            regs.ints[remainder.0 as usize] = a.rem_euclid(b);
            next = on_ok.0;
          }
        }
        L2Instr::BoxInt { src, dst } => {
          let v = Value::int(regs.ints[src.0 as usize]);
          regs.set(*dst, v);
        }
        L2Instr::UnboxInt { src, dst, on_ok, on_fail } => {
          match regs.get(*src).as_int().and_then(|n| i64::try_from(n).ok()) {
            Some(n) => { regs.ints[dst.0 as usize] = n; next = on_ok.0 }
            None => next = on_fail.0,
          }
        }
        L2Instr::DecrementCounterAndReoptimizeOnZero { level } => {
          let code = chunk.code.as_ref().expect("counter in a translated chunk").clone();
          if code.countdown_hit_zero() {
            let new_id = build_l2::translate_and_install(self.runtime, &code, *level);
            code.set_starting_chunk(new_id);
            code.reset_countdown(REOPTIMIZATION_THRESHOLD);
            debug!(code = code.name(), chunk = new_id.0, level, "reoptimized");
            if new_id != chunk_id && new_id != ChunkId::DEFAULT {
              let new_chunk = self.runtime.chunk(new_id);
              let slots_len = code.num_slots() as usize;
              let regs2 = Regs::for_chunk(&new_chunk, &regs.caller(), regs.function(),
                &regs.boxed[ARCH_FIXED as usize..ARCH_FIXED as usize + slots_len]);
              return Ok(Control::RunL2 {
                chunk_id: new_id,
                chunk: new_chunk,
                offset: 0,
                regs: regs2,
              })
            }
          }
        }
        L2Instr::Comment(_) => {}
      }
      if next <= offset {
        // Back-edge: a safe point.
        self.check_cancel()?;
      }
      offset = next;
    }
  }

  /// Fall back from an invalidated chunk to the L1 interpreter, rebuilding
  /// the live frame from the architectural registers.
  fn frame_from_regs(&self, chunk: &Chunk, regs: &Regs, pc: u32) -> Frame {
    let code = chunk.code.as_ref().expect("translated chunk has code").clone();
    let num_slots = code.num_slots() as usize;
    Frame {
      function: regs.function().clone(),
      code,
      caller: regs.caller(),
      pc,
      stackp: num_slots as u32 + 1,
      slots: regs.boxed[ARCH_FIXED as usize..ARCH_FIXED as usize + num_slots].to_vec(),
    }
  }

  /// Shared tail of the L2 call instructions: park the sentinel, reify the
  /// frame with its resume offset, and hand control to the callee.
  #[allow(clippy::too_many_arguments)]
  fn l2_call(
    &mut self,
    chunk_id: ChunkId,
    chunk: &Arc<Chunk>,
    regs: &mut Regs,
    resume_offset: u32,
    callee: Value,
    args: Vec<Value>,
    expected: Ty,
    sentinel_slot: u32,
    reify_pc: u32,
    reify_stackp: u32,
    mode: InvokeMode,
  ) -> Control {
    regs.set(Regs::slot_reg(sentinel_slot), Value::new(ValueKind::Ty(expected)));
    let function = regs.function().clone();
    let code = chunk.code.as_ref().expect("calls happen in translated chunks");
    let num_slots = code.num_slots();
    let mut b = ContinuationBuilder::new(function, num_slots);
    for i in 1..=num_slots {
      b.slot_at_put(i, regs.get(Regs::slot_reg(i)).clone());
    }
    let caller = b.caller(regs.caller())
      .pc(reify_pc)
      .stackp(reify_stackp)
      .resume_point(chunk_id, resume_offset)
      .freeze();
    Control::Invoke { function: callee, args, caller: Some(caller), mode }
  }
}
