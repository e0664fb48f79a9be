//! The translation pass from Level One nybblecodes to Level Two chunks.
//!
//! A single forward walk over the nybblecodes emits L2 instructions while
//! simulating the operand stack onto the architectural slot registers, so
//! that at every call boundary the registers mirror the frame a reified
//! continuation would hold. Alongside the emission the translator tracks,
//! per register, the best known type, the proven constant if any, and the
//! origin chains that later let the optimiser erase redundant moves.
//!
//! At call sites the translator tries to avoid the full dispatch: an
//! effectively monomorphic primitive call is folded to a constant when its
//! arguments are proven constants, attempted inline when it merely can
//! fail, or run without any check when it cannot. Whatever was decided,
//! the bundle's atom is recorded as contingent, so a later redefinition
//! invalidates the chunk.

use std::sync::Arc;

use hashbrown::HashMap;
use tracing::trace;

use crate::interpreter::Interpreter;
use crate::l2_opt;
use crate::primitive::{Fallibility, Primitive, PrimitiveFlags, PrimitiveRegistry,
  PrimitiveResult};
use crate::runtime::Runtime;
use crate::types::code::{L1Op, PrimitiveId, RawFunction, ReadError};
use crate::types::l2::{
  ARCH_FIXED, Chunk, ChunkId, L2Instr, L2Pc, L2Reg, REG_CALLER, REG_FUNCTION,
};
use crate::types::ty::Ty;
use crate::types::value::{Atom, Value, ValueKind};

/// Why a raw function could not be translated; the default chunk keeps
/// interpreting it at Level One.
#[derive(Clone, Debug, thiserror::Error)]
pub enum Untranslatable {
  /// The nybblecode stream did not decode.
  #[error("undecodable nybblecodes: {0}")]
  BadCode(#[from] ReadError),
  /// A call site names a method with no definitions yet.
  #[error("call site names an undefined method {0}")]
  UndefinedMethod(String),
  /// A call-site literal had an unexpected kind.
  #[error("malformed call-site literal")]
  BadCallSite,
}

/// Translate `code` at `level` and install the resulting chunk, returning
/// its id; the default chunk on failure.
pub fn translate_and_install(runtime: &Runtime, code: &Arc<RawFunction>, level: u8) -> ChunkId {
  match translate(runtime, code, level) {
    Ok(chunk) => runtime.install_chunk(chunk),
    Err(err) => {
      trace!(code = code.name(), %err, "translation abandoned");
      ChunkId::DEFAULT
    }
  }
}

/// Translate `code` into a fresh chunk at the given optimisation level.
pub fn translate(runtime: &Runtime, code: &Arc<RawFunction>, level: u8)
    -> Result<Chunk, Untranslatable> {
  let mut tr = Translator::new(runtime, code.clone());
  if level == 0 {
    tr.emit(L2Instr::Comment(format!("naive translation of {}", code.name())));
    tr.emit(L2Instr::EnterL2Chunk { default_offset: 0 });
    tr.emit(L2Instr::DecrementCounterAndReoptimizeOnZero { level: 1 });
  }
  tr.walk()?;
  let Translator { mut instructions, contingents, next_temp, next_int, .. } = tr;
  let num_arch = ARCH_FIXED + code.num_slots();
  if level >= 1 {
    l2_opt::optimize(&mut instructions, num_arch);
  }
  let (num_boxed, num_int) = allocate(&mut instructions, num_arch, next_temp, next_int);
  Ok(Chunk::new(Some(code.clone()), instructions, contingents, level, num_boxed, num_int))
}

/// The baseline register colouring: architectural registers keep their
/// pre-coloured indices; every other identity is assigned the next free
/// slot in order of appearance.
fn allocate(instructions: &mut [L2Instr], arch: u32, temp_limit: u32, int_limit: u32)
    -> (u32, u32) {
  let mut boxed_map: HashMap<u32, u32> = HashMap::new();
  let mut int_map: HashMap<u32, u32> = HashMap::new();
  let mut next_boxed = arch;
  let mut next_int = 0;
  for instr in instructions {
    instr.rewrite_regs(
      |r| {
        if r.0 < arch { return r }
        debug_assert!(r.0 < temp_limit);
        L2Reg(*boxed_map.entry(r.0).or_insert_with(|| {
          let slot = next_boxed;
          next_boxed += 1;
          slot
        }))
      },
      |r| {
        debug_assert!(r.0 < int_limit);
        crate::types::l2::L2IntReg(*int_map.entry(r.0).or_insert_with(|| {
          let slot = next_int;
          next_int += 1;
          slot
        }))
      },
    );
  }
  (next_boxed, next_int)
}

struct Translator<'rt> {
  runtime: &'rt Runtime,
  code: Arc<RawFunction>,
  instructions: Vec<L2Instr>,
  contingents: Vec<Atom>,
  stackp: u32,
  next_temp: u32,
  next_int: u32,
  register_types: HashMap<L2Reg, Ty>,
  register_constants: HashMap<L2Reg, Value>,
  register_origins: HashMap<L2Reg, Vec<L2Reg>>,
  inverted_origins: HashMap<L2Reg, Vec<L2Reg>>,
}

impl<'rt> Translator<'rt> {
  fn new(runtime: &'rt Runtime, code: Arc<RawFunction>) -> Self {
    let num_slots = code.num_slots();
    let mut tr = Self {
      runtime,
      code: code.clone(),
      instructions: vec![],
      contingents: vec![],
      stackp: num_slots + 1,
      next_temp: ARCH_FIXED + num_slots,
      next_int: 0,
      register_types: HashMap::new(),
      register_constants: HashMap::new(),
      register_origins: HashMap::new(),
      inverted_origins: HashMap::new(),
    };
    tr.register_types.insert(REG_FUNCTION, code.func_ty().clone());
    if let Some(params) = code.func_ty().as_func_ty().map(|f| f.params.clone()) {
      if let Some(tt) = params.as_tuple_ty() {
        for i in 1..=code.num_args() {
          tr.register_types.insert(slot_reg(i), tt.type_at(i as usize));
        }
      }
    }
    for (i, local_ty) in code.local_types().iter().enumerate() {
      tr.register_types.insert(
        slot_reg(code.num_args() + i as u32 + 1),
        Ty::variable(local_ty.clone()));
    }
    tr
  }

  fn emit(&mut self, instr: L2Instr) -> u32 {
    self.instructions.push(instr);
    self.instructions.len() as u32 - 1
  }

  fn fresh_temp(&mut self) -> L2Reg {
    let r = L2Reg(self.next_temp);
    self.next_temp += 1;
    r
  }

  /// Disconnect a register from every origin chain before overwriting it.
  fn sever(&mut self, dst: L2Reg) {
    for origin in self.register_origins.remove(&dst).unwrap_or_default() {
      if let Some(followers) = self.inverted_origins.get_mut(&origin) {
        followers.retain(|&f| f != dst);
      }
    }
    for follower in self.inverted_origins.remove(&dst).unwrap_or_default() {
      if let Some(origins) = self.register_origins.get_mut(&follower) {
        origins.retain(|&o| o != dst);
      }
    }
    self.register_types.remove(&dst);
    self.register_constants.remove(&dst);
  }

  /// Record a write of a freshly computed value.
  fn set_write(&mut self, dst: L2Reg, ty: Ty) {
    self.sever(dst);
    self.register_types.insert(dst, ty);
  }

  /// Record a constant write: the type is the enumeration of one instance.
  fn set_constant(&mut self, dst: L2Reg, value: Value) {
    self.sever(dst);
    self.register_types.insert(dst, value.instance_ty());
    self.register_constants.insert(dst, value);
  }

  /// Record a move: the destination joins the source's origin chain.
  fn set_move(&mut self, dst: L2Reg, src: L2Reg) {
    self.sever(dst);
    let mut chain = self.register_origins.get(&src).cloned().unwrap_or_default();
    chain.push(src);
    for &origin in &chain {
      self.inverted_origins.entry(origin).or_default().push(dst);
    }
    self.register_origins.insert(dst, chain);
    if let Some(ty) = self.register_types.get(&src).cloned() {
      self.register_types.insert(dst, ty);
    }
    if let Some(c) = self.register_constants.get(&src).cloned() {
      self.register_constants.insert(dst, c);
    }
  }

  fn ty_of(&self, r: L2Reg) -> Ty {
    self.register_types.get(&r).cloned().unwrap_or_else(Ty::any)
  }

  fn push_slot(&mut self) -> L2Reg {
    debug_assert!(self.stackp > self.code.num_args() + self.code.num_locals() + 1,
      "operand stack overflow in translation");
    self.stackp -= 1;
    slot_reg(self.stackp)
  }

  fn pop_slot(&mut self) -> L2Reg {
    let r = slot_reg(self.stackp);
    self.stackp += 1;
    r
  }

  fn push_constant(&mut self, value: Value) {
    let dst = self.push_slot();
    self.emit(L2Instr::MoveConstant { value: value.clone(), dst });
    self.set_constant(dst, value);
  }

  #[allow(clippy::too_many_lines)]
  fn walk(&mut self) -> Result<(), Untranslatable> {
    let code = self.code.clone();
    let mut reader = code.reader(0);
    while !reader.at_end() {
      let op = L1Op::read(&mut reader)?;
      match op {
        L1Op::PushLiteral(n) => self.push_constant(code.literal(n).clone()),
        L1Op::PushLocal(n) => {
          let src = slot_reg(n + 1);
          let dst = self.push_slot();
          self.emit(L2Instr::MakeImmutable { src, dst });
          self.set_move(dst, src);
        }
        L1Op::PushLastLocal(n) => {
          let src = slot_reg(n + 1);
          let dst = self.push_slot();
          self.emit(L2Instr::Move { src, dst });
          self.set_move(dst, src);
          self.emit(L2Instr::Clear { dst: src });
          self.set_write(src, Ty::any());
        }
        L1Op::PushOuter(n) | L1Op::PushLastOuter(n) => {
          let dst = self.push_slot();
          self.emit(L2Instr::ExtractOuter {
            function: REG_FUNCTION,
            index: n + 1,
            dst,
          });
          self.set_write(dst, Ty::any());
        }
        L1Op::GetLocal(n) | L1Op::GetLocalClearing(n) => {
          let var = slot_reg(n + 1);
          let dst = self.push_slot();
          let clearing = matches!(op, L1Op::GetLocalClearing(_));
          self.emit(if clearing {
            L2Instr::GetVariableClearing { var, dst }
          } else {
            L2Instr::GetVariable { var, dst }
          });
          let content = self.local_content_ty(n);
          self.set_write(dst, content);
        }
        L1Op::SetLocal(n) => {
          let value = self.pop_slot();
          self.emit(L2Instr::SetVariable { var: slot_reg(n + 1), value });
        }
        L1Op::GetOuter(n) | L1Op::GetOuterClearing(n) => {
          let holder = self.fresh_temp();
          self.emit(L2Instr::ExtractOuter {
            function: REG_FUNCTION,
            index: n + 1,
            dst: holder,
          });
          let dst = self.push_slot();
          let clearing = matches!(op, L1Op::GetOuterClearing(_));
          self.emit(if clearing {
            L2Instr::GetVariableClearing { var: holder, dst }
          } else {
            L2Instr::GetVariable { var: holder, dst }
          });
          self.set_write(dst, Ty::any());
        }
        L1Op::SetOuter(n) => {
          let value = self.pop_slot();
          let holder = self.fresh_temp();
          self.emit(L2Instr::ExtractOuter {
            function: REG_FUNCTION,
            index: n + 1,
            dst: holder,
          });
          self.emit(L2Instr::SetVariable { var: holder, value });
        }
        L1Op::GetLiteral(n) => {
          let holder = self.fresh_temp();
          let var = code.literal(n).clone();
          let content = var.as_variable()
            .map_or_else(Ty::any, |v| v.content_ty().clone());
          self.emit(L2Instr::MoveConstant { value: var, dst: holder });
          let dst = self.push_slot();
          self.emit(L2Instr::GetVariable { var: holder, dst });
          self.set_write(dst, content);
        }
        L1Op::SetLiteral(n) => {
          let value = self.pop_slot();
          let holder = self.fresh_temp();
          self.emit(L2Instr::MoveConstant { value: code.literal(n).clone(), dst: holder });
          self.emit(L2Instr::SetVariable { var: holder, value });
        }
        L1Op::PushLiteralVar(n) => self.push_constant(code.literal(n).clone()),
        L1Op::Close { outers, literal } => {
          let sources: Vec<L2Reg> = (0..outers)
            .map(|i| slot_reg(self.stackp + outers - 1 - i))
            .collect();
          self.stackp += outers;
          let inner = code.literal(literal).clone();
          let ValueKind::Code(inner_code) = inner.kind() else {
            return Err(Untranslatable::BadCallSite)
          };
          let dst = self.push_slot();
          self.emit(L2Instr::CreateFunction {
            code: inner_code.clone(),
            outers: sources,
            dst,
          });
          self.set_write(dst, inner_code.func_ty().clone());
        }
        L1Op::MakeTuple(n) => {
          let sources: Vec<L2Reg> = (0..n)
            .map(|i| slot_reg(self.stackp + n - 1 - i))
            .collect();
          self.stackp += n;
          let dst = self.push_slot();
          let constants: Option<Vec<Value>> = sources.iter()
            .map(|r| self.register_constants.get(r).cloned())
            .collect();
          if let Some(elements) = constants {
            let tuple = Value::tuple(elements);
            self.emit(L2Instr::MoveConstant { value: tuple.clone(), dst });
            self.set_constant(dst, tuple);
          } else {
            let leading = sources.iter().map(|&r| self.ty_of(r)).collect();
            self.emit(L2Instr::CreateTuple { elements: sources, dst });
            self.set_write(dst, Ty::fixed_tuple(leading));
          }
        }
        L1Op::Pop => { self.pop_slot(); }
        L1Op::Duplicate => {
          let src = slot_reg(self.stackp);
          let dst = self.push_slot();
          self.emit(L2Instr::MakeImmutable { src, dst });
          self.set_move(dst, src);
        }
        L1Op::GetType(n) => {
          let src = slot_reg(self.stackp + n);
          let dst = self.push_slot();
          if let Some(v) = self.register_constants.get(&src).cloned() {
            let ty = Value::new(ValueKind::Ty(v.instance_ty()));
            self.emit(L2Instr::MoveConstant { value: ty.clone(), dst });
            self.set_constant(dst, ty);
          } else {
            let static_ty = self.ty_of(src);
            self.emit(L2Instr::GetType { src, dst });
            self.set_write(dst, Ty::meta(static_ty));
          }
        }
        L1Op::PushLabel => {
          let slots: Vec<L2Reg> = (1..=code.num_args()).map(slot_reg).collect();
          let dst = self.push_slot();
          self.emit(L2Instr::CreateContinuation {
            caller: REG_CALLER,
            function: REG_FUNCTION,
            pc: 0,
            stackp: code.num_slots() + 1,
            slots,
            resume_offset: None,
            dst,
          });
          self.set_write(dst, Ty::continuation(code.func_ty().clone()));
        }
        L1Op::Call { bundle, expected } => {
          let after_pc = reader.pc();
          self.call_site(after_pc, bundle, expected, false)?;
        }
        L1Op::SuperCall { bundle, expected } => {
          let after_pc = reader.pc();
          self.call_site(after_pc, bundle, expected, true)?;
        }
      }
    }
    // Implicit return: the value on top of the stack goes to the caller.
    let value = slot_reg(self.stackp);
    self.emit(L2Instr::Return { caller: REG_CALLER, value });
    Ok(())
  }

  fn local_content_ty(&self, n: u32) -> Ty {
    let num_args = self.code.num_args();
    if n >= num_args {
      self.code.local_types()
        .get((n - num_args) as usize)
        .cloned()
        .unwrap_or_else(Ty::any)
    } else {
      Ty::any()
    }
  }

  /// Translate one call site, specializing where the reachable
  /// implementations allow it.
  fn call_site(&mut self, after_pc: u32, bundle: u32, expected: u32, by_types: bool)
      -> Result<(), Untranslatable> {
    let code = self.code.clone();
    let atom = code.literal(bundle).as_atom().ok_or(Untranslatable::BadCallSite)?.clone();
    let expected = code.literal(expected).as_ty().ok_or(Untranslatable::BadCallSite)?.clone();
    let arity = self.runtime
      .with_method(&atom, |m| m.map(|m| m.arity))
      .ok_or_else(|| Untranslatable::UndefinedMethod(atom.name().to_string()))?;

    // The dispatch types: popped type registers for a super-call, the
    // statically known argument types otherwise.
    let type_regs: Option<Vec<L2Reg>> = by_types.then(|| {
      let mut regs: Vec<L2Reg> = (0..arity).map(|_| self.pop_slot()).collect();
      regs.reverse();
      regs
    });
    let arg_regs: Vec<L2Reg> = {
      let mut regs: Vec<L2Reg> = (0..arity).map(|_| self.pop_slot()).collect();
      regs.reverse();
      regs
    };
    let arg_tys: Vec<Ty> = match &type_regs {
      Some(regs) => regs.iter()
        .map(|r| {
          self.register_constants.get(r)
            .and_then(|v| v.as_ty().cloned())
            .unwrap_or_else(Ty::any)
        })
        .collect(),
      None => arg_regs.iter().map(|&r| self.ty_of(r)).collect(),
    };

    // Whatever is decided below leans on the current definitions.
    if !self.contingents.contains(&atom) { self.contingents.push(atom.clone()) }

    let implementations = self.runtime
      .with_method(&atom, |m| m.map_or_else(Vec::new, |m| m.implementations_for(&arg_tys)));
    let monomorphic_prim: Option<(Value, PrimitiveId)> = match implementations.as_slice() {
      [] => None,
      [first, rest @ ..] => {
        first.as_function()
          .and_then(|f| f.code.primitive())
          .filter(|&p| {
            rest.iter().all(|other| {
              other.as_function().and_then(|f| f.code.primitive()) == Some(p)
            })
          })
          .map(|p| (first.clone(), p))
      }
    };

    let sentinel = self.push_slot();
    let sentinel_slot = self.stackp;
    let reify_pc = after_pc;
    let reify_stackp = self.stackp;

    if let Some((implementation, prim_id)) = monomorphic_prim {
      let prim = PrimitiveRegistry::shared().get(prim_id).expect("manifested");
      let site = CallSite { sentinel, sentinel_slot, reify_pc, reify_stackp };
      if self.specialize(prim_id, prim, &implementation, &arg_regs, &arg_tys, &expected,
          site) {
        return Ok(())
      }
    }

    // Full dynamic dispatch.
    let instr = match type_regs {
      Some(types) => L2Instr::SuperCallBundle {
        bundle: atom,
        args: arg_regs,
        types,
        expected: expected.clone(),
        sentinel_slot,
        reify_pc,
        reify_stackp,
      },
      None => L2Instr::CallBundle {
        bundle: atom,
        args: arg_regs,
        expected: expected.clone(),
        sentinel_slot,
        reify_pc,
        reify_stackp,
      },
    };
    self.emit(instr);
    self.set_write(sentinel, expected);
    Ok(())
  }

  /// Attempt the monomorphic-primitive specializations; true if the call
  /// was fully handled.
  #[allow(clippy::too_many_arguments)]
  fn specialize(
    &mut self,
    prim_id: PrimitiveId,
    prim: &dyn Primitive,
    implementation: &Value,
    arg_regs: &[L2Reg],
    arg_tys: &[Ty],
    expected: &Ty,
    site: CallSite,
  ) -> bool {
    let CallSite { sentinel, sentinel_slot, reify_pc, reify_stackp } = site;
    let flags = prim.flags();
    if flags.contains(PrimitiveFlags::SPECIAL_RETURN_CONSTANT) {
      let constant = implementation.as_function()
        .expect("implementation is a function")
        .code.literal(0).clone();
      self.emit(L2Instr::MoveConstant { value: constant.clone(), dst: sentinel });
      self.set_constant(sentinel, constant);
      return true
    }
    if flags.contains(PrimitiveFlags::SPECIAL_RETURN_SOLE_ARGUMENT) {
      let src = arg_regs[0];
      self.emit(L2Instr::Move { src, dst: sentinel });
      self.set_move(sentinel, src);
      return true
    }
    if flags.contains(PrimitiveFlags::SPECIAL_RETURN_GLOBAL_VALUE) {
      // The global variable is the implementation's first literal; read it
      // directly instead of attempting the primitive.
      let var = implementation.as_function()
        .expect("implementation is a function")
        .code.literal(0).clone();
      let content = var.as_variable()
        .map_or_else(Ty::any, |v| v.content_ty().clone());
      let holder = self.fresh_temp();
      self.emit(L2Instr::MoveConstant { value: var, dst: holder });
      self.emit(L2Instr::GetVariable { var: holder, dst: sentinel });
      self.set_write(sentinel, content.intersection(expected));
      return true
    }
    let constant_args: Option<Vec<Value>> = arg_regs.iter()
      .map(|r| self.register_constants.get(r).cloned())
      .collect();
    if flags.contains(PrimitiveFlags::CAN_FOLD) {
      if let Some(args) = constant_args {
        let mut scratch = Interpreter::new(self.runtime);
        if let PrimitiveResult::Success(v) =
            scratch.attempt_for_fold(prim, &args, implementation.clone()) {
          if v.is_instance_of(expected) {
            self.emit(L2Instr::MoveConstant { value: v.clone(), dst: sentinel });
            self.set_constant(sentinel, v);
            return true
          }
        }
      }
    }
    if !flags.contains(PrimitiveFlags::CAN_INLINE) { return false }
    let check = !prim.block_ty().return_ty().subtype_of(expected);
    match prim.fallibility(arg_tys) {
      Fallibility::MustFail => false,
      Fallibility::CannotFail => {
        self.emit(L2Instr::RunInfalliblePrimitive {
          prim: prim_id,
          args: arg_regs.to_vec(),
          check,
          expected: expected.clone(),
          dst: sentinel,
        });
        let result_ty = prim.block_ty().return_ty().intersection(expected);
        self.set_write(sentinel, result_ty);
        true
      }
      Fallibility::CanFail => {
        let failure = self.fresh_temp();
        let callee = self.fresh_temp();
        let here = self.instructions.len() as u32;
        self.emit(L2Instr::AttemptInlinePrimitive {
          prim: prim_id,
          args: arg_regs.to_vec(),
          check,
          expected: expected.clone(),
          dst: sentinel,
          failure_dst: failure,
          on_success: L2Pc(here + 3),
          on_failure: L2Pc(here + 1),
        });
        self.emit(L2Instr::MoveConstant {
          value: implementation.clone(),
          dst: callee,
        });
        self.emit(L2Instr::CallAfterFailedPrimitive {
          function: callee,
          args: arg_regs.to_vec(),
          failure,
          expected: expected.clone(),
          sentinel_slot,
          reify_pc,
          reify_stackp,
        });
        let result_ty = prim.block_ty().return_ty().intersection(expected);
        self.set_write(sentinel, result_ty);
        true
      }
    }
  }
}

/// The reification metadata of one translated call site.
struct CallSite {
  sentinel: L2Reg,
  sentinel_slot: u32,
  reify_pc: u32,
  reify_stackp: u32,
}

fn slot_reg(slot: u32) -> L2Reg { L2Reg(ARCH_FIXED + slot - 1) }
