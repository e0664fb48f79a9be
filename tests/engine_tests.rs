//! End-to-end scenarios over the two-tier engine: warm-up and
//! reoptimisation, constant folding, chunk invalidation, primitive
//! failure fallbacks, suspension, and the unboxed division edges.

use std::sync::Arc;
use std::time::{Duration, Instant};

use availrt::primitive::PrimitiveRegistry;
use availrt::runtime::{Definition, Runtime};
use availrt::types::code::{L1Op, RawFunction};
use availrt::types::l2::{Chunk, ChunkId, L2Instr, L2IntReg, L2Pc, L2Reg, REG_CALLER};
use availrt::types::ty::Ty;
use availrt::types::value::{Atom, ExecState, ExceptionKind, Value, ValueKind};

/// A runtime for one test, with engine tracing captured by the test
/// harness.
fn new_runtime(executors: usize) -> Arc<Runtime> {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
  Runtime::new(executors)
}

fn ty_literal(ty: Ty) -> Value { Value::new(ValueKind::Ty(ty)) }

/// A two-argument primitive method implementation: the primitive, plus a
/// fallback body that returns the marker literal.
fn primitive_impl(name: &str, prim_name: &str, fallback: Value) -> Arc<RawFunction> {
  let prim = PrimitiveRegistry::shared().number_of(prim_name).expect("manifested");
  let block_ty = PrimitiveRegistry::shared()
    .get(prim).expect("instantiates")
    .block_ty();
  RawFunction::assemble(
    name,
    &[L1Op::PushLiteral(0)],
    vec![fallback],
    2,
    vec![Ty::whole_numbers()],
    1,
    block_ty,
    Some(prim),
  )
}

fn define_arithmetic(runtime: &Runtime) -> (Atom, Atom, Atom) {
  let plus = Atom::fresh("_+_");
  let times = Atom::fresh("_\u{00d7}_");
  let divide = Atom::fresh("_\u{00f7}_");
  runtime.define_method(&plus,
    Definition::Method(primitive_impl("plus", "_+_", Value::int(-999)).into_function(vec![])))
    .expect("defines");
  runtime.define_method(&times,
    Definition::Method(primitive_impl("times", "_\u{00d7}_", Value::int(-999))
      .into_function(vec![])))
    .expect("defines");
  runtime.define_method(&divide,
    Definition::Method(primitive_impl("divide", "_\u{00f7}_", Value::int(-999))
      .into_function(vec![])))
    .expect("defines");
  (plus, times, divide)
}

/// `f() = 2 + 3 × 4` over the arithmetic methods.
fn arith_function(plus: &Atom, times: &Atom) -> Arc<RawFunction> {
  let ext = Ty::extended_integers();
  RawFunction::assemble(
    "f",
    &[
      L1Op::PushLiteral(0),
      L1Op::PushLiteral(1),
      L1Op::PushLiteral(2),
      L1Op::Call { bundle: 3, expected: 4 },
      L1Op::Call { bundle: 5, expected: 6 },
    ],
    vec![
      Value::int(2),
      Value::int(3),
      Value::int(4),
      Value::new(ValueKind::Atom(times.clone())),
      ty_literal(ext.clone()),
      Value::new(ValueKind::Atom(plus.clone())),
      ty_literal(ext),
    ],
    0,
    vec![],
    3,
    Ty::function(vec![], Ty::extended_integers()),
    None,
  )
}

#[test]
fn arithmetic_folds_to_a_single_constant_after_reoptimisation() {
  let runtime = new_runtime(2);
  let (plus, times, _) = define_arithmetic(&runtime);
  let f = arith_function(&plus, &times);
  // Warm through the level-0 translation and the level-1 reoptimisation;
  // the observable result never changes.
  for _ in 0..25 {
    let outcome = runtime.run_code(&f, vec![]).expect("f() succeeds");
    assert_eq!(outcome, Value::int(14));
  }
  let chunk_id = f.starting_chunk();
  assert_ne!(chunk_id, ChunkId::DEFAULT, "f stayed cold");
  let chunk = runtime.chunk(chunk_id);
  assert_eq!(chunk.opt_level, 1, "second translation runs the optimiser");
  assert_eq!(chunk.instructions.len(), 2, "{chunk:?}");
  assert!(
    matches!(&chunk.instructions[0],
      L2Instr::MoveConstant { value, .. } if *value == Value::int(14)),
    "{chunk:?}");
  assert!(matches!(&chunk.instructions[1], L2Instr::Return { .. }), "{chunk:?}");
  runtime.shutdown();
}

#[test]
fn primitive_failure_runs_the_fallback_body() {
  let runtime = new_runtime(1);
  let (_, _, divide) = define_arithmetic(&runtime);
  // g() = 1 ÷ 0: the division primitive fails, so its fallback body runs
  // and produces the marker value.
  let g = RawFunction::assemble(
    "g",
    &[
      L1Op::PushLiteral(0),
      L1Op::PushLiteral(1),
      L1Op::Call { bundle: 2, expected: 3 },
    ],
    vec![
      Value::int(1),
      Value::int(0),
      Value::new(ValueKind::Atom(divide.clone())),
      ty_literal(Ty::extended_integers()),
    ],
    0,
    vec![],
    2,
    Ty::function(vec![], Ty::extended_integers()),
    None,
  );
  for _ in 0..25 {
    let outcome = runtime.run_code(&g, vec![]).expect("fallback produces a value");
    assert_eq!(outcome, Value::int(-999));
  }
  runtime.shutdown();
}

#[test]
fn push_last_local_clears_the_slot() {
  let runtime = new_runtime(1);
  // f(x): push x as a last use, discard it, then observe the slot again.
  let f = RawFunction::assemble(
    "last-use",
    &[L1Op::PushLastLocal(0), L1Op::Pop, L1Op::PushLocal(0)],
    vec![],
    1,
    vec![],
    1,
    Ty::function(vec![Ty::integers()], Ty::any()),
    None,
  );
  let outcome = runtime.run_code(&f, vec![Value::int(17)]).expect("runs");
  assert!(outcome.is_nil(), "the pre-push value leaked: {outcome:?}");
  runtime.shutdown();
}

#[test]
fn invalid_returns_invoke_the_handler_and_kill_the_fiber() {
  let runtime = new_runtime(1);
  let m = Atom::fresh("liar");
  let lying = RawFunction::assemble(
    "lying",
    &[L1Op::PushLiteral(0)],
    vec![Value::string("oops")],
    0,
    vec![],
    1,
    Ty::function(vec![], Ty::any()),
    None,
  );
  runtime.define_method(&m, Definition::Method(lying.into_function(vec![])))
    .expect("defines");
  let caller = RawFunction::assemble(
    "caller",
    &[L1Op::Call { bundle: 0, expected: 1 }],
    vec![Value::new(ValueKind::Atom(m)), ty_literal(Ty::integers())],
    0,
    vec![],
    1,
    Ty::function(vec![], Ty::any()),
    None,
  );
  let seen = Arc::new(parking_lot::Mutex::new(None));
  let record = seen.clone();
  runtime.set_invalid_result_handler(Some(Arc::new(move |_, expected, actual| {
    *record.lock() = Some((expected.clone(), actual.clone()));
  })));
  let outcome = runtime.run_code(&caller, vec![]);
  let err = outcome.expect_err("a string is not an integer");
  assert_eq!(err.kind, ExceptionKind::InvalidResult);
  let (expected, actual) = seen.lock().clone().expect("handler ran");
  assert_eq!(expected, Ty::integers());
  assert_eq!(actual, Value::string("oops"));
  runtime.shutdown();
}

#[test]
fn redefinition_invalidates_the_contingent_chunk() {
  let runtime = new_runtime(1);
  let m = Atom::fresh("m");
  runtime.define_method(&m,
    Definition::Method(primitive_impl("m-plus", "_+_", Value::int(-999))
      .into_function(vec![])))
    .expect("defines");
  // g() = m(7, 3); the sole implementation is the addition primitive, so
  // the warm chunk inlines (indeed folds) through m.
  let g = RawFunction::assemble(
    "g",
    &[
      L1Op::PushLiteral(0),
      L1Op::PushLiteral(1),
      L1Op::Call { bundle: 2, expected: 3 },
    ],
    vec![
      Value::int(7),
      Value::int(3),
      Value::new(ValueKind::Atom(m.clone())),
      ty_literal(Ty::extended_integers()),
    ],
    0,
    vec![],
    2,
    Ty::function(vec![], Ty::extended_integers()),
    None,
  );
  for _ in 0..12 {
    assert_eq!(runtime.run_code(&g, vec![]).expect("g() succeeds"), Value::int(10));
  }
  let chunk_id = g.starting_chunk();
  assert_ne!(chunk_id, ChunkId::DEFAULT);
  let chunk = runtime.chunk(chunk_id);
  assert!(chunk.is_valid());
  // Replace the sole implementation of m; the chunk's inlining decision
  // is stale, so it must not be entered again.
  runtime.define_method(&m,
    Definition::Method(primitive_impl("m-minus", "_-_", Value::int(-999))
      .into_function(vec![])))
    .expect("redefines");
  assert!(!chunk.is_valid(), "the contingent chunk survived redefinition");
  assert_eq!(g.starting_chunk(), ChunkId::DEFAULT);
  assert_eq!(runtime.run_code(&g, vec![]).expect("g() succeeds"), Value::int(4));
  runtime.shutdown();
}

#[test]
fn suspended_fibers_resume_with_the_delivered_value() {
  let runtime = new_runtime(2);
  let park = Atom::fresh("park");
  let park_impl = RawFunction::assemble(
    "park-impl",
    &[L1Op::PushLiteral(0)],
    vec![Value::int(0)],
    0,
    vec![],
    1,
    Ty::function(vec![], Ty::any()),
    PrimitiveRegistry::shared().number_of("park current fiber"),
  );
  runtime.define_method(&park, Definition::Method(park_impl.into_function(vec![])))
    .expect("defines");
  let h = RawFunction::assemble(
    "h",
    &[L1Op::Call { bundle: 0, expected: 1 }],
    vec![Value::new(ValueKind::Atom(park)), ty_literal(Ty::any())],
    0,
    vec![],
    1,
    Ty::function(vec![], Ty::any()),
    None,
  );
  let fiber = runtime.fork("parker", h.into_function(vec![]), vec![], 128);
  let deadline = Instant::now() + Duration::from_secs(5);
  while fiber.exec_state() != ExecState::Suspended {
    assert!(Instant::now() < deadline, "fiber never suspended");
    std::thread::sleep(Duration::from_millis(1));
  }
  runtime.resume(&fiber, Value::string("resumed"));
  let outcome = fiber.await_outcome().expect("terminates normally");
  assert_eq!(outcome, Value::string("resumed"));
  runtime.shutdown();
}

#[test]
fn cancellation_arrives_at_the_first_safe_point() {
  let runtime = new_runtime(1);
  let f = RawFunction::assemble(
    "cancelled",
    &[L1Op::PushLiteral(0)],
    vec![Value::int(1)],
    0,
    vec![],
    1,
    Ty::function(vec![], Ty::any()),
    None,
  );
  let fiber = runtime.fork("doomed", f.into_function(vec![]), vec![], 128);
  runtime.cancel(&fiber);
  match fiber.await_outcome() {
    Err(ex) => assert_eq!(ex.kind, ExceptionKind::Cancelled),
    Ok(v) => {
      // The executor may have won the race and finished the tiny body
      // before the request landed; that is a legal schedule.
      assert_eq!(v, Value::int(1));
    }
  }
  runtime.shutdown();
}

#[test]
fn super_calls_dispatch_on_the_supplied_types() {
  let runtime = new_runtime(1);
  let describe = Atom::fresh("describe");
  let for_ints = RawFunction::assemble(
    "describe-int",
    &[L1Op::PushLiteral(0)],
    vec![Value::int(1)],
    1,
    vec![],
    1,
    Ty::function(vec![Ty::integers()], Ty::integers()),
    None,
  );
  let for_any = RawFunction::assemble(
    "describe-any",
    &[L1Op::PushLiteral(0)],
    vec![Value::int(2)],
    1,
    vec![],
    1,
    Ty::function(vec![Ty::any()], Ty::integers()),
    None,
  );
  runtime.define_method(&describe, Definition::Method(for_ints.into_function(vec![])))
    .expect("defines");
  runtime.define_method(&describe, Definition::Method(for_any.into_function(vec![])))
    .expect("defines");
  let literals = vec![
    Value::int(5),
    ty_literal(Ty::any()),
    Value::new(ValueKind::Atom(describe)),
    ty_literal(Ty::integers()),
  ];
  let by_value = RawFunction::assemble(
    "by-value",
    &[L1Op::PushLiteral(0), L1Op::Call { bundle: 2, expected: 3 }],
    literals.clone(),
    0,
    vec![],
    2,
    Ty::function(vec![], Ty::integers()),
    None,
  );
  // The super-call pushes the argument, then the dispatch type, and pops
  // types before values.
  let by_type = RawFunction::assemble(
    "by-type",
    &[
      L1Op::PushLiteral(0),
      L1Op::PushLiteral(1),
      L1Op::SuperCall { bundle: 2, expected: 3 },
    ],
    literals,
    0,
    vec![],
    2,
    Ty::function(vec![], Ty::integers()),
    None,
  );
  assert_eq!(runtime.run_code(&by_value, vec![]).expect("dispatches"), Value::int(1));
  assert_eq!(runtime.run_code(&by_type, vec![]).expect("dispatches"), Value::int(2));
  runtime.shutdown();
}

/// Drive a hand-built chunk holding the unboxed division.
fn run_division(runtime: &Runtime, dividend: i64, divisor: i64) -> Value {
  let code = RawFunction::assemble(
    "division-host",
    &[L1Op::PushLiteral(0)],
    vec![Value::int(0)],
    0,
    vec![],
    1,
    Ty::function(vec![], Ty::any()),
    None,
  );
  let t = |n: u32| L2Reg(3 + n);
  let instructions = vec![
    L2Instr::MoveIntConstant { value: dividend, dst: L2IntReg(0) },
    L2Instr::MoveIntConstant { value: divisor, dst: L2IntReg(1) },
    L2Instr::DivideIntByInt {
      dividend: L2IntReg(0),
      divisor: L2IntReg(1),
      quotient: L2IntReg(2),
      remainder: L2IntReg(3),
      on_out_of_range: L2Pc(7),
      on_zero_divisor: L2Pc(9),
      on_ok: L2Pc(3),
    },
    L2Instr::BoxInt { src: L2IntReg(2), dst: t(0) },
    L2Instr::BoxInt { src: L2IntReg(3), dst: t(1) },
    L2Instr::CreateTuple { elements: vec![t(0), t(1)], dst: t(2) },
    L2Instr::Return { caller: REG_CALLER, value: t(2) },
    L2Instr::MoveConstant { value: Value::string("out of range"), dst: t(2) },
    L2Instr::Return { caller: REG_CALLER, value: t(2) },
    L2Instr::MoveConstant { value: Value::string("zero divisor"), dst: t(2) },
    L2Instr::Return { caller: REG_CALLER, value: t(2) },
  ];
  let chunk = Chunk::new(Some(code.clone()), instructions, vec![], 1, 6, 4);
  let id = runtime.install_chunk(chunk);
  code.set_starting_chunk(id);
  runtime.run_code(&code, vec![]).expect("chunk completes")
}

#[test]
fn division_rounds_toward_negative_infinity_with_nonnegative_remainder() {
  let runtime = new_runtime(1);
  assert_eq!(
    run_division(&runtime, -7, 3),
    Value::tuple([Value::int(-3), Value::int(2)]));
  assert_eq!(run_division(&runtime, 7, 3), Value::tuple([Value::int(2), Value::int(1)]));
  assert_eq!(run_division(&runtime, -7, 0), Value::string("zero divisor"));
  assert_eq!(run_division(&runtime, i64::MIN, -1), Value::string("out of range"));
  runtime.shutdown();
}
