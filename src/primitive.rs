//! The primitive framework: flags, fallibility, the attempt protocol, and
//! the lazily-populated registry.
//!
//! A primitive is named and numbered, declares its argument count and
//! block-type restriction, and is attempted before (or instead of) its
//! function's nybblecode body. The registry is populated from the manifest
//! below; instantiation is lazy, with a double-checked slot per number, so
//! readers either see a fully built primitive or take the slow path.

use once_cell::sync::{Lazy, OnceCell};

use crate::interpreter::Interpreter;
use crate::types::Idx;
use crate::types::code::PrimitiveId;
use crate::types::ty::Ty;
use crate::types::value::{ExtInt, Value, ValueKind};

bitflags::bitflags! {
  /// Static properties the translator and interpreter consult.
  #[derive(Clone, Copy, Debug, PartialEq, Eq)]
  pub struct PrimitiveFlags: u32 {
    /// Safe to evaluate at translation time on constant arguments.
    const CAN_FOLD = 1 << 0;
    /// Safe to attempt inline from an L2 chunk.
    const CAN_INLINE = 1 << 1;
    /// Has an effect beyond its return value.
    const HAS_SIDE_EFFECT = 1 << 2;
    /// May invoke other functions.
    const INVOKES = 1 << 3;
    /// May replace the current continuation.
    const SWITCHES_CONTINUATION = 1 << 4;
    /// Always returns the function's first literal.
    const SPECIAL_RETURN_CONSTANT = 1 << 5;
    /// Always returns its sole argument.
    const SPECIAL_RETURN_SOLE_ARGUMENT = 1 << 6;
    /// Always returns the value of the global variable in the function's
    /// first literal.
    const SPECIAL_RETURN_GLOBAL_VALUE = 1 << 7;
    /// Never fails, for any well-typed arguments.
    const CANNOT_FAIL = 1 << 8;
    /// Not exposed to user code.
    const PRIVATE = 1 << 9;
    /// Needed during bootstrap, before the method machinery is complete.
    const BOOTSTRAP = 1 << 10;
    /// Participates in exception dispatch.
    const CATCH_EXCEPTION = 1 << 11;
    /// The failure variable must survive the fallback body's frame setup.
    const PRESERVE_FAILURE_VARIABLE = 1 << 12;
    /// The arguments must survive into the fallback body.
    const PRESERVE_ARGUMENTS = 1 << 13;
    /// Behaviour not otherwise classified; never folded or inlined.
    const UNKNOWN = 1 << 14;
  }
}

/// What a primitive can do for specific argument types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fallibility {
  /// Failure is guaranteed; the fallback body always runs.
  MustFail,
  /// Failure is possible.
  CanFail,
  /// Success is guaranteed.
  CannotFail,
}

/// The outcome of one attempt.
#[derive(Debug)]
pub enum PrimitiveResult {
  /// The primitive produced a value.
  Success(Value),
  /// The primitive failed with a failure code for the fallback body.
  Failure(Value),
  /// The interpreter's continuation was replaced; no value is produced
  /// here.
  ContinuationChanged,
  /// The running fiber must be parked; the scheduler takes over.
  FiberSuspended,
}

/// Failure codes stored into primitive failure variables.
pub mod error_code {
  /// Addition of unlike infinities.
  pub const UNLIKE_INFINITIES: i64 = 1;
  /// Multiplication of zero and an infinity.
  pub const ZERO_TIMES_INFINITY: i64 = 2;
  /// Division by zero, or an undefined infinite quotient.
  pub const DIVIDE_BY_ZERO: i64 = 3;
  /// A tuple subscript out of bounds.
  pub const SUBSCRIPT_OUT_OF_BOUNDS: i64 = 4;
  /// A read of an unassigned variable.
  pub const UNASSIGNED_VARIABLE: i64 = 5;
  /// A write of an incorrectly typed value.
  pub const WRONG_VARIABLE_TYPE: i64 = 6;
}

/// A primitive operation. Implementations are stateless; one instance is
/// leaked per registry slot.
pub trait Primitive: Send + Sync {
  /// The stable name, as listed in the manifest.
  fn name(&self) -> &'static str;

  /// How many arguments `attempt` expects.
  fn arg_count(&self) -> u32;

  /// The static property flags.
  fn flags(&self) -> PrimitiveFlags;

  /// The block-type restriction: functions carrying this primitive must
  /// have a type at least this specific.
  fn block_ty(&self) -> Ty;

  /// The content type of the failure variable in fallback bodies.
  fn failure_variable_ty(&self) -> Ty { Ty::whole_numbers() }

  /// Refine fallibility from the static argument types. The default
  /// answers from the flags alone.
  fn fallibility(&self, arg_tys: &[Ty]) -> Fallibility {
    let _ = arg_tys;
    if self.flags().contains(PrimitiveFlags::CANNOT_FAIL) {
      Fallibility::CannotFail
    } else {
      Fallibility::CanFail
    }
  }

  /// Attempt the primitive on evaluated arguments.
  fn attempt(&self, args: &[Value], interp: &mut Interpreter<'_>, skip_return_check: bool)
    -> PrimitiveResult;
}

macro_rules! primitive_manifest {
  {$($(#[$attr:meta])* $ty:ident: $name:literal,)*} => {
    /// One entry per primitive: the stable name and its lazy constructor.
    static MANIFEST: &[(&str, fn() -> &'static dyn Primitive)] = &[
      $(($name, || Box::leak(Box::new($ty)) as &'static dyn Primitive)),*
    ];
  }
}

primitive_manifest! {
  /// `1`: extended-integer addition.
  AddIntegers: "_+_",
  /// `2`: extended-integer subtraction.
  SubtractIntegers: "_-_",
  /// `3`: extended-integer multiplication.
  MultiplyIntegers: "_\u{00d7}_",
  /// `4`: floored extended-integer division.
  DivideIntegers: "_\u{00f7}_",
  /// `5`: extended-integer ordering.
  LessOrEqual: "_\u{2264}_",
  /// `6`: value equality.
  ValueEquals: "_=_",
  /// `7`: the size of a tuple.
  TupleSize: "|_|",
  /// `8`: tuple subscripting.
  TupleAt: "_[_]",
  /// `9`: the exact type of a value.
  TypeOfValue: "type of_",
  /// `10`: read a variable.
  ReadVariable: "read_",
  /// `11`: write a variable.
  WriteVariable: "_:=_",
  /// `12`: return the function's first literal.
  PushConstant: "push constant",
  /// `13`: return the sole argument.
  IdentityFunction: "identity",
  /// `14`: return the global variable's value.
  GlobalValue: "global value",
  /// `15`: park the running fiber until resumed.
  ParkFiber: "park current fiber",
}

/// The process-wide registry: numbers to names eagerly, instances lazily.
pub struct PrimitiveRegistry {
  slots: Box<[OnceCell<&'static dyn Primitive>]>,
}

static REGISTRY: Lazy<PrimitiveRegistry> = Lazy::new(|| PrimitiveRegistry {
  slots: (0..MANIFEST.len()).map(|_| OnceCell::new()).collect(),
});

impl PrimitiveRegistry {
  /// The shared registry.
  #[must_use] pub fn shared() -> &'static Self { &REGISTRY }

  /// The number of manifested primitives. Numbers run `1..=count`.
  #[must_use] pub fn count() -> u32 { MANIFEST.len() as u32 }

  /// Look up a primitive by number, instantiating it on first use.
  #[must_use] pub fn get(&self, id: PrimitiveId) -> Option<&'static dyn Primitive> {
    let index = (id.into_usize()).checked_sub(1)?;
    let (name, make) = *MANIFEST.get(index)?;
    Some(*self.slots[index].get_or_init(|| {
      let prim = make();
      debug_assert_eq!(prim.name(), name, "manifest order mismatch");
      let flags = prim.flags();
      assert!(
        !flags.contains(PrimitiveFlags::CAN_FOLD)
          || flags.contains(PrimitiveFlags::CAN_INLINE),
        "foldable primitive {name} must be inlineable"
      );
      prim
    }))
  }

  /// The number for a manifest name.
  #[must_use] pub fn number_of(&self, name: &str) -> Option<PrimitiveId> {
    MANIFEST.iter().position(|&(n, _)| n == name)
      .map(|i| PrimitiveId(i as u32 + 1))
  }

  /// The name for a number, without instantiating.
  #[must_use] pub fn name_of(&self, id: PrimitiveId) -> Option<&'static str> {
    MANIFEST.get(id.into_usize().checked_sub(1)?).map(|&(n, _)| n)
  }
}

fn success(v: Value) -> PrimitiveResult { PrimitiveResult::Success(v) }
fn failure(code: i64) -> PrimitiveResult { PrimitiveResult::Failure(Value::int(code)) }

fn ext_int_arg(args: &[Value], i: usize) -> &ExtInt {
  args[i].as_ext_int().expect("block type admits only extended integers")
}

/// Whether every argument type is a finite integer range.
fn all_finite(arg_tys: &[Ty]) -> bool {
  arg_tys.iter().all(|t| t.subtype_of(&Ty::integers()))
}

struct AddIntegers;
impl Primitive for AddIntegers {
  fn name(&self) -> &'static str { "_+_" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::extended_integers(), Ty::extended_integers()],
      Ty::extended_integers())
  }
  fn fallibility(&self, arg_tys: &[Ty]) -> Fallibility {
    if all_finite(arg_tys) { Fallibility::CannotFail } else { Fallibility::CanFail }
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    match ext_int_arg(args, 0).checked_add(ext_int_arg(args, 1)) {
      Some(n) => success(Value::ext_int(n)),
      None => failure(error_code::UNLIKE_INFINITIES),
    }
  }
}

struct SubtractIntegers;
impl Primitive for SubtractIntegers {
  fn name(&self) -> &'static str { "_-_" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::extended_integers(), Ty::extended_integers()],
      Ty::extended_integers())
  }
  fn fallibility(&self, arg_tys: &[Ty]) -> Fallibility {
    if all_finite(arg_tys) { Fallibility::CannotFail } else { Fallibility::CanFail }
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    match ext_int_arg(args, 0).checked_sub(ext_int_arg(args, 1)) {
      Some(n) => success(Value::ext_int(n)),
      None => failure(error_code::UNLIKE_INFINITIES),
    }
  }
}

struct MultiplyIntegers;
impl Primitive for MultiplyIntegers {
  fn name(&self) -> &'static str { "_\u{00d7}_" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::extended_integers(), Ty::extended_integers()],
      Ty::extended_integers())
  }
  fn fallibility(&self, arg_tys: &[Ty]) -> Fallibility {
    if all_finite(arg_tys) { Fallibility::CannotFail } else { Fallibility::CanFail }
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    match ext_int_arg(args, 0).checked_mul(ext_int_arg(args, 1)) {
      Some(n) => success(Value::ext_int(n)),
      None => failure(error_code::ZERO_TIMES_INFINITY),
    }
  }
}

struct DivideIntegers;
impl Primitive for DivideIntegers {
  fn name(&self) -> &'static str { "_\u{00f7}_" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::extended_integers(), Ty::extended_integers()],
      Ty::extended_integers())
  }
  fn fallibility(&self, arg_tys: &[Ty]) -> Fallibility {
    let divisor_excludes_zero = arg_tys.get(1).is_some_and(|t| {
      !t.has_instance(&Value::int(0))
    });
    if arg_tys.get(1).is_some_and(|t| t.subtype_of(&Ty::int_exact(0))) {
      Fallibility::MustFail
    } else if all_finite(arg_tys) && divisor_excludes_zero {
      Fallibility::CannotFail
    } else {
      Fallibility::CanFail
    }
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    match ext_int_arg(args, 0).checked_div_floor(ext_int_arg(args, 1)) {
      Some(n) => success(Value::ext_int(n)),
      None => failure(error_code::DIVIDE_BY_ZERO),
    }
  }
}

struct LessOrEqual;
impl Primitive for LessOrEqual {
  fn name(&self) -> &'static str { "_\u{2264}_" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE | PrimitiveFlags::CANNOT_FAIL
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::extended_integers(), Ty::extended_integers()], Ty::boolean())
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    success(Value::boolean(ext_int_arg(args, 0) <= ext_int_arg(args, 1)))
  }
}

struct ValueEquals;
impl Primitive for ValueEquals {
  fn name(&self) -> &'static str { "_=_" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE | PrimitiveFlags::CANNOT_FAIL
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::any(), Ty::any()], Ty::boolean())
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    success(Value::boolean(args[0] == args[1]))
  }
}

struct TupleSize;
impl Primitive for TupleSize {
  fn name(&self) -> &'static str { "|_|" }
  fn arg_count(&self) -> u32 { 1 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE | PrimitiveFlags::CANNOT_FAIL
  }
  fn block_ty(&self) -> Ty {
    Ty::function(
      vec![Ty::tuple_of(vec![], Ty::any(),
        crate::types::ty::IntRange::new(ExtInt::zero(), true, ExtInt::PosInf, false)
          .expect("nonempty"))],
      Ty::whole_numbers())
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    let t = args[0].as_tuple().expect("block type admits only tuples");
    success(Value::int(t.len()))
  }
}

struct TupleAt;
impl Primitive for TupleAt {
  fn name(&self) -> &'static str { "_[_]" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE
  }
  fn block_ty(&self) -> Ty {
    Ty::function(
      vec![
        Ty::tuple_of(vec![], Ty::any(),
          crate::types::ty::IntRange::new(ExtInt::zero(), true, ExtInt::PosInf, false)
            .expect("nonempty")),
        Ty::int_range(ExtInt::Fin(1.into()), true, ExtInt::PosInf, false),
      ],
      Ty::any())
  }
  fn fallibility(&self, arg_tys: &[Ty]) -> Fallibility {
    if let (Some(tuple), Some(index)) = (
      arg_tys.first().and_then(Ty::as_tuple_ty),
      arg_tys.get(1).and_then(Ty::as_int_range),
    ) {
      let (min_size, min_in) = tuple.sizes.lower();
      if min_in {
        if let (ExtInt::Fin(min_size), (ExtInt::Fin(hi), true)) =
          (min_size, index.upper()) {
          if hi <= min_size && index.lower().0 >= &ExtInt::Fin(1.into()) {
            return Fallibility::CannotFail
          }
        }
      }
    }
    Fallibility::CanFail
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    let index = args[1].as_int()
      .and_then(|n| usize::try_from(n).ok())
      .unwrap_or(0);
    match args[0].tuple_at(index) {
      Some(v) => success(v),
      None => failure(error_code::SUBSCRIPT_OUT_OF_BOUNDS),
    }
  }
}

struct TypeOfValue;
impl Primitive for TypeOfValue {
  fn name(&self) -> &'static str { "type of_" }
  fn arg_count(&self) -> u32 { 1 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE | PrimitiveFlags::CANNOT_FAIL
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::any()], Ty::meta(Ty::any()))
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    success(Value::new(ValueKind::Ty(args[0].instance_ty())))
  }
}

struct ReadVariable;
impl Primitive for ReadVariable {
  fn name(&self) -> &'static str { "read_" }
  fn arg_count(&self) -> u32 { 1 }
  fn flags(&self) -> PrimitiveFlags { PrimitiveFlags::CAN_INLINE }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::variable_rw(Ty::any(), Ty::bottom())], Ty::any())
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    let var = args[0].as_variable().expect("block type admits only variables");
    match var.read() {
      Ok(v) => success(v),
      Err(_) => failure(error_code::UNASSIGNED_VARIABLE),
    }
  }
}

struct WriteVariable;
impl Primitive for WriteVariable {
  fn name(&self) -> &'static str { "_:=_" }
  fn arg_count(&self) -> u32 { 2 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::CAN_INLINE | PrimitiveFlags::HAS_SIDE_EFFECT
  }
  fn block_ty(&self) -> Ty {
    Ty::function(vec![Ty::variable_rw(Ty::any(), Ty::bottom()), Ty::any()],
      Ty::fixed_tuple(vec![]))
  }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    let var = args[0].as_variable().expect("block type admits only variables");
    match var.write(args[1].clone()) {
      Ok(()) => success(Value::tuple([])),
      Err(_) => failure(error_code::WRONG_VARIABLE_TYPE),
    }
  }
}

struct PushConstant;
impl Primitive for PushConstant {
  fn name(&self) -> &'static str { "push constant" }
  fn arg_count(&self) -> u32 { 0 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::SPECIAL_RETURN_CONSTANT | PrimitiveFlags::CANNOT_FAIL
      | PrimitiveFlags::CAN_INLINE | PrimitiveFlags::PRIVATE
  }
  fn block_ty(&self) -> Ty { Ty::function(vec![], Ty::any()) }
  fn attempt(&self, _: &[Value], interp: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    let function = interp.primitive_function().expect("attempted with a function");
    success(function.as_function().expect("function value").code.literal(0).clone())
  }
}

struct IdentityFunction;
impl Primitive for IdentityFunction {
  fn name(&self) -> &'static str { "identity" }
  fn arg_count(&self) -> u32 { 1 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::SPECIAL_RETURN_SOLE_ARGUMENT | PrimitiveFlags::CANNOT_FAIL
      | PrimitiveFlags::CAN_FOLD | PrimitiveFlags::CAN_INLINE
  }
  fn block_ty(&self) -> Ty { Ty::function(vec![Ty::any()], Ty::any()) }
  fn attempt(&self, args: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    success(args[0].clone())
  }
}

struct GlobalValue;
impl Primitive for GlobalValue {
  fn name(&self) -> &'static str { "global value" }
  fn arg_count(&self) -> u32 { 0 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::SPECIAL_RETURN_GLOBAL_VALUE | PrimitiveFlags::CAN_INLINE
      | PrimitiveFlags::PRIVATE
  }
  fn block_ty(&self) -> Ty { Ty::function(vec![], Ty::any()) }
  fn attempt(&self, _: &[Value], interp: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    let function = interp.primitive_function().expect("attempted with a function");
    let var = function.as_function().expect("function value").code.literal(0).clone();
    let var = var.as_variable().expect("first literal is the module variable");
    match var.read() {
      Ok(v) => success(v),
      Err(_) => failure(error_code::UNASSIGNED_VARIABLE),
    }
  }
}

struct ParkFiber;
impl Primitive for ParkFiber {
  fn name(&self) -> &'static str { "park current fiber" }
  fn arg_count(&self) -> u32 { 0 }
  fn flags(&self) -> PrimitiveFlags {
    PrimitiveFlags::HAS_SIDE_EFFECT | PrimitiveFlags::CANNOT_FAIL | PrimitiveFlags::UNKNOWN
  }
  fn block_ty(&self) -> Ty { Ty::function(vec![], Ty::any()) }
  fn attempt(&self, _: &[Value], _: &mut Interpreter<'_>, _: bool) -> PrimitiveResult {
    PrimitiveResult::FiberSuspended
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn registry() -> &'static PrimitiveRegistry { PrimitiveRegistry::shared() }

  #[test]
  fn numbers_and_names_agree() {
    for n in 1..=PrimitiveRegistry::count() {
      let id = PrimitiveId(n);
      let name = registry().name_of(id).expect("manifested");
      assert_eq!(registry().number_of(name), Some(id));
      assert_eq!(registry().get(id).expect("instantiates").name(), name);
    }
    assert!(registry().get(PrimitiveId(0)).is_none());
    assert!(registry().get(PrimitiveId(PrimitiveRegistry::count() + 1)).is_none());
  }

  #[test]
  fn foldable_implies_inlineable() {
    for n in 1..=PrimitiveRegistry::count() {
      let prim = registry().get(PrimitiveId(n)).expect("instantiates");
      if prim.flags().contains(PrimitiveFlags::CAN_FOLD) {
        assert!(prim.flags().contains(PrimitiveFlags::CAN_INLINE), "{}", prim.name());
      }
    }
  }

  #[test]
  fn divide_fallibility_narrows_with_types() {
    let divide = registry().get(registry().number_of("_\u{00f7}_").expect("manifested"))
      .expect("instantiates");
    assert_eq!(
      divide.fallibility(&[Ty::integers(), Ty::int_exact(3)]),
      Fallibility::CannotFail);
    assert_eq!(
      divide.fallibility(&[Ty::integers(), Ty::integers()]),
      Fallibility::CanFail);
    assert_eq!(
      divide.fallibility(&[Ty::integers(), Ty::int_exact(0)]),
      Fallibility::MustFail);
  }

  #[test]
  fn tuple_at_fallibility_uses_size_bounds() {
    let at = registry().get(registry().number_of("_[_]").expect("manifested"))
      .expect("instantiates");
    let triple = Ty::fixed_tuple(vec![Ty::any(), Ty::any(), Ty::any()]);
    assert_eq!(
      at.fallibility(&[triple.clone(),
        Ty::int_range(ExtInt::Fin(1.into()), true, ExtInt::Fin(3.into()), true)]),
      Fallibility::CannotFail);
    assert_eq!(
      at.fallibility(&[triple,
        Ty::int_range(ExtInt::Fin(1.into()), true, ExtInt::Fin(4.into()), true)]),
      Fallibility::CanFail);
  }
}
