//! The type lattice: subtype, union, intersection, and instance tests.
//!
//! Types are immutable handles like values. The operations are total, and
//! the lattice laws (reflexivity, transitivity, antisymmetry of mutual
//! subtyping, commutative/associative/idempotent union and intersection,
//! metacovariance, metainvariance) are enforced by canonicalizing in the
//! constructors: an enumeration never holds a contiguous all-integer
//! instance set (that is an integer range), never holds types (those fold
//! into an instance meta), and never is empty (that is ⊥); a tuple type
//! never carries element types past an impossible index.

use std::fmt;
use std::sync::Arc;

use num::BigInt;

use crate::types::value::{ExtInt, Value, ValueKind};

/// The structureless kinds: pairwise disjoint, directly below ⊤.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SimpleKind {
  /// All characters.
  Character,
  /// All strings.
  Str,
  /// All atoms.
  Atom,
  /// All tokens.
  Token,
  /// All parse phrases.
  Phrase,
  /// All raw functions.
  CompiledCode,
  /// All foreign host objects.
  Pojo,
}

/// An extended-integer interval. Finite bounds are stored inclusive; an
/// infinite bound's flag records whether the infinity itself is a member.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct IntRange {
  lo: ExtInt,
  lo_in: bool,
  hi: ExtInt,
  hi_in: bool,
}

impl IntRange {
  /// Construct a range, normalizing finite exclusive bounds to inclusive.
  /// Returns `None` if the interval is empty.
  #[must_use] pub fn new(mut lo: ExtInt, mut lo_in: bool, mut hi: ExtInt, mut hi_in: bool)
      -> Option<Self> {
    if let ExtInt::Fin(n) = &lo {
      if !lo_in { lo = ExtInt::Fin(n + 1); lo_in = true }
    }
    if let ExtInt::Fin(n) = &hi {
      if !hi_in { hi = ExtInt::Fin(n - 1); hi_in = true }
    }
    match lo.cmp(&hi) {
      std::cmp::Ordering::Greater => None,
      std::cmp::Ordering::Equal if !(lo_in && hi_in) => None,
      _ => Some(Self { lo, lo_in, hi, hi_in }),
    }
  }

  /// The range holding exactly `n`.
  #[must_use] pub fn exact(n: ExtInt) -> Self {
    Self { lo: n.clone(), lo_in: true, hi: n, hi_in: true }
  }

  /// The lower bound and whether it is a member.
  #[must_use] pub fn lower(&self) -> (&ExtInt, bool) { (&self.lo, self.lo_in) }

  /// The upper bound and whether it is a member.
  #[must_use] pub fn upper(&self) -> (&ExtInt, bool) { (&self.hi, self.hi_in) }

  /// Whether `n` lies in the range.
  #[must_use] pub fn contains(&self, n: &ExtInt) -> bool {
    (match n.cmp(&self.lo) {
      std::cmp::Ordering::Less => false,
      std::cmp::Ordering::Equal => self.lo_in,
      std::cmp::Ordering::Greater => true,
    }) && match n.cmp(&self.hi) {
      std::cmp::Ordering::Greater => false,
      std::cmp::Ordering::Equal => self.hi_in,
      std::cmp::Ordering::Less => true,
    }
  }

  /// Whether every member of `other` is a member of `self`.
  #[must_use] pub fn contains_range(&self, other: &Self) -> bool {
    let lo_ok = match self.lo.cmp(&other.lo) {
      std::cmp::Ordering::Less => true,
      std::cmp::Ordering::Equal => self.lo_in || !other.lo_in,
      std::cmp::Ordering::Greater => false,
    };
    lo_ok && match self.hi.cmp(&other.hi) {
      std::cmp::Ordering::Greater => true,
      std::cmp::Ordering::Equal => self.hi_in || !other.hi_in,
      std::cmp::Ordering::Less => false,
    }
  }

  /// The smallest range containing both.
  #[must_use] pub fn hull(&self, other: &Self) -> Self {
    let (lo, lo_in) = match self.lo.cmp(&other.lo) {
      std::cmp::Ordering::Less => (self.lo.clone(), self.lo_in),
      std::cmp::Ordering::Greater => (other.lo.clone(), other.lo_in),
      std::cmp::Ordering::Equal => (self.lo.clone(), self.lo_in || other.lo_in),
    };
    let (hi, hi_in) = match self.hi.cmp(&other.hi) {
      std::cmp::Ordering::Greater => (self.hi.clone(), self.hi_in),
      std::cmp::Ordering::Less => (other.hi.clone(), other.hi_in),
      std::cmp::Ordering::Equal => (self.hi.clone(), self.hi_in || other.hi_in),
    };
    Self { lo, lo_in, hi, hi_in }
  }

  /// The intersection, or `None` if disjoint.
  #[must_use] pub fn intersect(&self, other: &Self) -> Option<Self> {
    let (lo, lo_in) = match self.lo.cmp(&other.lo) {
      std::cmp::Ordering::Greater => (self.lo.clone(), self.lo_in),
      std::cmp::Ordering::Less => (other.lo.clone(), other.lo_in),
      std::cmp::Ordering::Equal => (self.lo.clone(), self.lo_in && other.lo_in),
    };
    let (hi, hi_in) = match self.hi.cmp(&other.hi) {
      std::cmp::Ordering::Less => (self.hi.clone(), self.hi_in),
      std::cmp::Ordering::Greater => (other.hi.clone(), other.hi_in),
      std::cmp::Ordering::Equal => (self.hi.clone(), self.hi_in && other.hi_in),
    };
    Self::new(lo, lo_in, hi, hi_in)
  }

  /// The number of members, when finite and both bounds are integers.
  #[must_use] pub fn count(&self) -> Option<BigInt> {
    match (&self.lo, &self.hi) {
      (ExtInt::Fin(lo), ExtInt::Fin(hi)) => Some(hi - lo + 1),
      _ => None,
    }
  }

  /// An iterator over the members of a small finite range.
  fn members(&self) -> impl Iterator<Item = BigInt> + '_ {
    let (mut cur, end) = match (&self.lo, &self.hi) {
      (ExtInt::Fin(lo), ExtInt::Fin(hi)) => (lo.clone(), hi.clone()),
      _ => (BigInt::from(1), BigInt::ZERO),
    };
    std::iter::from_fn(move || {
      if cur > end { return None }
      let n = cur.clone();
      cur += 1;
      Some(n)
    })
  }
}

/// A tuple type: a leading sequence of per-index types, a default type for
/// the remaining indices, and a size range over whole numbers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct TupleTy {
  /// Types of the first `leading.len()` elements.
  pub leading: Box<[Ty]>,
  /// The type of every element past the leading sequence.
  pub default: Ty,
  /// The allowed tuple sizes.
  pub sizes: IntRange,
}

impl TupleTy {
  /// The element type at one-based index `i`: the leading entry, or the
  /// default past the leading sequence. The size range is consulted
  /// separately; an index past the maximum size is simply never populated.
  #[must_use] pub fn type_at(&self, i: usize) -> Ty {
    debug_assert!(i >= 1);
    self.leading.get(i - 1).cloned().unwrap_or_else(|| self.default.clone())
  }
}

/// A function type: parameter types as a tuple type (contravariant as a
/// whole), and a covariant return type.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FuncTy {
  /// The parameter tuple type.
  pub params: Ty,
  /// The return type.
  pub ret: Ty,
}

/// An enumeration of non-type instances. Equality and hashing are
/// order-independent; construction canonicalizes (see [`Ty::enum_of`]).
#[derive(Clone, Debug, Eq)]
pub struct EnumTy(Box<[Value]>);

impl EnumTy {
  /// The instances.
  #[must_use] pub fn instances(&self) -> &[Value] { &self.0 }
}

impl PartialEq for EnumTy {
  fn eq(&self, other: &Self) -> bool {
    self.0.len() == other.0.len() && self.0.iter().all(|v| other.0.contains(v))
  }
}

impl std::hash::Hash for EnumTy {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    // Order-independent: combine per-element hashes commutatively.
    let mut acc = 0u64;
    for v in &self.0 {
      let mut h = std::hash::DefaultHasher::new();
      v.hash(&mut h);
      acc ^= std::hash::Hasher::finish(&h);
    }
    state.write_u64(acc);
  }
}

/// The discriminated sum behind [`Ty`].
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum TyKind {
  /// ⊤, the type of every value.
  Any,
  /// ⊥, the type with no instances.
  Bottom,
  /// A structureless kind.
  Simple(SimpleKind),
  /// An extended-integer range.
  Int(IntRange),
  /// A tuple type.
  Tuple(TupleTy),
  /// A set type, covariant in its element type.
  Set(Ty),
  /// A map type, covariant in key and value types.
  Map(Ty, Ty),
  /// A function type.
  Func(FuncTy),
  /// A variable type: covariant read, contravariant write.
  Var {
    /// The type reads produce.
    read: Ty,
    /// The type writes must conform to.
    write: Ty,
  },
  /// A continuation type over a function type, covariant.
  Cont(Ty),
  /// A fiber type over its result type, covariant.
  Fiber(Ty),
  /// An enumeration of instances.
  Enum(EnumTy),
  /// The instance meta of a type: its instances are the subtypes of the
  /// parameter. Covariant; ⊔ and ⊓ distribute through it.
  Meta(Ty),
}

/// A type handle. Clones are cheap and share the underlying object.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Ty(Arc<TyKind>);

impl Ty {
  fn mk(kind: TyKind) -> Self { Self(Arc::new(kind)) }

  /// The underlying kind.
  #[must_use] pub fn kind(&self) -> &TyKind { &self.0 }

  /// ⊤.
  #[must_use] pub fn any() -> Self {
    static ANY: once_cell::sync::Lazy<Ty> = once_cell::sync::Lazy::new(|| Ty::mk(TyKind::Any));
    ANY.clone()
  }

  /// ⊥.
  #[must_use] pub fn bottom() -> Self {
    static BOT: once_cell::sync::Lazy<Ty> = once_cell::sync::Lazy::new(|| Ty::mk(TyKind::Bottom));
    BOT.clone()
  }

  /// A structureless kind.
  #[must_use] pub fn simple(kind: SimpleKind) -> Self { Self::mk(TyKind::Simple(kind)) }

  /// An integer range type; ⊥ when the interval is empty.
  #[must_use] pub fn int_range(lo: ExtInt, lo_in: bool, hi: ExtInt, hi_in: bool) -> Self {
    match IntRange::new(lo, lo_in, hi, hi_in) {
      Some(r) => Self::mk(TyKind::Int(r)),
      None => Self::bottom(),
    }
  }

  /// The type holding exactly the integer `n`.
  #[must_use] pub fn int_exact(n: impl Into<BigInt>) -> Self {
    Self::mk(TyKind::Int(IntRange::exact(ExtInt::Fin(n.into()))))
  }

  /// All finite integers.
  #[must_use] pub fn integers() -> Self {
    Self::int_range(ExtInt::NegInf, false, ExtInt::PosInf, false)
  }

  /// All extended integers, infinities included.
  #[must_use] pub fn extended_integers() -> Self {
    Self::int_range(ExtInt::NegInf, true, ExtInt::PosInf, true)
  }

  /// Whole numbers `[0..∞)`.
  #[must_use] pub fn whole_numbers() -> Self {
    Self::int_range(ExtInt::zero(), true, ExtInt::PosInf, false)
  }

  /// A tuple type. Canonicalizes: element types past an impossible index
  /// are dropped, and a ⊥ element caps the size range before it.
  #[must_use] pub fn tuple_of(leading: Vec<Ty>, default: Ty, sizes: IntRange) -> Self {
    let mut hi_cap: Option<usize> = None;
    for (i, ty) in leading.iter().enumerate() {
      if *ty == Self::bottom() { hi_cap = Some(i); break }
    }
    if default == Self::bottom() { hi_cap = hi_cap.or(Some(leading.len())) }
    let sizes = match hi_cap {
      Some(cap) => {
        let cap = ExtInt::Fin(cap.into());
        let hi = if *sizes.upper().0 < cap { sizes.upper().0.clone() } else { cap };
        match IntRange::new(sizes.lower().0.clone(), sizes.lower().1, hi, true) {
          Some(r) => r,
          None => return Self::bottom(),
        }
      }
      None => sizes,
    };
    let mut leading = leading;
    if let ExtInt::Fin(hi) = sizes.upper().0 {
      if let Ok(hi) = usize::try_from(hi.clone()) { leading.truncate(hi) }
    }
    while leading.last() == Some(&default) { leading.pop(); }
    Self::mk(TyKind::Tuple(TupleTy { leading: leading.into(), default, sizes }))
  }

  /// The tuple type of fixed size `tys.len()` with the given element types.
  #[must_use] pub fn fixed_tuple(tys: Vec<Ty>) -> Self {
    let n = tys.len();
    Self::tuple_of(tys, Self::bottom(), IntRange::exact(ExtInt::Fin(n.into())))
  }

  /// A set type.
  #[must_use] pub fn set_of(element: Ty) -> Self { Self::mk(TyKind::Set(element)) }

  /// A map type.
  #[must_use] pub fn map_of(key: Ty, value: Ty) -> Self { Self::mk(TyKind::Map(key, value)) }

  /// A function type from explicit parameter types.
  #[must_use] pub fn function(params: Vec<Ty>, ret: Ty) -> Self {
    Self::mk(TyKind::Func(FuncTy { params: Self::fixed_tuple(params), ret }))
  }

  /// A function type from a parameter tuple type.
  #[must_use] pub fn function_from_tuple(params: Ty, ret: Ty) -> Self {
    Self::mk(TyKind::Func(FuncTy { params, ret }))
  }

  /// A variable type with distinct read and write types.
  #[must_use] pub fn variable_rw(read: Ty, write: Ty) -> Self {
    Self::mk(TyKind::Var { read, write })
  }

  /// A variable type with one content type.
  #[must_use] pub fn variable(content: Ty) -> Self {
    Self::variable_rw(content.clone(), content)
  }

  /// A continuation type over a function type.
  #[must_use] pub fn continuation(func: Ty) -> Self { Self::mk(TyKind::Cont(func)) }

  /// A fiber type over a result type.
  #[must_use] pub fn fiber(result: Ty) -> Self { Self::mk(TyKind::Fiber(result)) }

  /// The instance meta of a type.
  #[must_use] pub fn meta(ty: Ty) -> Self { Self::mk(TyKind::Meta(ty)) }

  /// The type of booleans: the enumeration of the two boolean objects.
  #[must_use] pub fn boolean() -> Self {
    Self::enum_of(vec![Value::true_object(), Value::false_object()])
  }

  /// The enumeration of the given instances, canonicalized: duplicates are
  /// dropped, an empty enumeration is ⊥, type instances fold into an
  /// instance meta, and an all-integer contiguous instance set becomes a
  /// range.
  #[must_use] pub fn enum_of(instances: Vec<Value>) -> Self {
    let mut uniq: Vec<Value> = vec![];
    for v in instances {
      debug_assert!(!v.is_nil(), "nil cannot be an enumeration instance");
      if !uniq.contains(&v) { uniq.push(v) }
    }
    let (types, rest): (Vec<_>, Vec<_>) = uniq.into_iter().partition(Value::is_type);
    let meta_part = types.into_iter()
      .map(|v| Self::meta(v.as_ty().expect("partitioned").clone()))
      .reduce(|a, b| a.union(&b));
    let rest_part = if rest.is_empty() {
      None
    } else if rest.len() == 1 {
      if let ValueKind::Int(n) = rest[0].kind() {
        Some(Self::mk(TyKind::Int(IntRange::exact(n.clone()))))
      } else {
        Some(Self::mk(TyKind::Enum(EnumTy(rest.into()))))
      }
    } else if let Some(range) = contiguous_ints(&rest) {
      Some(Self::mk(TyKind::Int(range)))
    } else {
      Some(Self::mk(TyKind::Enum(EnumTy(rest.into()))))
    };
    match (meta_part, rest_part) {
      (Some(a), Some(b)) => a.union(&b),
      (Some(a), None) => a,
      (None, Some(b)) => b,
      (None, None) => Self::bottom(),
    }
  }

  /// The most specific type of a value: `[n..n]` for an integer, the
  /// instance meta for a type, ⊤ for nil, the instance enumeration
  /// otherwise.
  #[must_use] pub fn instance(v: &Value) -> Self {
    match v.kind() {
      ValueKind::Nil => Self::any(),
      ValueKind::Int(n) => Self::mk(TyKind::Int(IntRange::exact(n.clone()))),
      ValueKind::Ty(t) => Self::meta(t.clone()),
      _ => Self::enum_of(vec![v.clone()]),
    }
  }

  /// The non-enumeration kind of a value; the computed superkind of its
  /// instance type.
  #[must_use] pub fn base_kind(v: &Value) -> Self {
    match v.kind() {
      ValueKind::Nil => Self::any(),
      ValueKind::Int(n) => Self::mk(TyKind::Int(IntRange::exact(n.clone()))),
      ValueKind::Char(_) => Self::simple(SimpleKind::Character),
      ValueKind::Str(_) => Self::simple(SimpleKind::Str),
      ValueKind::Tuple(t) =>
        Self::tuple_of(t.iter().map(Self::instance).collect(), Self::bottom(),
          IntRange::exact(ExtInt::Fin(t.len().into()))),
      ValueKind::Set(s) => Self::set_of(
        s.iter().map(Self::instance).reduce(|a, b| a.union(&b)).unwrap_or_else(Self::bottom)),
      ValueKind::Map(m) => {
        let (mut k, mut v2) = (Self::bottom(), Self::bottom());
        for (key, val) in m {
          k = k.union(&Self::instance(key));
          v2 = v2.union(&Self::instance(val));
        }
        Self::map_of(k, v2)
      }
      ValueKind::Atom(_) => Self::simple(SimpleKind::Atom),
      ValueKind::Fn(f) => f.code.func_ty().clone(),
      ValueKind::Code(_) => Self::simple(SimpleKind::CompiledCode),
      ValueKind::Cont(c) => Self::continuation(c.function_ty()),
      ValueKind::Fiber(_) => Self::fiber(Self::any()),
      ValueKind::Var(var) => Self::variable(var.content_ty().clone()),
      ValueKind::Ty(t) => Self::meta(t.clone()),
      ValueKind::Phrase(_) => Self::simple(SimpleKind::Phrase),
      ValueKind::Token(_) => Self::simple(SimpleKind::Token),
      ValueKind::Pojo(_) => Self::simple(SimpleKind::Pojo),
    }
  }

  /// Whether `self ⊑ other`.
  #[must_use] pub fn subtype_of(&self, other: &Self) -> bool {
    if self == other || matches!(*other.0, TyKind::Any) { return true }
    if matches!(*self.0, TyKind::Bottom) { return true }
    match (&*self.0, &*other.0) {
      (TyKind::Enum(e), _) => e.0.iter().all(|v| other.has_instance(v)),
      (TyKind::Int(r), TyKind::Enum(e)) => {
        // A range fits inside an enumeration only when it is small enough
        // to check member by member.
        match r.count() {
          Some(n) if n <= BigInt::from(e.0.len()) =>
            r.members().all(|m| e.0.contains(&Value::int(m))),
          _ => false,
        }
      }
      (TyKind::Meta(a), TyKind::Meta(b)) => a.subtype_of(b),
      (TyKind::Int(a), TyKind::Int(b)) => b.contains_range(a),
      (TyKind::Simple(a), TyKind::Simple(b)) => a == b,
      (TyKind::Tuple(a), TyKind::Tuple(b)) => {
        b.sizes.contains_range(&a.sizes) && {
          let n = a.leading.len().max(b.leading.len());
          (1..=n).all(|i| a.type_at(i).subtype_of(&b.type_at(i)))
            && a.default.subtype_of(&b.default)
        }
      }
      (TyKind::Set(a), TyKind::Set(b)) => a.subtype_of(b),
      (TyKind::Map(ka, va), TyKind::Map(kb, vb)) => ka.subtype_of(kb) && va.subtype_of(vb),
      (TyKind::Func(a), TyKind::Func(b)) =>
        b.params.subtype_of(&a.params) && a.ret.subtype_of(&b.ret),
      (TyKind::Var { read: ra, write: wa }, TyKind::Var { read: rb, write: wb }) =>
        ra.subtype_of(rb) && wb.subtype_of(wa),
      (TyKind::Cont(a), TyKind::Cont(b)) | (TyKind::Fiber(a), TyKind::Fiber(b)) =>
        a.subtype_of(b),
      _ => false,
    }
  }

  /// `self ⊔ other`, the least upper bound.
  #[must_use] pub fn union(&self, other: &Self) -> Self {
    if self == other { return self.clone() }
    match (&*self.0, &*other.0) {
      (TyKind::Any, _) | (_, TyKind::Any) => Self::any(),
      (TyKind::Bottom, _) => other.clone(),
      (_, TyKind::Bottom) => self.clone(),
      (TyKind::Enum(a), TyKind::Enum(b)) => {
        let mut instances = a.0.to_vec();
        instances.extend(b.0.iter().cloned());
        Self::enum_of(instances)
      }
      (TyKind::Enum(e), _) => superkind(e).union(other),
      (_, TyKind::Enum(e)) => self.union(&superkind(e)),
      (TyKind::Meta(a), TyKind::Meta(b)) => Self::meta(a.union(b)),
      (TyKind::Int(a), TyKind::Int(b)) => Self::mk(TyKind::Int(a.hull(b))),
      (TyKind::Tuple(a), TyKind::Tuple(b)) => {
        let n = a.leading.len().max(b.leading.len());
        let leading = (1..=n).map(|i| a.type_at(i).union(&b.type_at(i))).collect();
        Self::tuple_of(leading, a.default.union(&b.default), a.sizes.hull(&b.sizes))
      }
      (TyKind::Set(a), TyKind::Set(b)) => Self::set_of(a.union(b)),
      (TyKind::Map(ka, va), TyKind::Map(kb, vb)) =>
        Self::map_of(ka.union(kb), va.union(vb)),
      (TyKind::Func(a), TyKind::Func(b)) =>
        Self::mk(TyKind::Func(FuncTy {
          params: a.params.intersection(&b.params),
          ret: a.ret.union(&b.ret),
        })),
      (TyKind::Var { read: ra, write: wa }, TyKind::Var { read: rb, write: wb }) =>
        Self::variable_rw(ra.union(rb), wa.intersection(wb)),
      (TyKind::Cont(a), TyKind::Cont(b)) => Self::continuation(a.union(b)),
      (TyKind::Fiber(a), TyKind::Fiber(b)) => Self::fiber(a.union(b)),
      _ => Self::any(),
    }
  }

  /// `self ⊓ other`, the greatest lower bound.
  #[must_use] pub fn intersection(&self, other: &Self) -> Self {
    if self == other { return self.clone() }
    match (&*self.0, &*other.0) {
      (TyKind::Bottom, _) | (_, TyKind::Bottom) => Self::bottom(),
      (TyKind::Any, _) => other.clone(),
      (_, TyKind::Any) => self.clone(),
      (TyKind::Enum(a), _) =>
        Self::enum_of(a.0.iter().filter(|v| other.has_instance(v)).cloned().collect()),
      (_, TyKind::Enum(b)) =>
        Self::enum_of(b.0.iter().filter(|v| self.has_instance(v)).cloned().collect()),
      (TyKind::Meta(a), TyKind::Meta(b)) => Self::meta(a.intersection(b)),
      (TyKind::Int(a), TyKind::Int(b)) => match a.intersect(b) {
        Some(r) => Self::mk(TyKind::Int(r)),
        None => Self::bottom(),
      },
      (TyKind::Tuple(a), TyKind::Tuple(b)) => match a.sizes.intersect(&b.sizes) {
        None => Self::bottom(),
        Some(sizes) => {
          let n = a.leading.len().max(b.leading.len());
          let leading: Vec<_> =
            (1..=n).map(|i| a.type_at(i).intersection(&b.type_at(i))).collect();
          Self::tuple_of(leading, a.default.intersection(&b.default), sizes)
        }
      },
      (TyKind::Set(a), TyKind::Set(b)) => Self::set_of(a.intersection(b)),
      (TyKind::Map(ka, va), TyKind::Map(kb, vb)) =>
        Self::map_of(ka.intersection(kb), va.intersection(vb)),
      (TyKind::Func(a), TyKind::Func(b)) =>
        Self::mk(TyKind::Func(FuncTy {
          params: a.params.union(&b.params),
          ret: a.ret.intersection(&b.ret),
        })),
      (TyKind::Var { read: ra, write: wa }, TyKind::Var { read: rb, write: wb }) =>
        Self::variable_rw(ra.intersection(rb), wa.union(wb)),
      (TyKind::Cont(a), TyKind::Cont(b)) => Self::continuation(a.intersection(b)),
      (TyKind::Fiber(a), TyKind::Fiber(b)) => Self::fiber(a.intersection(b)),
      _ => Self::bottom(),
    }
  }

  /// Whether `v` is an instance of `self`. Total.
  #[must_use] pub fn has_instance(&self, v: &Value) -> bool {
    match &*self.0 {
      TyKind::Any => true,
      TyKind::Bottom => false,
      TyKind::Enum(e) => e.0.contains(v),
      TyKind::Meta(t) => v.as_ty().is_some_and(|vt| vt.subtype_of(t)),
      TyKind::Int(r) => v.as_ext_int().is_some_and(|n| r.contains(n)),
      TyKind::Simple(k) => match (k, v.kind()) {
        (SimpleKind::Character, ValueKind::Char(_))
        | (SimpleKind::Str, ValueKind::Str(_))
        | (SimpleKind::Atom, ValueKind::Atom(_))
        | (SimpleKind::Token, ValueKind::Token(_))
        | (SimpleKind::Phrase, ValueKind::Phrase(_))
        | (SimpleKind::CompiledCode, ValueKind::Code(_))
        | (SimpleKind::Pojo, ValueKind::Pojo(_)) => true,
        _ => false,
      },
      TyKind::Tuple(tt) => v.as_tuple().is_some_and(|t| {
        tt.sizes.contains(&ExtInt::Fin(t.len().into()))
          && t.iter().enumerate().all(|(i, e)| tt.type_at(i + 1).has_instance(e))
      }),
      TyKind::Set(e) => match v.kind() {
        ValueKind::Set(s) => s.iter().all(|m| e.has_instance(m)),
        _ => false,
      },
      TyKind::Map(k, val) => match v.kind() {
        ValueKind::Map(m) =>
          m.iter().all(|(mk, mv)| k.has_instance(mk) && val.has_instance(mv)),
        _ => false,
      },
      TyKind::Func(_) =>
        v.as_function().is_some_and(|f| f.code.func_ty().subtype_of(self)),
      TyKind::Var { read, write } => v.as_variable().is_some_and(|var| {
        var.content_ty().subtype_of(read) && write.subtype_of(var.content_ty())
      }),
      TyKind::Cont(ft) => match v.kind() {
        ValueKind::Cont(c) => c.function_ty().subtype_of(ft),
        _ => false,
      },
      TyKind::Fiber(rt) => matches!(v.kind(), ValueKind::Fiber(_)) && *rt == Self::any(),
    }
  }

  /// The sole instance, for types provably inhabited by exactly one value.
  #[must_use] pub fn constant_instance(&self) -> Option<Value> {
    match &*self.0 {
      TyKind::Enum(e) if e.0.len() == 1 => Some(e.0[0].clone()),
      TyKind::Int(r) if r.count().is_some_and(|n| n == BigInt::from(1)) =>
        Some(Value::ext_int(r.lower().0.clone())),
      _ => None,
    }
  }

  /// The integer range, if this is an integer range type.
  #[must_use] pub fn as_int_range(&self) -> Option<&IntRange> {
    if let TyKind::Int(r) = &*self.0 { Some(r) } else { None }
  }

  /// The tuple structure, if this is a tuple type.
  #[must_use] pub fn as_tuple_ty(&self) -> Option<&TupleTy> {
    if let TyKind::Tuple(t) = &*self.0 { Some(t) } else { None }
  }

  /// The function structure, if this is a function type.
  #[must_use] pub fn as_func_ty(&self) -> Option<&FuncTy> {
    if let TyKind::Func(f) = &*self.0 { Some(f) } else { None }
  }

  /// The return type of a function type, ⊤ if unknown.
  #[must_use] pub fn return_ty(&self) -> Ty {
    self.as_func_ty().map_or_else(Self::any, |f| f.ret.clone())
  }
}

/// The computed superkind of an enumeration: the union of the instances'
/// non-enumeration kinds.
fn superkind(e: &EnumTy) -> Ty {
  e.0.iter().map(Ty::base_kind).reduce(|a, b| a.union(&b)).unwrap_or_else(Ty::bottom)
}

/// If every instance is an integer and the set is contiguous, its range.
fn contiguous_ints(instances: &[Value]) -> Option<IntRange> {
  let mut ints: Vec<&BigInt> = instances.iter().map(Value::as_int).collect::<Option<_>>()?;
  ints.sort_unstable();
  let (lo, hi) = (ints[0].clone(), (*ints.last().expect("nonempty")).clone());
  if &hi - &lo + 1 != BigInt::from(ints.len()) { return None }
  IntRange::new(ExtInt::Fin(lo), true, ExtInt::Fin(hi), true)
}

impl fmt::Debug for Ty {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match &*self.0 {
      TyKind::Any => write!(f, "any"),
      TyKind::Bottom => write!(f, "\u{22a5}"),
      TyKind::Simple(k) => write!(f, "{k:?}"),
      TyKind::Int(r) => {
        let (lo, lo_in) = r.lower();
        let (hi, hi_in) = r.upper();
        write!(f, "{}{lo}..{hi}{}", if lo_in { '[' } else { '(' }, if hi_in { ']' } else { ')' })
      }
      TyKind::Tuple(t) => {
        write!(f, "<")?;
        for ty in &t.leading { write!(f, "{ty:?}, ")? }
        write!(f, "{:?}...|{:?}>", t.default, Ty::mk(TyKind::Int(t.sizes.clone())))
      }
      TyKind::Set(e) => write!(f, "{{{e:?}|}}"),
      TyKind::Map(k, v) => write!(f, "{{{k:?}->{v:?}|}}"),
      TyKind::Func(ft) => write!(f, "[{:?}]->{:?}", ft.params, ft.ret),
      TyKind::Var { read, write } => {
        if read == write { write!(f, "var({read:?})") }
        else { write!(f, "var(r:{read:?}, w:{write:?})") }
      }
      TyKind::Cont(t) => write!(f, "$[{t:?}]"),
      TyKind::Fiber(t) => write!(f, "fiber->{t:?}"),
      TyKind::Enum(e) => f.debug_set().entries(e.0.iter()).finish(),
      TyKind::Meta(t) => write!(f, "{t:?}'s type"),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn samples() -> Vec<Ty> {
    let a1 = Value::new(ValueKind::Atom(crate::types::value::Atom::fresh("a1")));
    let a2 = Value::new(ValueKind::Atom(crate::types::value::Atom::fresh("a2")));
    vec![
      Ty::any(),
      Ty::bottom(),
      Ty::simple(SimpleKind::Character),
      Ty::simple(SimpleKind::Atom),
      Ty::simple(SimpleKind::Str),
      Ty::integers(),
      Ty::extended_integers(),
      Ty::whole_numbers(),
      Ty::int_exact(5),
      Ty::int_range(ExtInt::from(1), true, ExtInt::from(10), true),
      Ty::int_range(ExtInt::from(-3), true, ExtInt::from(3), true),
      Ty::enum_of(vec![Value::int(1), Value::int(3)]),
      Ty::enum_of(vec![a1.clone(), a2.clone()]),
      Ty::enum_of(vec![a1, Value::int(7)]),
      Ty::enum_of(vec![Value::char('x'), Value::char('y')]),
      Ty::boolean(),
      Ty::fixed_tuple(vec![Ty::integers(), Ty::simple(SimpleKind::Str)]),
      Ty::tuple_of(vec![Ty::int_exact(1)], Ty::integers(),
        IntRange::new(ExtInt::from(0), true, ExtInt::PosInf, false).unwrap()),
      Ty::set_of(Ty::integers()),
      Ty::set_of(Ty::whole_numbers()),
      Ty::map_of(Ty::simple(SimpleKind::Str), Ty::integers()),
      Ty::function(vec![Ty::integers()], Ty::integers()),
      Ty::function(vec![Ty::whole_numbers()], Ty::int_exact(0)),
      Ty::variable(Ty::integers()),
      Ty::variable_rw(Ty::integers(), Ty::whole_numbers()),
      Ty::continuation(Ty::function(vec![], Ty::any())),
      Ty::fiber(Ty::any()),
      Ty::meta(Ty::integers()),
      Ty::meta(Ty::whole_numbers()),
      Ty::meta(Ty::bottom()),
    ]
  }

  #[test]
  fn subtype_is_reflexive() {
    for x in samples() { assert!(x.subtype_of(&x), "{x:?}") }
  }

  #[test]
  fn subtype_is_transitive() {
    let tys = samples();
    for x in &tys {
      for y in &tys {
        for z in &tys {
          if x.subtype_of(y) && y.subtype_of(z) {
            assert!(x.subtype_of(z), "{x:?} <= {y:?} <= {z:?}");
          }
        }
      }
    }
  }

  #[test]
  fn mutual_subtypes_are_equal() {
    let tys = samples();
    for x in &tys {
      for y in &tys {
        if x.subtype_of(y) && y.subtype_of(x) {
          assert_eq!(x, y);
        }
      }
    }
  }

  #[test]
  fn union_laws() {
    let tys = samples();
    for x in &tys {
      assert_eq!(x.union(x), *x, "idempotence of {x:?}");
      for y in &tys {
        assert_eq!(x.union(y), y.union(x), "commutativity of {x:?}, {y:?}");
        assert!(x.subtype_of(&x.union(y)), "upper bound {x:?} {y:?}");
        for z in &tys {
          assert_eq!(x.union(y).union(z), x.union(&y.union(z)),
            "associativity of {x:?}, {y:?}, {z:?}");
        }
      }
    }
  }

  #[test]
  fn intersection_laws() {
    let tys = samples();
    for x in &tys {
      assert_eq!(x.intersection(x), *x, "idempotence of {x:?}");
      for y in &tys {
        assert_eq!(x.intersection(y), y.intersection(x), "commutativity of {x:?}, {y:?}");
        assert!(x.intersection(y).subtype_of(x), "lower bound {x:?} {y:?}");
        for z in &tys {
          assert_eq!(x.intersection(y).intersection(z), x.intersection(&y.intersection(z)),
            "associativity of {x:?}, {y:?}, {z:?}");
        }
      }
    }
  }

  #[test]
  fn function_variance() {
    let narrow = Ty::int_range(ExtInt::from(0), true, ExtInt::from(9), true);
    let wide = Ty::integers();
    assert!(narrow.subtype_of(&wide));
    // Result covariance.
    assert!(Ty::function(vec![wide.clone()], narrow.clone())
      .subtype_of(&Ty::function(vec![wide.clone()], wide.clone())));
    // Argument contravariance.
    assert!(Ty::function(vec![wide.clone()], narrow.clone())
      .subtype_of(&Ty::function(vec![narrow.clone()], narrow.clone())));
    assert!(!Ty::function(vec![narrow.clone()], narrow.clone())
      .subtype_of(&Ty::function(vec![wide.clone()], narrow.clone())));
    // Tuple entry covariance.
    assert!(Ty::fixed_tuple(vec![narrow.clone()])
      .subtype_of(&Ty::fixed_tuple(vec![wide.clone()])));
    // Variable read/write invariance.
    assert!(!Ty::variable(narrow.clone()).subtype_of(&Ty::variable(wide.clone())));
    assert!(!Ty::variable(wide.clone()).subtype_of(&Ty::variable(narrow.clone())));
    assert!(Ty::variable(narrow.clone()).subtype_of(&Ty::variable(narrow)));
  }

  #[test]
  fn metacovariance_and_metainvariance() {
    let tys = samples();
    for x in &tys {
      for y in &tys {
        if x.subtype_of(y) {
          assert!(Ty::meta(x.clone()).subtype_of(&Ty::meta(y.clone())), "{x:?} {y:?}");
        }
        assert_eq!(Ty::meta(x.clone()).union(&Ty::meta(y.clone())),
          Ty::meta(x.union(y)));
        assert_eq!(Ty::meta(x.clone()).intersection(&Ty::meta(y.clone())),
          Ty::meta(x.intersection(y)));
      }
    }
  }

  #[test]
  fn instances_conform_to_instance_types() {
    let vals = [Value::int(5), Value::char('q'), Value::string("s"),
      Value::tuple([Value::int(1), Value::int(2)]), Value::true_object()];
    for v in &vals {
      let t = v.instance_ty();
      assert!(t.has_instance(v), "{v:?} : {t:?}");
      assert!(t.subtype_of(&v.base_kind()), "{t:?} <= {:?}", v.base_kind());
    }
  }

  #[test]
  fn enumeration_canonicalization() {
    assert_eq!(Ty::enum_of(vec![Value::int(1), Value::int(2), Value::int(3)]),
      Ty::int_range(ExtInt::from(1), true, ExtInt::from(3), true));
    assert_eq!(Ty::enum_of(vec![]), Ty::bottom());
    assert_eq!(Ty::enum_of(vec![Value::int(4)]), Ty::int_exact(4));
    let noncontiguous = Ty::enum_of(vec![Value::int(1), Value::int(3)]);
    assert!(matches!(noncontiguous.kind(), TyKind::Enum(_)));
    assert!(noncontiguous.subtype_of(
      &Ty::int_range(ExtInt::from(1), true, ExtInt::from(3), true)));
  }
}
