//! The Level Two optimiser: constant propagation, move elimination over
//! origin chains, branch folding, dead-code removal, and unreachable-code
//! compaction, applied to a fixpoint.
//!
//! All analysis is per basic block. A block ends at any instruction with
//! explicit successor edges and at any invocation: an invocation's return
//! path restores only the architectural registers from the reified frame,
//! so no temporary may be presumed to survive it.

use bit_set::BitSet;
use hashbrown::HashMap;
use if_chain::if_chain;
use itertools::Itertools;

use crate::types::l2::{L2Instr, L2Pc, L2Reg};
use crate::types::ty::Ty;
use crate::types::value::Value;

/// Optimise a chunk's instructions in place. `num_arch` is the count of
/// pre-coloured architectural registers (caller, function, and the frame
/// slots), which every invocation implicitly reads.
pub fn optimize(instructions: &mut Vec<L2Instr>, num_arch: u32) {
  for _ in 0..10 {
    let mut changed = forward_pass(instructions);
    changed |= remove_dead_code(instructions, num_arch);
    changed |= remove_unreachable(instructions);
    if !changed { break }
  }
}

/// The indices at which a basic block begins.
fn leaders(instructions: &[L2Instr]) -> BitSet {
  let mut set = BitSet::new();
  set.insert(0);
  for (i, instr) in instructions.iter().enumerate() {
    for succ in instr.successors() { set.insert(succ.0 as usize); }
    if !instr.successors().is_empty() || instr.is_call() {
      set.insert(i + 1);
    }
  }
  set
}

/// One in-order pass: move elimination via origin chains, constant
/// propagation, and branch folding. Returns whether anything changed.
fn forward_pass(instructions: &mut [L2Instr]) -> bool {
  let leaders = leaders(instructions);
  let mut changed = false;
  let mut equiv: HashMap<L2Reg, L2Reg> = HashMap::new();
  let mut constants: HashMap<L2Reg, Value> = HashMap::new();
  let mut types: HashMap<L2Reg, Ty> = HashMap::new();
  for i in 0..instructions.len() {
    if leaders.contains(i) {
      equiv.clear();
      constants.clear();
      types.clear();
    }
    let instr = &mut instructions[i];
    // Rewrite reads to the earliest still-live register holding the same
    // value; this is what makes the defining moves dead.
    instr.rewrite_sources(|r| {
      let e = equiv.get(&r).copied().unwrap_or(r);
      if e != r { changed = true }
      e
    });
    // Replace a move from a proven constant by the constant itself.
    if let L2Instr::Move { src, dst } = *instr {
      if let Some(value) = constants.get(&src).cloned() {
        *instr = L2Instr::MoveConstant { value, dst };
        changed = true;
      }
    }
    // Fold type-test branches whose outcome is statically known; narrow
    // the tested type when only part of it is possible.
    if let L2Instr::JumpIfKindOfConstant { value, ty, if_kind, if_not } = instr {
      let decided = if let Some(v) = constants.get(value) {
        Some(if v.is_instance_of(ty) { *if_kind } else { *if_not })
      } else if let Some(known) = types.get(value) {
        if known.subtype_of(ty) {
          Some(*if_kind)
        } else if known.intersection(ty) == Ty::bottom() {
          Some(*if_not)
        } else {
          let narrowed = ty.intersection(known);
          if narrowed != *ty && narrowed.subtype_of(ty) {
            *ty = narrowed;
            changed = true;
          }
          None
        }
      } else {
        None
      };
      if let Some(target) = decided {
        *instr = L2Instr::Jump { target };
        changed = true;
      }
    }
    if_chain! {
      if let L2Instr::JumpIfNotKindOfConstant { value, ty, if_not } = instr;
      if let Some(v) = constants.get(value);
      then {
        let target = if v.is_instance_of(ty) { L2Pc(i as u32 + 1) } else { *if_not };
        *instr = L2Instr::Jump { target };
        changed = true;
      }
    }
    // Propagate this instruction's effect into the block state.
    let instr = &instructions[i];
    match instr {
      L2Instr::MoveConstant { value, dst } => {
        invalidate(&mut equiv, &mut constants, &mut types, *dst);
        constants.insert(*dst, value.clone());
        types.insert(*dst, value.instance_ty());
      }
      L2Instr::Move { src, dst } | L2Instr::MakeImmutable { src, dst } => {
        let (src, dst) = (*src, *dst);
        let resolved = equiv.get(&src).copied().unwrap_or(src);
        let known_const = constants.get(&src).cloned();
        let known_ty = types.get(&src).cloned();
        invalidate(&mut equiv, &mut constants, &mut types, dst);
        if resolved != dst { equiv.insert(dst, resolved); }
        if let Some(c) = known_const { constants.insert(dst, c); }
        if let Some(t) = known_ty { types.insert(dst, t); }
      }
      L2Instr::RunInfalliblePrimitive { expected, dst, .. } => {
        let (expected, dst) = (expected.clone(), *dst);
        invalidate(&mut equiv, &mut constants, &mut types, dst);
        types.insert(dst, expected);
      }
      L2Instr::CreateTuple { elements, dst } => {
        let leading = elements.iter()
          .map(|r| types.get(r).cloned().unwrap_or_else(Ty::any))
          .collect();
        let dst = *dst;
        invalidate(&mut equiv, &mut constants, &mut types, dst);
        types.insert(dst, Ty::fixed_tuple(leading));
      }
      _ => {
        if let Some(dst) = instr.dest() {
          invalidate(&mut equiv, &mut constants, &mut types, dst);
        }
      }
    }
  }
  changed
}

/// Forget everything known about `dst`, including equivalences through it.
fn invalidate(
  equiv: &mut HashMap<L2Reg, L2Reg>,
  constants: &mut HashMap<L2Reg, Value>,
  types: &mut HashMap<L2Reg, Ty>,
  dst: L2Reg,
) {
  equiv.remove(&dst);
  equiv.retain(|_, &mut e| e != dst);
  constants.remove(&dst);
  types.remove(&dst);
}

/// Per-instruction successor indices, fallthrough included.
fn flow(instructions: &[L2Instr]) -> Vec<Vec<usize>> {
  instructions.iter().enumerate()
    .map(|(i, instr)| {
      let mut out: Vec<usize> =
        instr.successors().iter().map(|pc| pc.0 as usize).collect();
      if instr.falls_through() && i + 1 < instructions.len() {
        out.push(i + 1);
      }
      out.into_iter().unique().collect()
    })
    .collect()
}

/// Remove instructions with no observable side effect and no live
/// destination. Returns whether anything was removed.
fn remove_dead_code(instructions: &mut Vec<L2Instr>, num_arch: u32) -> bool {
  let n = instructions.len();
  if n == 0 { return false }
  let flow = flow(instructions);
  let mut live_out: Vec<BitSet> = vec![BitSet::new(); n];
  let mut live_int_out: Vec<BitSet> = vec![BitSet::new(); n];
  // Backward fixpoint over boxed and int liveness together.
  loop {
    let mut stable = true;
    for i in (0..n).rev() {
      let mut out = BitSet::new();
      let mut out_int = BitSet::new();
      for &succ in &flow[i] {
        out.union_with(&live_in(&instructions[succ], &live_out[succ], num_arch));
        out_int.union_with(&live_in_int(&instructions[succ], &live_int_out[succ]));
      }
      if out != live_out[i] || out_int != live_int_out[i] {
        live_out[i] = out;
        live_int_out[i] = out_int;
        stable = false;
      }
    }
    if stable { break }
  }
  let keep: Vec<bool> = instructions.iter().enumerate()
    .map(|(i, instr)| {
      if instr.has_side_effect() { return true }
      let boxed_live = instr.dest().is_some_and(|d| live_out[i].contains(d.0 as usize));
      let int_live = instr.int_dest().is_some_and(|d|
        live_int_out[i].contains(d.0 as usize));
      boxed_live || int_live
    })
    .collect();
  compact(instructions, &keep)
}

/// The boxed registers live on entry to `instr`, given its live-out set.
fn live_in(instr: &L2Instr, out: &BitSet, num_arch: u32) -> BitSet {
  let mut set = out.clone();
  if let Some(dst) = instr.dest() { set.remove(dst.0 as usize); }
  for src in instr.sources() { set.insert(src.0 as usize); }
  if instr.is_call() || matches!(instr,
      L2Instr::EnterL2Chunk { .. } | L2Instr::DecrementCounterAndReoptimizeOnZero { .. }) {
    // The reified frame (or the re-entered chunk) reads every
    // architectural register.
    for r in 0..num_arch { set.insert(r as usize); }
  }
  set
}

/// The int registers live on entry to `instr`.
fn live_in_int(instr: &L2Instr, out: &BitSet) -> BitSet {
  let mut set = out.clone();
  if let Some(dst) = instr.int_dest() { set.remove(dst.0 as usize); }
  for src in instr.int_sources() { set.insert(src.0 as usize); }
  set
}

/// Drop instructions unreachable from the entry. Returns whether anything
/// was removed.
fn remove_unreachable(instructions: &mut Vec<L2Instr>) -> bool {
  let n = instructions.len();
  if n == 0 { return false }
  let flow = flow(instructions);
  let mut reachable = BitSet::new();
  let mut work = vec![0usize];
  while let Some(i) = work.pop() {
    if !reachable.insert(i) { continue }
    for &succ in &flow[i] { work.push(succ); }
  }
  let keep: Vec<bool> = (0..n).map(|i| reachable.contains(i)).collect();
  compact(instructions, &keep)
}

/// Remove the instructions not marked `keep`, remapping every branch
/// target past the holes. Returns whether anything was removed.
fn compact(instructions: &mut Vec<L2Instr>, keep: &[bool]) -> bool {
  if keep.iter().all(|&k| k) { return false }
  let mut remap = Vec::with_capacity(keep.len());
  let mut next = 0u32;
  for &k in keep {
    remap.push(next);
    if k { next += 1 }
  }
  let mut index = 0;
  instructions.retain(|_| {
    let kept = keep[index];
    index += 1;
    kept
  });
  for instr in instructions.iter_mut() {
    instr.rewrite_targets(|pc| remap.get(pc as usize).copied().unwrap_or(next));
  }
  true
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::primitive::PrimitiveRegistry;
  use crate::types::l2::{ARCH_FIXED, REG_CALLER};
  use crate::types::value::ExtInt;

  fn r(n: u32) -> L2Reg { L2Reg(ARCH_FIXED + n) }

  #[test]
  fn chained_moves_collapse() {
    // move a, b; move b, c; return(caller, c): the middle register has no
    // other use, so the survivor reads straight from the source.
    let mut instrs = vec![
      L2Instr::MoveConstant { value: Value::int(7), dst: r(0) },
      L2Instr::Move { src: r(0), dst: r(1) },
      L2Instr::Move { src: r(1), dst: r(2) },
      L2Instr::Return { caller: REG_CALLER, value: r(2) },
    ];
    optimize(&mut instrs, ARCH_FIXED);
    let moves = instrs.iter()
      .filter(|i| matches!(i, L2Instr::Move { .. }))
      .count();
    assert_eq!(moves, 0, "{instrs:?}");
    for pair in instrs.windows(2) {
      if let [L2Instr::Move { dst: b1, .. }, L2Instr::Move { src: b2, .. }] = pair {
        assert_ne!(b1, b2, "redundant move chain survived");
      }
    }
  }

  #[test]
  fn constant_branches_fold() {
    let mut instrs = vec![
      L2Instr::MoveConstant { value: Value::int(3), dst: r(0) },
      L2Instr::JumpIfKindOfConstant {
        value: r(0),
        ty: Ty::integers(),
        if_kind: L2Pc(2),
        if_not: L2Pc(3),
      },
      L2Instr::Return { caller: REG_CALLER, value: r(0) },
      L2Instr::Return { caller: REG_CALLER, value: r(0) },
    ];
    optimize(&mut instrs, ARCH_FIXED);
    assert!(
      !instrs.iter().any(|i| matches!(i, L2Instr::JumpIfKindOfConstant { .. })),
      "{instrs:?}");
  }

  #[test]
  fn dead_pure_instructions_drop() {
    let mut instrs = vec![
      L2Instr::MoveConstant { value: Value::int(1), dst: r(0) },
      L2Instr::MoveConstant { value: Value::int(2), dst: r(0) },
      L2Instr::Return { caller: REG_CALLER, value: r(0) },
    ];
    optimize(&mut instrs, ARCH_FIXED);
    assert_eq!(instrs.len(), 2, "{instrs:?}");
  }

  #[test]
  fn partial_type_tests_narrow() {
    // The primitive's result is known to lie in [10..30]; a test against
    // [0..20] can only pass on the overlap, so the tested type narrows to
    // the intersection while the branch itself survives.
    let registry = PrimitiveRegistry::shared();
    let add = registry.number_of("_+_").expect("manifested");
    let known = Ty::int_range(ExtInt::from(10), true, ExtInt::from(30), true);
    let tested = Ty::int_range(ExtInt::from(0), true, ExtInt::from(20), true);
    let mut instrs = vec![
      L2Instr::RunInfalliblePrimitive {
        prim: add,
        args: vec![r(8), r(9)],
        check: false,
        expected: known.clone(),
        dst: r(0),
      },
      L2Instr::JumpIfKindOfConstant {
        value: r(0),
        ty: tested,
        if_kind: L2Pc(2),
        if_not: L2Pc(3),
      },
      L2Instr::Return { caller: REG_CALLER, value: r(0) },
      L2Instr::Return { caller: REG_CALLER, value: r(0) },
    ];
    optimize(&mut instrs, ARCH_FIXED);
    let narrowed = instrs.iter().find_map(|i| match i {
      L2Instr::JumpIfKindOfConstant { ty, .. } => Some(ty.clone()),
      _ => None,
    });
    assert_eq!(narrowed, Some(known.intersection(
      &Ty::int_range(ExtInt::from(0), true, ExtInt::from(20), true))));
  }
}
