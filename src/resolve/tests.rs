use super::*;
use crate::callgraph::BasicAliasOracle;
use crate::ir::{FuncId, IrType, ProgramBuilder};

fn setup() -> (ProgramBuilder, FuncId, FuncId) {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let source = pb.declare(m, "source", vec![], IrType::Int(32));
    let func = pb.declare(m, "func", vec![IrType::Int(32)], IrType::Int(32));
    (pb, source, func)
}

fn bool_const(value: bool) -> Value {
    Value::Const(ConstInt::bool(value))
}

#[test]
fn test_terminal_values_resolve_to_themselves() {
    let (mut pb, _, func) = setup();
    {
        let mut fb = pb.define(func);
        fb.ret(Some(Value::int(0, 32)));
    }
    let program = pb.finish();
    let entry = program.function(func).blocks[0];
    let path = [entry];
    let mut resolver = PathResolver::new(&program, &BasicAliasOracle, PathSlice::forward(&path));

    let constant = Value::int(-1, 32);
    let arg = Value::Arg { func, index: 0 };
    assert_eq!(resolver.resolve(constant), Some(constant));
    assert_eq!(resolver.resolve(arg), Some(arg));
    assert_eq!(resolver.resolve(Value::Null), Some(Value::Null));
}

#[test]
fn test_load_follows_store_on_path() {
    let (mut pb, source, func) = setup();
    let (call, loaded, entry, next) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let next = fb.create_block();
        fb.switch_to(entry);
        let slot = fb.alloca();
        let call = fb.call(source, vec![]);
        fb.store(slot, call);
        fb.jump(next);
        fb.switch_to(next);
        let loaded = fb.load(slot, IrType::Int(32));
        fb.ret(Some(loaded));
        (call, loaded, entry, next)
    };
    let program = pb.finish();
    let path = [entry, next];

    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(loaded), &path),
        Some(call)
    );
    // Without the storing block on the path the load is unresolvable
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(loaded), &path[1..]),
        None
    );
}

#[test]
fn test_load_through_aliasing_gep() {
    let (mut pb, source, func) = setup();
    let (call, loaded, entry) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        fb.switch_to(entry);
        let base = fb.arg(0);
        let field = fb.gep(base, Some(8));
        let call = fb.call(source, vec![]);
        fb.store(field, call);
        let other_base = fb.load(Value::Global(0), IrType::Ptr);
        let other_field = fb.gep(other_base, Some(8));
        let loaded = fb.load(other_field, IrType::Int(32));
        fb.ret(Some(loaded));
        (call, loaded, entry)
    };
    let program = pb.finish();
    let path = [entry];

    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(loaded), &path),
        Some(call)
    );
}

#[test]
fn test_phi_takes_closest_incoming_on_path() {
    let (mut pb, source, func) = setup();
    let (phi, left, right, entry, join) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let left = fb.create_block();
        let right = fb.create_block();
        let join = fb.create_block();
        fb.switch_to(entry);
        let call = fb.call(source, vec![]);
        let cond = fb.icmp(Predicate::Eq, call, Value::int(0, 32));
        fb.branch(cond, left, right);
        fb.switch_to(left);
        fb.jump(join);
        fb.switch_to(right);
        fb.jump(join);
        fb.switch_to(join);
        let phi = fb.phi(
            IrType::Int(32),
            vec![(left, Value::int(1, 32)), (right, Value::int(2, 32))],
        );
        fb.ret(Some(phi));
        (phi, left, right, entry, join)
    };
    let program = pb.finish();

    let via_left = [entry, left, join];
    let via_right = [entry, right, join];
    let off_path = [join];
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(phi), &via_left),
        Some(Value::int(1, 32))
    );
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(phi), &via_right),
        Some(Value::int(2, 32))
    );
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(phi), &off_path),
        None
    );
}

#[test]
fn test_loop_carried_phis_terminate() {
    let (mut pb, _, func) = setup();
    let (header_phi, entry, header, body) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let header = fb.create_block();
        let body = fb.create_block();
        let exit = fb.create_block();
        fb.switch_to(entry);
        fb.jump(header);
        fb.switch_to(header);
        let header_phi = fb.phi(IrType::Int(32), vec![]);
        let cond = fb.icmp(Predicate::Slt, header_phi, Value::int(10, 32));
        fb.branch(cond, body, exit);
        fb.switch_to(body);
        let body_phi = fb.phi(IrType::Int(32), vec![(header, header_phi)]);
        fb.jump(header);
        fb.switch_to(exit);
        fb.ret(Some(header_phi));
        fb.set_phi_incoming(header_phi, vec![(entry, Value::Undef), (body, body_phi)]);
        (header_phi, entry, header, body)
    };
    let program = pb.finish();

    // The body is closer than the entry, and its phi leads straight back
    let path = [entry, header, body, header];
    let result = resolve_along_path(&program, &BasicAliasOracle, Some(header_phi), &path);
    assert_ne!(result, Some(header_phi));
    assert_eq!(result, None);
}

/// entry: c = source(); if (c == 0) goto a else goto b
/// a, b: goto join
/// join:  t = (c <= 0)
fn correlated_branches() -> (crate::ir::Program, Value, [BlockId; 4]) {
    let (mut pb, source, func) = setup();
    let (t, blocks) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let a = fb.create_block();
        let b = fb.create_block();
        let join = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        let first = fb.icmp(Predicate::Eq, c, Value::int(0, 32));
        fb.branch(first, a, b);
        fb.switch_to(a);
        fb.jump(join);
        fb.switch_to(b);
        fb.jump(join);
        fb.switch_to(join);
        let t = fb.icmp(Predicate::Sle, c, Value::int(0, 32));
        fb.ret(Some(Value::int(0, 32)));
        (t, [entry, a, b, join])
    };
    (pb.finish(), t, blocks)
}

#[test]
fn test_cmp_decided_by_sibling_branch() {
    let (program, t, [entry, a, b, join]) = correlated_branches();

    // c == 0 implies c <= 0
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(t), &[entry, a, join]),
        Some(bool_const(true))
    );
    // c != 0 says nothing about c <= 0
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(t), &[entry, b, join]),
        Some(t)
    );
}

#[test]
fn test_cmp_decided_by_switch_case() {
    let (mut pb, source, func) = setup();
    let (t, entry, one, two, join) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let one = fb.create_block();
        let two = fb.create_block();
        let other = fb.create_block();
        let join = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        fb.switch(c, other, vec![(1, one), (2, two)]);
        for block in [one, two, other] {
            fb.switch_to(block);
            fb.jump(join);
        }
        fb.switch_to(join);
        let t = fb.icmp(Predicate::Slt, c, Value::int(2, 32));
        fb.ret(Some(Value::int(0, 32)));
        (t, entry, one, two, join)
    };
    let program = pb.finish();

    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(t), &[entry, one, join]),
        Some(bool_const(true))
    );
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(t), &[entry, two, join]),
        Some(bool_const(false))
    );
}

#[test]
fn test_select_with_decided_condition() {
    let (mut pb, source, func) = setup();
    let (select, call, entry) = {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        fb.switch_to(entry);
        let call = fb.call(source, vec![]);
        let select = fb.select(bool_const(true), call, Value::int(-1, 32));
        fb.ret(Some(select));
        (select, call, entry)
    };
    let program = pb.finish();
    assert_eq!(
        resolve_along_path(&program, &BasicAliasOracle, Some(select), &[entry]),
        Some(call)
    );
}

#[test]
fn test_compute_rhs() {
    assert_eq!(compute_rhs(Value::int(-5, 32)), Some(-5));
    assert_eq!(compute_rhs(Value::int(-1, 64)), Some(-1));
    assert_eq!(compute_rhs(Value::Null), Some(0));
    assert_eq!(compute_rhs(Value::Undef), None);
}

#[test]
fn test_backward_slice_iterates_in_execution_order() {
    let blocks = [BlockId(3), BlockId(2), BlockId(1)];
    let slice = PathSlice::backward(&blocks);
    assert_eq!(slice.get(0), BlockId(1));
    assert_eq!(slice.get(2), BlockId(3));
    assert_eq!(slice.rposition(BlockId(2)), Some(1));
    assert_eq!(slice.rposition(BlockId(9)), None);
}
