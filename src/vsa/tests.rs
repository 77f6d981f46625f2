use super::*;
use crate::callgraph::BasicAliasOracle;
use crate::ir::{Predicate, ProgramBuilder};

fn range_of(program: &Program, func: FuncId, histograms: &Histograms) -> ConstantRange {
    let callgraph = CallGraph::from_direct_calls(program);
    FunctionVsa::new(program, &callgraph, &BasicAliasOracle, histograms).compute_range(func)
}

/// `func(a)` returning `-1` or `0` depending on its argument
fn two_constants() -> (Program, FuncId) {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let func = pb.declare(m, "func", vec![IrType::Int(32)], IrType::Int(32));
    {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let err = fb.create_block();
        let ok = fb.create_block();
        fb.switch_to(entry);
        let t = fb.icmp(Predicate::Slt, fb.arg(0), Value::int(0, 32));
        fb.branch(t, err, ok);
        fb.switch_to(err);
        fb.ret(Some(Value::int(-1, 32)));
        fb.switch_to(ok);
        fb.ret(Some(Value::int(0, 32)));
    }
    (pb.finish(), func)
}

#[test]
fn test_constant_returns_give_hull() {
    let (program, func) = two_constants();
    let range = range_of(&program, func, &Histograms::new());
    assert_eq!(range.bounds(), Some((-1, 0)));
    assert!(!range.is_full());
}

#[test]
fn test_refine_narrows_and_merges() {
    let (program, func) = two_constants();
    let callgraph = CallGraph::from_direct_calls(&program);
    let histograms = Histograms::new();
    let mut vsa = FunctionVsa::new(&program, &callgraph, &BasicAliasOracle, &histograms);

    let histogram = BTreeMap::from([
        (Interval::from_range(i32::MIN, -1), 3),
        (Interval::from_range(-1, 5), 2),
        (Interval::full(), 1),
    ]);
    let refined = vsa.refine(func, &histogram);
    assert_eq!(
        refined,
        BTreeMap::from([
            (Interval::singleton(-1), 3),
            (Interval::from_range(-1, 0), 3),
        ])
    );
}

#[test]
fn test_arguments_and_arithmetic_are_empty() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let source = pb.declare(m, "source", vec![], IrType::Int(32));
    let passthrough = pb.declare(m, "passthrough", vec![IrType::Int(32)], IrType::Int(32));
    let computed = pb.declare(m, "computed", vec![], IrType::Int(32));
    {
        let mut fb = pb.define(passthrough);
        let entry = fb.create_block();
        fb.switch_to(entry);
        fb.ret(Some(fb.arg(0)));
    }
    {
        let mut fb = pb.define(computed);
        let entry = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        let sum = fb.binop(BinOpKind::Add, c, Value::int(1, 32));
        fb.ret(Some(sum));
    }
    let program = pb.finish();
    let histograms = Histograms::new();

    assert!(range_of(&program, passthrough, &histograms).is_empty());
    assert!(range_of(&program, computed, &histograms).is_empty());

    let callgraph = CallGraph::from_direct_calls(&program);
    let mut vsa = FunctionVsa::new(&program, &callgraph, &BasicAliasOracle, &histograms);
    let refined = vsa.refine(
        passthrough,
        &BTreeMap::from([(Interval::singleton(-1), 2), (Interval::singleton(-2), 1)]),
    );
    assert_eq!(refined, BTreeMap::from([(Interval::empty(), 3)]));
}

#[test]
fn test_mask_and_declared_callee() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let source = pb.declare(m, "source", vec![], IrType::Int(32));
    let masked = pb.declare(m, "masked", vec![], IrType::Int(32));
    let forwarded = pb.declare(m, "forwarded", vec![], IrType::Int(32));
    {
        let mut fb = pb.define(masked);
        let entry = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        let low = fb.binop(BinOpKind::And, c, Value::int(0xff, 32));
        fb.ret(Some(low));
    }
    {
        let mut fb = pb.define(forwarded);
        let entry = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        fb.ret(Some(c));
    }
    let program = pb.finish();

    assert_eq!(
        range_of(&program, masked, &Histograms::new()).bounds(),
        Some((0, 255))
    );
    // Nothing is known about a declaration
    assert!(range_of(&program, forwarded, &Histograms::new()).is_full());

    // Unless exactly one interval was learned for it
    let histograms = Histograms::from([(
        (source, 0),
        BTreeMap::from([(Interval::from_range(i32::MIN, -1), 4)]),
    )]);
    assert_eq!(
        range_of(&program, forwarded, &histograms).bounds(),
        Some((i32::MIN as i128, -1))
    );
}

#[test]
fn test_recursion_terminates() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let func = pb.declare(m, "func", vec![IrType::Int(32)], IrType::Int(32));
    {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let again = fb.create_block();
        let fail = fb.create_block();
        fb.switch_to(entry);
        let t = fb.icmp(Predicate::Sgt, fb.arg(0), Value::int(0, 32));
        fb.branch(t, again, fail);
        fb.switch_to(again);
        let r = fb.call(func, vec![fb.arg(0)]);
        fb.ret(Some(r));
        fb.switch_to(fail);
        fb.ret(Some(Value::int(-1, 32)));
    }
    let program = pb.finish();
    assert_eq!(
        range_of(&program, func, &Histograms::new()).bounds(),
        Some((-1, -1))
    );
}

#[test]
fn test_int_max_and_stored_values() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let saturated = pb.declare(m, "saturated", vec![], IrType::Int(32));
    let stored = pb.declare(m, "stored", vec![IrType::Int(32)], IrType::Int(32));
    {
        let mut fb = pb.define(saturated);
        let entry = fb.create_block();
        fb.switch_to(entry);
        fb.ret(Some(Value::int(i32::MAX as i64, 32)));
    }
    {
        let mut fb = pb.define(stored);
        let entry = fb.create_block();
        let err = fb.create_block();
        let ok = fb.create_block();
        let join = fb.create_block();
        fb.switch_to(entry);
        let slot = fb.alloca();
        let t = fb.icmp(Predicate::Eq, fb.arg(0), Value::int(0, 32));
        fb.branch(t, err, ok);
        fb.switch_to(err);
        fb.store(slot, Value::int(-5, 32));
        fb.jump(join);
        fb.switch_to(ok);
        fb.store(slot, Value::int(0, 32));
        fb.jump(join);
        fb.switch_to(join);
        let v = fb.load(slot, IrType::Int(32));
        fb.ret(Some(v));
    }
    let program = pb.finish();

    assert!(range_of(&program, saturated, &Histograms::new()).is_full());
    assert_eq!(
        range_of(&program, stored, &Histograms::new()).bounds(),
        Some((-5, 0))
    );
}

#[test]
fn test_constant_range_casts() {
    let minus_one = ConstantRange::singleton(-1, 8);
    assert_eq!(minus_one.zero_extend(32).bounds(), Some((255, 255)));
    assert_eq!(minus_one.sign_extend(32).bounds(), Some((-1, -1)));

    let wide = ConstantRange::new(0, 300, 32);
    assert!(wide.truncate(8).is_full());
    assert_eq!(ConstantRange::new(-3, 7, 32).truncate(8).bounds(), Some((-3, 7)));

    let mixed = ConstantRange::new(-1, 1, 8);
    assert_eq!(mixed.zero_extend(16).bounds(), Some((0, 255)));

    assert!(ConstantRange::new(i32::MIN as i128, i32::MAX as i128, 32).is_full());
    assert!(ConstantRange::empty(32).union(&ConstantRange::empty(32)).is_empty());
    assert_eq!(
        ConstantRange::singleton(-4, 32)
            .union(&ConstantRange::singleton(9, 32))
            .bounds(),
        Some((-4, 9))
    );
    assert!(ConstantRange::new(0, 3, 32)
        .intersection(&ConstantRange::new(5, 9, 32))
        .is_empty());
}
