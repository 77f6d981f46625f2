use super::*;
use crate::error::IrError;

#[test]
fn test_const_int_sign_extends() {
    let c = ConstInt::new(0xff, 8);
    assert_eq!(c.value, -1);
    assert_eq!(c.as_unsigned(), 0xff);
    assert_eq!(c.as_i32(), -1);
    assert_eq!(ConstInt::new(1 << 40, 64).as_i32(), 0);
    assert!(ConstInt::bool(false).is_zero());
}

#[test]
fn test_predicate_inverse_and_evaluate() {
    let all = [
        Predicate::Eq,
        Predicate::Ne,
        Predicate::Ugt,
        Predicate::Uge,
        Predicate::Ult,
        Predicate::Ule,
        Predicate::Sgt,
        Predicate::Sge,
        Predicate::Slt,
        Predicate::Sle,
    ];
    let lhs = ConstInt::new(-1, 32);
    let rhs = ConstInt::new(0, 32);
    for pred in all {
        assert_eq!(pred.inverse().inverse(), pred);
        assert_ne!(pred.evaluate(lhs, rhs), pred.inverse().evaluate(lhs, rhs));
    }
    // -1 is the largest unsigned value
    assert!(Predicate::Ugt.evaluate(lhs, rhs));
    assert!(Predicate::Slt.evaluate(lhs, rhs));
}

#[test]
fn test_predicate_implications() {
    assert!(Predicate::Eq.implies_true(Predicate::Sle));
    assert!(Predicate::Slt.implies_true(Predicate::Ne));
    assert!(Predicate::Slt.implies_false(Predicate::Sge));
    assert!(!Predicate::Sle.implies_true(Predicate::Slt));
    assert!(Predicate::Eq.implies_false(Predicate::Ne));
}

/// `func(a)`: `c = source(); if (c < a) ret -1 else ret c`
fn small_program() -> (Program, FuncId, FuncId) {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let source = pb.declare(m, "source", vec![], IrType::Int(32));
    let func = pb.declare(m, "func", vec![IrType::Int(32)], IrType::Int(32));
    {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let err = fb.create_block();
        let ok = fb.create_block();
        fb.switch_to(entry);
        let c = fb.call(source, vec![]);
        let t = fb.icmp(Predicate::Slt, c, fb.arg(0));
        fb.branch(t, err, ok);
        fb.switch_to(err);
        fb.ret(Some(Value::int(-1, 32)));
        fb.switch_to(ok);
        fb.ret(Some(c));
    }
    (pb.finish(), source, func)
}

#[test]
fn test_program_queries() {
    let (program, source, func) = small_program();
    assert!(program.function(source).is_declaration());
    assert_eq!(program.function_by_name("func"), Some(func));
    assert_eq!(program.function_by_name("missing"), None);

    let calls: Vec<InstId> = program.calls_in(func).collect();
    assert_eq!(calls.len(), 1);
    let call = calls[0];
    assert_eq!(program.direct_callee(call), Some(source));
    assert_eq!(program.function_of(call), func);
    assert_eq!(program.position(call), 0);
    // Used by the comparison and the second return
    assert_eq!(program.users(call).len(), 2);
    assert!(program.is_call(Value::Inst(call)));
    assert_eq!(program.type_of(Value::Inst(call)), IrType::Int(32));
    assert_eq!(
        program.type_of(Value::Arg { func, index: 0 }),
        IrType::Int(32)
    );

    let entry = program.function(func).entry().unwrap();
    assert_eq!(program.successors(entry).len(), 2);
    assert!(matches!(
        program.terminator_kind(entry),
        Some(InstKind::Branch { .. })
    ));
    assert_eq!(program.returns_in(func).count(), 2);
    assert!(!program.returns_single_constant(func));
    assert!(validate_function(&program, func).is_ok());
    assert!(validate_function(&program, source).is_ok());
}

#[test]
fn test_strip_constant_offsets() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let func = pb.declare(m, "func", vec![IrType::Ptr], IrType::Void);
    let outer = {
        let mut fb = pb.define(func);
        let inner = fb.gep(fb.arg(0), Some(8));
        let cast = fb.cast(CastKind::BitCast, inner, IrType::Ptr);
        let outer = fb.gep(cast, Some(4));
        fb.ret(None);
        outer
    };
    let program = pb.finish();
    assert_eq!(
        program.strip_constant_offsets(outer),
        (Value::Arg { func, index: 0 }, 12)
    );
    let arg = Value::Arg { func, index: 0 };
    assert_eq!(program.strip_constant_offsets(arg), (arg, 0));
}

#[test]
fn test_returns_single_constant() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let func = pb.declare(m, "func", vec![IrType::Int(32)], IrType::Int(32));
    {
        let mut fb = pb.define(func);
        let entry = fb.create_block();
        let a = fb.create_block();
        let b = fb.create_block();
        fb.switch_to(entry);
        fb.switch(fb.arg(0), a, vec![(1, b)]);
        fb.switch_to(a);
        fb.ret(Some(Value::int(-12, 32)));
        fb.switch_to(b);
        fb.ret(Some(Value::int(-12, 32)));
    }
    let program = pb.finish();
    assert!(program.returns_single_constant(func));
}

#[test]
fn test_validate_rejects_malformed_blocks() {
    let mut pb = ProgramBuilder::new();
    let m = pb.add_module("m");
    let open = pb.declare(m, "open", vec![], IrType::Void);
    let early = pb.declare(m, "early", vec![], IrType::Void);
    let foreign = pb.declare(m, "foreign", vec![], IrType::Void);
    let bad_arg = pb.declare(m, "bad_arg", vec![], IrType::Int(32));
    let open_entry = {
        let mut fb = pb.define(open);
        let entry = fb.create_block();
        fb.switch_to(entry);
        fb.alloca();
        entry
    };
    let early_ret = {
        let mut fb = pb.define(early);
        let entry = fb.create_block();
        fb.switch_to(entry);
        let ret = fb.ret(None);
        fb.ret(None);
        ret
    };
    {
        let mut fb = pb.define(foreign);
        let entry = fb.create_block();
        fb.switch_to(entry);
        fb.jump(open_entry);
    }
    {
        let mut fb = pb.define(bad_arg);
        let entry = fb.create_block();
        fb.switch_to(entry);
        fb.ret(Some(fb.arg(3)));
    }
    let program = pb.finish();

    assert!(matches!(
        validate_function(&program, open),
        Err(IrError::MissingTerminator { .. })
    ));
    assert_eq!(
        validate_function(&program, early),
        Err(IrError::MisplacedTerminator {
            name: "early".into(),
            block: program.block_of(early_ret),
            inst: early_ret,
        })
    );
    assert!(matches!(
        validate_function(&program, foreign),
        Err(IrError::ForeignSuccessor { .. })
    ));
    assert!(matches!(
        validate_function(&program, bad_arg),
        Err(IrError::BadArgument { .. })
    ));
}
