use keel_bits::{ApInt, Endianness};
use pretty_assertions::assert_eq;

use super::*;
use crate::module::Terminator;
use crate::types::DataLayout;

fn module() -> Module {
    Module::new(
        "builder_test",
        DataLayout {
            pointer_width: 64,
            endianness: Endianness::Little,
            max_int_alignment: 8,
        },
    )
}

/// Declare `test_fn(i64) -> i64` and return it with its entry block.
fn setup(m: &mut Module) -> (FunctionId, BlockId) {
    let word = m.types_mut().size_int();
    let ty = m.types_mut().func(&[word], word);
    let f = m.get_or_declare_function("test_fn", ty);
    let entry = m.append_block(f, "entry");
    (f, entry)
}

// -- Constant folding --

#[test]
fn arithmetic_on_constants_folds() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    b.position_at_end(entry);
    let x = b.const_size(0x30);
    let y = b.const_size(0x0c);
    let sum = b.add(x, y);
    let masked = b.and(sum, x);
    let shifted = b.shl_const(masked, 4);
    assert_eq!(b.const_u64(sum), Some(0x3c));
    assert_eq!(b.const_u64(masked), Some(0x30));
    assert_eq!(b.const_u64(shifted), Some(0x300));
    assert!(m.block(entry).insts.is_empty());
}

#[test]
fn identities_do_not_emit() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    b.position_at_end(entry);
    let p = b.module().param(f, 0);
    let zero = b.const_size(0);
    let ones = b.const_size(u64::MAX);
    assert_eq!(b.or(p, zero), p);
    assert_eq!(b.and(p, ones), p);
    assert_eq!(b.lshr_const(p, 0), p);
    assert!(m.block(entry).insts.is_empty());
}

#[test]
fn icmp_folds_to_i1() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    b.position_at_end(entry);
    let a = b.const_i32(3);
    let c = b.const_i32(7);
    let lt = b.icmp_ult(a, c);
    assert_eq!(b.const_value(lt), Some(ApInt::new(1, 1)));
}

#[test]
fn casts_of_constants_fold() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    b.position_at_end(entry);
    let i8_ty = b.i8_type();
    let word = b.const_size(0x1ff);
    let narrow = b.trunc(word, i8_ty);
    assert_eq!(b.const_u64(narrow), Some(0xff));
    let ptr = b.int_to_ptr(narrow);
    assert!(b.module().types().is_ptr(b.type_of(ptr)));
}

// -- Control flow --

#[test]
fn constant_condition_becomes_branch() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    let yes = b.append_block("yes");
    let no = b.append_block("no");
    b.position_at_end(entry);
    let t = b.const_bool(true);
    b.cond_br(t, yes, no);
    assert!(b.is_terminated());
    assert_eq!(m.block(entry).terminator, Some(Terminator::Br(yes)));
}

#[test]
#[should_panic(expected = "duplicate switch case")]
fn duplicate_switch_cases_panic() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    let other = b.append_block("other");
    b.position_at_end(entry);
    let p = b.module().param(f, 0);
    b.switch(
        p,
        other,
        vec![(ApInt::new(64, 1), other), (ApInt::new(64, 1), other)],
    );
}

#[test]
#[should_panic(expected = "terminated block")]
fn emitting_after_terminator_panics() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    b.position_at_end(entry);
    let p = b.module().param(f, 0);
    b.ret(p);
    b.add(p, p);
}

#[test]
fn allocas_gather_in_entry_block() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    b.position_at_end(entry);
    let p = b.module().param(f, 0);
    let sum = b.add(p, p);
    let word = b.size_type();
    let slot = b.alloca(word, 8, "slot");
    let insts = &m.block(entry).insts;
    assert_eq!(insts.first(), Some(&slot));
    assert_eq!(insts.last(), Some(&sum));
}

#[test]
fn phis_go_first() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let mut b = IrBuilder::new(&mut m, f);
    let join = b.append_block("join");
    b.position_at_end(entry);
    let p = b.module().param(f, 0);
    b.br(join);
    b.position_at_end(join);
    let doubled = b.add(p, p);
    let word = b.size_type();
    let phi = b.phi(word, &[(p, entry)]);
    b.add_incoming(phi, doubled, join);
    assert_eq!(m.block(join).insts.first(), Some(&phi));
}

// -- Nested builders --

#[test]
fn nested_builder_restores_outer_position() {
    let mut m = module();
    let (f, entry) = setup(&mut m);
    let void = m.types_mut().void();
    let helper_ty = m.types_mut().func(&[], void);
    let helper = m.get_or_declare_function("helper", helper_ty);
    let mut b = IrBuilder::new(&mut m, f);
    b.position_at_end(entry);
    let saved = b.insert_point();
    {
        let mut inner = b.nested(helper);
        let body = inner.append_block("entry");
        inner.position_at_end(body);
        inner.ret_void();
    }
    assert_eq!(b.insert_point(), saved);
    b.call(helper, &[]);
    let p = b.module().param(f, 0);
    b.ret(p);
    assert!(!m.function(helper).is_declaration());
}
