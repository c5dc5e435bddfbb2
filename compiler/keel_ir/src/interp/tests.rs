use keel_bits::{ApInt, Endianness};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;
use crate::types::DataLayout;
use crate::IrBuilder;

fn layout(endianness: Endianness) -> DataLayout {
    DataLayout {
        pointer_width: 64,
        endianness,
        max_int_alignment: 8,
    }
}

/// Host that records calls and doubles its argument for `double`.
#[derive(Default)]
struct RecordingHost {
    calls: Vec<String>,
}

impl HostFunctions for RecordingHost {
    fn call(
        &mut self,
        name: &str,
        args: &[ApInt],
        _memory: &mut Memory,
    ) -> Result<Option<ApInt>, InterpError> {
        self.calls.push(name.to_string());
        match name {
            "double" => Ok(Some(args[0].wrapping_add(&args[0]))),
            "touch" => Ok(None),
            other => Err(InterpError::UnresolvedSymbol(other.to_string())),
        }
    }
}

#[test]
fn loop_with_phi_sums_range() {
    // sum(n) = 0 + 1 + ... + (n - 1)
    let mut m = Module::new("interp", layout(Endianness::Little));
    let word = m.types_mut().size_int();
    let ty = m.types_mut().func(&[word], word);
    let f = m.get_or_declare_function("sum", ty);
    let mut b = IrBuilder::new(&mut m, f);
    let entry = b.append_block("entry");
    let head = b.append_block("head");
    let body = b.append_block("body");
    let exit = b.append_block("exit");
    b.position_at_end(entry);
    let n = b.module().param(f, 0);
    let zero = b.const_size(0);
    let one = b.const_size(1);
    b.br(head);

    b.position_at_end(head);
    let i = b.phi(word, &[(zero, entry)]);
    let acc = b.phi(word, &[(zero, entry)]);
    let done = b.icmp_uge(i, n);
    b.cond_br(done, exit, body);

    b.position_at_end(body);
    let next_acc = b.add(acc, i);
    let next_i = b.add(i, one);
    b.add_incoming(i, next_i, body);
    b.add_incoming(acc, next_acc, body);
    b.br(head);

    b.position_at_end(exit);
    b.ret(acc);

    let mut interp = Interpreter::new(&m, Memory::new(m.layout()), RecordingHost::default())
        .unwrap_or_else(|e| panic!("{e}"));
    let result = interp.run(f, &[ApInt::new(64, 5)]).unwrap_or_else(|e| panic!("{e}"));
    assert_eq!(result, Some(ApInt::new(64, 10)));
}

#[test]
fn struct_stores_respect_layout_and_endianness() {
    for endianness in [Endianness::Little, Endianness::Big] {
        let mut m = Module::new("interp", layout(endianness));
        let i8_ty = m.types_mut().i8();
        let i32_ty = m.types_mut().i32();
        let word = m.types_mut().size_int();
        let pair = m.types_mut().struct_type(&[i8_ty, i32_ty]);
        let ty = m.types_mut().func(&[], word);
        let f = m.get_or_declare_function("pack", ty);
        let mut b = IrBuilder::new(&mut m, f);
        let entry = b.append_block("entry");
        b.position_at_end(entry);
        let slot = b.alloca(pair, 4, "pair");
        let first = b.struct_gep(pair, slot, 0);
        let second = b.struct_gep(pair, slot, 1);
        let a = b.const_i8(0xab);
        let c = b.const_i32(0x1234_5678);
        b.store(a, first, 1);
        b.store(c, second, 4);
        let raw = b.byte_offset_const(slot, 4);
        let i8_again = b.i8_type();
        let low = b.load(i8_again, raw, 1);
        let widened = b.zext(low, word);
        b.ret(widened);

        let mut interp = Interpreter::new(&m, Memory::new(m.layout()), RecordingHost::default())
            .unwrap_or_else(|e| panic!("{e}"));
        let result = interp.run(f, &[]).unwrap_or_else(|e| panic!("{e}"));
        let expected = if endianness.is_little() { 0x78 } else { 0x12 };
        assert_eq!(result, Some(ApInt::new(64, expected)));
    }
}

#[test]
fn declared_functions_go_to_host() {
    let mut m = Module::new("interp", layout(Endianness::Little));
    let word = m.types_mut().size_int();
    let void = m.types_mut().void();
    let unary = m.types_mut().func(&[word], word);
    let nullary = m.types_mut().func(&[], void);
    let double = m.get_or_declare_function("double", unary);
    let touch_ty = nullary;
    let f = m.get_or_declare_function("twice", unary);
    let mut b = IrBuilder::new(&mut m, f);
    let entry = b.append_block("entry");
    b.position_at_end(entry);
    let x = b.module().param(f, 0);
    let y = b.call(double, &[x]);
    let ptr = b.module().param(f, 0);
    let target = b.int_to_ptr(ptr);
    b.call_indirect(touch_ty, target, &[]);
    b.ret(y);

    let mut memory = Memory::new(m.layout());
    let touch_addr = memory.host_symbol("touch");
    let mut interp =
        Interpreter::new(&m, memory, RecordingHost::default()).unwrap_or_else(|e| panic!("{e}"));
    let result = interp
        .run(f, &[ApInt::new(64, touch_addr)])
        .unwrap_or_else(|e| panic!("{e}"));
    // The doubled argument is the symbol address times two.
    assert_eq!(result, Some(ApInt::new(64, touch_addr * 2)));
    assert_eq!(interp.host().calls, vec!["double".to_string(), "touch".to_string()]);
}

#[test]
fn unreachable_and_faults_are_errors() {
    let mut m = Module::new("interp", layout(Endianness::Little));
    let word = m.types_mut().size_int();
    let void = m.types_mut().void();
    let ty = m.types_mut().func(&[word], void);
    let f = m.get_or_declare_function("fault", ty);
    let mut b = IrBuilder::new(&mut m, f);
    let entry = b.append_block("entry");
    let bad = b.append_block("bad");
    let load = b.append_block("load");
    b.position_at_end(entry);
    let x = b.module().param(f, 0);
    let zero = b.const_size(0);
    let is_zero = b.icmp_eq(x, zero);
    b.cond_br(is_zero, bad, load);
    b.position_at_end(bad);
    b.unreachable();
    b.position_at_end(load);
    let p = b.int_to_ptr(x);
    b.load(word, p, 8);
    b.ret_void();

    let mut interp = Interpreter::new(&m, Memory::new(m.layout()), RecordingHost::default())
        .unwrap_or_else(|e| panic!("{e}"));
    assert!(matches!(
        interp.run(f, &[ApInt::new(64, 0)]),
        Err(InterpError::Unreachable { .. })
    ));
    assert_eq!(
        interp.run(f, &[ApInt::new(64, 8)]),
        Err(InterpError::OutOfBounds { addr: 8, len: 8 })
    );
}

#[test]
fn globals_are_materialized() {
    let mut m = Module::new("interp", layout(Endianness::Little));
    let g = m.add_global_string("greeting", "hi");
    let interp = Interpreter::new(&m, Memory::new(m.layout()), RecordingHost::default())
        .unwrap_or_else(|e| panic!("{e}"));
    let addr = interp.global_address(g);
    assert_eq!(interp.memory().read_c_string(addr).ok(), Some("hi".to_string()));
}

#[test]
fn step_limit_stops_infinite_loops() {
    let mut m = Module::new("interp", layout(Endianness::Little));
    let void = m.types_mut().void();
    let ty = m.types_mut().func(&[], void);
    let f = m.get_or_declare_function("spin", ty);
    let mut b = IrBuilder::new(&mut m, f);
    let entry = b.append_block("entry");
    b.position_at_end(entry);
    let word = b.size_type();
    let slot = b.alloca(word, 8, "slot");
    let one = b.const_size(1);
    b.store(one, slot, 8);
    b.br(entry);
    let mut interp = Interpreter::new(&m, Memory::new(m.layout()), RecordingHost::default())
        .unwrap_or_else(|e| panic!("{e}"))
        .with_step_limit(100);
    assert_eq!(interp.run(f, &[]), Err(InterpError::StepLimit(100)));
}

/// Define `round_trip(p: ptr, v: iN) -> iN` storing `v` at `p` and loading
/// it back.
fn define_store_load(m: &mut Module, bits: u32) -> FunctionId {
    let ptr = m.types_mut().ptr();
    let int = m.types_mut().int(bits);
    let ty = m.types_mut().func(&[ptr, int], int);
    let f = m.get_or_declare_function("round_trip", ty);
    let mut b = IrBuilder::new(m, f);
    let entry = b.append_block("entry");
    b.position_at_end(entry);
    let p = b.module().param(f, 0);
    let v = b.module().param(f, 1);
    b.store(v, p, 1);
    let back = b.load(int, p, 1);
    b.ret(back);
    f
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stored_integers_load_back_in_target_byte_order(
        bits in prop::sample::select(vec![8u32, 16, 24, 32, 64, 96, 128]),
        low in any::<u64>(),
        high in any::<u64>(),
        big in any::<bool>(),
    ) {
        let endianness = if big { Endianness::Big } else { Endianness::Little };
        let mut m = Module::new("interp", layout(endianness));
        let f = define_store_load(&mut m, bits);
        let value = ApInt::from_words(bits, &[low, high]);

        let mut memory = Memory::new(m.layout());
        let addr = memory.alloc(16, 16);
        let mut interp = Interpreter::new(&m, memory, RecordingHost::default())
            .unwrap_or_else(|e| panic!("{e}"));
        let result = interp
            .run(f, &[ApInt::new(64, addr), value.clone()])
            .unwrap_or_else(|e| panic!("{e}"));
        prop_assert_eq!(result, Some(value));

        let mut expected: Vec<u8> = low
            .to_le_bytes()
            .into_iter()
            .chain(high.to_le_bytes())
            .take((bits / 8) as usize)
            .collect();
        if big {
            expected.reverse();
        }
        let stored = interp
            .memory()
            .read_bytes(addr, u64::from(bits / 8))
            .unwrap_or_else(|e| panic!("{e}"));
        prop_assert_eq!(stored, expected.as_slice());
    }
}
