use keel_bits::{ApInt, BitPatternBuilder, Endianness};
use keel_ir::{FunctionId, Interpreter, Memory};
use pretty_assertions::assert_eq;
use proptest::prelude::*;

use super::*;
use crate::context::LayoutContext;
use crate::test_runtime::{context, TestRuntime};

const ENDIANS: [Endianness; 2] = [Endianness::Little, Endianness::Big];

/// The bytes of `pattern` as a payload area holds them.
fn pattern_bytes(pattern: &ApInt, endian: Endianness) -> Vec<u8> {
    let n = pattern.width() / 8;
    (0..n)
        .map(|i| {
            let index = if endian.is_little() { i } else { n - 1 - i };
            pattern.extract_bits(8, index * 8).low_u64() as u8
        })
        .collect()
}

fn wide(words: &[u64], width: u32) -> ApInt {
    ApInt::from_words(width, words)
}

/// Define `name(input: ptr, output: ptr, scalar: word) -> word`.
fn define(
    ctx: &mut LayoutContext,
    name: &str,
    emit: impl FnOnce(&mut IrGenFunction<'_>, [ValueId; 3]),
) -> FunctionId {
    let ptr = ctx.module_mut().types_mut().ptr();
    let word = ctx.module_mut().types_mut().size_int();
    let f = ctx.define_function(name, &[ptr, ptr, word], word);
    let mut igf = ctx.function(f);
    let params = [0, 1, 2].map(|i| igf.builder.module().param(f, i));
    emit(&mut igf, params);
    f
}

/// Run `f` on a copy of `input`, returning its result and `output_len` bytes
/// of the output buffer.
fn run(ctx: &LayoutContext, f: FunctionId, input: &[u8], output_len: u64, scalar: u64) -> (u64, Vec<u8>) {
    let module = ctx.module();
    let mut memory = Memory::new(module.layout());
    let input_addr = memory.alloc(input.len().max(1) as u64, 16);
    memory.write_bytes(input_addr, input).unwrap_or_else(|e| panic!("{e}"));
    let output_addr = memory.alloc(output_len.max(1), 16);
    let mut interp =
        Interpreter::new(module, memory, TestRuntime::default()).unwrap_or_else(|e| panic!("{e}"));
    let result = interp
        .run(
            f,
            &[
                ApInt::new(64, input_addr),
                ApInt::new(64, output_addr),
                ApInt::new(64, scalar),
            ],
        )
        .unwrap_or_else(|e| panic!("{e}"))
        .map_or(0, |v| v.low_u64());
    let output = interp
        .memory()
        .read_bytes(output_addr, output_len)
        .unwrap_or_else(|e| panic!("{e}"))
        .to_vec();
    (result, output)
}

fn ret_zero(igf: &mut IrGenFunction<'_>) {
    let zero = igf.builder.const_size(0);
    igf.builder.ret(zero);
}

fn ret_word(igf: &mut IrGenFunction<'_>, value: ValueId) {
    let word = igf.builder.size_type();
    let value = igf.builder.zext_or_trunc(value, word);
    igf.builder.ret(value);
}

#[test]
fn schema_chunks_into_words_and_remainder() {
    let schema = EnumPayloadSchema::fixed(130);
    assert_eq!(schema.element_widths(64).to_vec(), vec![64, 64, 2]);
    assert_eq!(EnumPayloadSchema::fixed(64).element_widths(64).to_vec(), vec![64]);
    assert_eq!(EnumPayloadSchema::fixed(24).element_widths(32).to_vec(), vec![24]);
    assert!(EnumPayloadSchema::fixed(0).element_widths(64).is_empty());

    let mut ctx = context(Endianness::Little);
    let types = ctx.module_mut().types_mut();
    let mut widths = Vec::new();
    schema.for_each_type(types, |ty| widths.push(ty));
    let widths: Vec<Option<u32>> = widths.iter().map(|ty| types.int_width(*ty)).collect();
    assert_eq!(widths, vec![Some(64), Some(64), Some(2)]);
}

#[test]
#[should_panic(expected = "dynamic payload schema")]
fn dynamic_schema_has_no_words() {
    EnumPayloadSchema::dynamic().element_widths(64);
}

#[test]
fn zero_payload_stays_lazy_until_forced() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "lazy", |igf, _| {
        let payload = EnumPayload::zero(igf, EnumPayloadSchema::fixed(72));
        assert!(payload.elements().iter().all(|e| e.is_zero()));
        let values = payload.explode(igf);
        assert_eq!(values.len(), 2);
        assert!(values.iter().all(|v| igf.builder.const_u64(*v) == Some(0)));
        ret_zero(igf);
    });
}

#[test]
fn bit_pattern_stores_as_memory_bytes() {
    for endian in ENDIANS {
        let mut ctx = context(endian);
        let pattern = wide(&[0x0807_0605_0403_0201, 0x0c0b_0a09], 96);
        let f = define(&mut ctx, "store_pattern", |igf, [_, out, _]| {
            let payload = EnumPayload::from_bit_pattern(igf, &pattern, EnumPayloadSchema::fixed(96));
            payload.store(igf, Address::new(out, 8));
            ret_zero(igf);
        });
        let (_, bytes) = run(&ctx, f, &[], 12, 0);
        assert_eq!(bytes, pattern_bytes(&pattern, endian), "{endian:?}");
    }
}

#[test]
fn load_then_store_copies_payload() {
    for endian in ENDIANS {
        let mut ctx = context(endian);
        let f = define(&mut ctx, "copy", |igf, [input, out, _]| {
            let payload = EnumPayload::load(igf, Address::new(input, 8), EnumPayloadSchema::fixed(88));
            payload.store(igf, Address::new(out, 8));
            ret_zero(igf);
        });
        let input: Vec<u8> = (1..=11).collect();
        let (_, bytes) = run(&ctx, f, &input, 11, 0);
        assert_eq!(bytes, input);
    }
}

#[test]
fn switch_on_gathered_bits() {
    for endian in ENDIANS {
        let mut ctx = context(endian);
        // Tag in the top byte of the first word and bit 0 of the second.
        let mask = wide(&[0xff00_0000_0000_0000, 0x1], 128);
        let cases = [
            wide(&[0x0100_0000_0000_0000, 0x0], 128),
            wide(&[0x0200_0000_0000_0000, 0x1], 128),
            wide(&[0x0, 0x1], 128),
        ];
        let f = define(&mut ctx, "switch", |igf, [input, _, _]| {
            let payload = EnumPayload::load(igf, Address::new(input, 8), EnumPayloadSchema::fixed(128));
            let blocks: Vec<BlockId> = (0..3).map(|_| igf.builder.append_block("case")).collect();
            let default = igf.builder.append_block("default");
            let table: Vec<(ApInt, BlockId)> =
                cases.iter().cloned().zip(blocks.iter().copied()).collect();
            payload.emit_switch(igf, &mask, &table, default, false);
            for (i, block) in blocks.iter().enumerate() {
                igf.builder.position_at_end(*block);
                let v = igf.builder.const_size(i as u64);
                igf.builder.ret(v);
            }
            igf.builder.position_at_end(default);
            let v = igf.builder.const_size(99);
            igf.builder.ret(v);
        });
        let junk = wide(&[0x00aa_bbcc_ddee_ff11, 0x2233_4455_6677_8800], 128);
        for (i, case) in cases.iter().enumerate() {
            let value = &(&junk & &!&mask) | case;
            let (result, _) = run(&ctx, f, &pattern_bytes(&value, endian), 0, 0);
            assert_eq!(result, i as u64, "{endian:?} case {i}");
        }
        let (result, _) = run(&ctx, f, &pattern_bytes(&junk, endian), 0, 0);
        assert_eq!(result, 99);
    }
}

#[test]
fn wide_masks_switch_through_a_compare_chain() {
    for endian in ENDIANS {
        let mut ctx = context(endian);
        let mask = wide(&[0xf, 0, 0xf0], 192);
        let cases = [wide(&[0x1, 0, 0x10], 192), wide(&[0x2, 0, 0x10], 192)];
        let f = define(&mut ctx, "chain", |igf, [input, _, _]| {
            let payload = EnumPayload::load(igf, Address::new(input, 8), EnumPayloadSchema::fixed(192));
            let first = igf.builder.append_block("first");
            let second = igf.builder.append_block("second");
            let default = igf.builder.append_block("default");
            let table = vec![(cases[0].clone(), first), (cases[1].clone(), second)];
            payload.emit_switch(igf, &mask, &table, default, false);
            for (block, value) in [(first, 1), (second, 2), (default, 0)] {
                igf.builder.position_at_end(block);
                let v = igf.builder.const_size(value);
                igf.builder.ret(v);
            }
        });
        for (i, case) in cases.iter().enumerate() {
            let (result, _) = run(&ctx, f, &pattern_bytes(case, endian), 0, 0);
            assert_eq!(result, i as u64 + 1);
        }
    }
}

#[test]
fn single_case_with_unreachable_default_is_a_branch() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "single", |igf, [input, _, _]| {
        let payload = EnumPayload::load(igf, Address::new(input, 8), EnumPayloadSchema::fixed(64));
        let only = igf.builder.append_block("only");
        let default = igf.builder.append_block("default");
        let entry = igf.builder.current_block();
        payload.emit_switch(igf, &ApInt::new(64, 0xff), &[(ApInt::new(64, 3), only)], default, true);
        let terminator = entry.and_then(|b| igf.builder.module().block(b).terminator.clone());
        assert_eq!(terminator, Some(keel_ir::Terminator::Br(only)));
        igf.builder.position_at_end(only);
        ret_zero(igf);
        igf.builder.position_at_end(default);
        igf.builder.unreachable();
    });
}

#[test]
fn compare_with_empty_mask_is_true() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "trivial", |igf, [input, _, _]| {
        let payload = EnumPayload::load(igf, Address::new(input, 8), EnumPayloadSchema::fixed(64));
        let cmp = payload.emit_compare(igf, &ApInt::zero(64), &ApInt::zero(64));
        assert_eq!(igf.builder.const_u64(cmp), Some(1));
        ret_zero(igf);
    });
}

#[test]
fn or_mask_adopts_constants_into_zero_words() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "or", |igf, _| {
        let mut payload = EnumPayload::zero(igf, EnumPayloadSchema::fixed(128));
        payload.emit_apply_or_mask(igf, &wide(&[0, 0x80], 128));
        assert!(payload.elements()[0].is_zero());
        let LazyValue::Concrete(v) = payload.elements()[1] else {
            panic!("second word should be concrete");
        };
        assert_eq!(igf.builder.const_u64(v), Some(0x80));
        // Clearing the whole word makes it lazy again.
        payload.emit_apply_and_mask(igf, &wide(&[u64::MAX, 0], 128));
        assert!(payload.elements()[1].is_zero());
        ret_zero(igf);
    });
}

#[test]
fn payload_or_merges_words() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "or_payload", |igf, _| {
        let schema = EnumPayloadSchema::fixed(128);
        let mut lhs = EnumPayload::from_bit_pattern(igf, &wide(&[0x0f, 0], 128), schema);
        let rhs = EnumPayload::from_bit_pattern(igf, &wide(&[0xf0, 0x1], 128), schema);
        lhs.emit_apply_or_mask_payload(igf, &rhs);
        let words: Vec<Option<u64>> = lhs.explode(igf).iter().map(|v| igf.builder.const_u64(*v)).collect();
        assert_eq!(words, vec![Some(0xff), Some(0x1)]);
        ret_zero(igf);
    });
}

#[test]
#[should_panic(expected = "different schemas")]
fn payload_or_rejects_mismatched_schemas() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "mismatch", |igf, _| {
        let mut lhs = EnumPayload::zero(igf, EnumPayloadSchema::fixed(128));
        let rhs = EnumPayload::zero(igf, EnumPayloadSchema::fixed(64));
        lhs.emit_apply_or_mask_payload(igf, &rhs);
    });
}

#[test]
#[should_panic(expected = "mask of 64 bits applied to a 128-bit payload")]
fn masks_must_cover_the_whole_payload() {
    let mut ctx = context(Endianness::Big);
    define(&mut ctx, "narrow_mask", |igf, _| {
        let mut payload = EnumPayload::zero(igf, EnumPayloadSchema::fixed(128));
        payload.emit_apply_or_mask(igf, &ApInt::new(64, 1));
    });
}

#[test]
#[should_panic(expected = "mask of 136 bits applied to a 128-bit payload")]
fn masks_wider_than_the_payload_are_rejected() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "wide_mask", |igf, _| {
        let mut payload = EnumPayload::zero(igf, EnumPayloadSchema::fixed(128));
        payload.emit_apply_and_mask(igf, &ApInt::zero(136));
    });
}

#[test]
fn gather_reads_zero_words_as_zero_bits() {
    for endian in ENDIANS {
        let mut ctx = context(endian);
        // One spare bit per word; only the second word is ever written.
        let mask = wide(&[1, 1], 128);
        let f = define(&mut ctx, "gather_zero", |igf, _| {
            let schema = EnumPayloadSchema::fixed(128);
            let mut payload = EnumPayload::zero(igf, schema);
            let second_word = if endian.is_little() { wide(&[0, 1], 128) } else { wide(&[1, 0], 128) };
            payload.emit_apply_or_mask(igf, &second_word);
            let gathered = payload.emit_gather_spare_bits(igf, &mask, 0, 2);
            ret_word(igf, gathered);
        });
        let (result, _) = run(&ctx, f, &[], 0, 0);
        // The set bit is the mask's higher one in integer order.
        let expected = if endian.is_little() { 0b10 } else { 0b01 };
        assert_eq!(result, expected, "{endian:?}");
    }
}

#[test]
fn pack_and_unpack_across_word_boundaries() {
    for endian in ENDIANS {
        let mut ctx = context(endian);
        let f = define(&mut ctx, "pack", |igf, [input, out, _]| {
            let inner_schema = EnumPayloadSchema::fixed(64);
            let inner = EnumPayload::load(igf, Address::new(input, 8), inner_schema);
            let mut outer = EnumPayload::zero(igf, EnumPayloadSchema::fixed(128));
            inner.pack_into_enum_payload(igf, &mut outer, 32);
            outer.store(igf, Address::new(out, 8));
            let back = EnumPayload::unpack_from_enum_payload(igf, &outer, 32, inner_schema);
            let [word] = back.explode(igf)[..] else {
                panic!("one word expected");
            };
            igf.builder.ret(word);
        });
        let input = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let (result, bytes) = run(&ctx, f, &input, 16, 0);
        let expected = if endian.is_little() {
            u64::from_le_bytes(input)
        } else {
            u64::from_be_bytes(input)
        };
        assert_eq!(result, expected);
        assert_eq!(&bytes[4..12], &input);
        assert!(bytes[..4].iter().chain(&bytes[12..]).all(|b| *b == 0));
    }
}

#[test]
fn display_lists_words() {
    let mut ctx = context(Endianness::Little);
    define(&mut ctx, "display", |igf, _| {
        let schema = EnumPayloadSchema::fixed(80);
        let mut payload = EnumPayload::zero(igf, schema);
        payload.emit_apply_or_mask(igf, &wide(&[0x2a, 0], 80));
        let text = payload.display(igf.builder.module()).to_string();
        assert_eq!(text, "value: i64 42\ntype: i16\n");
        ret_zero(igf);
    });
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

fn endian() -> impl Strategy<Value = Endianness> {
    prop_oneof![Just(Endianness::Little), Just(Endianness::Big)]
}

fn pattern(width: u32) -> impl Strategy<Value = ApInt> {
    proptest::collection::vec(any::<u64>(), width.div_ceil(64) as usize)
        .prop_map(move |words| ApInt::from_words(width, &words))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn bit_pattern_round_trips(endian in endian(), bytes in 1u32..=24, seed in any::<[u64; 3]>()) {
        let width = bytes * 8;
        let value = ApInt::from_words(width, &seed);
        let mut ctx = context(endian);
        let mut words = Vec::new();
        define(&mut ctx, "round_trip", |igf, _| {
            let payload = EnumPayload::from_bit_pattern(igf, &value, EnumPayloadSchema::fixed(u64::from(width)));
            words = payload.explode(igf).iter().map(|v| igf.builder.const_value(*v)).collect();
            ret_zero(igf);
        });
        let mut builder = BitPatternBuilder::new(endian);
        for word in &words {
            let Some(word) = word else { panic!("pattern words must be constants") };
            builder.append(word);
        }
        prop_assert_eq!(builder.build(), Some(value));
    }

    #[test]
    fn and_mask_is_idempotent(endian in endian(), value in pattern(128), mask in pattern(128)) {
        let mut ctx = context(endian);
        let schema = EnumPayloadSchema::fixed(128);
        let f = define(&mut ctx, "and_twice", |igf, [input, out, _]| {
            let mut payload = EnumPayload::load(igf, Address::new(input, 8), schema);
            payload.emit_apply_and_mask(igf, &mask);
            payload.store(igf, Address::new(out, 8));
            payload.emit_apply_and_mask(igf, &mask);
            let second = igf.builder.byte_offset_const(out, 16);
            payload.store(igf, Address::new(second, 8));
            ret_zero(igf);
        });
        let (_, bytes) = run(&ctx, f, &pattern_bytes(&value, endian), 32, 0);
        prop_assert_eq!(&bytes[..16], &bytes[16..]);
        prop_assert_eq!(bytes[..16].to_vec(), pattern_bytes(&(&value & &mask), endian));
    }

    #[test]
    fn compare_matches_masked_value(endian in endian(), value in pattern(128), mask in pattern(128)) {
        prop_assume!(!mask.is_zero());
        let expected = &value & &mask;
        let mut flipped = expected.clone();
        let lowest = (0..128).find(|b| mask.bit(*b)).unwrap_or(0);
        if flipped.bit(lowest) { flipped.clear_bit(lowest) } else { flipped.set_bit(lowest) }
        let mut ctx = context(endian);
        let f = define(&mut ctx, "compare", |igf, [input, _, _]| {
            let payload = EnumPayload::load(igf, Address::new(input, 8), EnumPayloadSchema::fixed(128));
            let equal = payload.emit_compare(igf, &mask, &expected);
            let different = payload.emit_compare(igf, &mask, &flipped);
            let word = igf.builder.size_type();
            let equal = igf.builder.zext(equal, word);
            let different = igf.builder.zext(different, word);
            let different = igf.builder.shl_const(different, 1);
            let both = igf.builder.or(equal, different);
            igf.builder.ret(both);
        });
        let (result, _) = run(&ctx, f, &pattern_bytes(&value, endian), 0, 0);
        prop_assert_eq!(result, 1);
    }

    #[test]
    fn insert_then_extract_returns_value(
        endian in endian(),
        junk in pattern(128),
        size in 1u32..=8,
        offset in 0u32..=8,
        x in any::<u64>(),
    ) {
        let bits = size * 8;
        let bit_offset = offset * 8;
        let mut ctx = context(endian);
        let f = define(&mut ctx, "insert_extract", |igf, [input, out, scalar]| {
            let schema = EnumPayloadSchema::fixed(128);
            let mut payload = EnumPayload::load(igf, Address::new(input, 8), schema);
            let ty = igf.builder.int_type(bits);
            let value = igf.builder.zext_or_trunc(scalar, ty);
            payload.insert_value(igf, value, bit_offset, None);
            payload.store(igf, Address::new(out, 8));
            let back = payload.extract_value(igf, ty, bit_offset);
            ret_word(igf, back);
        });
        let input = pattern_bytes(&junk, endian);
        let (result, bytes) = run(&ctx, f, &input, 16, x);
        let expected = ApInt::new(64, x).trunc(bits).low_u64();
        prop_assert_eq!(result, expected);
        let start = offset as usize;
        let end = start + size as usize;
        prop_assert_eq!(&bytes[..start], &input[..start]);
        prop_assert_eq!(&bytes[end..], &input[end..]);
    }

    #[test]
    fn gather_inverts_scatter(endian in endian(), mask in pattern(128), x in any::<u64>()) {
        let mask = keel_bits::get_lowest_n_set_bits(&mask, 64);
        let n = mask.count_ones();
        prop_assume!(n > 0);
        let mut ctx = context(endian);
        let f = define(&mut ctx, "scatter_gather", |igf, [_, _, scalar]| {
            let mut payload = EnumPayload::zero(igf, EnumPayloadSchema::fixed(128));
            let ty = igf.builder.int_type(n);
            let value = igf.builder.zext_or_trunc(scalar, ty);
            payload.emit_scatter_bits(igf, &mask, value);
            let back = payload.emit_gather_spare_bits(igf, &mask, 0, n);
            ret_word(igf, back);
        });
        let (result, _) = run(&ctx, f, &[], 0, x);
        prop_assert_eq!(result, ApInt::new(64, x).trunc(n).low_u64());
    }
}
