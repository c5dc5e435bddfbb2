use pretty_assertions::assert_eq;

use super::ApInt;

// -- Construction --

#[test]
fn new_truncates_to_width() {
    let v = ApInt::new(8, 0x1ff);
    assert_eq!(v.to_u64(), Some(0xff));
    assert_eq!(v.width(), 8);
}

#[test]
fn all_ones_clears_bits_above_width() {
    let v = ApInt::all_ones(70);
    assert_eq!(v.words(), &[u64::MAX, 0x3f]);
    assert!(v.is_all_ones());
    assert_eq!(v.count_ones(), 70);
}

#[test]
fn zero_width_is_empty() {
    let v = ApInt::zero(0);
    assert!(v.is_zero());
    assert_eq!(v.words().len(), 0);
    assert_eq!(v.to_u64(), Some(0));
}

#[test]
fn low_bits_set_spans_words() {
    let v = ApInt::low_bits_set(128, 66);
    assert_eq!(v.words(), &[u64::MAX, 0b11]);
}

// -- Bits --

#[test]
fn set_and_clear_bits() {
    let mut v = ApInt::zero(130);
    v.set_bit(129);
    v.set_bit(3);
    assert!(v.bit(129));
    assert!(v.bit(3));
    assert_eq!(v.count_ones(), 2);
    assert_eq!(v.active_bits(), 130);
    v.clear_bit(129);
    assert_eq!(v.to_u64(), Some(8));
}

#[test]
fn to_u64_rejects_wide_values() {
    let v = ApInt::new(128, 5).shl(64);
    assert_eq!(v.to_u64(), None);
    assert_eq!(v.low_u64(), 0);
}

// -- Shifts --

#[test]
fn shl_crosses_word_boundary() {
    let v = ApInt::new(128, 0x8000_0000_0000_0001).shl(1);
    assert_eq!(v.words(), &[2, 1]);
}

#[test]
fn lshr_crosses_word_boundary() {
    let v = ApInt::from_words(128, &[0, 1]).lshr(1);
    assert_eq!(v.words(), &[0x8000_0000_0000_0000, 0]);
}

#[test]
fn shifts_by_width_produce_zero() {
    let v = ApInt::all_ones(32);
    assert!(v.shl(32).is_zero());
    assert!(v.lshr(40).is_zero());
}

// -- Ranges --

#[test]
fn extract_and_insert_bits() {
    let mut v = ApInt::new(32, 0x1234_5678);
    assert_eq!(v.extract_bits(8, 8).to_u64(), Some(0x56));
    v.insert_bits(&ApInt::new(8, 0xab), 16);
    assert_eq!(v.to_u64(), Some(0x12ab_5678));
}

#[test]
fn insert_bits_across_words() {
    let mut v = ApInt::zero(128);
    v.insert_bits(&ApInt::new(16, 0xffff), 56);
    assert_eq!(v.words(), &[0xff00_0000_0000_0000, 0xff]);
}

#[test]
fn zext_and_trunc() {
    let v = ApInt::new(16, 0xbeef);
    assert_eq!(v.zext(96).trunc(8).to_u64(), Some(0xef));
    assert_eq!(v.zext_or_trunc(4).to_u64(), Some(0xf));
}

// -- Arithmetic --

#[test]
fn add_carries_between_words() {
    let a = ApInt::from_words(128, &[u64::MAX, 0]);
    let b = ApInt::new(128, 1);
    assert_eq!(a.wrapping_add(&b).words(), &[0, 1]);
}

#[test]
fn sub_wraps_around() {
    let a = ApInt::new(8, 1);
    let b = ApInt::new(8, 2);
    assert_eq!(a.wrapping_sub(&b).to_u64(), Some(0xff));
}

#[test]
fn mul_truncates() {
    let a = ApInt::new(16, 0x1234);
    let b = ApInt::new(16, 0x100);
    assert_eq!(a.wrapping_mul(&b).to_u64(), Some(0x3400));
}

#[test]
fn mul_wide() {
    let a = ApInt::from_words(128, &[u64::MAX, 0]);
    let b = ApInt::new(128, 2);
    assert_eq!(a.wrapping_mul(&b).words(), &[u64::MAX - 1, 1]);
}

#[test]
fn unsigned_compare() {
    let small = ApInt::new(128, 7);
    let big = ApInt::from_words(128, &[0, 1]);
    assert!(small.ult(&big));
    assert!(!big.ult(&small));
}

// -- Bitwise --

#[test]
fn bitwise_ops() {
    let a = ApInt::new(8, 0b1100);
    let b = ApInt::new(8, 0b1010);
    assert_eq!((&a & &b).to_u64(), Some(0b1000));
    assert_eq!((&a | &b).to_u64(), Some(0b1110));
    assert_eq!((&a ^ &b).to_u64(), Some(0b0110));
    assert_eq!((!&a).to_u64(), Some(0b1111_0011));
}

#[test]
#[should_panic(expected = "mismatched widths")]
fn mismatched_widths_panic() {
    let _ = &ApInt::new(8, 1) & &ApInt::new(16, 1);
}

// -- Formatting --

#[test]
fn display_and_debug() {
    assert_eq!(ApInt::new(32, 42).to_string(), "42");
    assert_eq!(ApInt::new(64, 0xdead_beef).to_string(), "0xdeadbeef");
    assert_eq!(
        format!("{:?}", ApInt::from_words(128, &[1, 2])),
        "i128 0x20000000000000001"
    );
}

// === Property tests ===

#[allow(
    clippy::disallowed_types,
    reason = "proptest macros internally use Arc"
)]
mod proptest_apint {
    use super::ApInt;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn add_matches_u64(a in any::<u64>(), b in any::<u64>()) {
            let sum = ApInt::new(64, a).wrapping_add(&ApInt::new(64, b));
            prop_assert_eq!(sum.to_u64(), Some(a.wrapping_add(b)));
        }

        #[test]
        fn mul_matches_u64(a in any::<u64>(), b in any::<u64>()) {
            let product = ApInt::new(64, a).wrapping_mul(&ApInt::new(64, b));
            prop_assert_eq!(product.to_u64(), Some(a.wrapping_mul(b)));
        }

        #[test]
        fn shl_then_lshr_keeps_low_bits(lo in any::<u64>(), shift in 0u32..64) {
            let v = ApInt::new(128, lo);
            prop_assert_eq!(v.shl(shift).lshr(shift), v);
        }

        #[test]
        fn insert_then_extract(
            base in any::<u64>(),
            value in any::<u16>(),
            pos in 0u32..112,
        ) {
            let mut v = ApInt::new(128, base);
            v.insert_bits(&ApInt::new(16, u64::from(value)), pos);
            prop_assert_eq!(v.extract_bits(16, pos).to_u64(), Some(u64::from(value)));
        }
    }
}
