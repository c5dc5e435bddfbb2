use pretty_assertions::assert_eq;

use super::*;

#[test]
fn identical_types_share_a_handle() {
    let mut pool = TypePool::new();
    let a = pool.int(32);
    let b = pool.int(32);
    let c = pool.int(64);
    assert_eq!(a, b);
    assert_ne!(a, c);
    let pair1 = pool.tuple(&[a, c]);
    let pair2 = pool.tuple(&[b, c]);
    assert_eq!(pair1, pair2);
}

#[test]
fn nominal_lookup() {
    let mut pool = TypePool::new();
    let word = pool.int(64);
    let point = pool.struct_type("Point", &[word, word]);
    assert_eq!(pool.lookup("Point"), Some(point));
    assert_eq!(pool.lookup("Missing"), None);
}

#[test]
fn archetypes_and_resilience_make_types_non_fixed() {
    let mut pool = TypePool::new();
    let word = pool.int(64);
    let t = pool.archetype("T");
    let boxed = pool.struct_type("Box", &[word, t]);
    let plain = pool.struct_type("Plain", &[word]);
    let remote = pool.resilient_struct("Remote", &[]);
    let holder = pool.tuple(&[plain, remote]);
    assert!(pool.has_archetype(boxed));
    assert!(!pool.is_fixed_size(boxed));
    assert!(pool.is_fixed_size(plain));
    assert!(!pool.is_fixed_size(holder));
    assert!(!pool.has_archetype(holder));
}

#[test]
fn archetypes_are_collected_in_order() {
    let mut pool = TypePool::new();
    let word = pool.int(64);
    let t = pool.archetype("T");
    let u = pool.archetype("U");
    let inner = pool.tuple(&[u, t]);
    let outer = pool.struct_type("Outer", &[t, word, inner]);
    assert_eq!(pool.archetypes_of(outer), vec![t, u]);
    assert!(pool.archetypes_of(word).is_empty());
}

#[test]
fn display_renders_structure() {
    let mut pool = TypePool::new();
    let word = pool.int(64);
    let t = pool.archetype("T");
    let arr = pool.fixed_array(word, 4);
    let tuple = pool.tuple(&[arr, t]);
    let opt = pool.optional(word);
    let any = pool.existential(&[Protocol::new("P"), Protocol::class_bound("Q")]);
    assert_eq!(pool.display(tuple), "([Int64; 4], T)");
    assert_eq!(pool.display(opt), "Optional<Int64>");
    assert_eq!(pool.display(any), "any P & Q");
}
