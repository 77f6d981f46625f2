use super::*;

fn iv(ranges: &[(i32, i32)]) -> Interval {
    Interval::from_ranges(ranges.iter().map(|&(l, h)| Range::new(l, h)))
}

fn is_canonical(interval: &Interval) -> bool {
    interval
        .ranges()
        .windows(2)
        .all(|w| (w[0].high as i64) + 1 < w[1].low as i64)
}

fn samples() -> Vec<Interval> {
    vec![
        Interval::empty(),
        Interval::full(),
        Interval::singleton(0),
        Interval::singleton(-1),
        iv(&[(i32::MIN, -1)]),
        iv(&[(i32::MIN, -1), (1, i32::MAX)]),
        iv(&[(-10, -5), (0, 0), (7, 20)]),
        iv(&[(3, 3), (100, i32::MAX)]),
    ]
}

#[test]
fn test_from_ranges_merges_adjacent() {
    let merged = iv(&[(5, 9), (0, 4), (11, 12)]);
    assert_eq!(merged.ranges(), &[Range::new(0, 9), Range::new(11, 12)]);
    assert!(is_canonical(&merged));
}

#[test]
fn test_apply_eq_on_full() {
    let result = Interval::full().apply_predicate(Predicate::Eq, 5);
    assert_eq!(result, Interval::singleton(5));
}

#[test]
fn test_apply_eq_missing_value() {
    let result = iv(&[(0, 3)]).apply_predicate(Predicate::Eq, 7);
    assert!(result.is_empty());
}

#[test]
fn test_apply_lt_zero_on_full() {
    let result = Interval::full().apply_predicate(Predicate::Slt, 0);
    assert_eq!(result, iv(&[(i32::MIN, -1)]));
}

#[test]
fn test_apply_ne_splits_range() {
    let result = Interval::full().apply_predicate(Predicate::Ne, 0);
    assert_eq!(result, iv(&[(i32::MIN, -1), (1, i32::MAX)]));
    assert!(is_canonical(&result));
}

#[test]
fn test_apply_ne_at_bounds() {
    let result = iv(&[(0, 5)]).apply_predicate(Predicate::Ne, 0);
    assert_eq!(result, iv(&[(1, 5)]));
    let result = iv(&[(0, 5)]).apply_predicate(Predicate::Ne, 5);
    assert_eq!(result, iv(&[(0, 4)]));
}

#[test]
fn test_apply_inequalities() {
    let base = iv(&[(-10, -5), (0, 0), (7, 20)]);
    assert_eq!(base.apply_predicate(Predicate::Sle, 0), iv(&[(-10, -5), (0, 0)]));
    assert_eq!(base.apply_predicate(Predicate::Sgt, 0), iv(&[(7, 20)]));
    assert_eq!(base.apply_predicate(Predicate::Sge, 8), iv(&[(8, 20)]));
    assert_eq!(base.apply_predicate(Predicate::Slt, -6), iv(&[(-10, -7)]));
}

#[test]
fn test_apply_at_extremes() {
    assert!(Interval::full().apply_predicate(Predicate::Slt, i32::MIN).is_empty());
    assert!(Interval::full().apply_predicate(Predicate::Sgt, i32::MAX).is_empty());
    assert_eq!(
        Interval::full().apply_predicate(Predicate::Sge, i32::MIN),
        Interval::full()
    );
}

#[test]
fn test_unsigned_predicates_use_signed_semantics() {
    let full = Interval::full();
    assert_eq!(
        full.apply_predicate(Predicate::Ult, 0),
        full.apply_predicate(Predicate::Slt, 0)
    );
    assert_eq!(
        full.apply_predicate(Predicate::Uge, 4),
        full.apply_predicate(Predicate::Sge, 4)
    );
}

#[test]
fn test_union_at_int_max() {
    let a = iv(&[(10, i32::MAX)]);
    let b = iv(&[(i32::MAX, i32::MAX)]);
    assert_eq!(a.union(&b), a);
    let c = iv(&[(0, 9)]);
    assert_eq!(a.union(&c), iv(&[(0, i32::MAX)]));
}

#[test]
fn test_intersection_sweep() {
    let a = iv(&[(0, 10), (20, 30)]);
    let b = iv(&[(5, 25)]);
    assert_eq!(a.intersection(&b), iv(&[(5, 10), (20, 25)]));
}

#[test]
fn test_intersection_is_subset_of_both() {
    for a in samples() {
        for b in samples() {
            let i = a.intersection(&b);
            assert!(i.is_subset_of(&a), "{} not in {}", i, a);
            assert!(i.is_subset_of(&b), "{} not in {}", i, b);
            assert!(is_canonical(&i));
        }
    }
}

#[test]
fn test_union_idempotent() {
    for a in samples() {
        for b in samples() {
            let u = a.union(&b);
            assert_eq!(u.union(&b), u);
            assert!(is_canonical(&u));
        }
    }
}

#[test]
fn test_double_complement() {
    for a in samples() {
        if a.is_empty() || a.is_full() {
            continue;
        }
        let c = a.complement();
        assert!(is_canonical(&c));
        assert!(c.intersection(&a).is_empty());
        assert!(c.union(&a).is_full());
        assert_eq!(c.complement(), a);
    }
}

#[test]
#[should_panic]
fn test_complement_of_full_panics() {
    let _ = Interval::full().complement();
}

#[test]
fn test_signedness() {
    assert_eq!(Interval::singleton(0).signedness(), 0);
    assert_eq!(iv(&[(i32::MIN, -1)]).signedness(), -1);
    assert_eq!(iv(&[(i32::MIN, 0)]).signedness(), -1);
    assert_eq!(iv(&[(1, 5)]).signedness(), 1);
    assert_eq!(iv(&[(i32::MIN, -1), (1, i32::MAX)]).signedness(), 0);
    assert_eq!(Interval::empty().signedness(), 0);
}

#[test]
fn test_lowest_highest_size() {
    let a = iv(&[(-3, -1), (4, 5)]);
    assert_eq!(a.lowest(), Some(-3));
    assert_eq!(a.highest(), Some(5));
    assert_eq!(a.size(), 5);
    assert_eq!(Interval::full().size(), 1u64 << 32);
}

#[test]
fn test_display() {
    let a = iv(&[(i32::MIN, -1), (1, i32::MAX)]);
    assert_eq!(a.to_string(), "[-2147483648, -1] U [1, 2147483647]");
    assert_eq!(Interval::empty().to_string(), "empty");
}

#[test]
fn test_deserialize_checks_and_canonicalizes() {
    let inverted = serde_json::from_str::<Range>(r#"{"low": 3, "high": 1}"#);
    assert!(inverted.is_err());

    let scattered: Interval = serde_json::from_str(
        r#"{"ranges": [{"low": 5, "high": 6}, {"low": 0, "high": 4}, {"low": 9, "high": 9}]}"#,
    )
    .unwrap();
    assert_eq!(scattered, iv(&[(0, 6), (9, 9)]));
    assert!(is_canonical(&scattered));

    let text = serde_json::to_string(&scattered).unwrap();
    assert_eq!(serde_json::from_str::<Interval>(&text).unwrap(), scattered);
    assert_eq!(
        Range::try_new(2, 1),
        Err(IntervalError::InvertedRange { low: 2, high: 1 })
    );
}
