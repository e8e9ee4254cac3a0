use proptest::prelude::*;
use rds_agent::core::gtid::{compare_gtid, is_caught_up};
use std::cmp::Ordering;

#[test]
fn test_equal_gtids_compare_equal() {
    assert_eq!(compare_gtid("0-1-100", "0-1-100"), Ordering::Equal);
}

#[test]
fn test_sequence_number_decides_within_same_server() {
    assert_eq!(compare_gtid("0-1-99", "0-1-100"), Ordering::Less);
    assert_eq!(compare_gtid("0-1-100", "0-1-99"), Ordering::Greater);
}

#[test]
fn test_middle_component_dominates_sequence() {
    // A larger server component wins even with a smaller sequence.
    assert_eq!(compare_gtid("0-2-1", "0-1-100"), Ordering::Greater);
    assert_eq!(compare_gtid("0-1-100", "0-2-1"), Ordering::Less);
}

#[test]
fn test_middle_components_compare_as_strings_not_numbers() {
    // "10" sorts before "9" as a string; the middle component is never
    // parsed as a number.
    assert_eq!(compare_gtid("0-10-5", "0-9-5"), Ordering::Less);
    assert_eq!(compare_gtid("0-9-5", "0-10-5"), Ordering::Greater);
}

#[test]
fn test_malformed_is_never_equal() {
    assert_eq!(compare_gtid("garbage", "0-1-100"), Ordering::Less);
    assert_eq!(compare_gtid("0-1-100", "garbage"), Ordering::Less);
    assert_eq!(compare_gtid("", ""), Ordering::Less);
    assert_eq!(compare_gtid("0-1", "0-1"), Ordering::Less);
    assert_eq!(compare_gtid("0-1-x", "0-1-x"), Ordering::Less);
}

#[test]
fn test_caught_up_includes_equal_positions() {
    assert!(is_caught_up("0-1-100", "0-1-100"));
    assert!(is_caught_up("0-1-101", "0-1-100"));
    assert!(!is_caught_up("0-1-99", "0-1-100"));
    // A malformed candidate can never count as caught up.
    assert!(!is_caught_up("bogus", "0-1-100"));
}

/// Middle components of every digit length, so one-digit and multi-digit
/// values meet often; that mix is exactly where string order and numeric
/// order disagree (e.g. "2" vs "10").
fn middle_component() -> impl Strategy<Value = u64> {
    prop_oneof![0u64..10, 10u64..100, 100u64..1000]
}

proptest! {
    /// Well-formed GTIDs form a total preorder: the comparison is
    /// antisymmetric and agrees with itself when arguments are swapped.
    #[test]
    fn prop_wellformed_comparison_is_antisymmetric(
        a in 0u64..1000, b in middle_component(), c in 0u64..1000,
        x in 0u64..1000, y in middle_component(), z in 0u64..1000,
    ) {
        let left = format!("{a}-{b}-{c}");
        let right = format!("{x}-{y}-{z}");
        let forward = compare_gtid(&left, &right);
        let backward = compare_gtid(&right, &left);
        prop_assert_eq!(forward, backward.reverse());
        if left == right {
            prop_assert_eq!(forward, Ordering::Equal);
        }
    }

    /// A differing middle component decides the comparison by plain string
    /// order, never numerically.
    #[test]
    fn prop_differing_middles_order_as_strings(
        b in middle_component(), y in middle_component(),
        c in 0u64..1000, z in 0u64..1000,
    ) {
        prop_assume!(b != y);
        let left = format!("0-{b}-{c}");
        let right = format!("0-{y}-{z}");
        let expected = b.to_string().cmp(&y.to_string());
        prop_assert_eq!(compare_gtid(&left, &right), expected);
    }

    /// No malformed input ever compares as Equal, in either position.
    #[test]
    fn prop_malformed_never_equal(bad in "[a-z]{0,8}", a in 0u64..1000) {
        let good = format!("0-1-{a}");
        prop_assert_ne!(compare_gtid(&bad, &good), Ordering::Equal);
        prop_assert_ne!(compare_gtid(&good, &bad), Ordering::Equal);
        prop_assert_ne!(compare_gtid(&bad, &bad), Ordering::Equal);
    }
}
