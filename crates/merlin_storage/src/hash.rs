//! Partition hashing: routes a row by its partition-column value. Uses
//! xxHash3-64 over the order-preserving datum encoding and narrows to the
//! 32-bit hash the DR wire format carries.

use xxhash_rust::xxh3::xxh3_64;

use merlin_common::datum::{encode_datum, Datum};

/// Hash a single partition-column value.
pub fn hash_partition_value(datum: &Datum) -> i32 {
    let mut buf = Vec::with_capacity(16);
    encode_datum(&mut buf, datum);
    xxh3_64(&buf) as i32
}

/// The partition a value routes to among `num_partitions`.
pub fn partition_for_value(datum: &Datum, num_partitions: i32) -> i32 {
    assert!(num_partitions > 0);
    (hash_partition_value(datum) as i64).rem_euclid(num_partitions as i64) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = hash_partition_value(&Datum::BigInt(55555));
        let b = hash_partition_value(&Datum::BigInt(55555));
        assert_eq!(a, b);
    }

    #[test]
    fn test_distinct_values_usually_route_apart() {
        let a = hash_partition_value(&Datum::BigInt(1));
        let b = hash_partition_value(&Datum::BigInt(2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_partition_in_range() {
        for v in [-3i64, 0, 7, 55555] {
            let p = partition_for_value(&Datum::BigInt(v), 8);
            assert!((0..8).contains(&p));
        }
    }
}
