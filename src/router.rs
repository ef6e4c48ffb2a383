//! Document router (C4).
//!
//! A deterministic `id -> shard` mapping. The policy depends only on `id`
//! and the shard count `N`; no tie-breaking is needed.

/// `shard_of(id, N) = (sum of codepoints in id) mod N`.
pub fn shard_of(id: &str, shard_count: usize) -> usize {
    assert!(shard_count > 0, "shard count must be >= 1");
    let sum: u64 = id.chars().map(|c| c as u64).sum();
    (sum % shard_count as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn routes_abc_to_shard_two_of_four() {
        // 'a'=97, 'b'=98, 'c'=99 -> 294 mod 4 = 2
        assert_eq!(shard_of("abc", 4), 2);
    }

    #[test]
    fn empty_id_routes_to_shard_zero() {
        assert_eq!(shard_of("", 4), 0);
    }

    #[test]
    fn same_id_always_routes_to_same_shard() {
        for n in 1..8 {
            let a = shard_of("document-42", n);
            let b = shard_of("document-42", n);
            assert_eq!(a, b);
        }
    }
}
