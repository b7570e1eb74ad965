use std::collections::HashMap;

/// Constant `k` in the RRF formula: `weight / (k + rank)`.
pub const RRF_K: f64 = 60.0;

/// Default weight applied to the BM25 ranking during fusion.
pub const BM25_WEIGHT: f64 = 1.0;

/// Default weight applied to the vector ranking during fusion.
pub const VECTOR_WEIGHT: f64 = 1.0;

/// A document after reciprocal rank fusion of the two ranked lists.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused {
    pub id: i64,
    pub rrf_score: f64,
    pub bm25_rank: Option<u32>,
    pub vec_rank: Option<u32>,
}

/// Merge BM25 and vector result lists using Reciprocal Rank Fusion.
///
/// Inputs are `(id, rank)` pairs with 1-based ranks. A document absent from
/// a list contributes nothing for that list. The merged list is sorted by
/// RRF score descending; ties break on the lower combined rank, then on the
/// lower id.
pub fn fuse(
    bm25: &[(i64, u32)],
    vector: &[(i64, u32)],
    bm25_weight: f64,
    vector_weight: f64,
    limit: usize,
) -> Vec<Fused> {
    let mut entries: HashMap<i64, Fused> = HashMap::new();

    for &(id, rank) in bm25 {
        let entry = entries.entry(id).or_insert(Fused {
            id,
            rrf_score: 0.0,
            bm25_rank: None,
            vec_rank: None,
        });
        entry.rrf_score += bm25_weight / (RRF_K + rank as f64);
        entry.bm25_rank = Some(rank);
    }

    for &(id, rank) in vector {
        let entry = entries.entry(id).or_insert(Fused {
            id,
            rrf_score: 0.0,
            bm25_rank: None,
            vec_rank: None,
        });
        entry.rrf_score += vector_weight / (RRF_K + rank as f64);
        entry.vec_rank = Some(rank);
    }

    let mut merged: Vec<Fused> = entries.into_values().collect();
    merged.sort_by(|a, b| {
        b.rrf_score
            .partial_cmp(&a.rrf_score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| combined_rank(a).cmp(&combined_rank(b)))
            .then_with(|| a.id.cmp(&b.id))
    });
    merged.truncate(limit);
    merged
}

/// Tie-break key: the sum of ranks, treating absence as very large.
fn combined_rank(f: &Fused) -> u64 {
    let absent = u32::MAX as u64;
    f.bm25_rank.map_or(absent, u64::from) + f.vec_rank.map_or(absent, u64::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_lists_fuse_to_nothing() {
        assert!(fuse(&[], &[], BM25_WEIGHT, VECTOR_WEIGHT, 10).is_empty());
    }

    #[test]
    fn documented_example_ordering() {
        // BM25 ranks: A=1, B=3, C=2. Vector ranks: A=5, B=1, C=3.
        let bm25 = vec![(1, 1), (3, 2), (2, 3)];
        let vector = vec![(2, 1), (3, 3), (1, 5)];
        let fused = fuse(&bm25, &vector, BM25_WEIGHT, VECTOR_WEIGHT, 10);

        let order: Vec<i64> = fused.iter().map(|f| f.id).collect();
        assert_eq!(order, vec![2, 3, 1]); // [B, C, A]
    }

    #[test]
    fn absence_contributes_zero() {
        let only_bm25 = fuse(&[(7, 1)], &[], BM25_WEIGHT, VECTOR_WEIGHT, 10);
        assert_eq!(only_bm25.len(), 1);
        assert!((only_bm25[0].rrf_score - 1.0 / 61.0).abs() < 1e-12);
        assert_eq!(only_bm25[0].bm25_rank, Some(1));
        assert_eq!(only_bm25[0].vec_rank, None);
    }

    #[test]
    fn worse_rank_never_increases_score() {
        let base = fuse(&[(1, 2)], &[(1, 3)], BM25_WEIGHT, VECTOR_WEIGHT, 10);
        let worse = fuse(&[(1, 2)], &[(1, 9)], BM25_WEIGHT, VECTOR_WEIGHT, 10);
        assert!(worse[0].rrf_score <= base[0].rrf_score);
    }

    #[test]
    fn tie_breaks_on_combined_rank_then_id() {
        // Both docs score 1/(60+1): one from each list.
        let fused = fuse(&[(10, 1)], &[(20, 1)], BM25_WEIGHT, VECTOR_WEIGHT, 10);
        assert_eq!(fused.len(), 2);
        // Equal scores and equal combined ranks: lower id first.
        assert_eq!(fused[0].id, 10);
        assert_eq!(fused[1].id, 20);
    }

    #[test]
    fn weights_shift_the_balance() {
        let bm25 = vec![(1, 1)];
        let vector = vec![(2, 1)];
        let fused = fuse(&bm25, &vector, 2.0, 1.0, 10);
        assert_eq!(fused[0].id, 1);
        let fused = fuse(&bm25, &vector, 1.0, 2.0, 10);
        assert_eq!(fused[0].id, 2);
    }

    #[test]
    fn limit_truncates() {
        let bm25: Vec<(i64, u32)> = (0..50).map(|i| (i, i as u32 + 1)).collect();
        let fused = fuse(&bm25, &[], BM25_WEIGHT, VECTOR_WEIGHT, 5);
        assert_eq!(fused.len(), 5);
        assert_eq!(fused[0].id, 0);
    }
}
