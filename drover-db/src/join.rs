//! Weighted bipartite matching of two row sequences.
//!
//! This is the primitive every reconciling loop uses to pair "what we want"
//! with "what exists": the cloud reconciler matches desired machines against
//! database rows and database rows against cloud instances, and the worker
//! scheduler matches its container table against what Docker reports.

/// The result of [`join`].
#[derive(Clone, Debug, PartialEq)]
pub struct Join<L, R> {
    /// Matched pairs. Every pair scored non-negative.
    pub pairs: Vec<(L, R)>,
    /// Left elements that had no compatible partner or lost the competition.
    pub left: Vec<L>,
    /// Right elements that had no compatible partner or lost the competition.
    pub right: Vec<R>,
}

/// Pair up two sequences by a symmetric scoring function.
///
/// A negative score marks a pair incompatible; among compatible pairs a
/// smaller score is a better match. Matching is greedy over candidate pairs
/// ordered by (score, left position, right position), which keeps the output
/// deterministic and stable for stable inputs.
pub fn join<L, R, F>(left: Vec<L>, right: Vec<R>, score: F) -> Join<L, R>
where
    F: Fn(&L, &R) -> i64,
{
    let mut candidates = Vec::new();
    for (li, l) in left.iter().enumerate() {
        for (ri, r) in right.iter().enumerate() {
            let s = score(l, r);
            if s >= 0 {
                candidates.push((s, li, ri));
            }
        }
    }
    candidates.sort_unstable();

    let mut left: Vec<Option<L>> = left.into_iter().map(Some).collect();
    let mut right: Vec<Option<R>> = right.into_iter().map(Some).collect();
    let mut pairs = Vec::new();
    for (_, li, ri) in candidates {
        if left[li].is_none() || right[ri].is_none() {
            continue;
        }
        if let (Some(l), Some(r)) = (left[li].take(), right[ri].take()) {
            pairs.push((l, r));
        }
    }

    Join {
        pairs,
        left: left.into_iter().flatten().collect(),
        right: right.into_iter().flatten().collect(),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use test_strategy::proptest;

    use super::*;

    #[test]
    fn incompatible_pairs_never_match() {
        let result = join(vec![1, 2], vec![10, 20], |_, _| -1);
        assert!(result.pairs.is_empty());
        assert_eq!(result.left, vec![1, 2]);
        assert_eq!(result.right, vec![10, 20]);
    }

    #[test]
    fn better_scores_win_the_competition() {
        // Both lefts are compatible with the single right, but 2 matches it
        // exactly.
        let result = join(vec![1i64, 2], vec![2], |l, r| (l - r).abs());
        assert_eq!(result.pairs, vec![(2, 2)]);
        assert_eq!(result.left, vec![1]);
        assert!(result.right.is_empty());
    }

    #[test]
    fn ties_break_by_position() {
        let result = join(vec!["a", "b"], vec!["x", "y"], |_, _| 0);
        assert_eq!(result.pairs, vec![("a", "x"), ("b", "y")]);
    }

    #[test]
    fn partial_compatibility() {
        // 1 can only take the odd right, 2 only the even one.
        let result = join(vec![1, 2], vec![4, 3], |l, r| {
            if (l + r) % 2 == 0 {
                0
            } else {
                -1
            }
        });
        assert_eq!(result.pairs, vec![(1, 3), (2, 4)]);
        assert!(result.left.is_empty());
        assert!(result.right.is_empty());
    }

    #[proptest]
    fn join_is_deterministic(left: Vec<u8>, right: Vec<u8>) {
        let score = |l: &u8, r: &u8| {
            let d = (i64::from(*l) - i64::from(*r)).abs();
            if d > 64 {
                -1
            } else {
                d
            }
        };
        let a = join(left.clone(), right.clone(), score);
        let b = join(left, right, score);
        assert_eq!(a, b);
    }

    #[proptest]
    fn join_partitions_its_inputs(left: Vec<u8>, right: Vec<u8>) {
        let result = join(left.clone(), right.clone(), |l, r| {
            if l == r {
                0
            } else {
                -1
            }
        });
        let mut left_out: Vec<u8> = result.pairs.iter().map(|(l, _)| *l).collect();
        left_out.extend(result.left.iter().copied());
        left_out.sort_unstable();
        let mut left_in = left;
        left_in.sort_unstable();
        assert_eq!(left_out, left_in);

        let mut right_out: Vec<u8> = result.pairs.iter().map(|(_, r)| *r).collect();
        right_out.extend(result.right.iter().copied());
        right_out.sort_unstable();
        let mut right_in = right;
        right_in.sort_unstable();
        assert_eq!(right_out, right_in);
    }
}
