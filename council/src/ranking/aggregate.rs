//! Merges per-ranker orderings into a single aggregate ranking.
//!
//! Each ordering is converted to per-label positions (1 = best); the
//! aggregate sorts ascending by mean position over the rankers that
//! ranked each label. Ties break by higher mean quality score, then
//! lexicographic label. Pure function: independent of ranker order.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::parser::RankEntry;

/// Aggregate standing of one anonymized label.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelAggregate {
    pub label: char,
    /// Mean 1-based position over rankers that ranked this label.
    pub mean_position: f32,
    /// Mean of the quality scores that were present.
    pub mean_score: Option<f32>,
    /// How many rankers ranked this label.
    pub rankers: usize,
}

/// De-anonymized aggregate entry stored in the deliberation trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateScore {
    pub model: String,
    pub mean_position: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mean_score: Option<f32>,
    pub rankers: usize,
}

impl LabelAggregate {
    /// Attach the real model identity for persistence.
    pub fn with_model(&self, model: &str) -> AggregateScore {
        AggregateScore {
            model: model.to_string(),
            mean_position: self.mean_position,
            mean_score: self.mean_score,
            rankers: self.rankers,
        }
    }
}

#[derive(Default)]
struct Accum {
    position_sum: f32,
    position_count: usize,
    score_sum: f32,
    score_count: usize,
}

/// Compute the aggregate ranking, best first. Labels a ranker omitted
/// simply do not contribute to that label's mean.
pub fn aggregate_rankings(orderings: &[Vec<RankEntry>]) -> Vec<LabelAggregate> {
    // BTreeMap keeps label iteration order fixed regardless of the
    // order orderings arrive in.
    let mut by_label: BTreeMap<char, Accum> = BTreeMap::new();

    for ordering in orderings {
        for (idx, entry) in ordering.iter().enumerate() {
            let accum = by_label.entry(entry.label).or_default();
            accum.position_sum += (idx + 1) as f32;
            accum.position_count += 1;
            if let Some(score) = entry.score {
                accum.score_sum += score;
                accum.score_count += 1;
            }
        }
    }

    let mut aggregates: Vec<LabelAggregate> = by_label
        .into_iter()
        .map(|(label, accum)| LabelAggregate {
            label,
            mean_position: accum.position_sum / accum.position_count as f32,
            mean_score: (accum.score_count > 0)
                .then(|| accum.score_sum / accum.score_count as f32),
            rankers: accum.position_count,
        })
        .collect();

    aggregates.sort_by(|a, b| {
        a.mean_position
            .total_cmp(&b.mean_position)
            .then_with(|| match (b.mean_score, a.mean_score) {
                (Some(x), Some(y)) => x.total_cmp(&y),
                (Some(_), None) => std::cmp::Ordering::Greater,
                (None, Some(_)) => std::cmp::Ordering::Less,
                (None, None) => std::cmp::Ordering::Equal,
            })
            .then_with(|| a.label.cmp(&b.label))
    });
    aggregates
}

/// Lowest mean quality score across labels, if any label has one.
/// Drives the refinement trigger.
pub fn min_mean_score(aggregates: &[LabelAggregate]) -> Option<f32> {
    aggregates
        .iter()
        .filter_map(|a| a.mean_score)
        .min_by(f32::total_cmp)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: char, score: Option<f32>) -> RankEntry {
        RankEntry { label, score }
    }

    fn ordering(pairs: &[(char, f32)]) -> Vec<RankEntry> {
        pairs.iter().map(|(l, s)| entry(*l, Some(*s))).collect()
    }

    #[test]
    fn test_unanimous_order() {
        let orderings = vec![
            ordering(&[('A', 5.0), ('B', 4.0), ('C', 3.0)]),
            ordering(&[('A', 4.0), ('B', 4.0), ('C', 2.0)]),
        ];
        let agg = aggregate_rankings(&orderings);
        let labels: Vec<char> = agg.iter().map(|a| a.label).collect();
        assert_eq!(labels, vec!['A', 'B', 'C']);
        assert_eq!(agg[0].mean_position, 1.0);
        assert_eq!(agg[0].rankers, 2);
        assert_eq!(agg[0].mean_score, Some(4.5));
    }

    #[test]
    fn test_majority_wins() {
        // A>B>C, A>C>B, B>A>C: A has mean (1+1+2)/3, B (2+3+1)/3, C (3+2+3)/3.
        let orderings = vec![
            ordering(&[('A', 4.0), ('B', 4.0), ('C', 4.0)]),
            ordering(&[('A', 4.0), ('C', 4.0), ('B', 4.0)]),
            ordering(&[('B', 4.0), ('A', 4.0), ('C', 4.0)]),
        ];
        let agg = aggregate_rankings(&orderings);
        let labels: Vec<char> = agg.iter().map(|a| a.label).collect();
        assert_eq!(labels, vec!['A', 'B', 'C']);
    }

    #[test]
    fn test_insertion_order_independence() {
        let a = vec![
            ordering(&[('A', 3.0), ('B', 2.0)]),
            ordering(&[('B', 4.0), ('A', 1.0)]),
        ];
        let b = vec![
            ordering(&[('B', 4.0), ('A', 1.0)]),
            ordering(&[('A', 3.0), ('B', 2.0)]),
        ];
        assert_eq!(aggregate_rankings(&a), aggregate_rankings(&b));
    }

    #[test]
    fn test_tie_breaks_on_score_then_label() {
        // Equal mean positions; B has the higher mean score.
        let orderings = vec![
            ordering(&[('A', 2.0), ('B', 5.0)]),
            ordering(&[('B', 5.0), ('A', 2.0)]),
        ];
        let agg = aggregate_rankings(&orderings);
        assert_eq!(agg[0].label, 'B');

        // Equal positions and scores: lexicographic.
        let orderings = vec![
            ordering(&[('C', 3.0), ('A', 3.0)]),
            ordering(&[('A', 3.0), ('C', 3.0)]),
        ];
        let agg = aggregate_rankings(&orderings);
        assert_eq!(agg[0].label, 'A');
    }

    #[test]
    fn test_omitted_label_does_not_drag_mean() {
        // Ranker 2 omitted C; C's mean comes from ranker 1 alone.
        let orderings = vec![
            ordering(&[('A', 4.0), ('B', 3.0), ('C', 2.0)]),
            ordering(&[('A', 4.0), ('B', 3.0)]),
        ];
        let agg = aggregate_rankings(&orderings);
        let c = agg.iter().find(|a| a.label == 'C').unwrap();
        assert_eq!(c.rankers, 1);
        assert_eq!(c.mean_position, 3.0);
    }

    #[test]
    fn test_scoreless_entries() {
        let orderings = vec![vec![entry('A', None), entry('B', Some(2.0))]];
        let agg = aggregate_rankings(&orderings);
        assert_eq!(agg[0].label, 'A');
        assert_eq!(agg[0].mean_score, None);
        assert_eq!(min_mean_score(&agg), Some(2.0));
    }

    #[test]
    fn test_min_mean_score_empty() {
        let orderings = vec![vec![entry('A', None)]];
        let agg = aggregate_rankings(&orderings);
        assert_eq!(min_mean_score(&agg), None);
        assert!(aggregate_rankings(&[]).is_empty());
    }
}
