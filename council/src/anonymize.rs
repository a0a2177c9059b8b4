//! Anonymization of council identities for Stage-2 ranking.
//!
//! Each Stage-2 invocation computes one label bijection shared by all
//! rankers in that invocation, so every ranker's `Response A` refers
//! to the same model. The shuffle is seeded from the request id to
//! keep the assignment deterministic per request.

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use uuid::Uuid;

/// Derive the shuffle seed for a request.
pub fn seed_from_request(request_id: &Uuid) -> u64 {
    request_id.as_u128() as u64
}

/// Bijection between model ids and opaque labels `A, B, C, …`,
/// scoped to one Stage-2 invocation.
#[derive(Debug, Clone)]
pub struct LabelMap {
    /// `(label, model)` pairs in label order.
    assignments: Vec<(char, String)>,
    by_model: HashMap<String, char>,
}

impl LabelMap {
    /// Shuffle `models` with the given seed and assign labels in the
    /// shuffled order.
    pub fn assign(models: &[String], seed: u64) -> Self {
        let mut shuffled = models.to_vec();
        let mut rng = StdRng::seed_from_u64(seed);
        shuffled.shuffle(&mut rng);

        let assignments: Vec<(char, String)> = shuffled
            .into_iter()
            .enumerate()
            .map(|(i, model)| ((b'A' + i as u8) as char, model))
            .collect();
        let by_model = assignments
            .iter()
            .map(|(label, model)| (model.clone(), *label))
            .collect();

        Self {
            assignments,
            by_model,
        }
    }

    pub fn len(&self) -> usize {
        self.assignments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty()
    }

    pub fn label_of(&self, model: &str) -> Option<char> {
        self.by_model.get(model).copied()
    }

    pub fn model_of(&self, label: char) -> Option<&str> {
        self.assignments
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, m)| m.as_str())
    }

    /// All labels in order.
    pub fn labels(&self) -> Vec<char> {
        self.assignments.iter().map(|(l, _)| *l).collect()
    }

    /// The anonymized view presented to one ranker: `(label, content)`
    /// in label order, with the ranker's own response omitted.
    pub fn view_for<'a>(
        &self,
        ranker: &str,
        contents: &'a HashMap<String, String>,
    ) -> Vec<(char, &'a str)> {
        self.assignments
            .iter()
            .filter(|(_, model)| model != ranker)
            .filter_map(|(label, model)| {
                contents.get(model).map(|c| (*label, c.as_str()))
            })
            .collect()
    }
}
