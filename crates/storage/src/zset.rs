use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};

/// Score com ordenação total (NaN nunca entra: `zadd` rejeita).
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// Sorted set: membros únicos ordenados por (score, membro).
#[derive(Debug, Clone, Default)]
pub struct SortedSet {
    scores: HashMap<String, f64>,
    ordered: BTreeSet<(Score, String)>,
}

impl SortedSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insere ou atualiza o score. Retorna true se o membro é novo.
    pub fn insert(&mut self, member: String, score: f64) -> bool {
        match self.scores.insert(member.clone(), score) {
            Some(old) => {
                self.ordered.remove(&(Score(old), member.clone()));
                self.ordered.insert((Score(score), member));
                false
            }
            None => {
                self.ordered.insert((Score(score), member));
                true
            }
        }
    }

    pub fn remove(&mut self, member: &str) -> bool {
        match self.scores.remove(member) {
            Some(score) => {
                self.ordered.remove(&(Score(score), member.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn score(&self, member: &str) -> Option<f64> {
        self.scores.get(member).copied()
    }

    pub fn len(&self) -> usize {
        self.scores.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scores.is_empty()
    }

    /// Membros nas posições `start..=stop` (já normalizadas).
    pub fn range(&self, start: usize, stop: usize, reverse: bool) -> Vec<(String, f64)> {
        let take = stop - start + 1;
        let pick = |(score, member): &(Score, String)| (member.clone(), score.0);
        if reverse {
            self.ordered.iter().rev().skip(start).take(take).map(pick).collect()
        } else {
            self.ordered.iter().skip(start).take(take).map(pick).collect()
        }
    }
}
