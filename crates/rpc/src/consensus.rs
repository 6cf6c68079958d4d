//! Response election
//!
//! Answers are compared by their exact serialised JSON. The most frequent
//! answer wins; when several share the top count, one of them is picked
//! uniformly at random. Only answers that were actually returned can win.

use rand::Rng;
use serde_json::Value;

/// Outcome of an election
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub value: Value,
    /// Every distinct answer with its count, most frequent first
    pub candidates: Vec<(Value, usize)>,
    /// Whether the winner was drawn among equally frequent answers
    pub tied: bool,
}

impl Verdict {
    pub fn is_unanimous(&self) -> bool {
        self.candidates.len() == 1
    }

    /// `value ×count` list for logs
    pub fn describe(&self) -> String {
        self.candidates
            .iter()
            .map(|(value, count)| format!("{} ×{}", value, count))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Elect one of `values`, or `None` when there is nothing to elect
pub fn elect<R: Rng + ?Sized>(values: Vec<Value>, rng: &mut R) -> Option<Verdict> {
    // (text, value, count) in order of first appearance
    let mut groups: Vec<(String, Value, usize)> = Vec::new();
    for value in values {
        let text = value.to_string();
        match groups.iter_mut().find(|(seen, _, _)| *seen == text) {
            Some((_, _, count)) => *count += 1,
            None => groups.push((text, value, 1)),
        }
    }

    // Stable, so equal counts keep their arrival order
    groups.sort_by(|a, b| b.2.cmp(&a.2));
    let candidates: Vec<(Value, usize)> = groups.into_iter().map(|(_, value, count)| (value, count)).collect();

    let top = candidates.first()?.1;
    let tied = candidates.iter().take_while(|(_, count)| *count == top).count();
    let pick = if tied > 1 { rng.gen_range(0..tied) } else { 0 };

    Some(Verdict {
        value: candidates[pick].0.clone(),
        candidates,
        tied: tied > 1,
    })
}
