use std::collections::HashMap;

/// A fused hit before chunk hydration.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedHit {
    pub id: String,
    /// Sum of 1/(k + rank) over all legs the id appeared in
    pub score: f64,
    /// "hybrid", "text_only" or "vector_only"
    pub match_source: String,
}

/// Fuse full-text and vector ranked lists via Reciprocal Rank Fusion (RRF).
///
/// RRF score for each chunk = sum of 1/(k + rank_i) over each retrieval leg i,
/// so chunks found by both legs outrank single-leg results.
///
/// # Arguments
/// - `text_ranks`: ids from the full-text leg, best first
/// - `vector_ranks`: ids from the vector leg, best first
/// - `k`: smoothing constant (60.0 is the usual choice)
///
/// Ties are broken by id so results are deterministic.
pub fn rrf_fuse(text_ranks: &[String], vector_ranks: &[String], k: f64) -> Vec<FusedHit> {
    // Bit flags: 1 = text leg, 2 = vector leg
    let mut scores: HashMap<&str, (f64, u8)> = HashMap::new();

    for (idx, id) in text_ranks.iter().enumerate() {
        let entry = scores.entry(id.as_str()).or_insert((0.0, 0));
        entry.0 += 1.0 / (k + (idx + 1) as f64);
        entry.1 |= 1;
    }
    for (idx, id) in vector_ranks.iter().enumerate() {
        let entry = scores.entry(id.as_str()).or_insert((0.0, 0));
        entry.0 += 1.0 / (k + (idx + 1) as f64);
        entry.1 |= 2;
    }

    let mut result: Vec<FusedHit> = scores
        .into_iter()
        .map(|(id, (score, bits))| FusedHit {
            id: id.to_string(),
            score,
            match_source: match bits {
                3 => "hybrid",
                2 => "vector_only",
                _ => "text_only",
            }
            .to_string(),
        })
        .collect();

    result.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    result
}

/// Turn free text into an OR-joined `to_tsquery` expression.
///
/// Only word characters survive, so user input can never inject tsquery
/// operators. Returns None when nothing searchable is left.
pub fn build_or_tsquery(text: &str) -> Option<String> {
    let mut terms: Vec<String> = Vec::new();
    for word in text.split(|c: char| !c.is_alphanumeric() && c != '_') {
        let word = word.to_lowercase();
        if word.chars().count() < 2 || terms.contains(&word) {
            continue;
        }
        terms.push(word);
    }
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" | "))
    }
}
