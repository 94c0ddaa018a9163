//! Embedding arithmetic and best-match search over an enrolled gallery.

pub type Embedding = Vec<f32>;

/// Result of a gallery search. `identity` is `None` when nothing cleared the
/// threshold, in which case `similarity` is the `0.0` sentinel and carries no meaning.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    pub similarity: f32,
    pub identity: Option<String>,
}

impl MatchResult {
    pub fn no_match() -> Self {
        Self { similarity: 0.0, identity: None }
    }

    pub fn is_match(&self) -> bool {
        self.identity.is_some()
    }
}

/// Dot product; equals cosine similarity for unit vectors.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot(a, b) / (norm_a * norm_b)
}

pub fn l2_normalize(v: &mut [f32]) {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for value in v.iter_mut() {
            *value /= norm;
        }
    }
}

/// Element-wise mean, re-normalised to unit length.
pub fn mean_embedding(embeddings: &[Embedding]) -> Embedding {
    if embeddings.is_empty() {
        return vec![];
    }

    let embedding_size = embeddings[0].len();
    let mut averaged = vec![0.0f32; embedding_size];

    for embedding in embeddings {
        for (i, &value) in embedding.iter().enumerate().take(embedding_size) {
            averaged[i] += value;
        }
    }

    let count = embeddings.len() as f32;
    for value in &mut averaged {
        *value /= count;
    }

    l2_normalize(&mut averaged);
    averaged
}

/// Scan the whole gallery and keep the best similarity strictly above `threshold`.
///
/// Among equal maxima the first entry in iteration order wins; callers pass a
/// name-ordered map so this is the lexicographically smallest name.
/// Entries whose dimension differs from the query are skipped.
pub fn find_best_match<'a, I>(query: &[f32], gallery: I, threshold: f32) -> MatchResult
where
    I: IntoIterator<Item = (&'a String, &'a Embedding)>,
{
    let mut best = MatchResult::no_match();
    let mut best_similarity = f32::NEG_INFINITY;

    for (name, enrolled) in gallery {
        if enrolled.len() != query.len() {
            tracing::warn!(
                "Skipping gallery entry {} with dimension {} (query has {})",
                name,
                enrolled.len(),
                query.len()
            );
            continue;
        }

        let similarity = dot(query, enrolled);
        if similarity > threshold && similarity > best_similarity {
            best_similarity = similarity;
            best = MatchResult {
                similarity,
                identity: Some(name.clone()),
            };
        }
    }

    best
}
