use anyhow::Result;
use rand::seq::IndexedRandom;
use serde::Serialize;
use tracing::debug;

use crate::catalog::{CatalogRecord, CatalogStore};
use crate::color::ColorLabel;
use crate::settings::MatcherSettings;

/// Which fallback level produced a candidate. Lower tiers are stronger
/// evidence; ordering is part of the public contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchTier {
    ImprintAndColor,
    ImprintOnly,
    FuzzyImprint,
    ColorFallback,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchCandidate {
    pub record: CatalogRecord,
    pub score: f32,
    pub tier: MatchTier,
}

/// Rank catalog entries against a detected imprint and color.
///
/// Tiers are tried strictly in order and the first tier producing any
/// candidate wins. An exhausted chain returns an empty list, which the
/// caller reports as "no match" rather than an error.
pub fn rank(
    store: &dyn CatalogStore,
    imprint: &str,
    color: ColorLabel,
    settings: &MatcherSettings,
) -> Result<Vec<MatchCandidate>> {
    if !imprint.is_empty() {
        let hits = store.find_by_imprint_and_color(imprint, color.as_str())?;
        if !hits.is_empty() {
            debug!(imprint, color = color.as_str(), "matched on imprint+color");
            return Ok(ranked(hits, 1.0, MatchTier::ImprintAndColor, settings));
        }

        let hits = store.find_by_imprint(imprint)?;
        if !hits.is_empty() {
            debug!(imprint, "matched on imprint only");
            return Ok(ranked(hits, 1.0, MatchTier::ImprintOnly, settings));
        }
    }

    let colors = widened_colors(color, settings);

    if !imprint.is_empty() {
        for color_name in &colors {
            let pool = store.find_by_color(color_name)?;
            if let Some((record, score)) = best_fuzzy(imprint, &pool, settings) {
                debug!(imprint, color = %color_name, score, "fuzzy imprint match accepted");
                return Ok(vec![MatchCandidate {
                    record,
                    score,
                    tier: MatchTier::FuzzyImprint,
                }]);
            }
        }
    }

    for color_name in &colors {
        let pool = store.find_by_color(color_name)?;
        if let Some(record) = pool.choose(&mut rand::rng()) {
            debug!(color = %color_name, "falling back to color-only sample");
            return Ok(vec![MatchCandidate {
                record: record.clone(),
                score: 0.0,
                tier: MatchTier::ColorFallback,
            }]);
        }
    }

    Ok(Vec::new())
}

fn ranked(
    mut hits: Vec<CatalogRecord>,
    score: f32,
    tier: MatchTier,
    settings: &MatcherSettings,
) -> Vec<MatchCandidate> {
    hits.sort_by(|a, b| {
        b.view_count
            .cmp(&a.view_count)
            .then_with(|| a.name.cmp(&b.name))
    });
    hits.truncate(settings.max_candidates);
    hits.into_iter()
        .map(|record| MatchCandidate { record, score, tier })
        .collect()
}

/// The detected color followed by its documented near neighbors, so a
/// classifier slip of one bucket still finds the right records. "other"
/// is never queried.
fn widened_colors(color: ColorLabel, settings: &MatcherSettings) -> Vec<String> {
    let mut names = Vec::new();
    if color != ColorLabel::Other {
        names.push(color.as_str().to_string());
        if let Some(neighbor) = settings.color_substitutions.get(color.as_str()) {
            names.push(neighbor.clone());
        }
    }
    names
}

fn best_fuzzy(
    imprint: &str,
    pool: &[CatalogRecord],
    settings: &MatcherSettings,
) -> Option<(CatalogRecord, f32)> {
    let mut best: Option<(CatalogRecord, f32)> = None;
    for record in pool.iter().filter(|record| record.has_imprint()) {
        let front = record.imprint_front.as_deref().unwrap_or("");
        let back = record.imprint_back.as_deref().unwrap_or("");
        let score = similarity(imprint, front).max(similarity(imprint, back));
        let beats = match &best {
            Some((current, current_score)) => {
                score > *current_score
                    || (score == *current_score && record.name < current.name)
            }
            None => true,
        };
        if beats {
            best = Some((record.clone(), score));
        }
    }
    best.filter(|(_, score)| *score >= settings.similarity_threshold)
}

/// Normalized sequence similarity in [0, 1]: twice the number of
/// matching characters over the combined length, with matches found by
/// recursively splitting around the longest common substring.
pub fn similarity(a: &str, b: &str) -> f32 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 1.0;
    }
    let matches = matching_chars(&a, &b);
    2.0 * matches as f32 / total as f32
}

fn matching_chars(a: &[char], b: &[char]) -> usize {
    let (a_start, b_start, length) = longest_common_run(a, b);
    if length == 0 {
        return 0;
    }
    length
        + matching_chars(&a[..a_start], &b[..b_start])
        + matching_chars(&a[a_start + length..], &b[b_start + length..])
}

fn longest_common_run(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    for a_start in 0..a.len() {
        for b_start in 0..b.len() {
            let mut length = 0;
            while a_start + length < a.len()
                && b_start + length < b.len()
                && a[a_start + length] == b[b_start + length]
            {
                length += 1;
            }
            if length > best.2 {
                best = (a_start, b_start, length);
            }
        }
    }
    best
}
