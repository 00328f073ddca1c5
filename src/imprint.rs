use tracing::debug;

use crate::error::StepError;
use crate::providers::{self, TextObservation, TextReader};
use crate::settings::ImprintSettings;
use std::time::Duration;

/// Normalized engraved text plus a rough confidence derived from the
/// candidate score. Invariant: `text` is empty or 1..=max_len uppercase
/// alphanumeric characters.
#[derive(Debug, Clone, PartialEq)]
pub struct ImprintText {
    pub text: String,
    pub confidence: f32,
}

impl ImprintText {
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            confidence: 0.0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }
}

/// Ask the OCR collaborator for text blocks and reduce them to a single
/// imprint candidate. Transport failures and timeouts surface as a
/// [`StepError`]; the orchestrator degrades them to an empty imprint.
pub async fn read(
    image_jpeg: Vec<u8>,
    reader: &dyn TextReader,
    settings: &ImprintSettings,
    timeout: Duration,
) -> Result<ImprintText, StepError> {
    let observations = providers::bounded(reader.read_text(image_jpeg), timeout).await?;
    if observations.is_empty() {
        return Err(StepError::Empty);
    }
    Ok(extract_best(&observations, settings))
}

/// Pick the most imprint-like candidate from a set of OCR observations.
///
/// The first observation is treated as the full-frame concatenation and
/// only considered when it is strictly alphanumeric as a whole; the rest
/// are scored individually. Codes mixing letters and digits outrank
/// all-digit tokens, which outrank all-letter tokens.
pub fn extract_best(observations: &[TextObservation], settings: &ImprintSettings) -> ImprintText {
    let mut candidates: Vec<(String, i32)> = Vec::new();

    if let Some(full) = observations.first() {
        let collapsed: String = full
            .text
            .chars()
            .filter(|ch| !ch.is_whitespace())
            .collect();
        let clean = normalize_token(&collapsed);
        // A lone character concatenation is noise, not a code.
        if clean == collapsed.to_uppercase() && clean.len() >= 2 && in_bounds(&clean, settings) {
            candidates.push((clean, 10));
        }
    }

    for observation in observations.iter().skip(1) {
        let clean = normalize_token(&observation.text);
        if !in_bounds(&clean, settings) {
            continue;
        }
        if settings.stoplist.iter().any(|token| token == &clean) {
            continue;
        }
        candidates.push((clean.clone(), score_token(&clean)));
    }

    candidates.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    let Some((best, score)) = candidates.into_iter().next() else {
        return ImprintText::empty();
    };

    let corrected = apply_corrections(&best, settings);
    if corrected != best {
        debug!(raw = %best, corrected = %corrected, "imprint correction applied");
    }
    ImprintText {
        text: corrected,
        confidence: (score as f32 / 10.0).clamp(0.0, 1.0),
    }
}

/// Uppercase and keep only ASCII alphanumerics.
pub fn normalize_token(raw: &str) -> String {
    raw.trim()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric())
        .map(|ch| ch.to_ascii_uppercase())
        .collect()
}

/// Rewrite a known misread to its canonical imprint code.
pub fn apply_corrections(text: &str, settings: &ImprintSettings) -> String {
    settings
        .corrections
        .get(text)
        .cloned()
        .unwrap_or_else(|| text.to_string())
}

fn in_bounds(clean: &str, settings: &ImprintSettings) -> bool {
    !clean.is_empty() && clean.len() <= settings.max_len
}

fn score_token(clean: &str) -> i32 {
    let has_alpha = clean.chars().any(|ch| ch.is_ascii_alphabetic());
    let has_digit = clean.chars().any(|ch| ch.is_ascii_digit());
    if has_alpha && has_digit {
        10
    } else if has_digit {
        5
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::Settings;

    fn observations(texts: &[&str]) -> Vec<TextObservation> {
        texts
            .iter()
            .map(|text| TextObservation {
                text: text.to_string(),
            })
            .collect()
    }

    fn imprint_settings() -> ImprintSettings {
        let mut settings = Settings::default().imprint;
        settings.corrections.insert("H15".into(), "HIS".into());
        settings
    }

    #[test]
    fn normalized_text_is_uppercase_alphanumeric() {
        let samples = ["a-b 1", "Gh8.", "  tylenol 500mg  ", "@@@", "ABCDEFG123"];
        let settings = imprint_settings();
        for sample in samples {
            let result = extract_best(&observations(&["", sample]), &settings);
            assert!(result.text.len() <= settings.max_len);
            assert!(
                result
                    .text
                    .chars()
                    .all(|ch| ch.is_ascii_uppercase() || ch.is_ascii_digit()),
                "bad imprint {:?}",
                result.text
            );
        }
    }

    #[test]
    fn mixed_alphanumeric_beats_digits_beats_letters() {
        let settings = imprint_settings();
        let result = extract_best(&observations(&["ignored full", "ABC", "123", "A12"]), &settings);
        assert_eq!(result.text, "A12");
        assert!((result.confidence - 1.0).abs() < f32::EPSILON);

        let result = extract_best(&observations(&["ignored full", "ABC", "123"]), &settings);
        assert_eq!(result.text, "123");
    }

    #[test]
    fn stoplist_tokens_are_rejected() {
        let settings = imprint_settings();
        let result = extract_best(&observations(&["TAB KOREA", "TAB", "KOREA", "MG"]), &settings);
        assert!(result.is_empty());
    }

    #[test]
    fn clean_full_frame_text_wins() {
        let settings = imprint_settings();
        // "GH 8" collapses to a strict alphanumeric full-frame candidate.
        let result = extract_best(&observations(&["GH 8", "GH"]), &settings);
        assert_eq!(result.text, "GH8");
    }

    #[test]
    fn single_character_full_frame_text_is_ignored() {
        let settings = imprint_settings();
        assert!(extract_best(&observations(&["A"]), &settings).is_empty());
        // Two characters is the floor for the concatenated candidate.
        assert_eq!(extract_best(&observations(&["A 1"]), &settings).text, "A1");
    }

    #[test]
    fn overlong_tokens_are_dropped() {
        let settings = imprint_settings();
        let result = extract_best(&observations(&["", "PARACETAMOL"]), &settings);
        assert!(result.is_empty());
    }

    #[test]
    fn known_misread_is_rewritten_to_canonical_code() {
        let settings = imprint_settings();
        let result = extract_best(&observations(&["", "H15"]), &settings);
        assert_eq!(result.text, "HIS");
    }
}
