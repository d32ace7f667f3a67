//! Keyword-overlap scoring for the fuzzy dispatch phase
//!
//! Deliberately simple: the score is the share of a command's keywords
//! that appear as substrings of the utterance. No edit distance.

/// Fraction of `keywords` found in `text`, 0.0 when there are none
pub fn keyword_score<S: AsRef<str>>(text: &str, keywords: &[S]) -> f32 {
    if keywords.is_empty() {
        return 0.0;
    }
    let text = clean_for_matching(text);
    let hits = keywords
        .iter()
        .filter(|k| {
            let k = clean_for_matching(k.as_ref());
            let k = k.trim();
            !k.is_empty() && text.contains(k)
        })
        .count();
    hits as f32 / keywords.len() as f32
}

/// Clean text for matching: lowercase and remove non-alphanumeric characters
pub fn clean_for_matching(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect()
}
