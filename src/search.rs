//! Phrase search over decrypted text
//!
//! The server looks for a configured phrase inside every decrypted message.
//! Decrypted text is already in cipher alphabet form (uppercase, `Z` for
//! spaces, separators kept), so the phrase is normalized the same way before
//! matching.

use crate::crypto::normalize;

/// Normalize a search phrase into cipher alphabet form
///
/// `"xin chào"` becomes `"XINZCHAO"`.
pub fn normalize_phrase(phrase: &str) -> String {
    normalize(phrase)
}

/// Start index of every occurrence of `phrase` in `text`
///
/// Both arguments are compared as given; callers pass a normalized phrase.
/// Indices count characters from 0 and overlapping matches are reported.
/// An empty phrase matches nothing.
pub fn find_positions(text: &str, phrase: &str) -> Vec<usize> {
    if phrase.is_empty() {
        return Vec::new();
    }

    let text: Vec<char> = text.chars().collect();
    let phrase: Vec<char> = phrase.chars().collect();
    if phrase.len() > text.len() {
        return Vec::new();
    }

    text.windows(phrase.len())
        .enumerate()
        .filter(|(_, window)| *window == phrase.as_slice())
        .map(|(index, _)| index)
        .collect()
}
