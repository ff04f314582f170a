//! Text normalization
//!
//! Both the cipher and the server-side phrase search reduce text to the
//! 25-letter alphabet the same way, so a phrase typed by a user matches the
//! decrypted form of a message bit-for-bit.
//!
//! Normalization rules, in order:
//! 1. canonical decomposition, combining marks dropped (`chào` -> `chao`)
//! 2. uppercase
//! 3. `' '` becomes [`SPACE_FILLER`]
//! 4. `J` becomes `I`
//! 5. anything else outside `A`-`Z` is discarded

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Letter substituted for every space before encryption
pub const SPACE_FILLER: char = 'Z';

/// Letter inserted between doubled letters and used to pad odd-length text
pub const SEPARATOR: char = 'X';

/// Separator used when the letter being split or padded is itself `X`
pub const SEPARATOR_ALT: char = 'Y';

/// Normalize free text (plaintext or search phrase) to the cipher alphabet
pub fn normalize(text: &str) -> String {
    text.nfd()
        .filter(|c| !is_combining_mark(*c))
        .flat_map(char::to_uppercase)
        .filter_map(fold_letter)
        .collect()
}

/// Reduce text that is already cipher output to bare letters
///
/// Unlike [`normalize`], spaces are dropped rather than mapped.
pub fn letters_only(text: &str) -> String {
    text.chars()
        .map(|c| c.to_ascii_uppercase())
        .filter(char::is_ascii_uppercase)
        .map(merge_j)
        .collect()
}

/// Split normalized text into digraph-ready form
///
/// Walks the text pair by pair. When both letters of a pair are equal a
/// separator goes after the first letter and pairing restarts from the
/// second. A trailing single letter is padded the same way, so the result
/// always has even length.
pub fn prepare_digraphs(normalized: &str) -> String {
    let letters: Vec<char> = normalized.chars().collect();
    let mut prepared = String::with_capacity(letters.len() + letters.len() / 2 + 1);

    let mut i = 0;
    while i < letters.len() {
        let first = letters[i];
        match letters.get(i + 1) {
            Some(&second) if second != first => {
                prepared.push(first);
                prepared.push(second);
                i += 2;
            }
            _ => {
                prepared.push(first);
                prepared.push(separator_for(first));
                i += 1;
            }
        }
    }

    prepared
}

/// Separator to place after `letter`
pub fn separator_for(letter: char) -> char {
    if letter == SEPARATOR {
        SEPARATOR_ALT
    } else {
        SEPARATOR
    }
}

fn fold_letter(c: char) -> Option<char> {
    match c {
        ' ' => Some(SPACE_FILLER),
        // Đ has no decomposition
        'Đ' => Some('D'),
        'A'..='Z' => Some(merge_j(c)),
        _ => None,
    }
}

fn merge_j(c: char) -> char {
    if c == 'J' {
        'I'
    } else {
        c
    }
}
