//! Digraph substitution cipher
//!
//! Letters are processed two at a time against a [`CipherMatrix`]:
//! - same row: each letter moves one column right (left to decrypt)
//! - same column: each letter moves one row down (up to decrypt)
//! - otherwise: each letter takes its partner's column within its own row
//!
//! The cipher never fails. Anything that is not a letter is dropped during
//! normalization. It gives no confidentiality against a motivated attacker
//! and no integrity at all.

use super::matrix::{CipherMatrix, GRID_SIZE};
use super::normalize::{letters_only, normalize, prepare_digraphs};

/// Cipher bound to a single key
///
/// Each instance owns its own matrix, so concurrent calls with different
/// keys never share state.
#[derive(Clone, Debug)]
pub struct Playfair {
    matrix: CipherMatrix,
}

#[derive(Clone, Copy)]
enum Direction {
    Encrypt,
    Decrypt,
}

impl Direction {
    /// Offset that moves one step along a row or column, modulo the grid
    fn step(self) -> usize {
        match self {
            Direction::Encrypt => 1,
            Direction::Decrypt => GRID_SIZE - 1,
        }
    }
}

impl Playfair {
    /// Create a cipher for `key`
    pub fn new(key: &str) -> Self {
        Playfair {
            matrix: CipherMatrix::build(key),
        }
    }

    /// The matrix derived from the key
    pub fn matrix(&self) -> &CipherMatrix {
        &self.matrix
    }

    /// Encrypt plaintext
    ///
    /// The output always has even length: doubled letters within a pair are
    /// split and odd-length input is padded before substitution.
    pub fn encrypt(&self, plaintext: &str) -> String {
        let prepared = prepare_digraphs(&normalize(plaintext));
        self.transform(&prepared, Direction::Encrypt)
    }

    /// Decrypt ciphertext
    ///
    /// Separators and padding inserted by [`Playfair::encrypt`] stay in the
    /// output. A trailing unpaired letter is ignored.
    pub fn decrypt(&self, ciphertext: &str) -> String {
        let letters = letters_only(ciphertext);
        self.transform(&letters, Direction::Decrypt)
    }

    fn transform(&self, text: &str, direction: Direction) -> String {
        let letters: Vec<char> = text.chars().collect();
        let mut output = String::with_capacity(letters.len());

        for pair in letters.chunks_exact(2) {
            let (a, b) = self.substitute(pair[0], pair[1], direction);
            output.push(a);
            output.push(b);
        }

        output
    }

    fn substitute(&self, a: char, b: char, direction: Direction) -> (char, char) {
        let (Some((row_a, col_a)), Some((row_b, col_b))) =
            (self.matrix.position(a), self.matrix.position(b))
        else {
            // Input is normalized before it gets here
            return (a, b);
        };

        let step = direction.step();
        if row_a == row_b {
            (
                self.matrix.letter_at(row_a, col_a + step),
                self.matrix.letter_at(row_b, col_b + step),
            )
        } else if col_a == col_b {
            (
                self.matrix.letter_at(row_a + step, col_a),
                self.matrix.letter_at(row_b + step, col_b),
            )
        } else {
            (
                self.matrix.letter_at(row_a, col_b),
                self.matrix.letter_at(row_b, col_a),
            )
        }
    }
}

/// Encrypt `plaintext` under `key`
pub fn encrypt(plaintext: &str, key: &str) -> String {
    Playfair::new(key).encrypt(plaintext)
}

/// Decrypt `ciphertext` under `key`
pub fn decrypt(ciphertext: &str, key: &str) -> String {
    Playfair::new(key).decrypt(ciphertext)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn test_hello_with_playfair_key() {
        let encrypted = encrypt("HELLO", "PLAYFAIR");
        assert_eq!(encrypted, "KGYVRV");
        assert_eq!(decrypt(&encrypted, "PLAYFAIR"), "HELXLO");
    }

    #[test]
    fn test_row_and_column_wrap() {
        // F and P share the top row; F wraps to the first column
        assert_eq!(encrypt("fp", "PLAYFAIR"), "PL");
        assert_eq!(decrypt("PL", "PLAYFAIR"), "FP");

        // U and P share the first column; U wraps to the top row
        assert_eq!(encrypt("up", "PLAYFAIR"), "PI");
        assert_eq!(decrypt("PI", "PLAYFAIR"), "UP");
    }

    #[test]
    fn test_decrypt_keeps_separators() {
        let cases = [
            ("TESTME", "TESTME"),
            ("hello world", "HELXLOZWORLD"),
            ("Hello, World! 123", "HELXLOZWORLDZX"),
            ("xin chào", "XINZCHAO"),
            ("Tiếng Việt", "TIENGZVIET"),
        ];
        for (plaintext, expected) in cases {
            let encrypted = encrypt(plaintext, "PLAYFAIR");
            assert_eq!(decrypt(&encrypted, "PLAYFAIR"), expected, "{plaintext}");
        }
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(encrypt("", "PLAYFAIR"), "");
        assert_eq!(decrypt("", "PLAYFAIR"), "");
        assert_eq!(encrypt("123 !?", "PLAYFAIR").len() % 2, 0);
    }

    #[test]
    fn test_different_keys_differ_but_agree_on_plaintext() {
        let a = encrypt("HELLO", "PLAYFAIR");
        let b = encrypt("HELLO", "KEYWORD");
        assert_ne!(a, b);
        assert_eq!(decrypt(&a, "PLAYFAIR"), decrypt(&b, "KEYWORD"));
    }

    #[test]
    fn test_output_is_even_and_uppercase() {
        let encrypted = encrypt("This is a longer text to test the cipher", "secret");
        assert_eq!(encrypted.len() % 2, 0);
        assert!(encrypted.chars().all(|c| c.is_ascii_uppercase() && c != 'J'));
    }

    #[test]
    fn test_decrypt_ignores_trailing_letter() {
        let encrypted = encrypt("HELLO", "PLAYFAIR");
        let odd = format!("{encrypted}A");
        assert_eq!(decrypt(&odd, "PLAYFAIR"), "HELXLO");
    }

    #[test]
    fn test_roundtrip_matches_normalized_form() {
        let alphabet: Vec<char> = "ABCDEFGHIKLMNOPQRSTUVWXYZ ".chars().collect();
        let mut rng = rand::thread_rng();

        for _ in 0..200 {
            let len = rng.gen_range(0..40);
            let text: String = (0..len)
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                .collect();
            let key: String = (0..rng.gen_range(0..12))
                .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
                .collect();

            let expected = prepare_digraphs(&normalize(&text));
            assert_eq!(decrypt(&encrypt(&text, &key), &key), expected, "{text:?} / {key:?}");
        }
    }

    #[test]
    fn test_concurrent_keys_are_independent() {
        let handles: Vec<_> = ["ALPHA", "BRAVO", "CHARLIE", "DELTA"]
            .into_iter()
            .map(|key| {
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        let ct = encrypt("attack at dawn", key);
                        assert_eq!(decrypt(&ct, key), "ATTACKZATZDAWN");
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
    }
}
