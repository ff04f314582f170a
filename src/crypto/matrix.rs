//! Key-derived 5x5 alphabet matrix
//!
//! The grid holds every letter except `J` exactly once. Key letters come
//! first in order of first appearance, then the rest of the alphabet in
//! order. `J` shares the cell of `I`.

use std::fmt;

use super::normalize::letters_only;

/// Number of rows and columns in the matrix
pub const GRID_SIZE: usize = 5;

/// Number of cells in the matrix
pub const CELL_COUNT: usize = GRID_SIZE * GRID_SIZE;

/// Immutable 5x5 cipher alphabet derived from a key
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CipherMatrix {
    cells: [u8; CELL_COUNT],
    /// Cell index of each letter `A`..=`Z`
    positions: [u8; 26],
}

impl CipherMatrix {
    /// Build the matrix for `key`
    ///
    /// Non-letters in the key are ignored and case does not matter, so
    /// `"play fair!"` and `"PLAYFAIR"` produce the same grid.
    pub fn build(key: &str) -> Self {
        let mut cells = [0u8; CELL_COUNT];
        let mut positions = [0u8; 26];
        let mut used = [false; 26];
        used[letter_index(b'J')] = true;

        let mut filled = 0;
        let key_letters = letters_only(key);
        for letter in key_letters.bytes().chain(b'A'..=b'Z') {
            let slot = letter_index(letter);
            if used[slot] {
                continue;
            }
            used[slot] = true;
            cells[filled] = letter;
            positions[slot] = filled as u8;
            filled += 1;
        }
        debug_assert_eq!(filled, CELL_COUNT);

        positions[letter_index(b'J')] = positions[letter_index(b'I')];

        CipherMatrix { cells, positions }
    }

    /// Row and column of `letter`, or `None` for anything outside `A`-`Z`
    pub fn position(&self, letter: char) -> Option<(usize, usize)> {
        if !letter.is_ascii_uppercase() {
            return None;
        }
        let cell = self.positions[letter_index(letter as u8)] as usize;
        Some((cell / GRID_SIZE, cell % GRID_SIZE))
    }

    /// Letter stored at `(row, col)`
    ///
    /// Both coordinates wrap around the grid.
    pub fn letter_at(&self, row: usize, col: usize) -> char {
        self.cells[(row % GRID_SIZE) * GRID_SIZE + (col % GRID_SIZE)] as char
    }

    /// Iterate over the grid rows
    pub fn rows(&self) -> impl Iterator<Item = &[u8]> {
        self.cells.chunks(GRID_SIZE)
    }
}

impl fmt::Display for CipherMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for row in self.rows() {
            let line: Vec<String> = row.iter().map(|&b| (b as char).to_string()).collect();
            writeln!(f, "{}", line.join(" "))?;
        }
        Ok(())
    }
}

impl fmt::Debug for CipherMatrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rows: Vec<&str> = self
            .rows()
            .map(|row| std::str::from_utf8(row).unwrap_or("?????"))
            .collect();
        f.debug_tuple("CipherMatrix").field(&rows).finish()
    }
}

fn letter_index(letter: u8) -> usize {
    (letter - b'A') as usize
}
