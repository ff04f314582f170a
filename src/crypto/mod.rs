//! Classical cipher used to obscure message text end to end
//!
//! - `normalize`: reduction of free text to the 25-letter alphabet
//! - `matrix`: key-derived 5x5 alphabet grid
//! - `cipher`: digraph substitution over that grid
//!
//! Nothing here touches the network; the protocol and server layers call
//! [`encrypt`] and [`decrypt`] with the key carried by each message.

pub mod cipher;
pub mod matrix;
pub mod normalize;

pub use cipher::{decrypt, encrypt, Playfair};
pub use matrix::CipherMatrix;
pub use normalize::{normalize, SEPARATOR, SPACE_FILLER};
