pub mod aead;
pub mod constant_time;
pub mod kdf;
pub mod pqc;
pub mod signing;

pub use constant_time::{eq_16, eq_32, eq_slices};
pub use pqc::{KemError, KemKeypair};
pub use signing::{SignError, SigningKeypair};
