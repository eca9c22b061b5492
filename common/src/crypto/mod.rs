mod hash;
mod key;

pub mod error;

pub use error::CryptoError;
pub use hash::*;
pub use key::*;
