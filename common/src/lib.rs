pub mod crypto;
pub mod rlp;
pub mod time;

#[cfg(feature = "tokio")]
pub mod tokio;
