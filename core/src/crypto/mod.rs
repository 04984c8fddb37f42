/// Platform cipher: key derivation and the CBC message codec
pub mod cipher;
pub mod keys;

pub use cipher::{candidate_versions, decrypt, encrypt, DEFAULT_SCHEME_VERSION};
pub use keys::derive_key;
