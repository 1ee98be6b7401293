//! Core identifier types shared across the engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

macro_rules! hash_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Hash);

        impl $name {
            pub fn as_bytes(&self) -> &Hash {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// First eight hex characters, for log lines.
            pub fn short(&self) -> String {
                hex::encode(&self.0[..4])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl From<Hash> for $name {
            fn from(hash: Hash) -> Self {
                Self(hash)
            }
        }
    };
}

hash_newtype!(
    /// Content hash of a function's code plus its declared version.
    LogicFingerprint
);

hash_newtype!(
    /// Structural hash of all inputs of one invocation.
    InputFingerprint
);

hash_newtype!(
    /// Persistent identity of one memoized invocation.
    MemoKey
);

/// Milliseconds since the Unix epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
