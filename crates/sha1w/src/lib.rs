// Wrapper for sha1 libraries.
// Identifiers in masala are SHA-1 digests of names and host identities. The
// system library (through crypto-hash) is the default; the pure-rust
// implementation can be selected with the "sha1-rust" feature and wins if both
// are enabled.

#[cfg(not(any(feature = "sha1-crypto-hash", feature = "sha1-rust")))]
compile_error!("enable one of the \"sha1-crypto-hash\" or \"sha1-rust\" features");

#[cfg(feature = "sha1-rust")]
pub type Sha1 = Sha1Rust;

#[cfg(all(feature = "sha1-crypto-hash", not(feature = "sha1-rust")))]
pub type Sha1 = Sha1System;

pub const DIGEST_LEN: usize = 20;

pub trait ISha1 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; DIGEST_LEN];
}

/// Digest of the concatenation of all `parts`.
pub fn sha1_concat<'a>(parts: impl IntoIterator<Item = &'a [u8]>) -> [u8; DIGEST_LEN] {
    let mut hash = Sha1::new();
    for part in parts {
        hash.update(part);
    }
    hash.finish()
}

#[cfg(feature = "sha1-rust")]
pub struct Sha1Rust {
    inner: sha1::Sha1,
}

#[cfg(feature = "sha1-rust")]
impl ISha1 for Sha1Rust {
    fn new() -> Self {
        use sha1::Digest;
        Sha1Rust {
            inner: sha1::Sha1::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use sha1::Digest;
        self.inner.update(buf)
    }

    fn finish(self) -> [u8; DIGEST_LEN] {
        use sha1::Digest;
        self.inner.finalize().into()
    }
}

#[cfg(feature = "sha1-crypto-hash")]
pub struct Sha1System {
    inner: crypto_hash::Hasher,
}

#[cfg(feature = "sha1-crypto-hash")]
impl ISha1 for Sha1System {
    fn new() -> Self {
        Self {
            inner: crypto_hash::Hasher::new(crypto_hash::Algorithm::SHA1),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        use std::io::Write;
        // Hashing into memory doesn't fail.
        let _ = self.inner.write_all(buf);
    }

    fn finish(mut self) -> [u8; DIGEST_LEN] {
        let result = self.inner.finish();
        debug_assert_eq!(result.len(), DIGEST_LEN);
        let mut result_arr = [0u8; DIGEST_LEN];
        result_arr.copy_from_slice(&result);
        result_arr
    }
}
