use sha2::{Digest as _, Sha256};

/// Width of every digest in the system.
pub const DIGEST_SIZE: usize = 16;

/// Truncated SHA-256 digest.
pub type Digest = [u8; DIGEST_SIZE];

/// Incremental digest builder.
#[derive(Default, Clone)]
pub struct Hasher(Sha256);

impl Hasher {
    pub fn new() -> Self {
        Self(Sha256::new())
    }

    pub fn update(&mut self, data: &[u8]) -> &mut Self {
        self.0.update(data);
        self
    }

    pub fn finish(self) -> Digest {
        let full = self.0.finalize();
        let mut result = [0u8; DIGEST_SIZE];
        result.copy_from_slice(&full[..DIGEST_SIZE]);
        result
    }
}

/// Digest of a single byte string.
pub fn digest(data: &[u8]) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(data);
    hasher.finish()
}

/// Digest of a stored value. A tombstone and an empty live value differ.
pub(crate) fn value_digest(value: &[u8], present: bool) -> Digest {
    let mut hasher = Hasher::new();
    hasher.update(&[present as u8]).update(value);
    hasher.finish()
}
