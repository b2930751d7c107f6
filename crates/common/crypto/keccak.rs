use sha3::Digest as _;

/// Keccak-256 over the input, the FIPS-pre-standard variant Ethereum uses.
pub fn keccak_hash(data: impl AsRef<[u8]>) -> [u8; 32] {
    sha3::Keccak256::digest(data).into()
}

/// Streaming Keccak-256.
#[derive(Debug, Default, Clone)]
pub struct Keccak256 {
    inner: sha3::Keccak256,
}

impl Keccak256 {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(mut self, data: impl AsRef<[u8]>) -> Self {
        sha3::Digest::update(&mut self.inner, data);
        self
    }

    pub fn finalize(self) -> [u8; 32] {
        self.inner.finalize().into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_input() {
        assert_eq!(
            hex::encode(keccak_hash([])),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn streaming_matches_single_shot() {
        let hash = Keccak256::new().update(b"hello").update(b" world").finalize();
        assert_eq!(hash, keccak_hash(b"hello world"));
    }
}
