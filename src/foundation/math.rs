use xxhash_rust::xxh3::Xxh3;

const XXH3_SEED: u64 = 0x6f1d_24c9_5ab3_07e8;

/// Deterministic hasher for node fingerprints and cache bucket hashes.
///
/// Widths are written explicitly so the digest is stable across platforms.
pub struct StableHasher {
    inner: Xxh3,
}

impl StableHasher {
    pub fn new() -> Self {
        Self {
            inner: Xxh3::with_seed(XXH3_SEED),
        }
    }

    pub fn write_bytes(&mut self, b: &[u8]) {
        self.inner.update(b);
    }

    pub fn write_u8(&mut self, v: u8) {
        self.write_bytes(&[v]);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.write_u8(u8::from(v));
    }

    pub fn write_u32(&mut self, v: u32) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.write_bytes(&v.to_le_bytes());
    }

    pub fn write_i64(&mut self, v: i64) {
        self.write_u64(v as u64);
    }

    pub fn write_f64(&mut self, v: f64) {
        self.write_u64(v.to_bits());
    }

    pub fn write_str(&mut self, s: &str) {
        self.write_u64(s.len() as u64);
        self.write_bytes(s.as_bytes());
    }

    pub fn finish(self) -> u64 {
        self.inner.digest()
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}
