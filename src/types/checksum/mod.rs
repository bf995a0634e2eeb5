#![forbid(unsafe_code)]

/// Incremental checksum over a byte stream.
pub trait Checksum {
    /// Clears all bytes fed so far.
    fn reset(&mut self);
    /// Feeds more bytes.
    fn update(&mut self, bytes: &[u8]);
    /// Returns the checksum of everything fed since the last reset.
    fn finalize(&self) -> u32;
}

/// [`Checksum`] backed by `crc32fast`.
pub struct Crc32Fast {
    inner: crc32fast::Hasher,
}

impl Default for Crc32Fast {
    fn default() -> Self {
        Self {
            inner: crc32fast::Hasher::new(),
        }
    }
}

impl Checksum for Crc32Fast {
    fn reset(&mut self) {
        self.inner.reset();
    }

    fn update(&mut self, bytes: &[u8]) {
        self.inner.update(bytes);
    }

    fn finalize(&self) -> u32 {
        self.inner.clone().finalize()
    }
}

/// Checksum of a range snapshot body, salted with the entry width so a file
/// written with a different `ids_per_entry` never validates by accident.
pub fn snapshot_crc32(ids_per_entry: u32, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&ids_per_entry.to_be_bytes());
    hasher.update(body);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incremental_matches_one_shot() {
        let mut c = Crc32Fast::default();
        c.update(b"ids ");
        let first = c.finalize();
        c.update(b"and ranges");
        let second = c.finalize();
        assert_ne!(first, second);
        c.reset();
        c.update(b"ids and ranges");
        assert_eq!(c.finalize(), second);
    }

    #[test]
    fn snapshot_crc_depends_on_width_and_body() {
        let body = vec![7u8; 32];
        let a = snapshot_crc32(128, &body);
        assert_eq!(a, snapshot_crc32(128, &body));
        assert_ne!(a, snapshot_crc32(256, &body));
        let mut other = body.clone();
        other[5] = 0;
        assert_ne!(a, snapshot_crc32(128, &other));
    }
}
