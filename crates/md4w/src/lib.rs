// Wrapper for MD4 libraries.
// Piece verification is the majority of CPU usage of the engine, so keep
// the hasher behind a trait in case a faster backend shows up.

#[cfg(feature = "md4-rust")]
pub type Md4 = Md4Rust;

pub trait IMd4 {
    fn new() -> Self;
    fn update(&mut self, buf: &[u8]);
    fn finish(self) -> [u8; 16];
}

#[cfg(feature = "md4-rust")]
pub struct Md4Rust {
    inner: md4::Md4,
}

#[cfg(feature = "md4-rust")]
impl IMd4 for Md4Rust {
    fn new() -> Self {
        use md4::Digest;
        Md4Rust {
            inner: md4::Md4::new(),
        }
    }

    fn update(&mut self, buf: &[u8]) {
        md4::Digest::update(&mut self.inner, buf)
    }

    fn finish(self) -> [u8; 16] {
        let result = md4::Digest::finalize(self.inner);
        debug_assert_eq!(result.len(), 16);
        let mut result_arr = [0u8; 16];
        result_arr.copy_from_slice(&result);
        result_arr
    }
}

pub fn md4(buf: &[u8]) -> [u8; 16] {
    let mut h = Md4::new();
    h.update(buf);
    h.finish()
}

/// The eDonkey file hash: the piece hash itself for single-piece files,
/// otherwise the MD4 of all piece hashes concatenated.
pub fn ed2k_file_hash(piece_hashes: &[[u8; 16]]) -> [u8; 16] {
    if let [single] = piece_hashes {
        return *single;
    }
    let mut h = Md4::new();
    for p in piece_hashes {
        h.update(p);
    }
    h.finish()
}
