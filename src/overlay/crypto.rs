//! Per-file block encryption for the upper layer.
//!
//! Upper-layer regular files are stored as ciphertext: a sequence of
//! 1024-byte blocks, each encrypted with AES-CBC under a per-block IV
//! derived by HMAC-SHA1 from the master key and the block number. The
//! final partial block uses an AES-CFB stream construction with two
//! passes so both ends of the data depend on each other. Ciphertext size
//! equals plaintext size; there is no header and no authentication.
//!
//! Reads and writes are routed through a per-node single-block cache so
//! that partial-block traffic does not decrypt the same block twice.

use aes::{Aes128, Aes192, Aes256};
use cbc::cipher::block_padding::NoPadding;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use cfb_mode::cipher::AsyncStreamCipher;
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha1::{Digest, Sha1};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

/// Size of one encrypted block on disk.
pub const BLOCK_SIZE: usize = 1024;

const IV_LEN: usize = 16;
const AES_BLOCK: usize = 16;
const KDF_ROUNDS: usize = 16;

const PASSPHRASE_ENV: &str = "VEILFS_PASSPHRASE";
const DEFAULT_PASSPHRASE: &str = "darkforest";

type HmacSha1 = Hmac<Sha1>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySize {
    Bits128,
    Bits192,
    Bits256,
}

impl KeySize {
    fn byte_len(self) -> usize {
        match self {
            KeySize::Bits128 => 16,
            KeySize::Bits192 => 24,
            KeySize::Bits256 => 32,
        }
    }
}

fn bad_message() -> io::Error {
    io::Error::from_raw_os_error(libc::EBADMSG)
}

/// OpenSSL's EVP_BytesToKey with SHA-1 and no salt: each round hashes
/// the previous digest concatenated with the passphrase, then re-hashes
/// the digest `rounds - 1` more times; output bytes are drawn from the
/// concatenated digests.
fn bytes_to_key(passphrase: &[u8], key_len: usize) -> (Vec<u8>, [u8; IV_LEN]) {
    let mut material: Vec<u8> = Vec::new();
    let mut prev: Vec<u8> = Vec::new();

    while material.len() < key_len + IV_LEN {
        let mut hasher = Sha1::new();
        hasher.update(&prev);
        hasher.update(passphrase);
        let mut digest = hasher.finalize();
        for _ in 1..KDF_ROUNDS {
            digest = Sha1::digest(digest.as_slice());
        }
        prev = digest.to_vec();
        material.extend_from_slice(&prev);
    }

    let mut iv_base = [0u8; IV_LEN];
    iv_base.copy_from_slice(&material[key_len..key_len + IV_LEN]);
    (material[..key_len].to_vec(), iv_base)
}

/// In-place running XOR: each byte absorbs the one before it.
fn shuffle(buf: &mut [u8]) {
    for i in 0..buf.len().saturating_sub(1) {
        buf[i + 1] ^= buf[i];
    }
}

fn unshuffle(buf: &mut [u8]) {
    for i in (1..buf.len()).rev() {
        buf[i] ^= buf[i - 1];
    }
}

fn flip(buf: &mut [u8]) {
    buf.reverse();
}

/// Master key material plus the derived IV base.
pub struct CipherSuite {
    key: Vec<u8>,
    iv_base: [u8; IV_LEN],
}

impl CipherSuite {
    pub fn from_passphrase(passphrase: &[u8], size: KeySize) -> Self {
        let (key, iv_base) = bytes_to_key(passphrase, size.byte_len());
        CipherSuite { key, iv_base }
    }

    /// Passphrase from the environment, falling back to the historic
    /// built-in phrase. The built-in exists for compatibility with trees
    /// written by earlier deployments and should not be relied on.
    pub fn from_env(size: KeySize) -> Self {
        let passphrase =
            std::env::var(PASSPHRASE_ENV).unwrap_or_else(|_| DEFAULT_PASSPHRASE.to_string());
        Self::from_passphrase(passphrase.as_bytes(), size)
    }

    /// Per-block IV: HMAC-SHA1 over the IV base and the little-endian
    /// block number, truncated to the cipher IV width.
    fn derive_iv(&self, block: u64) -> [u8; IV_LEN] {
        let mut mac = <HmacSha1 as Mac>::new_from_slice(&self.key).expect("hmac key");
        mac.update(&self.iv_base);
        mac.update(&block.to_le_bytes());
        let tag = mac.finalize().into_bytes();
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(&tag[..IV_LEN]);
        iv
    }

    /// AES-CBC over a whole number of cipher blocks, no padding.
    pub fn block_encrypt(&self, buf: &mut [u8], block: u64) -> io::Result<()> {
        if buf.len() % AES_BLOCK != 0 {
            return Err(bad_message());
        }
        let iv = self.derive_iv(block);
        let len = buf.len();
        let res = match self.key.len() {
            16 => cbc::Encryptor::<Aes128>::new_from_slices(&self.key, &iv)
                .expect("cbc key/iv")
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map(|_| ()),
            24 => cbc::Encryptor::<Aes192>::new_from_slices(&self.key, &iv)
                .expect("cbc key/iv")
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map(|_| ()),
            _ => cbc::Encryptor::<Aes256>::new_from_slices(&self.key, &iv)
                .expect("cbc key/iv")
                .encrypt_padded_mut::<NoPadding>(buf, len)
                .map(|_| ()),
        };
        res.map_err(|_| bad_message())
    }

    pub fn block_decrypt(&self, buf: &mut [u8], block: u64) -> io::Result<()> {
        if buf.len() % AES_BLOCK != 0 {
            return Err(bad_message());
        }
        let iv = self.derive_iv(block);
        let res = match self.key.len() {
            16 => cbc::Decryptor::<Aes128>::new_from_slices(&self.key, &iv)
                .expect("cbc key/iv")
                .decrypt_padded_mut::<NoPadding>(buf)
                .map(|_| ()),
            24 => cbc::Decryptor::<Aes192>::new_from_slices(&self.key, &iv)
                .expect("cbc key/iv")
                .decrypt_padded_mut::<NoPadding>(buf)
                .map(|_| ()),
            _ => cbc::Decryptor::<Aes256>::new_from_slices(&self.key, &iv)
                .expect("cbc key/iv")
                .decrypt_padded_mut::<NoPadding>(buf)
                .map(|_| ()),
        };
        res.map_err(|_| bad_message())
    }

    fn cfb_encrypt(&self, buf: &mut [u8], iv: &[u8; IV_LEN]) {
        match self.key.len() {
            16 => cfb_mode::Encryptor::<Aes128>::new_from_slices(&self.key, iv)
                .expect("cfb key/iv")
                .encrypt(buf),
            24 => cfb_mode::Encryptor::<Aes192>::new_from_slices(&self.key, iv)
                .expect("cfb key/iv")
                .encrypt(buf),
            _ => cfb_mode::Encryptor::<Aes256>::new_from_slices(&self.key, iv)
                .expect("cfb key/iv")
                .encrypt(buf),
        }
    }

    fn cfb_decrypt(&self, buf: &mut [u8], iv: &[u8; IV_LEN]) {
        match self.key.len() {
            16 => cfb_mode::Decryptor::<Aes128>::new_from_slices(&self.key, iv)
                .expect("cfb key/iv")
                .decrypt(buf),
            24 => cfb_mode::Decryptor::<Aes192>::new_from_slices(&self.key, iv)
                .expect("cfb key/iv")
                .decrypt(buf),
            _ => cfb_mode::Decryptor::<Aes256>::new_from_slices(&self.key, iv)
                .expect("cfb key/iv")
                .decrypt(buf),
        }
    }

    /// Partial blocks use a stream construction with two passes so the
    /// ends of the data depend on each other: shuffle, CFB under the
    /// block's IV, flip, shuffle again, CFB under the next block's IV.
    pub fn stream_encrypt(&self, buf: &mut [u8], block: u64) {
        shuffle(buf);
        self.cfb_encrypt(buf, &self.derive_iv(block));
        flip(buf);
        shuffle(buf);
        self.cfb_encrypt(buf, &self.derive_iv(block.wrapping_add(1)));
    }

    /// Exact inverse of [`Self::stream_encrypt`].
    pub fn stream_decrypt(&self, buf: &mut [u8], block: u64) {
        self.cfb_decrypt(buf, &self.derive_iv(block.wrapping_add(1)));
        unshuffle(buf);
        flip(buf);
        self.cfb_decrypt(buf, &self.derive_iv(block));
        unshuffle(buf);
    }
}

/// Single-block read/write cache. One per node; guarded by the node's
/// mutex so cipher transforms on the cache buffer are serialized.
struct BlockCache {
    offset: u64,
    data_len: usize,
    data: Box<[u8]>,
}

impl BlockCache {
    fn new() -> Self {
        BlockCache {
            offset: 0,
            data_len: 0,
            data: vec![0u8; BLOCK_SIZE].into_boxed_slice(),
        }
    }

    fn clear(&mut self) {
        self.data.fill(0);
        self.data_len = 0;
    }
}

/// Per-node cipher state.
pub struct NodeCipher {
    cache: Mutex<BlockCache>,
}

impl NodeCipher {
    pub fn new() -> Self {
        NodeCipher {
            cache: Mutex::new(BlockCache::new()),
        }
    }

    pub fn invalidate(&self) {
        self.cache.lock().clear();
    }
}

impl Default for NodeCipher {
    fn default() -> Self {
        Self::new()
    }
}

/// The block cipher engine: transforms block-aligned reads and writes
/// against upper-layer data files.
pub struct CipherEngine {
    suite: CipherSuite,
    allow_holes: bool,
}

impl CipherEngine {
    pub fn new(suite: CipherSuite, allow_holes: bool) -> Self {
        CipherEngine { suite, allow_holes }
    }

    pub fn suite(&self) -> &CipherSuite {
        &self.suite
    }

    /// Read and decode one block (or a leading slice of one). `buf.len()`
    /// must not exceed [`BLOCK_SIZE`] and `offset` must be block-aligned.
    /// A short underlying read defines EOF within the block.
    fn read_one_block(&self, file: &File, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let block = offset / BLOCK_SIZE as u64;
        let read_size = file.read_at(buf, offset)?;
        if read_size == 0 {
            return Ok(0);
        }

        let data = &mut buf[..read_size];
        if read_size != BLOCK_SIZE {
            self.suite.stream_decrypt(data, block);
        } else if self.allow_holes && data.iter().all(|&b| b == 0) {
            // an unwritten hole reads back as zeros, no decode
        } else {
            self.suite.block_decrypt(data, block)?;
        }
        Ok(read_size)
    }

    /// Encode and write one block (or a partial tail). The caller's data
    /// is copied before encryption so the caller's buffer is never
    /// mutated in place.
    fn write_one_block(&self, file: &File, offset: u64, data: &mut [u8]) -> io::Result<usize> {
        let block = offset / BLOCK_SIZE as u64;
        if data.len() != BLOCK_SIZE {
            self.suite.stream_encrypt(data, block);
        } else {
            self.suite.block_encrypt(data, block)?;
        }
        file.write_all_at(data, offset)?;
        Ok(data.len())
    }

    /// Serve a read of at most one block at a block-aligned offset,
    /// consulting the node cache first. The underlying read always asks
    /// for a full block so the cache holds whole blocks.
    fn cache_read_one_block(
        &self,
        node: &NodeCipher,
        file: &File,
        offset: u64,
        buf: &mut [u8],
    ) -> io::Result<usize> {
        let mut cache = node.cache.lock();

        if cache.offset == offset && cache.data_len != 0 {
            let len = buf.len().min(cache.data_len);
            buf[..len].copy_from_slice(&cache.data[..len]);
            return Ok(len);
        }

        if cache.data_len > 0 {
            cache.clear();
        }

        let mut full = [0u8; BLOCK_SIZE];
        let result = self.read_one_block(file, offset, &mut full)?;
        if result > 0 {
            cache.data[..result].copy_from_slice(&full[..result]);
            cache.offset = offset;
            cache.data_len = result;
            let len = buf.len().min(result);
            buf[..len].copy_from_slice(&full[..len]);
            return Ok(len);
        }
        Ok(result)
    }

    /// Write at most one block at a block-aligned offset through the
    /// cache: on success the cache holds the plaintext just written, on
    /// failure it is dropped.
    fn cache_write_one_block(
        &self,
        node: &NodeCipher,
        file: &File,
        offset: u64,
        data: &[u8],
    ) -> io::Result<usize> {
        let mut cache = node.cache.lock();

        let mut scratch = [0u8; BLOCK_SIZE];
        scratch[..data.len()].copy_from_slice(data);
        match self.write_one_block(file, offset, &mut scratch[..data.len()]) {
            Ok(n) => {
                cache.data[..data.len()].copy_from_slice(data);
                if data.len() < BLOCK_SIZE {
                    cache.data[data.len()..].fill(0);
                }
                cache.offset = offset;
                cache.data_len = data.len();
                Ok(n)
            }
            Err(e) => {
                cache.clear();
                Err(e)
            }
        }
    }

    /// Decode a read of arbitrary size and alignment.
    pub fn read_blocks(
        &self,
        node: &NodeCipher,
        file: &File,
        offset: u64,
        out: &mut [u8],
    ) -> io::Result<usize> {
        let mut partial = (offset % BLOCK_SIZE as u64) as usize;
        let mut block = offset / BLOCK_SIZE as u64;

        if partial == 0 && out.len() <= BLOCK_SIZE {
            return self.cache_read_one_block(node, file, offset, out);
        }

        let mut scratch = [0u8; BLOCK_SIZE];
        let mut size = out.len();
        let mut pos = 0usize;
        let mut total = 0usize;

        while size != 0 {
            let block_off = block * BLOCK_SIZE as u64;
            let direct = partial == 0 && size >= BLOCK_SIZE;

            let read_size = if direct {
                self.cache_read_one_block(node, file, block_off, &mut out[pos..pos + BLOCK_SIZE])?
            } else {
                self.cache_read_one_block(node, file, block_off, &mut scratch)?
            };

            if read_size <= partial {
                break; // EOF inside the skipped prefix
            }

            let cpy = (read_size - partial).min(size);
            if !direct {
                out[pos..pos + cpy].copy_from_slice(&scratch[partial..partial + cpy]);
            }

            total += cpy;
            size -= cpy;
            pos += cpy;
            block += 1;
            partial = 0;

            if read_size < BLOCK_SIZE {
                break;
            }
        }

        Ok(total)
    }

    /// Zero-fill between the old and new end of file so the gap reads
    /// back as zeros. The shared last block is left for the next real
    /// write unless `force` is set.
    pub fn pad_file(
        &self,
        node: &NodeCipher,
        file: &File,
        old_size: u64,
        new_size: u64,
        force: bool,
    ) -> io::Result<()> {
        let mut old_last = old_size / BLOCK_SIZE as u64;
        let new_last = new_size / BLOCK_SIZE as u64;
        let new_tail = (new_size % BLOCK_SIZE as u64) as usize;

        let mut scratch = [0u8; BLOCK_SIZE];

        if old_last == new_last {
            // the next real write pads the shared block anyway, unless a
            // forced extension must land now
            if !force || new_tail == 0 {
                return Ok(());
            }
            let block_off = old_last * BLOCK_SIZE as u64;
            let old_tail = (old_size % BLOCK_SIZE as u64) as usize;
            if old_tail != 0 {
                self.cache_read_one_block(node, file, block_off, &mut scratch[..old_tail])?;
            }
            self.cache_write_one_block(node, file, block_off, &scratch[..new_tail])?;
            return Ok(());
        }

        // extend the old partial tail to a full zero-padded block
        let old_tail = (old_size % BLOCK_SIZE as u64) as usize;
        if old_tail != 0 {
            let block_off = old_last * BLOCK_SIZE as u64;
            self.cache_read_one_block(node, file, block_off, &mut scratch[..old_tail])?;
            self.cache_write_one_block(node, file, block_off, &scratch)?;
            old_last += 1;
        }

        // intervening blocks are real zero blocks unless holes are allowed
        if !self.allow_holes {
            while old_last < new_last {
                scratch.fill(0);
                self.cache_write_one_block(
                    node,
                    file,
                    old_last * BLOCK_SIZE as u64,
                    &scratch,
                )?;
                old_last += 1;
            }
        }

        if force && new_tail != 0 {
            scratch.fill(0);
            self.cache_write_one_block(
                node,
                file,
                new_last * BLOCK_SIZE as u64,
                &scratch[..new_tail],
            )?;
        }

        Ok(())
    }

    /// Encode a write of arbitrary size and alignment against a file
    /// whose current on-disk size is `file_size`. Returns the number of
    /// payload bytes written.
    pub fn write_blocks(
        &self,
        node: &NodeCipher,
        file: &File,
        file_size: u64,
        offset: u64,
        data: &[u8],
    ) -> io::Result<usize> {
        let mut block = offset / BLOCK_SIZE as u64;
        let mut partial = (offset % BLOCK_SIZE as u64) as usize;

        let last_file_block = file_size / BLOCK_SIZE as u64;
        let last_block_size = (file_size % BLOCK_SIZE as u64) as usize;

        let last_nonempty: i64 = if last_block_size == 0 {
            last_file_block as i64 - 1
        } else {
            last_file_block as i64
        };

        if offset > file_size {
            // fill the hole with zeros first
            self.pad_file(node, file, file_size, offset, false)?;
        }

        // single-block fast paths that need no merging
        if partial == 0 && data.len() <= BLOCK_SIZE {
            if data.len() == BLOCK_SIZE
                || (block == last_file_block && data.len() >= last_block_size)
            {
                return self.cache_write_one_block(node, file, offset, data);
            }
        }

        let mut scratch = [0u8; BLOCK_SIZE];
        let mut size = data.len();
        let mut in_pos = 0usize;

        while size != 0 {
            let block_off = block * BLOCK_SIZE as u64;
            let to_copy = (BLOCK_SIZE - partial).min(size);

            // a whole block, or a fresh tail that needs no merge, goes out
            // directly; everything else merges with the existing block
            if to_copy == BLOCK_SIZE
                || (partial == 0 && block_off + to_copy as u64 >= file_size)
            {
                self.cache_write_one_block(node, file, block_off, &data[in_pos..in_pos + to_copy])?;
            } else {
                scratch.fill(0);
                let mut data_len;
                if block as i64 > last_nonempty {
                    // beyond EOF, just pad
                    data_len = partial + to_copy;
                } else {
                    let read_size = self.cache_read_one_block(node, file, block_off, &mut scratch)?;
                    data_len = read_size.max(partial + to_copy);
                }
                scratch[partial..partial + to_copy]
                    .copy_from_slice(&data[in_pos..in_pos + to_copy]);
                self.cache_write_one_block(node, file, block_off, &scratch[..data_len])?;
            }

            size -= to_copy;
            in_pos += to_copy;
            block += 1;
            partial = 0;
        }

        Ok(data.len())
    }

    /// Encode a whole plaintext file into a ciphertext file, block by
    /// block. Used by copy-up when promoting a lower file to the upper
    /// layer.
    pub fn encode_file(
        &self,
        node: &NodeCipher,
        src: &File,
        dst: &File,
        size: u64,
    ) -> io::Result<()> {
        let mut offset = 0u64;
        let mut buf = [0u8; BLOCK_SIZE];

        while offset < size {
            let want = ((size - offset) as usize).min(BLOCK_SIZE);
            let mut got = 0usize;
            while got < want {
                let n = src.read_at(&mut buf[got..want], offset + got as u64)?;
                if n == 0 {
                    break;
                }
                got += n;
            }
            if got == 0 {
                break;
            }
            self.cache_write_one_block(node, dst, offset, &buf[..got])?;
            offset += got as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempfile;

    fn suite() -> CipherSuite {
        CipherSuite::from_passphrase(b"correct horse", KeySize::Bits256)
    }

    fn engine() -> CipherEngine {
        CipherEngine::new(suite(), true)
    }

    #[test]
    fn kdf_is_deterministic_and_sized() {
        let a = CipherSuite::from_passphrase(b"p", KeySize::Bits256);
        let b = CipherSuite::from_passphrase(b"p", KeySize::Bits256);
        assert_eq!(a.key, b.key);
        assert_eq!(a.iv_base, b.iv_base);
        assert_eq!(a.key.len(), 32);

        let c = CipherSuite::from_passphrase(b"q", KeySize::Bits128);
        assert_eq!(c.key.len(), 16);
        assert_ne!(a.key[..16], c.key[..]);
    }

    #[test]
    fn iv_differs_per_block() {
        let s = suite();
        assert_ne!(s.derive_iv(0), s.derive_iv(1));
        assert_eq!(s.derive_iv(7), s.derive_iv(7));
    }

    #[test]
    fn shuffle_unshuffle_are_inverses() {
        let mut buf: Vec<u8> = (0..=255).collect();
        let orig = buf.clone();
        shuffle(&mut buf);
        assert_ne!(buf, orig);
        unshuffle(&mut buf);
        assert_eq!(buf, orig);
    }

    #[test]
    fn block_roundtrip_all_key_sizes() {
        for size in [KeySize::Bits128, KeySize::Bits192, KeySize::Bits256] {
            let s = CipherSuite::from_passphrase(b"k", size);
            let mut buf = vec![0xabu8; BLOCK_SIZE];
            let orig = buf.clone();
            s.block_encrypt(&mut buf, 3).unwrap();
            assert_ne!(buf, orig);
            s.block_decrypt(&mut buf, 3).unwrap();
            assert_eq!(buf, orig);
        }
    }

    #[test]
    fn block_rejects_ragged_input() {
        let s = suite();
        let mut buf = vec![0u8; 100];
        assert!(s.block_encrypt(&mut buf, 0).is_err());
        assert!(s.block_decrypt(&mut buf, 0).is_err());
    }

    #[test]
    fn stream_roundtrip_every_small_size() {
        let s = suite();
        for n in 1..=128usize {
            let mut buf: Vec<u8> = (0..n).map(|i| (i * 7) as u8).collect();
            let orig = buf.clone();
            s.stream_encrypt(&mut buf, 5);
            assert_ne!(buf, orig, "size {n} unchanged by encryption");
            s.stream_decrypt(&mut buf, 5);
            assert_eq!(buf, orig, "size {n} failed roundtrip");
        }
    }

    #[test]
    fn stream_roundtrip_near_block_size() {
        let s = suite();
        for n in [1000usize, 1023] {
            let mut buf = vec![0x5au8; n];
            let orig = buf.clone();
            s.stream_encrypt(&mut buf, 9);
            s.stream_decrypt(&mut buf, 9);
            assert_eq!(buf, orig);
        }
    }

    #[test]
    fn decrypt_under_wrong_block_number_garbles() {
        let s = suite();
        let mut buf = vec![1u8; BLOCK_SIZE];
        let orig = buf.clone();
        s.block_encrypt(&mut buf, 0).unwrap();
        s.block_decrypt(&mut buf, 1).unwrap();
        assert_ne!(buf, orig);
    }

    #[test]
    fn hole_block_passes_through_untouched() {
        let eng = engine();
        let node = NodeCipher::new();
        let mut file = tempfile().unwrap();
        file.write_all(&[0u8; BLOCK_SIZE]).unwrap();

        let mut out = vec![0xffu8; BLOCK_SIZE];
        let n = eng.read_blocks(&node, &file, 0, &mut out).unwrap();
        assert_eq!(n, BLOCK_SIZE);
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn write_then_read_single_block() {
        let eng = engine();
        let node = NodeCipher::new();
        let file = tempfile().unwrap();

        let data = vec![0x42u8; BLOCK_SIZE];
        eng.write_blocks(&node, &file, 0, 0, &data).unwrap();

        // on-disk bytes are ciphertext
        let mut raw = vec![0u8; BLOCK_SIZE];
        file.read_at(&mut raw, 0).unwrap();
        assert_ne!(raw, data);

        let fresh = NodeCipher::new();
        let mut out = vec![0u8; BLOCK_SIZE];
        let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
        assert_eq!(n, BLOCK_SIZE);
        assert_eq!(out, data);
    }

    #[test]
    fn write_then_read_partial_tail() {
        let eng = engine();
        let node = NodeCipher::new();
        let file = tempfile().unwrap();

        let data = b"hello\n";
        eng.write_blocks(&node, &file, 0, 0, data).unwrap();
        assert_eq!(file.metadata().unwrap().len(), data.len() as u64);

        let fresh = NodeCipher::new();
        let mut out = vec![0u8; 64];
        let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
        assert_eq!(&out[..n], data);
    }

    #[test]
    fn overwrite_merges_with_existing_block() {
        let eng = engine();
        let node = NodeCipher::new();
        let file = tempfile().unwrap();

        eng.write_blocks(&node, &file, 0, 0, b"hello\n").unwrap();
        eng.write_blocks(&node, &file, 6, 0, b"H").unwrap();

        let fresh = NodeCipher::new();
        let mut out = vec![0u8; 16];
        let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
        assert_eq!(&out[..n], b"Hello\n");
    }

    #[test]
    fn spanning_write_reads_back_across_blocks() {
        let eng = engine();
        let node = NodeCipher::new();
        let file = tempfile().unwrap();

        let data: Vec<u8> = (0..3000).map(|i| (i % 251) as u8).collect();
        eng.write_blocks(&node, &file, 0, 100, &data).unwrap();

        let fresh = NodeCipher::new();
        let mut out = vec![0u8; 3000];
        let n = eng.read_blocks(&fresh, &file, 100, &mut out).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(out, data);

        // the gap before the write reads back as zeros
        let mut head = vec![0xffu8; 100];
        let n = eng.read_blocks(&fresh, &file, 0, &mut head).unwrap();
        assert_eq!(n, 100);
        assert!(head.iter().all(|&b| b == 0));
    }

    #[test]
    fn sparse_write_past_eof_zero_fills_gap() {
        let eng = engine();
        let node = NodeCipher::new();
        let file = tempfile().unwrap();

        eng.write_blocks(&node, &file, 0, 0, b"start").unwrap();
        eng.write_blocks(&node, &file, 5, 5000, b"end").unwrap();

        let fresh = NodeCipher::new();
        let mut out = vec![0xffu8; 5003];
        let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
        assert_eq!(n, 5003);
        assert_eq!(&out[..5], b"start");
        assert!(out[5..5000].iter().all(|&b| b == 0));
        assert_eq!(&out[5000..], b"end");
    }

    #[test]
    fn forced_pad_extends_within_one_block() {
        let eng = engine();
        let node = NodeCipher::new();
        let file = tempfile().unwrap();

        eng.write_blocks(&node, &file, 0, 0, b"data").unwrap();
        eng.pad_file(&node, &file, 4, 100, true).unwrap();
        assert_eq!(file.metadata().unwrap().len(), 100);

        let fresh = NodeCipher::new();
        let mut out = vec![0xffu8; 100];
        let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
        assert_eq!(n, 100);
        assert_eq!(&out[..4], b"data");
        assert!(out[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn cache_serves_repeated_reads() {
        let eng = engine();
        let node = NodeCipher::new();
        let file = tempfile().unwrap();

        eng.write_blocks(&node, &file, 0, 0, b"cached data").unwrap();

        let mut a = vec![0u8; 11];
        let mut b = vec![0u8; 11];
        eng.read_blocks(&node, &file, 0, &mut a).unwrap();
        eng.read_blocks(&node, &file, 0, &mut b).unwrap();
        assert_eq!(a, b);
        assert_eq!(&a, b"cached data");
    }

    #[test]
    fn encode_file_matches_pipeline_readback() {
        let eng = engine();
        let node = NodeCipher::new();

        let mut src = tempfile().unwrap();
        let payload: Vec<u8> = (0..2500).map(|i| (i % 13) as u8).collect();
        src.write_all(&payload).unwrap();

        let dst = tempfile().unwrap();
        eng.encode_file(&node, &src, &dst, payload.len() as u64)
            .unwrap();
        assert_eq!(dst.metadata().unwrap().len(), payload.len() as u64);

        let fresh = NodeCipher::new();
        let mut out = vec![0u8; payload.len()];
        let n = eng.read_blocks(&fresh, &dst, 0, &mut out).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(out, payload);
    }
}
