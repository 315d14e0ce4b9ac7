//! End-to-end properties of the block cipher engine over real files.

use std::io::Write;
use std::os::unix::fs::FileExt;

use tempfile::tempfile;
use veilfs::overlay::crypto::{CipherEngine, CipherSuite, KeySize, NodeCipher, BLOCK_SIZE};

fn engine() -> CipherEngine {
    CipherEngine::new(
        CipherSuite::from_passphrase(b"integration suite", KeySize::Bits256),
        true,
    )
}

#[test]
fn every_write_reads_back_byte_for_byte() {
    let eng = engine();
    let node = NodeCipher::new();
    let file = tempfile().unwrap();

    // a mix of aligned, unaligned, overlapping and extending writes
    let writes: &[(u64, &[u8])] = &[
        (0, b"the quick brown fox"),
        (1020, b"spans the first block boundary"),
        (4096, &[0xaa; 2048]),
        (10, b"overwrites the middle"),
        (2048, &[0x55; BLOCK_SIZE]),
    ];

    let mut expected = vec![0u8; 6144];
    for &(off, data) in writes {
        let size = file.metadata().unwrap().len();
        eng.write_blocks(&node, &file, size, off, data).unwrap();
        let end = off as usize + data.len();
        if end > expected.len() {
            expected.resize(end, 0);
        }
        expected[off as usize..end].copy_from_slice(data);
    }

    let total = file.metadata().unwrap().len() as usize;
    assert_eq!(total, expected.len());

    let fresh = NodeCipher::new();
    let mut out = vec![0u8; total];
    let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
    assert_eq!(n, total);
    assert_eq!(out, expected);
}

#[test]
fn roundtrip_holds_for_every_tail_length() {
    let suite = CipherSuite::from_passphrase(b"tails", KeySize::Bits256);
    for n in (1..=BLOCK_SIZE).step_by(61) {
        let mut buf: Vec<u8> = (0..n).map(|i| (i * 31 % 256) as u8).collect();
        let orig = buf.clone();
        if n == BLOCK_SIZE {
            suite.block_encrypt(&mut buf, 42).unwrap();
            suite.block_decrypt(&mut buf, 42).unwrap();
        } else {
            suite.stream_encrypt(&mut buf, 42);
            suite.stream_decrypt(&mut buf, 42);
        }
        assert_eq!(buf, orig, "tail length {n}");
    }
}

#[test]
fn partial_tail_pads_correctly_on_extension() {
    let eng = engine();
    let node = NodeCipher::new();
    let file = tempfile().unwrap();

    // a short tail, then a write in a later block forces the tail block
    // to be padded out to a full block of zeros
    eng.write_blocks(&node, &file, 0, 0, b"tail").unwrap();
    eng.write_blocks(&node, &file, 4, 3000, b"later").unwrap();

    let fresh = NodeCipher::new();
    let mut out = vec![0u8; 3005];
    let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
    assert_eq!(n, 3005);
    assert_eq!(&out[..4], b"tail");
    assert!(out[4..3000].iter().all(|&b| b == 0));
    assert_eq!(&out[3000..], b"later");
}

#[test]
fn hole_blocks_pass_through_as_zeros() {
    let eng = engine();
    let node = NodeCipher::new();
    let mut file = tempfile().unwrap();

    // 4096 raw zero bytes on disk read back as 4096 zeros
    file.write_all(&[0u8; 4096]).unwrap();
    let mut out = vec![0xffu8; 4096];
    let n = eng.read_blocks(&node, &file, 0, &mut out).unwrap();
    assert_eq!(n, 4096);
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn ciphertext_differs_but_length_matches() {
    let eng = engine();
    let node = NodeCipher::new();
    let file = tempfile().unwrap();

    let payload: Vec<u8> = (0..5000).map(|i| (i % 199) as u8).collect();
    eng.write_blocks(&node, &file, 0, 0, &payload).unwrap();

    assert_eq!(file.metadata().unwrap().len(), 5000);
    let mut raw = vec![0u8; 5000];
    file.read_at(&mut raw, 0).unwrap();
    assert_ne!(raw, payload);
}

#[test]
fn different_passphrases_produce_different_ciphertext() {
    let a = CipherSuite::from_passphrase(b"one", KeySize::Bits256);
    let b = CipherSuite::from_passphrase(b"two", KeySize::Bits256);

    let mut buf_a = vec![7u8; BLOCK_SIZE];
    let mut buf_b = vec![7u8; BLOCK_SIZE];
    a.block_encrypt(&mut buf_a, 0).unwrap();
    b.block_encrypt(&mut buf_b, 0).unwrap();
    assert_ne!(buf_a, buf_b);
}

#[test]
fn read_past_eof_is_truncated() {
    let eng = engine();
    let node = NodeCipher::new();
    let file = tempfile().unwrap();

    eng.write_blocks(&node, &file, 0, 0, b"short").unwrap();

    let fresh = NodeCipher::new();
    let mut out = vec![0u8; 4096];
    let n = eng.read_blocks(&fresh, &file, 0, &mut out).unwrap();
    assert_eq!(n, 5);
    assert_eq!(&out[..5], b"short");

    let mut beyond = vec![0u8; 64];
    let n = eng
        .read_blocks(&fresh, &file, 2048, &mut beyond)
        .unwrap();
    assert_eq!(n, 0);
}
