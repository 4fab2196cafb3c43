//! On-the-fly decryption for the memory-mapped external flash.
//!
//! The OTFDEC region uses AES-128-CTR with a counter block derived from the
//! read address:
//!
//! ```text
//! [127:64] nonce   [63:48] version   [47:46] region
//! [45:4]  block number ((aligned - start) >> 4)   [3:0] 0
//! ```
//!
//! Each 16-byte block gets its own counter block (the block-number field
//! advances, the low nibble stays zero), so unaligned reads decrypt the
//! enclosing blocks and slice. The AES-GCM region is served the same way
//! with the GCM counter (IV || n+2); authentication tags are not verified
//! during emulation.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Aes128;

fn key_bytes(words: &[u32; 4]) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    for (i, word) in words.iter().enumerate() {
        bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
    }
    bytes
}

/// AES-128-CTR decryptor for the OTFDEC window.
pub struct OtfDec {
    cipher: Aes128,
    nonce: [u8; 8],
    version: u16,
    region: u8,
    start: u32,
    end: u32,
}

impl OtfDec {
    pub fn new(
        key: &[u32; 4],
        nonce: &[u32; 2],
        version: u16,
        region: u8,
        start: u32,
        end: u32,
    ) -> OtfDec {
        let mut nonce_bytes = [0u8; 8];
        nonce_bytes[..4].copy_from_slice(&nonce[0].to_be_bytes());
        nonce_bytes[4..].copy_from_slice(&nonce[1].to_be_bytes());
        tracing::info!("OTFDEC region {region} configured: {start:#010x}..={end:#010x}");
        OtfDec {
            cipher: Aes128::new(GenericArray::from_slice(&key_bytes(key))),
            nonce: nonce_bytes,
            version,
            region: region & 0x3,
            start,
            end,
        }
    }

    /// Closed interval, as the key descriptor specifies it.
    pub fn contains(&self, addr: u32) -> bool {
        (self.start..=self.end).contains(&addr)
    }

    fn counter_block(&self, aligned_addr: u32) -> [u8; 16] {
        let block_number = ((aligned_addr - self.start) >> 4) as u64;
        let lower = ((self.version as u64) << 48)
            | ((self.region as u64) << 46)
            | ((block_number & 0x3FF_FFFF_FFFF) << 4);
        let mut block = [0u8; 16];
        block[..8].copy_from_slice(&self.nonce);
        block[8..].copy_from_slice(&lower.to_be_bytes());
        block
    }

    /// Decrypt `data`, which was read from `addr`, in place.
    pub fn decrypt(&self, addr: u32, data: &mut [u8]) {
        xor_keystream(data, addr, |aligned| {
            let mut block = GenericArray::from(self.counter_block(aligned));
            self.cipher.encrypt_block(&mut block);
            block.into()
        });
    }
}

/// The AES-GCM-protected trailer region, decrypted as GCM's underlying CTR
/// stream (J0 = IV || 1, data blocks start at IV || 2).
pub struct GcmRegion {
    cipher: Aes128,
    iv: [u8; 12],
    base: u32,
    region_len: u32,
    data_len: u32,
}

impl GcmRegion {
    pub fn new(
        key: &[u32; 4],
        iv: &[u32; 3],
        base: u32,
        region_len: u32,
        data_len: u32,
    ) -> GcmRegion {
        let mut iv_bytes = [0u8; 12];
        for (i, word) in iv.iter().enumerate() {
            iv_bytes[i * 4..i * 4 + 4].copy_from_slice(&word.to_be_bytes());
        }
        tracing::info!(
            "AES-GCM region configured at {base:#010x} ({region_len} bytes, {data_len} data)"
        );
        GcmRegion {
            cipher: Aes128::new(GenericArray::from_slice(&key_bytes(key))),
            iv: iv_bytes,
            base,
            region_len,
            data_len,
        }
    }

    /// Half-open interval of `region_len` bytes from `base`.
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.region_len
    }

    /// Only the leading `data_len` bytes hold ciphertext.
    pub fn in_data(&self, addr: u32) -> bool {
        addr >= self.base && (addr - self.base) < self.data_len
    }

    fn counter_block(&self, aligned_addr: u32) -> [u8; 16] {
        let block_index = (aligned_addr - self.base) / 16;
        let mut block = [0u8; 16];
        block[..12].copy_from_slice(&self.iv);
        block[12..].copy_from_slice(&(block_index + 2).to_be_bytes());
        block
    }

    pub fn decrypt(&self, addr: u32, data: &mut [u8]) {
        xor_keystream(data, addr, |aligned| {
            let mut block = GenericArray::from(self.counter_block(aligned));
            self.cipher.encrypt_block(&mut block);
            block.into()
        });
    }
}

/// XOR `data` (read from `addr`) with the keystream produced per enclosing
/// 16-byte block by `keystream`.
fn xor_keystream(data: &mut [u8], addr: u32, keystream: impl Fn(u32) -> [u8; 16]) {
    let mut pos = 0usize;
    while pos < data.len() {
        let cur = addr.wrapping_add(pos as u32);
        let aligned = cur & !0xF;
        let in_block = (cur & 0xF) as usize;
        let take = (16 - in_block).min(data.len() - pos);
        let stream = keystream(aligned);
        for i in 0..take {
            data[pos + i] ^= stream[in_block + i];
        }
        pos += take;
    }
}
