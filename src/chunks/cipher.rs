use aes::Aes256;
use aes::cipher::{AsyncStreamCipher, KeyIvInit};
use byteorder::{BigEndian, ByteOrder};
use cfb_mode;

type Aes256CfbEnc = cfb_mode::Encryptor<Aes256>;
type Aes256CfbDec = cfb_mode::Decryptor<Aes256>;

pub const KEY_SIZE: usize = 32;

/// AES-256-CFB, one cipher instance per chunk.
///
/// The key is fetched once at startup and held in memory; chunk servers only
/// ever see ciphertext.
#[derive(Clone)]
pub struct ChunkCipher {
    key: [u8; KEY_SIZE]
}

impl ChunkCipher {
    pub fn new(key: [u8; KEY_SIZE]) -> Self {
        ChunkCipher { key: key }
    }

    // The IV does not need to be secret, as long as it is unique. Every chunk
    // is guaranteed to have a unique inode+chunk_index combination.
    // padding (4 bytes) + inode (8 bytes) + chunk_index (4 bytes) = 16 bytes IV
    fn iv(inode: u64, chunk_index: u32) -> [u8; 16] {
        let mut iv = [0u8; 16];
        BigEndian::write_u64(&mut iv[4..12], inode);
        BigEndian::write_u32(&mut iv[12..16], chunk_index);
        iv
    }

    pub fn encrypt(&self, inode: u64, chunk_index: u32, data: &[u8]) -> Vec<u8> {
        let iv = Self::iv(inode, chunk_index);
        let mut buf = data.to_vec();
        Aes256CfbEnc::new(&self.key.into(), &iv.into()).encrypt(&mut buf);
        buf
    }

    pub fn decrypt(&self, inode: u64, chunk_index: u32, data: &[u8]) -> Vec<u8> {
        let iv = Self::iv(inode, chunk_index);
        let mut buf = data.to_vec();
        Aes256CfbDec::new(&self.key.into(), &iv.into()).decrypt(&mut buf);
        buf
    }
}


#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::ChunkCipher;

    fn cipher() -> ChunkCipher {
        ChunkCipher::new([7u8; 32])
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_roundtrip() {
        let cipher = cipher();
        for &len in &[0usize, 1, 15, 16, 17, 1000, 100_000] {
            let data = sample(len);
            let encrypted = cipher.encrypt(3, 9, &data);
            assert_eq!(cipher.decrypt(3, 9, &encrypted), data);
        }
    }

    #[test]
    fn test_length_is_preserved() {
        let cipher = cipher();
        for &len in &[1usize, 13, 4096] {
            assert_eq!(cipher.encrypt(1, 0, &sample(len)).len(), len);
        }
    }

    #[test]
    fn test_ciphertext_differs_from_plaintext() {
        let data = sample(1000);
        assert_ne!(cipher().encrypt(1, 0, &data), data);
    }

    #[test]
    fn test_chunks_encrypt_differently() {
        let cipher = cipher();
        let data = sample(1000);
        let base = cipher.encrypt(1, 0, &data);
        assert_ne!(cipher.encrypt(1, 1, &data), base);
        assert_ne!(cipher.encrypt(2, 0, &data), base);
    }

    #[test]
    fn test_iv_layout() {
        let iv = ChunkCipher::iv(0x0102030405060708, 0x0A0B0C0D);
        assert_eq!(&iv[..4], &[0, 0, 0, 0]);
        assert_eq!(&iv[4..12], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&iv[12..], &[0x0A, 0x0B, 0x0C, 0x0D]);
    }

    #[test]
    fn test_iv_unique_per_chunk() {
        let mut seen = HashSet::new();
        for inode in 0..20u64 {
            for chunk_index in 0..20u32 {
                assert!(seen.insert(ChunkCipher::iv(inode, chunk_index)));
            }
        }
    }
}
