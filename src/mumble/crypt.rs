//! OCB2-AES128 as spoken on the Mumble UDP voice path.
//!
//! This is Mumble's dialect of OCB2, not the textbook mode: it carries the
//! XEX* counter-cryptanalysis guard on both directions, a one-byte IV echo in
//! the packet header, a three-byte truncated tag, and a 256-entry replay
//! history indexed by the IV's low byte. All of that must match the peer
//! bit-for-bit, which is why the mode lives here instead of in a crate.

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;

pub const BLOCK_SIZE: usize = 16;

type Block = [u8; BLOCK_SIZE];

/// Packet accounting, exposed through session metrics. `lost` can be
/// corrected downward by one when a presumed-lost packet arrives late, hence
/// the saturating update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CryptStats {
    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

pub struct CryptState {
    cipher: Option<Aes128>,
    encrypt_iv: Block,
    decrypt_iv: Block,
    // decrypt_history[b] holds the IV's second byte last accepted for a
    // packet whose IV low byte was `b`.
    decrypt_history: [u8; 256],
    stats: CryptStats,
}

impl Default for CryptState {
    fn default() -> Self {
        Self::new()
    }
}

impl CryptState {
    pub fn new() -> Self {
        Self {
            cipher: None,
            encrypt_iv: [0; BLOCK_SIZE],
            decrypt_iv: [0; BLOCK_SIZE],
            decrypt_history: [0; 256],
            stats: CryptStats::default(),
        }
    }

    /// Installs the key triple from a full `CryptSetup` and resets the replay
    /// history. The client nonce drives our encrypt IV, the server nonce the
    /// decrypt IV.
    pub fn set_key(&mut self, key: [u8; BLOCK_SIZE], client_nonce: Block, server_nonce: Block) {
        self.cipher = Some(Aes128::new(GenericArray::from_slice(&key)));
        self.encrypt_iv = client_nonce;
        self.decrypt_iv = server_nonce;
        self.decrypt_history = [0; 256];
    }

    /// Server-initiated resync: replaces only the decrypt IV.
    pub fn set_decrypt_iv(&mut self, iv: Block) {
        self.decrypt_iv = iv;
        self.decrypt_history = [0; 256];
        self.stats.resync = self.stats.resync.saturating_add(1);
    }

    /// Current encrypt IV, sent back when the server asks us to resync it.
    pub fn encrypt_iv(&self) -> Block {
        self.encrypt_iv
    }

    pub fn is_valid(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn stats(&self) -> CryptStats {
        self.stats
    }

    /// Encrypts one datagram: bumps the IV, runs OCB2 and emits
    /// `[iv[0] | tag[0..3] | ciphertext]`.
    pub fn encrypt(&mut self, plain: &[u8]) -> Option<Vec<u8>> {
        let cipher = self.cipher.as_ref()?;

        // Ripple-carry increment of the IV as a little-endian 128-bit value.
        for byte in self.encrypt_iv.iter_mut() {
            *byte = byte.wrapping_add(1);
            if *byte != 0 {
                break;
            }
        }

        let (ciphertext, tag, ok) = ocb_encrypt(cipher, plain, &self.encrypt_iv, true);
        if !ok {
            return None;
        }

        let mut out = Vec::with_capacity(4 + ciphertext.len());
        out.push(self.encrypt_iv[0]);
        out.extend_from_slice(&tag[..3]);
        out.extend_from_slice(&ciphertext);
        Some(out)
    }

    /// Decrypts one datagram, reconstructing the full IV from its low-byte
    /// echo. Returns the plaintext, or `None` for anything that must be
    /// dropped: repeats, stale IVs, bad tags, XEX* suspects.
    pub fn decrypt(&mut self, source: &[u8]) -> Option<Vec<u8>> {
        let cipher = self.cipher.as_ref()?;
        if source.len() < 4 {
            return None;
        }

        let saved_iv = self.decrypt_iv;
        let iv_byte = source[0];
        let mut restore = false;
        let mut late = 0u32;
        let mut lost = 0i32;

        if self.decrypt_iv[0].wrapping_add(1) == iv_byte {
            // In order.
            if iv_byte > self.decrypt_iv[0] {
                self.decrypt_iv[0] = iv_byte;
            } else if iv_byte < self.decrypt_iv[0] {
                // Low byte wrapped: carry into the higher bytes.
                self.decrypt_iv[0] = iv_byte;
                carry_increment(&mut self.decrypt_iv);
            } else {
                return None;
            }
        } else {
            // Out of order or repeat; fold the delta into [-128, 128).
            let mut diff = i32::from(iv_byte) - i32::from(self.decrypt_iv[0]);
            if diff > 128 {
                diff -= 256;
            } else if diff < -128 {
                diff += 256;
            }

            if iv_byte < self.decrypt_iv[0] && diff > -30 && diff < 0 {
                // Late packet within the window, no wraparound.
                late = 1;
                lost = -1;
                self.decrypt_iv[0] = iv_byte;
                restore = true;
            } else if iv_byte > self.decrypt_iv[0] && diff > -30 && diff < 0 {
                // Late packet from before a wraparound: un-carry.
                late = 1;
                lost = -1;
                self.decrypt_iv[0] = iv_byte;
                carry_decrement(&mut self.decrypt_iv);
                restore = true;
            } else if iv_byte > self.decrypt_iv[0] && diff > 0 {
                // Packets lost, no wraparound.
                lost = i32::from(iv_byte) - i32::from(saved_iv[0]) - 1;
                self.decrypt_iv[0] = iv_byte;
            } else if iv_byte < self.decrypt_iv[0] && diff > 0 {
                // Packets lost across a wraparound.
                lost = 256 - i32::from(saved_iv[0]) + i32::from(iv_byte) - 1;
                self.decrypt_iv[0] = iv_byte;
                carry_increment(&mut self.decrypt_iv);
            } else {
                return None;
            }

            if self.decrypt_history[usize::from(self.decrypt_iv[0])] == self.decrypt_iv[1] {
                self.decrypt_iv = saved_iv;
                return None;
            }
        }

        let (plain, tag, ok) = ocb_decrypt(cipher, &source[4..], &self.decrypt_iv);
        if !ok || tag[..3] != source[1..4] {
            self.decrypt_iv = saved_iv;
            return None;
        }
        self.decrypt_history[usize::from(self.decrypt_iv[0])] = self.decrypt_iv[1];

        if restore {
            self.decrypt_iv = saved_iv;
        }

        self.stats.good = self.stats.good.saturating_add(1);
        self.stats.late = self.stats.late.saturating_add(late);
        self.stats.lost = self.stats.lost.saturating_add_signed(lost);
        Some(plain)
    }
}

fn carry_increment(iv: &mut Block) {
    for byte in iv.iter_mut().skip(1) {
        *byte = byte.wrapping_add(1);
        if *byte != 0 {
            break;
        }
    }
}

fn carry_decrement(iv: &mut Block) {
    for byte in iv.iter_mut().skip(1) {
        let prev = *byte;
        *byte = prev.wrapping_sub(1);
        if prev != 0 {
            break;
        }
    }
}

fn aes_enc(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut ga);
    ga.into()
}

fn aes_dec(cipher: &Aes128, block: &Block) -> Block {
    let mut ga = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut ga);
    ga.into()
}

fn xored(a: &Block, b: &Block) -> Block {
    let mut out = [0u8; BLOCK_SIZE];
    for i in 0..BLOCK_SIZE {
        out[i] = a[i] ^ b[i];
    }
    out
}

fn xor_into(dst: &mut Block, src: &Block) {
    for i in 0..BLOCK_SIZE {
        dst[i] ^= src[i];
    }
}

/// GF(2^128) doubling in big-endian bit order: shift left one bit and fold
/// the carry back as 0x87 on the last byte.
fn s2(block: &mut Block) {
    let carry = block[0] & 0x80 != 0;
    for i in 0..BLOCK_SIZE - 1 {
        block[i] = (block[i] << 1) | (block[i + 1] >> 7);
    }
    block[BLOCK_SIZE - 1] <<= 1;
    if carry {
        block[BLOCK_SIZE - 1] ^= 0x87;
    }
}

fn s3_of(block: &Block) -> Block {
    let mut doubled = *block;
    s2(&mut doubled);
    xored(block, &doubled)
}

/// Core OCB2 encryption. `modify_plain` selects the XEX* countermeasure
/// flavor: flip one plaintext bit and carry on (voice path), or report
/// failure and emit nothing usable (the returned bool).
fn ocb_encrypt(
    cipher: &Aes128,
    plain: &[u8],
    nonce: &Block,
    modify_plain: bool,
) -> (Vec<u8>, Block, bool) {
    let mut delta = aes_enc(cipher, nonce);
    let mut checksum = [0u8; BLOCK_SIZE];
    let mut out = Vec::with_capacity(plain.len());
    let mut rem = plain;
    let mut success = true;

    while rem.len() > BLOCK_SIZE {
        // An XEX* attack needs the last full block to be zero everywhere but
        // its final byte.
        let mut flip_a_bit = false;
        if rem.len() - BLOCK_SIZE <= BLOCK_SIZE {
            let mut sum = 0u8;
            for &byte in &rem[..BLOCK_SIZE - 1] {
                sum |= byte;
            }
            if sum == 0 {
                if modify_plain {
                    flip_a_bit = true;
                } else {
                    success = false;
                }
            }
        }

        s2(&mut delta);
        let mut block: Block = rem[..BLOCK_SIZE].try_into().expect("block slice");
        if flip_a_bit {
            block[0] ^= 1;
        }
        xor_into(&mut checksum, &block);
        let enc = aes_enc(cipher, &xored(&delta, &block));
        out.extend_from_slice(&xored(&delta, &enc));
        rem = &rem[BLOCK_SIZE..];
    }

    s2(&mut delta);
    let mut length_block = [0u8; BLOCK_SIZE];
    length_block[BLOCK_SIZE - 1] = (rem.len() * 8) as u8;
    xor_into(&mut length_block, &delta);
    let pad = aes_enc(cipher, &length_block);

    let mut last = [0u8; BLOCK_SIZE];
    last[..rem.len()].copy_from_slice(rem);
    last[rem.len()..].copy_from_slice(&pad[rem.len()..]);
    xor_into(&mut checksum, &last);
    let final_cipher = xored(&pad, &last);
    out.extend_from_slice(&final_cipher[..rem.len()]);

    let tag = aes_enc(cipher, &xored(&s3_of(&delta), &checksum));
    (out, tag, success)
}

/// Core OCB2 decryption; the bool is false when the XEX* guard trips on the
/// final block (padded plain equal to delta over its first fifteen bytes).
fn ocb_decrypt(cipher: &Aes128, encrypted: &[u8], nonce: &Block) -> (Vec<u8>, Block, bool) {
    let mut delta = aes_enc(cipher, nonce);
    let mut checksum = [0u8; BLOCK_SIZE];
    let mut out = Vec::with_capacity(encrypted.len());
    let mut rem = encrypted;
    let mut success = true;

    while rem.len() > BLOCK_SIZE {
        s2(&mut delta);
        let block: Block = rem[..BLOCK_SIZE].try_into().expect("block slice");
        let dec = aes_dec(cipher, &xored(&delta, &block));
        let plain = xored(&delta, &dec);
        xor_into(&mut checksum, &plain);
        out.extend_from_slice(&plain);
        rem = &rem[BLOCK_SIZE..];
    }

    s2(&mut delta);
    let mut length_block = [0u8; BLOCK_SIZE];
    length_block[BLOCK_SIZE - 1] = (rem.len() * 8) as u8;
    xor_into(&mut length_block, &delta);
    let pad = aes_enc(cipher, &length_block);

    let mut last = [0u8; BLOCK_SIZE];
    last[..rem.len()].copy_from_slice(rem);
    xor_into(&mut last, &pad);
    xor_into(&mut checksum, &last);
    out.extend_from_slice(&last[..rem.len()]);

    if last[..BLOCK_SIZE - 1] == delta[..BLOCK_SIZE - 1] {
        success = false;
    }

    let tag = aes_enc(cipher, &xored(&s3_of(&delta), &checksum));
    (out, tag, success)
}

#[cfg(test)]
mod tests {
    use super::{ocb_encrypt, s2, CryptState, BLOCK_SIZE};
    use aes::cipher::generic_array::GenericArray;
    use aes::cipher::KeyInit;
    use aes::Aes128;

    const KEY: [u8; 16] = *b"sixteen byte key";
    const CLIENT_NONCE: [u8; 16] = [0x20; 16];
    const SERVER_NONCE: [u8; 16] = [0x40; 16];

    fn keyed_pair() -> (CryptState, CryptState) {
        // Sender and receiver with mirrored nonces, as after one CryptSetup.
        let mut server = CryptState::new();
        server.set_key(KEY, SERVER_NONCE, CLIENT_NONCE);
        let mut client = CryptState::new();
        client.set_key(KEY, CLIENT_NONCE, SERVER_NONCE);
        (server, client)
    }

    /// Every plaintext length across the block boundaries round-trips.
    #[test]
    fn roundtrip_across_block_boundaries() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        for len in [0usize, 1, 15, 16, 17, 31, 32, 33, 100, 960] {
            let plain: Vec<u8> = (0..len).map(|i| (i % 251) as u8 | 1).collect();
            // Act
            let packet = server.encrypt(&plain).expect("encrypt failed");
            let decrypted = client.decrypt(&packet).expect("decrypt failed");
            // Assert
            assert_eq!(decrypted, plain, "length {len}");
            assert_eq!(packet.len(), plain.len() + 4);
        }
        assert_eq!(client.stats().good, 10);
        assert_eq!(client.stats().lost, 0);
    }

    /// Any single-bit flip in ciphertext or tag is rejected.
    #[test]
    fn tampered_packets_are_rejected() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        let plain = vec![0xabu8; 40];
        let packet = server.encrypt(&plain).expect("encrypt failed");
        for bit_index in [8usize, 16, 24, 32, 40, 8 * packet.len() - 1] {
            let mut tampered = packet.clone();
            tampered[bit_index / 8] ^= 1 << (bit_index % 8);
            // Act
            let result = client.decrypt(&tampered);
            // Assert
            assert!(result.is_none(), "bit {bit_index} accepted");
        }
        // The pristine packet still goes through afterwards.
        assert!(client.decrypt(&packet).is_some());
    }

    /// A replayed packet is rejected by the history window even though its
    /// tag is valid.
    #[test]
    fn replay_is_rejected() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        let first = server.encrypt(&[1u8; 20]).expect("encrypt failed");
        let second = server.encrypt(&[2u8; 20]).expect("encrypt failed");
        client.decrypt(&first).expect("first decrypt failed");
        client.decrypt(&second).expect("second decrypt failed");
        // Act
        let replayed = client.decrypt(&first);
        // Assert
        assert!(replayed.is_none());
        assert_eq!(client.stats().good, 2);
    }

    /// A genuinely late packet inside the 30-packet window is accepted and
    /// counted, and the IV position is restored afterwards.
    #[test]
    fn late_packet_is_accepted_once() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        let p1 = server.encrypt(&[1u8; 8]).expect("encrypt failed");
        let p2 = server.encrypt(&[2u8; 8]).expect("encrypt failed");
        let p3 = server.encrypt(&[3u8; 8]).expect("encrypt failed");
        // Act: deliver 1, 3, then the late 2, then continue in order.
        client.decrypt(&p1).expect("p1 failed");
        client.decrypt(&p3).expect("p3 failed");
        let late = client.decrypt(&p2).expect("late p2 failed");
        let p4 = server.encrypt(&[4u8; 8]).expect("encrypt failed");
        let after = client.decrypt(&p4).expect("p4 failed");
        // Assert
        assert_eq!(late, vec![2u8; 8]);
        assert_eq!(after, vec![4u8; 8]);
        assert_eq!(client.stats().late, 1);
        assert_eq!(client.stats().lost, 0);
        assert_eq!(client.stats().good, 4);
    }

    /// Skipped IVs count as losses.
    #[test]
    fn gaps_count_lost_packets() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        let p1 = server.encrypt(&[1u8; 8]).expect("encrypt failed");
        let _dropped1 = server.encrypt(&[2u8; 8]).expect("encrypt failed");
        let _dropped2 = server.encrypt(&[3u8; 8]).expect("encrypt failed");
        let p4 = server.encrypt(&[4u8; 8]).expect("encrypt failed");
        // Act
        client.decrypt(&p1).expect("p1 failed");
        client.decrypt(&p4).expect("p4 failed");
        // Assert
        assert_eq!(client.stats().lost, 2);
        assert_eq!(client.stats().good, 2);
    }

    /// The low IV byte wrapping from 0xff to 0x00 carries into byte one and
    /// keeps in-order decryption going.
    #[test]
    fn iv_wraparound_carries() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        // Act: enough packets to wrap the low byte at least once.
        for i in 0..300u32 {
            let plain = vec![(i % 255) as u8 | 1; 12];
            let packet = server.encrypt(&plain).expect("encrypt failed");
            let decrypted = client.decrypt(&packet).expect("decrypt failed");
            assert_eq!(decrypted, plain, "packet {i}");
        }
        // Assert
        assert_eq!(client.stats().good, 300);
        assert_eq!(client.stats().lost, 0);
        assert_eq!(client.stats().late, 0);
    }

    /// A packet from far outside the late window is dropped without
    /// disturbing the IV.
    #[test]
    fn stale_packet_outside_window_is_rejected() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        let mut stale = None;
        for i in 0..80u32 {
            let packet = server.encrypt(&[i as u8 | 1; 8]).expect("encrypt failed");
            if i == 0 {
                stale = Some(packet.clone());
            }
            client.decrypt(&packet).expect("decrypt failed");
        }
        // Act: 79 packets later, the first one shows up again.
        let result = client.decrypt(&stale.expect("missing packet"));
        // Assert
        assert!(result.is_none());
        assert_eq!(client.stats().good, 80);
        // The stream continues undisturbed.
        let next = server.encrypt(&[9u8; 8]).expect("encrypt failed");
        assert!(client.decrypt(&next).is_some());
    }

    /// Replacing the decrypt IV mid-session counts a resync and re-arms the
    /// receiver at the new position.
    #[test]
    fn decrypt_iv_resync() {
        // Arrange
        let (mut server, mut client) = keyed_pair();
        for _ in 0..5 {
            let packet = server.encrypt(&[7u8; 8]).expect("encrypt failed");
            client.decrypt(&packet).expect("decrypt failed");
        }
        // Act: server-side resync hands the receiver the sender's IV.
        client.set_decrypt_iv(server.encrypt_iv());
        let packet = server.encrypt(&[8u8; 8]).expect("encrypt failed");
        let decrypted = client.decrypt(&packet);
        // Assert
        assert_eq!(decrypted, Some(vec![8u8; 8]));
        assert_eq!(client.stats().resync, 1);
    }

    /// The abort-mode XEX* guard refuses the pathological block shape; the
    /// modify-plain mode flips its first bit instead.
    #[test]
    fn xex_star_guard_on_encrypt() {
        // Arrange: 17 bytes whose first full block is zero except its final
        // byte, the exact shape the countermeasure watches for.
        let cipher = Aes128::new(GenericArray::from_slice(&KEY));
        let mut plain = vec![0u8; 17];
        plain[BLOCK_SIZE - 1] = 5;
        plain[BLOCK_SIZE] = 9;
        let nonce = [0x11u8; BLOCK_SIZE];
        // Act
        let (_, _, abort_ok) = ocb_encrypt(&cipher, &plain, &nonce, false);
        let (ciphertext, tag, modify_ok) = ocb_encrypt(&cipher, &plain, &nonce, true);
        // Assert
        assert!(!abort_ok);
        assert!(modify_ok);
        // The modify mode's output decrypts to the bit-flipped plaintext.
        let (decrypted, check_tag, ok) = super::ocb_decrypt(&cipher, &ciphertext, &nonce);
        assert!(ok);
        assert_eq!(check_tag, tag);
        let mut expected = plain.clone();
        expected[0] ^= 1;
        assert_eq!(decrypted, expected);
    }

    /// Unkeyed state refuses to touch traffic, and short packets are dropped.
    #[test]
    fn unkeyed_and_short_inputs_are_rejected() {
        // Arrange
        let mut state = CryptState::new();
        // Act / Assert
        assert!(!state.is_valid());
        assert!(state.encrypt(&[1, 2, 3]).is_none());
        assert!(state.decrypt(&[1, 2, 3, 4, 5]).is_none());
        state.set_key(KEY, CLIENT_NONCE, SERVER_NONCE);
        assert!(state.is_valid());
        assert!(state.decrypt(&[0, 0, 0]).is_none());
    }

    /// Doubling shifts left and folds the carry polynomial.
    #[test]
    fn s2_matches_reference_doubling() {
        // Arrange
        let mut no_carry = [0u8; BLOCK_SIZE];
        no_carry[BLOCK_SIZE - 1] = 0x01;
        let mut with_carry = [0u8; BLOCK_SIZE];
        with_carry[0] = 0x80;
        // Act
        s2(&mut no_carry);
        s2(&mut with_carry);
        // Assert
        let mut expected = [0u8; BLOCK_SIZE];
        expected[BLOCK_SIZE - 1] = 0x02;
        assert_eq!(no_carry, expected);
        let mut expected = [0u8; BLOCK_SIZE];
        expected[BLOCK_SIZE - 1] = 0x87;
        assert_eq!(with_carry, expected);
    }
}
