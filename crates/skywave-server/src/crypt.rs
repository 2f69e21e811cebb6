use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_128_GCM};
use zeroize::Zeroizing;

/// AES-128-GCM key length.
pub const KEY_LEN: usize = 16;
/// GCM nonce length.
pub const NONCE_LEN: usize = 12;
/// Per-packet overhead: 4-byte counter prefix + 16-byte tag.
pub const CRYPT_OVERHEAD: usize = 4 + 16;

/// Counters this far behind the newest are dropped as replays.
const LATE_WINDOW: u32 = 32;

/// Voice record layer for one session.
///
/// Each direction derives its per-packet nonce from a random base XORed with
/// a monotonically increasing counter carried in clear before the ciphertext:
/// `[counter: u32 BE][ciphertext || tag]`. Decrypt failures are silent; the
/// caller reads the counters and asks for a resync when they grow.
pub struct CryptState {
    key: Zeroizing<[u8; KEY_LEN]>,
    /// Nonce base for server -> client packets.
    server_nonce: [u8; NONCE_LEN],
    /// Nonce base for client -> server packets.
    client_nonce: [u8; NONCE_LEN],

    encrypt_counter: u32,
    /// Highest client counter accepted so far.
    highest_seen: Option<u32>,

    pub good: u32,
    pub late: u32,
    pub lost: u32,
    pub resync: u32,
}

impl CryptState {
    /// Fresh random key and nonce bases.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        rng.fill_bytes(&mut *key);
        let mut server_nonce = [0u8; NONCE_LEN];
        let mut client_nonce = [0u8; NONCE_LEN];
        rng.fill_bytes(&mut server_nonce);
        rng.fill_bytes(&mut client_nonce);
        Self::with_material(key, server_nonce, client_nonce)
    }

    fn with_material(
        key: Zeroizing<[u8; KEY_LEN]>,
        server_nonce: [u8; NONCE_LEN],
        client_nonce: [u8; NONCE_LEN],
    ) -> Self {
        Self {
            key,
            server_nonce,
            client_nonce,
            encrypt_counter: 0,
            highest_seen: None,
            good: 0,
            late: 0,
            lost: 0,
            resync: 0,
        }
    }

    /// Key material for the CryptSetup message.
    pub fn key_bytes(&self) -> Vec<u8> {
        self.key.to_vec()
    }

    pub fn server_nonce_bytes(&self) -> Vec<u8> {
        self.server_nonce.to_vec()
    }

    pub fn client_nonce_bytes(&self) -> Vec<u8> {
        self.client_nonce.to_vec()
    }

    /// Reset nonce bases on a client-requested resync, keeping the key.
    pub fn resync_nonces(&mut self) {
        let mut rng = rand::thread_rng();
        rng.fill_bytes(&mut self.server_nonce);
        rng.fill_bytes(&mut self.client_nonce);
        self.encrypt_counter = 0;
        self.highest_seen = None;
        self.resync += 1;
    }

    fn aead_key(&self) -> LessSafeKey {
        let unbound =
            UnboundKey::new(&AES_128_GCM, &*self.key).expect("AES-128 key length is fixed");
        LessSafeKey::new(unbound)
    }

    fn nonce_for(base: &[u8; NONCE_LEN], counter: u32) -> Nonce {
        let mut bytes = *base;
        for (i, b) in counter.to_be_bytes().iter().enumerate() {
            bytes[NONCE_LEN - 4 + i] ^= b;
        }
        Nonce::assume_unique_for_key(bytes)
    }

    /// Encrypt a server -> client packet.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Vec<u8> {
        let counter = self.encrypt_counter;
        self.encrypt_counter = self.encrypt_counter.wrapping_add(1);

        let mut out = Vec::with_capacity(CRYPT_OVERHEAD + plaintext.len());
        out.extend_from_slice(&counter.to_be_bytes());

        let mut in_out = plaintext.to_vec();
        self.aead_key()
            .seal_in_place_append_tag(
                Self::nonce_for(&self.server_nonce, counter),
                Aad::empty(),
                &mut in_out,
            )
            .expect("sealing cannot fail for in-memory buffers");
        out.extend_from_slice(&in_out);
        out
    }

    /// Decrypt a client -> server packet. Returns `None` on any failure;
    /// the failure counters tell the caller whether to request a resync.
    pub fn decrypt(&mut self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet.len() < CRYPT_OVERHEAD {
            self.lost = self.lost.wrapping_add(1);
            return None;
        }
        let counter = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);

        if let Some(highest) = self.highest_seen {
            if counter <= highest && highest - counter >= LATE_WINDOW {
                self.late = self.late.wrapping_add(1);
                return None;
            }
        }

        let mut in_out = packet[4..].to_vec();
        let plain_len = match self.aead_key().open_in_place(
            Self::nonce_for(&self.client_nonce, counter),
            Aad::empty(),
            &mut in_out,
        ) {
            Ok(plain) => plain.len(),
            Err(_) => {
                self.lost = self.lost.wrapping_add(1);
                return None;
            }
        };
        in_out.truncate(plain_len);

        match self.highest_seen {
            Some(highest) if counter > highest => {
                // Count the gap as lost packets.
                self.lost = self.lost.wrapping_add(counter - highest - 1);
                self.highest_seen = Some(counter);
            }
            Some(_) => {
                self.late = self.late.wrapping_add(1);
            }
            None => self.highest_seen = Some(counter),
        }
        self.good = self.good.wrapping_add(1);
        Some(in_out)
    }

    /// Encrypt as the client would (used by tests and the loopback path).
    pub fn encrypt_as_client(&mut self, plaintext: &[u8], counter: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(CRYPT_OVERHEAD + plaintext.len());
        out.extend_from_slice(&counter.to_be_bytes());
        let mut in_out = plaintext.to_vec();
        self.aead_key()
            .seal_in_place_append_tag(
                Self::nonce_for(&self.client_nonce, counter),
                Aad::empty(),
                &mut in_out,
            )
            .expect("sealing cannot fail for in-memory buffers");
        out.extend_from_slice(&in_out);
        out
    }

    /// Decrypt as the client would (tests only).
    #[cfg(test)]
    pub fn decrypt_as_client(&self, packet: &[u8]) -> Option<Vec<u8>> {
        if packet.len() < CRYPT_OVERHEAD {
            return None;
        }
        let counter = u32::from_be_bytes([packet[0], packet[1], packet[2], packet[3]]);
        let mut in_out = packet[4..].to_vec();
        let plain_len = self
            .aead_key()
            .open_in_place(
                Self::nonce_for(&self.server_nonce, counter),
                Aad::empty(),
                &mut in_out,
            )
            .ok()?
            .len();
        in_out.truncate(plain_len);
        Some(in_out)
    }
}
