use std::sync::Mutex;

use aes::Aes256;
use ctr::Ctr128BE;
use ctr::cipher::{KeyIvInit, StreamCipher};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto;
use crate::keydb::{KeyDb, LUKS_PASSPHRASE_RAW_SIZE, PSK_SIZE};

type Aes256Ctr = Ctr128BE<Aes256>;

/// Size of the rolling obfuscation mask, regenerated on every close.
const MASK_SIZE: usize = 64;

/// An in-memory buffer that keeps its contents encrypted at rest.
///
/// Closed state is `plaintext XOR mask XOR keystream`: a 64-byte mask
/// repeated over the data, then the AES-256-CTR keystream of an ephemeral
/// per-vault key (zero IV, counter indexed by position). The key is generated
/// once at construction and never leaves the process. The mask is rotated on
/// every close so the resting bytes never repeat between two snapshots.
pub struct Vault {
    inner: Mutex<VaultInner>,
}

struct VaultInner {
    data: Vec<u8>,
    key: [u8; 32],
    mask: [u8; MASK_SIZE],
}

impl VaultInner {
    fn apply_mask(&mut self) {
        for (i, b) in self.data.iter_mut().enumerate() {
            *b ^= self.mask[i % MASK_SIZE];
        }
    }

    fn apply_keystream(&mut self) {
        let mut cipher = Aes256Ctr::new((&self.key).into(), (&[0u8; 16]).into());
        cipher.apply_keystream(&mut self.data);
    }
}

impl Drop for VaultInner {
    fn drop(&mut self) {
        self.data.zeroize();
        self.key.zeroize();
        self.mask.zeroize();
    }
}

impl Vault {
    /// Seal `plaintext` into a new vault and wipe the source buffer.
    pub fn new(plaintext: &mut [u8]) -> Vault {
        let mut mask = [0u8; MASK_SIZE];
        crypto::random_bytes(&mut mask);
        let mut inner = VaultInner {
            data: plaintext.to_vec(),
            key: crypto::random_key(),
            mask,
        };
        plaintext.zeroize();
        inner.apply_mask();
        inner.apply_keystream();
        Vault {
            inner: Mutex::new(inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("vault mutex poisoned").data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Open the vault for the duration of the closure, then re-seal under a
    /// freshly generated mask. The open/close pair is atomic with respect to
    /// any other access; callers should copy out the minimum they need and
    /// return quickly.
    pub fn with_open<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let mut inner = self.inner.lock().expect("vault mutex poisoned");
        inner.apply_keystream();
        inner.apply_mask();
        let result = f(&inner.data);
        crypto::random_bytes(&mut inner.mask);
        inner.apply_mask();
        inner.apply_keystream();
        result
    }
}

/// A key database with all long-lived secrets moved into vaults.
///
/// The host/volume structure stays available for lookups; the TLS PSKs live
/// concatenated (host order) in one vault and the raw LUKS passphrases
/// ((host, volume) order) in another. The plaintext fields in the wrapped
/// database are wiped during construction.
pub struct VaultedKeyDb {
    db: KeyDb,
    psk_vault: Vault,
    luks_vault: Vault,
    /// Per host, the number of volumes of all preceding hosts.
    volume_base: Vec<usize>,
}

impl VaultedKeyDb {
    pub fn new(mut db: KeyDb) -> Self {
        let mut psk_bytes = Zeroizing::new(Vec::with_capacity(db.hosts.len() * PSK_SIZE));
        let mut luks_bytes =
            Zeroizing::new(Vec::with_capacity(db.total_volume_count() * LUKS_PASSPHRASE_RAW_SIZE));
        let mut volume_base = Vec::with_capacity(db.hosts.len());
        let mut volumes_seen = 0usize;

        for host in &mut db.hosts {
            volume_base.push(volumes_seen);
            psk_bytes.extend_from_slice(&host.tls_psk);
            host.tls_psk.zeroize();
            for volume in &mut host.volumes {
                luks_bytes.extend_from_slice(&volume.luks_passphrase_raw);
                volume.luks_passphrase_raw.zeroize();
                volumes_seen += 1;
            }
        }

        VaultedKeyDb {
            psk_vault: Vault::new(&mut psk_bytes),
            luks_vault: Vault::new(&mut luks_bytes),
            db,
            volume_base,
        }
    }

    /// Host and volume metadata; all secret fields in here are zeroed.
    pub fn db(&self) -> &KeyDb {
        &self.db
    }

    pub fn host_position_by_uuid(&self, uuid: &Uuid) -> Option<usize> {
        self.db.hosts.iter().position(|h| h.host_uuid == *uuid)
    }

    /// Copy the TLS PSK of a host out of the vault.
    pub fn psk_for_host(&self, host_index: usize) -> Option<Zeroizing<[u8; PSK_SIZE]>> {
        if host_index >= self.db.hosts.len() {
            return None;
        }
        let offset = host_index * PSK_SIZE;
        Some(self.psk_vault.with_open(|data| {
            let mut psk = Zeroizing::new([0u8; PSK_SIZE]);
            psk.copy_from_slice(&data[offset..offset + PSK_SIZE]);
            psk
        }))
    }

    /// Copy the raw LUKS passphrase of one volume out of the vault.
    pub fn luks_passphrase(
        &self,
        host_index: usize,
        volume_index: usize,
    ) -> Option<Zeroizing<[u8; LUKS_PASSPHRASE_RAW_SIZE]>> {
        let host = self.db.hosts.get(host_index)?;
        if volume_index >= host.volumes.len() {
            return None;
        }
        let offset = (self.volume_base[host_index] + volume_index) * LUKS_PASSPHRASE_RAW_SIZE;
        Some(self.luks_vault.with_open(|data| {
            let mut passphrase = Zeroizing::new([0u8; LUKS_PASSPHRASE_RAW_SIZE]);
            passphrase.copy_from_slice(&data[offset..offset + LUKS_PASSPHRASE_RAW_SIZE]);
            passphrase
        }))
    }
}
