use std::fs;
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::crypto::{self, CryptoError, GCM_IV_SIZE, GCM_TAG_SIZE, PBKDF2_ITERATIONS};

/// File magic: "LUKSRKU" followed by a NUL byte.
pub const KEYDB_MAGIC: [u8; 8] = *b"LUKSRKU\0";
/// Current on-disk payload version. Versions 1 and 2 are readable and are
/// migrated in memory; save always writes this version.
pub const KEYDB_VERSION: u32 = 3;

pub const MAX_HOSTS: usize = 32;
pub const MAX_VOLUMES_PER_HOST: usize = 8;
pub const PSK_SIZE: usize = 32;
pub const LUKS_PASSPHRASE_RAW_SIZE: usize = 32;
pub const HOST_NAME_SIZE: usize = 32;
pub const DEVMAPPER_NAME_SIZE: usize = 32;
pub const SALT_SIZE: usize = 16;

/// Volume flag bit 0: pass `--allow-discards` to cryptsetup.
pub const VOLUME_FLAG_ALLOW_DISCARDS: u32 = 1 << 0;

const HEADER_SIZE: usize = KEYDB_MAGIC.len() + 4;
const RECORD_SIZE: usize = SALT_SIZE + 4 + GCM_IV_SIZE + GCM_TAG_SIZE;

// Fixed slot sizes per payload version. v1 slots predate the flags word; v1
// and v2 host entries predate the per-host client timeout.
const VOLUME_SLOT_V3: usize = 16 + DEVMAPPER_NAME_SIZE + LUKS_PASSPHRASE_RAW_SIZE + 4;
const VOLUME_SLOT_V1: usize = VOLUME_SLOT_V3 - 4;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("not a key database (bad magic)")]
    BadMagic,
    #[error("unsupported database version {0}")]
    UnsupportedVersion(u32),
    #[error("database file truncated")]
    Truncated,
    #[error("authentication failed (wrong passphrase or corrupted database)")]
    AuthFailure,
    #[error("corrupt database payload")]
    Malformed,
    #[error("database already holds the maximum of {MAX_HOSTS} hosts")]
    HostLimit,
    #[error("host \"{0}\" already holds the maximum of {MAX_VOLUMES_PER_HOST} volumes")]
    VolumeLimit(String),
    #[error("host \"{0}\" already exists")]
    DuplicateHost(String),
    #[error("volume UUID {0} already present in the database")]
    DuplicateVolume(Uuid),
    #[error("no such host: {0}")]
    UnknownHost(String),
    #[error("no such volume \"{1}\" for host \"{0}\"")]
    UnknownVolume(String, String),
    #[error("name \"{0}\" does not fit {1} bytes including terminator")]
    NameTooLong(String, usize),
}

impl From<CryptoError> for DbError {
    fn from(err: CryptoError) -> Self {
        match err {
            CryptoError::AuthFailure => DbError::AuthFailure,
            CryptoError::SealFailure => DbError::Malformed,
        }
    }
}

/// One dm-crypt volume of a host. `luks_passphrase_raw` is all-zero in an
/// exported database and is wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct VolumeEntry {
    pub volume_uuid: Uuid,
    pub devmapper_name: String,
    pub luks_passphrase_raw: [u8; LUKS_PASSPHRASE_RAW_SIZE],
    pub volume_flags: u32,
}

impl VolumeEntry {
    pub fn allow_discards(&self) -> bool {
        self.volume_flags & VOLUME_FLAG_ALLOW_DISCARDS != 0
    }

    /// The passphrase in the printable form handed to cryptsetup.
    pub fn passphrase_text(&self) -> Zeroizing<String> {
        crypto::ascii_encode(&self.luks_passphrase_raw)
    }
}

impl Drop for VolumeEntry {
    fn drop(&mut self) {
        self.luks_passphrase_raw.zeroize();
    }
}

impl std::fmt::Debug for VolumeEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VolumeEntry")
            .field("volume_uuid", &self.volume_uuid)
            .field("devmapper_name", &self.devmapper_name)
            .field("luks_passphrase_raw", &"<redacted>")
            .field("volume_flags", &self.volume_flags)
            .finish()
    }
}

/// One unlockable host. `host_uuid` doubles as the TLS-PSK identity and is
/// immutable after creation; `tls_psk` is wiped on drop.
#[derive(Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub host_uuid: Uuid,
    pub host_name: String,
    pub tls_psk: [u8; PSK_SIZE],
    /// Client gives up searching after this many seconds; 0 = never.
    pub client_default_timeout_secs: u32,
    pub volumes: Vec<VolumeEntry>,
}

impl HostEntry {
    pub fn volume_by_uuid(&self, uuid: &Uuid) -> Option<&VolumeEntry> {
        self.volumes.iter().find(|v| v.volume_uuid == *uuid)
    }

    pub fn volume_by_name(&self, devmapper_name: &str) -> Option<&VolumeEntry> {
        self.volumes.iter().find(|v| v.devmapper_name == devmapper_name)
    }

    pub fn volume_position_by_uuid(&self, uuid: &Uuid) -> Option<usize> {
        self.volumes.iter().position(|v| v.volume_uuid == *uuid)
    }
}

impl Drop for HostEntry {
    fn drop(&mut self) {
        self.tls_psk.zeroize();
    }
}

impl std::fmt::Debug for HostEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostEntry")
            .field("host_uuid", &self.host_uuid)
            .field("host_name", &self.host_name)
            .field("tls_psk", &"<redacted>")
            .field("client_default_timeout_secs", &self.client_default_timeout_secs)
            .field("volumes", &self.volumes)
            .finish()
    }
}

/// The key database: TLS-PSKs for every known host plus, in a server
/// database, the raw LUKS passphrases of their volumes.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct KeyDb {
    /// True for the server-side database holding LUKS passphrases, false for
    /// an exported client database.
    pub server_database: bool,
    pub hosts: Vec<HostEntry>,
}

impl KeyDb {
    /// Empty server database at the current version.
    pub fn new() -> Self {
        KeyDb {
            server_database: true,
            hosts: Vec::new(),
        }
    }

    pub fn get_host_by_name(&self, name: &str) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.host_name == name)
    }

    pub fn get_host_by_uuid(&self, uuid: &Uuid) -> Option<&HostEntry> {
        self.hosts.iter().find(|h| h.host_uuid == *uuid)
    }

    pub fn total_volume_count(&self) -> usize {
        self.hosts.iter().map(|h| h.volumes.len()).sum()
    }

    fn host_index(&self, name: &str) -> Result<usize, DbError> {
        self.hosts
            .iter()
            .position(|h| h.host_name == name)
            .ok_or_else(|| DbError::UnknownHost(name.to_string()))
    }

    fn volume_uuid_known(&self, uuid: &Uuid) -> bool {
        self.hosts.iter().any(|h| h.volume_by_uuid(uuid).is_some())
    }

    /// Add a host with a fresh UUID and a fresh random PSK.
    pub fn add_host(&mut self, name: &str) -> Result<&HostEntry, DbError> {
        check_name(name, HOST_NAME_SIZE)?;
        if self.hosts.len() >= MAX_HOSTS {
            return Err(DbError::HostLimit);
        }
        if self.get_host_by_name(name).is_some() {
            return Err(DbError::DuplicateHost(name.to_string()));
        }
        self.hosts.push(HostEntry {
            host_uuid: Uuid::new_v4(),
            host_name: name.to_string(),
            tls_psk: crypto::random_key(),
            client_default_timeout_secs: 0,
            volumes: Vec::new(),
        });
        Ok(self.hosts.last().expect("just pushed"))
    }

    pub fn del_host_by_name(&mut self, name: &str) -> Result<(), DbError> {
        let index = self.host_index(name)?;
        self.hosts.remove(index);
        Ok(())
    }

    /// Replace the TLS PSK of a host; the host UUID stays fixed.
    pub fn rekey_host(&mut self, name: &str) -> Result<(), DbError> {
        let index = self.host_index(name)?;
        let host = &mut self.hosts[index];
        host.tls_psk.zeroize();
        host.tls_psk = crypto::random_key();
        Ok(())
    }

    pub fn set_host_timeout(&mut self, name: &str, secs: u32) -> Result<(), DbError> {
        let index = self.host_index(name)?;
        self.hosts[index].client_default_timeout_secs = secs;
        Ok(())
    }

    /// Add a volume with a fresh random passphrase. The volume UUID must be
    /// the LUKS UUID cryptsetup reports and must be globally unique.
    pub fn add_volume(
        &mut self,
        host_name: &str,
        devmapper_name: &str,
        volume_uuid: Uuid,
    ) -> Result<&VolumeEntry, DbError> {
        check_name(devmapper_name, DEVMAPPER_NAME_SIZE)?;
        if self.volume_uuid_known(&volume_uuid) {
            return Err(DbError::DuplicateVolume(volume_uuid));
        }
        let index = self.host_index(host_name)?;
        let host = &mut self.hosts[index];
        if host.volumes.len() >= MAX_VOLUMES_PER_HOST {
            return Err(DbError::VolumeLimit(host_name.to_string()));
        }
        host.volumes.push(VolumeEntry {
            volume_uuid,
            devmapper_name: devmapper_name.to_string(),
            luks_passphrase_raw: crypto::random_key(),
            volume_flags: 0,
        });
        Ok(host.volumes.last().expect("just pushed"))
    }

    pub fn del_volume(&mut self, host_name: &str, devmapper_name: &str) -> Result<(), DbError> {
        let index = self.host_index(host_name)?;
        let host = &mut self.hosts[index];
        let vol_index = host
            .volumes
            .iter()
            .position(|v| v.devmapper_name == devmapper_name)
            .ok_or_else(|| {
                DbError::UnknownVolume(host_name.to_string(), devmapper_name.to_string())
            })?;
        host.volumes.remove(vol_index);
        Ok(())
    }

    pub fn rekey_volume(
        &mut self,
        host_name: &str,
        devmapper_name: &str,
    ) -> Result<&VolumeEntry, DbError> {
        let index = self.host_index(host_name)?;
        let host = &mut self.hosts[index];
        let volume = host
            .volumes
            .iter_mut()
            .find(|v| v.devmapper_name == devmapper_name)
            .ok_or_else(|| {
                DbError::UnknownVolume(host_name.to_string(), devmapper_name.to_string())
            })?;
        volume.luks_passphrase_raw.zeroize();
        volume.luks_passphrase_raw = crypto::random_key();
        Ok(volume)
    }

    pub fn set_volume_flag(
        &mut self,
        host_name: &str,
        devmapper_name: &str,
        flag: u32,
        enable: bool,
    ) -> Result<(), DbError> {
        let index = self.host_index(host_name)?;
        let host = &mut self.hosts[index];
        let volume = host
            .volumes
            .iter_mut()
            .find(|v| v.devmapper_name == devmapper_name)
            .ok_or_else(|| {
                DbError::UnknownVolume(host_name.to_string(), devmapper_name.to_string())
            })?;
        if enable {
            volume.volume_flags |= flag;
        } else {
            volume.volume_flags &= !flag;
        }
        Ok(())
    }

    pub fn get_volume(
        &self,
        host_name: &str,
        devmapper_name: &str,
    ) -> Result<&VolumeEntry, DbError> {
        let host = self
            .get_host_by_name(host_name)
            .ok_or_else(|| DbError::UnknownHost(host_name.to_string()))?;
        host.volume_by_name(devmapper_name).ok_or_else(|| {
            DbError::UnknownVolume(host_name.to_string(), devmapper_name.to_string())
        })
    }

    /// Client-side view of one host: PSK retained, every raw LUKS passphrase
    /// zeroed, marked as an exported database.
    pub fn export_public(&self, host_name: &str) -> Result<KeyDb, DbError> {
        let host = self
            .get_host_by_name(host_name)
            .ok_or_else(|| DbError::UnknownHost(host_name.to_string()))?;
        let mut exported = host.clone();
        for volume in &mut exported.volumes {
            volume.luks_passphrase_raw.zeroize();
        }
        Ok(KeyDb {
            server_database: false,
            hosts: vec![exported],
        })
    }

    /// Load a database: verify the magic, dispatch on the stored version,
    /// decrypt and authenticate, and migrate legacy payloads to the current
    /// in-memory form.
    pub fn read(path: &Path, passphrase: &str) -> Result<KeyDb, DbError> {
        let data = fs::read(path)?;
        if data.len() < HEADER_SIZE {
            return Err(DbError::Truncated);
        }
        if data[..KEYDB_MAGIC.len()] != KEYDB_MAGIC {
            return Err(DbError::BadMagic);
        }
        let version = u32::from_le_bytes(
            data[KEYDB_MAGIC.len()..HEADER_SIZE]
                .try_into()
                .expect("fixed slice"),
        );
        if !(1..=KEYDB_VERSION).contains(&version) {
            return Err(DbError::UnsupportedVersion(version));
        }

        let record = &data[HEADER_SIZE..];
        if record.len() < RECORD_SIZE {
            return Err(DbError::Truncated);
        }
        let (salt, rest) = record.split_at(SALT_SIZE);
        let (iterations, rest) = rest.split_at(4);
        let (iv, rest) = rest.split_at(GCM_IV_SIZE);
        let (tag, ciphertext) = rest.split_at(GCM_TAG_SIZE);

        let iterations = u32::from_le_bytes(iterations.try_into().expect("fixed slice"));
        if iterations == 0 {
            return Err(DbError::Malformed);
        }

        let key = crypto::derive_key(passphrase.as_bytes(), salt, iterations);
        let payload = crypto::aead_open(
            &key,
            iv.try_into().expect("fixed slice"),
            ciphertext,
            tag.try_into().expect("fixed slice"),
        )?;

        match version {
            1 => decode_payload_v1(&payload),
            2 => decode_payload_v2(&payload),
            _ => decode_payload_v3(&payload),
        }
    }

    /// Save at the current version under a fresh salt and IV, atomically
    /// (temp file in the target directory, then rename).
    pub fn write(&self, path: &Path, passphrase: &str) -> Result<(), DbError> {
        let payload = self.encode_payload();

        let mut salt = [0u8; SALT_SIZE];
        crypto::random_bytes(&mut salt);
        let mut iv = [0u8; GCM_IV_SIZE];
        crypto::random_bytes(&mut iv);

        let key = crypto::derive_key(passphrase.as_bytes(), &salt, PBKDF2_ITERATIONS);
        let (ciphertext, tag) = crypto::aead_seal(&key, &iv, &payload)?;

        let mut out = Vec::with_capacity(HEADER_SIZE + RECORD_SIZE + ciphertext.len());
        out.extend_from_slice(&KEYDB_MAGIC);
        out.extend_from_slice(&KEYDB_VERSION.to_le_bytes());
        out.extend_from_slice(&salt);
        out.extend_from_slice(&PBKDF2_ITERATIONS.to_le_bytes());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&tag);
        out.extend_from_slice(&ciphertext);

        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&out)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| DbError::Io(e.error))?;
        Ok(())
    }

    fn encode_payload(&self) -> Zeroizing<Vec<u8>> {
        let mut buf = Zeroizing::new(Vec::new());
        buf.push(self.server_database as u8);
        buf.extend_from_slice(&(self.hosts.len() as u32).to_le_bytes());
        for host in &self.hosts {
            buf.extend_from_slice(host.host_uuid.as_bytes());
            put_name(&mut buf, &host.host_name, HOST_NAME_SIZE);
            buf.extend_from_slice(&host.tls_psk);
            buf.extend_from_slice(&host.client_default_timeout_secs.to_le_bytes());
            buf.extend_from_slice(&(host.volumes.len() as u32).to_le_bytes());
            for volume in &host.volumes {
                buf.extend_from_slice(volume.volume_uuid.as_bytes());
                put_name(&mut buf, &volume.devmapper_name, DEVMAPPER_NAME_SIZE);
                buf.extend_from_slice(&volume.luks_passphrase_raw);
                buf.extend_from_slice(&volume.volume_flags.to_le_bytes());
            }
            // Unused slots stay all-zero so ciphertext length and padding
            // patterns leak nothing about the volume count.
            let unused = MAX_VOLUMES_PER_HOST - host.volumes.len();
            buf.extend(std::iter::repeat_n(0u8, unused * VOLUME_SLOT_V3));
        }
        buf
    }
}

fn check_name(name: &str, field_size: usize) -> Result<(), DbError> {
    if name.is_empty() || name.len() > field_size - 1 || name.as_bytes().contains(&0) {
        return Err(DbError::NameTooLong(name.to_string(), field_size));
    }
    Ok(())
}

fn put_name(buf: &mut Vec<u8>, name: &str, field_size: usize) {
    let bytes = name.as_bytes();
    buf.extend_from_slice(bytes);
    buf.extend(std::iter::repeat_n(0u8, field_size - bytes.len()));
}

/// Byte reader over an authenticated payload. Running out of bytes here means
/// a corrupt or mis-encoded payload, not a truncated file.
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DbError> {
        let end = self.pos.checked_add(n).ok_or(DbError::Malformed)?;
        if end > self.data.len() {
            return Err(DbError::Malformed);
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, DbError> {
        Ok(self.take(1)?[0])
    }

    fn u32_le(&mut self) -> Result<u32, DbError> {
        Ok(u32::from_le_bytes(
            self.take(4)?.try_into().expect("fixed slice"),
        ))
    }

    fn uuid(&mut self) -> Result<Uuid, DbError> {
        let bytes: [u8; 16] = self.take(16)?.try_into().expect("fixed slice");
        Ok(Uuid::from_bytes(bytes))
    }

    fn name(&mut self, field_size: usize) -> Result<String, DbError> {
        let raw = self.take(field_size)?;
        let end = raw.iter().position(|&b| b == 0).ok_or(DbError::Malformed)?;
        String::from_utf8(raw[..end].to_vec()).map_err(|_| DbError::Malformed)
    }

    fn done(&self) -> bool {
        self.pos == self.data.len()
    }
}

fn decode_volume(reader: &mut Reader<'_>, with_flags: bool) -> Result<VolumeEntry, DbError> {
    let volume_uuid = reader.uuid()?;
    let devmapper_name = reader.name(DEVMAPPER_NAME_SIZE)?;
    let mut luks_passphrase_raw = [0u8; LUKS_PASSPHRASE_RAW_SIZE];
    luks_passphrase_raw.copy_from_slice(reader.take(LUKS_PASSPHRASE_RAW_SIZE)?);
    let volume_flags = if with_flags { reader.u32_le()? } else { 0 };
    Ok(VolumeEntry {
        volume_uuid,
        devmapper_name,
        luks_passphrase_raw,
        volume_flags,
    })
}

fn decode_hosts(
    reader: &mut Reader<'_>,
    host_count: u32,
    with_timeout: bool,
    volume_slot_size: usize,
) -> Result<Vec<HostEntry>, DbError> {
    if host_count as usize > MAX_HOSTS {
        return Err(DbError::Malformed);
    }
    let with_flags = volume_slot_size == VOLUME_SLOT_V3;
    let mut hosts = Vec::with_capacity(host_count as usize);
    for _ in 0..host_count {
        let host_uuid = reader.uuid()?;
        let host_name = reader.name(HOST_NAME_SIZE)?;
        let mut tls_psk = [0u8; PSK_SIZE];
        tls_psk.copy_from_slice(reader.take(PSK_SIZE)?);
        let client_default_timeout_secs = if with_timeout { reader.u32_le()? } else { 0 };
        let volume_count = reader.u32_le()?;
        if volume_count as usize > MAX_VOLUMES_PER_HOST {
            return Err(DbError::Malformed);
        }
        let mut volumes = Vec::with_capacity(volume_count as usize);
        for _ in 0..volume_count {
            volumes.push(decode_volume(reader, with_flags)?);
        }
        let unused = MAX_VOLUMES_PER_HOST - volume_count as usize;
        reader.take(unused * volume_slot_size)?;
        hosts.push(HostEntry {
            host_uuid,
            host_name,
            tls_psk,
            client_default_timeout_secs,
            volumes,
        });
    }
    if !reader.done() {
        return Err(DbError::Malformed);
    }
    Ok(hosts)
}

fn decode_payload_v3(payload: &[u8]) -> Result<KeyDb, DbError> {
    let mut reader = Reader::new(payload);
    let server_database = reader.u8()? != 0;
    let host_count = reader.u32_le()?;
    let hosts = decode_hosts(&mut reader, host_count, true, VOLUME_SLOT_V3)?;
    Ok(KeyDb {
        server_database,
        hosts,
    })
}

/// v2 payloads carry the server flag and per-volume flags but predate the
/// per-host client timeout; migration zero-fills it.
fn decode_payload_v2(payload: &[u8]) -> Result<KeyDb, DbError> {
    let mut reader = Reader::new(payload);
    let server_database = reader.u8()? != 0;
    let host_count = reader.u32_le()?;
    let hosts = decode_hosts(&mut reader, host_count, false, VOLUME_SLOT_V3)?;
    Ok(KeyDb {
        server_database,
        hosts,
    })
}

/// v1 payloads predate the server flag (every database was a server
/// database), the client timeout, and the per-volume flags word.
fn decode_payload_v1(payload: &[u8]) -> Result<KeyDb, DbError> {
    let mut reader = Reader::new(payload);
    let host_count = reader.u32_le()?;
    let hosts = decode_hosts(&mut reader, host_count, false, VOLUME_SLOT_V1)?;
    Ok(KeyDb {
        server_database: true,
        hosts,
    })
}
