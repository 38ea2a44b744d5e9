//! # luksrku — remote unlocking of LUKS volumes over TLS-PSK
//!
//! A client in the initramfs of a full-disk-encrypted headless host contacts
//! a key server over TLS 1.3 with an external pre-shared key and receives the
//! passphrases needed to open its dm-crypt/LUKS mappings at boot.
//!
//! ## Module breakdown
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto`] | RNG, PBKDF2, AES-256-GCM, passphrase transcription, UUIDs |
//! | [`keydb`] | Versioned encrypted key database on disk |
//! | [`vault`] | In-memory secret storage under an ephemeral key |
//! | [`discovery`] | UDP broadcast discovery of key servers |
//! | [`blacklist`] | Time-windowed cooldown and blacklist sets |
//! | [`tls`] | TLS 1.3 external-PSK contexts |
//! | [`wire`] | Fixed-size unlock message stream |
//! | [`luks`] | cryptsetup collaborator |
//! | [`client`] | Unlock orchestrator (direct and broadcast modes) |
//! | [`server`] | Key server (UDP discovery + TCP unlock streaming) |
//! | [`editor`] | Interactive database editor |

pub mod blacklist;
pub mod client;
pub mod crypto;
pub mod discovery;
pub mod editor;
pub mod keydb;
pub mod logging;
pub mod luks;
pub mod server;
pub mod tls;
pub mod vault;
pub mod wire;

/// Default port for both UDP discovery and TCP unlock connections.
pub const DEFAULT_PORT: u16 = 23170;
