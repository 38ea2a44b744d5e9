use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use openssl::ssl::{Ssl, SslContext};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::Instant;
use tokio_openssl::SslStream;
use tracing::{debug, error, info, trace, warn};

use crate::blacklist::{BLACKLIST_TIMEOUT_CLIENT, TimedSet};
use crate::crypto;
use crate::discovery;
use crate::keydb::KeyDb;
use crate::luks;
use crate::tls;
use crate::vault::VaultedKeyDb;
use crate::wire::{self, UnlockMsg};

/// How long one broadcast round waits for a server announcement.
const BROADCAST_WAIT: Duration = Duration::from_secs(1);

#[derive(Clone)]
pub struct ClientOpts {
    pub port: u16,
    /// CLI timeout override; the database default applies when absent.
    /// Zero means search forever.
    pub timeout_secs: Option<u64>,
    /// Report received keys as unlocked without invoking cryptsetup.
    pub no_luks: bool,
    /// Skip discovery and contact only this server.
    pub hostname: Option<String>,
}

/// The unlock client: holds the exported database (vaulted), the TLS
/// context, and the per-volume unlocked bitmap.
pub struct KeyClient {
    vaulted: Arc<VaultedKeyDb>,
    tls: SslContext,
    unlocked: Vec<bool>,
    opts: ClientOpts,
}

impl KeyClient {
    /// Validate the exported database and probe which volumes are already
    /// open under `/dev/mapper`.
    pub fn new(db: KeyDb, opts: ClientOpts) -> Result<KeyClient> {
        anyhow::ensure!(
            !db.server_database,
            "this database contains LUKS passphrases, refusing to work with it -- export a client database instead"
        );
        anyhow::ensure!(
            db.hosts.len() == 1,
            "expected exactly one host entry in an exported database, found {}",
            db.hosts.len()
        );
        anyhow::ensure!(
            !db.hosts[0].volumes.is_empty(),
            "no volumes found in the exported database"
        );

        let unlocked = db.hosts[0]
            .volumes
            .iter()
            .map(|v| luks::is_luks_device_opened(&v.devmapper_name))
            .collect();

        let vaulted = Arc::new(VaultedKeyDb::new(db));
        let tls = tls::client_context(Arc::clone(&vaulted))
            .context("Failed to create TLS client context")?;

        Ok(KeyClient {
            vaulted,
            tls,
            unlocked,
            opts,
        })
    }

    pub fn all_unlocked(&self) -> bool {
        self.unlocked.iter().all(|&u| u)
    }

    pub fn locked_count(&self) -> usize {
        self.unlocked.iter().filter(|&&u| !u).count()
    }

    /// CLI timeout wins over the database default; zero means forever.
    fn timeout_secs(&self) -> u64 {
        match self.opts.timeout_secs {
            Some(secs) => secs,
            None => u64::from(self.vaulted.db().hosts[0].client_default_timeout_secs),
        }
    }

    /// Run one unlock session against a server and process every message it
    /// streams until the clean close.
    pub async fn unlock_from(&mut self, addr: SocketAddr) -> Result<()> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("Failed to connect to {addr}"))?;
        let ssl = Ssl::new(&self.tls)?;
        let mut tls_stream = SslStream::new(ssl, stream)?;
        Pin::new(&mut tls_stream)
            .connect()
            .await
            .context("TLS handshake failed")?;
        debug!(server = %addr, "TLS-PSK handshake complete");

        while let Some(msg) = wire::read_unlock_msg(&mut tls_stream).await? {
            self.handle_unlock_msg(msg).await;
        }
        Ok(())
    }

    async fn handle_unlock_msg(&mut self, msg: UnlockMsg) {
        let host = &self.vaulted.db().hosts[0];
        let uuid_str = crypto::format_uuid(&msg.volume_uuid);
        let Some(index) = host.volume_position_by_uuid(&msg.volume_uuid) else {
            warn!(
                uuid = %uuid_str,
                "Server provided a key for a volume unknown on this client"
            );
            return;
        };
        let volume = &host.volumes[index];
        trace!(uuid = %uuid_str, volume = %volume.devmapper_name, "Received unlock message");

        if self.unlocked[index] {
            debug!(volume = %volume.devmapper_name, "Volume already unlocked, skipping");
            return;
        }

        if self.opts.no_luks {
            info!(
                volume = %volume.devmapper_name,
                uuid = %uuid_str,
                "Unlock message received (LUKS invocation disabled)"
            );
            self.unlocked[index] = true;
            return;
        }

        let passphrase = crypto::ascii_encode(&msg.luks_passphrase_raw);
        let success = luks::open_luks_device(
            &msg.volume_uuid,
            &volume.devmapper_name,
            &passphrase,
            volume.allow_discards(),
        )
        .await;
        if success {
            info!(volume = %volume.devmapper_name, uuid = %uuid_str, "Volume unlocked");
        } else {
            error!(
                volume = %volume.devmapper_name,
                uuid = %uuid_str,
                "Unlocking failed with the server-provided passphrase"
            );
        }
        self.unlocked[index] = success;
    }

    /// Direct mode: one attempt against a named server, then evaluate.
    async fn run_direct(&mut self, hostname: &str) -> Result<()> {
        let addr = resolve_ipv4(hostname, self.opts.port).await?;
        debug!(hostname, addr = %addr, "Contacting key server directly");
        self.unlock_from(addr)
            .await
            .with_context(|| format!("Failed to contact key server {hostname}"))?;
        if self.all_unlocked() {
            info!("All volumes unlocked");
            Ok(())
        } else {
            bail!("{} volumes still locked", self.locked_count());
        }
    }

    /// Broadcast mode: query every second, chase announcements, give up at
    /// the deadline.
    async fn run_broadcast(&mut self) -> Result<()> {
        let timeout_secs = self.timeout_secs();
        if timeout_secs > 0 {
            debug!(timeout_secs, "Searching for key server, will give up after timeout");
        } else {
            debug!("Searching for key server, will not give up until all volumes are unlocked");
        }

        let udp = UdpSocket::bind(("0.0.0.0", 0))
            .await
            .context("Failed to bind UDP socket")?;
        udp.set_broadcast(true)
            .context("Failed to enable broadcast")?;

        let blacklist = TimedSet::new(BLACKLIST_TIMEOUT_CLIENT);
        let deadline =
            (timeout_secs > 0).then(|| Instant::now() + Duration::from_secs(timeout_secs));
        let query = discovery::encode_query(&self.vaulted.db().hosts[0].host_uuid);

        loop {
            trace!("Broadcasting search for key server");
            if let Err(err) = udp
                .send_to(&query, (Ipv4Addr::BROADCAST, self.opts.port))
                .await
            {
                warn!(error = %err, "Failed to send broadcast query");
            }

            let mut buf = [0u8; 16];
            match tokio::time::timeout(BROADCAST_WAIT, udp.recv_from(&mut buf)).await {
                Ok(Ok((len, src))) if discovery::is_response(&buf[..len]) => {
                    if blacklist.contains(&src.ip()).await {
                        debug!(server = %src.ip(), "Announcement ignored, blacklist in effect");
                    } else {
                        info!(server = %src.ip(), "Key server found");
                        blacklist.insert(src.ip()).await;
                        let addr = SocketAddr::new(src.ip(), self.opts.port);
                        if let Err(err) = self.unlock_from(addr).await {
                            warn!(
                                server = %src.ip(),
                                error = %err,
                                "Key server announced itself, but unlocking from it failed"
                            );
                        }
                    }
                }
                Ok(Ok((len, src))) => {
                    trace!(peer = %src, len, "Ignoring unrelated datagram");
                }
                Ok(Err(err)) => {
                    warn!(error = %err, "UDP receive error");
                }
                Err(_) => {} // receive window elapsed, loop around
            }

            if self.all_unlocked() {
                info!("All volumes unlocked");
                return Ok(());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    bail!(
                        "could not unlock all volumes after {timeout_secs} seconds, giving up -- {} volumes still locked",
                        self.locked_count()
                    );
                }
            }
        }
    }

    /// Entry point: exits early when everything is already open, otherwise
    /// runs direct or broadcast mode to completion.
    pub async fn run(mut self) -> Result<()> {
        let volume_count = self.vaulted.db().hosts[0].volumes.len();
        if self.all_unlocked() {
            info!(
                volumes = volume_count,
                "All volumes are unlocked already, not contacting a key server"
            );
            return Ok(());
        }
        debug!(
            locked = self.locked_count(),
            total = volume_count,
            "Volumes currently locked"
        );

        match self.opts.hostname.clone() {
            Some(hostname) => self.run_direct(&hostname).await,
            None => self.run_broadcast().await,
        }
    }
}

async fn resolve_ipv4(hostname: &str, port: u16) -> Result<SocketAddr> {
    let mut addrs = tokio::net::lookup_host((hostname, port))
        .await
        .with_context(|| format!("Failed to resolve hostname {hostname}"))?;
    addrs
        .find(SocketAddr::is_ipv4)
        .with_context(|| format!("{hostname} did not resolve to an IPv4 address"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn exported_db() -> KeyDb {
        let mut db = KeyDb::new();
        db.add_host("alpha").unwrap();
        db.add_volume("alpha", "luksrku-test-root", Uuid::new_v4())
            .unwrap();
        db.add_volume("alpha", "luksrku-test-data", Uuid::new_v4())
            .unwrap();
        db.export_public("alpha").unwrap()
    }

    fn opts() -> ClientOpts {
        ClientOpts {
            port: 23170,
            timeout_secs: None,
            no_luks: true,
            hostname: None,
        }
    }

    #[test]
    fn test_refuses_server_database() {
        let mut db = KeyDb::new();
        db.add_host("alpha").unwrap();
        db.add_volume("alpha", "crypt-root", Uuid::new_v4()).unwrap();
        assert!(KeyClient::new(db, opts()).is_err());
    }

    #[test]
    fn test_refuses_multi_host_database() {
        let mut db = exported_db();
        db.hosts.push(db.hosts[0].clone());
        assert!(KeyClient::new(db, opts()).is_err());
    }

    #[test]
    fn test_refuses_database_without_volumes() {
        let mut db = KeyDb::new();
        db.add_host("alpha").unwrap();
        let exported = db.export_public("alpha").unwrap();
        assert!(KeyClient::new(exported, opts()).is_err());
    }

    #[test]
    fn test_initial_probe_finds_nothing_unlocked() {
        // The test mapping names do not exist under /dev/mapper.
        let client = KeyClient::new(exported_db(), opts()).unwrap();
        assert!(!client.all_unlocked());
        assert_eq!(client.locked_count(), 2);
    }

    #[tokio::test]
    async fn test_unlock_message_handling() {
        let mut keyclient = KeyClient::new(exported_db(), opts()).unwrap();
        let uuid = keyclient.vaulted.db().hosts[0].volumes[0].volume_uuid;
        let msg = || UnlockMsg {
            volume_uuid: uuid,
            luks_passphrase_raw: [0x42u8; 32],
        };

        keyclient.handle_unlock_msg(msg()).await;
        assert_eq!(keyclient.locked_count(), 1);

        // A repeated key for the same volume is skipped.
        keyclient.handle_unlock_msg(msg()).await;
        assert_eq!(keyclient.locked_count(), 1);

        // A key for a volume this client does not know is ignored.
        keyclient
            .handle_unlock_msg(UnlockMsg {
                volume_uuid: Uuid::new_v4(),
                luks_passphrase_raw: [0x42u8; 32],
            })
            .await;
        assert_eq!(keyclient.locked_count(), 1);
    }

    #[test]
    fn test_cli_timeout_overrides_database_default() {
        let mut db = KeyDb::new();
        db.add_host("alpha").unwrap();
        db.add_volume("alpha", "luksrku-test-root", Uuid::new_v4())
            .unwrap();
        db.set_host_timeout("alpha", 300).unwrap();
        let exported = db.export_public("alpha").unwrap();

        let from_db = KeyClient::new(exported.clone(), opts()).unwrap();
        assert_eq!(from_db.timeout_secs(), 300);

        let mut with_cli = opts();
        with_cli.timeout_secs = Some(2);
        let overridden = KeyClient::new(exported, with_cli).unwrap();
        assert_eq!(overridden.timeout_secs(), 2);
    }
}
