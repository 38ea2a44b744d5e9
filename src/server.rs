use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio_openssl::SslStream;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::blacklist::{BLACKLIST_TIMEOUT_SERVER, TimedSet};
use crate::discovery;
use crate::keydb::KeyDb;
use crate::tls::TlsServer;
use crate::vault::VaultedKeyDb;
use crate::wire::{self, UnlockMsg};

/// Shared state accessible by the UDP task and all connection handlers.
struct ServerState {
    vaulted: Arc<VaultedKeyDb>,
    tls: TlsServer,
    cooldown: TimedSet<Uuid>,
}

/// The key server: answers discovery queries over UDP and streams unlock
/// messages to PSK-authenticated clients over TCP, on the same port.
pub struct Server {
    udp: UdpSocket,
    tcp: TcpListener,
    state: Arc<ServerState>,
}

impl Server {
    /// Vault the database and bind both sockets. The database must be a
    /// server database; an exported one holds no LUKS passphrases.
    pub async fn bind(db: KeyDb, port: u16) -> Result<Server> {
        anyhow::ensure!(
            db.server_database,
            "not a server database -- refusing to serve from an exported database"
        );
        let vaulted = Arc::new(VaultedKeyDb::new(db));
        let tls = TlsServer::new(Arc::clone(&vaulted))
            .context("Failed to create TLS server context")?;

        let udp = UdpSocket::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to bind UDP port {port}"))?;
        let tcp = TcpListener::bind(("0.0.0.0", port))
            .await
            .with_context(|| format!("Failed to bind TCP port {port}"))?;

        Ok(Server {
            udp,
            tcp,
            state: Arc::new(ServerState {
                vaulted,
                tls,
                cooldown: TimedSet::new(BLACKLIST_TIMEOUT_SERVER),
            }),
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp.local_addr()
    }

    pub fn udp_local_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp.local_addr()
    }

    /// Run the discovery task and the TCP accept loop until an accept error.
    pub async fn run(self) -> Result<()> {
        let Server { udp, tcp, state } = self;

        let udp_state = Arc::clone(&state);
        let udp_task = tokio::spawn(async move {
            discovery_loop(udp, udp_state).await;
        });

        let result = accept_loop(tcp, state).await;
        udp_task.abort();
        result
    }
}

/// Run the server until ctrl-c.
pub async fn serve(db: KeyDb, port: u16) -> Result<()> {
    let server = Server::bind(db, port).await?;
    info!(
        addr = %server.local_addr()?,
        hosts = server.state.vaulted.db().hosts.len(),
        "Key server listening (TCP + UDP)"
    );

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received, stopping");
            Ok(())
        }
    }
}

async fn discovery_loop(udp: UdpSocket, state: Arc<ServerState>) {
    let mut buf = [0u8; 64];
    loop {
        match udp.recv_from(&mut buf).await {
            Ok((len, src)) => {
                let reply =
                    discovery::handle_query(&buf[..len], src, &state.vaulted, &state.cooldown)
                        .await;
                if let Some(response) = reply {
                    if let Err(err) = udp.send_to(&response, src).await {
                        warn!(peer = %src, error = %err, "Failed to send discovery response");
                    }
                }
            }
            Err(err) => {
                error!(error = %err, "UDP receive error");
            }
        }
    }
}

async fn accept_loop(tcp: TcpListener, state: Arc<ServerState>) -> Result<()> {
    loop {
        match tcp.accept().await {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    if let Err(err) = handle_connection(stream, peer, &state).await {
                        warn!(peer = %peer, error = %err, "Connection handler error");
                    }
                });
            }
            Err(err) => {
                error!(error = %err, "Accept error");
            }
        }
    }
}

/// Handle one unlock connection: TLS-PSK handshake, then one unlock message
/// per volume of the authenticated host, in database order, then close. A
/// failure here never affects other connections.
async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    state: &ServerState,
) -> Result<()> {
    let ssl = state.tls.new_ssl()?;
    let mut tls_stream = SslStream::new(ssl, stream)?;
    Pin::new(&mut tls_stream)
        .accept()
        .await
        .context("TLS handshake failed")?;

    let host_uuid = state
        .tls
        .authenticated_host(tls_stream.ssl())
        .context("Handshake completed without an authenticated host")?;
    let host_index = state
        .vaulted
        .host_position_by_uuid(&host_uuid)
        .context("Authenticated host vanished from the database")?;
    let host = &state.vaulted.db().hosts[host_index];

    info!(
        peer = %peer,
        host = %host.host_name,
        volumes = host.volumes.len(),
        "Streaming unlock messages"
    );

    for (volume_index, volume) in host.volumes.iter().enumerate() {
        let passphrase = state
            .vaulted
            .luks_passphrase(host_index, volume_index)
            .context("Volume passphrase missing from vault")?;
        let msg = UnlockMsg {
            volume_uuid: volume.volume_uuid,
            luks_passphrase_raw: *passphrase,
        };
        wire::write_unlock_msg(&mut tls_stream, &msg).await?;
        debug!(
            peer = %peer,
            volume = %volume.devmapper_name,
            "Unlock message sent"
        );
    }

    tls_stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refuses_exported_database() {
        let mut db = KeyDb::new();
        db.add_host("alpha").unwrap();
        let exported = db.export_public("alpha").unwrap();

        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let result = rt.block_on(Server::bind(exported, 0));
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let mut db = KeyDb::new();
        db.add_host("alpha").unwrap();
        let server = Server::bind(db, 0).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
        assert_ne!(server.udp_local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_server_state_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ServerState>();
    }
}
