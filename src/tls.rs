use std::sync::Arc;

use openssl::error::ErrorStack;
use openssl::ex_data::Index;
use openssl::ssl::{
    Ssl, SslContext, SslContextBuilder, SslMethod, SslOptions, SslRef, SslVersion,
};
use tracing::debug;
use uuid::Uuid;

use crate::crypto::parse_uuid;
use crate::keydb::PSK_SIZE;
use crate::vault::VaultedKeyDb;

/// TLS 1.3 suites permitted on both sides. The PSK binder uses SHA-256, so
/// the ChaCha20 suite is the one actually negotiated.
pub const TLS_CIPHERSUITES: &str = "TLS_CHACHA20_POLY1305_SHA256:TLS_AES_256_GCM_SHA384";
/// Key-exchange groups permitted on both sides.
pub const TLS_GROUPS: &str = "X448:X25519";

fn base_context(method: SslMethod) -> Result<SslContextBuilder, ErrorStack> {
    let mut builder = SslContextBuilder::new(method)?;
    builder.set_min_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_max_proto_version(Some(SslVersion::TLS1_3))?;
    builder.set_ciphersuites(TLS_CIPHERSUITES)?;
    builder.set_groups_list(TLS_GROUPS)?;
    // External PSK only; every connection is a fresh handshake.
    builder.set_options(SslOptions::NO_TICKET);
    Ok(builder)
}

/// Client context. The PSK callback presents the local host UUID (canonical
/// 36-character form) as the identity and copies the PSK out of the vault for
/// just long enough to hand it to the TLS stack.
pub fn client_context(vaulted: Arc<VaultedKeyDb>) -> Result<SslContext, ErrorStack> {
    let mut builder = base_context(SslMethod::tls_client())?;

    let identity = vaulted
        .db()
        .hosts
        .first()
        .map(|h| h.host_uuid.hyphenated().to_string())
        .unwrap_or_default();

    builder.set_psk_client_callback(move |_ssl, _hint, identity_out, psk_out| {
        let id = identity.as_bytes();
        if identity_out.len() < id.len() + 1 || psk_out.len() < PSK_SIZE {
            return Ok(0);
        }
        // The identity buffer wants a NUL-terminated C string.
        identity_out[..id.len()].copy_from_slice(id);
        identity_out[id.len()] = 0;

        match vaulted.psk_for_host(0) {
            Some(psk) => {
                psk_out[..PSK_SIZE].copy_from_slice(&*psk);
                Ok(PSK_SIZE)
            }
            None => Ok(0),
        }
    });

    Ok(builder.build())
}

/// Server context plus the ex-data slot carrying the authenticated host UUID.
pub struct TlsServer {
    context: SslContext,
    identity_index: Index<Ssl, Uuid>,
}

impl TlsServer {
    /// Build the server context. The PSK callback resolves the presented
    /// identity to a host; unknown identities get no PSK and the handshake
    /// fails. On success the host UUID is attached to the session so the
    /// connection handler knows who authenticated.
    pub fn new(vaulted: Arc<VaultedKeyDb>) -> Result<TlsServer, ErrorStack> {
        let identity_index = Ssl::new_ex_index::<Uuid>()?;
        let mut builder = base_context(SslMethod::tls_server())?;

        builder.set_psk_server_callback(move |ssl, identity, psk_out| {
            let uuid = match identity
                .and_then(|id| std::str::from_utf8(id).ok())
                .and_then(parse_uuid)
            {
                Some(uuid) => uuid,
                None => {
                    debug!("Refusing handshake: identity is not a canonical UUID");
                    return Ok(0);
                }
            };

            let host_index = match vaulted.host_position_by_uuid(&uuid) {
                Some(index) => index,
                None => {
                    debug!(uuid = %uuid.hyphenated(), "Refusing handshake: unknown host");
                    return Ok(0);
                }
            };

            match vaulted.psk_for_host(host_index) {
                Some(psk) if psk_out.len() >= PSK_SIZE => {
                    psk_out[..PSK_SIZE].copy_from_slice(&*psk);
                    ssl.set_ex_data(identity_index, uuid);
                    Ok(PSK_SIZE)
                }
                _ => Ok(0),
            }
        });

        Ok(TlsServer {
            context: builder.build(),
            identity_index,
        })
    }

    pub fn new_ssl(&self) -> Result<Ssl, ErrorStack> {
        Ssl::new(&self.context)
    }

    /// The host UUID the PSK callback resolved during the handshake.
    pub fn authenticated_host(&self, ssl: &SslRef) -> Option<Uuid> {
        ssl.ex_data(self.identity_index).copied()
    }
}
