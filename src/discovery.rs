use std::net::SocketAddr;

use tracing::{debug, trace};
use uuid::Uuid;

use crate::blacklist::TimedSet;
use crate::crypto::format_uuid;
use crate::vault::VaultedKeyDb;

/// Client broadcast: "who serves keys for this host UUID?"
pub const QUERY_MAGIC: [u8; 8] = *b"LUKSRKUQ";
/// Server unicast answer: "I do."
pub const RESPONSE_MAGIC: [u8; 8] = *b"LUKSRKUR";

pub const QUERY_SIZE: usize = QUERY_MAGIC.len() + 16;
pub const RESPONSE_SIZE: usize = RESPONSE_MAGIC.len();

pub fn encode_query(host_uuid: &Uuid) -> [u8; QUERY_SIZE] {
    let mut datagram = [0u8; QUERY_SIZE];
    datagram[..QUERY_MAGIC.len()].copy_from_slice(&QUERY_MAGIC);
    datagram[QUERY_MAGIC.len()..].copy_from_slice(host_uuid.as_bytes());
    datagram
}

/// Returns the queried host UUID, or `None` for anything that is not an
/// exactly-sized query with the right magic.
pub fn decode_query(datagram: &[u8]) -> Option<Uuid> {
    if datagram.len() != QUERY_SIZE || datagram[..QUERY_MAGIC.len()] != QUERY_MAGIC {
        return None;
    }
    let bytes: [u8; 16] = datagram[QUERY_MAGIC.len()..].try_into().ok()?;
    Some(Uuid::from_bytes(bytes))
}

pub fn encode_response() -> [u8; RESPONSE_SIZE] {
    RESPONSE_MAGIC
}

pub fn is_response(datagram: &[u8]) -> bool {
    datagram.len() == RESPONSE_SIZE && datagram[..] == RESPONSE_MAGIC
}

/// Server-side handling of one received datagram.
///
/// Drops bad magic, unknown host UUIDs, and hosts still in cooldown; only
/// then arms the cooldown and returns the response to unicast back. The
/// cooldown is keyed by host UUID, so within one window the server answers a
/// given UUID at most once no matter how many sources ask — flooding the
/// broadcast domain with candidate UUIDs does not reveal which ones exist.
pub async fn handle_query(
    datagram: &[u8],
    src: SocketAddr,
    vaulted: &VaultedKeyDb,
    cooldown: &TimedSet<Uuid>,
) -> Option<[u8; RESPONSE_SIZE]> {
    let host_uuid = match decode_query(datagram) {
        Some(uuid) => uuid,
        None => {
            trace!(peer = %src, len = datagram.len(), "Ignoring malformed discovery datagram");
            return None;
        }
    };

    if vaulted.host_position_by_uuid(&host_uuid).is_none() {
        debug!(peer = %src, uuid = %format_uuid(&host_uuid), "Discovery query for unknown host");
        return None;
    }

    if cooldown.contains(&host_uuid).await {
        debug!(peer = %src, uuid = %format_uuid(&host_uuid), "Discovery query ignored, cooldown in effect");
        return None;
    }

    cooldown.insert(host_uuid).await;
    debug!(peer = %src, uuid = %format_uuid(&host_uuid), "Answering discovery query");
    Some(encode_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keydb::KeyDb;
    use std::time::Duration;

    fn test_src() -> SocketAddr {
        "192.168.1.20:23170".parse().unwrap()
    }

    fn vaulted_with_host() -> (VaultedKeyDb, Uuid) {
        let mut db = KeyDb::new();
        db.add_host("alpha").unwrap();
        db.add_volume("alpha", "crypt-root", Uuid::new_v4()).unwrap();
        let uuid = db.hosts[0].host_uuid;
        (VaultedKeyDb::new(db), uuid)
    }

    #[test]
    fn test_query_roundtrip() {
        let uuid = Uuid::new_v4();
        let datagram = encode_query(&uuid);
        assert_eq!(datagram.len(), 24);
        assert_eq!(decode_query(&datagram), Some(uuid));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let uuid = Uuid::new_v4();
        let mut datagram = encode_query(&uuid);
        datagram[0] ^= 0x01;
        assert_eq!(decode_query(&datagram), None);
        assert_eq!(decode_query(&encode_query(&uuid)[..23]), None);
        assert_eq!(decode_query(&[]), None);
        // A response is not a query.
        assert_eq!(decode_query(&encode_response()), None);
    }

    #[test]
    fn test_response_magic() {
        assert!(is_response(&encode_response()));
        assert!(!is_response(&QUERY_MAGIC));
        assert!(!is_response(b"LUKSRKUR trailing"));
    }

    #[tokio::test]
    async fn test_handle_query_answers_known_host() {
        let (vaulted, uuid) = vaulted_with_host();
        let cooldown = TimedSet::new(Duration::from_secs(10));
        let reply = handle_query(&encode_query(&uuid), test_src(), &vaulted, &cooldown).await;
        assert_eq!(reply, Some(RESPONSE_MAGIC));
    }

    #[tokio::test]
    async fn test_handle_query_drops_unknown_host() {
        let (vaulted, _) = vaulted_with_host();
        let cooldown = TimedSet::new(Duration::from_secs(10));
        let reply = handle_query(
            &encode_query(&Uuid::nil()),
            test_src(),
            &vaulted,
            &cooldown,
        )
        .await;
        assert_eq!(reply, None);
        // Unknown UUIDs never arm the cooldown.
        assert!(cooldown.is_empty().await);
    }

    #[tokio::test]
    async fn test_handle_query_drops_bad_magic() {
        let (vaulted, uuid) = vaulted_with_host();
        let cooldown = TimedSet::new(Duration::from_secs(10));
        let mut datagram = encode_query(&uuid);
        datagram[7] = b'X';
        let reply = handle_query(&datagram, test_src(), &vaulted, &cooldown).await;
        assert_eq!(reply, None);
    }

    #[tokio::test]
    async fn test_cooldown_answers_once_per_window() {
        let (vaulted, uuid) = vaulted_with_host();
        let cooldown = TimedSet::new(Duration::from_millis(40));
        let query = encode_query(&uuid);

        let first = handle_query(&query, test_src(), &vaulted, &cooldown).await;
        assert!(first.is_some());

        // Same UUID from a different source: still suppressed.
        let other_src: SocketAddr = "192.168.1.99:23170".parse().unwrap();
        let second = handle_query(&query, other_src, &vaulted, &cooldown).await;
        assert_eq!(second, None);

        // After the window has elapsed the query is answered again.
        tokio::time::sleep(Duration::from_millis(80)).await;
        let third = handle_query(&query, test_src(), &vaulted, &cooldown).await;
        assert!(third.is_some());
    }
}
