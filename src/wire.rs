use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;
use zeroize::{Zeroize, Zeroizing};

use crate::keydb::LUKS_PASSPHRASE_RAW_SIZE;

/// Size of one unlock record: volume UUID plus raw passphrase.
pub const UNLOCK_MSG_SIZE: usize = 16 + LUKS_PASSPHRASE_RAW_SIZE;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    /// The peer closed the stream in the middle of a record. Records are
    /// fixed-size; anything but a full record or a clean EOF is fatal.
    #[error("short read: {0} of {UNLOCK_MSG_SIZE} bytes before EOF")]
    ShortRead(usize),
}

/// One server-to-client unlock record. Wiped on drop.
pub struct UnlockMsg {
    pub volume_uuid: Uuid,
    pub luks_passphrase_raw: [u8; LUKS_PASSPHRASE_RAW_SIZE],
}

impl UnlockMsg {
    pub fn encode(&self) -> Zeroizing<[u8; UNLOCK_MSG_SIZE]> {
        let mut buf = Zeroizing::new([0u8; UNLOCK_MSG_SIZE]);
        buf[..16].copy_from_slice(self.volume_uuid.as_bytes());
        buf[16..].copy_from_slice(&self.luks_passphrase_raw);
        buf
    }

    pub fn decode(buf: &[u8; UNLOCK_MSG_SIZE]) -> UnlockMsg {
        let mut luks_passphrase_raw = [0u8; LUKS_PASSPHRASE_RAW_SIZE];
        luks_passphrase_raw.copy_from_slice(&buf[16..]);
        UnlockMsg {
            volume_uuid: Uuid::from_bytes(buf[..16].try_into().expect("fixed slice")),
            luks_passphrase_raw,
        }
    }
}

impl Drop for UnlockMsg {
    fn drop(&mut self) {
        self.luks_passphrase_raw.zeroize();
    }
}

/// Read one unlock record. `Ok(None)` on clean EOF before the first byte; a
/// stream ending mid-record is a `ShortRead` protocol error.
pub async fn read_unlock_msg<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<Option<UnlockMsg>, WireError> {
    let mut buf = Zeroizing::new([0u8; UNLOCK_MSG_SIZE]);
    let mut filled = 0;
    while filled < UNLOCK_MSG_SIZE {
        let n = reader.read(&mut buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(WireError::ShortRead(filled));
        }
        filled += n;
    }
    Ok(Some(UnlockMsg::decode(&buf)))
}

pub async fn write_unlock_msg<W: AsyncWrite + Unpin>(
    writer: &mut W,
    msg: &UnlockMsg,
) -> Result<(), WireError> {
    writer.write_all(&*msg.encode()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn sample_msg() -> UnlockMsg {
        UnlockMsg {
            volume_uuid: Uuid::new_v4(),
            luks_passphrase_raw: [0x42u8; LUKS_PASSPHRASE_RAW_SIZE],
        }
    }

    #[test]
    fn test_encode_decode_roundtrip() {
        let msg = sample_msg();
        let buf = msg.encode();
        assert_eq!(buf.len(), 48);
        let decoded = UnlockMsg::decode(&buf);
        assert_eq!(decoded.volume_uuid, msg.volume_uuid);
        assert_eq!(decoded.luks_passphrase_raw, msg.luks_passphrase_raw);
    }

    #[tokio::test]
    async fn test_stream_roundtrip() {
        let first = sample_msg();
        let second = sample_msg();
        let mut buf = Vec::new();
        write_unlock_msg(&mut buf, &first).await.unwrap();
        write_unlock_msg(&mut buf, &second).await.unwrap();

        let mut cursor = Cursor::new(buf);
        let a = read_unlock_msg(&mut cursor).await.unwrap().unwrap();
        let b = read_unlock_msg(&mut cursor).await.unwrap().unwrap();
        assert_eq!(a.volume_uuid, first.volume_uuid);
        assert_eq!(b.volume_uuid, second.volume_uuid);
        // Clean EOF after the last full record.
        assert!(read_unlock_msg(&mut cursor).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_short_read_is_protocol_error() {
        let msg = sample_msg();
        let mut buf = Vec::new();
        write_unlock_msg(&mut buf, &msg).await.unwrap();
        buf.truncate(20);

        let mut cursor = Cursor::new(buf);
        match read_unlock_msg(&mut cursor).await {
            Err(WireError::ShortRead(20)) => {}
            other => panic!("expected short read, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_empty_stream_is_clean_eof() {
        let mut cursor = Cursor::new(Vec::new());
        assert!(read_unlock_msg(&mut cursor).await.unwrap().is_none());
    }
}
