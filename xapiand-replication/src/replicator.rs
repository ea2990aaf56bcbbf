use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use xapiand_wal::WalEntry;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::message::ReplicationMessageType;
use crate::payload::ReplWelcome;
use crate::serial::{put_string, Reader};

const DEFAULT_STREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Events produced by the replication stream after `need`.
#[derive(Debug)]
pub enum ReplEvent {
    Entry(WalEntry),
    Done { mastery_level: i64 },
}

/// Client half of the replication role: pulls a shard's log from the
/// node that announced a higher mastery. The first frame it sends binds
/// the connection to this role.
pub struct ReplicationClient<S> {
    stream: S,
    stream_timeout: Duration,
    next_expected: Option<u64>,
}

impl ReplicationClient<TcpStream> {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> ReplicationClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            stream_timeout: DEFAULT_STREAM_TIMEOUT,
            next_expected: None,
        }
    }

    pub fn set_stream_timeout(&mut self, timeout: Duration) {
        self.stream_timeout = timeout;
    }

    async fn send(&mut self, ty: ReplicationMessageType, payload: &[u8]) -> Result<()> {
        write_frame(&mut self.stream, ty.as_u8(), payload).await
    }

    async fn recv(&mut self) -> Result<(ReplicationMessageType, bytes::Bytes)> {
        let (ty, payload) =
            match tokio::time::timeout(self.stream_timeout, read_frame(&mut self.stream)).await {
                Ok(read) => read?,
                Err(_) => return Err(Error::NetworkTimeout),
            };
        Ok((ReplicationMessageType::try_from(ty)?, payload))
    }

    /// Announces the shard path; the server answers with the shard's
    /// identity and last tx.
    pub async fn hello(&mut self, path: &str) -> Result<ReplWelcome> {
        let mut payload = Vec::new();
        put_string(&mut payload, path.as_bytes());
        self.send(ReplicationMessageType::Hello, &payload).await?;
        match self.recv().await? {
            (ReplicationMessageType::Welcome, body) => ReplWelcome::decode(&body),
            _ => Err(Error::BadMessage("expected welcome")),
        }
    }

    /// Requests every entry past `since_tx_id` (`None` for the whole
    /// log). Follow with `next_event` until `Done`.
    pub async fn need(&mut self, since_tx_id: Option<u64>) -> Result<()> {
        let mut payload = Vec::new();
        match since_tx_id {
            Some(since) => {
                payload.push(1);
                crate::serial::put_length(&mut payload, since);
                self.next_expected = Some(since + 1);
            }
            None => {
                payload.push(0);
                self.next_expected = None;
            }
        }
        self.send(ReplicationMessageType::Need, &payload).await
    }

    /// Next streamed entry, or the terminal mastery announcement.
    /// Entries must arrive in strictly increasing, contiguous tx order.
    pub async fn next_event(&mut self) -> Result<ReplEvent> {
        match self.recv().await? {
            (ReplicationMessageType::Entry, body) => {
                let (entry, _) = WalEntry::decode(&body)?
                    .ok_or(Error::BadMessage("empty replication entry"))?;
                if self.next_expected.is_some_and(|expected| entry.tx_id != expected) {
                    return Err(Error::ReplicationOutOfOrder);
                }
                self.next_expected = Some(entry.tx_id + 1);
                Ok(ReplEvent::Entry(entry))
            }
            (ReplicationMessageType::Done, body) => {
                let mastery_level = Reader::new(&body).length()? as i64;
                Ok(ReplEvent::Done { mastery_level })
            }
            _ => Err(Error::BadMessage("unexpected replication frame")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame;
    use xapiand_wal::WalOp;

    #[tokio::test]
    async fn pull_loop_round_trip() {
        let (client_io, mut server_io) = tokio::io::duplex(16 * 1024);

        let server = tokio::spawn(async move {
            // Hello
            let (ty, body) = frame::read_frame(&mut server_io).await.unwrap();
            assert_eq!(ty, ReplicationMessageType::Hello.as_u8());
            let mut reader = Reader::new(&body);
            assert_eq!(reader.string().unwrap(), b"/idx/shard0");
            let welcome = ReplWelcome {
                uuid: uuid::Uuid::new_v4(),
                last_tx_id: Some(2),
            };
            frame::write_frame(
                &mut server_io,
                ReplicationMessageType::Welcome.as_u8(),
                &welcome.encode(),
            )
            .await
            .unwrap();

            // Need
            let (ty, _) = frame::read_frame(&mut server_io).await.unwrap();
            assert_eq!(ty, ReplicationMessageType::Need.as_u8());

            for tx in 0..3u64 {
                let entry = WalEntry::new(tx, WalOp::AddDoc, format!("doc{tx}"));
                frame::write_frame(
                    &mut server_io,
                    ReplicationMessageType::Entry.as_u8(),
                    &entry.encode(),
                )
                .await
                .unwrap();
            }
            let mut done = Vec::new();
            crate::serial::put_length(&mut done, 7);
            frame::write_frame(&mut server_io, ReplicationMessageType::Done.as_u8(), &done)
                .await
                .unwrap();
        });

        let mut client = ReplicationClient::new(client_io);
        let welcome = client.hello("/idx/shard0").await.unwrap();
        assert_eq!(welcome.last_tx_id, Some(2));
        client.need(None).await.unwrap();

        let mut entries = Vec::new();
        let mastery = loop {
            match client.next_event().await.unwrap() {
                ReplEvent::Entry(entry) => entries.push(entry),
                ReplEvent::Done { mastery_level } => break mastery_level,
            }
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[2].tx_id, 2);
        assert_eq!(mastery, 7);
        server.await.unwrap();
    }
}
