use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::{Error, Result};
use crate::frame::{read_frame, write_frame};
use crate::message::{RemoteMessageType, RemoteReplyType};
use crate::payload::{
    AddDocumentReply, DatabaseUpdate, EnquireParams, ExceptionBody, FreqsReply, GetMSet,
    MutationOutcome, PostingEntry, QueryRequest, ResultsReply, SelectDatabase, ValueStatsReply,
};
use crate::prefix::PrefixDecoder;
use crate::serial::{put_length, put_string, Reader};
use crate::REMOTE_PROTOCOL_MAJOR_VERSION;

const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(60);

/// Client half of the remote role: one in-flight request at a time over
/// a single connection, replies read before the next request is sent.
pub struct RemoteClient<S> {
    stream: S,
    reply_timeout: Duration,
}

impl RemoteClient<TcpStream> {
    pub async fn connect(addr: impl tokio::net::ToSocketAddrs) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> RemoteClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            reply_timeout: DEFAULT_REPLY_TIMEOUT,
        }
    }

    pub fn set_reply_timeout(&mut self, timeout: Duration) {
        self.reply_timeout = timeout;
    }

    async fn send(&mut self, ty: RemoteMessageType, payload: &[u8]) -> Result<()> {
        tracing::trace!(msg = ty.name(), len = payload.len(), ">> send");
        write_frame(&mut self.stream, ty.as_u8(), payload).await
    }

    /// Reads one reply frame; an `Exception` reply surfaces as an error.
    async fn recv(&mut self) -> Result<(RemoteReplyType, Bytes)> {
        let (ty, payload) =
            match tokio::time::timeout(self.reply_timeout, read_frame(&mut self.stream)).await {
                Ok(read) => read?,
                Err(_) => return Err(Error::NetworkTimeout),
            };
        let ty = RemoteReplyType::try_from(ty)?;
        if ty == RemoteReplyType::Exception {
            let body = ExceptionBody::decode(&payload)?;
            return Err(Error::Remote {
                type_code: body.type_code,
                context: body.context,
                message: body.message,
            });
        }
        Ok((ty, payload))
    }

    async fn exchange(
        &mut self,
        ty: RemoteMessageType,
        payload: &[u8],
        expect: RemoteReplyType,
    ) -> Result<Bytes> {
        self.send(ty, payload).await?;
        let (reply, body) = self.recv().await?;
        if reply != expect {
            return Err(Error::UnexpectedReply {
                request: ty.name(),
                found: reply,
            });
        }
        Ok(body)
    }

    fn check_update(&self, update: &DatabaseUpdate) -> Result<()> {
        if update.protocol_major != REMOTE_PROTOCOL_MAJOR_VERSION {
            return Err(Error::ProtocolVersionMismatch {
                found: update.protocol_major,
                expected: REMOTE_PROTOCOL_MAJOR_VERSION,
            });
        }
        Ok(())
    }

    /// Selects shard(s) for reading; the connection serves them until
    /// the next select.
    pub async fn read_access(&mut self, paths: Vec<String>, flags: u64) -> Result<DatabaseUpdate> {
        let select = SelectDatabase { flags, paths };
        let body = self
            .exchange(
                RemoteMessageType::ReadAccess,
                &select.encode(),
                RemoteReplyType::Update,
            )
            .await?;
        let update = DatabaseUpdate::decode(&body)?;
        self.check_update(&update)?;
        Ok(update)
    }

    /// Selects a single shard for writing.
    pub async fn write_access(&mut self, path: String, flags: u64) -> Result<DatabaseUpdate> {
        let select = SelectDatabase {
            flags,
            paths: vec![path],
        };
        let body = self
            .exchange(
                RemoteMessageType::WriteAccess,
                &select.encode(),
                RemoteReplyType::Update,
            )
            .await?;
        let update = DatabaseUpdate::decode(&body)?;
        self.check_update(&update)?;
        Ok(update)
    }

    pub async fn update(&mut self) -> Result<DatabaseUpdate> {
        let body = self
            .exchange(RemoteMessageType::Update, &[], RemoteReplyType::Update)
            .await?;
        DatabaseUpdate::decode(&body)
    }

    /// Reopens the selected database at its newest generation.
    pub async fn reopen(&mut self) -> Result<DatabaseUpdate> {
        let body = self
            .exchange(RemoteMessageType::Reopen, &[], RemoteReplyType::Update)
            .await?;
        DatabaseUpdate::decode(&body)
    }

    pub async fn keep_alive(&mut self) -> Result<()> {
        self.exchange(RemoteMessageType::KeepAlive, &[], RemoteReplyType::Done)
            .await?;
        Ok(())
    }

    pub async fn term_exists(&mut self, term: &[u8]) -> Result<bool> {
        let mut payload = Vec::new();
        put_string(&mut payload, term);
        self.send(RemoteMessageType::TermExists, &payload).await?;
        match self.recv().await? {
            (RemoteReplyType::TermExists, _) => Ok(true),
            (RemoteReplyType::TermDoesntExist, _) => Ok(false),
            (found, _) => Err(Error::UnexpectedReply {
                request: "TERMEXISTS",
                found,
            }),
        }
    }

    pub async fn term_freq(&mut self, term: &[u8]) -> Result<u64> {
        let mut payload = Vec::new();
        put_string(&mut payload, term);
        let body = self
            .exchange(
                RemoteMessageType::TermFreq,
                &payload,
                RemoteReplyType::TermFreq,
            )
            .await?;
        Reader::new(&body).length()
    }

    pub async fn coll_freq(&mut self, term: &[u8]) -> Result<u64> {
        let mut payload = Vec::new();
        put_string(&mut payload, term);
        let body = self
            .exchange(
                RemoteMessageType::CollFreq,
                &payload,
                RemoteReplyType::CollFreq,
            )
            .await?;
        Reader::new(&body).length()
    }

    pub async fn freqs(&mut self, term: &[u8]) -> Result<FreqsReply> {
        let mut payload = Vec::new();
        put_string(&mut payload, term);
        let body = self
            .exchange(RemoteMessageType::Freqs, &payload, RemoteReplyType::Freqs)
            .await?;
        FreqsReply::decode(&body)
    }

    pub async fn doc_length(&mut self, docid: u64) -> Result<u64> {
        let mut payload = Vec::new();
        put_length(&mut payload, docid);
        let body = self
            .exchange(
                RemoteMessageType::DocLength,
                &payload,
                RemoteReplyType::DocLength,
            )
            .await?;
        Reader::new(&body).length()
    }

    pub async fn unique_terms(&mut self, docid: u64) -> Result<u64> {
        let mut payload = Vec::new();
        put_length(&mut payload, docid);
        let body = self
            .exchange(
                RemoteMessageType::UniqueTerms,
                &payload,
                RemoteReplyType::UniqueTerms,
            )
            .await?;
        Reader::new(&body).length()
    }

    pub async fn value_stats(&mut self, slot: u64) -> Result<ValueStatsReply> {
        let mut payload = Vec::new();
        put_length(&mut payload, slot);
        let body = self
            .exchange(
                RemoteMessageType::ValueStats,
                &payload,
                RemoteReplyType::ValueStats,
            )
            .await?;
        ValueStatsReply::decode(&body)
    }

    pub async fn document(&mut self, docid: u64) -> Result<Bytes> {
        let mut payload = Vec::new();
        put_length(&mut payload, docid);
        self.exchange(
            RemoteMessageType::Document,
            &payload,
            RemoteReplyType::DocData,
        )
        .await
    }

    pub async fn get_metadata(&mut self, key: &[u8]) -> Result<Bytes> {
        let mut payload = Vec::new();
        put_string(&mut payload, key);
        self.exchange(
            RemoteMessageType::GetMetadata,
            &payload,
            RemoteReplyType::Metadata,
        )
        .await
    }

    pub async fn set_metadata(&mut self, key: &[u8], value: &[u8]) -> Result<MutationOutcome> {
        let mut payload = Vec::new();
        put_string(&mut payload, key);
        put_string(&mut payload, value);
        let body = self
            .exchange(
                RemoteMessageType::SetMetadata,
                &payload,
                RemoteReplyType::Done,
            )
            .await?;
        MutationOutcome::decode(&body)
    }

    pub async fn add_document(&mut self, document: &[u8]) -> Result<AddDocumentReply> {
        let body = self
            .exchange(
                RemoteMessageType::AddDocument,
                document,
                RemoteReplyType::AddDocument,
            )
            .await?;
        AddDocumentReply::decode(&body)
    }

    pub async fn replace_document(
        &mut self,
        docid: u64,
        document: &[u8],
    ) -> Result<MutationOutcome> {
        let mut payload = Vec::new();
        put_length(&mut payload, docid);
        payload.extend_from_slice(document);
        let body = self
            .exchange(
                RemoteMessageType::ReplaceDocument,
                &payload,
                RemoteReplyType::Done,
            )
            .await?;
        MutationOutcome::decode(&body)
    }

    pub async fn replace_document_term(
        &mut self,
        term: &[u8],
        document: &[u8],
    ) -> Result<AddDocumentReply> {
        let mut payload = Vec::new();
        put_string(&mut payload, term);
        payload.extend_from_slice(document);
        let body = self
            .exchange(
                RemoteMessageType::ReplaceDocumentTerm,
                &payload,
                RemoteReplyType::AddDocument,
            )
            .await?;
        AddDocumentReply::decode(&body)
    }

    pub async fn delete_document(&mut self, docid: u64) -> Result<MutationOutcome> {
        let mut payload = Vec::new();
        put_length(&mut payload, docid);
        let body = self
            .exchange(
                RemoteMessageType::DeleteDocument,
                &payload,
                RemoteReplyType::Done,
            )
            .await?;
        MutationOutcome::decode(&body)
    }

    pub async fn delete_document_term(&mut self, term: &[u8]) -> Result<MutationOutcome> {
        let mut payload = Vec::new();
        put_string(&mut payload, term);
        let body = self
            .exchange(
                RemoteMessageType::DeleteDocumentTerm,
                &payload,
                RemoteReplyType::Done,
            )
            .await?;
        MutationOutcome::decode(&body)
    }

    pub async fn add_spelling(&mut self, word: &[u8], freq_inc: u64) -> Result<MutationOutcome> {
        let mut payload = Vec::new();
        put_length(&mut payload, freq_inc);
        put_string(&mut payload, word);
        let body = self
            .exchange(
                RemoteMessageType::AddSpelling,
                &payload,
                RemoteReplyType::Done,
            )
            .await?;
        MutationOutcome::decode(&body)
    }

    pub async fn remove_spelling(&mut self, word: &[u8], freq_dec: u64) -> Result<MutationOutcome> {
        let mut payload = Vec::new();
        put_length(&mut payload, freq_dec);
        put_string(&mut payload, word);
        let body = self
            .exchange(
                RemoteMessageType::RemoveSpelling,
                &payload,
                RemoteReplyType::Done,
            )
            .await?;
        MutationOutcome::decode(&body)
    }

    pub async fn commit(&mut self) -> Result<MutationOutcome> {
        let body = self
            .exchange(RemoteMessageType::Commit, &[], RemoteReplyType::Done)
            .await?;
        MutationOutcome::decode(&body)
    }

    pub async fn cancel(&mut self) -> Result<()> {
        self.exchange(RemoteMessageType::Cancel, &[], RemoteReplyType::Done)
            .await?;
        Ok(())
    }

    /// Prepares a query on the selected database; replies with the
    /// serialized enquire stats.
    pub async fn query(&mut self, query: Bytes, params: EnquireParams) -> Result<Bytes> {
        let request = QueryRequest { query, params };
        self.exchange(
            RemoteMessageType::Query,
            &request.encode(),
            RemoteReplyType::Stats,
        )
        .await
    }

    /// Completes the prepared query.
    pub async fn get_mset(
        &mut self,
        first: u64,
        maxitems: u64,
        check_at_least: u64,
    ) -> Result<ResultsReply> {
        let request = GetMSet {
            first,
            maxitems,
            check_at_least,
        };
        let body = self
            .exchange(
                RemoteMessageType::GetMSet,
                &request.encode(),
                RemoteReplyType::Results,
            )
            .await?;
        ResultsReply::decode(&body)
    }

    pub async fn all_terms(&mut self, prefix: &[u8]) -> Result<Vec<Bytes>> {
        let mut payload = Vec::new();
        put_string(&mut payload, prefix);
        self.send(RemoteMessageType::AllTerms, &payload).await?;
        self.read_string_list(RemoteReplyType::AllTerms).await
    }

    pub async fn term_list(&mut self, docid: u64) -> Result<Vec<Bytes>> {
        let mut payload = Vec::new();
        put_length(&mut payload, docid);
        self.send(RemoteMessageType::TermList, &payload).await?;
        self.read_string_list(RemoteReplyType::TermList).await
    }

    pub async fn metadata_keys(&mut self, prefix: &[u8]) -> Result<Vec<Bytes>> {
        let mut payload = Vec::new();
        put_string(&mut payload, prefix);
        self.send(RemoteMessageType::MetadataKeyList, &payload)
            .await?;
        self.read_string_list(RemoteReplyType::MetadataKeyList)
            .await
    }

    /// Positions stream as big-endian u64 byte strings so the shared
    /// prefix compression applies.
    pub async fn position_list(&mut self, docid: u64, term: &[u8]) -> Result<Vec<u64>> {
        let mut payload = Vec::new();
        put_length(&mut payload, docid);
        put_string(&mut payload, term);
        self.send(RemoteMessageType::PositionList, &payload).await?;
        let raw = self.read_string_list(RemoteReplyType::PositionList).await?;
        raw.into_iter()
            .map(|item| {
                let bytes: [u8; 8] = item[..]
                    .try_into()
                    .map_err(|_| Error::BadMessage("position is not 8 bytes"))?;
                Ok(u64::from_be_bytes(bytes))
            })
            .collect()
    }

    pub async fn post_list(&mut self, term: &[u8]) -> Result<Vec<PostingEntry>> {
        let mut payload = Vec::new();
        put_string(&mut payload, term);
        self.send(RemoteMessageType::PostList, &payload).await?;

        let start = self.recv().await?;
        let count = match start {
            (RemoteReplyType::PostListStart, body) => Reader::new(&body).length()?,
            (found, _) => {
                return Err(Error::UnexpectedReply {
                    request: "POSTLIST",
                    found,
                })
            }
        };
        let mut postings = Vec::with_capacity(count as usize);
        loop {
            match self.recv().await? {
                (RemoteReplyType::PostListItem, body) => {
                    postings.push(PostingEntry::decode(&body)?);
                }
                (RemoteReplyType::Done, _) => break,
                (found, _) => {
                    return Err(Error::UnexpectedReply {
                        request: "POSTLIST",
                        found,
                    })
                }
            }
        }
        Ok(postings)
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.send(RemoteMessageType::Shutdown, &[]).await
    }

    /// Drains `{reuse, suffix}` frames of `item_type` until `Done`,
    /// reconstructing the original list.
    async fn read_string_list(&mut self, item_type: RemoteReplyType) -> Result<Vec<Bytes>> {
        let mut decoder = PrefixDecoder::new();
        let mut items = Vec::new();
        loop {
            match self.recv().await? {
                (ty, body) if ty == item_type => {
                    let mut reader = Reader::new(&body);
                    let reuse = reader.u8()?;
                    let suffix = reader.remaining();
                    items.push(Bytes::from(decoder.decode(reuse, suffix)));
                }
                (RemoteReplyType::Done, _) => return Ok(items),
                (found, _) => {
                    return Err(Error::UnexpectedReply {
                        request: "list stream",
                        found,
                    })
                }
            }
        }
    }
}
