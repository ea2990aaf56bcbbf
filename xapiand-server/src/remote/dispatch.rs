use std::sync::Arc;

use bytes::Bytes;

use xapiand_replication::message::{RemoteMessageType, RemoteReplyType};
use xapiand_replication::payload::{
    AddDocumentReply, DatabaseUpdate, FreqsReply, GetMSet, QueryRequest, ResultsReply,
    SelectDatabase, ValueStatsReply,
};
use xapiand_replication::prefix::PrefixEncoder;
use xapiand_replication::serial::{put_length, Reader};
use xapiand_wal::WalOp;

use crate::context::ServerContext;
use crate::database::Database;
use crate::endpoint::{Endpoint, Endpoints};
use crate::error::{Error, Result};
use crate::pool::CheckedOut;

/// Connection lifecycle: a database must be selected before anything
/// else, a query must be prepared before its MSet is fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    DatabaseSelected,
    QueryPrepared,
}

#[derive(Debug)]
pub struct ReplyFrame {
    pub ty: RemoteReplyType,
    pub payload: Vec<u8>,
}

impl ReplyFrame {
    fn new(ty: RemoteReplyType, payload: Vec<u8>) -> Self {
        Self { ty, payload }
    }

    fn done() -> Self {
        Self::new(RemoteReplyType::Done, Vec::new())
    }
}

/// One remote-role connection: strictly serial, one request dispatched
/// at a time, each returning the frames to write back.
pub struct RemoteSession {
    ctx: Arc<ServerContext>,
    state: SessionState,
    handle: Option<CheckedOut>,
    selected_path: Option<String>,
    prepared: Option<QueryRequest>,
    shutdown_requested: bool,
}

impl RemoteSession {
    pub fn new(ctx: Arc<ServerContext>) -> Self {
        Self {
            ctx,
            state: SessionState::Open,
            handle: None,
            selected_path: None,
            prepared: None,
            shutdown_requested: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn shutdown_requested(&self) -> bool {
        self.shutdown_requested
    }

    /// The dispatcher: one match, tagged results out, a single
    /// destroy-connection arm at the caller for unrecoverable errors.
    pub fn handle_message(
        &mut self,
        ty: RemoteMessageType,
        payload: &[u8],
    ) -> Result<Vec<ReplyFrame>> {
        tracing::debug!(msg = ty.name(), state = ?self.state, len = payload.len(), ">> remote");
        match ty {
            RemoteMessageType::ReadAccess => self.select_database(payload, false),
            RemoteMessageType::WriteAccess => self.select_database(payload, true),
            RemoteMessageType::Update => self.update(),
            RemoteMessageType::Reopen => self.reopen(),
            RemoteMessageType::KeepAlive => Ok(vec![ReplyFrame::done()]),
            RemoteMessageType::Shutdown => {
                self.shutdown_requested = true;
                self.ctx.request_shutdown();
                Ok(Vec::new())
            }

            RemoteMessageType::AllTerms => self.all_terms(payload),
            RemoteMessageType::TermList => self.term_list(payload),
            RemoteMessageType::MetadataKeyList => self.metadata_keys(payload),
            RemoteMessageType::PositionList => self.position_list(payload),
            RemoteMessageType::PostList => self.post_list(payload),
            RemoteMessageType::TermExists => self.term_exists(payload),
            RemoteMessageType::TermFreq => self.term_freq(payload),
            RemoteMessageType::CollFreq => self.coll_freq(payload),
            RemoteMessageType::Freqs => self.freqs(payload),
            RemoteMessageType::DocLength => self.doc_length(payload),
            RemoteMessageType::UniqueTerms => self.unique_terms(payload),
            RemoteMessageType::ValueStats => self.value_stats(payload),
            RemoteMessageType::Document => self.document(payload),
            RemoteMessageType::GetMetadata => self.get_metadata(payload),

            RemoteMessageType::Query => self.query(payload),
            RemoteMessageType::GetMSet => self.get_mset(payload),

            RemoteMessageType::AddDocument => {
                self.mutate(WalOp::AddDoc, payload, true)
            }
            RemoteMessageType::ReplaceDocument => {
                self.mutate(WalOp::ReplaceDoc, payload, false)
            }
            RemoteMessageType::ReplaceDocumentTerm => {
                self.mutate(WalOp::ReplaceTerm, payload, true)
            }
            RemoteMessageType::DeleteDocument => {
                self.mutate(WalOp::DeleteDoc, payload, false)
            }
            RemoteMessageType::DeleteDocumentTerm => {
                self.mutate(WalOp::DeleteTerm, payload, false)
            }
            RemoteMessageType::SetMetadata => self.mutate(WalOp::SetMeta, payload, false),
            RemoteMessageType::AddSpelling => self.mutate(WalOp::AddSpelling, payload, false),
            RemoteMessageType::RemoveSpelling => {
                self.mutate(WalOp::RemoveSpelling, payload, false)
            }
            RemoteMessageType::Commit => self.commit(),
            RemoteMessageType::Cancel => self.cancel(),
        }
    }

    fn select_database(&mut self, payload: &[u8], writable: bool) -> Result<Vec<ReplyFrame>> {
        let select = SelectDatabase::decode(payload)?;
        if select.paths.is_empty() {
            return Err(Error::InvalidArgument("select names no shard".into()));
        }
        if writable && select.paths.len() != 1 {
            return Err(Error::InvalidArgument(
                "a writable select names exactly one shard".into(),
            ));
        }

        // Next select checks the previous handle in.
        self.release_handle();

        let endpoints: Endpoints = select
            .paths
            .iter()
            .map(|path| Endpoint::local(path.clone()))
            .collect();
        let handle = self.ctx.pool.checkout(&endpoints, writable, select.flags)?;
        let update = make_update(&handle);
        self.selected_path = Some(select.paths[0].clone());
        self.handle = Some(handle);
        self.state = SessionState::DatabaseSelected;
        Ok(vec![ReplyFrame::new(RemoteReplyType::Update, update.encode())])
    }

    fn release_handle(&mut self) {
        self.prepared = None;
        self.selected_path = None;
        if let Some(handle) = self.handle.take() {
            self.ctx.pool.checkin(handle);
        }
        self.state = SessionState::Open;
    }

    fn database(&self) -> Result<&CheckedOut> {
        self.handle
            .as_ref()
            .ok_or_else(|| Error::InvalidArgument("no database selected".into()))
    }

    fn writable_database(&self) -> Result<&CheckedOut> {
        let handle = self.database()?;
        if !handle.is_writable() {
            return Err(Error::InvalidArgument("database is read-only".into()));
        }
        Ok(handle)
    }

    fn update(&self) -> Result<Vec<ReplyFrame>> {
        let db = self.database()?;
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::Update,
            make_update(db).encode(),
        )])
    }

    fn reopen(&self) -> Result<Vec<ReplyFrame>> {
        let db = self.database()?;
        db.index().reopen()?;
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::Update,
            make_update(db).encode(),
        )])
    }

    fn all_terms(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let prefix = reader.string().map_err(wire)?.to_vec();
        let terms = self.database()?.index().all_terms(&prefix);
        Ok(stream_list(terms, RemoteReplyType::AllTerms))
    }

    fn term_list(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let docid = reader.length().map_err(wire)?;
        let terms = self.database()?.index().term_list(docid)?;
        Ok(stream_list(terms, RemoteReplyType::TermList))
    }

    fn metadata_keys(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let prefix = reader.string().map_err(wire)?.to_vec();
        let keys = self.database()?.index().metadata_keys(&prefix);
        Ok(stream_list(keys, RemoteReplyType::MetadataKeyList))
    }

    /// Positions stream as big-endian u64 byte strings so the shared
    /// prefix compression applies.
    fn position_list(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let docid = reader.length().map_err(wire)?;
        let term = reader.string().map_err(wire)?.to_vec();
        let positions = self.database()?.index().position_list(docid, &term)?;
        let items: Vec<Bytes> = positions
            .into_iter()
            .map(|position| Bytes::copy_from_slice(&position.to_be_bytes()))
            .collect();
        Ok(stream_list(items, RemoteReplyType::PositionList))
    }

    fn post_list(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let term = reader.string().map_err(wire)?.to_vec();
        let postings = self.database()?.index().post_list(&term);

        let mut frames = Vec::with_capacity(postings.len() + 2);
        let mut start = Vec::new();
        put_length(&mut start, postings.len() as u64);
        frames.push(ReplyFrame::new(RemoteReplyType::PostListStart, start));
        for (docid, wdf) in postings {
            let item = xapiand_replication::payload::PostingEntry { docid, wdf };
            frames.push(ReplyFrame::new(
                RemoteReplyType::PostListItem,
                item.encode(),
            ));
        }
        frames.push(ReplyFrame::done());
        Ok(frames)
    }

    fn term_exists(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let term = reader.string().map_err(wire)?;
        let ty = if self.database()?.index().term_exists(term) {
            RemoteReplyType::TermExists
        } else {
            RemoteReplyType::TermDoesntExist
        };
        Ok(vec![ReplyFrame::new(ty, Vec::new())])
    }

    fn term_freq(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let term = reader.string().map_err(wire)?;
        let freq = self.database()?.index().term_freq(term);
        let mut body = Vec::new();
        put_length(&mut body, freq);
        Ok(vec![ReplyFrame::new(RemoteReplyType::TermFreq, body)])
    }

    fn coll_freq(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let term = reader.string().map_err(wire)?;
        let freq = self.database()?.index().coll_freq(term);
        let mut body = Vec::new();
        put_length(&mut body, freq);
        Ok(vec![ReplyFrame::new(RemoteReplyType::CollFreq, body)])
    }

    fn freqs(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let term = reader.string().map_err(wire)?;
        let index = self.database()?.index();
        let reply = FreqsReply {
            term_freq: index.term_freq(term),
            coll_freq: index.coll_freq(term),
        };
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::Freqs,
            reply.encode(),
        )])
    }

    fn doc_length(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let docid = reader.length().map_err(wire)?;
        let length = self.database()?.index().doc_length(docid)?;
        let mut body = Vec::new();
        put_length(&mut body, length);
        Ok(vec![ReplyFrame::new(RemoteReplyType::DocLength, body)])
    }

    fn unique_terms(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let docid = reader.length().map_err(wire)?;
        let count = self.database()?.index().unique_terms(docid)?;
        let mut body = Vec::new();
        put_length(&mut body, count);
        Ok(vec![ReplyFrame::new(RemoteReplyType::UniqueTerms, body)])
    }

    fn value_stats(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let slot = reader.length().map_err(wire)?;
        let (freq, lower_bound, upper_bound) = self.database()?.index().value_stats(slot);
        let reply = ValueStatsReply {
            freq,
            lower_bound,
            upper_bound,
        };
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::ValueStats,
            reply.encode(),
        )])
    }

    fn document(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let docid = reader.length().map_err(wire)?;
        let data = self.database()?.index().get_document(docid)?;
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::DocData,
            data.to_vec(),
        )])
    }

    fn get_metadata(&self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let mut reader = Reader::new(payload);
        let key = reader.string().map_err(wire)?;
        let value = self
            .database()?
            .index()
            .get_metadata(key)
            .unwrap_or_default();
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::Metadata,
            value.to_vec(),
        )])
    }

    fn query(&mut self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        let request = QueryRequest::decode(payload)?;
        let stats = self
            .database()?
            .index()
            .enquire(&request.query, &request.params)?;
        self.prepared = Some(request);
        self.state = SessionState::QueryPrepared;
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::Stats,
            stats.to_vec(),
        )])
    }

    fn get_mset(&mut self, payload: &[u8]) -> Result<Vec<ReplyFrame>> {
        if self.state != SessionState::QueryPrepared {
            return Err(Error::InvalidArgument("no query prepared".into()));
        }
        let request = GetMSet::decode(payload)?;
        let prepared = self
            .prepared
            .as_ref()
            .ok_or_else(|| Error::InternalError("prepared state without query".into()))?;
        let (spies, mset) = self.database()?.index().get_mset(
            &prepared.query,
            &prepared.params,
            request.first,
            request.maxitems,
            request.check_at_least,
        )?;
        let reply = ResultsReply { spies, mset };
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::Results,
            reply.encode(),
        )])
    }

    /// Runs a WAL-touching job on the committers pool and waits for
    /// it. Serialization per shard comes from handle exclusivity;
    /// different shards commit in parallel.
    fn on_committer<R: Send + 'static>(
        &self,
        job: impl FnOnce() -> R + Send + 'static,
    ) -> Result<R> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.ctx.workers.committers.spawn(move || {
            let _ = tx.send(job());
        })?;
        rx.recv()
            .map_err(|_| Error::InternalError("committer dropped the job".into()))
    }

    fn mutate(
        &mut self,
        op: WalOp,
        payload: &[u8],
        replies_docid: bool,
    ) -> Result<Vec<ReplyFrame>> {
        let handle = self.writable_database()?;
        let database = handle.share();
        let payload = payload.to_vec();
        let applied = match self.on_committer(move || database.apply(op, &payload))? {
            Ok(applied) => applied,
            Err(err) => {
                poison_if_fatal(handle, &err);
                return Err(err);
            }
        };
        if replies_docid {
            let reply = AddDocumentReply {
                docid: applied.docid.unwrap_or(0),
                outcome: applied.outcome,
            };
            Ok(vec![ReplyFrame::new(
                RemoteReplyType::AddDocument,
                reply.encode(),
            )])
        } else {
            Ok(vec![ReplyFrame::new(
                RemoteReplyType::Done,
                applied.outcome.encode(),
            )])
        }
    }

    fn commit(&mut self) -> Result<Vec<ReplyFrame>> {
        let handle = self.writable_database()?;
        let database = handle.share();
        let outcome = match self.on_committer(move || database.commit())? {
            Ok(outcome) => outcome,
            Err(err) => {
                poison_if_fatal(handle, &err);
                return Err(err);
            }
        };
        if let Some(path) = &self.selected_path {
            self.ctx.announce_db_updated(path, handle.mastery_level());
        }
        Ok(vec![ReplyFrame::new(
            RemoteReplyType::Done,
            outcome.encode(),
        )])
    }

    fn cancel(&mut self) -> Result<Vec<ReplyFrame>> {
        let handle = self.database()?;
        if handle.is_writable() {
            let database = handle.share();
            self.on_committer(move || database.cancel())??;
        }
        self.prepared = None;
        if self.state == SessionState::QueryPrepared {
            self.state = SessionState::DatabaseSelected;
        }
        Ok(vec![ReplyFrame::done()])
    }
}

impl Drop for RemoteSession {
    fn drop(&mut self) {
        self.release_handle();
    }
}

fn make_update(db: &Database) -> DatabaseUpdate {
    let index = db.index();
    let lower = index.doclen_lower_bound();
    let upper = index.doclen_upper_bound();
    DatabaseUpdate {
        doc_count: index.doc_count(),
        last_docid: index.last_docid(),
        doclen_lower: lower,
        doclen_upper_delta: upper.saturating_sub(lower),
        has_positions: index.has_positions(),
        total_length: index.total_length(),
        ..DatabaseUpdate::new(db.uuid())
    }
}

fn stream_list(items: Vec<Bytes>, ty: RemoteReplyType) -> Vec<ReplyFrame> {
    let mut encoder = PrefixEncoder::new();
    let mut frames = Vec::with_capacity(items.len() + 1);
    for item in items {
        let (reuse, suffix) = encoder.encode(&item);
        let mut payload = Vec::with_capacity(1 + suffix.len());
        payload.push(reuse);
        payload.extend_from_slice(&suffix);
        frames.push(ReplyFrame::new(ty, payload));
    }
    frames.push(ReplyFrame::done());
    frames
}

fn poison_if_fatal(handle: &CheckedOut, err: &Error) {
    if matches!(
        err,
        Error::StorageFull | Error::DatabaseWalError(_) | Error::DatabaseCorrupt(_)
    ) {
        handle.poison();
    }
}

fn wire(err: xapiand_replication::Error) -> Error {
    Error::BadMessage(err.to_string())
}
