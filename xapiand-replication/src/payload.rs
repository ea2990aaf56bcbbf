//! Typed payload bodies shared by the client and the server dispatcher.

use bytes::Bytes;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::serial::{put_bool, put_length, put_string, Reader};
use crate::{REMOTE_PROTOCOL_MAJOR_VERSION, REMOTE_PROTOCOL_MINOR_VERSION};

/// Body of `ReadAccess`/`WriteAccess`: open flags plus the shard paths
/// on the serving node (a writable select names exactly one).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelectDatabase {
    pub flags: u64,
    pub paths: Vec<String>,
}

impl SelectDatabase {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length(&mut buf, self.flags);
        put_length(&mut buf, self.paths.len() as u64);
        for path in &self.paths {
            put_string(&mut buf, path.as_bytes());
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let flags = reader.length()?;
        let count = reader.length()?;
        let mut paths = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let raw = reader.string()?;
            let path = std::str::from_utf8(raw)
                .map_err(|_| Error::BadMessage("path is not utf-8"))?;
            paths.push(path.to_owned());
        }
        Ok(Self { flags, paths })
    }
}

/// Body of the `Update` reply: a snapshot of the selected database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseUpdate {
    pub protocol_major: u8,
    pub protocol_minor: u8,
    pub doc_count: u64,
    pub last_docid: u64,
    pub doclen_lower: u64,
    pub doclen_upper_delta: u64,
    pub has_positions: bool,
    pub total_length: u64,
    pub uuid: Uuid,
}

impl DatabaseUpdate {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            protocol_major: REMOTE_PROTOCOL_MAJOR_VERSION,
            protocol_minor: REMOTE_PROTOCOL_MINOR_VERSION,
            doc_count: 0,
            last_docid: 0,
            doclen_lower: 0,
            doclen_upper_delta: 0,
            has_positions: false,
            total_length: 0,
            uuid,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.protocol_major);
        buf.push(self.protocol_minor);
        put_length(&mut buf, self.doc_count);
        put_length(&mut buf, self.last_docid);
        put_length(&mut buf, self.doclen_lower);
        put_length(&mut buf, self.doclen_upper_delta);
        put_bool(&mut buf, self.has_positions);
        put_length(&mut buf, self.total_length);
        buf.extend_from_slice(self.uuid.as_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let protocol_major = reader.u8()?;
        let protocol_minor = reader.u8()?;
        let doc_count = reader.length()?;
        let last_docid = reader.length()?;
        let doclen_lower = reader.length()?;
        let doclen_upper_delta = reader.length()?;
        let has_positions = reader.bool()?;
        let total_length = reader.length()?;
        let raw = reader.remaining();
        if raw.len() != 16 {
            return Err(Error::BadMessage("update reply missing uuid"));
        }
        let uuid = Uuid::from_slice(raw).map_err(|_| Error::BadMessage("bad uuid"))?;
        Ok(Self {
            protocol_major,
            protocol_minor,
            doc_count,
            last_docid,
            doclen_lower,
            doclen_upper_delta,
            has_positions,
            total_length,
            uuid,
        })
    }
}

/// Enquire parameters carried by `Query` next to the opaque query blob.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EnquireParams {
    pub collapse_slot: Option<u64>,
    pub collapse_max: u64,
    pub sort_slot: Option<u64>,
    pub sort_descending: bool,
    pub percent_cutoff: u8,
    /// Bit pattern of the f64 weight cutoff.
    pub weight_cutoff_bits: u64,
    pub weighting_scheme: String,
    pub rset: Vec<u64>,
    pub match_spies: Vec<String>,
}

impl EnquireParams {
    fn encode_into(&self, buf: &mut Vec<u8>) {
        put_option(buf, self.collapse_slot);
        put_length(buf, self.collapse_max);
        put_option(buf, self.sort_slot);
        put_bool(buf, self.sort_descending);
        buf.push(self.percent_cutoff);
        put_length(buf, self.weight_cutoff_bits);
        put_string(buf, self.weighting_scheme.as_bytes());
        put_length(buf, self.rset.len() as u64);
        for docid in &self.rset {
            put_length(buf, *docid);
        }
        put_length(buf, self.match_spies.len() as u64);
        for spy in &self.match_spies {
            put_string(buf, spy.as_bytes());
        }
    }

    fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let collapse_slot = get_option(reader)?;
        let collapse_max = reader.length()?;
        let sort_slot = get_option(reader)?;
        let sort_descending = reader.bool()?;
        let percent_cutoff = reader.u8()?;
        let weight_cutoff_bits = reader.length()?;
        let weighting_scheme = utf8(reader.string()?)?;
        let rset_len = reader.length()?;
        let mut rset = Vec::with_capacity(rset_len as usize);
        for _ in 0..rset_len {
            rset.push(reader.length()?);
        }
        let spies_len = reader.length()?;
        let mut match_spies = Vec::with_capacity(spies_len as usize);
        for _ in 0..spies_len {
            match_spies.push(utf8(reader.string()?)?);
        }
        Ok(Self {
            collapse_slot,
            collapse_max,
            sort_slot,
            sort_descending,
            percent_cutoff,
            weight_cutoff_bits,
            weighting_scheme,
            rset,
            match_spies,
        })
    }
}

/// Body of `Query`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    pub query: Bytes,
    pub params: EnquireParams,
}

impl QueryRequest {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, &self.query);
        self.params.encode_into(&mut buf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let query = reader.bytes()?;
        let params = EnquireParams::decode_from(&mut reader)?;
        Ok(Self { query, params })
    }
}

/// Body of `GetMSet`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GetMSet {
    pub first: u64,
    pub maxitems: u64,
    pub check_at_least: u64,
}

impl GetMSet {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length(&mut buf, self.first);
        put_length(&mut buf, self.maxitems);
        put_length(&mut buf, self.check_at_least);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            first: reader.length()?,
            maxitems: reader.length()?,
            check_at_least: reader.length()?,
        })
    }
}

/// Body of the `Results` reply: serialized match-spy results then the
/// serialized MSet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultsReply {
    pub spies: Bytes,
    pub mset: Bytes,
}

impl ResultsReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, &self.spies);
        buf.extend_from_slice(&self.mset);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let spies = reader.bytes()?;
        let mset = Bytes::copy_from_slice(reader.remaining());
        Ok(Self { spies, mset })
    }
}

/// Body of the `Exception` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionBody {
    pub type_code: u8,
    pub context: String,
    pub message: String,
    pub error_string: String,
}

impl ExceptionBody {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.push(self.type_code);
        put_string(&mut buf, self.context.as_bytes());
        put_string(&mut buf, self.message.as_bytes());
        buf.extend_from_slice(self.error_string.as_bytes());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let type_code = reader.u8()?;
        let context = utf8(reader.string()?)?;
        let message = utf8(reader.string()?)?;
        let error_string = utf8(reader.remaining())?;
        Ok(Self {
            type_code,
            context,
            message,
            error_string,
        })
    }
}

/// Outcome of a mutation: the WAL tx it landed at and whether it has
/// been committed to the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutationOutcome {
    pub tx_id: u64,
    pub committed: bool,
}

impl MutationOutcome {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length(&mut buf, self.tx_id);
        put_bool(&mut buf, self.committed);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            tx_id: reader.length()?,
            committed: reader.bool()?,
        })
    }
}

/// Body of the `AddDocument` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddDocumentReply {
    pub docid: u64,
    pub outcome: MutationOutcome,
}

impl AddDocumentReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length(&mut buf, self.docid);
        buf.extend_from_slice(&self.outcome.encode());
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let docid = reader.length()?;
        let tx_id = reader.length()?;
        let committed = reader.bool()?;
        Ok(Self {
            docid,
            outcome: MutationOutcome { tx_id, committed },
        })
    }
}

/// Body of the `ValueStats` reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueStatsReply {
    pub freq: u64,
    pub lower_bound: Bytes,
    pub upper_bound: Bytes,
}

impl ValueStatsReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length(&mut buf, self.freq);
        put_string(&mut buf, &self.lower_bound);
        put_string(&mut buf, &self.upper_bound);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            freq: reader.length()?,
            lower_bound: reader.bytes()?,
            upper_bound: reader.bytes()?,
        })
    }
}

/// Body of the `Freqs` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FreqsReply {
    pub term_freq: u64,
    pub coll_freq: u64,
}

impl FreqsReply {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length(&mut buf, self.term_freq);
        put_length(&mut buf, self.coll_freq);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            term_freq: reader.length()?,
            coll_freq: reader.length()?,
        })
    }
}

/// One posting in a `PostListItem` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostingEntry {
    pub docid: u64,
    pub wdf: u64,
}

impl PostingEntry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_length(&mut buf, self.docid);
        put_length(&mut buf, self.wdf);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Ok(Self {
            docid: reader.length()?,
            wdf: reader.length()?,
        })
    }
}

/// Body of the replication `Welcome` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplWelcome {
    pub uuid: Uuid,
    pub last_tx_id: Option<u64>,
}

impl ReplWelcome {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(self.uuid.as_bytes());
        put_option(&mut buf, self.last_tx_id);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < 16 {
            return Err(Error::BadMessage("welcome missing uuid"));
        }
        let uuid = Uuid::from_slice(&data[..16]).map_err(|_| Error::BadMessage("bad uuid"))?;
        let mut reader = Reader::new(&data[16..]);
        let last_tx_id = get_option(&mut reader)?;
        Ok(Self { uuid, last_tx_id })
    }
}

fn put_option(buf: &mut Vec<u8>, value: Option<u64>) {
    match value {
        Some(value) => {
            put_bool(buf, true);
            put_length(buf, value);
        }
        None => put_bool(buf, false),
    }
}

fn get_option(reader: &mut Reader<'_>) -> Result<Option<u64>> {
    if reader.bool()? {
        Ok(Some(reader.length()?))
    } else {
        Ok(None)
    }
}

fn utf8(raw: &[u8]) -> Result<String> {
    std::str::from_utf8(raw)
        .map(str::to_owned)
        .map_err(|_| Error::BadMessage("payload is not utf-8"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn select_round_trip() {
        let select = SelectDatabase {
            flags: 3,
            paths: vec!["/idx/a".into(), "/idx/b".into()],
        };
        assert_eq!(SelectDatabase::decode(&select.encode()).unwrap(), select);
    }

    #[test]
    fn update_round_trip() {
        let update = DatabaseUpdate {
            doc_count: 1020,
            last_docid: 1020,
            doclen_lower: 3,
            doclen_upper_delta: 9,
            has_positions: true,
            total_length: 5 * 1020,
            ..DatabaseUpdate::new(Uuid::new_v4())
        };
        assert_eq!(DatabaseUpdate::decode(&update.encode()).unwrap(), update);
    }

    #[test]
    fn query_round_trip() {
        let request = QueryRequest {
            query: Bytes::from_static(b"Zhello AND Zworld"),
            params: EnquireParams {
                collapse_slot: Some(4),
                collapse_max: 2,
                sort_slot: None,
                sort_descending: true,
                percent_cutoff: 10,
                weight_cutoff_bits: 1.5f64.to_bits(),
                weighting_scheme: "bm25".into(),
                rset: vec![1, 5, 9],
                match_spies: vec!["values".into()],
            },
        };
        assert_eq!(QueryRequest::decode(&request.encode()).unwrap(), request);
    }

    #[test]
    fn exception_round_trip() {
        let body = ExceptionBody {
            type_code: 4,
            context: "msg_query".into(),
            message: "database corrupt".into(),
            error_string: "DatabaseCorruptError: database corrupt".into(),
        };
        assert_eq!(ExceptionBody::decode(&body.encode()).unwrap(), body);
    }

    #[test]
    fn welcome_round_trip() {
        for last in [None, Some(0), Some(1019)] {
            let welcome = ReplWelcome {
                uuid: Uuid::new_v4(),
                last_tx_id: last,
            };
            assert_eq!(ReplWelcome::decode(&welcome.encode()).unwrap(), welcome);
        }
    }
}
