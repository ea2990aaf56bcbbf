//! The embedded index engine seam. The core treats the engine as a
//! black box behind the [`Index`] trait; [`MemoryIndex`] is the
//! deterministic engine the server opens, and [`FederatedIndex`] lets a
//! read-only handle span several shards with interleaved docids.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use uuid::Uuid;

use xapiand_replication::payload::EnquireParams;
use xapiand_replication::serial::{put_length, put_string, Reader};

use crate::error::{Error, Result};

pub type Docid = u64;

/// A document as the core sees it: an opaque stored blob plus the term
/// and value entries the engine indexes. The schema system that
/// produces these lives outside the core.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Document {
    pub data: Bytes,
    pub terms: Vec<TermEntry>,
    pub values: Vec<(u64, Bytes)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermEntry {
    pub term: Bytes,
    pub wdf: u64,
    pub positions: Vec<u64>,
}

impl Document {
    pub fn with_data(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            ..Self::default()
        }
    }

    pub fn add_term(mut self, term: impl Into<Bytes>, wdf: u64) -> Self {
        self.terms.push(TermEntry {
            term: term.into(),
            wdf,
            positions: Vec::new(),
        });
        self
    }

    pub fn add_posting(mut self, term: impl Into<Bytes>, wdf: u64, positions: Vec<u64>) -> Self {
        self.terms.push(TermEntry {
            term: term.into(),
            wdf,
            positions,
        });
        self
    }

    pub fn add_value(mut self, slot: u64, value: impl Into<Bytes>) -> Self {
        self.values.push((slot, value.into()));
        self
    }

    pub fn length(&self) -> u64 {
        self.terms.iter().map(|entry| entry.wdf).sum()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        put_string(&mut buf, &self.data);
        put_length(&mut buf, self.terms.len() as u64);
        for entry in &self.terms {
            put_string(&mut buf, &entry.term);
            put_length(&mut buf, entry.wdf);
            put_length(&mut buf, entry.positions.len() as u64);
            for position in &entry.positions {
                put_length(&mut buf, *position);
            }
        }
        put_length(&mut buf, self.values.len() as u64);
        for (slot, value) in &self.values {
            put_length(&mut buf, *slot);
            put_string(&mut buf, value);
        }
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        Self::decode_from(&mut reader)
    }

    pub fn decode_from(reader: &mut Reader<'_>) -> Result<Self> {
        let data = reader.bytes().map_err(bad)?;
        let term_count = reader.length().map_err(bad)?;
        let mut terms = Vec::with_capacity(term_count as usize);
        for _ in 0..term_count {
            let term = reader.bytes().map_err(bad)?;
            let wdf = reader.length().map_err(bad)?;
            let position_count = reader.length().map_err(bad)?;
            let mut positions = Vec::with_capacity(position_count as usize);
            for _ in 0..position_count {
                positions.push(reader.length().map_err(bad)?);
            }
            terms.push(TermEntry {
                term,
                wdf,
                positions,
            });
        }
        let value_count = reader.length().map_err(bad)?;
        let mut values = Vec::with_capacity(value_count as usize);
        for _ in 0..value_count {
            let slot = reader.length().map_err(bad)?;
            values.push((slot, reader.bytes().map_err(bad)?));
        }
        Ok(Self {
            data,
            terms,
            values,
        })
    }
}

fn bad(err: xapiand_replication::Error) -> Error {
    Error::InvalidArgument(format!("bad document: {err}"))
}

/// A ranked match set, the serialized form ferried by `Results`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MSet {
    pub first: u64,
    pub matches_estimated: u64,
    pub items: Vec<(Docid, f64)>,
}

impl MSet {
    pub fn encode(&self) -> Bytes {
        let mut buf = Vec::new();
        put_length(&mut buf, self.first);
        put_length(&mut buf, self.matches_estimated);
        put_length(&mut buf, self.items.len() as u64);
        for (docid, weight) in &self.items {
            put_length(&mut buf, *docid);
            put_length(&mut buf, weight.to_bits());
        }
        Bytes::from(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader::new(data);
        let first = reader.length().map_err(bad)?;
        let matches_estimated = reader.length().map_err(bad)?;
        let count = reader.length().map_err(bad)?;
        let mut items = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let docid = reader.length().map_err(bad)?;
            let weight = f64::from_bits(reader.length().map_err(bad)?);
            items.push((docid, weight));
        }
        Ok(Self {
            first,
            matches_estimated,
            items,
        })
    }
}

/// Everything the core needs from the index engine. Object safe;
/// handles share implementations through `Arc<dyn Index>`.
pub trait Index: Send + Sync {
    fn uuid(&self) -> Uuid;
    fn doc_count(&self) -> u64;
    fn last_docid(&self) -> Docid;
    fn doclen_lower_bound(&self) -> u64;
    fn doclen_upper_bound(&self) -> u64;
    fn has_positions(&self) -> bool;
    fn total_length(&self) -> u64;
    fn reopen(&self) -> Result<()>;
    fn commit(&self) -> Result<()>;
    fn cancel(&self) -> Result<()>;

    fn add_document(&self, doc: &Document) -> Result<Docid>;
    fn replace_document(&self, docid: Docid, doc: &Document) -> Result<()>;
    fn replace_document_term(&self, term: &[u8], doc: &Document) -> Result<Docid>;
    fn delete_document(&self, docid: Docid) -> Result<()>;
    fn delete_document_term(&self, term: &[u8]) -> Result<()>;
    fn get_document(&self, docid: Docid) -> Result<Bytes>;

    fn term_exists(&self, term: &[u8]) -> bool;
    fn term_freq(&self, term: &[u8]) -> u64;
    fn coll_freq(&self, term: &[u8]) -> u64;
    fn doc_length(&self, docid: Docid) -> Result<u64>;
    fn unique_terms(&self, docid: Docid) -> Result<u64>;
    fn all_terms(&self, prefix: &[u8]) -> Vec<Bytes>;
    fn term_list(&self, docid: Docid) -> Result<Vec<Bytes>>;
    fn position_list(&self, docid: Docid, term: &[u8]) -> Result<Vec<u64>>;
    fn post_list(&self, term: &[u8]) -> Vec<(Docid, u64)>;
    fn value_stats(&self, slot: u64) -> (u64, Bytes, Bytes);

    fn get_metadata(&self, key: &[u8]) -> Option<Bytes>;
    fn set_metadata(&self, key: &[u8], value: &[u8]) -> Result<()>;
    fn metadata_keys(&self, prefix: &[u8]) -> Vec<Bytes>;
    fn add_spelling(&self, word: &[u8], freq_inc: u64) -> Result<()>;
    fn remove_spelling(&self, word: &[u8], freq_dec: u64) -> Result<()>;

    /// Prepares a query, returning serialized enquire stats.
    fn enquire(&self, query: &[u8], params: &EnquireParams) -> Result<Bytes>;
    /// Completes a prepared query: serialized match-spy results and the
    /// serialized MSet.
    fn get_mset(
        &self,
        query: &[u8],
        params: &EnquireParams,
        first: u64,
        maxitems: u64,
        check_at_least: u64,
    ) -> Result<(Bytes, Bytes)>;
}

#[derive(Debug, Clone, Default)]
struct StoredDoc {
    doc: Document,
    length: u64,
}

#[derive(Debug, Clone, Default)]
struct State {
    docs: BTreeMap<Docid, StoredDoc>,
    postings: BTreeMap<Vec<u8>, BTreeMap<Docid, u64>>,
    metadata: BTreeMap<Vec<u8>, Bytes>,
    spellings: BTreeMap<Vec<u8>, u64>,
    next_docid: Docid,
    total_length: u64,
}

impl State {
    fn insert(&mut self, docid: Docid, doc: &Document) {
        self.remove(docid);
        let length = doc.length();
        for entry in &doc.terms {
            self.postings
                .entry(entry.term.to_vec())
                .or_default()
                .insert(docid, entry.wdf);
        }
        self.total_length += length;
        self.docs.insert(
            docid,
            StoredDoc {
                doc: doc.clone(),
                length,
            },
        );
        if docid >= self.next_docid {
            self.next_docid = docid + 1;
        }
    }

    fn remove(&mut self, docid: Docid) -> bool {
        let Some(stored) = self.docs.remove(&docid) else {
            return false;
        };
        self.total_length -= stored.length;
        for entry in &stored.doc.terms {
            if let Some(postings) = self.postings.get_mut(&entry.term[..]) {
                postings.remove(&docid);
                if postings.is_empty() {
                    self.postings.remove(&entry.term[..]);
                }
            }
        }
        true
    }
}

/// BTree-backed engine: deterministic iteration order, no durability of
/// its own. Durability comes from WAL replay at open.
pub struct MemoryIndex {
    uuid: Uuid,
    state: RwLock<State>,
    /// State at the last commit; `cancel` rolls back to it.
    committed: RwLock<State>,
}

impl MemoryIndex {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            uuid,
            state: RwLock::new(State::default()),
            committed: RwLock::new(State::default()),
        }
    }

    /// Drops every document, metadata entry and spelling. Used when a
    /// replication pull replaces the whole shard.
    pub fn clear(&self) {
        *self.state.write() = State::default();
        *self.committed.write() = State::default();
    }

    fn rank(&self, query: &[u8], params: &EnquireParams) -> Result<Vec<(Docid, f64)>> {
        let query = std::str::from_utf8(query)
            .map_err(|_| Error::InvalidArgument("query blob is not utf-8".into()))?;
        let state = self.state.read();
        let mut weights: BTreeMap<Docid, f64> = BTreeMap::new();
        for term in query.split_whitespace() {
            if let Some(postings) = state.postings.get(term.as_bytes()) {
                for (docid, wdf) in postings {
                    *weights.entry(*docid).or_default() += *wdf as f64;
                }
            }
        }
        let mut ranked: Vec<(Docid, f64)> = weights.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        if params.percent_cutoff > 0 {
            if let Some(top) = ranked.first().map(|(_, weight)| *weight) {
                let floor = top * params.percent_cutoff as f64 / 100.0;
                ranked.retain(|(_, weight)| *weight >= floor);
            }
        }
        Ok(ranked)
    }
}

impl Index for MemoryIndex {
    fn uuid(&self) -> Uuid {
        self.uuid
    }

    fn doc_count(&self) -> u64 {
        self.state.read().docs.len() as u64
    }

    fn last_docid(&self) -> Docid {
        self.state.read().next_docid.saturating_sub(1)
    }

    fn doclen_lower_bound(&self) -> u64 {
        let state = self.state.read();
        state
            .docs
            .values()
            .map(|stored| stored.length)
            .min()
            .unwrap_or(0)
    }

    fn doclen_upper_bound(&self) -> u64 {
        let state = self.state.read();
        state
            .docs
            .values()
            .map(|stored| stored.length)
            .max()
            .unwrap_or(0)
    }

    fn has_positions(&self) -> bool {
        let state = self.state.read();
        state
            .docs
            .values()
            .any(|stored| stored.doc.terms.iter().any(|entry| !entry.positions.is_empty()))
    }

    fn total_length(&self) -> u64 {
        self.state.read().total_length
    }

    fn reopen(&self) -> Result<()> {
        // A fresh memory state is always at its newest generation.
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        *self.committed.write() = self.state.read().clone();
        Ok(())
    }

    fn cancel(&self) -> Result<()> {
        *self.state.write() = self.committed.read().clone();
        Ok(())
    }

    fn add_document(&self, doc: &Document) -> Result<Docid> {
        let mut state = self.state.write();
        let docid = state.next_docid.max(1);
        state.insert(docid, doc);
        Ok(docid)
    }

    fn replace_document(&self, docid: Docid, doc: &Document) -> Result<()> {
        if docid == 0 {
            return Err(Error::InvalidArgument("docid 0 is reserved".into()));
        }
        self.state.write().insert(docid, doc);
        Ok(())
    }

    fn replace_document_term(&self, term: &[u8], doc: &Document) -> Result<Docid> {
        let mut state = self.state.write();
        let existing: Vec<Docid> = state
            .postings
            .get(term)
            .map(|postings| postings.keys().copied().collect())
            .unwrap_or_default();
        match existing.first() {
            Some(docid) => {
                let docid = *docid;
                for other in existing.iter().skip(1) {
                    state.remove(*other);
                }
                state.insert(docid, doc);
                Ok(docid)
            }
            None => {
                let docid = state.next_docid.max(1);
                state.insert(docid, doc);
                Ok(docid)
            }
        }
    }

    fn delete_document(&self, docid: Docid) -> Result<()> {
        if self.state.write().remove(docid) {
            Ok(())
        } else {
            Err(Error::DocNotFound(docid))
        }
    }

    fn delete_document_term(&self, term: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let docids: Vec<Docid> = state
            .postings
            .get(term)
            .map(|postings| postings.keys().copied().collect())
            .unwrap_or_default();
        for docid in docids {
            state.remove(docid);
        }
        Ok(())
    }

    fn get_document(&self, docid: Docid) -> Result<Bytes> {
        self.state
            .read()
            .docs
            .get(&docid)
            .map(|stored| stored.doc.data.clone())
            .ok_or(Error::DocNotFound(docid))
    }

    fn term_exists(&self, term: &[u8]) -> bool {
        self.state.read().postings.contains_key(term)
    }

    fn term_freq(&self, term: &[u8]) -> u64 {
        self.state
            .read()
            .postings
            .get(term)
            .map(|postings| postings.len() as u64)
            .unwrap_or(0)
    }

    fn coll_freq(&self, term: &[u8]) -> u64 {
        self.state
            .read()
            .postings
            .get(term)
            .map(|postings| postings.values().sum())
            .unwrap_or(0)
    }

    fn doc_length(&self, docid: Docid) -> Result<u64> {
        self.state
            .read()
            .docs
            .get(&docid)
            .map(|stored| stored.length)
            .ok_or(Error::DocNotFound(docid))
    }

    fn unique_terms(&self, docid: Docid) -> Result<u64> {
        self.state
            .read()
            .docs
            .get(&docid)
            .map(|stored| stored.doc.terms.len() as u64)
            .ok_or(Error::DocNotFound(docid))
    }

    fn all_terms(&self, prefix: &[u8]) -> Vec<Bytes> {
        self.state
            .read()
            .postings
            .range(prefix.to_vec()..)
            .take_while(|(term, _)| term.starts_with(prefix))
            .map(|(term, _)| Bytes::copy_from_slice(term))
            .collect()
    }

    fn term_list(&self, docid: Docid) -> Result<Vec<Bytes>> {
        let state = self.state.read();
        let stored = state.docs.get(&docid).ok_or(Error::DocNotFound(docid))?;
        let mut terms: Vec<Bytes> = stored
            .doc
            .terms
            .iter()
            .map(|entry| entry.term.clone())
            .collect();
        terms.sort();
        terms.dedup();
        Ok(terms)
    }

    fn position_list(&self, docid: Docid, term: &[u8]) -> Result<Vec<u64>> {
        let state = self.state.read();
        let stored = state.docs.get(&docid).ok_or(Error::DocNotFound(docid))?;
        Ok(stored
            .doc
            .terms
            .iter()
            .find(|entry| entry.term == term)
            .map(|entry| entry.positions.clone())
            .unwrap_or_default())
    }

    fn post_list(&self, term: &[u8]) -> Vec<(Docid, u64)> {
        self.state
            .read()
            .postings
            .get(term)
            .map(|postings| postings.iter().map(|(docid, wdf)| (*docid, *wdf)).collect())
            .unwrap_or_default()
    }

    fn value_stats(&self, slot: u64) -> (u64, Bytes, Bytes) {
        let state = self.state.read();
        let mut freq = 0;
        let mut lower: Option<Bytes> = None;
        let mut upper: Option<Bytes> = None;
        for stored in state.docs.values() {
            for (value_slot, value) in &stored.doc.values {
                if *value_slot != slot {
                    continue;
                }
                freq += 1;
                if lower.as_ref().map_or(true, |low| value < low) {
                    lower = Some(value.clone());
                }
                if upper.as_ref().map_or(true, |high| value > high) {
                    upper = Some(value.clone());
                }
            }
        }
        (
            freq,
            lower.unwrap_or_default(),
            upper.unwrap_or_default(),
        )
    }

    fn get_metadata(&self, key: &[u8]) -> Option<Bytes> {
        self.state.read().metadata.get(key).cloned()
    }

    fn set_metadata(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        if value.is_empty() {
            state.metadata.remove(key);
        } else {
            state
                .metadata
                .insert(key.to_vec(), Bytes::copy_from_slice(value));
        }
        Ok(())
    }

    fn metadata_keys(&self, prefix: &[u8]) -> Vec<Bytes> {
        self.state
            .read()
            .metadata
            .range(prefix.to_vec()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| Bytes::copy_from_slice(key))
            .collect()
    }

    fn add_spelling(&self, word: &[u8], freq_inc: u64) -> Result<()> {
        *self
            .state
            .write()
            .spellings
            .entry(word.to_vec())
            .or_default() += freq_inc;
        Ok(())
    }

    fn remove_spelling(&self, word: &[u8], freq_dec: u64) -> Result<()> {
        let mut state = self.state.write();
        if let Some(freq) = state.spellings.get_mut(word) {
            *freq = freq.saturating_sub(freq_dec);
            if *freq == 0 {
                state.spellings.remove(word);
            }
        }
        Ok(())
    }

    fn enquire(&self, query: &[u8], params: &EnquireParams) -> Result<Bytes> {
        let ranked = self.rank(query, params)?;
        let mut buf = Vec::new();
        put_length(&mut buf, ranked.len() as u64);
        put_length(&mut buf, self.doc_count());
        Ok(Bytes::from(buf))
    }

    fn get_mset(
        &self,
        query: &[u8],
        params: &EnquireParams,
        first: u64,
        maxitems: u64,
        check_at_least: u64,
    ) -> Result<(Bytes, Bytes)> {
        // Every candidate is weighed, so the estimate is exact no
        // matter what check_at_least asked for.
        let _ = check_at_least;
        let ranked = self.rank(query, params)?;
        let matches_estimated = ranked.len() as u64;
        let items: Vec<(Docid, f64)> = ranked
            .into_iter()
            .skip(first as usize)
            .take(maxitems as usize)
            .collect();
        let mset = MSet {
            first,
            matches_estimated,
            items,
        };
        let mut spies = Vec::new();
        put_length(&mut spies, params.match_spies.len() as u64);
        for spy in &params.match_spies {
            put_string(&mut spies, spy.as_bytes());
        }
        Ok((Bytes::from(spies), mset.encode()))
    }
}

/// Read-only federation over several shards. Docids interleave the way
/// a multi-database does: global `(child_docid - 1) * n + child + 1`.
pub struct FederatedIndex {
    children: Vec<Arc<dyn Index>>,
}

impl FederatedIndex {
    pub fn new(children: Vec<Arc<dyn Index>>) -> Self {
        assert!(!children.is_empty());
        Self { children }
    }

    fn shards(&self) -> u64 {
        self.children.len() as u64
    }

    fn split(&self, docid: Docid) -> Result<(usize, Docid)> {
        if docid == 0 {
            return Err(Error::DocNotFound(docid));
        }
        let child = ((docid - 1) % self.shards()) as usize;
        let child_docid = (docid - 1) / self.shards() + 1;
        Ok((child, child_docid))
    }

    fn join(&self, child: usize, child_docid: Docid) -> Docid {
        (child_docid - 1) * self.shards() + child as u64 + 1
    }

    fn read_only() -> Error {
        Error::InvalidArgument("database is read-only".into())
    }
}

impl Index for FederatedIndex {
    fn uuid(&self) -> Uuid {
        self.children[0].uuid()
    }

    fn doc_count(&self) -> u64 {
        self.children.iter().map(|child| child.doc_count()).sum()
    }

    fn last_docid(&self) -> Docid {
        self.children
            .iter()
            .enumerate()
            .map(|(index, child)| match child.last_docid() {
                0 => 0,
                last => self.join(index, last),
            })
            .max()
            .unwrap_or(0)
    }

    fn doclen_lower_bound(&self) -> u64 {
        self.children
            .iter()
            .map(|child| child.doclen_lower_bound())
            .min()
            .unwrap_or(0)
    }

    fn doclen_upper_bound(&self) -> u64 {
        self.children
            .iter()
            .map(|child| child.doclen_upper_bound())
            .max()
            .unwrap_or(0)
    }

    fn has_positions(&self) -> bool {
        self.children.iter().any(|child| child.has_positions())
    }

    fn total_length(&self) -> u64 {
        self.children.iter().map(|child| child.total_length()).sum()
    }

    fn reopen(&self) -> Result<()> {
        for child in &self.children {
            child.reopen()?;
        }
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Err(Self::read_only())
    }

    fn cancel(&self) -> Result<()> {
        Ok(())
    }

    fn add_document(&self, _doc: &Document) -> Result<Docid> {
        Err(Self::read_only())
    }

    fn replace_document(&self, _docid: Docid, _doc: &Document) -> Result<()> {
        Err(Self::read_only())
    }

    fn replace_document_term(&self, _term: &[u8], _doc: &Document) -> Result<Docid> {
        Err(Self::read_only())
    }

    fn delete_document(&self, _docid: Docid) -> Result<()> {
        Err(Self::read_only())
    }

    fn delete_document_term(&self, _term: &[u8]) -> Result<()> {
        Err(Self::read_only())
    }

    fn get_document(&self, docid: Docid) -> Result<Bytes> {
        let (child, child_docid) = self.split(docid)?;
        self.children[child].get_document(child_docid)
    }

    fn term_exists(&self, term: &[u8]) -> bool {
        self.children.iter().any(|child| child.term_exists(term))
    }

    fn term_freq(&self, term: &[u8]) -> u64 {
        self.children.iter().map(|child| child.term_freq(term)).sum()
    }

    fn coll_freq(&self, term: &[u8]) -> u64 {
        self.children.iter().map(|child| child.coll_freq(term)).sum()
    }

    fn doc_length(&self, docid: Docid) -> Result<u64> {
        let (child, child_docid) = self.split(docid)?;
        self.children[child].doc_length(child_docid)
    }

    fn unique_terms(&self, docid: Docid) -> Result<u64> {
        let (child, child_docid) = self.split(docid)?;
        self.children[child].unique_terms(child_docid)
    }

    fn all_terms(&self, prefix: &[u8]) -> Vec<Bytes> {
        let mut terms: Vec<Bytes> = self
            .children
            .iter()
            .flat_map(|child| child.all_terms(prefix))
            .collect();
        terms.sort();
        terms.dedup();
        terms
    }

    fn term_list(&self, docid: Docid) -> Result<Vec<Bytes>> {
        let (child, child_docid) = self.split(docid)?;
        self.children[child].term_list(child_docid)
    }

    fn position_list(&self, docid: Docid, term: &[u8]) -> Result<Vec<u64>> {
        let (child, child_docid) = self.split(docid)?;
        self.children[child].position_list(child_docid, term)
    }

    fn post_list(&self, term: &[u8]) -> Vec<(Docid, u64)> {
        let mut postings: Vec<(Docid, u64)> = self
            .children
            .iter()
            .enumerate()
            .flat_map(|(index, child)| {
                child
                    .post_list(term)
                    .into_iter()
                    .map(move |(docid, wdf)| (self.join(index, docid), wdf))
                    .collect::<Vec<_>>()
            })
            .collect();
        postings.sort_unstable_by_key(|(docid, _)| *docid);
        postings
    }

    fn value_stats(&self, slot: u64) -> (u64, Bytes, Bytes) {
        let mut freq = 0;
        let mut lower: Option<Bytes> = None;
        let mut upper: Option<Bytes> = None;
        for child in &self.children {
            let (child_freq, child_lower, child_upper) = child.value_stats(slot);
            if child_freq == 0 {
                continue;
            }
            freq += child_freq;
            if lower.as_ref().map_or(true, |low| &child_lower < low) {
                lower = Some(child_lower);
            }
            if upper.as_ref().map_or(true, |high| &child_upper > high) {
                upper = Some(child_upper);
            }
        }
        (freq, lower.unwrap_or_default(), upper.unwrap_or_default())
    }

    fn get_metadata(&self, key: &[u8]) -> Option<Bytes> {
        // First shard wins, matching "first path opened, rest added".
        self.children.iter().find_map(|child| child.get_metadata(key))
    }

    fn set_metadata(&self, _key: &[u8], _value: &[u8]) -> Result<()> {
        Err(Self::read_only())
    }

    fn metadata_keys(&self, prefix: &[u8]) -> Vec<Bytes> {
        let mut keys: Vec<Bytes> = self
            .children
            .iter()
            .flat_map(|child| child.metadata_keys(prefix))
            .collect();
        keys.sort();
        keys.dedup();
        keys
    }

    fn add_spelling(&self, _word: &[u8], _freq_inc: u64) -> Result<()> {
        Err(Self::read_only())
    }

    fn remove_spelling(&self, _word: &[u8], _freq_dec: u64) -> Result<()> {
        Err(Self::read_only())
    }

    fn enquire(&self, query: &[u8], params: &EnquireParams) -> Result<Bytes> {
        let mut buf = Vec::new();
        let (_, mset) = self.get_mset(query, params, 0, u64::MAX, 0)?;
        let decoded = MSet::decode(&mset)?;
        put_length(&mut buf, decoded.items.len() as u64);
        put_length(&mut buf, self.doc_count());
        Ok(Bytes::from(buf))
    }

    fn get_mset(
        &self,
        query: &[u8],
        params: &EnquireParams,
        first: u64,
        maxitems: u64,
        check_at_least: u64,
    ) -> Result<(Bytes, Bytes)> {
        let mut merged: Vec<(Docid, f64)> = Vec::new();
        let mut estimated = 0;
        for (index, child) in self.children.iter().enumerate() {
            let (_, mset) = child.get_mset(query, params, 0, u64::MAX, check_at_least)?;
            let decoded = MSet::decode(&mset)?;
            estimated += decoded.matches_estimated;
            merged.extend(
                decoded
                    .items
                    .into_iter()
                    .map(|(docid, weight)| (self.join(index, docid), weight)),
            );
        }
        merged.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });
        let items = merged
            .into_iter()
            .skip(first as usize)
            .take(maxitems as usize)
            .collect();
        let mset = MSet {
            first,
            matches_estimated: estimated,
            items,
        };
        let mut spies = Vec::new();
        put_length(&mut spies, 0);
        Ok((Bytes::from(spies), mset.encode()))
    }
}
