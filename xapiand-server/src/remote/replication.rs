//! Replication role: serving a shard's log to a puller, and the
//! updater-side pull triggered by `DbUpdated` announcements.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use xapiand_replication::frame::{read_frame, write_frame};
use xapiand_replication::message::ReplicationMessageType;
use xapiand_replication::payload::ReplWelcome;
use xapiand_replication::replicator::{ReplEvent, ReplicationClient};
use xapiand_replication::serial::{put_length, Reader};
use xapiand_wal::{segment, Wal, WalOptions};

use crate::context::ServerContext;
use crate::discovery::ReplicationRequest;
use crate::endpoint::{Endpoint, Endpoints};
use crate::error::{Error, Result};

/// Serves the replication role on an accepted connection whose first
/// frame was `Hello`. Streams the shard's WAL and finishes with the
/// local mastery.
pub async fn serve<S>(
    stream: &mut S,
    hello_payload: &[u8],
    ctx: &Arc<ServerContext>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut reader = Reader::new(hello_payload);
    let path = std::str::from_utf8(
        reader
            .string()
            .map_err(|err| Error::BadMessage(err.to_string()))?,
    )
    .map_err(|_| Error::BadMessage("shard path is not utf-8".into()))?
    .to_owned();

    let dir = ctx.pool.shard_dir(&path);
    let Some(uuid) = segment::stored_uuid(&dir)? else {
        return Err(Error::EndpointUnresolved(path));
    };
    let wal = Wal::open(&dir, uuid, false, WalOptions::default())?;

    // The scan for the last durable tx reads the whole log once; the
    // same files are re-read for the stream below on independent
    // descriptors.
    let last_tx_id = tokio::task::block_in_place(|| -> Result<Option<u64>> {
        let mut last = None;
        for entry in wal.replay(None)? {
            last = Some(entry?.tx_id);
        }
        Ok(last)
    })?;

    let welcome = ReplWelcome { uuid, last_tx_id };
    write_frame(
        stream,
        ReplicationMessageType::Welcome.as_u8(),
        &welcome.encode(),
    )
    .await?;

    let (ty, need) = read_frame(stream).await?;
    if ReplicationMessageType::try_from(ty)? != ReplicationMessageType::Need {
        return Err(Error::BadMessage("expected need frame".into()));
    }
    let mut reader = Reader::new(&need);
    let since = if reader.bool().map_err(|err| Error::BadMessage(err.to_string()))? {
        Some(
            reader
                .length()
                .map_err(|err| Error::BadMessage(err.to_string()))?,
        )
    } else {
        None
    };

    tracing::debug!(%path, ?since, "streaming shard log to replica");
    let entries = tokio::task::block_in_place(|| -> Result<Vec<xapiand_wal::WalEntry>> {
        let mut entries = Vec::new();
        for entry in wal.replay(since)? {
            entries.push(entry?);
        }
        Ok(entries)
    })?;
    for entry in entries {
        write_frame(
            stream,
            ReplicationMessageType::Entry.as_u8(),
            &entry.encode(),
        )
        .await?;
    }

    let mastery = ctx.shard_mastery(&path).unwrap_or(0);
    let mut done = Vec::new();
    put_length(&mut done, mastery as u64);
    write_frame(stream, ReplicationMessageType::Done.as_u8(), &done).await?;
    Ok(())
}

/// Consumes replication requests from discovery and hands each to the
/// updaters pool.
pub fn spawn_updaters(
    ctx: Arc<ServerContext>,
    mut requests: mpsc::UnboundedReceiver<ReplicationRequest>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let handle = tokio::runtime::Handle::current();
        while let Some(request) = requests.recv().await {
            let ctx = ctx.clone();
            let handle = handle.clone();
            let spawned = ctx.workers.updaters.spawn({
                let ctx = ctx.clone();
                move || {
                    if let Err(err) = handle.block_on(pull(ctx, request.clone())) {
                        tracing::warn!(
                            path = %request.path,
                            source = %request.node,
                            %err,
                            "replication pull failed"
                        );
                    }
                }
            });
            if spawned.is_err() {
                return;
            }
        }
    })
}

/// Pulls a shard from the node that announced a higher mastery: hold
/// the shard's writable slot in `Replicating` state, stream the
/// remote log (incrementally when identities match, wholesale
/// otherwise), then adopt the remote mastery and re-announce.
pub async fn pull(ctx: Arc<ServerContext>, request: ReplicationRequest) -> Result<()> {
    let endpoints = Endpoints::single(Endpoint::local(request.path.clone()));
    let guard = ctx.pool.begin_replication(&endpoints, 0)?;

    let mut client = ReplicationClient::connect((
        request.node.host.as_str(),
        request.node.binary_port,
    ))
    .await?;
    let welcome = client.hello(&request.path).await?;

    let db = guard.database();
    let since = if welcome.uuid == db.uuid() {
        db.wal_last_tx_id()
    } else {
        tracing::info!(
            path = %request.path,
            local = %db.uuid(),
            remote = %welcome.uuid,
            "shard identities differ, pulling from scratch"
        );
        db.resync_to(welcome.uuid)?;
        None
    };

    client.need(since).await?;
    let mastery = loop {
        match client.next_event().await? {
            ReplEvent::Entry(entry) => db.apply_replicated(&entry)?,
            ReplEvent::Done { mastery_level } => break mastery_level,
        }
    };
    db.set_mastery_level(mastery)?;
    tracing::info!(
        path = %request.path,
        source = %request.node,
        mastery,
        "replication pull complete"
    );
    drop(guard);

    ctx.announce_db_updated(&request.path, mastery);
    Ok(())
}
