use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use xapiand_replication::frame;
use xapiand_replication::message::{RemoteMessageType, RemoteReplyType};
use xapiand_replication::payload::{EnquireParams, SelectDatabase};
use xapiand_replication::RemoteClient;
use xapiand_server::config::Config;
use xapiand_server::context::ServerContext;
use xapiand_server::index::{Document, MSet};
use xapiand_server::membership::Membership;
use xapiand_server::pool::DatabasePool;
use xapiand_server::remote::RemoteServer;
use xapiand_server::resolver::EndpointResolver;
use xapiand_server::workers::WorkerPools;

fn test_ctx(dir: &std::path::Path) -> Arc<ServerContext> {
    let config = Config {
        data_dir: dir.to_path_buf(),
        binary_port: 0,
        ..Config::default()
    };
    let membership = Arc::new(Membership::new());
    let pool = Arc::new(DatabasePool::new(dir, config.pool_options()));
    let (probe_tx, _probe_rx) = mpsc::unbounded_channel();
    let resolver = Arc::new(EndpointResolver::new(
        membership.clone(),
        probe_tx,
        config.resolver_options(),
    ));
    let (shutdown_tx, _shutdown_rx) = mpsc::unbounded_channel();
    Arc::new(ServerContext::new(
        config,
        membership,
        pool,
        resolver,
        WorkerPools::new(2, 1, 1),
        shutdown_tx,
    ))
}

async fn start_server(dir: &std::path::Path) -> (Arc<ServerContext>, RemoteServer, SocketAddr) {
    let ctx = test_ctx(dir);
    let server = RemoteServer::spawn(ctx.clone()).await.unwrap();
    let addr = server.local_addr();
    (ctx, server, addr)
}

fn doc_with_terms(body: &str, terms: &[&str]) -> Vec<u8> {
    let mut doc = Document::with_data(body.as_bytes().to_vec());
    for term in terms {
        doc = doc.add_term(term.as_bytes().to_vec(), 1);
    }
    doc.encode()
}

#[tokio::test(flavor = "multi_thread")]
async fn write_then_read_over_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, _server, addr) = start_server(dir.path()).await;

    let mut writer = RemoteClient::connect(addr).await.unwrap();
    let update = writer.write_access("/idx/books".into(), 0).await.unwrap();
    assert_eq!(update.doc_count, 0);

    let added = writer
        .add_document(&doc_with_terms("one", &["hello", "world"]))
        .await
        .unwrap();
    assert_eq!(added.docid, 1);
    assert!(!added.outcome.committed);
    writer
        .add_document(&doc_with_terms("two", &["hello"]))
        .await
        .unwrap();
    let committed = writer.commit().await.unwrap();
    assert!(committed.committed);

    // The same connection reads its own writes.
    assert!(writer.term_exists(b"hello").await.unwrap());
    assert_eq!(writer.term_freq(b"hello").await.unwrap(), 2);
    assert_eq!(writer.coll_freq(b"hello").await.unwrap(), 2);
    let freqs = writer.freqs(b"world").await.unwrap();
    assert_eq!((freqs.term_freq, freqs.coll_freq), (1, 1));
    assert_eq!(writer.document(1).await.unwrap(), Bytes::from("one"));
    let update = writer.update().await.unwrap();
    assert_eq!(update.doc_count, 2);
    assert_eq!(update.last_docid, 2);

    // A second connection reads the committed state.
    let mut reader = RemoteClient::connect(addr).await.unwrap();
    let update = reader
        .read_access(vec!["/idx/books".into()], 0)
        .await
        .unwrap();
    assert_eq!(update.doc_count, 2);
    assert_eq!(reader.doc_length(1).await.unwrap(), 2);
    assert_eq!(reader.unique_terms(1).await.unwrap(), 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn all_terms_streams_with_prefix_compression() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, _server, addr) = start_server(dir.path()).await;

    let mut writer = RemoteClient::connect(addr).await.unwrap();
    writer.write_access("/idx/terms".into(), 0).await.unwrap();
    writer
        .add_document(&doc_with_terms("d", &["a", "ab", "abc", "abd", "ac", "b"]))
        .await
        .unwrap();
    writer.commit().await.unwrap();

    let terms = writer.all_terms(b"a").await.unwrap();
    let expected: Vec<&[u8]> = vec![b"a", b"ab", b"abc", b"abd", b"ac"];
    assert_eq!(terms.iter().map(|t| &t[..]).collect::<Vec<_>>(), expected);
    drop(writer);

    // Observe the raw frames: {0,"a"} {1,"b"} {2,"c"} {2,"d"} {1,"c"}
    // terminated by Done.
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    let select = SelectDatabase {
        flags: 0,
        paths: vec!["/idx/terms".into()],
    };
    frame::write_frame(
        &mut stream,
        RemoteMessageType::ReadAccess.as_u8(),
        &select.encode(),
    )
    .await
    .unwrap();
    let (ty, _) = frame::read_frame(&mut stream).await.unwrap();
    assert_eq!(ty, RemoteReplyType::Update.as_u8());

    let mut payload = Vec::new();
    xapiand_replication::serial::put_string(&mut payload, b"a");
    frame::write_frame(&mut stream, RemoteMessageType::AllTerms.as_u8(), &payload)
        .await
        .unwrap();

    let expected_frames: [(u8, &[u8]); 5] =
        [(0, b"a"), (1, b"b"), (2, b"c"), (2, b"d"), (1, b"c")];
    for (reuse, suffix) in expected_frames {
        let (ty, body) = frame::read_frame(&mut stream).await.unwrap();
        assert_eq!(ty, RemoteReplyType::AllTerms.as_u8());
        assert_eq!(body[0], reuse);
        assert_eq!(&body[1..], suffix);
    }
    let (ty, _) = frame::read_frame(&mut stream).await.unwrap();
    assert_eq!(ty, RemoteReplyType::Done.as_u8());
}

#[tokio::test(flavor = "multi_thread")]
async fn query_and_mset_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, _server, addr) = start_server(dir.path()).await;

    let mut client = RemoteClient::connect(addr).await.unwrap();
    client.write_access("/idx/q".into(), 0).await.unwrap();
    client
        .add_document(&doc_with_terms("both", &["hello", "world"]))
        .await
        .unwrap();
    client
        .add_document(&doc_with_terms("one", &["hello"]))
        .await
        .unwrap();
    client
        .add_document(&doc_with_terms("other", &["unrelated"]))
        .await
        .unwrap();
    client.commit().await.unwrap();

    client
        .query(Bytes::from_static(b"hello world"), EnquireParams::default())
        .await
        .unwrap();
    let results = client.get_mset(0, 10, 0).await.unwrap();
    let mset = MSet::decode(&results.mset).unwrap();
    assert_eq!(mset.matches_estimated, 2);
    assert_eq!(mset.items.len(), 2);
    assert_eq!(mset.items[0].0, 1);

    // Paging through the prepared query.
    let page = client.get_mset(1, 10, 0).await.unwrap();
    let page = MSet::decode(&page.mset).unwrap();
    assert_eq!(page.items.len(), 1);
    assert_eq!(page.items[0].0, 2);
}

#[tokio::test(flavor = "multi_thread")]
async fn metadata_spelling_and_lists() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, _server, addr) = start_server(dir.path()).await;

    let mut client = RemoteClient::connect(addr).await.unwrap();
    client.write_access("/idx/meta".into(), 0).await.unwrap();
    client.set_metadata(b"schema", b"{\"v\":1}").await.unwrap();
    client.set_metadata(b"schema.extra", b"x").await.unwrap();
    client.set_metadata(b"other", b"y").await.unwrap();
    client.add_spelling(b"helo", 2).await.unwrap();
    client.commit().await.unwrap();

    assert_eq!(
        client.get_metadata(b"schema").await.unwrap(),
        Bytes::from_static(b"{\"v\":1}")
    );
    // A missing key reads back empty.
    assert!(client.get_metadata(b"missing").await.unwrap().is_empty());

    let keys = client.metadata_keys(b"schema").await.unwrap();
    assert_eq!(keys.len(), 2);

    let doc = Document::with_data(&b"p"[..]).add_posting(&b"pos"[..], 3, vec![1, 9, 40]);
    client.add_document(&doc.encode()).await.unwrap();
    client.commit().await.unwrap();
    let docid = client.update().await.unwrap().last_docid;
    let positions = client.position_list(docid, b"pos").await.unwrap();
    assert_eq!(positions, vec![1, 9, 40]);

    let postings = client.post_list(b"pos").await.unwrap();
    assert_eq!(postings.len(), 1);
    assert_eq!(postings[0].wdf, 3);

    let terms = client.term_list(docid).await.unwrap();
    assert_eq!(terms, vec![Bytes::from_static(b"pos")]);
}

#[tokio::test(flavor = "multi_thread")]
async fn handled_errors_keep_the_connection_alive() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, _server, addr) = start_server(dir.path()).await;

    let mut client = RemoteClient::connect(addr).await.unwrap();
    client.write_access("/idx/err".into(), 0).await.unwrap();

    // No such document: the server answers with an Exception reply...
    let err = client.doc_length(42).await.unwrap_err();
    assert!(matches!(
        err,
        xapiand_replication::Error::Remote { .. }
    ));

    // ...and the connection keeps serving.
    client
        .add_document(&doc_with_terms("d", &["t"]))
        .await
        .unwrap();
    client.commit().await.unwrap();
    assert_eq!(client.term_freq(b"t").await.unwrap(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_discards_uncommitted_batch() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, _server, addr) = start_server(dir.path()).await;

    let mut client = RemoteClient::connect(addr).await.unwrap();
    client.write_access("/idx/cxl".into(), 0).await.unwrap();
    client
        .add_document(&doc_with_terms("keep", &["keep"]))
        .await
        .unwrap();
    client.commit().await.unwrap();
    client
        .add_document(&doc_with_terms("drop", &["drop"]))
        .await
        .unwrap();
    client.cancel().await.unwrap();

    assert!(client.term_exists(b"keep").await.unwrap());
    assert!(!client.term_exists(b"drop").await.unwrap());
    let update = client.update().await.unwrap();
    assert_eq!(update.doc_count, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn keepalive_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let (_ctx, _server, addr) = start_server(dir.path()).await;

    let mut client = RemoteClient::connect(addr).await.unwrap();
    client.write_access("/idx/ka".into(), 0).await.unwrap();
    client.keep_alive().await.unwrap();
    let update = client.reopen().await.unwrap();
    assert_eq!(update.doc_count, 0);
}
