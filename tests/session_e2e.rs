use anyhow::Result;
use fileshare::codec::{self, reply};
use fileshare::config::ServerConfig;
use fileshare::logger::{Logger, MemoryLogger, NoopLogger};
use fileshare::{Client, Server, TransferError};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

fn write_file(path: &Path, size: usize) -> Result<Vec<u8>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut data = Vec::with_capacity(size);
    let mut val: u8 = 0;
    for _ in 0..size {
        data.push(val);
        val = val.wrapping_add(7);
    }
    let mut f = std::fs::File::create(path)?;
    f.write_all(&data)?;
    Ok(data)
}

struct TestServer {
    port: u16,
    task: JoinHandle<Result<()>>,
    logger: Arc<MemoryLogger>,
}

async fn start_server(storage: &Path) -> Result<TestServer> {
    start_server_with_registry(storage, None).await
}

async fn start_server_with_registry(storage: &Path, registry_path: Option<PathBuf>) -> Result<TestServer> {
    let cfg = ServerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        storage_dir: storage.to_path_buf(),
        registry_path,
        log_file: None,
    };
    let logger = Arc::new(MemoryLogger::new());
    let server = Server::bind(&cfg, logger.clone()).await?;
    let port = server.local_addr()?.port();
    let task = tokio::spawn(server.run());
    Ok(TestServer { port, task, logger })
}

async fn connect(port: u16, name: &str) -> Result<Client> {
    let logger: Arc<dyn Logger> = Arc::new(NoopLogger);
    Ok(Client::connect("127.0.0.1", port, name, logger).await?)
}

async fn wait_for_log(logger: &MemoryLogger, needle: &str) {
    for _ in 0..100u32 {
        if logger.contains(needle) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("log line {needle:?} never appeared: {:?}", logger.lines());
}

fn registry_on_disk(storage: &Path) -> Result<HashMap<String, String>> {
    let data = std::fs::read_to_string(storage.join("files.json"))?;
    Ok(serde_json::from_str(&data)?)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn upload_then_download_is_identical_and_notifies_owner() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    let source = local.path().join("report.pdf");
    let original = write_file(&source, 1000)?;

    let mut alice = connect(srv.port, "alice").await?;
    alice.upload(&source).await?;
    assert_eq!(std::fs::read(storage.path().join("alice_report.pdf"))?, original);

    let mut bob = connect(srv.port, "bob").await?;
    let written = bob.download("alice", "report.pdf", dest.path()).await?;
    assert_eq!(written, dest.path().join("report.pdf"));
    assert_eq!(std::fs::read(&written)?, original);

    let note = tokio::time::timeout(Duration::from_secs(5), alice.next_notification()).await??;
    assert_eq!(note.as_deref(), Some("bob downloaded your file report.pdf."));
    assert!(srv.logger.contains("bob downloaded report.pdf from alice."));

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn multi_chunk_and_empty_files_round_trip() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    let big = write_file(&local.path().join("big.bin"), 300_001)?;
    write_file(&local.path().join("empty.txt"), 0)?;

    let mut carol = connect(srv.port, "carol").await?;
    carol.upload(&local.path().join("big.bin")).await?;
    carol.upload(&local.path().join("empty.txt")).await?;

    let got = carol.download("carol", "big.bin", dest.path()).await?;
    assert_eq!(std::fs::read(got)?, big);
    let got = carol.download("carol", "empty.txt", dest.path()).await?;
    assert!(std::fs::read(got)?.is_empty());

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn delete_removes_file_listing_and_download() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    write_file(&local.path().join("old.log"), 64)?;
    let mut alice = connect(srv.port, "alice").await?;
    alice.upload(&local.path().join("old.log")).await?;
    alice.delete("old.log").await?;

    assert!(!storage.path().join("alice_old.log").exists());
    assert!(registry_on_disk(storage.path())?.is_empty());

    let mut bob = connect(srv.port, "bob").await?;
    let err = bob.download("alice", "old.log", dest.path()).await.unwrap_err();
    assert!(matches!(err, TransferError::NotFound));
    assert!(!dest.path().join("old.log").exists());
    assert!(bob
        .list()
        .await?
        .iter()
        .all(|e| !(e.owner == "alice" && e.filename == "old.log")));

    // deleting twice, or someone else's file, is not found
    assert!(matches!(alice.delete("old.log").await, Err(TransferError::NotFound)));
    alice.upload(&local.path().join("old.log")).await?;
    assert!(matches!(bob.delete("old.log").await, Err(TransferError::NotFound)));
    assert!(storage.path().join("alice_old.log").exists());

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn same_filename_from_two_owners() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let a_dir = tempfile::tempdir()?;
    let b_dir = tempfile::tempdir()?;
    let dest = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    std::fs::write(a_dir.path().join("notes.txt"), b"from alice")?;
    std::fs::write(b_dir.path().join("notes.txt"), b"from bob, longer")?;

    let mut alice = connect(srv.port, "alice").await?;
    let mut bob = connect(srv.port, "bob").await?;
    alice.upload(&a_dir.path().join("notes.txt")).await?;
    bob.upload(&b_dir.path().join("notes.txt")).await?;

    let listing: Vec<String> = alice.list().await?.iter().map(|e| e.to_string()).collect();
    assert!(listing.contains(&"notes.txt (Owner: alice)".to_string()));
    assert!(listing.contains(&"notes.txt (Owner: bob)".to_string()));
    assert_eq!(listing.len(), 2);

    let got = alice.download("bob", "notes.txt", dest.path()).await?;
    assert_eq!(std::fs::read(got)?, b"from bob, longer");

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_uploads_are_all_persisted() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    const N: usize = 8;
    let mut tasks = Vec::new();
    for i in 0..N {
        let path = local.path().join(format!("user{i}")).join("data.bin");
        write_file(&path, 20_000 + i)?;
        let port = srv.port;
        tasks.push(tokio::spawn(async move {
            let mut c = connect(port, &format!("user{i}")).await?;
            c.upload(&path).await?;
            c.close().await?;
            Ok::<(), anyhow::Error>(())
        }));
    }
    for t in tasks {
        t.await??;
    }

    let disk = registry_on_disk(storage.path())?;
    assert_eq!(disk.len(), N);
    for i in 0..N {
        let key = format!("user{i}_data.bin");
        assert_eq!(disk.get(&key).map(String::as_str), Some(format!("user{i}").as_str()));
        assert_eq!(std::fs::metadata(storage.path().join(&key))?.len(), (20_000 + i) as u64);
    }

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_name_is_rejected_until_released() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    let alice = connect(srv.port, "alice").await?;
    let err = connect(srv.port, "alice").await.unwrap_err();
    let err = err.downcast::<TransferError>()?;
    assert!(matches!(err, TransferError::NameCollision));

    alice.close().await?;
    wait_for_log(&srv.logger, "alice disconnected.").await;
    let again = connect(srv.port, "alice").await?;
    assert_eq!(again.name(), "alice");

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn restart_prunes_entries_without_files() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    write_file(&local.path().join("a.txt"), 10)?;
    write_file(&local.path().join("b.txt"), 10)?;

    let first = start_server(storage.path()).await?;
    let mut alice = connect(first.port, "alice").await?;
    alice.upload(&local.path().join("a.txt")).await?;
    alice.upload(&local.path().join("b.txt")).await?;
    alice.close().await?;
    first.task.abort();

    std::fs::remove_file(storage.path().join("alice_b.txt"))?;

    let second = start_server(storage.path()).await?;
    assert!(second
        .logger
        .contains("File alice_b.txt not found in directory. Removing from records."));
    let mut bob = connect(second.port, "bob").await?;
    let listing = bob.list().await?;
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].to_string(), "a.txt (Owner: alice)");
    assert_eq!(registry_on_disk(storage.path())?.len(), 1);

    second.task.abort();
    Ok(())
}

async fn raw_session(port: u16, name: &str) -> Result<TcpStream> {
    let mut s = TcpStream::connect(("127.0.0.1", port)).await?;
    codec::write_frame(&mut s, name).await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some(reply::CONNECTED));
    Ok(s)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn bad_commands_keep_the_session_alive() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;
    let mut s = raw_session(srv.port, "dave").await?;

    codec::write_frame(&mut s, "RENAME|a|b").await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some(reply::UNKNOWN_COMMAND));

    codec::write_frame(&mut s, "DELETE").await?;
    let resp = codec::read_frame(&mut s).await?.unwrap_or_default();
    assert!(resp.starts_with("Error: "), "{resp}");

    codec::write_frame(&mut s, "DOWNLOAD|nobody|x.txt").await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some(reply::NOT_FOUND));

    // a name that can never be stored is malformed, not missing
    for cmd in ["DOWNLOAD|nobody|../x.txt", "DELETE|a/b"] {
        codec::write_frame(&mut s, cmd).await?;
        let resp = codec::read_frame(&mut s).await?.unwrap_or_default();
        assert!(resp.starts_with("Error: ") && resp.contains("invalid filename"), "{resp}");
    }

    // path traversal in an upload: payload is drained, session continues
    codec::write_frame(&mut s, "UPLOAD|../escape.txt|4").await?;
    s.write_all(b"evil").await?;
    let resp = codec::read_frame(&mut s).await?.unwrap_or_default();
    assert!(resp.starts_with("Error: "), "{resp}");
    assert!(!storage.path().join("dave_../escape.txt").exists());

    // a newline in a filename would forge a LIST line under someone else's name
    codec::write_frame(&mut s, "UPLOAD|salary.xls (Owner: alice)\nx|1").await?;
    s.write_all(b"z").await?;
    let resp = codec::read_frame(&mut s).await?.unwrap_or_default();
    assert!(resp.starts_with("Error: "), "{resp}");

    codec::write_frame(&mut s, "LIST").await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some("LIST|0"));
    codec::write_frame(&mut s, reply::READY).await?;

    codec::write_frame(&mut s, "UPLOAD|ok.txt|2").await?;
    s.write_all(b"ok").await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some(reply::UPLOAD_OK));

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_announce_then_payload() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;
    let mut s = raw_session(srv.port, "erin").await?;

    codec::write_frame(&mut s, "UPLOAD|x.txt|3").await?;
    s.write_all(b"xyz").await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some(reply::UPLOAD_OK));

    let expected = "x.txt (Owner: erin)";
    codec::write_frame(&mut s, "LIST").await?;
    let announce = codec::read_frame(&mut s).await?.unwrap_or_default();
    assert_eq!(announce, format!("LIST|{}", expected.len()));
    codec::write_frame(&mut s, reply::READY).await?;
    let mut body = Vec::new();
    codec::receive_payload(&mut s, &mut body, expected.len() as u64, |_| {}).await?;
    assert_eq!(body, expected.as_bytes());

    // declining the payload leaves the session usable
    codec::write_frame(&mut s, "DOWNLOAD|erin|x.txt").await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some("DOWNLOAD|3"));
    codec::write_frame(&mut s, reply::CANCEL).await?;
    codec::write_frame(&mut s, "DELETE|x.txt").await?;
    assert_eq!(codec::read_frame(&mut s).await?.as_deref(), Some(reply::DELETE_OK));

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_upload_is_not_registered() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    let mut s = raw_session(srv.port, "frank").await?;
    codec::write_frame(&mut s, "UPLOAD|big.bin|10000").await?;
    s.write_all(&[1u8; 100]).await?;
    drop(s);
    wait_for_log(&srv.logger, "frank disconnected.").await;

    assert!(!storage.path().join("frank_big.bin").exists());
    let mut gina = connect(srv.port, "gina").await?;
    assert!(gina.list().await?.is_empty());
    // the name is free again
    connect(srv.port, "frank").await?;

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn notifications_never_corrupt_the_owners_transfers() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let alice_dest = tempfile::tempdir()?;
    let bob_dest = tempfile::tempdir()?;
    let srv = start_server(storage.path()).await?;

    let original = write_file(&local.path().join("big.bin"), 256 * 1024)?;
    let mut alice = connect(srv.port, "alice").await?;
    alice.upload(&local.path().join("big.bin")).await?;

    const ROUNDS: usize = 5;
    let port = srv.port;
    let bob_dir = bob_dest.path().to_path_buf();
    let bob_task = tokio::spawn(async move {
        let mut bob = connect(port, "bob").await?;
        for _ in 0..ROUNDS {
            bob.download("alice", "big.bin", &bob_dir).await?;
        }
        Ok::<(), anyhow::Error>(())
    });

    for _ in 0..ROUNDS {
        let got = alice.download("alice", "big.bin", alice_dest.path()).await?;
        assert_eq!(std::fs::read(got)?, original);
    }
    bob_task.await??;
    assert_eq!(std::fs::read(bob_dest.path().join("big.bin"))?, original);

    let mut seen = alice.take_notifications().len();
    while seen < ROUNDS {
        let note = tokio::time::timeout(Duration::from_secs(5), alice.next_notification()).await??;
        assert_eq!(note.as_deref(), Some("bob downloaded your file big.bin."));
        seen += 1;
    }
    assert_eq!(seen, ROUNDS);

    srv.task.abort();
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_delete_keeps_file_and_record_together() -> Result<()> {
    let storage = tempfile::tempdir()?;
    let state = tempfile::tempdir()?;
    let local = tempfile::tempdir()?;
    let reg_dir = state.path().join("registry");
    let srv = start_server_with_registry(storage.path(), Some(reg_dir.join("files.json"))).await?;

    write_file(&local.path().join("a.txt"), 32)?;
    let mut alice = connect(srv.port, "alice").await?;
    alice.upload(&local.path().join("a.txt")).await?;

    // the registry snapshot can no longer be rewritten
    std::fs::remove_dir_all(&reg_dir)?;
    std::fs::write(&reg_dir, b"not a directory")?;

    let err = alice.delete("a.txt").await.unwrap_err();
    assert!(matches!(err, TransferError::Server(_)), "{err:?}");
    assert!(storage.path().join("alice_a.txt").exists());

    let listing = alice.list().await?;
    assert_eq!(listing.len(), 1);
    assert_eq!((listing[0].owner.as_str(), listing[0].filename.as_str()), ("alice", "a.txt"));

    let dest = tempfile::tempdir()?;
    let mut bob = connect(srv.port, "bob").await?;
    let got = bob.download("alice", "a.txt", dest.path()).await?;
    assert_eq!(std::fs::read(got)?.len(), 32);

    srv.task.abort();
    Ok(())
}
