//! Integration tests for a single node: recovery, the wire protocol, and
//! shutdown.

use std::fs;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use hashring_kv::client;
use hashring_kv::command::Mutation;
use hashring_kv::protocol::{MAX_LINE_BYTES, Request, Response};
use hashring_kv::{Node, NodeConfig, NodeError, NodeState, WalError};
use tempfile::TempDir;

const TIMEOUT: Duration = Duration::from_secs(2);

fn config(dir: &TempDir, name: &str) -> NodeConfig {
    NodeConfig::new(name, dir.path().join(format!("{name}.wal")), 0)
}

/// Polls `check` until it returns true or `timeout` passes.
fn wait_for(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if check() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    check()
}

/// Writes raw bytes on a fresh connection and returns everything the node
/// sent back before closing.
fn raw_exchange(addr: SocketAddr, bytes: &[u8]) -> Result<String> {
    let mut stream = TcpStream::connect_timeout(&addr, TIMEOUT)?;
    stream.set_read_timeout(Some(TIMEOUT))?;
    stream.write_all(bytes)?;
    stream.shutdown(std::net::Shutdown::Write)?;
    let mut reply = String::new();
    stream.read_to_string(&mut reply)?;
    Ok(reply)
}

#[test]
fn test_wire_get_put_remove() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A"))?;
    let addr = node.local_addr();

    assert_eq!(client::request(addr, &Request::get("IBM"), TIMEOUT)?, Some(Response::NotFound));

    client::send(addr, &Mutation::put("IBM", "140.25").into(), TIMEOUT)?;
    assert!(wait_for(TIMEOUT, || node.get("IBM").is_some()));
    assert_eq!(
        client::request(addr, &Request::get("IBM"), TIMEOUT)?,
        Some(Response::Value("140.25".into()))
    );

    client::send(addr, &Mutation::remove("IBM").into(), TIMEOUT)?;
    assert!(wait_for(TIMEOUT, || node.get("IBM").is_none()));

    node.shutdown();
    Ok(())
}

#[test]
fn test_mutations_get_no_response() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A"))?;

    assert_eq!(raw_exchange(node.local_addr(), b"PUT k v\n")?, "");
    assert_eq!(raw_exchange(node.local_addr(), b"REMOVE k\n")?, "");
    assert_eq!(raw_exchange(node.local_addr(), b"GET k\n")?, "NOT_FOUND\n");
    Ok(())
}

#[test]
fn test_malformed_requests_are_dropped() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A"))?;
    let addr = node.local_addr();

    for request in [&b"HELLO world\n"[..], b"PUT onlykey\n", b"GET\n", b"\n", b"put k v\n"] {
        assert_eq!(raw_exchange(addr, request)?, "");
    }
    // A client that connects and leaves without writing.
    drop(TcpStream::connect_timeout(&addr, TIMEOUT)?);

    // The node keeps serving and nothing was applied or logged.
    assert_eq!(client::request(addr, &Request::get("onlykey"), TIMEOUT)?, Some(Response::NotFound));
    assert!(node.is_empty());
    assert_eq!(fs::read_to_string(node.wal_path())?, "");
    Ok(())
}

#[test]
fn test_oversized_request_is_dropped_whole() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A"))?;
    let addr = node.local_addr();

    // The node gives up at the line limit and may reset the connection.
    let oversized = "x".repeat(70_000);
    let _ = raw_exchange(addr, format!("PUT big {oversized}\n").as_bytes());

    let at_limit = "y".repeat(MAX_LINE_BYTES as usize - "PUT edge \n".len());
    raw_exchange(addr, format!("PUT edge {at_limit}\n").as_bytes())?;
    assert!(wait_for(TIMEOUT, || node.get("edge").is_some()));

    assert_eq!(node.get("edge").map(|v| v.len()), Some(at_limit.len()));
    assert_eq!(node.get("big"), None);
    assert!(!fs::read_to_string(node.wal_path())?.contains("PUT big"));
    Ok(())
}

#[test]
fn test_requests_apply_in_arrival_order() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A"))?;
    let addr = node.local_addr();

    for i in 0..20 {
        raw_exchange(addr, format!("PUT counter {i}\n").as_bytes())?;
    }
    assert_eq!(node.get("counter"), Some("19".to_string()));
    Ok(())
}

#[test]
fn test_restart_recovers_from_wal() -> Result<()> {
    let dir = TempDir::new()?;
    {
        let node = Node::start(config(&dir, "A"))?;
        node.put("K1", "V1")?;
        node.put("K2", "V2")?;
        node.put("K1", "V3")?;
        node.remove_key("K2")?;
        // Remote writes are logged too.
        client::send(node.local_addr(), &Mutation::put("K4", "V4").into(), TIMEOUT)?;
        assert!(wait_for(TIMEOUT, || node.get("K4").is_some()));
        node.shutdown();
    }

    let node = Node::start(config(&dir, "A"))?;
    assert_eq!(node.get("K1"), Some("V3".to_string()));
    assert_eq!(node.get("K2"), None);
    assert_eq!(node.get("K4"), Some("V4".to_string()));
    assert_eq!(node.len(), 2);
    Ok(())
}

#[test]
fn test_recovery_survives_crash_artifacts() -> Result<()> {
    let dir = TempDir::new()?;
    let path = dir.path().join("A.wal");
    fs::write(&path, "PUT K1 V1\nREMOVE K2\nGARBAGE\nPUT K3 half")?;

    let node = Node::start(config(&dir, "A"))?;
    assert_eq!(node.get("K1"), Some("V1".to_string()));
    assert_eq!(node.get("K2"), None);
    assert_eq!(node.get("K3"), None);

    node.put("K5", "V5")?;
    assert_eq!(
        fs::read_to_string(&path)?,
        "PUT K1 V1\nREMOVE K2\nGARBAGE\nPUT K5 V5\n"
    );
    Ok(())
}

#[test]
fn test_bind_failure_is_reported() -> Result<()> {
    let dir = TempDir::new()?;
    let taken = TcpListener::bind("127.0.0.1:0")?;
    let addr = taken.local_addr()?;

    let err = Node::start(config(&dir, "A").with_listen_addr(addr))
        .err()
        .expect("port is already bound");
    assert!(matches!(err, NodeError::Bind { addr: a, .. } if a == addr));
    Ok(())
}

#[test]
fn test_wal_is_exclusive_to_one_node() -> Result<()> {
    let dir = TempDir::new()?;
    let first = Node::start(config(&dir, "A"))?;

    let err = Node::start(config(&dir, "A")).err().expect("log already owned");
    assert!(matches!(err, NodeError::Wal(WalError::AlreadyOpen { .. })));

    // Once the first node is gone, both the log and the port are free again.
    let addr = first.local_addr();
    first.shutdown();
    let second = Node::start(config(&dir, "A").with_listen_addr(addr))?;
    assert_eq!(second.local_addr(), addr);
    Ok(())
}

#[test]
fn test_missing_wal_directory_is_fatal() -> Result<()> {
    let dir = TempDir::new()?;
    let cfg = NodeConfig::new("A", dir.path().join("missing/A.wal"), 0);
    let err = Node::start(cfg).err().expect("directory does not exist");
    assert!(matches!(err, NodeError::Wal(WalError::Open { .. })));
    Ok(())
}

#[test]
fn test_shutdown_is_bounded() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A"))?;
    let addr = node.local_addr();
    assert_eq!(node.state(), NodeState::Serving);

    let started = Instant::now();
    node.shutdown();
    assert!(started.elapsed() < Duration::from_secs(2));

    // The listener was released along with the serving thread.
    assert!(TcpStream::connect_timeout(&addr, TIMEOUT).is_err());
    Ok(())
}

#[test]
fn test_silent_client_only_stalls_until_read_timeout() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A").with_read_timeout(Some(Duration::from_millis(200))))?;
    let addr = node.local_addr();

    // Holds the serving loop until its read times out.
    let _silent = TcpStream::connect_timeout(&addr, TIMEOUT)?;
    thread::sleep(Duration::from_millis(50));

    let started = Instant::now();
    assert_eq!(client::request(addr, &Request::get("k"), TIMEOUT)?, Some(Response::NotFound));
    assert!(started.elapsed() < Duration::from_secs(2));
    Ok(())
}

#[test]
fn test_replication_failure_is_swallowed() -> Result<()> {
    let dir = TempDir::new()?;
    let node = Node::start(config(&dir, "A").with_peer_timeout(Duration::from_millis(200)))?;

    // Nothing listens on a port we just released.
    let dead_port = TcpListener::bind("127.0.0.1:0")?.local_addr()?.port();
    node.put("k", "v")?;
    node.replicate_to("127.0.0.1", dead_port, "k", "v");

    assert_eq!(node.get("k"), Some("v".to_string()));
    Ok(())
}
