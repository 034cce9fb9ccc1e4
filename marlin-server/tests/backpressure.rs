//! Backpressure and admission-control tests.

mod common;

use common::SlowProcessor;
use marlin_client::{Client, Connection};
use marlin_protocol::request::field;
use marlin_protocol::RequestType;
use marlin_server::{MemoryProcessor, Server, ServerConfig};
use rmpv::Value;
use std::time::Duration;

/// One connection floods the server with pipelined SELECTs returning fat
/// tuples and only then starts reading. The server fills both output
/// buffers, pauses input, resumes when the client drains, and every
/// response arrives exactly once in request order.
#[tokio::test]
async fn test_slow_reader_throttles_itself() {
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_readahead(256)
        .with_ibuf_max(256 * 1024);
    let server = Server::start(config, MemoryProcessor::new()).unwrap();

    let mut client = Client::connect(server.addr()).await.unwrap();
    let blob = "x".repeat(32 * 1024);
    for i in 0..4 {
        client
            .insert(512, Value::Array(vec![Value::from(i), Value::from(blob.as_str())]))
            .await
            .unwrap();
    }

    const REQUESTS: u64 = 100;
    let mut conn = Connection::connect(server.addr()).await.unwrap();
    let body = [
        (field::SPACE_ID, Value::from(512u32)),
        (field::LIMIT, Value::from(u32::MAX)),
        (field::KEY, Value::Array(vec![])),
    ];
    // ~13 MB of responses queued before the first read.
    for sync in 1..=REQUESTS {
        conn.send_with_sync(RequestType::Select, sync, 0, &body)
            .await
            .unwrap();
    }
    for expected in 1..=REQUESTS {
        let response = conn.read_response().await.unwrap();
        assert!(response.is_ok());
        assert_eq!(response.sync, expected);
        assert_eq!(response.data.unwrap().len(), 4);
    }

    server.shutdown();
}

/// Many connections flood slow handlers; the process-wide in-flight cap
/// pauses reads across connections and resumes them as messages retire.
/// Nothing is lost or reordered.
#[tokio::test]
async fn test_flood_across_connections() {
    const CONNS: usize = 8;
    const PER_CONN: u64 = 5;

    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap()).with_msg_max(2);
    let server = Server::start(config, SlowProcessor::new(Duration::from_millis(10))).unwrap();
    let addr = server.addr();

    let mut tasks = Vec::new();
    for _ in 0..CONNS {
        tasks.push(tokio::spawn(async move {
            let mut conn = Connection::connect(addr).await.unwrap();
            let body = [
                (field::FUNCTION_NAME, Value::from("echo")),
                (field::TUPLE, Value::Array(vec![Value::from("payload")])),
            ];
            for sync in 1..=PER_CONN {
                conn.send_with_sync(RequestType::Call, sync, 0, &body)
                    .await
                    .unwrap();
            }
            for expected in 1..=PER_CONN {
                let response = conn.read_response().await.unwrap();
                assert!(response.is_ok());
                assert_eq!(response.sync, expected);
            }
        }));
    }
    for task in tasks {
        task.await.unwrap();
    }

    server.shutdown();
}
