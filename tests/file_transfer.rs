//! End-to-end file transfer: a real loopback connection pair, a moderately
//! large file split across several parcels, confirm/receive events on both
//! sides, and a byte-for-byte check of what landed on disk.

mod common;

use std::io::Write as _;
use std::time::Duration;

use common::wait_for;
use linkwire::config::ConnectionParameters;
use linkwire::events::ConnectionEvent;
use linkwire::wire::parcel::Priority;
use linkwire::Connection;

#[tokio::test]
async fn file_transfers_end_to_end_and_both_sides_confirm() {
    let server_dir = tempfile::tempdir().unwrap();
    let server_params = ConnectionParameters::builder()
        .transmission_parcel_size(16_384)
        .file_root_dir(server_dir.path().to_path_buf())
        .build();
    let client_params = ConnectionParameters::builder()
        .transmission_parcel_size(16_384)
        .build();

    let (client_conn, mut client_rx, _server_conn, mut server_rx) =
        common::connect_pair(client_params, server_params).await;

    let mut src = tempfile::NamedTempFile::new().unwrap();
    let payload = vec![0x5Au8; 72_000];
    src.write_all(&payload).unwrap();
    src.flush().unwrap();

    let file_id = client_conn
        .send_file(src.path().to_path_buf(), "report.bin", Priority::Normal, 0)
        .await
        .unwrap();

    let sending = wait_for(&mut client_rx, Duration::from_secs(5), |e| {
        matches!(e, ConnectionEvent::FileSending(ev) if ev.object_id == file_id)
    })
    .await;
    match sending {
        ConnectionEvent::FileSending(ev) => assert_eq!(ev.expected_length, payload.len() as u64),
        _ => unreachable!(),
    }

    let received = wait_for(&mut server_rx, Duration::from_secs(10), |e| {
        matches!(e, ConnectionEvent::FileReceived(_))
    })
    .await;
    let (received_id, dest) = match received {
        ConnectionEvent::FileReceived(ev) => (ev.object_id, ev.path),
        _ => unreachable!(),
    };
    assert_eq!(received_id, file_id, "sender and receiver must agree on the file id");
    let on_disk = std::fs::read(&dest).unwrap();
    assert_eq!(on_disk, payload);

    let confirmed = wait_for(&mut client_rx, Duration::from_secs(10), |e| {
        matches!(e, ConnectionEvent::FileConfirmed(ev) if ev.object_id == file_id)
    })
    .await;
    assert!(matches!(confirmed, ConnectionEvent::FileConfirmed(_)));

    Connection::close(&client_conn).await;
}
