//! Exercises the parcel wire format over a real loopback socket, as opposed
//! to the in-memory `Cursor` round trips already covered next to the parcel
//! code itself.

use linkwire::wire::parcel::{Channel, ExtendedHeader, Parcel, Priority};
use tokio::net::{TcpListener, TcpStream};

#[tokio::test]
async fn parcel_with_extended_header_round_trips_over_a_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        Parcel::read(&mut socket).await.unwrap()
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    let payload = vec![7u8; 4096];
    let sent = Parcel {
        channel: Channel::File,
        priority: Priority::High,
        object_id: 99,
        sequence_nr: 0,
        payload: payload.clone(),
        extended: Some(ExtendedHeader {
            codec_method: 1,
            priority: Priority::High,
            transmission_size: payload.len() as i64,
            parcel_count: 1,
            content_crc32: 0,
            path: Some("incoming/report.bin".to_string()),
        }),
    };
    sent.write(&mut client).await.unwrap();

    let received = server.await.unwrap();
    assert_eq!(received.object_id, 99);
    assert_eq!(received.payload, payload);
    let ext = received.extended.expect("parcel 0 must carry an extended header");
    assert_eq!(ext.parcel_count, 1);
    assert_eq!(ext.path.as_deref(), Some("incoming/report.bin"));
}

#[tokio::test]
async fn multiple_parcels_preserve_stream_order() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(Parcel::read(&mut socket).await.unwrap());
        }
        received
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    for seq in 0..3i32 {
        let parcel = Parcel::signal(1, seq, format!("part-{seq}").into_bytes());
        parcel.write(&mut client).await.unwrap();
    }

    let received = server.await.unwrap();
    for (seq, parcel) in received.iter().enumerate() {
        assert_eq!(parcel.sequence_nr, seq as i32);
        assert_eq!(parcel.payload, format!("part-{seq}").into_bytes());
    }
}

#[tokio::test]
async fn bad_magic_is_rejected_on_a_real_socket() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        Parcel::read(&mut socket).await
    });

    let mut client = TcpStream::connect(addr).await.unwrap();
    use tokio::io::AsyncWriteExt;
    client.write_all(&[0xDE, 0xAD, 0xBE, 0xEF]).await.unwrap();
    drop(client);

    let result = server.await.unwrap();
    assert!(result.is_err());
}
