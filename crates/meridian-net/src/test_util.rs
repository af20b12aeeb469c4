//! Loopback helpers shared by the unit tests.

use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use meridian_core::{write_envelope, Capabilities, Envelope, Framer, Handshake};

/// Two ends of a fresh loopback TCP connection: (client, accepted).
pub async fn connected_pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
    (client.unwrap(), accepted.unwrap().0)
}

pub async fn raw_handshake(stream: &mut TcpStream, caps: Capabilities) {
    write_envelope(stream, &Handshake::new("raw-test", caps, 0).to_envelope())
        .await
        .unwrap();
}

pub async fn read_envelope(framer: &mut Framer, stream: &mut TcpStream) -> Envelope {
    let frame = tokio::time::timeout(Duration::from_secs(5), framer.read_frame(stream))
        .await
        .expect("timed out waiting for envelope")
        .unwrap()
        .expect("stream closed");
    Envelope::from_frame(frame).unwrap()
}

pub async fn wait_for(cond: impl Fn() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
