use std::net::{Ipv4Addr, SocketAddr};
use std::thread;
use std::time::Duration;

use reactor_net::{ByteBuf, CoreError, DecodeContext, FrameDecoder, PollEvent, Reactor, ReactorConfig};

/// `u32`-big-endian-length-prefixed frames, the same wire shape the
/// in-module cumulator tests use.
#[derive(Default)]
struct LenPrefixed;

impl FrameDecoder for LenPrefixed {
    type Frame = Vec<u8>;

    fn decode(
        &mut self,
        buf: &mut ByteBuf,
        out: &mut Vec<Self::Frame>,
        _ctx: &mut DecodeContext<'_>,
    ) -> Result<(), CoreError> {
        if buf.readable_bytes() < 4 {
            return Ok(());
        }
        let len = buf.peek_u32()? as usize;
        if buf.readable_bytes() < 4 + len {
            return Ok(());
        }
        buf.get_u32()?;
        out.push(buf.read_vec(len)?);
        Ok(())
    }
}

fn frame(payload: &[u8]) -> ByteBuf {
    let mut b = ByteBuf::with_capacity(4 + payload.len());
    b.put_u32(payload.len() as u32).unwrap();
    b.put_slice(payload).unwrap();
    b
}

/// Picks a free loopback port the way the teacher's own burst test does:
/// bind a throwaway std listener, read its port back, then drop it.
fn free_addr() -> SocketAddr {
    let probe = std::net::TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    probe.local_addr().unwrap()
}

#[test]
fn tcp_roundtrip() {
    let bind_addr = free_addr();

    let server = thread::spawn(move || {
        let mut reactor = Reactor::new(ReactorConfig::default(), LenPrefixed::default).unwrap();
        reactor.listen(bind_addr).unwrap();

        let mut stream_token = None;
        let mut received: Vec<Vec<u8>> = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);

        while received.is_empty() && std::time::Instant::now() < deadline {
            reactor
                .poll_once(Some(Duration::from_millis(10)), &mut |event| match event {
                    PollEvent::Accept { stream, .. } => stream_token = Some(stream),
                    PollEvent::Message { frame, .. } => received.push(frame),
                    _ => {}
                })
                .unwrap();
        }

        let token = stream_token.expect("server never accepted a connection");
        assert_eq!(received, vec![b"hello from client".to_vec()]);
        reactor.write(token, frame(b"hello from server")).unwrap();

        // Drain a little longer so the write actually reaches the wire.
        let deadline = std::time::Instant::now() + Duration::from_secs(1);
        while std::time::Instant::now() < deadline {
            reactor.poll_once(Some(Duration::from_millis(10)), &mut |_| {}).unwrap();
        }
    });

    let client = thread::spawn(move || {
        let mut reactor = Reactor::new(ReactorConfig::default(), LenPrefixed::default).unwrap();
        let token = reactor.connect(bind_addr).unwrap();
        reactor.write(token, frame(b"hello from client")).unwrap();

        let mut received: Vec<Vec<u8>> = Vec::new();
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while received.is_empty() && std::time::Instant::now() < deadline {
            reactor
                .poll_once(Some(Duration::from_millis(10)), &mut |event| {
                    if let PollEvent::Message { frame, .. } = event {
                        received.push(frame);
                    }
                })
                .unwrap();
        }
        assert_eq!(received, vec![b"hello from server".to_vec()]);
    });

    server.join().unwrap();
    client.join().unwrap();
}

/// A frame split across two independent TCP writes must still decode to
/// exactly one frame, not two partial ones.
#[test]
fn split_write_reassembles_into_one_frame() {
    let bind_addr = free_addr();
    let mut server = Reactor::new(ReactorConfig::default(), LenPrefixed::default).unwrap();
    server.listen(bind_addr).unwrap();

    let mut client = Reactor::new(ReactorConfig::default(), LenPrefixed::default).unwrap();
    let client_token = client.connect(bind_addr).unwrap();

    let payload = vec![7u8; 9000];
    let whole = frame(&payload);
    let (first, second) = whole.chunk().split_at(3);
    let (first, second) = (first.to_vec(), second.to_vec());

    client.write(client_token, ByteBuf::copy_from_slice(&first)).unwrap();

    let mut server_token = None;
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while server_token.is_none() && std::time::Instant::now() < deadline {
        client.poll_once(Some(Duration::from_millis(5)), &mut |_| {}).unwrap();
        server
            .poll_once(Some(Duration::from_millis(5)), &mut |event| {
                if let PollEvent::Accept { stream, .. } = event {
                    server_token = Some(stream);
                }
            })
            .unwrap();
    }
    let server_token = server_token.expect("server never accepted a connection");

    client.write(client_token, ByteBuf::copy_from_slice(&second)).unwrap();

    let mut received: Vec<Vec<u8>> = Vec::new();
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while received.is_empty() && std::time::Instant::now() < deadline {
        client.poll_once(Some(Duration::from_millis(5)), &mut |_| {}).unwrap();
        server
            .poll_once(Some(Duration::from_millis(5)), &mut |event| {
                if let PollEvent::Message { token, frame } = event {
                    assert_eq!(token, server_token);
                    received.push(frame);
                }
            })
            .unwrap();
    }
    assert_eq!(received, vec![payload]);
}
