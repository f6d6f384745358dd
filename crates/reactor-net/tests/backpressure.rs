use std::io::Read;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::thread;
use std::time::Duration;

use reactor_net::{ByteBuf, CoreError, DecodeContext, FrameDecoder, Reactor, ReactorConfig, WriteQueueConfig};

/// This test never decodes anything; the reactor side is purely a sender.
struct NoopDecoder;

impl FrameDecoder for NoopDecoder {
    type Frame = ();

    fn decode(
        &mut self,
        buf: &mut ByteBuf,
        _out: &mut Vec<Self::Frame>,
        _ctx: &mut DecodeContext<'_>,
    ) -> Result<(), CoreError> {
        buf.skip(buf.readable_bytes())?;
        Ok(())
    }
}

/// Spawns a plain `std::net::TcpListener` that accepts one connection and
/// then reads it slowly, byte-dribble style, to keep the sender's outbound
/// queue backed up long enough to observe the high-water-mark transition.
fn spawn_slow_reader() -> SocketAddr {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0))).unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 256];
        loop {
            thread::sleep(Duration::from_millis(2));
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            }
        }
    });
    addr
}

#[test]
fn crossing_high_water_mark_is_observable_and_recovers() {
    let addr = spawn_slow_reader();

    let mut config = ReactorConfig::default();
    config.write_queue = WriteQueueConfig { entry_overhead: 0, high_water_mark: 4096, low_water_mark: 1024 };

    let mut reactor = Reactor::new(config, || NoopDecoder).unwrap();
    let token = reactor.connect(addr).unwrap();

    // Let the connect complete before asking for the writability handle.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    let handle = loop {
        reactor.poll_once(Some(Duration::from_millis(5)), &mut |_| {}).unwrap();
        if let Some(h) = reactor.writability_handle(token) {
            break h;
        }
        assert!(std::time::Instant::now() < deadline, "connection never registered");
    };
    assert!(handle.is_writable());

    // Much faster than the reader drains: this must push total pending
    // bytes past the 4 KiB high-water mark.
    for _ in 0..32 {
        reactor.write(token, ByteBuf::copy_from_slice(&[0u8; 4096])).unwrap();
    }

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while handle.is_writable() && std::time::Instant::now() < deadline {
        reactor.poll_once(Some(Duration::from_millis(5)), &mut |_| {}).unwrap();
    }
    assert!(!handle.is_writable(), "queue never crossed the high-water mark");

    // The slow reader eventually drains everything; writability must come
    // back once pending bytes fall under the low-water mark.
    let deadline = std::time::Instant::now() + Duration::from_secs(15);
    while !handle.is_writable() && std::time::Instant::now() < deadline {
        reactor.poll_once(Some(Duration::from_millis(5)), &mut |_| {}).unwrap();
    }
    assert!(handle.is_writable(), "queue never recovered below the low-water mark");
}
