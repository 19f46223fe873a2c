#![cfg(all(target_os = "linux", feature = "peer"))]

use std::os::fd::AsFd;
use std::sync::Arc;

use shmpipe::frame::{
    ArenaAllocator, DepayOutcome, Depayloader, FaultInjectionPoint, FrameError, FrameHeader,
    Payloader, PayloaderConfig, VideoBuffer, FRAME_SEND,
};
use shmpipe::peer::{Connection, PeerError};
use shmpipe::transport::IpcStream;

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("procfs should be mounted")
        .count()
}

fn next_frame(conn: &Connection, depay: &mut Depayloader) -> shmpipe::peer::Result<DepayOutcome> {
    loop {
        match conn.depay(depay)? {
            DepayOutcome::NeedMoreData => continue,
            outcome => return Ok(outcome),
        }
    }
}

fn expect_corrupt(conn: &Connection, depay: &mut Depayloader) {
    let err = next_frame(conn, depay).expect_err("frame should be rejected");
    assert!(
        matches!(err, PeerError::Frame(FrameError::CorruptFrame(_))),
        "unexpected error: {err}"
    );
}

#[test]
fn rejected_and_unsent_frames_close_their_descriptors() {
    let (tx, rx) = IpcStream::pair().expect("pair");
    let conn = Connection::with_socket(rx).expect("connection");
    let mut depay = Depayloader::default();
    let arena = ArenaAllocator::default();

    let (dead_tx, dead_rx) = IpcStream::pair().expect("pair");
    drop(dead_rx);
    let mut pay = Payloader::new(PayloaderConfig::default())
        .with_fault_hook(Arc::new(FaultInjectionPoint::disabled(FRAME_SEND)));

    let before = open_fds();
    for _ in 0..50 {
        // Two descriptors on one referenced frame.
        let a = arena.copy_allocate(b"hello").expect("a");
        let b = arena.copy_allocate(b"hello").expect("b");
        tx.send_with_fds(
            &FrameHeader::referenced(0, 0, 5).to_bytes(),
            &[a.as_fd(), b.as_fd()],
        )
        .expect("send two fds");
        drop((a, b));
        expect_corrupt(&conn, &mut depay);

        // Backing file smaller than the advertised payload.
        let small = arena.copy_allocate(b"tiny").expect("small");
        tx.send_with_fds(
            &FrameHeader::referenced(0, 0, 1 << 20).to_bytes(),
            &[small.as_fd()],
        )
        .expect("send undersized");
        drop(small);
        expect_corrupt(&conn, &mut depay);

        // Inline frame carrying a descriptor.
        let stray = arena.copy_allocate(b"x").expect("stray");
        let mut inline = FrameHeader::inline(0, 5).to_bytes().to_vec();
        inline.extend_from_slice(b"hello");
        tx.send_with_fds(&inline, &[stray.as_fd()])
            .expect("send inline with fd");
        drop(stray);
        expect_corrupt(&conn, &mut depay);

        // Descriptor that never reaches a peer.
        let region = arena.copy_allocate(&[7u8; 64]).expect("region");
        let buffer = VideoBuffer::from_region(region.into_fd_region());
        pay.send_frame(&dead_tx, &buffer)
            .expect_err("peer is gone");
        drop(buffer);
    }
    let after = open_fds();

    assert_eq!(before, after, "descriptors leaked on rejected frames");
    assert_eq!(pay.frames_sent(), 0);

    Payloader::new(PayloaderConfig::default())
        .with_fault_hook(Arc::new(FaultInjectionPoint::disabled(FRAME_SEND)))
        .send_frame(&tx, &VideoBuffer::from_bytes(&b"still in sync"[..]))
        .expect("good frame");
    match next_frame(&conn, &mut depay).expect("frame") {
        DepayOutcome::Frame(frame) => {
            assert_eq!(&frame.buffer.to_bytes().expect("bytes")[..], b"still in sync");
        }
        other => panic!("expected a frame, got {other:?}"),
    }
}
