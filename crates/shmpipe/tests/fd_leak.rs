#![cfg(all(target_os = "linux", feature = "peer"))]

use std::sync::Arc;

use shmpipe::frame::{
    AllocationParams, ArenaAllocator, DepayOutcome, Depayloader, FaultInjectionPoint, Payloader,
    PayloaderConfig, VideoBuffer, FRAME_SEND,
};
use shmpipe::peer::Connection;
use shmpipe::transport::IpcStream;

fn open_fds() -> usize {
    std::fs::read_dir("/proc/self/fd")
        .expect("procfs should be mounted")
        .count()
}

#[test]
fn thousand_zero_copy_frames_leave_descriptor_count_unchanged() {
    let (tx, rx) = IpcStream::pair().expect("pair");
    let conn = Connection::with_socket(rx).expect("connection");
    let arena = Arc::new(ArenaAllocator::default());
    let mut pay = Payloader::new(PayloaderConfig::default())
        .with_allocator(Arc::clone(&arena))
        .with_fault_hook(Arc::new(FaultInjectionPoint::disabled(FRAME_SEND)));
    let mut depay = Depayloader::default();
    let params = AllocationParams::default();

    let before = open_fds();
    for i in 0..1000u32 {
        let mut region = arena.allocate(64, &params).expect("allocate");
        region
            .as_mut_slice()
            .expect("map")
            .fill((i % 251) as u8);
        let buffer = VideoBuffer::from_region(region.into_fd_region());
        pay.send_frame(&tx, &buffer).expect("send");
        drop(buffer);

        let frame = loop {
            match conn.depay(&mut depay).expect("depay") {
                DepayOutcome::Frame(frame) => break frame,
                DepayOutcome::NeedMoreData => continue,
                other => panic!("unexpected outcome: {other:?}"),
            }
        };
        let bytes = frame.buffer.to_bytes().expect("bytes");
        assert_eq!(bytes.len(), 64);
        assert!(bytes.iter().all(|&b| b == (i % 251) as u8));
    }
    let after = open_fds();

    assert_eq!(before, after, "descriptors leaked across 1000 frames");
    assert_eq!(pay.frames_sent(), 1000);
    assert_eq!(arena.allocations(), 1000);
}
