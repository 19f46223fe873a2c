use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;
use shmpipe_frame::{
    monotonic_now, AllocationParams, ArenaAllocator, FrameError, MonotonicClock, Payloader,
    PayloaderConfig, VideoBuffer,
};
use shmpipe_peer::{
    AttachEndpoint, CapsSlot, PeerError, Producer, RenderStats, SinkConfig, SocketSink,
};
use tracing::{debug, info, warn};

use crate::cmd::ServeArgs;
use crate::exit::{io_error, peer_error, CliError, CliResult, INTERNAL, SUCCESS, USAGE};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct ServeSummary {
    path: String,
    caps: String,
    frames_rendered: u64,
    frames_sent: u64,
    frames_dropped: u64,
    clients: usize,
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    if args.fps == 0 {
        return Err(CliError::new(USAGE, "--fps must be greater than zero"));
    }
    let frame_interval = Duration::from_secs(1) / args.fps;

    let mut payloader = Payloader::new(PayloaderConfig::default());
    payloader.set_clock(Some(Arc::new(MonotonicClock)));
    let base_time = monotonic_now();
    payloader.set_base_time(base_time);
    let allocator = Arc::clone(payloader.allocator());

    let sink = Arc::new(SocketSink::new(payloader, SinkConfig::default()));
    let caps = Arc::new(CapsSlot::with_caps(args.caps.clone()));
    let producer = Arc::new(Producer::new(Arc::clone(&sink), caps));
    let endpoint =
        AttachEndpoint::bind(&args.path, producer).map_err(|err| peer_error("bind failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let endpoint_shutdown = Arc::clone(&shutdown);
    let server = thread::Builder::new()
        .name("shmpipe-attach".to_string())
        .spawn(move || endpoint.serve(&endpoint_shutdown))
        .map_err(|err| io_error("spawn failed", err))?;

    info!(
        path = %args.path.display(),
        frame_size = args.frame_size,
        fps = args.fps,
        "serving"
    );

    let start = Instant::now();
    let mut rendered = 0u64;
    let mut dropped = 0u64;
    while running.load(Ordering::SeqCst) {
        if args.count.is_some_and(|count| rendered >= count) {
            break;
        }

        let pts = monotonic_now().saturating_sub(base_time);
        match render_frame(&allocator, &sink, args.frame_size, rendered, pts) {
            Ok(stats) => debug!(frame = rendered, ?stats, "rendered"),
            Err(err) => {
                dropped += 1;
                warn!(frame = rendered, error = %err, "frame dropped");
            }
        }
        rendered += 1;

        let next = start + frame_interval * u32::try_from(rendered).unwrap_or(u32::MAX);
        if let Some(wait) = next.checked_duration_since(Instant::now()) {
            thread::sleep(wait);
        }
    }

    shutdown.store(true, Ordering::SeqCst);
    match server.join() {
        Ok(result) => result.map_err(|err| peer_error("attach endpoint failed", err))?,
        Err(_) => return Err(CliError::new(INTERNAL, "attach endpoint thread panicked")),
    }

    let summary = ServeSummary {
        path: args.path.display().to_string(),
        caps: args.caps,
        frames_rendered: rendered,
        frames_sent: sink.with_payloader(|p| p.frames_sent()),
        frames_dropped: dropped,
        clients: sink.client_count(),
    };
    print_summary(&summary, format);
    Ok(SUCCESS)
}

/// Fill one arena frame with `index` and hand it to every client. Failures
/// only cost this frame.
fn render_frame(
    allocator: &ArenaAllocator,
    sink: &SocketSink,
    size: usize,
    index: u64,
    pts: u64,
) -> Result<RenderStats, PeerError> {
    let mut region = allocator.allocate(size, &AllocationParams::default())?;
    region
        .as_mut_slice()
        .map_err(|source| FrameError::AllocationFailed { size, source })?
        .fill(index as u8);

    let buffer = VideoBuffer::from_region(region.into_fd_region()).with_pts(pts);
    sink.render(&buffer)
}

fn print_summary(summary: &ServeSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(summary).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Producer Summary:");
            println!("  Path:            {}", summary.path);
            println!("  Caps:            {}", summary.caps);
            println!("  Frames rendered: {}", summary.frames_rendered);
            println!("  Frames sent:     {}", summary.frames_sent);
            println!("  Frames dropped:  {}", summary.frames_dropped);
            println!("  Clients:         {}", summary.clients);
        }
        OutputFormat::Raw => {
            println!("{}", summary.frames_sent);
        }
    }
}

pub(crate) fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use shmpipe_frame::{ArenaConfig, FaultInjectionPoint, FRAME_SEND};
    use shmpipe_transport::IpcStream;

    use super::*;

    fn sink() -> SocketSink {
        let payloader = Payloader::new(PayloaderConfig::default())
            .with_fault_hook(Arc::new(FaultInjectionPoint::disabled(FRAME_SEND)));
        SocketSink::new(payloader, SinkConfig::default())
    }

    #[test]
    fn allocation_failure_costs_only_that_frame() {
        let sink = sink();
        let (ours, _theirs) = IpcStream::pair().expect("pair");
        sink.add(ours).expect("add client");

        let broken = ArenaAllocator::new(ArenaConfig {
            directory: PathBuf::from("/nonexistent/shmpipe"),
            ..ArenaConfig::default()
        });
        let err = render_frame(&broken, &sink, 64, 0, 0).expect_err("allocation should fail");
        assert!(matches!(
            err,
            PeerError::Frame(FrameError::AllocationFailed { size: 64, .. })
        ));

        let stats = render_frame(&ArenaAllocator::default(), &sink, 64, 1, 0).expect("render");
        assert_eq!(stats.delivered, 1);
        assert_eq!(sink.client_count(), 1);
    }
}
