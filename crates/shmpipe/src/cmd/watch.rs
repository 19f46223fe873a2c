use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shmpipe_frame::{monotonic_now, DepayOutcome, Depayloader, MonotonicClock};
use shmpipe_peer::{
    AttachClient, AttachReply, AttachService, Consumer, EndpointConfig, PeerError,
};
use shmpipe_transport::TransportError;
use tracing::{info, warn};

use crate::cmd::{parse_timeout, WatchArgs};
use crate::exit::{peer_error, CliError, CliResult, FAILURE, INTERNAL, SUCCESS};
use crate::output::{print_frame, FrameRecord, OutputFormat};

const RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Keeps retrying while the endpoint is absent, so a restarting producer
/// is picked up again.
struct RetryingClient {
    client: AttachClient,
    patience: Duration,
}

impl AttachService for RetryingClient {
    fn attach(&self) -> shmpipe_peer::Result<AttachReply> {
        let start = Instant::now();
        loop {
            match self.client.attach() {
                Err(err) if is_retryable(&err) && start.elapsed() < self.patience => {
                    thread::sleep(RETRY_INTERVAL);
                }
                other => return other,
            }
        }
    }
}

pub(crate) fn is_retryable(err: &PeerError) -> bool {
    match err {
        PeerError::Transport(TransportError::Connect { source, .. }) => {
            source.kind() == std::io::ErrorKind::NotFound
                || source.kind() == std::io::ErrorKind::ConnectionRefused
        }
        _ => false,
    }
}

pub fn run(args: WatchArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let service = Arc::new(RetryingClient {
        client: AttachClient::new(&args.path).with_config(EndpointConfig {
            timeout,
            ..EndpointConfig::default()
        }),
        patience: timeout,
    });

    let mut depay = Depayloader::default();
    depay.set_clock(Some(Arc::new(MonotonicClock)));
    depay.set_base_time(Some(monotonic_now()));

    let mut consumer =
        Consumer::new(service, depay).map_err(|err| peer_error("consumer setup failed", err))?;
    let caps = consumer
        .start()
        .map_err(|err| peer_error("attach failed", err))?;
    info!(%caps, "watching");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone(), Arc::clone(consumer.connection()))?;

    let mut received = 0u64;
    while running.load(Ordering::SeqCst) {
        if args.count.is_some_and(|count| received >= count) {
            break;
        }
        match consumer.next_frame() {
            Ok(DepayOutcome::Frame(frame)) => {
                print_frame(&FrameRecord::from_frame(received, &frame), format);
                received += 1;
            }
            Ok(DepayOutcome::NeedMoreData) => continue,
            Ok(DepayOutcome::Flushing) => break,
            Ok(DepayOutcome::EndOfStream) => {
                return Err(CliError::new(
                    FAILURE,
                    format!("producer went away after {received} frames"),
                ));
            }
            Err(err) if err.is_frame_local() => {
                warn!(error = %err, "dropped frame");
            }
            Err(err) => return Err(peer_error("receive failed", err)),
        }
    }

    Ok(SUCCESS)
}

fn install_ctrlc_handler(
    running: Arc<AtomicBool>,
    connection: Arc<shmpipe_peer::Connection>,
) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
        connection.signal_unlock();
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
