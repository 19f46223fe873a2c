use std::time::Instant;

use serde::Serialize;
use shmpipe_peer::{AttachClient, AttachService, EndpointConfig};

use crate::cmd::watch::is_retryable;
use crate::cmd::{parse_timeout, InfoArgs};
use crate::exit::{peer_error, CliError, CliResult, SUCCESS, TIMEOUT};
use crate::output::OutputFormat;

#[derive(Serialize)]
struct InfoOutput {
    path: String,
    caps: String,
    handle: u32,
    attach_latency_ms: f64,
    peer_credentials: Option<PeerCreds>,
}

#[derive(Serialize)]
struct PeerCreds {
    uid: u32,
    gid: u32,
    pid: u32,
}

pub fn run(args: InfoArgs, format: OutputFormat) -> CliResult<i32> {
    let timeout = parse_timeout(&args.timeout)?;
    let client = AttachClient::new(&args.path).with_config(EndpointConfig {
        timeout,
        ..EndpointConfig::default()
    });

    let start = Instant::now();
    let reply = loop {
        match client.attach() {
            Ok(reply) => break reply,
            Err(err) if is_retryable(&err) => {
                if start.elapsed() >= timeout {
                    return Err(CliError::new(
                        TIMEOUT,
                        format!("attach timed out after {timeout:?}"),
                    ));
                }
                std::thread::sleep(std::time::Duration::from_millis(50));
            }
            Err(err) => return Err(peer_error("attach failed", err)),
        }
    };
    let latency = start.elapsed();

    let peer_credentials = reply
        .socket
        .peer_credentials()
        .map(|(uid, gid, pid)| PeerCreds { uid, gid, pid });

    let out = InfoOutput {
        path: args.path.display().to_string(),
        caps: reply.caps,
        handle: reply.handle,
        attach_latency_ms: (latency.as_secs_f64() * 1000.0 * 100.0).round() / 100.0,
        peer_credentials,
    };
    print_info(&out, format);
    Ok(SUCCESS)
}

fn print_info(out: &InfoOutput, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(out).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table | OutputFormat::Pretty => {
            println!("Producer Info:");
            println!("  Path:             {}", out.path);
            println!("  Caps:             {}", out.caps);
            println!("  Handle:           {}", out.handle);
            println!("  Attach latency:   {:.2}ms", out.attach_latency_ms);
            match &out.peer_credentials {
                Some(c) => println!(
                    "  Peer credentials: uid={} gid={} pid={}",
                    c.uid, c.gid, c.pid
                ),
                None => println!("  Peer credentials: unavailable"),
            }
        }
        OutputFormat::Raw => {
            println!("{}", out.caps);
        }
    }
}
