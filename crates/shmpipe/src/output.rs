use std::io::IsTerminal;
use std::time::{SystemTime, UNIX_EPOCH};

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use serde::Serialize;
use shmpipe_frame::Frame;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

/// One received frame, as printed by `watch`.
#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct FrameRecord {
    pub index: u64,
    pub size: u64,
    /// Running time in nanoseconds, if the frame carried a capture timestamp.
    pub pts: Option<u64>,
    pub capture_timestamp: u64,
    pub zero_copy: bool,
    pub received_at: u64,
}

impl FrameRecord {
    pub fn from_frame(index: u64, frame: &Frame) -> Self {
        Self {
            index,
            size: frame.buffer.size(),
            pts: frame.buffer.pts(),
            capture_timestamp: frame.header.capture_timestamp,
            zero_copy: frame.buffer.is_fd_backed(),
            received_at: now_unix_seconds(),
        }
    }
}

pub fn print_frame(record: &FrameRecord, format: OutputFormat) {
    match format {
        OutputFormat::Json => {
            println!(
                "{}",
                serde_json::to_string(record).unwrap_or_else(|_| "{}".to_string())
            );
        }
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FRAME", "SIZE", "PTS", "CAPTURED", "ZERO-COPY"])
                .add_row(vec![
                    record.index.to_string(),
                    record.size.to_string(),
                    format_pts(record.pts),
                    record.capture_timestamp.to_string(),
                    record.zero_copy.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "frame={} size={} pts={} captured={} zero_copy={}",
                record.index,
                record.size,
                format_pts(record.pts),
                record.capture_timestamp,
                record.zero_copy
            );
        }
        OutputFormat::Raw => {
            println!("{} {}", record.index, record.size);
        }
    }
}

/// `h:mm:ss.nnnnnnnnn`, or `none`.
pub fn format_pts(pts: Option<u64>) -> String {
    let Some(ns) = pts else {
        return "none".to_string();
    };
    let secs = ns / 1_000_000_000;
    format!(
        "{}:{:02}:{:02}.{:09}",
        secs / 3600,
        (secs / 60) % 60,
        secs % 60,
        ns % 1_000_000_000
    )
}

fn now_unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
