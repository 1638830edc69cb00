use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use serde::Serialize;

/// Global JSONL file writer. Set once in main(), read by emit().
static JSONL_WRITER: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// `<dir>/sos-sim_<scenario>_<YYYYMMDD-HHMMSS>.jsonl`, made unique with
/// `_2`, `_3`... if a run in the same second already wrote one.
pub fn resolve_jsonl_path(dir: &Path, scenario: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
    let base = format!("sos-sim_{scenario}_{timestamp}");

    let candidate = dir.join(format!("{base}.jsonl"));
    if !candidate.exists() {
        return Ok(candidate);
    }
    let mut i = 2;
    loop {
        let candidate = dir.join(format!("{base}_{i}.jsonl"));
        if !candidate.exists() {
            return Ok(candidate);
        }
        i += 1;
    }
}

pub fn init_jsonl_writer(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    JSONL_WRITER
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "JSONL writer already set"))
}

/// Print a JSONL event to stdout and, if configured, to the output file.
pub fn emit<T: Serialize>(event: &T) {
    let Ok(json) = serde_json::to_string(event) else {
        return;
    };
    let stdout = io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{json}");
    let _ = lock.flush();

    if let Some(writer) = JSONL_WRITER.get() {
        if let Ok(mut w) = writer.lock() {
            let _ = writeln!(w, "{json}");
            let _ = w.flush();
        }
    }
}

// ── Events ──────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub scenario: String,
    pub nodes: usize,
    pub edges: usize,
    pub max_degree: usize,
    pub loss: f64,
    pub seed: u64,
}

#[derive(Serialize)]
pub struct EventDelivered {
    pub event: &'static str,
    pub node: usize,
    pub message_id: String,
    pub hops: usize,
    pub elapsed_ms: u64,
}

#[derive(Serialize)]
pub struct EventExternal {
    pub event: &'static str,
    pub message_id: String,
    pub acknowledged_at_origin: bool,
    pub elapsed_ms: u64,
}

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub scenario: String,
    pub messages: usize,
    pub expected_deliveries: usize,
    pub deliveries: usize,
    pub delivery_ratio: f64,
    pub max_hops: usize,
    pub frames_sent: u64,
    pub frames_lost: u64,
    pub duplicates: u64,
    pub externally_delivered: usize,
    pub elapsed_ms: u64,
}
