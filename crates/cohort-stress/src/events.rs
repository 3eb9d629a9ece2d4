use crate::output;
use serde::Serialize;
use std::io::Write;

/// Print one event as a JSON line on stdout, flushed for piped consumers,
/// and append it to the `--output-dir` file when one is open.
pub fn emit<T: Serialize>(event: &T) {
    let Ok(json) = serde_json::to_string(event) else {
        return;
    };
    let stdout = std::io::stdout();
    let mut lock = stdout.lock();
    let _ = writeln!(lock, "{json}");
    let _ = lock.flush();

    output::write_jsonl_line(&json);
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

// ── Session ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventStarted {
    pub event: &'static str,
    pub mode: String,
    pub launch: String,
    pub players: usize,
    pub timestamp: String,
}

impl EventStarted {
    pub fn new(mode: &str, launch: &str, players: usize) -> Self {
        Self {
            event: "started",
            mode: mode.to_string(),
            launch: launch.to_string(),
            players,
            timestamp: now_rfc3339(),
        }
    }
}

#[derive(Serialize)]
pub struct EventPlayerFailed {
    pub event: &'static str,
    pub rank: usize,
    pub error: String,
    pub elapsed_s: f64,
}

// ── Cycles ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventCycle {
    pub event: &'static str,
    pub cycle: u32,
    pub ok: bool,
    pub elapsed_ms: f64,
}

// ── Volume ──────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventVolumeResult {
    pub event: &'static str,
    pub rank: usize,
    pub peers: usize,
    pub messages_per_peer: u32,
    pub messages_received: u64,
    pub out_of_order: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub elapsed_ms: f64,
    pub messages_per_sec: f64,
}

// ── Collectives ─────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventCollectiveRound {
    pub event: &'static str,
    pub round: u32,
    pub barrier_ms: f64,
    pub broadcast_ms: f64,
    pub scatter_ms: f64,
    pub scatterv_ms: f64,
    pub gather_ms: f64,
    pub gatherv_ms: f64,
    pub allgather_ms: f64,
}

// ── Recovery ────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventRecovery {
    pub event: &'static str,
    pub rank: usize,
    pub failure: String,
    pub survivors: Vec<usize>,
    pub new_rank: usize,
    pub detect_ms: f64,
    pub shrink_ms: f64,
}

// ── Summary ─────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct EventSummary {
    pub event: &'static str,
    pub mode: String,
    pub runs: u32,
    pub completed: u32,
    pub failed: u32,
    pub elapsed_s: f64,
}
