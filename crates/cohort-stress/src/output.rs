use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

/// Event file opened by `main` when `--output-dir` is given.
static EVENT_FILE: OnceLock<Mutex<BufWriter<File>>> = OnceLock::new();

/// `<dir>/<mode>_r<rank>_<YYYYMMDD-HHMMSS>.jsonl`, with `_2`, `_3`...
/// appended when a run in the same second already wrote one.
pub fn event_file_path(dir: &Path, mode: &str, rank: Option<usize>) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let timestamp = chrono::Local::now().format("%Y%m%d-%H%M%S");
    let base = match rank {
        Some(rank) => format!("{mode}_r{rank}_{timestamp}"),
        None => format!("{mode}_{timestamp}"),
    };

    let mut path = dir.join(format!("{base}.jsonl"));
    let mut attempt = 2;
    while path.exists() {
        path = dir.join(format!("{base}_{attempt}.jsonl"));
        attempt += 1;
    }
    Ok(path)
}

pub fn open_event_file(path: &Path) -> io::Result<()> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    EVENT_FILE
        .set(Mutex::new(BufWriter::new(file)))
        .map_err(|_| io::Error::new(io::ErrorKind::AlreadyExists, "event file already open"))
}

pub fn write_jsonl_line(line: &str) {
    let Some(file) = EVENT_FILE.get() else {
        return;
    };
    if let Ok(mut w) = file.lock() {
        let _ = writeln!(w, "{line}");
        let _ = w.flush();
    }
}
