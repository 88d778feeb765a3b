// ===============================
// src/recorder.rs
// ===============================
//
// Audit journal JSONL:
// - Satu AuditEntry per baris, append.
// - BufWriter, flush tiap 1s dan/atau tiap 1000 entry.
// - Parent directory dibuat otomatis.
// - Kalau tulis gagal, reopen file lalu coba sekali lagi.
//
// Path dari `--audit-file` / AUDIT_FILE (lihat config.rs).
//
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncWriteExt, BufWriter},
    sync::mpsc,
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info};

use crate::domain::AuditEntry;
use crate::error::SnapshotError;

const FLUSH_EVERY_N_ENTRIES: u32 = 1000;

async fn open_writer(path: &Path) -> std::io::Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file = OpenOptions::new().create(true).append(true).open(path).await?;
    Ok(BufWriter::new(file))
}

async fn write_line(w: &mut BufWriter<File>, line: &[u8]) -> std::io::Result<()> {
    w.write_all(line).await?;
    w.write_all(b"\n").await
}

/// Consume audit entries until the channel closes. Fails only if the
/// journal cannot be opened at start.
pub async fn run(mut rx: mpsc::Receiver<AuditEntry>, path: PathBuf) -> Result<u64, SnapshotError> {
    info!(path = %path.display(), "recorder: started");
    let mut writer = open_writer(&path).await?;

    let mut tick = interval(Duration::from_secs(1));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut since_last_flush: u32 = 0;
    let mut written: u64 = 0;

    loop {
        tokio::select! {
            maybe = rx.recv() => {
                let Some(entry) = maybe else {
                    // Channel closed: flush dan keluar
                    writer.flush().await?;
                    info!(written, "recorder: channel closed, stopped");
                    return Ok(written);
                };
                let line = match serde_json::to_vec(&entry) {
                    Ok(l) => l,
                    Err(e) => {
                        error!(?e, action = %entry.action, "recorder: serialize error, skip entry");
                        continue;
                    }
                };

                if let Err(e) = write_line(&mut writer, &line).await {
                    error!(?e, "recorder: write failed, attempting reopen");
                    match open_writer(&path).await {
                        Ok(w) => writer = w,
                        Err(e2) => {
                            error!(?e2, action = %entry.action, "recorder: reopen failed, drop entry");
                            continue;
                        }
                    }
                    if let Err(e2) = write_line(&mut writer, &line).await {
                        error!(?e2, action = %entry.action, "recorder: write failed again after reopen, drop entry");
                        continue;
                    }
                }
                written += 1;

                since_last_flush += 1;
                if since_last_flush >= FLUSH_EVERY_N_ENTRIES {
                    let _ = writer.flush().await;
                    since_last_flush = 0;
                }
            }

            _ = tick.tick() => {
                let _ = writer.flush().await;
                since_last_flush = 0;
            }
        }
    }
}
