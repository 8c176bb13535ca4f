use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use parking_lot::Mutex;
use pvsite_core::config::ArchiveConfig;
use pvsite_core::{OutputBatch, Sink, SinkError, TierName};
use tracing::{debug, info};

const PRUNE_EVERY: Duration = Duration::from_secs(1800);

/// Appends every batch to `pvsite-YYYY-MM-DD.jsonl` and keeps `latest.json` with the newest batch per tier.
pub struct ArchiveSink {
    out_dir: PathBuf,
    retention_days: u64,
    state: Mutex<ArchiveState>,
}

struct ArchiveState {
    current_day: String,
    writer: BufWriter<File>,
    latest: BTreeMap<TierName, OutputBatch>,
    last_prune: Option<Instant>,
}

impl ArchiveSink {
    pub fn open(config: &ArchiveConfig) -> Result<Self, SinkError> {
        fs::create_dir_all(&config.dir)?;
        let day = Utc::now().format("%Y-%m-%d").to_string();
        let writer = open_writer(&config.dir, &day)?;
        info!(dir = %config.dir.display(), retention_days = config.retention_days, "archive opened");

        Ok(Self {
            out_dir: config.dir.clone(),
            retention_days: config.retention_days,
            state: Mutex::new(ArchiveState {
                current_day: day,
                writer,
                latest: BTreeMap::new(),
                last_prune: None,
            }),
        })
    }

    fn write_batch(&self, batch: &OutputBatch) -> Result<(), SinkError> {
        let mut state = self.state.lock();
        self.rotate_if_needed(&mut state, batch.timestamp)?;

        serde_json::to_writer(&mut state.writer, batch)?;
        state.writer.write_all(b"\n")?;
        state.writer.flush()?;

        state.latest.insert(batch.tier, batch.clone());
        let latest_path = self.out_dir.join("latest.json");
        fs::write(latest_path, serde_json::to_vec_pretty(&state.latest)?)?;

        if state.last_prune.map_or(true, |at| at.elapsed() >= PRUNE_EVERY) {
            state.last_prune = Some(Instant::now());
            prune_old_log_files(&self.out_dir, self.retention_days, SystemTime::now())?;
        }
        Ok(())
    }

    fn rotate_if_needed(&self, state: &mut ArchiveState, ts: DateTime<Utc>) -> Result<(), SinkError> {
        let day = ts.format("%Y-%m-%d").to_string();
        if day != state.current_day {
            state.writer.flush()?;
            state.writer = open_writer(&self.out_dir, &day)?;
            debug!(day = %day, "archive rotated");
            state.current_day = day;
        }
        Ok(())
    }
}

fn open_writer(out_dir: &Path, day: &str) -> std::io::Result<BufWriter<File>> {
    let path = out_dir.join(format!("pvsite-{day}.jsonl"));
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    Ok(BufWriter::new(file))
}

#[async_trait]
impl Sink for ArchiveSink {
    fn name(&self) -> &str {
        "archive"
    }

    async fn deliver(&self, batch: &OutputBatch) -> Result<(), SinkError> {
        self.write_batch(batch)
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.state.lock().writer.flush()?;
        Ok(())
    }
}

pub(crate) fn prune_old_log_files(
    out_dir: &Path,
    retention_days: u64,
    now: SystemTime,
) -> std::io::Result<()> {
    let today = DateTime::<Utc>::from(now).date_naive();
    let cutoff = today
        .checked_sub_days(Days::new(retention_days))
        .unwrap_or(today);

    for entry in fs::read_dir(out_dir)? {
        let path = entry?.path();
        let Some(date_part) = path
            .file_name()
            .and_then(|v| v.to_str())
            .and_then(|n| n.strip_prefix("pvsite-"))
            .and_then(|v| v.strip_suffix(".jsonl"))
        else {
            continue;
        };

        let Ok(file_date) = NaiveDate::parse_from_str(date_part, "%Y-%m-%d") else {
            continue;
        };

        if file_date < cutoff {
            debug!(file = %path.display(), "pruning archive file");
            let _ = fs::remove_file(path);
        }
    }

    Ok(())
}
