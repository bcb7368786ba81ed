use crate::stats::Stats;

pub struct ProgressPrinter<'a> {
    stats: &'a Stats,
    last_copied: i64,
    last_bytes: i64,
    last_update: std::time::Instant,
}

impl<'a> ProgressPrinter<'a> {
    pub fn new(stats: &'a Stats) -> Self {
        let snapshot = stats.snapshot();
        Self {
            stats,
            last_copied: snapshot.copied,
            last_bytes: snapshot.copied_bytes,
            last_update: std::time::Instant::now(),
        }
    }

    pub fn print(&mut self) -> anyhow::Result<String> {
        let time_now = std::time::Instant::now();
        let snapshot = self.stats.snapshot();
        let total_duration_secs = self.stats.get_duration().as_secs_f64().max(f64::EPSILON);
        let curr_duration_secs = (time_now - self.last_update)
            .as_secs_f64()
            .max(f64::EPSILON);
        let average_ops_rate = snapshot.copied as f64 / total_duration_secs;
        let current_ops_rate = (snapshot.copied - self.last_copied) as f64 / curr_duration_secs;
        let average_bytes_rate = snapshot.copied_bytes as f64 / total_duration_secs;
        let current_bytes_rate =
            (snapshot.copied_bytes - self.last_bytes) as f64 / curr_duration_secs;
        // update self
        self.last_copied = snapshot.copied;
        self.last_bytes = snapshot.copied_bytes;
        self.last_update = time_now;
        Ok(format!(
            "---------------------\n\
            COPIED:\n\
            objects: {:>10}\n\
            average: {:>10.2} objects/s\n\
            current: {:>10.2} objects/s\n\
            average: {:>10}/s\n\
            current: {:>10}/s\n\
            total:   {:>10}\n\
            -----------------------\n\
            checked: {:>10}\n\
            skipped: {:>10}\n\
            deleted: {:>10}\n\
            failed:  {:>10}",
            snapshot.copied,
            average_ops_rate,
            current_ops_rate,
            bytesize::ByteSize(average_bytes_rate.max(0.0) as u64),
            bytesize::ByteSize(current_bytes_rate.max(0.0) as u64),
            bytesize::ByteSize(u64::try_from(snapshot.copied_bytes).unwrap_or(0)),
            self.stats.checked(),
            self.stats.skipped(),
            snapshot.deleted,
            snapshot.failed,
        ))
    }
}

/// Print progress to stderr every `delay` until the task is aborted.
pub async fn run_printer(stats: std::sync::Arc<Stats>, delay: std::time::Duration) {
    let mut printer = ProgressPrinter::new(&stats);
    let mut interval = tokio::time::interval(delay);
    // the first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        match printer.print() {
            Ok(text) => eprintln!("{text}"),
            Err(error) => tracing::warn!("failed to render progress: {:#}", error),
        }
    }
}
