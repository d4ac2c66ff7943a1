//! Recorder worker: single consumer of the record queue. Every sample is
//! appended to a daily raw file; per-(unit, sensor) averages are flushed to a
//! `sum` file each time the 10-minute bucket turns over, and offered to the
//! uploader as one batch.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Local;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::DispSpec;
use crate::types::{Sample, UploadBatch};
use crate::worker::{SharedReceiver, StopSignal, Worker};

const QUEUE_POLL: Duration = Duration::from_secs(3);

/// Wall-clock fields captured once per loop step. `key10m` is `key01m`
/// truncated to the tens-of-minutes digit with the ones digit forced to
/// zero; a bucket turns over exactly when that prefix changes.
#[derive(Debug, Clone)]
struct Stamp {
    date: String,
    time: String,
    key01m: String,
    key10m: String,
}

impl Stamp {
    fn now() -> Self {
        let now = Local::now();
        let key01m = now.format("%Y%m%d%H%M%S").to_string();
        let key10m = format!("{}0", &key01m[..11]);
        Self {
            date: now.format("%Y/%m/%d").to_string(),
            time: now.format("%H:%M:%S").to_string(),
            key01m,
            key10m,
        }
    }
}

#[derive(Debug, Default)]
struct Accum {
    count: u64,
    sum: f64,
}

/// Render a value the way the files have always carried it: a whole number
/// keeps its trailing `.0`, everything else uses the shortest exact form.
fn format_value(value: f64) -> String {
    if value.is_finite() && value.fract() == 0.0 {
        format!("{value:.1}")
    } else {
        value.to_string()
    }
}

pub struct FileRecorder {
    record_rx: SharedReceiver<Sample>,
    fname_base: String,
    data_dir: PathBuf,
    upload_tx: Option<mpsc::Sender<UploadBatch>>,
    disp: Vec<DispSpec>,

    sums: BTreeMap<(String, String), Accum>,
    key10m_prev: String,
    stamp: Stamp,
}

impl FileRecorder {
    pub fn new(
        record_rx: SharedReceiver<Sample>,
        fname_base: String,
        data_dir: PathBuf,
        upload_tx: Option<mpsc::Sender<UploadBatch>>,
        disp: Vec<DispSpec>,
    ) -> Self {
        let stamp = Stamp::now();
        let key10m_prev = stamp.key10m.clone();
        Self {
            record_rx,
            fname_base,
            data_dir,
            upload_tx,
            disp,
            sums: BTreeMap::new(),
            key10m_prev,
            stamp,
        }
    }

    /// Flush the bucket that just closed: one averaged CSV line per
    /// (unit, sensor), written as a single blob and offered to the uploader.
    async fn write_10m(&mut self) {
        let key = &self.key10m_prev;
        let date10m = format!(
            "{}/{}/{} {}:{}",
            &key[..4],
            &key[4..6],
            &key[6..8],
            &key[8..10],
            &key[10..12]
        );

        let mut data = String::new();
        for ((unit, sensor), accum) in &self.sums {
            let avg = accum.sum / accum.count as f64;
            data.push_str(&format!("{date10m},{unit},{sensor},{}\n", format_value(avg)));
        }

        if !data.is_empty() {
            let filename = format!("sum{}-{}.txt", &key[..8], self.fname_base);
            if let Err(err) = self.append(&filename, &data).await {
                error!(file = %filename, error = %err, "cannot write aggregate file");
            }
            if let Some(upload_tx) = &self.upload_tx {
                let batch = UploadBatch {
                    filename,
                    body: data,
                };
                if upload_tx.try_send(batch).is_err() {
                    warn!("upload queue is full, dropping batch");
                }
            }
        }

        self.sums.clear();
        self.key10m_prev = self.stamp.key10m.clone();
    }

    /// Append one timestamped sample line to the daily file and fold it into
    /// the running 10-minute accumulator.
    async fn write_sample(&mut self, sample: Sample) {
        let accum = self
            .sums
            .entry((sample.unit.clone(), sample.sensor.clone()))
            .or_default();
        accum.count += 1;
        accum.sum += sample.value;

        let rounded = (sample.value * 10000.0).round() / 10000.0;
        let line = format!(
            "{} {},{},{},{},{}\n",
            self.stamp.date,
            self.stamp.time,
            sample.unit,
            sample.sensor,
            format_value(rounded),
            sample.data_id
        );
        let filename = format!("{}-{}.txt", &self.stamp.key01m[..8], self.fname_base);
        if let Err(err) = self.append(&filename, &line).await {
            error!(file = %filename, error = %err, "cannot write daily file");
        }

        self.send_disp(&sample).await;
    }

    /// Overwrite the display snapshot file when the sample matches a
    /// configured mapping.
    async fn send_disp(&self, sample: &Sample) {
        for disp in &self.disp {
            if disp.unit == sample.unit && disp.sensor == sample.sensor {
                let path = format!("/tmp/DISP{}.txt", disp.filenumber);
                let line = format!(
                    "{},{},{}\n",
                    sample.unit,
                    sample.sensor,
                    format_value(sample.value)
                );
                if let Err(err) = tokio::fs::write(&path, line).await {
                    debug!(file = %path, error = %err, "cannot write display snapshot");
                }
                return;
            }
        }
    }

    /// Short-lived append-open keeps every line durable on worker stop.
    async fn append(&self, filename: &str, data: &str) -> std::io::Result<()> {
        let path = self.data_dir.join(filename);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(data.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl Worker for FileRecorder {
    fn name(&self) -> &'static str {
        "FileRecorder"
    }

    async fn run(&mut self, stop: StopSignal) -> Result<()> {
        let record_rx = Arc::clone(&self.record_rx);
        let mut record_rx = record_rx.lock().await;

        while !stop.is_stopped() {
            // the bucket check runs before every dequeue so the aggregate is
            // flushed ahead of the first sample of the next bucket
            self.stamp = Stamp::now();
            if self.stamp.key10m != self.key10m_prev {
                self.write_10m().await;
            }

            let sample = match tokio::time::timeout(QUEUE_POLL, record_rx.recv()).await {
                Ok(Some(sample)) => sample,
                Ok(None) => break,
                Err(_) => continue,
            };

            self.stamp = Stamp::now();
            self.write_sample(sample).await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::stop_pair;
    use std::fs;
    use tokio::sync::Mutex;

    fn stamp(key01m: &str, date: &str, time: &str) -> Stamp {
        Stamp {
            date: date.into(),
            time: time.into(),
            key01m: key01m.into(),
            key10m: format!("{}0", &key01m[..11]),
        }
    }

    fn recorder(
        dir: PathBuf,
        upload_tx: Option<mpsc::Sender<UploadBatch>>,
    ) -> (FileRecorder, mpsc::Sender<Sample>) {
        let (tx, rx) = mpsc::channel(16);
        let recorder = FileRecorder::new(
            Arc::new(Mutex::new(rx)),
            "test".into(),
            dir,
            upload_tx,
            Vec::new(),
        );
        (recorder, tx)
    }

    #[tokio::test]
    async fn raw_lines_are_appended_with_timestamp_and_rounding() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut rec, _tx) = recorder(dir.path().to_path_buf(), None);
        rec.stamp = stamp("20221201123456", "2022/12/01", "12:34:56");

        rec.write_sample(Sample::new("A", "T1", 12.34567, "0F")).await;

        let raw = fs::read_to_string(dir.path().join("20221201-test.txt")).expect("daily file");
        assert_eq!(raw, "2022/12/01 12:34:56,A,T1,12.3457,0F\n");
    }

    #[tokio::test]
    async fn whole_number_values_keep_their_decimal_point() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut rec, _tx) = recorder(dir.path().to_path_buf(), None);
        rec.stamp = stamp("20221201123456", "2022/12/01", "12:34:56");

        rec.write_sample(Sample::new("A", "T1", 10.0, "00")).await;

        let raw = fs::read_to_string(dir.path().join("20221201-test.txt")).expect("daily file");
        assert_eq!(raw, "2022/12/01 12:34:56,A,T1,10.0,00\n");
    }

    #[test]
    fn value_formatting_matches_file_history() {
        assert_eq!(format_value(15.0), "15.0");
        assert_eq!(format_value(5.0), "5.0");
        assert_eq!(format_value(-3.0), "-3.0");
        assert_eq!(format_value(12.3457), "12.3457");
        assert_eq!(format_value(0.0), "0.0");
    }

    #[tokio::test]
    async fn bucket_turnover_flushes_averages_and_feeds_uploader() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (upload_tx, mut upload_rx) = mpsc::channel(4);
        let (mut rec, _tx) = recorder(dir.path().to_path_buf(), Some(upload_tx));

        rec.stamp = stamp("20221201123456", "2022/12/01", "12:34:56");
        rec.key10m_prev = rec.stamp.key10m.clone();
        rec.write_sample(Sample::new("A", "T1", 10.0, "00")).await;
        rec.write_sample(Sample::new("A", "T1", 20.0, "01")).await;
        rec.write_sample(Sample::new("B", "T2", 5.0, "02")).await;

        // the clock crosses into the next bucket
        rec.stamp = stamp("20221201124001", "2022/12/01", "12:40:01");
        rec.write_10m().await;

        let blob = "2022/12/01 12:30,A,T1,15.0\n2022/12/01 12:30,B,T2,5.0\n";
        let sums = fs::read_to_string(dir.path().join("sum20221201-test.txt")).expect("sum file");
        assert_eq!(sums, blob);

        let batch = upload_rx.try_recv().expect("upload batch");
        assert_eq!(batch.filename, "sum20221201-test.txt");
        assert_eq!(batch.body, blob);

        // accumulator reset, bucket key advanced
        assert!(rec.sums.is_empty());
        assert_eq!(rec.key10m_prev, "202212011240");
    }

    #[tokio::test]
    async fn empty_bucket_writes_nothing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut rec, _tx) = recorder(dir.path().to_path_buf(), None);

        rec.key10m_prev = "202212011230".into();
        rec.stamp = stamp("20221201124001", "2022/12/01", "12:40:01");
        rec.write_10m().await;

        assert!(!dir.path().join("sum20221201-test.txt").exists());
        assert_eq!(rec.key10m_prev, "202212011240");
    }

    #[tokio::test]
    async fn recorder_stops_within_poll_timeout() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (mut rec, _tx) = recorder(dir.path().to_path_buf(), None);
        let (handle, signal) = stop_pair();

        let task = tokio::spawn(async move { rec.run(signal).await });
        handle.stop();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("recorder did not stop in time")
            .expect("recorder task failed")
            .expect("recorder returned an error");
    }
}
