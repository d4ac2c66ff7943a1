//! Generic serial worker: reads `UNIT,SENSOR,VALUE[,DATAID]` lines from a
//! serial port, validates them, and forwards good samples to the recorder.
//!
//! Radio bridges retransmit, so the same line may arrive several times; a
//! short FIFO of recently accepted lines drops the copies. An optional
//! outlier checker can reject values outside a sensor's plausible range.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_serial::SerialPortBuilderExt;
use tracing::{debug, error, info, warn};

use crate::types::Sample;
use crate::worker::{StopSignal, Worker};

const READ_TIMEOUT: Duration = Duration::from_millis(100);
const PORT_WAIT: Duration = Duration::from_secs(60);
const ERROR_DELAY: Duration = Duration::from_secs(5);
/// Consecutive read errors tolerated before the worker gives up and lets
/// the supervisor rebuild it.
const ERROR_MAX: u32 = 10;
const RECENT_MAX: usize = 10;
const DATA_ID_MAX: u32 = 100;

static LINE_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_;:., -]*$").expect("line charset regex"));
static ID_CHARS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9-]+$").expect("id regex"));

/// Validates sensor values before they are recorded.
pub trait Checker: Send {
    fn check(&mut self, unit: &str, sensor: &str, value: f64) -> bool;
}

struct SensorLimits {
    min: f64,
    max: f64,
    variation: f64,
    prev: Option<f64>,
    count: u32,
}

/// Per-sensor outlier rejection. A value outside `[min, max]` is always
/// discarded; a jump larger than `variation` from the previous accepted
/// value is discarded too, unless it is the third consecutive jump, which
/// becomes the new baseline.
#[derive(Default)]
pub struct OutlierChecker {
    limits: HashMap<String, SensorLimits>,
}

impl OutlierChecker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, unit: &str, sensor: &str, min: f64, max: f64, variation: f64) {
        let check_id = format!("{sensor}_{unit}");
        debug!(check_id = %check_id, "outlier limits registered");
        self.limits.insert(
            check_id,
            SensorLimits {
                min,
                max,
                variation,
                prev: None,
                count: 0,
            },
        );
    }
}

impl Checker for OutlierChecker {
    fn check(&mut self, unit: &str, sensor: &str, value: f64) -> bool {
        let Some(limits) = self.limits.get_mut(&format!("{sensor}_{unit}")) else {
            return true;
        };

        if !(limits.min <= value && value <= limits.max) {
            return false;
        }
        if let Some(prev) = limits.prev {
            if (value - prev).abs() > limits.variation {
                limits.count += 1;
                if limits.count < 3 {
                    return false;
                }
            }
        }
        limits.prev = Some(value);
        limits.count = 0;
        true
    }
}

pub struct SerialReader {
    port: String,
    baudrate: u32,
    record_tx: mpsc::Sender<Sample>,
    checker: Option<Box<dyn Checker>>,
    recent: VecDeque<String>,
    data_id: u32,
    error_count: u32,
    /// Port basename used to tag log lines.
    port_label: String,
}

impl SerialReader {
    pub fn new(
        port: String,
        baudrate: u32,
        record_tx: mpsc::Sender<Sample>,
        checker: Option<Box<dyn Checker>>,
    ) -> Self {
        let port_label = port.rsplit('/').next().unwrap_or(&port).to_string();
        Self {
            port,
            baudrate,
            record_tx,
            checker,
            recent: VecDeque::new(),
            data_id: 0,
            error_count: 0,
            port_label,
        }
    }

    /// Validate one received line and enqueue it as a sample.
    fn handle_line(&mut self, line: &str) {
        if line.is_empty() {
            return;
        }

        if !LINE_CHARS.is_match(line) {
            warn!(port = %self.port_label, "invalid characters in received data");
            return;
        }

        let mut fields = line.split(',');
        let (Some(unit), Some(sensor), Some(value_str)) =
            (fields.next(), fields.next(), fields.next())
        else {
            warn!(port = %self.port_label, data = line, "incomplete data");
            return;
        };
        let unit = unit.trim();
        let sensor = sensor.trim();
        let value_str = value_str.trim();

        let data_id = match fields.next() {
            Some(id) => id.trim().to_string(),
            None => {
                // no explicit id: stamp with a rolling counter
                let id = self.data_id.to_string();
                self.data_id += 1;
                if self.data_id > DATA_ID_MAX {
                    self.data_id = 0;
                }
                id
            }
        };

        if !ID_CHARS.is_match(unit) {
            warn!(port = %self.port_label, unit, "invalid unit id");
            return;
        }
        if !ID_CHARS.is_match(sensor) {
            warn!(port = %self.port_label, sensor, "invalid sensor id");
            return;
        }

        let value: f64 = match value_str.parse() {
            Ok(value) => value,
            Err(_) => {
                warn!(port = %self.port_label, value = value_str, "invalid numeric value");
                return;
            }
        };

        // duplicate suppression is keyed on the raw value string, so a
        // re-sent radio packet is dropped even when it re-parses equal
        let key = format!("{unit},{sensor},{value_str},{data_id}");
        if self.recent.contains(&key) {
            debug!(port = %self.port_label, data = %key, "duplicated data");
            return;
        }
        self.recent.push_front(key);
        if self.recent.len() > RECENT_MAX {
            self.recent.pop_back();
        }

        if let Some(checker) = self.checker.as_mut() {
            if !checker.check(unit, sensor, value) {
                error!(port = %self.port_label, unit, sensor, value, "sensor value outlier");
                return;
            }
        }

        let sample = Sample::new(unit, sensor, value, data_id);
        if let Err(err) = self.record_tx.try_send(sample) {
            error!(error = %err, "record queue is full");
        }
    }

    /// Bump the consecutive error counter; true when the budget is spent and
    /// the worker should exit.
    async fn count_error(&mut self, stop: &mut StopSignal) -> bool {
        self.error_count += 1;
        if self.error_count > ERROR_MAX {
            return true;
        }
        stop.sleep(ERROR_DELAY).await;
        false
    }
}

#[async_trait]
impl Worker for SerialReader {
    fn name(&self) -> &'static str {
        "SerialReader"
    }

    async fn run(&mut self, mut stop: StopSignal) -> Result<()> {
        // USB adapters come and go; wait for the device node to appear
        while !Path::new(&self.port).exists() {
            warn!(port = %self.port, "port not found");
            stop.sleep(PORT_WAIT).await;
            if stop.is_stopped() {
                return Ok(());
            }
        }

        let stream = tokio_serial::new(&self.port, self.baudrate)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .timeout(READ_TIMEOUT)
            .open_native_async()
            .with_context(|| format!("cannot open serial port {}", self.port))?;
        info!(port = %self.port, baudrate = self.baudrate, "serial port open");

        let mut reader = BufReader::new(stream);
        let mut line_buf: Vec<u8> = Vec::new();

        while !stop.is_stopped() {
            let read = reader.read_until(b'\n', &mut line_buf);
            let line = match tokio::time::timeout(READ_TIMEOUT, read).await {
                // poll timeout: partial input stays buffered
                Err(_) => continue,
                Ok(Ok(0)) => {
                    error!(port = %self.port_label, "serial stream closed");
                    if self.count_error(&mut stop).await {
                        break;
                    }
                    continue;
                }
                Ok(Ok(_)) => match String::from_utf8(std::mem::take(&mut line_buf)) {
                    Ok(line) => {
                        self.error_count = 0;
                        line
                    }
                    Err(_) => {
                        warn!(port = %self.port_label, "undecodable bytes on serial line");
                        if self.count_error(&mut stop).await {
                            break;
                        }
                        continue;
                    }
                },
                Ok(Err(err)) => {
                    error!(port = %self.port_label, error = %err, "serial read failed");
                    if self.count_error(&mut stop).await {
                        break;
                    }
                    continue;
                }
            };
            self.handle_line(line.trim());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reader_with_queue(checker: Option<Box<dyn Checker>>) -> (SerialReader, mpsc::Receiver<Sample>) {
        let (tx, rx) = mpsc::channel(16);
        (
            SerialReader::new("/dev/ttyUSB1".into(), 115200, tx, checker),
            rx,
        )
    }

    #[test]
    fn accepts_well_formed_line() {
        let (mut reader, mut rx) = reader_with_queue(None);
        reader.handle_line("A,T1,12.3,0F");
        assert_eq!(
            rx.try_recv().expect("sample"),
            Sample::new("A", "T1", 12.3, "0F")
        );
    }

    #[test]
    fn duplicate_line_is_dropped() {
        let (mut reader, mut rx) = reader_with_queue(None);
        reader.handle_line("A,T1,12.3,0F");
        reader.handle_line("A,T1,12.3,0F");

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err(), "second copy must be suppressed");
    }

    #[test]
    fn duplicate_window_holds_ten_entries() {
        let (mut reader, mut rx) = reader_with_queue(None);
        reader.handle_line("A,T1,1.0,00");
        for i in 1..=10 {
            reader.handle_line(&format!("A,T1,{i}.5,00"));
        }
        // the original entry has been evicted and is accepted again
        reader.handle_line("A,T1,1.0,00");

        let mut count = 0;
        while rx.try_recv().is_ok() {
            count += 1;
        }
        assert_eq!(count, 12);
    }

    #[test]
    fn rejects_malformed_lines() {
        let (mut reader, mut rx) = reader_with_queue(None);
        reader.handle_line("");
        reader.handle_line("A,T1"); // too few fields
        reader.handle_line("A,T1,abc"); // value not numeric
        reader.handle_line("A!,T1,1.0"); // bad charset
        reader.handle_line("A_B,T1,1.0"); // underscore allowed in line, not in id
        reader.handle_line("A,T#1,1.0"); // bad charset in sensor
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn synthesizes_rolling_data_id() {
        let (mut reader, mut rx) = reader_with_queue(None);
        reader.handle_line("A,T1,1.0");
        reader.handle_line("A,T1,2.0");

        assert_eq!(rx.try_recv().expect("first").data_id, "0");
        assert_eq!(rx.try_recv().expect("second").data_id, "1");
    }

    #[test]
    fn outlier_checker_rejects_out_of_range() {
        let mut checker = OutlierChecker::new();
        checker.add("A", "T1", -10.0, 50.0, 5.0);
        let (mut reader, mut rx) = reader_with_queue(Some(Box::new(checker)));

        reader.handle_line("A,T1,20.0,00");
        reader.handle_line("A,T1,99.0,01"); // above max
        reader.handle_line("A,T1,-40.0,02"); // below min

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn outlier_checker_accepts_third_consecutive_jump() {
        let mut checker = OutlierChecker::new();
        checker.add("A", "T1", -100.0, 100.0, 5.0);
        let (mut reader, mut rx) = reader_with_queue(Some(Box::new(checker)));

        reader.handle_line("A,T1,10.0,00");
        reader.handle_line("A,T1,50.0,01"); // jump, rejected
        reader.handle_line("A,T1,50.1,02"); // jump, rejected
        reader.handle_line("A,T1,50.2,03"); // third jump becomes the baseline
        reader.handle_line("A,T1,51.0,04"); // within variation of the new baseline

        let values: Vec<f64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|sample| sample.value)
            .collect();
        assert_eq!(values, vec![10.0, 50.2, 51.0]);
    }

    #[test]
    fn sensors_without_limits_pass_through() {
        let mut checker = OutlierChecker::new();
        checker.add("A", "T1", 0.0, 1.0, 0.1);
        let (mut reader, mut rx) = reader_with_queue(Some(Box::new(checker)));

        reader.handle_line("B,T9,12345.0,00");
        assert!(rx.try_recv().is_ok());
    }
}
