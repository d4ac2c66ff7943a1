//! B-route worker: drives the dongle through the connection lifecycle and
//! polls the smart meter's properties in steady state.
//!
//! ```text
//! INIT  --open-->         OPEN
//! OPEN  --reset+setup-->  SETUP   (register dump for diagnostics)
//! SETUP --scan-->         SCAN    (<=5 retries, then close port -> INIT)
//! SCAN  --join-->         JOIN    (<=5 retries, then drop cache, close -> INIT)
//! JOIN  --poll/receive--> JOIN    (600s of silence tears the session down)
//! ```
//!
//! Failures never kill the worker: the state rolls back and the cycle
//! restarts from the broken point.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::mpsc;
use tokio_serial::SerialStream;
use tracing::{debug, error, info, warn};

use crate::cache::ScanCache;
use crate::dongle::{self, SkDongle};
use crate::frame::{
    self, epc, EchonetFrame, FrameEncoder, Property, DEOJ_SMART_METER, ESV_NOTIFICATION,
    ESV_READ_RESPONSE,
};
use crate::types::Sample;
use crate::worker::{StopSignal, Worker};

const RETRY_MAX: u32 = 5;

const INSTANTANEOUS_CYCLE: Duration = Duration::from_secs(10);
const CUMULATIVE_CYCLE: Duration = Duration::from_secs(120);
const INFO_CYCLE: Duration = Duration::from_secs(600);
const RECEIVE_SILENCE_MAX: Duration = Duration::from_secs(600);

const OPEN_RETRY_DELAY: Duration = Duration::from_secs(5);
const SCAN_RETRY_DELAY: Duration = Duration::from_secs(10);

/// All samples from the meter are tagged with this unit id.
const UNIT_ID: &str = "BR";
/// The meter provides no duplicate-detection id; a fixed marker is used.
const DATA_ID: &str = "X";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BrouteState {
    Init,
    Open,
    Setup,
    Scan,
    Join,
}

/// Scaling parameters for cumulative readings, refreshed from the meter
/// every `INFO_CYCLE`. Readings decoded before the first refresh use these
/// defaults.
#[derive(Debug, Clone, Copy)]
struct Calibration {
    coefficient: u32,
    unit: f64,
    effective_digits: u8,
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            coefficient: 1,
            unit: 0.1,
            effective_digits: 6,
        }
    }
}

/// E1 unit-code map. Codes outside the table fall back to 0.1.
fn unit_scale(code: u64) -> Option<f64> {
    match code {
        0x00 => Some(1.0),
        0x01 => Some(0.1),
        0x02 => Some(0.01),
        0x03 => Some(0.001),
        0x04 => Some(0.0001),
        0x0A => Some(10.0),
        0x0B => Some(100.0),
        0x0C => Some(1000.0),
        0x0D => Some(10000.0),
        _ => None,
    }
}

/// Hex-packed timestamp heading an EA/EB reading: year(2) month day hour
/// minute second.
fn scheduled_timestamp(edt: &[u8]) -> Option<NaiveDateTime> {
    if edt.len() < 7 {
        return None;
    }
    let year = u16::from_be_bytes([edt[0], edt[1]]) as i32;
    NaiveDate::from_ymd_opt(year, edt[2] as u32, edt[3] as u32)
        .and_then(|date| date.and_hms_opt(edt[4] as u32, edt[5] as u32, edt[6] as u32))
}

fn due(last: Option<Instant>, cycle: Duration) -> bool {
    last.map_or(true, |at| at.elapsed() > cycle)
}

pub struct BrouteReader {
    port: String,
    baudrate: u32,
    broute_id: String,
    broute_pwd: String,
    cache_path: PathBuf,
    record_tx: mpsc::Sender<Sample>,

    dongle: Option<SkDongle<SerialStream>>,
    state: BrouteState,
    scan_retry: u32,
    join_retry: u32,
    calibration: Calibration,
    encoder: FrameEncoder,

    last_instantaneous: Option<Instant>,
    last_cumulative: Option<Instant>,
    last_info: Option<Instant>,
    last_receive: Instant,
}

impl BrouteReader {
    pub fn new(
        port: String,
        baudrate: u32,
        broute_id: String,
        broute_pwd: String,
        cache_path: PathBuf,
        record_tx: mpsc::Sender<Sample>,
    ) -> Self {
        Self {
            port,
            baudrate,
            broute_id,
            broute_pwd,
            cache_path,
            record_tx,
            dongle: None,
            state: BrouteState::Init,
            scan_retry: 0,
            join_retry: 0,
            calibration: Calibration::default(),
            encoder: FrameEncoder::new(),
            last_instantaneous: None,
            last_cumulative: None,
            last_info: None,
            last_receive: Instant::now(),
        }
    }

    async fn do_open(&mut self, stop: &mut StopSignal) {
        info!("state = INIT");
        match dongle::open(&self.port, self.baudrate, self.cache_path.clone()) {
            Ok(dongle) => {
                self.dongle = Some(dongle);
                self.state = BrouteState::Open;
                info!("state => OPEN");
            }
            Err(err) => {
                error!(error = %err, "cannot open dongle");
                stop.sleep(OPEN_RETRY_DELAY).await;
            }
        }
    }

    async fn do_setup(&mut self, stop: &mut StopSignal) {
        let Some(mut dongle) = self.dongle.take() else {
            self.state = BrouteState::Init;
            return;
        };

        match Self::setup_sequence(&mut dongle, &self.broute_id, &self.broute_pwd, stop).await {
            Ok(true) => {
                self.dongle = Some(dongle);
                self.state = BrouteState::Setup;
                info!("state => SETUP");
            }
            Ok(false) => {
                self.dongle = Some(dongle);
                error!("cannot setup dongle");
                stop.sleep(OPEN_RETRY_DELAY).await;
            }
            Err(err) => {
                error!(error = %err, "dongle I/O failed during setup");
                drop(dongle);
                self.state = BrouteState::Init;
                stop.sleep(OPEN_RETRY_DELAY).await;
            }
        }
    }

    async fn setup_sequence(
        dongle: &mut SkDongle<SerialStream>,
        broute_id: &str,
        broute_pwd: &str,
        stop: &mut StopSignal,
    ) -> Result<bool> {
        if !dongle.reset().await? {
            // the credential setup is still attempted after a failed reset;
            // the state only advances when it succeeds
            error!("cannot reset dongle");
            stop.sleep(OPEN_RETRY_DELAY).await;
        }
        if !dongle.setup(broute_id, broute_pwd).await? {
            return Ok(false);
        }
        dongle.dump_registers().await?;
        debug!(registers = dongle.registers().len(), "register dump complete");
        Ok(true)
    }

    async fn do_scan(&mut self, stop: &mut StopSignal) {
        let Some(mut dongle) = self.dongle.take() else {
            self.state = BrouteState::Init;
            return;
        };

        match dongle.scan().await {
            Ok(true) => {
                self.dongle = Some(dongle);
                self.state = BrouteState::Scan;
                info!("state => SCAN");
                self.scan_retry = 0;
            }
            Ok(false) => {
                error!(retry = self.scan_retry, "scan failed");
                self.scan_retry += 1;
                if self.scan_retry > RETRY_MAX {
                    self.scan_retry = 0;
                    drop(dongle);
                    self.state = BrouteState::Init;
                } else {
                    self.dongle = Some(dongle);
                }
                stop.sleep(SCAN_RETRY_DELAY).await;
            }
            Err(err) => {
                error!(error = %err, "dongle I/O failed during scan");
                drop(dongle);
                self.state = BrouteState::Init;
                stop.sleep(OPEN_RETRY_DELAY).await;
            }
        }
    }

    async fn do_join(&mut self, stop: &mut StopSignal) {
        let Some(mut dongle) = self.dongle.take() else {
            self.state = BrouteState::Init;
            return;
        };

        match dongle.join(false).await {
            Ok(true) => {
                self.dongle = Some(dongle);
                self.state = BrouteState::Join;
                info!("state => JOIN");
                self.join_retry = 0;
                self.last_receive = Instant::now();
            }
            Ok(false) => {
                error!(retry = self.join_retry, "join failed");
                self.join_retry += 1;
                if self.join_retry > RETRY_MAX {
                    self.join_retry = 0;
                    drop(dongle);
                    // a descriptor that will not authenticate is not worth
                    // reusing on the next cycle
                    ScanCache::new(self.cache_path.clone()).invalidate();
                    self.state = BrouteState::Init;
                } else {
                    self.dongle = Some(dongle);
                }
                stop.sleep(SCAN_RETRY_DELAY).await;
            }
            Err(err) => {
                error!(error = %err, "dongle I/O failed during join");
                drop(dongle);
                self.state = BrouteState::Init;
                stop.sleep(OPEN_RETRY_DELAY).await;
            }
        }
    }

    async fn do_poll(&mut self, stop: &mut StopSignal) {
        let Some(mut dongle) = self.dongle.take() else {
            self.state = BrouteState::Init;
            return;
        };

        match self.poll_cycle(&mut dongle).await {
            Ok(true) => {
                self.dongle = Some(dongle);
            }
            Ok(false) => {
                drop(dongle);
                self.state = BrouteState::Init;
                stop.sleep(OPEN_RETRY_DELAY).await;
            }
            Err(err) => {
                error!(error = %err, "dongle I/O failed in steady state");
                dongle.term().await.ok();
                drop(dongle);
                self.state = BrouteState::Init;
                stop.sleep(OPEN_RETRY_DELAY).await;
            }
        }
    }

    /// One steady-state iteration: issue the property reads that are due,
    /// poll for one inbound frame, and watch for prolonged silence. Returns
    /// false when the session has gone quiet and must be torn down.
    async fn poll_cycle(&mut self, dongle: &mut SkDongle<SerialStream>) -> Result<bool> {
        if due(self.last_instantaneous, INSTANTANEOUS_CYCLE) {
            let request = self.encoder.property_read(&[epc::INSTANTANEOUS_POWER]);
            dongle.send(&request).await?;
            self.last_instantaneous = Some(Instant::now());
        }
        if due(self.last_cumulative, CUMULATIVE_CYCLE) {
            // settle gap between back-to-back requests
            tokio::time::sleep(Duration::from_millis(100)).await;
            let request = self.encoder.property_read(&[epc::CUMULATIVE_ENERGY]);
            dongle.send(&request).await?;
            self.last_cumulative = Some(Instant::now());
        }
        if due(self.last_info, INFO_CYCLE) {
            let request = self.encoder.property_read(&[
                epc::COEFFICIENT,
                epc::EFFECTIVE_DIGITS,
                epc::ENERGY_UNIT,
            ]);
            dongle.send(&request).await?;
            self.last_info = Some(Instant::now());
        }

        if let Some(frame) = dongle.receive().await? {
            self.last_receive = Instant::now();
            self.accept(&frame);
        }

        if self.last_receive.elapsed() > RECEIVE_SILENCE_MAX {
            error!("no meter data for 600s, tearing the session down");
            dongle.term().await.ok();
            return Ok(false);
        }
        Ok(true)
    }

    /// Accept an inbound frame. Only read responses and notifications from
    /// the smart meter object are processed; everything else is dropped.
    fn accept(&mut self, frame: &EchonetFrame) {
        if frame.seoj != DEOJ_SMART_METER
            || !matches!(frame.esv, ESV_READ_RESPONSE | ESV_NOTIFICATION)
        {
            warn!(
                seoj = %frame::to_hex(&frame.seoj),
                esv = %format_args!("{:02X}", frame.esv),
                "frame from unexpected object"
            );
            return;
        }
        for prop in &frame.properties {
            self.accept_property(prop);
        }
    }

    fn accept_property(&mut self, prop: &Property) {
        let sensor = format!("{:02X}", prop.epc);
        let raw = match prop.edt_uint() {
            Some(raw) => raw,
            None => {
                warn!(epc = %sensor, edt = %frame::to_hex(&prop.edt), "undecodable property data");
                return;
            }
        };

        let value = match prop.epc {
            epc::INSTANTANEOUS_POWER => raw as f64,
            epc::CUMULATIVE_ENERGY => {
                raw as f64 * self.calibration.coefficient as f64 * self.calibration.unit
            }
            epc::COEFFICIENT => {
                self.calibration.coefficient = raw as u32;
                debug!(coefficient = self.calibration.coefficient);
                raw as f64
            }
            epc::EFFECTIVE_DIGITS => {
                self.calibration.effective_digits = raw as u8;
                debug!(effective_digits = self.calibration.effective_digits);
                raw as f64
            }
            epc::ENERGY_UNIT => {
                self.calibration.unit = unit_scale(raw).unwrap_or_else(|| {
                    warn!(code = raw, "unknown energy unit code, falling back to 0.1");
                    0.1
                });
                debug!(unit = self.calibration.unit);
                // the coded value goes on record, not the resolved scale
                raw as f64
            }
            epc::SCHEDULED_CUMULATIVE_FWD | epc::SCHEDULED_CUMULATIVE_REV => {
                if prop.edt.len() < 8 {
                    warn!(epc = %sensor, edt = %frame::to_hex(&prop.edt), "scheduled reading too short");
                    return;
                }
                let value = match frame::be_uint(&prop.edt[7..]) {
                    Some(raw) => {
                        raw as f64 * self.calibration.coefficient as f64 * self.calibration.unit
                    }
                    None => {
                        warn!(epc = %sensor, edt = %frame::to_hex(&prop.edt), "undecodable scheduled reading");
                        return;
                    }
                };
                match scheduled_timestamp(&prop.edt) {
                    Some(stamp) => info!(
                        timestamp = %stamp.format("%Y/%m/%d %H:%M:%S"),
                        epc = %sensor,
                        value,
                        "scheduled cumulative energy"
                    ),
                    None => warn!(
                        edt = %frame::to_hex(&prop.edt),
                        "scheduled reading with an invalid timestamp"
                    ),
                }
                value
            }
            _ => {
                warn!(epc = %sensor, edt = %frame::to_hex(&prop.edt), "unknown property");
                return;
            }
        };

        let sample = Sample::new(UNIT_ID, sensor, value, DATA_ID);
        if let Err(err) = self.record_tx.try_send(sample) {
            error!(error = %err, "record queue is full, dropping sample");
        }
    }
}

#[async_trait]
impl Worker for BrouteReader {
    fn name(&self) -> &'static str {
        "BrouteReader"
    }

    async fn run(&mut self, mut stop: StopSignal) -> Result<()> {
        while !stop.is_stopped() {
            match self.state {
                BrouteState::Init => self.do_open(&mut stop).await,
                BrouteState::Open => self.do_setup(&mut stop).await,
                BrouteState::Setup => self.do_scan(&mut stop).await,
                BrouteState::Scan => self.do_join(&mut stop).await,
                BrouteState::Join => self.do_poll(&mut stop).await,
            }
        }

        // leave the PANA session cleanly before releasing the port
        if let Some(mut dongle) = self.dongle.take() {
            if self.state == BrouteState::Join {
                dongle.term().await.ok();
            }
        }
        Ok(())
    }
}
