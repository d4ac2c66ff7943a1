//! Worker supervision. The supervisor owns the queues, builds every
//! configured worker, restarts the ones that die, and translates process
//! signals: SIGHUP/SIGINT/SIGTERM stop all workers and exit, SIGUSR1 toggles
//! the log level.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::join_all;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use tracing_subscriber::{reload, EnvFilter, Registry};

use crate::broute::BrouteReader;
use crate::config::WorkerSpec;
use crate::recorder::FileRecorder;
use crate::serial::{Checker, OutlierChecker, SerialReader};
use crate::types::{Sample, UploadBatch};
use crate::uploader::HttpPostUploader;
use crate::worker::{stop_pair, SharedReceiver, StopHandle, Worker};

const QUEUE_CAPACITY: usize = 50;
const LIVENESS_INTERVAL: Duration = Duration::from_secs(10);

/// Runtime switch between the normal and verbose log filters.
pub struct LogControl {
    handle: reload::Handle<EnvFilter, Registry>,
    verbose: bool,
}

impl LogControl {
    pub fn new(handle: reload::Handle<EnvFilter, Registry>, verbose: bool) -> Self {
        Self { handle, verbose }
    }

    fn toggle(&mut self) {
        self.verbose = !self.verbose;
        let directive = if self.verbose { "debug" } else { "info" };
        match self.handle.reload(EnvFilter::new(directive)) {
            Ok(()) => info!(level = directive, "log level changed"),
            Err(err) => error!(error = %err, "cannot change log level"),
        }
    }
}

/// The bounded queues connecting workers. Senders are cloned into each
/// producer; receivers are shared so a respawned consumer resumes draining
/// where its predecessor stopped.
struct Channels {
    record_tx: mpsc::Sender<Sample>,
    record_rx: SharedReceiver<Sample>,
    upload_tx: mpsc::Sender<UploadBatch>,
    upload_rx: SharedReceiver<UploadBatch>,
}

impl Channels {
    fn new() -> Self {
        let (record_tx, record_rx) = mpsc::channel(QUEUE_CAPACITY);
        let (upload_tx, upload_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            record_tx,
            record_rx: Arc::new(Mutex::new(record_rx)),
            upload_tx,
            upload_rx: Arc::new(Mutex::new(upload_rx)),
        }
    }
}

struct RunningWorker {
    name: &'static str,
    stop: StopHandle,
    handle: JoinHandle<()>,
}

pub struct Supervisor {
    specs: Vec<WorkerSpec>,
    channels: Channels,
    log: LogControl,
}

impl Supervisor {
    pub fn new(specs: Vec<WorkerSpec>, log: LogControl) -> Self {
        Self {
            specs,
            channels: Channels::new(),
            log,
        }
    }

    /// Instantiate a fresh worker from its spec, wiring in the ambient
    /// queues by kind.
    fn build_worker(&self, spec: &WorkerSpec) -> Box<dyn Worker> {
        match spec.clone() {
            WorkerSpec::BrouteReader {
                port,
                baudrate,
                broute_id,
                broute_pwd,
                scan_cache,
            } => Box::new(BrouteReader::new(
                port,
                baudrate,
                broute_id,
                broute_pwd,
                scan_cache,
                self.channels.record_tx.clone(),
            )),
            WorkerSpec::SerialReader {
                port,
                baudrate,
                checker,
            } => {
                let checker: Option<Box<dyn Checker>> = if checker.is_empty() {
                    None
                } else {
                    let mut outlier = OutlierChecker::new();
                    for limits in &checker {
                        outlier.add(
                            &limits.unit,
                            &limits.sensor,
                            limits.min,
                            limits.max,
                            limits.variation,
                        );
                    }
                    Some(Box::new(outlier))
                };
                Box::new(SerialReader::new(
                    port,
                    baudrate,
                    self.channels.record_tx.clone(),
                    checker,
                ))
            }
            WorkerSpec::FileRecorder {
                fname_base,
                upload,
                data_dir,
                disp,
            } => {
                let upload_tx = upload.then(|| self.channels.upload_tx.clone());
                Box::new(FileRecorder::new(
                    Arc::clone(&self.channels.record_rx),
                    fname_base,
                    data_dir,
                    upload_tx,
                    disp,
                ))
            }
            WorkerSpec::HttpPostUploader {
                target_url,
                upload_key,
            } => Box::new(HttpPostUploader::new(
                Arc::clone(&self.channels.upload_rx),
                target_url,
                upload_key,
            )),
        }
    }

    fn spawn_worker(&self, spec: &WorkerSpec) -> RunningWorker {
        let mut worker = self.build_worker(spec);
        let name = worker.name();
        let (stop, stop_signal) = stop_pair();
        let handle = tokio::spawn(async move {
            info!(worker = name, "[START]");
            if let Err(err) = worker.run(stop_signal).await {
                error!(worker = name, error = %err, "worker failed");
            }
            info!(worker = name, "[STOP]");
        });
        RunningWorker { name, stop, handle }
    }

    pub async fn run(mut self) -> Result<()> {
        let mut running: Vec<RunningWorker> = self
            .specs
            .iter()
            .map(|spec| self.spawn_worker(spec))
            .collect();
        info!(workers = running.len(), "all workers started");

        let mut liveness = tokio::time::interval(LIVENESS_INTERVAL);
        let mut sighup = signal(SignalKind::hangup()).context("cannot install SIGHUP handler")?;
        let mut sigint = signal(SignalKind::interrupt()).context("cannot install SIGINT handler")?;
        let mut sigterm =
            signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
        let mut sigusr1 =
            signal(SignalKind::user_defined1()).context("cannot install SIGUSR1 handler")?;

        loop {
            tokio::select! {
                _ = liveness.tick() => {
                    for (index, running_worker) in running.iter_mut().enumerate() {
                        if running_worker.handle.is_finished() {
                            warn!(worker = running_worker.name, "worker is stopped, restarting");
                            *running_worker = self.spawn_worker(&self.specs[index]);
                        }
                    }
                }
                _ = sighup.recv() => break,
                _ = sigint.recv() => break,
                _ = sigterm.recv() => break,
                _ = sigusr1.recv() => self.log.toggle(),
            }
        }

        info!("stopping all workers, please wait");
        for running_worker in &running {
            running_worker.stop.stop();
        }
        join_all(running.into_iter().map(|running_worker| running_worker.handle)).await;
        info!("all workers stopped");
        Ok(())
    }
}
