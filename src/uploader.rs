//! Uploader worker: drains aggregate batches and POSTs them to the
//! configured HTTP sink. Delivery is at-most-once; a failed upload is
//! dropped because the on-disk aggregate file already holds the data.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, error, warn};

use crate::types::UploadBatch;
use crate::worker::{SharedReceiver, StopSignal, Worker};

const QUEUE_POLL: Duration = Duration::from_secs(3);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpPostUploader {
    upload_rx: SharedReceiver<UploadBatch>,
    target_url: String,
    upload_key: String,
}

impl HttpPostUploader {
    pub fn new(upload_rx: SharedReceiver<UploadBatch>, target_url: String, upload_key: String) -> Self {
        Self {
            upload_rx,
            target_url,
            upload_key,
        }
    }
}

#[async_trait]
impl Worker for HttpPostUploader {
    fn name(&self) -> &'static str {
        "HttpPostUploader"
    }

    async fn run(&mut self, stop: StopSignal) -> Result<()> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("cannot build HTTP client")?;

        let upload_rx = Arc::clone(&self.upload_rx);
        let mut upload_rx = upload_rx.lock().await;

        while !stop.is_stopped() {
            let batch = match tokio::time::timeout(QUEUE_POLL, upload_rx.recv()).await {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(_) => continue,
            };

            let form = [
                ("type", "text"),
                ("key", self.upload_key.as_str()),
                ("fname", batch.filename.as_str()),
                ("data", batch.body.as_str()),
            ];
            debug!(fname = %batch.filename, bytes = batch.body.len(), "uploading aggregate");

            match client.post(&self.target_url).form(&form).send().await {
                Ok(response) if !response.status().is_success() => {
                    warn!(status = %response.status(), fname = %batch.filename, "upload rejected");
                }
                Ok(_) => debug!(fname = %batch.filename, "upload complete"),
                Err(err) => {
                    // the batch is dropped; the aggregate file keeps the data
                    error!(error = %err, fname = %batch.filename, "upload failed");
                }
            }
        }
        Ok(())
    }
}
