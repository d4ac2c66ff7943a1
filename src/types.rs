/// A single validated measurement crossing from a reader worker to the
/// recorder. `unit` and `sensor` have already passed the id check when a
/// sample is constructed by a producer.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub unit: String,
    pub sensor: String,
    pub value: f64,
    pub data_id: String,
}

impl Sample {
    pub fn new(
        unit: impl Into<String>,
        sensor: impl Into<String>,
        value: f64,
        data_id: impl Into<String>,
    ) -> Self {
        Self {
            unit: unit.into(),
            sensor: sensor.into(),
            value,
            data_id: data_id.into(),
        }
    }
}

/// A 10-minute aggregate blob produced by the recorder, ready for upload.
/// `body` is the newline-terminated CSV accumulation for one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadBatch {
    pub filename: String,
    pub body: String,
}
