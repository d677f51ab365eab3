use serde::Serialize;
use speech_protocol::{paths, Frame, ProtocolError};

/// Per-turn counters, emitted once when the turn completes or is canceled
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryRecord {
    pub session_id: String,
    pub listening_start_count: u32,
    pub hypothesis_count: u32,
    pub phrase_count: u32,
}

impl TelemetryRecord {
    pub fn to_frame(&self, request_id: &str) -> Result<Frame, ProtocolError> {
        let body = serde_json::to_string(self)?;
        Ok(Frame::text(paths::TELEMETRY, request_id, body)
            .with_header("Content-Type", "application/json"))
    }
}

#[derive(Debug, Default)]
pub struct TelemetryAggregator {
    turn: Option<(String, TelemetryRecord)>,
    /// Finished while no connection was open
    deferred: Vec<(String, TelemetryRecord)>,
}

impl TelemetryAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start counting for a turn. An unfinished previous record is returned.
    pub fn begin(&mut self, request_id: &str, session_id: &str) -> Option<(String, TelemetryRecord)> {
        let previous = self.finish();
        self.turn = Some((
            request_id.to_string(),
            TelemetryRecord {
                session_id: session_id.to_string(),
                ..Default::default()
            },
        ));
        previous
    }

    pub fn set_session_id(&mut self, session_id: &str) {
        if let Some((_, record)) = self.turn.as_mut() {
            record.session_id = session_id.to_string();
        }
    }

    pub fn listening_started(&mut self) {
        if let Some((_, record)) = self.turn.as_mut() {
            record.listening_start_count += 1;
        }
    }

    pub fn hypothesis(&mut self) {
        if let Some((_, record)) = self.turn.as_mut() {
            record.hypothesis_count += 1;
        }
    }

    pub fn phrase(&mut self) {
        if let Some((_, record)) = self.turn.as_mut() {
            record.phrase_count += 1;
        }
    }

    /// Take the record of the current turn. Later calls return `None`.
    pub fn finish(&mut self) -> Option<(String, TelemetryRecord)> {
        self.turn.take()
    }

    /// Keep a finished record until a connection can carry it
    pub fn defer(&mut self, request_id: String, record: TelemetryRecord) {
        log::debug!("📊 Holding telemetry for turn {} until the next connection", request_id);
        self.deferred.push((request_id, record));
    }

    pub fn take_deferred(&mut self) -> Vec<(String, TelemetryRecord)> {
        std::mem::take(&mut self.deferred)
    }
}
