//! Transfer session state
//!
//! The receiving side owns exactly one [`ReceiverState`]. It only changes
//! through [`ReceiverState::apply`], which rejects transitions the pairing
//! state machine does not allow. The [`TransferSession`] inside it carries the
//! per-file and aggregate progress that the transfer engine updates.

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;

use super::protocol::{ManifestEntry, PairingRequest};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SessionError {
    #[error("Cannot apply {event} while {from}")]
    InvalidTransition { from: Phase, event: &'static str },

    #[error("File {index} cannot go from {from:?} to {to:?}")]
    StatusRegression {
        index: usize,
        from: FileStatus,
        to: FileStatus,
    },

    #[error("No file with index {0}")]
    UnknownFile(usize),

    #[error("No active transfer session")]
    NoSession,
}

/// Per-file status; only ever moves forward
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Waiting,
    Transferring,
    Done,
    Error,
}

impl FileStatus {
    /// Whether `next` is a legal successor of `self`
    pub fn can_advance_to(self, next: FileStatus) -> bool {
        matches!(
            (self, next),
            (FileStatus::Waiting, FileStatus::Transferring)
                | (FileStatus::Transferring, FileStatus::Done)
                | (FileStatus::Transferring, FileStatus::Error)
        )
    }
}

/// One file of a transfer session
#[derive(Clone, Debug, Serialize)]
pub struct FileDescriptor {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub mime: String,
    pub status: FileStatus,
    /// 0.0 ..= 1.0
    pub progress: f64,
    /// Where the file ended up, once placed
    pub location: Option<String>,
}

impl FileDescriptor {
    fn advance(&mut self, next: FileStatus) -> Result<(), SessionError> {
        if !self.status.can_advance_to(next) {
            return Err(SessionError::StatusRegression {
                index: self.index,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Terminal classification of a session
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every file completed
    Done,
    /// Every file was processed and at least one failed
    Error,
    /// Fewer files were processed than the manifest holds
    Partial,
}

impl Outcome {
    pub fn classify(completed: usize, failed: usize, total: usize) -> Outcome {
        if completed == total {
            Outcome::Done
        } else if completed + failed >= total {
            Outcome::Error
        } else {
            Outcome::Partial
        }
    }
}

/// Moving average of bytes per second, sampled at most once per second
#[derive(Clone, Debug)]
pub struct SpeedMeter {
    window: usize,
    samples: VecDeque<f64>,
    last: Option<(Instant, u64)>,
    current: f64,
}

impl SpeedMeter {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
            last: None,
            current: 0.0,
        }
    }

    /// Feed the running byte total; returns the new average when a sample was taken
    pub fn sample(&mut self, now: Instant, total_bytes: u64) -> Option<f64> {
        let Some((at, bytes)) = self.last else {
            self.last = Some((now, total_bytes));
            return None;
        };

        let elapsed = now.saturating_duration_since(at);
        if elapsed < Duration::from_secs(1) {
            return None;
        }

        let rate = total_bytes.saturating_sub(bytes) as f64 / elapsed.as_secs_f64();
        self.samples.push_back(rate);
        while self.samples.len() > self.window {
            self.samples.pop_front();
        }

        self.current = self.samples.iter().sum::<f64>() / self.samples.len() as f64;
        self.last = Some((now, total_bytes));
        Some(self.current)
    }
}

/// Lifecycle of a session's transfer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Transferring,
    Finished(Outcome),
}

/// Progress of one multi-file transfer
#[derive(Clone, Debug, Serialize)]
pub struct TransferSession {
    pub files: Vec<FileDescriptor>,
    pub total_size: u64,
    pub aggregate_transferred: u64,
    /// Aggregate progress, 0.0 ..= 1.0
    pub progress: f64,
    pub current_filename: String,
    /// Smoothed speed in bytes per second
    pub speed: f64,
    pub elapsed_secs: u64,
    pub status: SessionStatus,
    /// Display name of the other side
    pub peer_name: String,
    #[serde(skip)]
    prior_total: u64,
    #[serde(skip)]
    meter: SpeedMeter,
}

impl TransferSession {
    pub fn new(manifest: &[ManifestEntry], peer_name: impl Into<String>, speed_window: usize) -> Self {
        let files: Vec<FileDescriptor> = manifest
            .iter()
            .enumerate()
            .map(|(index, entry)| FileDescriptor {
                index,
                name: entry.name.clone(),
                size: entry.size,
                mime: entry.mime.clone(),
                status: FileStatus::Waiting,
                progress: 0.0,
                location: None,
            })
            .collect();

        Self {
            total_size: files.iter().map(|f| f.size).sum(),
            files,
            aggregate_transferred: 0,
            progress: 0.0,
            current_filename: String::new(),
            speed: 0.0,
            elapsed_secs: 0,
            status: SessionStatus::Transferring,
            peer_name: peer_name.into(),
            prior_total: 0,
            meter: SpeedMeter::new(speed_window),
        }
    }

    pub fn is_transferring(&self) -> bool {
        self.status == SessionStatus::Transferring
    }

    fn file_mut(&mut self, index: usize) -> Result<&mut FileDescriptor, SessionError> {
        self.files.get_mut(index).ok_or(SessionError::UnknownFile(index))
    }

    /// Mark a file as started
    pub fn begin_file(&mut self, index: usize) -> Result<(), SessionError> {
        let prior_total = self.files.iter().take(index).map(|f| f.size).sum();
        let file = self.file_mut(index)?;
        file.advance(FileStatus::Transferring)?;
        self.current_filename = file.name.clone();
        self.prior_total = prior_total;
        Ok(())
    }

    /// Progress callback: `file_bytes` bytes of file `index` have moved
    pub fn update_progress(&mut self, index: usize, file_bytes: u64, now: Instant) {
        let Some(file) = self.files.get_mut(index) else {
            return;
        };
        if file.status != FileStatus::Transferring {
            return;
        }

        let file_bytes = file_bytes.min(file.size);
        file.progress = ratio(file_bytes, file.size);
        self.raise_aggregate(self.prior_total.saturating_add(file_bytes));

        if let Some(speed) = self.meter.sample(now, self.aggregate_transferred) {
            self.speed = speed;
        }
    }

    /// Mark a file as completed at `location`
    pub fn finish_file(&mut self, index: usize, location: Option<String>) -> Result<(), SessionError> {
        let file = self.file_mut(index)?;
        file.advance(FileStatus::Done)?;
        file.progress = 1.0;
        file.location = location;
        let size = file.size;

        self.raise_aggregate(self.prior_total.saturating_add(size));
        Ok(())
    }

    /// Mark a file as failed
    pub fn fail_file(&mut self, index: usize) -> Result<(), SessionError> {
        self.file_mut(index)?.advance(FileStatus::Error)
    }

    /// Number of (completed, failed) files
    pub fn counts(&self) -> (usize, usize) {
        self.files.iter().fold((0, 0), |(done, failed), f| match f.status {
            FileStatus::Done => (done + 1, failed),
            FileStatus::Error => (done, failed + 1),
            _ => (done, failed),
        })
    }

    /// Classify and close the session
    pub fn finish(&mut self) -> Outcome {
        let (completed, failed) = self.counts();
        let outcome = Outcome::classify(completed, failed, self.files.len());
        if outcome == Outcome::Done {
            self.raise_aggregate(self.total_size);
        }
        self.status = SessionStatus::Finished(outcome);
        self.current_filename.clear();
        self.speed = 0.0;
        outcome
    }

    /// One tick of the elapsed-time display
    pub fn tick_elapsed(&mut self) {
        if self.is_transferring() {
            self.elapsed_secs += 1;
        }
    }

    fn raise_aggregate(&mut self, candidate: u64) {
        let clamped = candidate.min(self.total_size);
        if clamped > self.aggregate_transferred {
            self.aggregate_transferred = clamped;
        }
        self.progress = if self.total_size == 0 {
            if self.files.iter().all(|f| f.status == FileStatus::Done) { 1.0 } else { 0.0 }
        } else {
            ratio(self.aggregate_transferred, self.total_size)
        };
    }
}

fn ratio(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    (part as f64 / whole as f64).min(1.0)
}

/// Access to the session inside an owning state value
pub trait SessionHolder: Send + Sync {
    fn session(&self) -> Option<&TransferSession>;
    fn session_mut(&mut self) -> Option<&mut TransferSession>;
}

/// Phase of the receiving side
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Pending,
    WaitingTransfer,
    Transferring,
    Finished(Outcome),
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Idle => f.write_str("idle"),
            Phase::Pending => f.write_str("pending"),
            Phase::WaitingTransfer => f.write_str("waiting-transfer"),
            Phase::Transferring => f.write_str("transferring"),
            Phase::Finished(outcome) => write!(f, "finished ({:?})", outcome),
        }
    }
}

/// Everything that can happen to the receiving side
#[derive(Clone, Debug)]
pub enum Event {
    /// A peer reported a pending request for us
    RequestReceived(PairingRequest),
    /// Our acceptance reached the peer
    Accepted,
    /// The peer published the file manifest
    ManifestReady(Vec<ManifestEntry>),
    /// The download loop ended
    Completed(Outcome),
    /// Declined, cancelled, withdrawn or dismissed
    Reset,
}

impl Event {
    fn name(&self) -> &'static str {
        match self {
            Event::RequestReceived(_) => "request-received",
            Event::Accepted => "accepted",
            Event::ManifestReady(_) => "manifest-ready",
            Event::Completed(_) => "completed",
            Event::Reset => "reset",
        }
    }
}

/// The receiving side's single owned state
#[derive(Clone, Debug)]
pub struct ReceiverState {
    phase: Phase,
    request: Option<PairingRequest>,
    session: Option<TransferSession>,
    speed_window: usize,
}

impl ReceiverState {
    pub fn new(speed_window: usize) -> Self {
        Self {
            phase: Phase::Idle,
            request: None,
            session: None,
            speed_window,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn request(&self) -> Option<&PairingRequest> {
        self.request.as_ref()
    }

    /// Apply an event, or reject it and leave the state untouched
    pub fn apply(&mut self, event: Event) -> Result<(), SessionError> {
        let rejected = SessionError::InvalidTransition {
            from: self.phase,
            event: event.name(),
        };

        match (self.phase, event) {
            (Phase::Idle, Event::RequestReceived(request)) => {
                self.request = Some(request);
                self.phase = Phase::Pending;
            }
            (Phase::Pending, Event::Accepted) => {
                self.phase = Phase::WaitingTransfer;
            }
            (Phase::WaitingTransfer, Event::ManifestReady(files)) => {
                let peer_name = self
                    .request
                    .as_ref()
                    .map(|r| r.requestor_name.clone())
                    .unwrap_or_default();
                self.session = Some(TransferSession::new(&files, peer_name, self.speed_window));
                self.phase = Phase::Transferring;
            }
            (Phase::Transferring, Event::Completed(outcome)) => {
                if let Some(session) = self.session.as_mut() {
                    session.status = SessionStatus::Finished(outcome);
                    session.current_filename.clear();
                }
                self.phase = Phase::Finished(outcome);
            }
            (_, Event::Reset) => {
                self.request = None;
                self.session = None;
                self.phase = Phase::Idle;
            }
            _ => return Err(rejected),
        }

        tracing::debug!("Receiver phase -> {}", self.phase);
        Ok(())
    }
}

impl SessionHolder for ReceiverState {
    fn session(&self) -> Option<&TransferSession> {
        self.session.as_ref()
    }

    fn session_mut(&mut self) -> Option<&mut TransferSession> {
        self.session.as_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manifest() -> Vec<ManifestEntry> {
        vec![
            ManifestEntry {
                name: "a.jpg".to_string(),
                size: 1000,
                mime: "image/jpeg".to_string(),
            },
            ManifestEntry {
                name: "b.pdf".to_string(),
                size: 2000,
                mime: "application/pdf".to_string(),
            },
        ]
    }

    fn request() -> PairingRequest {
        PairingRequest {
            requestor_id: "012".to_string(),
            requestor_name: "Calm Fox".to_string(),
            requestor_os: "linux".to_string(),
            requestor_platform: "desk".to_string(),
            files: manifest(),
            peer_address: None,
        }
    }

    #[test]
    fn test_status_only_moves_forward() {
        assert!(FileStatus::Waiting.can_advance_to(FileStatus::Transferring));
        assert!(FileStatus::Transferring.can_advance_to(FileStatus::Done));
        assert!(FileStatus::Transferring.can_advance_to(FileStatus::Error));
        assert!(!FileStatus::Waiting.can_advance_to(FileStatus::Done));
        assert!(!FileStatus::Done.can_advance_to(FileStatus::Transferring));
        assert!(!FileStatus::Error.can_advance_to(FileStatus::Done));
    }

    #[test]
    fn test_regression_is_rejected() {
        let mut session = TransferSession::new(&manifest(), "peer", 3);
        session.begin_file(0).unwrap();
        session.finish_file(0, None).unwrap();

        let err = session.begin_file(0).unwrap_err();
        assert!(matches!(err, SessionError::StatusRegression { index: 0, .. }));
        assert_eq!(session.files[0].status, FileStatus::Done);
    }

    #[test]
    fn test_aggregate_is_monotonic_and_bounded() {
        let mut session = TransferSession::new(&manifest(), "peer", 3);
        let now = Instant::now();
        let mut last = 0;

        session.begin_file(0).unwrap();
        for bytes in [100, 600, 400, 1000, 5000] {
            session.update_progress(0, bytes, now);
            assert!(session.aggregate_transferred >= last);
            assert!(session.aggregate_transferred <= session.total_size);
            last = session.aggregate_transferred;
        }
        session.finish_file(0, None).unwrap();

        session.begin_file(1).unwrap();
        for bytes in [0, 10, 1999, 2000, 99999] {
            session.update_progress(1, bytes, now);
            assert!(session.aggregate_transferred >= last);
            assert!(session.aggregate_transferred <= session.total_size);
            last = session.aggregate_transferred;
        }
        assert_eq!(session.aggregate_transferred, 3000);
        assert!((session.progress - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_prior_files_count_toward_aggregate() {
        let mut session = TransferSession::new(&manifest(), "peer", 3);
        let now = Instant::now();

        session.begin_file(0).unwrap();
        session.update_progress(0, 1000, now);
        session.finish_file(0, None).unwrap();
        session.begin_file(1).unwrap();
        session.update_progress(1, 500, now);

        assert_eq!(session.aggregate_transferred, 1500);
        assert!((session.files[1].progress - 0.25).abs() < 1e-9);
        assert!((session.progress - 0.5).abs() < 1e-9);
        assert_eq!(session.current_filename, "b.pdf");
    }

    #[test]
    fn test_classification() {
        assert_eq!(Outcome::classify(2, 0, 2), Outcome::Done);
        assert_eq!(Outcome::classify(1, 1, 2), Outcome::Error);
        assert_eq!(Outcome::classify(0, 1, 1), Outcome::Error);
        assert_eq!(Outcome::classify(1, 0, 2), Outcome::Partial);
        assert_eq!(Outcome::classify(9, 0, 10), Outcome::Partial);
        assert_eq!(Outcome::classify(0, 0, 0), Outcome::Done);
    }

    #[test]
    fn test_finish_done_fills_aggregate() {
        let mut session = TransferSession::new(&manifest(), "peer", 3);
        for index in 0..2 {
            session.begin_file(index).unwrap();
            session.finish_file(index, None).unwrap();
        }

        assert_eq!(session.finish(), Outcome::Done);
        assert_eq!(session.aggregate_transferred, session.total_size);
        assert!((session.progress - 1.0).abs() < f64::EPSILON);
        assert_eq!(session.current_filename, "");
    }

    #[test]
    fn test_speed_is_three_sample_average() {
        let mut meter = SpeedMeter::new(3);
        let start = Instant::now();

        assert_eq!(meter.sample(start, 0), None);
        assert_eq!(meter.sample(start + Duration::from_millis(500), 50), None);
        assert_eq!(meter.sample(start + Duration::from_secs(1), 100), Some(100.0));
        assert_eq!(meter.sample(start + Duration::from_secs(2), 400), Some(200.0));
        assert_eq!(meter.sample(start + Duration::from_secs(3), 1000), Some(1000.0 / 3.0));
        // oldest sample (100) drops out of the window
        assert_eq!(meter.sample(start + Duration::from_secs(4), 1900), Some(600.0));
    }

    #[test]
    fn test_elapsed_only_ticks_while_transferring() {
        let mut session = TransferSession::new(&manifest(), "peer", 3);
        session.tick_elapsed();
        session.tick_elapsed();
        session.finish();
        session.tick_elapsed();
        assert_eq!(session.elapsed_secs, 2);
    }

    #[test]
    fn test_receiver_happy_path() {
        let mut state = ReceiverState::new(3);
        state.apply(Event::RequestReceived(request())).unwrap();
        assert_eq!(state.phase(), Phase::Pending);

        state.apply(Event::Accepted).unwrap();
        state.apply(Event::ManifestReady(manifest())).unwrap();
        assert_eq!(state.phase(), Phase::Transferring);
        assert_eq!(state.session().unwrap().peer_name, "Calm Fox");

        state.apply(Event::Completed(Outcome::Done)).unwrap();
        assert_eq!(state.phase(), Phase::Finished(Outcome::Done));

        state.apply(Event::Reset).unwrap();
        assert_eq!(state.phase(), Phase::Idle);
        assert!(state.session().is_none());
    }

    #[test]
    fn test_at_most_one_active_request() {
        let mut state = ReceiverState::new(3);
        state.apply(Event::RequestReceived(request())).unwrap();

        let mut other = request();
        other.requestor_id = "099".to_string();
        let err = state.apply(Event::RequestReceived(other)).unwrap_err();

        assert!(matches!(err, SessionError::InvalidTransition { from: Phase::Pending, .. }));
        assert_eq!(state.request().unwrap().requestor_id, "012");
    }

    #[test]
    fn test_manifest_requires_acceptance() {
        let mut state = ReceiverState::new(3);
        state.apply(Event::RequestReceived(request())).unwrap();
        assert!(state.apply(Event::ManifestReady(manifest())).is_err());
        assert_eq!(state.phase(), Phase::Pending);
    }
}
