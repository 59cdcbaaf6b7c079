//! faceguard-core: attendance kiosk engine.
//!
//! Keeps the registry of enrolled identities and the attendance ledger,
//! asks an external oracle to match captured frames against the registry,
//! and drives the single-session scan cycle.

pub mod ledger;
pub mod oracle;
pub mod orchestrator;
pub mod persistence;
pub mod registry;
pub mod session;
pub mod stats;
pub mod types;

pub use ledger::{AttendanceLedger, DayBoundary, SubmitOutcome};
pub use orchestrator::{Identification, MatchOrchestrator};
pub use registry::{UserRegistry, ValidationError};
pub use session::{AttendanceSession, CaptureError, FrameSource, Resolution, SessionState};
pub use stats::DashboardStats;
pub use types::{
    AttendanceRecord, AttendanceStatus, Confidence, EncodedImage, Identity, IdentityCandidate,
    MatchResult,
};
