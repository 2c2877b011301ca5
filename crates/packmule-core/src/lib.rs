//! Orchestration crate: wires the manifest, download, store, retry, and
//! artifact crates into the delta-update activation protocol, plus the
//! ambient concerns around it (config, errors, events, eligibility).

pub mod config;
pub mod error;
pub mod eligibility;
pub mod events;
pub mod reporter;
pub mod updater;

pub use config::PackmuleConfig;
pub use eligibility::{Eligibility, EligibilityReport, check_eligibility};
pub use error::{ErrorKind, WithKind, error_kind};
pub use events::{EventLog, UpdateEvent, UpdateEventType};
pub use reporter::{Level, NullReporter, RecordingReporter, Reporter};
pub use updater::{UpdateOptions, UpdateStats, run_update};
