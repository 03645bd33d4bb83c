#![deny(unsafe_code)]

//! Runtime wiring for dialog chat: settings, catch-up fetching, the live dialog listener
//! and the offline replay used by `dialog-replay`.

pub mod catchup;
pub mod error;
pub mod live;
pub mod replay;
/// Persisted settings with environment overrides.
pub mod settings;

pub use catchup::{ChunkSource, RecordedChunks, catch_up};
pub use error::{SessionError, SessionResult};
pub use live::LiveDialog;
pub use replay::{ReplayError, ReplayInput, ReplayReport, ReplayResult, replay};
pub use settings::{Settings, SettingsError, SettingsStore};
