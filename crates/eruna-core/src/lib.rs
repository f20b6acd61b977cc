//! # Eruna Core
//!
//! Shared alarm domain types, the error taxonomy and the TOML configuration
//! used by the batch engine and the `eruna` binary.

pub mod alarm;
pub mod config;
pub mod error;

pub use alarm::{Alarm, DayOfWeekAssociation, GroupRef, Week};
pub use config::{BatchConfig, DatabaseConfig, DispatchConfig, ErunaConfig, ProcessorKind, ReaderKind};
pub use error::{ErunaError, Result};
