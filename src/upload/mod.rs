//! Resumable Multipart Uploads
//!
//! Implements large file uploads split across many requests:
//! - a durable ledger of received parts per upload
//! - exactly-once bookkeeping with idempotent part resends
//! - backend-agnostic staging and commit through storage adapters
//!
//! Protocol Flow:
//! 1. Client sends `{path, size, backend}` and receives an upload id
//! 2. Client sends parts, numbered from 1, in any order
//! 3. Client asks for completion; the backend commits the object once
//! 4. Idle uploads are aborted by the janitor

pub mod engine;
pub mod ledger;
pub mod types;

pub use engine::{EngineConfig, UploadEngine};
pub use ledger::{missing_parts, LedgerError, UploadLedger};
pub use types::*;
