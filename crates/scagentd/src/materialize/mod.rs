//! Source-to-sink replication of files, secrets, and PKI material.

pub mod artifact;
pub mod engine;
pub mod formatter;
pub mod hooks;
pub mod sink;
pub mod source;

pub use artifact::{Artifact, CertParts};
pub use engine::{CycleOutcome, EngineHandle, MaterializationEngine, ReplicationItem};
pub use formatter::SecretFormatter;
pub use hooks::Hook;
pub use sink::{atomic_write, FileDest, PkiSinks, SinkSet};
pub use source::SourceKind;
