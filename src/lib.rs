// src/lib.rs

//! diskimport — disk-image import pipeline
//!
//! Fetches a remote disk image over HTTP and drives nbdkit + qemu-img to
//! produce a raw image on local storage. An outer driver advances the
//! phase-driven state machine (`NbdkitHttpSource`) one operation at a time;
//! conversion runs as an external subprocess under resource limits, and the
//! in-flight network read stays cancellable throughout.
//!
//! # Architecture
//!
//! - `importer`: the phase state machine, HTTP reader, and cancel-once guard
//! - `nbdkit`: conversion argument building and the executor trait
//! - `format`: one-shot magic-byte classification of the source stream
//! - `system`: subprocess execution under rlimits with a wall-clock timeout
//! - `progress`: injectable conversion-progress sink

pub mod endpoint;
mod error;
pub mod format;
pub mod importer;
pub mod nbdkit;
pub mod progress;
pub mod system;
pub mod util;

pub use error::{Error, Result};
pub use format::{CompressionFormat, FormatReaders, ReadCloser};
pub use importer::{CancelOnce, ContentType, NbdkitHttpSource, ProcessingPhase};
pub use nbdkit::{
    build_command_args, Nbdkit, NbdkitArgs, NbdkitFilter, NbdkitOperations, NbdkitPlugin,
};
pub use progress::{LogProgressSink, NoopProgressSink, ProgressSink};
pub use system::{exec_with_limits, ProcessLimits};
