// src/importer/mod.rs

//! HTTP import pipeline
//!
//! `NbdkitHttpSource` walks a remote disk image through a fixed set of
//! phases: classify the stream, convert through nbdkit into scratch space or
//! a provided file, and hand the resulting URL back to the outer driver. The
//! driver calls one phase operation at a time and reacts to the returned
//! `ProcessingPhase`; any `Err` from an operation corresponds to the `Error`
//! phase and is terminal apart from `close`.
//!
//! Valid call order:
//! - (initial) -> `info`
//! - `TransferDataFile` -> `transfer` or `transfer_file`
//! - `Resize` -> external resize step
//! - `Convert` -> `process`, then external finalization
//! - `Error` -> `close` only
//!
//! Concurrency: a single logical owner drives the phases sequentially. The
//! only shared state is the cancellation action, which a watchdog on another
//! thread may fire through `cancel_token()`; `CancelOnce` guards that race.

mod http;

use crate::endpoint::{parse_endpoint, with_credentials};
use crate::error::{Error, Result};
use crate::format::{FormatReaders, ReadCloser};
use crate::nbdkit::{NbdkitArgs, NbdkitFilter, NbdkitOperations};
use crate::util::{available_space, TMP_IMPORT_FILE};
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tracing::{error, info};
use url::Url;

/// What the outer driver should do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessingPhase {
    /// Terminal, unrecoverable; the driver must still call `close`.
    Error,
    /// Data must be moved into scratch storage or a provided file next.
    TransferDataFile,
    /// Conversion finished; a size adjustment may follow.
    Resize,
    /// Ready for final format conversion/registration.
    Convert,
    /// Import finished; set by the outer driver, never returned here.
    Complete,
}

/// Content type the caller declared for the endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// A disk image; the only variant this source imports end to end.
    DiskImage,
    /// An archive to be unpacked; unsupported by this source.
    Archive,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DiskImage => "disk-image",
            Self::Archive => "archive",
        }
    }
}

impl std::fmt::Display for ContentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Single-fire guarded cancellation action.
///
/// `cancel` is idempotent and safe to call concurrently, e.g. from a timeout
/// watchdog racing the normal close path. The action runs at most once.
pub struct CancelOnce {
    action: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl CancelOnce {
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            action: Mutex::new(Some(Box::new(action))),
        }
    }

    /// Fire the action if it has not fired yet.
    pub fn cancel(&self) {
        if let Some(action) = self.action.lock().unwrap().take() {
            action();
        }
    }
}

/// Import pipeline for nbdkit-backed HTTP sources.
///
/// Owns the live HTTP connection, its single cancellation handle, and the
/// injected conversion operations.
pub struct NbdkitHttpSource {
    /// Raw reader kept for the classification step in `info`.
    http_reader: Option<Box<dyn ReadCloser + Send>>,
    cancel: Arc<CancelOnce>,
    content_type: ContentType,
    /// Reader stack, set once `info` has classified the stream.
    readers: Option<FormatReaders>,
    endpoint: Url,
    /// URL reported to the caller once ready: the endpoint itself, or a file
    /// in scratch space. Set at most once.
    url: Option<Url>,
    /// True when custom TLS trust material has to reach the conversion step.
    custom_ca: bool,
    cert_dir: Option<PathBuf>,
    /// Length declared by the endpoint; advisory only.
    content_length: u64,
    ops: Arc<dyn NbdkitOperations>,
}

impl NbdkitHttpSource {
    /// Open the endpoint and build a pipeline around the live connection.
    ///
    /// When both `access_key` and `secret_key` are non-empty they are used
    /// for the initial request and embedded into the URL handed to the
    /// conversion subprocess. `cert_dir` must contain `tls.crt` when given.
    pub fn new(
        endpoint: &str,
        access_key: &str,
        secret_key: &str,
        cert_dir: Option<&Path>,
        content_type: ContentType,
        ops: Arc<dyn NbdkitOperations>,
    ) -> Result<Self> {
        let ep = parse_endpoint(endpoint)?;
        let (reader, content_length) =
            http::create_http_reader(&ep, access_key, secret_key, cert_dir)?;
        let flag = reader.cancel_flag();
        let cancel = Arc::new(CancelOnce::new(move || {
            flag.store(true, Ordering::SeqCst);
        }));
        let ep = with_credentials(ep, access_key, secret_key);
        Ok(Self {
            http_reader: Some(Box::new(reader)),
            cancel,
            content_type,
            readers: None,
            endpoint: ep,
            url: None,
            custom_ca: cert_dir.is_some(),
            cert_dir: cert_dir.map(Path::to_path_buf),
            content_length,
            ops,
        })
    }

    /// Classify the source stream and report the next phase.
    ///
    /// The content-type gate runs before classification, so unsupported
    /// content types short-circuit without consuming the reader. On success
    /// the reported URL becomes the endpoint itself and the driver should
    /// transfer next.
    pub fn info(&mut self) -> Result<ProcessingPhase> {
        if self.content_type != ContentType::DiskImage {
            return Err(Error::UnsupportedContentType(self.content_type));
        }
        if self.readers.is_none() {
            let reader = self
                .http_reader
                .take()
                .ok_or(Error::InvalidState("source reader is closed"))?;
            match FormatReaders::new(reader, self.content_length) {
                Ok(readers) => self.readers = Some(readers),
                Err(err) => {
                    error!("Error creating readers: {}", err);
                    return Err(err);
                }
            }
        }
        if self.url.is_none() {
            self.url = Some(self.endpoint.clone());
        }
        Ok(ProcessingPhase::TransferDataFile)
    }

    /// Convert into scratch storage under `scratch_dir`.
    ///
    /// The space check runs first so a corrupt or inaccessible scratch path
    /// never reaches the external converter.
    pub fn transfer(&mut self, scratch_dir: &Path) -> Result<ProcessingPhase> {
        if self.readers.is_none() {
            return Err(Error::InvalidState("transfer before info"));
        }
        if available_space(scratch_dir) <= 0 {
            return Err(Error::InvalidPath(scratch_dir.to_path_buf()));
        }
        let file = scratch_dir.join(TMP_IMPORT_FILE);
        info!(
            "Transferring {} to scratch space at {}",
            self.endpoint,
            file.display()
        );
        let args = NbdkitArgs::new(self.endpoint.clone(), file);
        self.ops.convert_and_write(&args)?;
        Ok(ProcessingPhase::Resize)
    }

    /// Convert directly into `file_name`, which may be a regular file or a
    /// pre-provisioned block device.
    ///
    /// No space check here: the destination need not be filesystem-backed,
    /// so verifying it is the caller's responsibility.
    pub fn transfer_file(&mut self, file_name: &Path) -> Result<ProcessingPhase> {
        let readers = self
            .readers
            .as_ref()
            .ok_or(Error::InvalidState("transfer before info"))?;
        info!(
            "Transferring {} to {}",
            self.endpoint,
            file_name.display()
        );
        let mut args = NbdkitArgs::new(self.endpoint.clone(), file_name);
        if readers.is_xz() {
            args.filters.push(NbdkitFilter::Xz);
        }
        if self.custom_ca {
            args.cert_dir = self.cert_dir.clone();
        }
        self.ops.convert_and_write(&args)?;
        Ok(ProcessingPhase::Resize)
    }

    /// Extension point for pre-conversion steps; currently a no-op.
    pub fn process(&mut self) -> Result<ProcessingPhase> {
        Ok(ProcessingPhase::Convert)
    }

    /// URL the data processor should convert from.
    ///
    /// `None` until `info` has completed once.
    pub fn get_url(&self) -> Option<&Url> {
        self.url.as_ref()
    }

    /// Handle a watchdog can use to abort the in-flight read without waiting
    /// for `close`.
    pub fn cancel_token(&self) -> Arc<CancelOnce> {
        self.cancel.clone()
    }

    /// Release the reader stack and cancel the owned context.
    ///
    /// Safe to call repeatedly; the first release error is returned (once),
    /// and cancellation runs regardless.
    pub fn close(&mut self) -> Result<()> {
        let mut release = Ok(());
        if let Some(readers) = self.readers.as_mut() {
            release = readers.close();
        }
        if let Some(reader) = self.http_reader.as_mut() {
            // info() never ran; the raw reader still owns the connection.
            let result = reader.close().map_err(Error::ResourceReleaseFailed);
            if release.is_ok() {
                release = result;
            }
        }
        self.http_reader = None;
        self.cancel.cancel();
        release
    }
}

impl Drop for NbdkitHttpSource {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::CompressionFormat;
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicBool, AtomicUsize};

    const XZ_HEAD: &[u8] = &[0xfd, 0x37, 0x7a, 0x58, 0x5a, 0x00, 0x00, 0x01];
    const QCOW2_HEAD: &[u8] = b"QFI\xfb\x00\x00\x00\x03";

    /// Reader that counts reads and can fail its close.
    struct TrackingReader {
        inner: Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
        fail_close: bool,
    }

    impl TrackingReader {
        fn new(data: &[u8], reads: Arc<AtomicUsize>, fail_close: bool) -> Self {
            Self {
                inner: Cursor::new(data.to_vec()),
                reads,
                fail_close,
            }
        }
    }

    impl Read for TrackingReader {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(buf)
        }
    }

    impl ReadCloser for TrackingReader {
        fn close(&mut self) -> std::io::Result<()> {
            if self.fail_close {
                return Err(std::io::Error::other("close failed"));
            }
            Ok(())
        }
    }

    /// Operations mock that records requests and returns a configured result.
    #[derive(Default)]
    struct MockOps {
        calls: Mutex<Vec<NbdkitArgs>>,
        fail: bool,
    }

    impl MockOps {
        fn failing() -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail: true,
            }
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl NbdkitOperations for MockOps {
        fn convert_and_write(&self, args: &NbdkitArgs) -> Result<()> {
            self.calls.lock().unwrap().push(args.clone());
            if self.fail {
                return Err(Error::ConversionFailed(Box::new(Error::ProcessFailed {
                    command: "nbdkit".to_string(),
                    detail: "exit code 1".to_string(),
                })));
            }
            Ok(())
        }
    }

    fn source_with(
        data: &[u8],
        endpoint: &str,
        content_type: ContentType,
        cert_dir: Option<&Path>,
        ops: Arc<dyn NbdkitOperations>,
        reads: Arc<AtomicUsize>,
        fail_close: bool,
    ) -> NbdkitHttpSource {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        NbdkitHttpSource {
            http_reader: Some(Box::new(TrackingReader::new(data, reads, fail_close))),
            cancel: Arc::new(CancelOnce::new(move || flag.store(true, Ordering::SeqCst))),
            content_type,
            readers: None,
            endpoint: Url::parse(endpoint).unwrap(),
            url: None,
            custom_ca: cert_dir.is_some(),
            cert_dir: cert_dir.map(Path::to_path_buf),
            content_length: data.len() as u64,
            ops,
        }
    }

    fn disk_image_source(data: &[u8], ops: Arc<dyn NbdkitOperations>) -> NbdkitHttpSource {
        source_with(
            data,
            "https://example.com/disk.qcow2",
            ContentType::DiskImage,
            None,
            ops,
            Arc::new(AtomicUsize::new(0)),
            false,
        )
    }

    #[test]
    fn test_info_reports_transfer_and_sets_url() {
        let mut source = disk_image_source(QCOW2_HEAD, Arc::new(MockOps::default()));
        assert_eq!(source.get_url(), None);
        assert_eq!(source.info().unwrap(), ProcessingPhase::TransferDataFile);
        assert_eq!(
            source.get_url().unwrap().as_str(),
            "https://example.com/disk.qcow2"
        );
    }

    #[test]
    fn test_info_rejects_archive_content_before_classification() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut source = source_with(
            QCOW2_HEAD,
            "https://example.com/disk.qcow2",
            ContentType::Archive,
            None,
            Arc::new(MockOps::default()),
            reads.clone(),
            false,
        );
        assert!(matches!(
            source.info().unwrap_err(),
            Error::UnsupportedContentType(ContentType::Archive)
        ));
        // The gate fires before classification touches the stream.
        assert_eq!(reads.load(Ordering::SeqCst), 0);
        assert_eq!(source.get_url(), None);
    }

    #[test]
    fn test_transfer_invalid_scratch_path_never_invokes_converter() {
        let ops = Arc::new(MockOps::default());
        let mut source = disk_image_source(QCOW2_HEAD, ops.clone());
        source.info().unwrap();

        let scratch = Path::new("/no/such/scratch/dir");
        assert!(matches!(
            source.transfer(scratch).unwrap_err(),
            Error::InvalidPath(_)
        ));
        assert_eq!(ops.call_count(), 0);
        assert!(!scratch.join(TMP_IMPORT_FILE).exists());
    }

    #[test]
    fn test_transfer_targets_fixed_scratch_filename() {
        let ops = Arc::new(MockOps::default());
        let mut source = disk_image_source(QCOW2_HEAD, ops.clone());
        source.info().unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        assert_eq!(
            source.transfer(dir.path()).unwrap(),
            ProcessingPhase::Resize
        );

        let calls = ops.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].dest, dir.path().join(TMP_IMPORT_FILE));
        assert!(calls[0].filters.is_empty());
    }

    #[test]
    fn test_transfer_before_info_is_rejected() {
        let ops = Arc::new(MockOps::default());
        let mut source = disk_image_source(QCOW2_HEAD, ops.clone());
        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            source.transfer(dir.path()).unwrap_err(),
            Error::InvalidState(_)
        ));
        assert_eq!(ops.call_count(), 0);
    }

    #[test]
    fn test_transfer_file_adds_xz_filter_for_compressed_stream() {
        let ops = Arc::new(MockOps::default());
        let mut source = disk_image_source(XZ_HEAD, ops.clone());
        source.info().unwrap();

        assert_eq!(
            source.transfer_file(Path::new("/dev/vdb")).unwrap(),
            ProcessingPhase::Resize
        );
        let calls = ops.calls.lock().unwrap();
        assert_eq!(calls[0].filters, vec![NbdkitFilter::Xz]);
        assert_eq!(calls[0].cert_dir, None);
    }

    #[test]
    fn test_transfer_file_omits_filter_for_raw_stream() {
        let ops = Arc::new(MockOps::default());
        let mut source = disk_image_source(QCOW2_HEAD, ops.clone());
        source.info().unwrap();

        source.transfer_file(Path::new("/data/disk.img")).unwrap();
        assert!(ops.calls.lock().unwrap()[0].filters.is_empty());
    }

    #[test]
    fn test_transfer_file_carries_trust_material() {
        let ops = Arc::new(MockOps::default());
        let reads = Arc::new(AtomicUsize::new(0));
        let mut source = source_with(
            QCOW2_HEAD,
            "https://example.com/disk.qcow2",
            ContentType::DiskImage,
            Some(Path::new("/certs")),
            ops.clone(),
            reads,
            false,
        );
        source.info().unwrap();

        source.transfer_file(Path::new("/data/disk.img")).unwrap();
        assert_eq!(
            ops.calls.lock().unwrap()[0].cert_dir,
            Some(PathBuf::from("/certs"))
        );
    }

    #[test]
    fn test_conversion_failure_surfaces_as_error() {
        let ops = Arc::new(MockOps::failing());
        let mut source = disk_image_source(QCOW2_HEAD, ops);
        source.info().unwrap();

        let dir = tempfile::TempDir::new().unwrap();
        assert!(matches!(
            source.transfer(dir.path()).unwrap_err(),
            Error::ConversionFailed(_)
        ));
    }

    #[test]
    fn test_process_always_converts() {
        let mut source = disk_image_source(QCOW2_HEAD, Arc::new(MockOps::default()));
        assert_eq!(source.process().unwrap(), ProcessingPhase::Convert);
    }

    #[test]
    fn test_close_twice_reports_release_error_once() {
        let reads = Arc::new(AtomicUsize::new(0));
        let mut source = source_with(
            QCOW2_HEAD,
            "https://example.com/disk.qcow2",
            ContentType::DiskImage,
            None,
            Arc::new(MockOps::default()),
            reads,
            true,
        );
        source.info().unwrap();

        assert!(matches!(
            source.close().unwrap_err(),
            Error::ResourceReleaseFailed(_)
        ));
        assert!(source.close().is_ok());
    }

    #[test]
    fn test_close_before_info_releases_raw_reader() {
        let mut source = disk_image_source(QCOW2_HEAD, Arc::new(MockOps::default()));
        assert!(source.close().is_ok());
        assert!(source.close().is_ok());
        // info can no longer run against a closed source.
        assert!(matches!(
            source.info().unwrap_err(),
            Error::InvalidState(_)
        ));
    }

    #[test]
    fn test_cancel_once_fires_exactly_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let cancel = Arc::new(CancelOnce::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cancel = cancel.clone();
                std::thread::spawn(move || cancel.cancel())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        cancel.cancel();

        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classification_survives_for_later_phases() {
        let ops = Arc::new(MockOps::default());
        let mut source = disk_image_source(XZ_HEAD, ops);
        source.info().unwrap();
        assert_eq!(
            source.readers.as_ref().unwrap().compression(),
            CompressionFormat::Xz
        );
    }
}
