//! Transfer orchestration.
//!
//! `start` runs in the message handler: it decides whether an update request
//! is accepted and hands accepted ones to the worker through a signal.
//! `next_transfer` is the worker body. It pulls chunks one round trip at a
//! time until the image is complete or the overall deadline passes.

use core::cell::RefCell;

use embassy_sync::blocking_mutex::Mutex as BlockingMutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_sync::signal::Signal;
use embassy_time::{Instant, with_timeout};
use log::{debug, error, info, warn};
use myrtio_dfu::{DfuManager, DfuStorage, DigestEngine, ImageWriter};

use crate::config::{CHUNK_BUFSIZE, MAX_CHUNK_SIZE, OtaConfig, PAYLOAD_BUFSIZE};
use crate::error::OtaError;
use crate::inbox::OtaInbox;
use crate::model::{OtaMessage, Phase, UpdateTarget};
use crate::parser::OtaParser;
use crate::transport::OtaTransport;

/// What `start` did with a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// Requested version is already running
    UpToDate,
    /// Transfer handed to the worker
    Scheduled,
    /// Another transfer is in flight, request dropped
    Busy,
}

/// Result of one worker run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// New image is armed; the device must reboot to apply it
    RebootRequired,
    /// Attempt abandoned, running version reported back
    Failed(OtaError),
}

struct TransferState {
    active: bool,
    phase: Phase,
    target: Option<UpdateTarget>,
}

pub struct Ota<'a, S, D, T, P> {
    version: &'a str,
    config: OtaConfig,
    dfu: Mutex<CriticalSectionRawMutex, DfuManager<S, D>>,
    transport: T,
    parser: P,
    inbox: &'a OtaInbox,
    state: BlockingMutex<CriticalSectionRawMutex, RefCell<TransferState>>,
    job: Signal<CriticalSectionRawMutex, ()>,
}

impl<'a, S, D, T, P> Ota<'a, S, D, T, P>
where
    S: DfuStorage,
    D: DigestEngine,
    T: OtaTransport,
    P: OtaParser,
{
    pub fn new(
        version: &'a str,
        config: OtaConfig,
        dfu: DfuManager<S, D>,
        transport: T,
        parser: P,
        inbox: &'a OtaInbox,
    ) -> Self {
        Self {
            version,
            config,
            dfu: Mutex::new(dfu),
            transport,
            parser,
            inbox,
            state: BlockingMutex::new(RefCell::new(TransferState {
                active: false,
                phase: Phase::Idle,
                target: None,
            })),
            job: Signal::new(),
        }
    }

    pub fn version(&self) -> &str {
        self.version
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn phase(&self) -> Phase {
        self.state.lock(|cell| cell.borrow().phase)
    }

    pub fn is_active(&self) -> bool {
        self.state.lock(|cell| cell.borrow().active)
    }

    pub fn target(&self) -> Option<UpdateTarget> {
        self.state.lock(|cell| cell.borrow().target.clone())
    }

    /// Exclusive access to the DFU manager. Flash work runs under this lock,
    /// outside of any critical section.
    pub async fn dfu(&self) -> MutexGuard<'_, CriticalSectionRawMutex, DfuManager<S, D>> {
        self.dfu.lock().await
    }

    /// Report the running version, once at startup
    pub async fn announce(&self) -> Result<(), OtaError> {
        info!("ota: running version {}", self.version);
        self.report_version().await
    }

    /// Handle an update request from the controller
    pub async fn start(&self, msg: &[u8]) -> Result<StartOutcome, OtaError> {
        let mut scratch = [0u8; CHUNK_BUFSIZE];
        let target = match self.parser.decode(msg, &mut scratch) {
            Ok(OtaMessage::Request(target)) => target,
            Ok(OtaMessage::Chunk(chunk)) => {
                error!("ota: expected update request, got chunk #{}", chunk.index);
                return Err(OtaError::UnexpectedMessage);
            }
            Err(e) => {
                error!("ota: cannot decode update request: {}", e);
                return Err(e.into());
            }
        };

        if target.version.as_str() == self.version {
            {
                let mut dfu = self.dfu().await;
                if let Err(e) = dfu.finish() {
                    error!("ota: cannot finish update counter: {}", e);
                }
                info!(
                    "ota: {} is up to date. errors/updates: {}/{}",
                    self.version,
                    dfu.count_error().unwrap_or_default(),
                    dfu.count().unwrap_or_default()
                );
            }
            self.report_version().await?;
            return Ok(StartOutcome::UpToDate);
        }

        let version = target.version.clone();
        let (file_size, force) = (target.file_size, target.force);
        let accepted = self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if state.active {
                return false;
            }
            state.active = true;
            state.phase = Phase::Requesting;
            state.target = Some(target);
            true
        });
        if !accepted {
            warn!("ota: update to {} ignored, transfer in progress", version);
            return Ok(StartOutcome::Busy);
        }

        info!(
            "ota: update to {} requested, {} bytes{}",
            version,
            file_size,
            if force { ", forced" } else { "" }
        );
        self.job.signal(());
        Ok(StartOutcome::Scheduled)
    }

    /// Wait for an accepted request and run its transfer.
    ///
    /// On `RebootRequired` the transfer stays marked active so no other
    /// request is accepted before the reset.
    pub async fn next_transfer(&self) -> TransferOutcome {
        self.job.wait().await;

        match self.transfer().await {
            Ok(()) => {
                self.set_phase(Phase::Applying);
                info!("ota: update armed, reboot required");
                TransferOutcome::RebootRequired
            }
            Err(e) => {
                error!("ota: update failed: {}", e);
                self.set_phase(Phase::Failed);
                if let Err(e) = self.report_version().await {
                    warn!("ota: cannot report version: {}", e);
                }
                self.state.lock(|cell| {
                    let mut state = cell.borrow_mut();
                    state.active = false;
                    state.phase = Phase::Idle;
                    state.target = None;
                });
                TransferOutcome::Failed(e)
            }
        }
    }

    async fn transfer(&self) -> Result<(), OtaError> {
        let mut writer = self.dfu().await.begin()?;
        let result = self.session(&mut writer).await;
        if let Err(e) = self.dfu().await.end(writer) {
            warn!("ota: cannot close dfu session: {}", e);
        }
        result
    }

    async fn session(&self, writer: &mut ImageWriter) -> Result<(), OtaError> {
        self.inbox.clear();
        self.transport.prepare().await?;
        let result = self.download(writer).await;
        if let Err(e) = self.transport.finish().await {
            warn!("ota: cannot release transport: {}", e);
        }
        result
    }

    async fn download(&self, writer: &mut ImageWriter) -> Result<(), OtaError> {
        self.request_chunk(true).await?;
        self.set_phase(Phase::Downloading);

        let deadline = Instant::now() + self.config.transfer_timeout;
        let mut scratch = [0u8; CHUNK_BUFSIZE];
        while Instant::now() < deadline {
            match with_timeout(self.config.rtt_timeout, self.inbox.receive()).await {
                Ok(message) => self.accept_chunk(&message, &mut scratch, writer).await,
                Err(_) => error!("ota: timed out"),
            }

            let (downloaded, total, complete) = self.progress();
            if complete {
                return self.finalize(writer).await;
            }
            if let Err(e) = self.request_chunk(false).await {
                warn!("ota: cannot request next chunk: {}", e);
            }
            info!("ota: {}/{} bytes downloaded", downloaded, total);
        }

        Err(OtaError::Timeout)
    }

    /// Decode, check and store one inbound message. Rejections only log;
    /// the next request asks for the same index again.
    async fn accept_chunk(&self, message: &[u8], scratch: &mut [u8], writer: &mut ImageWriter) {
        let chunk = match self.parser.decode(message, scratch) {
            Ok(OtaMessage::Chunk(chunk)) => chunk,
            Ok(OtaMessage::Request(_)) => {
                error!("ota: unexpected update request during transfer");
                return;
            }
            Err(e) => {
                error!("ota: cannot decode chunk: {}", e);
                return;
            }
        };

        let verdict = self.state.lock(|cell| {
            cell.borrow()
                .target
                .as_ref()
                .map(|target| target.check_chunk(&chunk))
        });
        match verdict {
            Some(Ok(())) => {}
            Some(Err(rejection)) => {
                error!("ota: chunk rejected: {}", rejection);
                return;
            }
            None => return,
        }

        debug!("ota: chunk #{} arrived, {} bytes", chunk.index, chunk.data.len());
        if let Err(e) = self.dfu().await.write(writer, chunk.data) {
            error!("ota: cannot store chunk #{}: {}", chunk.index, e);
            return;
        }

        self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            if let Some(target) = state.target.as_mut() {
                target.chunk_index += 1;
            }
        });
    }

    async fn finalize(&self, writer: &ImageWriter) -> Result<(), OtaError> {
        self.set_phase(Phase::Validating);
        let mut dfu = self.dfu().await;
        let result = dfu.validate(writer).and_then(|_| dfu.register(writer));
        let count = dfu.count().unwrap_or_default();
        match result {
            Ok(()) => {
                info!("ota: DFU #{} requested", count);
                Ok(())
            }
            Err(e) => {
                error!("ota: DFU #{} failed: {}", count, e);
                if let Err(e) = dfu.record_error() {
                    warn!("ota: cannot record error: {}", e);
                }
                Err(OtaError::Dfu(e))
            }
        }
    }

    /// Send the current target as a chunk request. The initial request
    /// settles the chunk size and restarts from chunk 1.
    async fn request_chunk(&self, initial: bool) -> Result<(), OtaError> {
        let mut buf = [0u8; PAYLOAD_BUFSIZE];
        let len = self.state.lock(|cell| {
            let mut state = cell.borrow_mut();
            let target = state.target.as_mut().ok_or(OtaError::NoTarget)?;
            if initial {
                target.chunk_size =
                    negotiate_chunk_size(target.chunk_size, self.config.default_chunk_size);
                target.chunk_index = 1;
            }
            self.parser.encode(target, &mut buf).map_err(OtaError::from)
        })?;

        self.transport.request(&buf[..len]).await?;
        Ok(())
    }

    async fn report_version(&self) -> Result<(), OtaError> {
        let target = UpdateTarget::version_only(self.version)?;
        let mut buf = [0u8; PAYLOAD_BUFSIZE];
        let len = self.parser.encode(&target, &mut buf)?;
        self.transport.report(&buf[..len]).await?;
        Ok(())
    }

    fn progress(&self) -> (u32, u32, bool) {
        self.state.lock(|cell| {
            cell.borrow()
                .target
                .as_ref()
                .map(|target| {
                    (
                        target.downloaded().min(target.file_size),
                        target.file_size,
                        target.is_complete(),
                    )
                })
                .unwrap_or_default()
        })
    }

    fn set_phase(&self, phase: Phase) {
        self.state.lock(|cell| cell.borrow_mut().phase = phase);
    }
}

#[allow(clippy::cast_possible_truncation)]
fn negotiate_chunk_size(requested: u16, fallback: u16) -> u16 {
    let size = if requested == 0 { fallback } else { requested };
    size.clamp(1, MAX_CHUNK_SIZE as u16)
}
