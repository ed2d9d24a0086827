//! End-to-end transfers against a scripted controller.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use embassy_futures::block_on;
use embassy_time::Duration;
use myrtio_dfu::loader::{self, BootOutcome};
use myrtio_dfu::{
    DfuError,
    DfuManager,
    FlashLayout,
    ImageHeader,
    NorFlashStorage,
    RamFlash,
    Region,
    Sha256Engine,
};
use myrtio_ota::{
    JsonParser,
    Ota,
    OtaConfig,
    OtaError,
    OtaInbox,
    OtaTransport,
    ParseError,
    Phase,
    StartOutcome,
    TransferOutcome,
    TransportError,
};

const RUNNING: &str = "1.2.3";
const RUNNING_REPORT: &str = r#"{"version":"1.2.3"}"#;

const LAYOUT: FlashLayout = FlashLayout::new(
    Region::new(0x0000, 0x1000),
    Region::new(0x1000, 0x7000),
    Region::new(0x8000, 0x8000),
);

type Storage = NorFlashStorage<RamFlash<0x10000, 4>>;
type TestOta<'a> = Ota<'a, Storage, Sha256Engine, &'a Controller<'a>, JsonParser>;

// -----------------------------------------------------------------------------
// Scripted controller: answers every chunk request with the next reply
// -----------------------------------------------------------------------------

struct Controller<'a> {
    inbox: &'a OtaInbox,
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<String>>,
    reports: Mutex<Vec<String>>,
    prepared: AtomicUsize,
    finished: AtomicUsize,
    refuse_prepare: AtomicBool,
    refuse_requests: AtomicBool,
}

impl<'a> Controller<'a> {
    fn new(inbox: &'a OtaInbox) -> Self {
        Self {
            inbox,
            replies: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            prepared: AtomicUsize::new(0),
            finished: AtomicUsize::new(0),
            refuse_prepare: AtomicBool::new(false),
            refuse_requests: AtomicBool::new(false),
        }
    }

    fn script(&self, replies: impl IntoIterator<Item = String>) {
        self.replies.lock().unwrap().extend(replies);
    }

    fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    fn reports(&self) -> Vec<String> {
        self.reports.lock().unwrap().clone()
    }
}

impl OtaTransport for &Controller<'_> {
    async fn prepare(&self) -> Result<(), TransportError> {
        self.prepared.fetch_add(1, Ordering::SeqCst);
        if self.refuse_prepare.load(Ordering::SeqCst) {
            return Err(TransportError::Prepare);
        }
        Ok(())
    }

    async fn finish(&self) -> Result<(), TransportError> {
        self.finished.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.refuse_requests.load(Ordering::SeqCst) {
            return Err(TransportError::Publish);
        }
        self.requests
            .lock()
            .unwrap()
            .push(String::from_utf8(data.to_vec()).unwrap());
        let reply = self.replies.lock().unwrap().pop_front();
        if let Some(reply) = reply {
            self.inbox.deliver(reply.as_bytes());
        }
        Ok(())
    }

    async fn report(&self, data: &[u8]) -> Result<(), TransportError> {
        self.reports
            .lock()
            .unwrap()
            .push(String::from_utf8(data.to_vec()).unwrap());
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Helpers
// -----------------------------------------------------------------------------

fn config() -> OtaConfig {
    OtaConfig {
        default_chunk_size: 128,
        rtt_timeout: Duration::from_millis(50),
        transfer_timeout: Duration::from_secs(5),
    }
}

fn ota<'a>(controller: &'a Controller<'a>, inbox: &'a OtaInbox, config: OtaConfig) -> TestOta<'a> {
    let dfu = DfuManager::new(
        NorFlashStorage::new(RamFlash::new()),
        Sha256Engine::new(),
        LAYOUT,
    )
    .unwrap();
    Ota::new(RUNNING, config, dfu, controller, JsonParser, inbox)
}

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 + 5) as u8).collect()
}

fn envelope(payload: &[u8]) -> Vec<u8> {
    let header = ImageHeader::seal(&mut Sha256Engine::new(), payload).unwrap();
    let mut image = header.as_bytes().to_vec();
    image.extend_from_slice(payload);
    image
}

fn chunk_message(index: usize, data: &[u8]) -> String {
    let mut encoded = vec![0u8; data.len().div_ceil(3) * 4];
    let len = STANDARD.encode_slice(data, &mut encoded).unwrap();
    format!(
        r#"{{"index":{},"data":"{}"}}"#,
        index,
        std::str::from_utf8(&encoded[..len]).unwrap()
    )
}

fn chunk_messages(image: &[u8], chunk_size: usize) -> Vec<String> {
    image
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, data)| chunk_message(i + 1, data))
        .collect()
}

fn update_request(version: &str, size: usize, chunk_size: u16) -> String {
    format!(
        r#"{{"version":"{}","size":{},"force":false,"packet_size":{}}}"#,
        version, size, chunk_size
    )
}

fn chunk_request(version: &str, chunk_size: u16, index: u32) -> String {
    format!(
        r#"{{"version":"{}","packet_size":{},"index":{}}}"#,
        version, chunk_size, index
    )
}

fn run_update(ota: &TestOta<'_>, request: &str) -> TransferOutcome {
    block_on(async {
        assert_eq!(
            ota.start(request.as_bytes()).await,
            Ok(StartOutcome::Scheduled)
        );
        ota.next_transfer().await
    })
}

// -----------------------------------------------------------------------------
// Startup and request handling
// -----------------------------------------------------------------------------

#[test]
fn announce_reports_running_version() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());

    block_on(ota.announce()).unwrap();

    assert_eq!(controller.reports(), vec![RUNNING_REPORT]);
    assert!(controller.requests().is_empty());
}

#[test]
fn same_version_finishes_pending_update_and_reports() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());
    {
        let mut dfu = block_on(ota.dfu());
        let writer = dfu.begin().unwrap();
        dfu.register(&writer).unwrap();
        dfu.end(writer).unwrap();
    }

    let outcome = block_on(ota.start(br#"{"version":"1.2.3","size":12345,"force":false}"#));

    assert_eq!(outcome, Ok(StartOutcome::UpToDate));
    assert_eq!(controller.reports(), vec![RUNNING_REPORT]);
    assert!(controller.requests().is_empty());
    assert_eq!(controller.prepared.load(Ordering::SeqCst), 0);
    assert_eq!(ota.phase(), Phase::Idle);
    assert!(!ota.is_active());
    let mut dfu = block_on(ota.dfu());
    assert!(!dfu.has_update().unwrap());
    assert_eq!(dfu.count().unwrap(), 1);
}

#[test]
fn malformed_requests_publish_nothing() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());

    let truncated = block_on(ota.start(br#"{"version":"1.2.3","size":12345,"}"#));
    let missing_force = block_on(ota.start(br#"{"version":"2.0.0","size":12345}"#));
    let missing_size = block_on(ota.start(br#"{"version":"2.0.0","force":true}"#));
    let chunk = block_on(ota.start(br#"{"index":1,"data":"AAAA"}"#));

    assert_eq!(truncated, Err(OtaError::Parse(ParseError::Malformed)));
    assert_eq!(
        missing_force,
        Err(OtaError::Parse(ParseError::MissingField("force")))
    );
    assert_eq!(
        missing_size,
        Err(OtaError::Parse(ParseError::MissingField("size")))
    );
    assert_eq!(chunk, Err(OtaError::UnexpectedMessage));
    assert!(controller.reports().is_empty());
    assert!(controller.requests().is_empty());
    assert_eq!(ota.phase(), Phase::Idle);
    assert!(ota.target().is_none());
}

#[test]
fn concurrent_requests_admit_exactly_one() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());

    let (first, second) = std::thread::scope(|scope| {
        let first = scope.spawn(|| block_on(ota.start(update_request("2.0.0", 4096, 128).as_bytes())));
        let second = scope.spawn(|| block_on(ota.start(update_request("3.0.0", 4096, 128).as_bytes())));
        (first.join().unwrap(), second.join().unwrap())
    });

    let winner = match (first, second) {
        (Ok(StartOutcome::Scheduled), Ok(StartOutcome::Busy)) => "2.0.0",
        (Ok(StartOutcome::Busy), Ok(StartOutcome::Scheduled)) => "3.0.0",
        other => panic!("expected one scheduled and one busy, got {:?}", other),
    };
    assert_eq!(ota.target().unwrap().version.as_str(), winner);
    assert_eq!(ota.phase(), Phase::Requesting);
    assert!(controller.requests().is_empty());
    assert!(controller.reports().is_empty());
}

// -----------------------------------------------------------------------------
// Transfers
// -----------------------------------------------------------------------------

#[test]
fn complete_transfer_arms_image_for_next_boot() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());
    let body = payload(1000);
    let image = envelope(&body);
    controller.script(chunk_messages(&image, 128));

    let outcome = run_update(&ota, &update_request("1.3.0", image.len(), 128));

    assert_eq!(outcome, TransferOutcome::RebootRequired);
    assert_eq!(ota.phase(), Phase::Applying);
    assert!(ota.is_active());
    assert!(controller.reports().is_empty());

    let requests = controller.requests();
    assert_eq!(requests.len(), 9);
    assert_eq!(requests[0], chunk_request("1.3.0", 128, 1));
    assert_eq!(requests[8], chunk_request("1.3.0", 128, 9));
    assert_eq!(controller.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(controller.finished.load(Ordering::SeqCst), 1);

    {
        let mut dfu = block_on(ota.dfu());
        let staged = &dfu.storage().flash().as_bytes()[0x1000..0x1000 + image.len()];
        assert_eq!(staged, &image[..]);
        assert!(dfu.has_update().unwrap());

        assert_eq!(loader::boot(&mut dfu), BootOutcome::Applied { size: 1000 });
        let app = &dfu.storage().flash().as_bytes()[0x8000..0x8000 + body.len()];
        assert_eq!(app, &body[..]);
    }

    let late = block_on(ota.start(update_request("1.4.0", 100, 128).as_bytes()));
    assert_eq!(late, Ok(StartOutcome::Busy));
}

#[test]
fn default_chunk_size_applies_when_unspecified() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());
    let image = envelope(&payload(200));
    controller.script(chunk_messages(&image, 128));

    let request = format!(
        r#"{{"version":"1.3.0","size":{},"force":true}}"#,
        image.len()
    );
    assert_eq!(run_update(&ota, &request), TransferOutcome::RebootRequired);
    assert_eq!(controller.requests()[0], chunk_request("1.3.0", 128, 1));
}

#[test]
fn duplicate_chunk_is_rejected_without_double_advance() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());
    let image = envelope(&payload(260));
    let chunks = chunk_messages(&image, 128);
    assert_eq!(chunks.len(), 3);
    controller.script([
        chunks[0].clone(),
        chunks[1].clone(),
        chunks[1].clone(),
        chunks[2].clone(),
    ]);

    let outcome = run_update(&ota, &update_request("1.3.0", image.len(), 128));

    assert_eq!(outcome, TransferOutcome::RebootRequired);
    assert_eq!(ota.target().unwrap().chunk_index, 4);
    assert_eq!(
        controller.requests(),
        vec![
            chunk_request("1.3.0", 128, 1),
            chunk_request("1.3.0", 128, 2),
            chunk_request("1.3.0", 128, 3),
            chunk_request("1.3.0", 128, 3),
        ]
    );
}

#[test]
fn short_chunk_before_the_last_is_rejected() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());
    let image = envelope(&payload(260));
    let chunks = chunk_messages(&image, 128);
    controller.script([
        chunk_message(1, &image[..100]),
        chunks[0].clone(),
        chunks[1].clone(),
        chunks[2].clone(),
    ]);

    let outcome = run_update(&ota, &update_request("1.3.0", image.len(), 128));

    assert_eq!(outcome, TransferOutcome::RebootRequired);
    let indices: Vec<_> = controller
        .requests()
        .iter()
        .map(|request| request.rsplit(':').next().unwrap().trim_end_matches('}').to_owned())
        .collect();
    assert_eq!(indices, ["1", "1", "2", "3"]);
}

#[test]
fn corrupted_image_is_reported_and_never_armed() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());
    let mut image = envelope(&payload(500));
    image[200] ^= 0x80;
    controller.script(chunk_messages(&image, 128));

    let outcome = run_update(&ota, &update_request("1.3.0", image.len(), 128));

    assert_eq!(
        outcome,
        TransferOutcome::Failed(OtaError::Dfu(DfuError::DigestMismatch))
    );
    assert_eq!(controller.reports(), vec![RUNNING_REPORT]);
    assert_eq!(controller.finished.load(Ordering::SeqCst), 1);
    assert_eq!(ota.phase(), Phase::Idle);
    assert!(!ota.is_active());
    assert!(ota.target().is_none());
    let mut dfu = block_on(ota.dfu());
    assert!(!dfu.has_update().unwrap());
    assert_eq!(dfu.count_error().unwrap(), 1);
}

#[test]
fn silent_controller_times_out_and_frees_the_slot() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(
        &controller,
        &inbox,
        OtaConfig {
            rtt_timeout: Duration::from_millis(20),
            transfer_timeout: Duration::from_millis(200),
            ..config()
        },
    );

    let outcome = run_update(&ota, &update_request("1.3.0", 4096, 128));

    assert_eq!(outcome, TransferOutcome::Failed(OtaError::Timeout));
    assert!(controller.requests().len() > 1);
    assert!(
        controller
            .requests()
            .iter()
            .all(|request| *request == chunk_request("1.3.0", 128, 1))
    );
    assert_eq!(controller.reports(), vec![RUNNING_REPORT]);
    assert_eq!(controller.finished.load(Ordering::SeqCst), 1);
    assert!(!ota.is_active());

    let retry = block_on(ota.start(update_request("1.3.0", 4096, 128).as_bytes()));
    assert_eq!(retry, Ok(StartOutcome::Scheduled));
}

#[test]
fn failed_flash_write_retries_the_same_index() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());
    let image = envelope(&payload(88));
    let chunks = chunk_messages(&image, 128);
    assert_eq!(chunks.len(), 1);
    controller.script([chunks[0].clone(), chunks[0].clone()]);

    // The staging block erase fails once, so the first copy is not stored
    block_on(ota.dfu())
        .storage_mut()
        .flash_mut()
        .fail_next_erases(1);
    let outcome = run_update(&ota, &update_request("1.3.0", image.len(), 128));

    assert_eq!(outcome, TransferOutcome::RebootRequired);
    assert_eq!(
        controller.requests(),
        vec![chunk_request("1.3.0", 128, 1), chunk_request("1.3.0", 128, 1)]
    );
    assert_eq!(ota.target().unwrap().chunk_index, 2);
}

#[test]
fn held_dfu_lock_does_not_block_request_handling() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    let ota = ota(&controller, &inbox, config());

    let dfu = block_on(ota.dfu());
    let outcome = std::thread::scope(|scope| {
        scope
            .spawn(|| block_on(ota.start(update_request("2.0.0", 4096, 128).as_bytes())))
            .join()
            .unwrap()
    });
    drop(dfu);

    assert_eq!(outcome, Ok(StartOutcome::Scheduled));
    assert_eq!(ota.phase(), Phase::Requesting);
}

// -----------------------------------------------------------------------------
// Transport failures
// -----------------------------------------------------------------------------

#[test]
fn unsent_initial_request_aborts_the_attempt() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    controller.refuse_requests.store(true, Ordering::SeqCst);
    let ota = ota(&controller, &inbox, config());

    let outcome = run_update(&ota, &update_request("1.3.0", 4096, 128));

    assert_eq!(
        outcome,
        TransferOutcome::Failed(OtaError::Transport(TransportError::Publish))
    );
    assert!(controller.requests().is_empty());
    assert_eq!(controller.reports(), vec![RUNNING_REPORT]);
    assert_eq!(controller.prepared.load(Ordering::SeqCst), 1);
    assert_eq!(controller.finished.load(Ordering::SeqCst), 1);
    assert!(!ota.is_active());
    assert_eq!(ota.phase(), Phase::Idle);
    assert!(ota.target().is_none());
    assert!(!block_on(ota.dfu()).has_update().unwrap());
}

#[test]
fn failed_prepare_aborts_without_finish() {
    let inbox = OtaInbox::new();
    let controller = Controller::new(&inbox);
    controller.refuse_prepare.store(true, Ordering::SeqCst);
    let ota = ota(&controller, &inbox, config());

    let outcome = run_update(&ota, &update_request("1.3.0", 4096, 128));

    assert_eq!(
        outcome,
        TransferOutcome::Failed(OtaError::Transport(TransportError::Prepare))
    );
    assert!(controller.requests().is_empty());
    assert_eq!(controller.reports(), vec![RUNNING_REPORT]);
    assert_eq!(controller.finished.load(Ordering::SeqCst), 0);
    assert!(!ota.is_active());
    assert!(ota.target().is_none());

    controller.refuse_prepare.store(false, Ordering::SeqCst);
    let retry = block_on(ota.start(update_request("1.3.0", 4096, 128).as_bytes()));
    assert_eq!(retry, Ok(StartOutcome::Scheduled));
}
