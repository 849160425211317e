use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use pairdock_client::{
    Collaborators, CopyError, PairingScreenController, PairingSettings, ScreenOptions,
    ScreenUpdate,
    address::{AddressResolver, StaticAddressResolver},
    clipboard::{ClipboardSink, MemoryClipboard},
    confirmation::COPY_CONFIRMATION_MESSAGE,
    controller::{GENERATING_MESSAGE, PAYLOAD_UNAVAILABLE_MESSAGE},
    render::{ApplyResult, QrPngEncoder},
};
use pairdock_core::{ConnectionStatus, PairingPayload, PairingPayloadBuilder, SecretStore, Severity};
use tokio::{
    runtime::Handle,
    sync::watch,
    time::{Instant, timeout},
};

/// Address that can change between refreshes, like a laptop switching networks.
#[derive(Default)]
struct MovableAddress(Mutex<Option<String>>);

impl MovableAddress {
    fn set(&self, address: Option<&str>) {
        *self.0.lock().unwrap() = address.map(str::to_owned);
    }
}

impl AddressResolver for MovableAddress {
    fn resolve_local_address(&self, _adapter_hint: Option<&str>) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

struct BrokenClipboard;

impl ClipboardSink for BrokenClipboard {
    fn set_text(&self, _value: &str) -> Result<(), String> {
        Err("pasteboard unavailable".to_owned())
    }
}

struct Harness {
    screen: PairingScreenController,
    secrets: Arc<SecretStore>,
    clipboard: Arc<MemoryClipboard>,
    status_tx: watch::Sender<ConnectionStatus>,
}

fn harness(addresses: Arc<dyn AddressResolver>, secrets: SecretStore) -> Harness {
    let secrets = Arc::new(secrets);
    let clipboard = Arc::new(MemoryClipboard::default());
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Stopped);
    let screen = PairingScreenController::new(
        Collaborators {
            secrets: Arc::clone(&secrets),
            addresses,
            clipboard: clipboard.clone(),
            encoder: Arc::new(QrPngEncoder),
            status: status_rx,
        },
        PairingSettings {
            port: Some(7010),
            device_name: Some("My Mac".to_owned()),
            network_adapter: None,
            plus: true,
        },
        ScreenOptions {
            payload: PairingPayloadBuilder::new().scheme("scheme"),
            ..ScreenOptions::default()
        },
        Handle::current(),
    );
    Harness {
        screen,
        secrets,
        clipboard,
        status_tx,
    }
}

fn lan_address() -> Arc<dyn AddressResolver> {
    Arc::new(StaticAddressResolver::new(Some("192.168.1.10".to_owned())))
}

async fn settle(screen: &mut PairingScreenController) {
    timeout(Duration::from_secs(10), async {
        while screen.render_pending() {
            screen.process_next_event().await.expect("event channels open");
        }
    })
    .await
    .expect("render settles");
}

fn displayed_payload(screen: &PairingScreenController) -> String {
    screen
        .displayed_code()
        .expect("a code is displayed")
        .payload
        .clone()
}

#[tokio::test]
async fn mount_renders_canonical_payload() {
    let mut h = harness(lan_address(), SecretStore::with_secret("QUJDRA=="));
    assert_eq!(h.screen.placeholder(), Some(GENERATING_MESSAGE));

    assert!(h.screen.on_mount().is_some());
    settle(&mut h.screen).await;

    assert_eq!(
        displayed_payload(&h.screen),
        "scheme://192.168.1.10:7010?name=My%20Mac?plus=true?key=QUJDRA=="
    );
    let code = h.screen.displayed_code().unwrap();
    assert_eq!(&code.bitmap.png[..4], b"\x89PNG");
    assert_eq!(h.screen.placeholder(), None);
}

#[tokio::test]
async fn mount_issues_secret_when_none_exists() {
    let mut h = harness(lan_address(), SecretStore::new());
    assert!(!h.screen.copy_available());

    h.screen.on_mount();
    settle(&mut h.screen).await;

    let secret = h.secrets.peek().expect("secret issued on mount");
    let parsed: PairingPayload = displayed_payload(&h.screen).parse().unwrap();
    assert_eq!(parsed.secret(), secret);
    assert!(h.screen.copy_available());
}

#[tokio::test]
async fn missing_address_shows_placeholder_and_renders_nothing() {
    let mut h = harness(
        Arc::new(StaticAddressResolver::new(None)),
        SecretStore::with_secret("QUJDRA=="),
    );

    assert_eq!(h.screen.on_mount(), None);
    assert!(!h.screen.render_pending());
    assert!(h.screen.drain_events().is_empty());
    assert!(h.screen.displayed_code().is_none());
    assert_eq!(h.screen.placeholder(), Some(PAYLOAD_UNAVAILABLE_MESSAGE));
}

#[tokio::test]
async fn missing_port_shows_placeholder() {
    let mut h = harness(lan_address(), SecretStore::with_secret("QUJDRA=="));
    h.screen.settings_mut().port = None;

    assert_eq!(h.screen.on_tap(), None);
    assert_eq!(h.screen.placeholder(), Some(PAYLOAD_UNAVAILABLE_MESSAGE));
}

#[tokio::test]
async fn losing_the_network_clears_the_old_code() {
    let addresses = Arc::new(MovableAddress::default());
    addresses.set(Some("10.0.0.5"));
    let mut h = harness(addresses.clone(), SecretStore::with_secret("QUJDRA=="));

    h.screen.on_mount();
    settle(&mut h.screen).await;
    assert!(h.screen.displayed_code().is_some());

    addresses.set(None);
    h.screen.on_tap();
    assert!(h.screen.displayed_code().is_none());
    assert_eq!(h.screen.placeholder(), Some(PAYLOAD_UNAVAILABLE_MESSAGE));
}

#[tokio::test]
async fn refresh_signal_regenerates_once() {
    let addresses = Arc::new(MovableAddress::default());
    addresses.set(Some("10.0.0.5"));
    let mut h = harness(addresses.clone(), SecretStore::with_secret("QUJDRA=="));
    let signal = h.screen.refresh_signal();

    h.screen.on_mount();
    settle(&mut h.screen).await;
    assert!(displayed_payload(&h.screen).contains("10.0.0.5:7010"));

    assert!(!h.screen.poll_refresh_signal());

    addresses.set(Some("192.168.50.2"));
    signal.request();
    signal.request();
    assert!(signal.is_pending());
    assert!(h.screen.poll_refresh_signal());
    assert!(!signal.is_pending());
    assert!(!h.screen.poll_refresh_signal());

    settle(&mut h.screen).await;
    assert!(displayed_payload(&h.screen).contains("192.168.50.2:7010"));
}

#[tokio::test]
async fn rapid_taps_settle_on_the_last_request() {
    let addresses = Arc::new(MovableAddress::default());
    addresses.set(Some("10.0.0.1"));
    let mut h = harness(addresses.clone(), SecretStore::with_secret("QUJDRA=="));

    h.screen.on_mount();
    addresses.set(Some("10.0.0.2"));
    h.screen.on_tap();
    addresses.set(Some("10.0.0.3"));
    let last = h.screen.on_tap().unwrap();

    let mut applied = Vec::new();
    timeout(Duration::from_secs(10), async {
        while h.screen.render_pending() {
            if let Some(ScreenUpdate::Code(ApplyResult::Applied)) =
                h.screen.process_next_event().await
            {
                applied.push(displayed_payload(&h.screen));
            }
        }
    })
    .await
    .expect("render settles");

    assert_eq!(applied.len(), 1);
    assert!(applied[0].contains("10.0.0.3:7010"));
    assert_eq!(h.screen.displayed_code().unwrap().token, last);
}

#[tokio::test]
async fn reset_rotates_secret_and_rerenders() {
    let mut h = harness(lan_address(), SecretStore::with_secret("QUJDRA=="));
    h.screen.on_mount();
    settle(&mut h.screen).await;
    let before = displayed_payload(&h.screen);

    assert!(h.screen.reset_secret().is_some());
    settle(&mut h.screen).await;

    let after: PairingPayload = displayed_payload(&h.screen).parse().unwrap();
    assert_ne!(after.secret(), "QUJDRA==");
    assert_eq!(Some(after.secret().to_owned()), h.secrets.peek());
    assert_ne!(displayed_payload(&h.screen), before);
}

#[tokio::test]
async fn copy_puts_secret_on_clipboard() {
    let mut h = harness(lan_address(), SecretStore::with_secret("QUJDRA=="));
    h.screen.copy_secret().unwrap();
    assert_eq!(h.clipboard.contents().as_deref(), Some("QUJDRA=="));
    assert_eq!(h.screen.copy_message(), Some(COPY_CONFIRMATION_MESSAGE));
}

#[tokio::test]
async fn copy_without_secret_is_refused() {
    let mut h = harness(lan_address(), SecretStore::new());
    assert_eq!(h.screen.copy_secret(), Err(CopyError::NoSecret));
    assert!(h.clipboard.contents().is_none());
    assert!(h.screen.copy_message().is_none());
}

#[tokio::test]
async fn clipboard_failure_shows_no_confirmation() {
    let (_status_tx, status_rx) = watch::channel(ConnectionStatus::Stopped);
    let mut screen = PairingScreenController::new(
        Collaborators {
            secrets: Arc::new(SecretStore::with_secret("QUJDRA==")),
            addresses: lan_address(),
            clipboard: Arc::new(BrokenClipboard),
            encoder: Arc::new(QrPngEncoder),
            status: status_rx,
        },
        PairingSettings::default(),
        ScreenOptions::default(),
        Handle::current(),
    );

    assert!(matches!(screen.copy_secret(), Err(CopyError::Clipboard(_))));
    assert!(screen.copy_message().is_none());
}

#[tokio::test(start_paused = true)]
async fn later_copy_keeps_confirmation_for_its_full_duration() {
    let mut h = harness(lan_address(), SecretStore::with_secret("QUJDRA=="));
    let start = Instant::now();

    h.screen.copy_secret().unwrap();
    assert_eq!(h.screen.copy_message(), Some(COPY_CONFIRMATION_MESSAGE));

    tokio::time::advance(Duration::from_millis(1000)).await;
    h.screen.copy_secret().unwrap();

    tokio::time::advance(Duration::from_millis(1000)).await;
    h.screen.drain_events();
    assert_eq!(h.screen.copy_message(), Some(COPY_CONFIRMATION_MESSAGE));

    // First copy's timer fires at 2.5 and must not clear the newer message.
    let update = h.screen.process_next_event().await;
    assert_eq!(update, Some(ScreenUpdate::CopyExpired { cleared: false }));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(2500), "{elapsed:?}");
    assert!(elapsed < Duration::from_millis(3500), "{elapsed:?}");
    assert_eq!(h.screen.copy_message(), Some(COPY_CONFIRMATION_MESSAGE));

    let update = h.screen.process_next_event().await;
    assert_eq!(update, Some(ScreenUpdate::CopyExpired { cleared: true }));
    let elapsed = start.elapsed();
    assert!(elapsed >= Duration::from_millis(3500), "{elapsed:?}");
    assert!(elapsed <= Duration::from_millis(3600), "{elapsed:?}");
    assert!(h.screen.copy_message().is_none());
}

#[tokio::test]
async fn status_follows_connection_server() {
    let mut h = harness(lan_address(), SecretStore::new());
    assert_eq!(h.screen.status().text, "Stopped");

    h.status_tx.send(ConnectionStatus::Starting).unwrap();
    let descriptor = h.screen.next_status().await.unwrap();
    assert_eq!(descriptor.text, "Starting...");
    assert_eq!(descriptor.severity, Severity::Informational);

    h.status_tx
        .send(ConnectionStatus::failed("address already in use"))
        .unwrap();
    let descriptor = h.screen.next_status().await.unwrap();
    assert_eq!(descriptor.text, "Failed: address already in use");
    assert_eq!(descriptor.severity.color_token(), "red");

    assert!(h.screen.status_feed_connected());
    drop(h.status_tx);
    assert!(!h.screen.status_feed_connected());
    assert!(h.screen.next_status().await.is_none());
}

#[tokio::test]
async fn device_name_is_embedded_verbatim() {
    let mut h = harness(lan_address(), SecretStore::with_secret("QUJDRA=="));
    h.screen.settings_mut().device_name = Some(" Studio Mac ".to_owned());

    h.screen.on_tap();
    settle(&mut h.screen).await;

    let parsed: PairingPayload = displayed_payload(&h.screen).parse().unwrap();
    assert_eq!(parsed.device_name(), " Studio Mac ");
}
