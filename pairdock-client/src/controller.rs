use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use pairdock_core::{
    ConnectionStatus, DEFAULT_SERVER_PORT, PairingPayloadBuilder, PayloadError, SecretStore,
    StatusDescriptor, describe, secret_fingerprint,
};
use thiserror::Error;
use tokio::{
    runtime::Handle,
    sync::{mpsc, watch},
    time::Instant,
};
use tracing::{debug, info, warn};

use crate::{
    address::AddressResolver,
    clipboard::ClipboardSink,
    confirmation::{COPY_CONFIRMATION_MESSAGE, COPY_CONFIRMATION_TTL, CopyConfirmation},
    render::{
        ApplyResult, CodeDisplay, CodeEncoder, CodeRenderer, DisplayedCode, RenderOptions,
        RenderOutcome,
    },
};

pub const GENERATING_MESSAGE: &str = "Generating QR…";
pub const PAYLOAD_UNAVAILABLE_MESSAGE: &str = "That doesn't look right, QR Generation failed";

/// Runtime state the payload is derived from. Changes take effect on the
/// next regeneration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingSettings {
    pub port: Option<u16>,
    pub device_name: Option<String>,
    pub network_adapter: Option<String>,
    pub plus: bool,
}

impl Default for PairingSettings {
    fn default() -> Self {
        Self {
            port: Some(DEFAULT_SERVER_PORT),
            device_name: None,
            network_adapter: None,
            plus: false,
        }
    }
}

/// One-shot "regenerate the code" flag, set by collaborators such as a
/// network-change watcher. Setting it twice before it is consumed has the
/// same effect as setting it once.
#[derive(Debug, Clone, Default)]
pub struct RefreshSignal(Arc<AtomicBool>);

impl RefreshSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn request(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    fn take(&self) -> bool {
        self.0.swap(false, Ordering::AcqRel)
    }
}

pub struct Collaborators {
    pub secrets: Arc<SecretStore>,
    pub addresses: Arc<dyn AddressResolver>,
    pub clipboard: Arc<dyn ClipboardSink>,
    pub encoder: Arc<dyn CodeEncoder>,
    pub status: watch::Receiver<ConnectionStatus>,
}

#[derive(Debug, Clone)]
pub struct ScreenOptions {
    pub payload: PairingPayloadBuilder,
    pub render: RenderOptions,
    pub copy_ttl: Duration,
}

impl Default for ScreenOptions {
    fn default() -> Self {
        Self {
            payload: PairingPayloadBuilder::new(),
            render: RenderOptions::default(),
            copy_ttl: COPY_CONFIRMATION_TTL,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CopyError {
    #[error("no pairing key has been issued yet")]
    NoSecret,
    #[error("clipboard write failed: {0}")]
    Clipboard(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScreenUpdate {
    Code(ApplyResult),
    CopyExpired { cleared: bool },
}

/// Drives the pairing screen.
///
/// All methods run on the display context. Rendering and the copy-confirmation
/// timer run on the tokio runtime and report back through channels that
/// [`PairingScreenController::process_next_event`] and
/// [`PairingScreenController::drain_events`] consume.
pub struct PairingScreenController {
    secrets: Arc<SecretStore>,
    addresses: Arc<dyn AddressResolver>,
    clipboard: Arc<dyn ClipboardSink>,
    status: watch::Receiver<ConnectionStatus>,
    builder: PairingPayloadBuilder,
    settings: PairingSettings,
    refresh: RefreshSignal,
    renderer: CodeRenderer,
    render_rx: mpsc::UnboundedReceiver<RenderOutcome>,
    display: CodeDisplay,
    pending_token: Option<u64>,
    unavailable: Option<PayloadError>,
    copy: CopyConfirmation,
    copy_ttl: Duration,
    copy_tx: mpsc::UnboundedSender<u64>,
    copy_rx: mpsc::UnboundedReceiver<u64>,
    runtime: Handle,
}

impl PairingScreenController {
    pub fn new(
        collaborators: Collaborators,
        settings: PairingSettings,
        options: ScreenOptions,
        runtime: Handle,
    ) -> Self {
        let (render_tx, render_rx) = mpsc::unbounded_channel();
        let (copy_tx, copy_rx) = mpsc::unbounded_channel();
        let renderer = CodeRenderer::new(
            collaborators.encoder,
            options.render,
            runtime.clone(),
            render_tx,
        );

        Self {
            secrets: collaborators.secrets,
            addresses: collaborators.addresses,
            clipboard: collaborators.clipboard,
            status: collaborators.status,
            builder: options.payload,
            settings,
            refresh: RefreshSignal::new(),
            renderer,
            render_rx,
            display: CodeDisplay::new(),
            pending_token: None,
            unavailable: None,
            copy: CopyConfirmation::new(),
            copy_ttl: options.copy_ttl,
            copy_tx,
            copy_rx,
            runtime,
        }
    }

    pub fn on_mount(&mut self) -> Option<u64> {
        debug!("pairing screen mounted");
        self.regenerate()
    }

    pub fn on_tap(&mut self) -> Option<u64> {
        self.regenerate()
    }

    /// Regenerates if the refresh signal was raised since the last poll.
    pub fn poll_refresh_signal(&mut self) -> bool {
        if !self.refresh.take() {
            return false;
        }
        debug!("external refresh requested");
        self.regenerate();
        true
    }

    pub fn refresh_signal(&self) -> RefreshSignal {
        self.refresh.clone()
    }

    /// Checks the endpoint and submits the payload for rendering. The secret
    /// is read, and issued if needed, on the render worker.
    /// Returns the render token, or `None` when no endpoint is known.
    pub fn regenerate(&mut self) -> Option<u64> {
        let address = self
            .addresses
            .resolve_local_address(self.settings.network_adapter.as_deref());

        let (address, port) = match self.builder.endpoint(address.as_deref(), self.settings.port)
        {
            Ok((address, port)) => (address.to_owned(), port),
            Err(err) => {
                warn!("cannot build pairing payload: {}", err);
                // Nothing in flight may land on screen for an endpoint we no
                // longer have.
                self.renderer.invalidate();
                self.display.clear();
                self.pending_token = None;
                self.unavailable = Some(err);
                return None;
            }
        };

        self.unavailable = None;
        let secrets = Arc::clone(&self.secrets);
        let builder = self.builder.clone();
        let device_name = self.settings.device_name.clone();
        let plus = self.settings.plus;
        let log_address = address.clone();
        let token = self.renderer.request_render_with(move || {
            let secret = secrets.get();
            debug!(fingerprint = %secret_fingerprint(&secret), "composing pairing payload");
            let payload = builder.build_string(
                Some(&address),
                Some(port),
                device_name.as_deref(),
                plus,
                &secret,
            )?;
            Ok(payload)
        });
        self.pending_token = Some(token);
        info!(token, address = %log_address, port, "pairing code requested");
        Some(token)
    }

    pub fn copy_secret(&mut self) -> Result<(), CopyError> {
        let secret = self
            .secrets
            .peek()
            .filter(|s| !s.is_empty())
            .ok_or(CopyError::NoSecret)?;
        if let Err(err) = self.clipboard.set_text(&secret) {
            warn!("copying pairing key failed: {}", err);
            return Err(CopyError::Clipboard(err));
        }

        let ticket = self.copy.show(COPY_CONFIRMATION_MESSAGE);
        let copy_tx = self.copy_tx.clone();
        // Deadline is fixed at copy time, not when the timer task first runs.
        let deadline = Instant::now() + self.copy_ttl;
        self.runtime.spawn(async move {
            tokio::time::sleep_until(deadline).await;
            let _ = copy_tx.send(ticket);
        });
        info!(fingerprint = %secret_fingerprint(&secret), "pairing key copied");
        Ok(())
    }

    /// Rotates the secret. Devices paired with the old one must pair again.
    pub fn reset_secret(&mut self) -> Option<u64> {
        let previous = self.secrets.peek().map(|s| secret_fingerprint(&s));
        self.secrets.reset();
        info!(previous = ?previous, "pairing key reset");
        self.regenerate()
    }

    /// Waits for the next render result or copy timer and applies it.
    pub async fn process_next_event(&mut self) -> Option<ScreenUpdate> {
        tokio::select! {
            Some(outcome) = self.render_rx.recv() => Some(self.apply_render(outcome)),
            Some(ticket) = self.copy_rx.recv() => Some(self.apply_copy_expiry(ticket)),
            else => None,
        }
    }

    /// Applies everything already delivered without waiting.
    pub fn drain_events(&mut self) -> Vec<ScreenUpdate> {
        let mut updates = Vec::new();
        while let Ok(outcome) = self.render_rx.try_recv() {
            updates.push(self.apply_render(outcome));
        }
        while let Ok(ticket) = self.copy_rx.try_recv() {
            updates.push(self.apply_copy_expiry(ticket));
        }
        updates
    }

    fn apply_render(&mut self, outcome: RenderOutcome) -> ScreenUpdate {
        let token = outcome.token;
        let result = self.display.apply(outcome, &self.renderer);
        if result != ApplyResult::Stale && self.pending_token == Some(token) {
            self.pending_token = None;
        }
        ScreenUpdate::Code(result)
    }

    fn apply_copy_expiry(&mut self, ticket: u64) -> ScreenUpdate {
        let cleared = self.copy.expire(ticket);
        if !cleared {
            debug!(ticket, "copy confirmation superseded");
        }
        ScreenUpdate::CopyExpired { cleared }
    }

    pub fn render_pending(&self) -> bool {
        self.pending_token.is_some()
    }

    pub fn displayed_code(&self) -> Option<&DisplayedCode> {
        self.display.current()
    }

    /// Text shown in place of the code, if any.
    pub fn placeholder(&self) -> Option<&'static str> {
        if self.unavailable.is_some() {
            Some(PAYLOAD_UNAVAILABLE_MESSAGE)
        } else if self.display.current().is_none() {
            Some(GENERATING_MESSAGE)
        } else {
            None
        }
    }

    pub fn unavailable_reason(&self) -> Option<&PayloadError> {
        self.unavailable.as_ref()
    }

    pub fn copy_available(&self) -> bool {
        self.secrets.peek().is_some_and(|s| !s.is_empty())
    }

    pub fn copy_message(&self) -> Option<&str> {
        self.copy.message()
    }

    /// False once every sender of the status feed is gone, i.e. nothing is
    /// reporting server state any more.
    pub fn status_feed_connected(&self) -> bool {
        self.status.has_changed().is_ok()
    }

    pub fn status(&self) -> StatusDescriptor {
        describe(&self.status.borrow())
    }

    /// Resolves when the connection server reports a new status; `None` once
    /// the server side has gone away.
    pub async fn next_status(&mut self) -> Option<StatusDescriptor> {
        self.status.changed().await.ok()?;
        Some(describe(&self.status.borrow_and_update()))
    }

    pub fn settings(&self) -> &PairingSettings {
        &self.settings
    }

    pub fn settings_mut(&mut self) -> &mut PairingSettings {
        &mut self.settings
    }

    pub fn renderer(&self) -> &CodeRenderer {
        &self.renderer
    }
}
