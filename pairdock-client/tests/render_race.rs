use std::{collections::HashMap, sync::Arc, time::Duration};

use pairdock_client::render::{
    ApplyResult, CodeDisplay, CodeEncoder, CodeRenderer, RenderError, RenderOptions,
    RenderedBitmap,
};
use tokio::{runtime::Handle, sync::mpsc, time::timeout};

/// Echoes the payload as the "bitmap", sleeping per payload to force a
/// completion order.
#[derive(Default)]
struct ScriptedEncoder {
    delays: HashMap<&'static str, Duration>,
    failing: Vec<&'static str>,
}

impl CodeEncoder for ScriptedEncoder {
    fn encode(&self, text: &str, _options: &RenderOptions) -> Result<RenderedBitmap, RenderError> {
        if let Some(delay) = self.delays.get(text) {
            std::thread::sleep(*delay);
        }
        if self.failing.iter().any(|f| *f == text) {
            return Err(RenderError::Worker(format!("scripted failure for {text}")));
        }
        Ok(RenderedBitmap {
            png: text.as_bytes().to_vec(),
            width: 1,
            height: 1,
        })
    }
}

fn renderer_with(
    encoder: ScriptedEncoder,
) -> (CodeRenderer, mpsc::UnboundedReceiver<pairdock_client::render::RenderOutcome>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let renderer = CodeRenderer::new(
        Arc::new(encoder),
        RenderOptions::default(),
        Handle::current(),
        tx,
    );
    (renderer, rx)
}

async fn apply_all(
    renderer: &CodeRenderer,
    rx: &mut mpsc::UnboundedReceiver<pairdock_client::render::RenderOutcome>,
    display: &mut CodeDisplay,
    count: usize,
    latest_payload: &str,
) -> Vec<(u64, ApplyResult)> {
    let mut results = Vec::new();
    for _ in 0..count {
        let outcome = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("render finishes")
            .expect("channel open");
        let token = outcome.token;
        results.push((token, display.apply(outcome, renderer)));
        if let Some(current) = display.current() {
            assert_eq!(current.payload, latest_payload, "stale code reached the display");
        }
    }
    results
}

#[tokio::test]
async fn newer_request_wins_when_older_finishes_last() {
    let encoder = ScriptedEncoder {
        delays: HashMap::from([("first", Duration::from_millis(200))]),
        ..ScriptedEncoder::default()
    };
    let (renderer, mut rx) = renderer_with(encoder);
    let mut display = CodeDisplay::new();

    let t1 = renderer.request_render("first");
    let t2 = renderer.request_render("second");
    assert!(t2 > t1);

    let results = apply_all(&renderer, &mut rx, &mut display, 2, "second").await;
    assert_eq!(results, vec![(t2, ApplyResult::Applied), (t1, ApplyResult::Stale)]);
    assert_eq!(display.current().map(|c| c.token), Some(t2));
}

#[tokio::test]
async fn older_result_arriving_first_is_discarded() {
    let encoder = ScriptedEncoder {
        delays: HashMap::from([("second", Duration::from_millis(200))]),
        ..ScriptedEncoder::default()
    };
    let (renderer, mut rx) = renderer_with(encoder);
    let mut display = CodeDisplay::new();

    let t1 = renderer.request_render("first");
    let t2 = renderer.request_render("second");

    let results = apply_all(&renderer, &mut rx, &mut display, 2, "second").await;
    assert_eq!(results, vec![(t1, ApplyResult::Stale), (t2, ApplyResult::Applied)]);
}

#[tokio::test]
async fn failed_render_keeps_previous_code() {
    let encoder = ScriptedEncoder {
        failing: vec!["broken"],
        ..ScriptedEncoder::default()
    };
    let (renderer, mut rx) = renderer_with(encoder);
    let mut display = CodeDisplay::new();

    renderer.request_render("good");
    apply_all(&renderer, &mut rx, &mut display, 1, "good").await;

    let failed = renderer.request_render("broken");
    let outcome = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("render finishes")
        .expect("channel open");
    assert_eq!(outcome.token, failed);
    assert_eq!(display.apply(outcome, &renderer), ApplyResult::Failed);
    assert_eq!(display.current().map(|c| c.payload.as_str()), Some("good"));
}

#[tokio::test]
async fn invalidate_voids_in_flight_render() {
    let (renderer, mut rx) = renderer_with(ScriptedEncoder::default());
    let mut display = CodeDisplay::new();

    let token = renderer.request_render("orphan");
    assert!(renderer.invalidate() > token);

    let outcome = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("render finishes")
        .expect("channel open");
    assert_eq!(display.apply(outcome, &renderer), ApplyResult::Stale);
    assert!(display.current().is_none());
}

#[tokio::test]
async fn composed_payload_is_built_on_the_worker() {
    let (renderer, mut rx) = renderer_with(ScriptedEncoder::default());
    let mut display = CodeDisplay::new();
    let caller = std::thread::current().id();

    let token = renderer.request_render_with(move || {
        assert_ne!(std::thread::current().id(), caller);
        Ok("composed".to_owned())
    });

    let outcome = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("render finishes")
        .expect("channel open");
    assert_eq!(outcome.token, token);
    assert_eq!(display.apply(outcome, &renderer), ApplyResult::Applied);
    assert_eq!(display.current().map(|c| c.payload.as_str()), Some("composed"));
}

#[tokio::test]
async fn compose_failure_keeps_previous_code() {
    let (renderer, mut rx) = renderer_with(ScriptedEncoder::default());
    let mut display = CodeDisplay::new();

    renderer.request_render("good");
    apply_all(&renderer, &mut rx, &mut display, 1, "good").await;

    renderer.request_render_with(|| Err(pairdock_core::PayloadError::MissingAddress.into()));
    let outcome = timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("render finishes")
        .expect("channel open");
    assert!(matches!(outcome.result, Err(RenderError::Payload(_))));
    assert_eq!(display.apply(outcome, &renderer), ApplyResult::Failed);
    assert_eq!(display.current().map(|c| c.payload.as_str()), Some("good"));
}
