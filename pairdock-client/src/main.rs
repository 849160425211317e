use std::{fs, path::PathBuf, sync::Arc, time::Duration};

use clap::Parser;
use pairdock_client::{
    Collaborators, PairingScreenController, ScreenOptions,
    address::InterfaceAddressResolver,
    clipboard::SystemClipboard,
    config::{self, PairingConfig},
    logging::init_logging,
    render::{QrPngEncoder, RenderOptions},
};
use pairdock_core::{ConnectionStatus, PairingPayloadBuilder, SecretStore};
use tokio::{runtime::Runtime, sync::watch, time::timeout};
use tracing::{error, info, warn};

const RENDER_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug, Clone)]
#[command(name = "pairdock", about = "Render the pairing code for this machine")]
struct PairArgs {
    /// Port the connection server listens on.
    #[arg(long)]
    port: Option<u16>,
    #[arg(long)]
    device_name: Option<String>,
    /// Network interface to advertise (e.g. en0).
    #[arg(long)]
    adapter: Option<String>,
    #[arg(long)]
    plus: Option<bool>,
    #[arg(long)]
    scheme: Option<String>,
    /// Where to write the PNG.
    #[arg(long, default_value = "pairing-code.png")]
    out: PathBuf,
    #[arg(long, default_value_t = pairdock_client::render::DEFAULT_DIMENSION_PX)]
    size: u32,
    /// Copy the pairing key to the clipboard.
    #[arg(long, default_value_t = false)]
    copy_key: bool,
    /// Issue a new pairing key. Paired devices must pair again.
    #[arg(long, default_value_t = false)]
    reset_key: bool,
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Do not write command-line overrides back to the config file.
    #[arg(long, default_value_t = false)]
    no_save: bool,
}

fn main() {
    let args = PairArgs::parse();
    init_logging(args.log_file.as_deref());

    if let Err(err) = run(&args) {
        error!("pairdock failed: {}", err);
        eprintln!("pairdock: {err}");
        std::process::exit(1);
    }
}

fn run(args: &PairArgs) -> Result<(), String> {
    let cfg = resolve_config(args)?;

    let key_path = config::key_path();
    let secrets = match config::load_key_from_path(&key_path) {
        Ok(Some(key)) => SecretStore::with_secret(key),
        Ok(None) => SecretStore::new(),
        Err(err) => {
            warn!("saved pairing key unreadable; issuing a new one: {}", err);
            SecretStore::new()
        }
    };
    let secrets = Arc::new(secrets);

    let runtime = Runtime::new().map_err(|err| format!("tokio runtime init failed: {err}"))?;

    // The connection server lives in another process and nothing here feeds
    // its state, so the feed starts closed.
    let (status_tx, status_rx) = watch::channel(ConnectionStatus::Stopped);
    drop(status_tx);

    let mut controller = PairingScreenController::new(
        Collaborators {
            secrets: Arc::clone(&secrets),
            addresses: Arc::new(InterfaceAddressResolver),
            clipboard: Arc::new(SystemClipboard),
            encoder: Arc::new(QrPngEncoder),
            status: status_rx,
        },
        cfg.settings(),
        ScreenOptions {
            payload: PairingPayloadBuilder::new().scheme(cfg.scheme.clone()),
            render: RenderOptions {
                dimension: args.size,
                ..RenderOptions::default()
            },
            ..ScreenOptions::default()
        },
        runtime.handle().clone(),
    );

    runtime.block_on(async {
        controller.on_mount();
        settle(&mut controller).await?;

        if args.reset_key {
            controller.reset_secret();
            settle(&mut controller).await?;
        }

        if args.copy_key {
            match controller.copy_secret() {
                Ok(()) => {
                    if let Some(message) = controller.copy_message() {
                        println!("{message}");
                    }
                }
                Err(err) => warn!("copy key failed: {}", err),
            }
        }
        Ok::<(), String>(())
    })?;

    if let Some(key) = secrets.peek()
        && let Err(err) = config::save_key_with_retry(&key_path, &key)
    {
        warn!("failed to save pairing key to {}: {}", key_path.display(), err);
    }

    if let Some(placeholder) = controller.placeholder() {
        println!("{placeholder}");
    }
    if let Some(code) = controller.displayed_code() {
        fs::write(&args.out, &code.bitmap.png)
            .map_err(|err| format!("failed to write {}: {err}", args.out.display()))?;
        info!(path = %args.out.display(), width = code.bitmap.width, "pairing code written");
        println!("{}", code.payload);
        println!("Wrote {}", args.out.display());
    }
    if controller.status_feed_connected() {
        println!("Server: {}", controller.status());
    } else {
        println!("Server: not connected");
    }
    Ok(())
}

async fn settle(controller: &mut PairingScreenController) -> Result<(), String> {
    timeout(RENDER_TIMEOUT, async {
        while controller.render_pending() {
            if controller.process_next_event().await.is_none() {
                break;
            }
        }
    })
    .await
    .map_err(|_| "timed out waiting for the pairing code".to_string())
}

fn resolve_config(args: &PairArgs) -> Result<PairingConfig, String> {
    let path = config::config_path();
    let mut cfg = match config::load_config_from_path(&path) {
        Ok(Some(cfg)) => cfg,
        Ok(None) => PairingConfig::default(),
        Err(err) => {
            warn!("saved config invalid; using defaults: {}", err);
            PairingConfig::default()
        }
    };

    let mut overridden = false;
    if let Some(port) = args.port {
        cfg.port = port;
        overridden = true;
    }
    if let Some(name) = args.device_name.as_ref() {
        cfg.device_name = Some(name.clone());
        overridden = true;
    }
    if let Some(adapter) = args.adapter.as_ref() {
        cfg.network_adapter = Some(adapter.clone());
        overridden = true;
    }
    if let Some(plus) = args.plus {
        cfg.plus = plus;
        overridden = true;
    }
    if let Some(scheme) = args.scheme.as_ref() {
        cfg.scheme = scheme.clone();
        overridden = true;
    }

    config::validate_config(&cfg)?;

    if overridden
        && !args.no_save
        && let Err(err) = config::save_config_with_retry(&path, &cfg)
    {
        warn!("failed to save config to {}: {}", path.display(), err);
    }
    Ok(cfg)
}
