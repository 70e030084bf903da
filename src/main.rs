use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError, Receiver};

use spotlight::config::Config;
use spotlight::config_persistence::{default_config_path, load_or_create_config};
use spotlight::db_manager::DbManager;
use spotlight::enrichment::{EnrichmentClient, KeyringTokenStore, UreqTransport};
use spotlight::hero::item_normalizer::NormalizeSettings;
use spotlight::hero::{current_hero, HeroPool, PoolBuilder, RotationManager};
use spotlight::policy::validate_policy;
use spotlight::protocol::{
    CatalogItem, HeroKind, HeroMessage, RotationNotification, RotationRequest,
};
use spotlight::storage::{HeroStore, KeyValueStore, NullKvStore, SessionKvStore};

const USAGE: &str = "usage:\n  spotlight <movies|shows> <catalog.json> [--force]\n  spotlight --set-token <token>\n  spotlight --clear-token\n  spotlight --clear-cache <movies|shows>";

enum Command {
    Build {
        kind: HeroKind,
        catalog_path: PathBuf,
        force: bool,
    },
    SetToken(String),
    ClearToken,
    ClearCache(HeroKind),
}

fn parse_args(args: &[String]) -> Result<Command, String> {
    match args {
        [flag, token] if flag == "--set-token" => Ok(Command::SetToken(token.clone())),
        [flag] if flag == "--clear-token" => Ok(Command::ClearToken),
        [flag, kind] if flag == "--clear-cache" => Ok(Command::ClearCache(kind.parse()?)),
        [kind, catalog_path, rest @ ..] => {
            let force = match rest {
                [] => false,
                [flag] if flag == "--force" => true,
                _ => return Err(USAGE.to_string()),
            };
            Ok(Command::Build {
                kind: kind.parse()?,
                catalog_path: PathBuf::from(catalog_path),
                force,
            })
        }
        _ => Err(USAGE.to_string()),
    }
}

/// Accepts either a bare item array or a `{ "items": [...] }` export.
fn read_catalog(path: &Path) -> Result<Vec<CatalogItem>, Box<dyn std::error::Error>> {
    #[derive(serde::Deserialize)]
    #[serde(untagged)]
    enum CatalogExport {
        Items(Vec<CatalogItem>),
        Wrapped { items: Vec<CatalogItem> },
    }

    let text = std::fs::read_to_string(path)?;
    Ok(match serde_json::from_str::<CatalogExport>(&text)? {
        CatalogExport::Items(items) | CatalogExport::Wrapped { items } => items,
    })
}

fn open_store(config: &Config) -> HeroStore {
    let session: Arc<dyn KeyValueStore> = Arc::new(SessionKvStore::new());
    if !config.storage.durable {
        info!("Durable storage disabled; pools live for this session only");
        return HeroStore::new(Arc::new(NullKvStore), session);
    }
    let data_dir = config.storage.data_dir.as_deref().map(Path::new);
    match DbManager::new(data_dir, &config.storage.database_file) {
        Ok(db) => HeroStore::new(Arc::new(db), session),
        Err(err) => {
            warn!(
                "Failed to open durable store ({}). Falling back to session storage.",
                err
            );
            HeroStore::new(Arc::new(NullKvStore), session)
        }
    }
}

fn wait_for_pool(
    observer: &mut Receiver<HeroMessage>,
    request_id: &str,
) -> Result<Arc<HeroPool>, String> {
    loop {
        match observer.blocking_recv() {
            Ok(HeroMessage::Notification(notification)) => match notification {
                RotationNotification::Progress(event) => debug!(
                    "Hero[{}]: {:?} {}/{}",
                    event.kind, event.stage, event.index, event.total
                ),
                RotationNotification::PoolReady { request_id: id, pool } if id == request_id => {
                    return Ok(pool);
                }
                RotationNotification::PoolFailed {
                    request_id: id,
                    reason,
                    ..
                } if id == request_id => return Err(reason),
                RotationNotification::ConfigIssues(issues) => {
                    for issue in issues {
                        warn!("Config issue: {}", issue);
                    }
                }
                RotationNotification::RateLimitChanged(state) => {
                    info!("Provider rate limit changed: {:?}", state);
                }
                _ => {}
            },
            Ok(HeroMessage::Request(_)) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => return Err("rotation manager stopped".to_string()),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut clog = colog::default_builder();
    clog.filter(None, log::LevelFilter::Debug);
    clog.init();

    std::panic::set_hook(Box::new(|panic_info| {
        let current_thread = std::thread::current();
        let thread_name = current_thread.name().unwrap_or("unnamed");
        log::error!("panic in thread '{}': {}", thread_name, panic_info);
    }));

    let args: Vec<String> = std::env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };

    let config_path = default_config_path()?;
    let config = load_or_create_config(&config_path)?;
    let token_store = Arc::new(KeyringTokenStore);

    let (kind, catalog_path, force) = match command {
        Command::SetToken(token) => {
            token_store.save_token(&config.enrichment.keyring_account, &token)?;
            info!("Saved provider token to the system keyring");
            return Ok(());
        }
        Command::ClearToken => {
            token_store.delete_token(&config.enrichment.keyring_account)?;
            info!("Removed provider token from the system keyring");
            return Ok(());
        }
        Command::ClearCache(kind) => {
            open_store(&config).invalidate_pool(kind)?;
            info!("Hero[{}]: cached pool invalidated", kind);
            return Ok(());
        }
        Command::Build {
            kind,
            catalog_path,
            force,
        } => (kind, catalog_path, force),
    };

    let items = read_catalog(&catalog_path)?;
    info!(
        "Loaded {} catalog items from {}",
        items.len(),
        catalog_path.display()
    );

    let transport = Arc::new(UreqTransport::new(
        Duration::from_millis(config.enrichment.connect_timeout_ms),
        Duration::from_millis(config.enrichment.read_timeout_ms),
    ));
    let client = Arc::new(EnrichmentClient::new(
        &config.enrichment,
        transport,
        token_store,
    ));

    // Bus for communication between components
    let (bus_sender, _) = broadcast::channel(1024);
    let mut observer = bus_sender.subscribe();

    let builder = PoolBuilder::new(
        Arc::new(open_store(&config)),
        client,
        NormalizeSettings::from_config(&config.enrichment),
    )
    .with_progress(bus_sender.clone());
    let mut rotation_manager = RotationManager::new(
        bus_sender.subscribe(),
        bus_sender.clone(),
        builder,
        &config.policy,
    );
    let manager_handle = thread::Builder::new()
        .name("hero-rotation".to_string())
        .spawn(move || rotation_manager.run())?;

    let request_id = uuid::Uuid::new_v4().to_string();
    let _ = bus_sender.send(HeroMessage::Request(RotationRequest::BuildPool {
        request_id: request_id.clone(),
        kind,
        items: Arc::new(items),
        force,
    }));
    let outcome = wait_for_pool(&mut observer, &request_id);

    let _ = bus_sender.send(HeroMessage::Request(RotationRequest::Shutdown));
    if manager_handle.join().is_err() {
        error!("Rotation manager thread panicked");
    }

    let pool = outcome?;
    let (policy, _) = validate_policy(&config.policy);
    if let Some(index) = current_hero(&pool, spotlight::now_unix_ms(), policy.rotation_interval_ms)
    {
        info!(
            "Hero[{}]: now showing {} ({} of {})",
            kind,
            pool.items[index].title,
            index + 1,
            pool.items.len()
        );
    }
    println!("{}", serde_json::to_string_pretty(pool.as_ref())?);
    Ok(())
}
