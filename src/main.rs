mod archive;
mod config;
mod dispatcher;
mod handler;
mod logging;
mod queue;
mod registry;
mod shutdown;
mod transport;
mod wire;

use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use archive::ArchiveWriter;
use config::AppConfig;
use dispatcher::{Dispatcher, DispatcherSettings};
use handler::{HandlerSettings, IngestionHandler};
use logging::{LogLevel, Logger, LoggerConfig};
use queue::WorkQueue;
use registry::sled_store::SledRegistry;
use registry::{MemoryRegistry, Registry};
use shutdown::ShutdownHooks;
use transport::peer::TcpPeerConnector;

const USAGE: &str = "usage: pulsefab <dispatch|serve> [--config <path>] [--section.key value]...";

enum Role {
    Dispatch,
    Serve,
}

fn main() {
    ensure_posix_or_exit();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let role = match args.first().map(String::as_str) {
        Some("dispatch") => Role::Dispatch,
        Some("serve") => Role::Serve,
        _ => {
            eprintln!("{USAGE}");
            process::exit(2);
        }
    };
    args.remove(0);
    let config_path = extract_config_path_or_exit(&mut args);

    print_startup_banner();

    let app_config = match AppConfig::load(config_path.as_deref(), args) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("configuration error: {error}");
            process::exit(2);
        }
    };

    let log_level = LogLevel::from_config_value(&app_config.logging.level).unwrap_or_else(|| {
        eprintln!(
            "invalid logging.level '{}'. Allowed values: error, warn, info, debug",
            app_config.logging.level
        );
        process::exit(2);
    });
    let logger = Arc::new(Logger::new(LoggerConfig {
        min_level: log_level,
        human_friendly: app_config.logging.human_friendly,
    }));

    let registry = open_registry_or_exit(&app_config);
    let archive = open_archive_or_exit(&app_config);

    let shutdown_hooks = ShutdownHooks::install().unwrap_or_else(|error| {
        eprintln!("failed to install shutdown hooks: {error}");
        process::exit(2);
    });
    logger.info(
        Some("main"),
        "Shutdown hooks installed for SIGINT/SIGTERM",
    );

    match role {
        Role::Dispatch => run_dispatcher(&app_config, registry, logger, archive, &shutdown_hooks),
        Role::Serve => run_handler(&app_config, registry, logger, archive, &shutdown_hooks),
    }
}

fn run_dispatcher(
    app_config: &AppConfig,
    registry: Box<dyn Registry>,
    logger: Arc<Logger>,
    archive: Option<Arc<ArchiveWriter>>,
    shutdown_hooks: &ShutdownHooks,
) {
    let settings = DispatcherSettings::from_config(
        &app_config.dispatcher,
        &app_config.registry,
        &app_config.archive,
    )
    .unwrap_or_else(|| {
        eprintln!(
            "invalid archive.no_worker_policy '{}'. Allowed values: requeue, drop, archive",
            app_config.archive.no_worker_policy
        );
        process::exit(2);
    });

    logger.info(
        Some("main"),
        &format!(
            "{} v{} starting as dispatcher for role '{}'",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            settings.role_key
        ),
    );

    let mut dispatcher = Dispatcher::new(
        TcpPeerConnector,
        registry,
        Arc::clone(&logger),
        archive,
        settings,
    );
    dispatcher.run(shutdown_hooks.flag());

    if shutdown_hooks.is_triggered() {
        logger.info(Some("main"), "shutdown signal received, dispatcher stopped");
    }
}

fn run_handler(
    app_config: &AppConfig,
    registry: Box<dyn Registry>,
    logger: Arc<Logger>,
    archive: Option<Arc<ArchiveWriter>>,
    shutdown_hooks: &ShutdownHooks,
) {
    let settings = HandlerSettings::from_config(&app_config.handler, &app_config.registry);
    logger.info(
        Some("main"),
        &format!(
            "{} v{} starting as worker on {}:{}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            settings.host,
            settings.port
        ),
    );

    let queue = WorkQueue::with_capacity(app_config.queue.capacity);
    let consumer_stop = Arc::new(AtomicBool::new(false));
    let consumer = archive::spawn_consumer(
        queue.clone(),
        archive,
        Arc::clone(&logger),
        Arc::clone(&consumer_stop),
    );

    let mut handler =
        IngestionHandler::bind(registry, Arc::clone(&logger), queue, settings).unwrap_or_else(
            |error| {
                eprintln!("handler startup error: {error}");
                process::exit(2);
            },
        );

    if let Err(error) = handler.run(shutdown_hooks.flag()) {
        eprintln!("handler runtime error: {error}");
        process::exit(1);
    }

    if shutdown_hooks.is_triggered() {
        logger.info(Some("main"), "shutdown signal received, draining consumer");
    }
    consumer_stop.store(true, Ordering::SeqCst);
    if consumer.join().is_err() {
        logger.warn(Some("main"), "archive consumer thread panicked");
    }
}

fn open_registry_or_exit(app_config: &AppConfig) -> Box<dyn Registry> {
    match app_config.registry.backend.as_str() {
        "sled" => {
            let store =
                SledRegistry::open(Path::new(&app_config.registry.path)).unwrap_or_else(|error| {
                    eprintln!("registry startup error: {error}");
                    process::exit(2);
                });
            Box::new(store)
        }
        "memory" => Box::new(MemoryRegistry::new()),
        other => {
            eprintln!("invalid registry.backend '{other}'. Allowed values: sled, memory");
            process::exit(2);
        }
    }
}

fn open_archive_or_exit(app_config: &AppConfig) -> Option<Arc<ArchiveWriter>> {
    if !app_config.archive.enabled {
        return None;
    }
    let writer =
        ArchiveWriter::open(Path::new(&app_config.archive.path)).unwrap_or_else(|error| {
            eprintln!("archive startup error: {error}");
            process::exit(2);
        });
    Some(Arc::new(writer))
}

fn extract_config_path_or_exit(args: &mut Vec<String>) -> Option<PathBuf> {
    let index = args.iter().position(|arg| arg == "--config")?;
    if index + 1 >= args.len() {
        eprintln!("missing value for --config");
        eprintln!("{USAGE}");
        process::exit(2);
    }
    let path = PathBuf::from(args.remove(index + 1));
    args.remove(index);
    Some(path)
}

fn ensure_posix_or_exit() {
    if !cfg!(unix) {
        eprintln!("unsupported platform: pulsefab is intended for POSIX systems");
        process::exit(2);
    }
}

fn print_startup_banner() {
    const RESET: &str = "\x1b[0m";
    const BANNER_COLOR: &str = "\x1b[38;5;110m";
    const APP_DESCRIPTION: &str =
        "Fleet-control message fabric for build farms: dispatcher and worker roles over TCP.";

    println!(
        "{BANNER_COLOR}{} v{}{RESET} | build {}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        env!("PULSEFAB_BUILD_DATE_UTC")
    );
    println!("{APP_DESCRIPTION}");
    println!();
}
