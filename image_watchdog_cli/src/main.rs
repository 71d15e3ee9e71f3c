//! # image_watchdog_cli
//!
//! Part of the image_watchdog crate family.
//!
//! This is the command line front end of the image watchdog.
//!
//! ## Install
//!
//! Use `cargo install --path ./image_watchdog_cli` from the top level repository.
//!
//! ## Use
//!
//! Make a template configuration file and edit it to taste
//!
//! ```bash
//! image_watchdog_cli -p config.yml new
//! ```
//!
//! Then start watching
//!
//! ```bash
//! image_watchdog_cli -p config.yml
//! ```
//!
//! Ctrl-C stops the watchdog. Images still waiting for a run id are labelled before it exits.
//!
//! Legacy archives can be brought up to the current naming convention with
//! `image_watchdog_cli -p config.yml migrate <folder> [--default-image NAME]`, and given a
//! `run_params_dump.json` with `image_watchdog_cli -p config.yml rebuild-metadata <folder>`.
//! Both ask the run log named by `run_log_path` for run ids.
use clap::{Arg, Command};
use indicatif::{ProgressBar, ProgressStyle};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use libimage_watchdog::clock::{init_local_offset, SystemClock};
use libimage_watchdog::config::Config;
use libimage_watchdog::migration::{migrate_folder, rebuild_run_metadata};
use libimage_watchdog::service::{RetryingService, RunLogService};
use libimage_watchdog::watchdog::ImageWatchdog;

fn make_template_config(path: &Path) {
    let config = Config::default();
    let yaml_str = serde_yaml::to_string(&config).unwrap();
    let mut file = File::create(path).expect("Could create template config file!");
    file.write_all(yaml_str.as_bytes())
        .expect("Failed to write yaml data to file!");
}

/// Log to ./image_watchdog.log as well as the terminal
fn setup_logging() {
    let file_sink = Arc::new(
        spdlog::sink::FileSink::builder()
            .path(PathBuf::from("./image_watchdog.log"))
            .formatter(Box::new(spdlog::formatter::PatternFormatter::new(
                spdlog::formatter::pattern!(
                    "[{date_short} {time_short}] - [thread: {tid}] - [{^{level}}] - {payload}{eol}"
                ),
            )))
            .truncate(true)
            .build()
            .expect("Could not create the log file!"),
    );
    let logger = Arc::new(
        spdlog::Logger::builder()
            .flush_level_filter(spdlog::LevelFilter::All)
            .sinks(spdlog::default_logger().sinks().to_owned())
            .sink(file_sink)
            .build()
            .expect("Could not create the logger!"),
    );
    spdlog::set_default_logger(logger);
}

fn run_service(config: &Config) -> Option<RetryingService<RunLogService>> {
    match &config.run_log_path {
        Some(path) => Some(RetryingService::from_config(
            RunLogService::new(path),
            config,
        )),
        None => {
            spdlog::error!("The configuration does not name a run_log_path; cannot look up runs");
            None
        }
    }
}

fn watch(config: Config) {
    spdlog::info!("Watch Path: {}", config.watch_path.display());
    spdlog::info!("Archive Path: {}", config.archive_path.display());
    spdlog::info!("Unlabeled Path: {}", config.unlabeled_directory().display());
    spdlog::info!("Images: {:?}", config.image_names());
    let service = match run_service(&config) {
        Some(service) => service,
        None => return,
    };
    let mut watchdog = match ImageWatchdog::new(config, service, SystemClock) {
        Ok(watchdog) => watchdog,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst))
        .expect("Could not install the Ctrl-C handler!");

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} [{elapsed_precise}] {msg}")
            .expect("Bad progress template!"),
    );
    pb.enable_steady_tick(Duration::from_millis(200));

    let (tx, rx) = std::sync::mpsc::channel();
    let worker_stop = stop.clone();
    // Spawn the task!
    let handle = std::thread::spawn(move || watchdog.run(&worker_stop, &tx));

    loop {
        match rx.recv_timeout(Duration::from_millis(500)) {
            Ok(status) => pb.set_message(status.to_string()),
            Err(RecvTimeoutError::Timeout) => (),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    match handle.join() {
        Ok(result) => match result {
            Ok(_) => spdlog::info!("Watchdog stopped cleanly"),
            Err(e) => spdlog::error!("Watchdog failed with error: {e}"),
        },
        Err(_) => spdlog::error!("Failed to join watchdog task!"),
    }
    pb.finish();
}

fn migrate(config: &Config, folder: &Path, default_image: Option<&str>) {
    let service = match run_service(config) {
        Some(service) => service,
        None => return,
    };
    match migrate_folder(
        folder,
        &config.image_extension,
        default_image,
        &service,
        config.mismatch_tolerance_secs,
    ) {
        Ok(report) => spdlog::info!(
            "Migrated {} using format {}: renamed {}, looked up {} run id(s)",
            folder.display(),
            report.format,
            report.renamed,
            report.looked_up
        ),
        Err(e) => spdlog::error!("Migration failed: {e}"),
    }
}

fn rebuild(config: &Config, folder: &Path) {
    let service = match run_service(config) {
        Some(service) => service,
        None => return,
    };
    match rebuild_run_metadata(
        folder,
        &config.image_extension,
        &service,
        config.mismatch_tolerance_secs,
    ) {
        Ok(runs) => spdlog::info!("Stored {runs} run(s) for {}", folder.display()),
        Err(e) => spdlog::error!("Rebuilding run metadata failed: {e}"),
    }
}

fn main() {
    // Create a cli
    let matches = Command::new("image_watchdog_cli")
        .arg_required_else_help(true)
        .subcommand(Command::new("new").about("Make a template configuration yaml file"))
        .subcommand(
            Command::new("migrate")
                .about("Rename a legacy image folder to the current naming convention")
                .arg(Arg::new("folder").required(true).help("Folder to migrate"))
                .arg(
                    Arg::new("default-image")
                        .long("default-image")
                        .help("Image name for files whose names only hold a datetime"),
                ),
        )
        .subcommand(
            Command::new("rebuild-metadata")
                .about("Write run_params_dump.json for a labelled image folder")
                .arg(Arg::new("folder").required(true).help("Labelled image folder")),
        )
        .arg(
            Arg::new("path")
                .short('p')
                .long("path")
                .global(true)
                .help("Path to the configuration file"),
        )
        .get_matches();

    setup_logging();
    init_local_offset();

    // Parse the cli
    let config_path = PathBuf::from(matches.get_one::<String>("path").expect("We require args"));

    if let Some(("new", _)) = matches.subcommand() {
        spdlog::info!("Making a template config at {}...", config_path.display());
        make_template_config(&config_path);
        spdlog::info!("Done.");
        return;
    }

    // Load our config
    spdlog::info!("Loading config from {}...", config_path.display());
    let config = match Config::read_config_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            spdlog::error!("{e}");
            return;
        }
    };
    spdlog::info!("Config successfully loaded.");

    match matches.subcommand() {
        Some(("migrate", sub)) => {
            let folder = PathBuf::from(sub.get_one::<String>("folder").expect("Folder is required"));
            let default_image = sub.get_one::<String>("default-image").map(|s| s.as_str());
            migrate(&config, &folder, default_image);
        }
        Some(("rebuild-metadata", sub)) => {
            let folder = PathBuf::from(sub.get_one::<String>("folder").expect("Folder is required"));
            rebuild(&config, &folder);
        }
        _ => watch(config),
    }

    spdlog::info!("Done.");
}
