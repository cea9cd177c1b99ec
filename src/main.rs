use clap::{Arg, Command};
use log::LevelFilter;
use mailsieve::builtin;
use mailsieve::composites::CompositesManager;
use mailsieve::io::Collaborators;
use mailsieve::maps::StaticMap;
use mailsieve::symcache::SymbolCache;
use mailsieve::{Config, Envelope, Message, ScanEngine, ScanRequest, StatisticsCollector};
use std::process;
use std::sync::Arc;

fn main() {
    let matches = Command::new("mailsieve")
        .version(env!("CARGO_PKG_VERSION"))
        .about("An email content-analysis engine: scored detection symbols and composite rewriting")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/mailsieve.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Test the configuration file and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .value_name("FILE")
                .help("Scan a JSON submission record ('-' for stdin) and print the report")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("demo")
                .long("demo")
                .help("Run in demonstration mode (scan a synthetic message)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("daemon")
                .short('d')
                .long("daemon")
                .help("Run as a daemon (background process)")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    let config_path = matches.get_one::<String>("config").unwrap();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {}", e);
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        test_config(&config);
        return;
    }

    let demo_mode = matches.get_flag("demo");
    let daemon_mode = matches.get_flag("daemon");
    let scan_path = matches.get_one::<String>("scan").cloned();

    // Handle daemon mode before any runtime threads exist
    if daemon_mode && !demo_mode && scan_path.is_none() {
        #[cfg(unix)]
        {
            log::info!("Starting mailsieve in daemon mode...");

            match unsafe { libc::fork() } {
                -1 => {
                    log::error!("Failed to fork process");
                    process::exit(2);
                }
                0 => {
                    if unsafe { libc::setsid() } == -1 {
                        log::error!("Failed to create new session");
                        process::exit(2);
                    }
                    if unsafe { libc::chdir(c"/".as_ptr()) } == -1 {
                        log::warn!("Failed to change working directory to /");
                    }
                    unsafe {
                        libc::close(0);
                        libc::close(1);
                        libc::close(2);
                    }
                }
                _ => {
                    process::exit(0);
                }
            }
        }

        #[cfg(not(unix))]
        {
            log::warn!("Daemon mode not supported on this platform, running in foreground");
        }
    }

    log::info!("Starting mailsieve...");

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            log::error!("Failed to start runtime: {e}");
            process::exit(2);
        }
    };

    let outcome = runtime.block_on(async {
        if demo_mode {
            run_demo(&config).await
        } else if let Some(path) = scan_path {
            run_scan(&config, &path).await
        } else {
            log::info!(
                "engine ready; no network worker is built in, use --scan or --demo \
                 (submission socket configured at {})",
                config.socket_path
            );
            Ok(())
        }
    });

    if let Err(e) = outcome {
        log::error!("mailsieve error: {e:#}");
        process::exit(2);
    }
}

fn load_config(path: &str) -> anyhow::Result<Config> {
    if std::path::Path::new(path).exists() {
        Config::from_file(path)
    } else {
        log::warn!(
            "Configuration file '{}' not found, using default configuration",
            path
        );
        Ok(Config::default())
    }
}

fn generate_default_config(path: &str) {
    let config = Config::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {}", path);
            println!("Please edit the configuration file to suit your needs.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {}", e);
            process::exit(1);
        }
    }
}

fn test_config(config: &Config) {
    let mut cache = SymbolCache::new();
    if let Err(e) = builtin::register_builtins(&mut cache) {
        eprintln!("Configuration error: {e}");
        process::exit(1);
    }
    let engine = ScanEngine::new(cache, CompositesManager::new(), config);

    println!("Configuration file is valid!");
    println!("Socket path: {}", config.socket_path);
    println!("Registered symbols: {}", engine.cache().items().len());
    println!(
        "Composites: {} ({} second-pass)",
        engine.composites().len(),
        engine.composites().second_pass().len()
    );
    println!("Fingerprint: {:016x}", engine.cache().fingerprint());
}

fn build_engine(config: &Config) -> anyhow::Result<ScanEngine> {
    let mut cache = SymbolCache::new();
    builtin::register_builtins(&mut cache)?;
    let mut engine = ScanEngine::new(cache, CompositesManager::new(), config);

    if let Some(stats_conf) = &config.statistics {
        if stats_conf.enabled {
            let collector = StatisticsCollector::new(
                stats_conf.database_path.clone(),
                stats_conf.flush_interval_seconds.unwrap_or(60),
            )?;
            engine = engine.with_statistics(Arc::new(collector));
        }
    }
    Ok(engine)
}

/// Scan a JSON submission record from a file or stdin, print the report.
async fn run_scan(config: &Config, path: &str) -> anyhow::Result<()> {
    let input = if path == "-" {
        use std::io::Read;
        let mut buf = String::new();
        std::io::stdin().read_to_string(&mut buf)?;
        buf
    } else {
        std::fs::read_to_string(path)?
    };
    let request: ScanRequest = serde_json::from_str(&input)?;

    let engine = build_engine(config)?;
    let task = request
        .into_task()
        .with_deadline(config.scan.task_deadline_duration());
    let report = engine.scan(&task).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Scan one synthetic spam message against the builtin symbol set.
async fn run_demo(config: &Config) -> anyhow::Result<()> {
    let engine = build_engine(config)?;

    let blocklist = StaticMap::from_keys(["spam.example", "bulk-offers.test"]);
    let collaborators =
        Collaborators::default().with_map("sender_blocklist", Arc::new(blocklist));

    let message = Message {
        subject: Some("URGENT wire transfer required - lottery prize".to_string()),
        from_header: Some("Prize Dept <win@spam.example>".to_string()),
        body: Some("You have been selected. Reply with your bank details.".to_string()),
        ..Default::default()
    };
    let envelope = Envelope {
        mail_from: Some("win@spam.example".to_string()),
        helo: Some("[192.0.2.7]".to_string()),
        sender_ip: Some("192.0.2.7".parse().unwrap()),
        ..Default::default()
    };

    let task = mailsieve::Task::new(message, envelope)
        .with_collaborators(collaborators)
        .with_deadline(config.scan.task_deadline_duration());

    let report = engine.scan(&task).await?;

    println!("Demo scan complete");
    println!("  action:  {}", report.action);
    println!("  score:   {:.2}", report.score);
    for symbol in &report.symbols {
        println!("  symbol:  {} ({:.2})", symbol.name, symbol.score);
    }
    for message in &report.messages {
        println!("  message: {message}");
    }
    Ok(())
}
