use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand};
use soxy_check::{
    format_duration, init_logger,
    proxy::{
        detect::Detector, CheckManager, ExportFormat, ProbeOutcome, ProxyKind, ProxyParser,
        ResultSetExt, RunConfiguration, UpstreamProxy,
    },
    settings::SettingsStore,
    tui::{OutputFiles, ProxyCheckerApp},
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

/// A concurrent HTTP/HTTPS/SOCKS proxy validator
#[derive(Parser)]
#[command(name = "soxy-check")]
#[command(about = "A concurrent HTTP/HTTPS/SOCKS proxy validator with pause, resume and stop control")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file path
    #[arg(long, global = true)]
    settings: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Check proxies and save results
    Check {
        /// Input file containing proxies
        input: PathBuf,
        /// Proxy type (auto, http, https, socks4, socks5)
        #[arg(short = 't', long)]
        proxy_type: Option<String>,
        /// Number of concurrent threads
        #[arg(short = 'n', long)]
        threads: Option<usize>,
        /// Timeout in seconds
        #[arg(long, default_value = "10")]
        timeout: u64,
        /// URL or host:port to test proxies against
        #[arg(long)]
        target: Option<String>,
        /// Upstream proxy (host:port) every check is routed through
        #[arg(long)]
        upstream: Option<String>,
        /// Upstream proxy type (http, https, socks4, socks5)
        #[arg(long, default_value = "http")]
        upstream_type: String,
        /// Output file for live proxies
        #[arg(short, long)]
        live: Option<PathBuf>,
        /// Output file for dead proxies
        #[arg(short, long)]
        dead: Option<PathBuf>,
        /// Export format for live proxies (plain, with-kind, json)
        #[arg(short, long)]
        format: Option<String>,
        /// Drive the check from the interactive TUI
        #[arg(long)]
        tui: bool,
    },
    /// Detect the protocol of proxies
    Detect {
        /// Proxies in host:port form
        #[arg(required = true)]
        endpoints: Vec<String>,
        /// Timeout in seconds for each protocol attempt
        #[arg(long, default_value = "10")]
        timeout: u64,
    },
    /// Parse, normalize and deduplicate a proxy list
    Parse {
        /// Input file containing proxies
        input: PathBuf,
        /// Output file for parsed proxies
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Show or update persisted defaults
    Settings {
        /// Default proxy type
        #[arg(short = 't', long)]
        proxy_type: Option<String>,
        /// Default target
        #[arg(long)]
        target: Option<String>,
        /// Default thread count
        #[arg(short = 'n', long)]
        threads: Option<usize>,
        /// Default upstream proxy, empty string to clear
        #[arg(long)]
        upstream: Option<String>,
        /// Default upstream proxy type
        #[arg(long)]
        upstream_type: Option<String>,
        /// Default export format
        #[arg(short, long)]
        format: Option<String>,
        /// Save results automatically after each check to this path
        #[arg(long)]
        auto_save: Option<PathBuf>,
        /// Disable auto-save
        #[arg(long)]
        no_auto_save: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logger(cli.verbose);

    let settings_path = cli.settings.unwrap_or_else(SettingsStore::default_path);
    let mut store = SettingsStore::load(&settings_path)?;

    match cli.command {
        Commands::Check {
            input,
            proxy_type,
            threads,
            timeout,
            target,
            upstream,
            upstream_type,
            live,
            dead,
            format,
            tui,
        } => {
            let entries = ProxyParser::parse_file(&input)?;
            if entries.is_empty() {
                return Err(anyhow!("No proxies found in {:?}", input));
            }

            let defaults = store.settings().clone();
            let kind = match proxy_type {
                Some(s) => parse_kind(&s)?,
                // a list written entirely as socks5://... needs no -t
                None => match ProxyParser::common_kind(&entries) {
                    Some(kind) => kind,
                    None => defaults.last_kind,
                },
            };
            let threads = defaults.clamp_threads(threads.unwrap_or(defaults.last_thread_count));
            let target = target.unwrap_or_else(|| defaults.last_endpoint.clone());
            let format = match format {
                Some(s) => s.parse::<ExportFormat>()?,
                None => defaults.export_format,
            };
            let upstream = match upstream {
                Some(address) => Some(UpstreamProxy::new(address, parse_concrete_kind(&upstream_type)?)),
                None => defaults.upstream(),
            };

            println!("Loaded {} proxies from {:?}", entries.len(), input);
            println!("Checking with {} threads, timeout: {}s", threads, timeout);
            println!("Target: {}", target);
            if let Some(upstream) = &upstream {
                println!("Upstream: {}", upstream);
            }

            let config = RunConfiguration::new(ProxyParser::endpoints(&entries))
                .with_kind(kind)
                .with_target(target.clone())
                .with_workers(threads)
                .with_timeout(Duration::from_secs(timeout))
                .with_upstream(upstream.clone());

            store.update(|s| {
                s.last_kind = kind;
                s.last_endpoint = target;
                s.last_thread_count = threads;
                if let Some(upstream) = &upstream {
                    s.last_upstream_proxy = upstream.address.clone();
                    s.last_upstream_kind = upstream.kind;
                }
            })?;

            if tui {
                let outputs = OutputFiles { live, dead, format };
                let mut app = ProxyCheckerApp::new(config, outputs);
                app.run().await?;
                return Ok(());
            }

            let manager = CheckManager::new();
            run_headless(&manager, config).await?;

            let results = manager.results();
            let stats = manager.stats();
            println!(
                "Results: {} live, {} dead, {} errors ({:.1}% success) in {}",
                stats.live,
                stats.dead,
                stats.errors,
                stats.success_rate,
                format_duration(stats.elapsed)
            );

            if let Some(live_path) = live {
                ProxyParser::save_to_file(&results, &live_path, format)?;
                println!("Saved {} live proxies to {:?}", stats.live, live_path);
            }
            if let Some(dead_path) = dead {
                let dead_endpoints: Vec<String> = results
                    .filter_by_outcome(ProbeOutcome::Dead)
                    .into_iter()
                    .map(|r| r.endpoint)
                    .collect();
                ProxyParser::save_endpoints(&dead_endpoints, &dead_path)?;
                println!("Saved {} dead proxies to {:?}", dead_endpoints.len(), dead_path);
            }

            let settings = store.settings();
            if settings.auto_save_results && !settings.auto_save_path.is_empty() {
                ProxyParser::save_to_file(&results, &settings.auto_save_path, settings.export_format)?;
                info!(path = %settings.auto_save_path, "results auto-saved");
            }

            // Print working proxies with response times
            let live_results = results.filter_by_outcome(ProbeOutcome::Live);
            if !live_results.is_empty() {
                println!("\nLive proxies:");
                for result in &live_results {
                    println!(
                        "  {} ({}ms) egress {}",
                        result.to_kind_string(),
                        result.latency_ms,
                        result.egress_ip.as_deref().unwrap_or("-")
                    );
                }
            }
        }
        Commands::Detect { endpoints, timeout } => {
            let detector = Detector::new(Duration::from_secs(timeout));
            for endpoint in &endpoints {
                match detector.detect(endpoint).await {
                    Ok(kind) => println!("{} {}", endpoint, kind),
                    Err(e) => println!("{} {} ({})", endpoint, ProxyKind::Unknown, e),
                }
            }
        }
        Commands::Parse { input, output } => {
            let entries = ProxyParser::parse_file(&input)?;
            println!("Parsed {} proxies from {:?}", entries.len(), input);

            let lines: Vec<String> = entries
                .iter()
                .map(|e| match e.kind {
                    Some(kind) => format!("{}://{}", kind, e.endpoint),
                    None => e.endpoint.clone(),
                })
                .collect();
            if let Some(output_path) = output {
                ProxyParser::save_endpoints(&lines, &output_path)?;
                println!("Saved parsed proxies to {:?}", output_path);
            } else {
                for line in &lines {
                    println!("{}", line);
                }
            }
        }
        Commands::Settings {
            proxy_type,
            target,
            threads,
            upstream,
            upstream_type,
            format,
            auto_save,
            no_auto_save,
        } => {
            let kind = proxy_type.as_deref().map(parse_kind).transpose()?;
            let upstream_kind = upstream_type.as_deref().map(parse_concrete_kind).transpose()?;
            let format = format.map(|s| s.parse::<ExportFormat>()).transpose()?;
            let changed = kind.is_some()
                || target.is_some()
                || threads.is_some()
                || upstream.is_some()
                || upstream_kind.is_some()
                || format.is_some()
                || auto_save.is_some()
                || no_auto_save;

            if changed {
                store.update(|s| {
                    if let Some(kind) = kind {
                        s.last_kind = kind;
                    }
                    if let Some(target) = target {
                        s.last_endpoint = target;
                    }
                    if let Some(threads) = threads {
                        s.last_thread_count = threads;
                    }
                    if let Some(upstream) = upstream {
                        s.last_upstream_proxy = upstream;
                    }
                    if let Some(kind) = upstream_kind {
                        s.last_upstream_kind = kind;
                    }
                    if let Some(format) = format {
                        s.export_format = format;
                    }
                    if let Some(path) = auto_save {
                        s.auto_save_results = true;
                        s.auto_save_path = path.to_string_lossy().into_owned();
                    }
                    if no_auto_save {
                        s.auto_save_results = false;
                    }
                })?;
                println!("Saved settings to {:?}", store.path());
            }

            println!("{}", serde_json::to_string_pretty(store.settings())?);
        }
    }

    Ok(())
}

/// Run a check to the end, printing progress to stderr.
///
/// The first Ctrl-C stops gracefully, the second one forces the stop.
async fn run_headless(manager: &CheckManager, config: RunConfiguration) -> Result<()> {
    manager.start(
        config,
        |line: &str| eprintln!("{}", line),
        || {},
    )?;

    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    let mut interrupts = 0;
    while manager.is_running() {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = manager.stats();
                eprintln!(
                    "[{}] {}/{} checked | live {} | dead {} | {:.1}/s | ETA {}",
                    manager.status(),
                    stats.completed(),
                    stats.total,
                    stats.live,
                    stats.dead,
                    stats.checks_per_second,
                    format_duration(stats.estimated_remaining)
                );
            }
            signal = tokio::signal::ctrl_c() => {
                signal?;
                interrupts += 1;
                let stopped = if interrupts == 1 {
                    eprintln!("Stopping after in-flight checks, press Ctrl-C again to force");
                    manager.stop(true)
                } else {
                    manager.force_stop()
                };
                if let Err(e) = stopped {
                    warn!("stop request ignored: {}", e);
                }
            }
        }
    }

    Ok(())
}

fn parse_kind(s: &str) -> Result<ProxyKind> {
    Ok(s.parse::<ProxyKind>()?)
}

fn parse_concrete_kind(s: &str) -> Result<ProxyKind> {
    let kind = parse_kind(s)?;
    if !kind.is_concrete() {
        return Err(anyhow!(
            "Invalid upstream proxy type: {}. Use: http, https, socks4, socks5",
            s
        ));
    }
    Ok(kind)
}
