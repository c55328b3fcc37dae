//! CLI mode for offline-cache: install, inspect and serve cache versions.

mod progress;

use std::path::PathBuf;

use reqwest::Url;

use crate::http::resolve;
use crate::{
    AppConfig, CacheStore, FetchOutcome, HttpNetwork, OfflineAssetCache, Request, ResponseSource,
    open_store,
};

use progress::{BarProgress, print_fetch_result, print_install_report};

/// A parsed subcommand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Pre-cache every asset, then activate.
    Install,
    /// Run one fetch reaction.
    Fetch {
        /// Absolute URL or a path resolved against the origin.
        target: String,
        /// Where to write the response body.
        output: Option<PathBuf>,
    },
    /// Run the proxy server.
    Serve {
        host: Option<String>,
        port: Option<u16>,
        upstream: Option<String>,
    },
    /// List stored buckets.
    Buckets,
    /// Apply the retention policy.
    Prune,
    /// Print the effective configuration.
    Config,
    /// Print usage.
    Help,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    /// Explicit configuration file.
    pub config: Option<PathBuf>,
    pub command: Command,
}

/// Prints usage text to stderr.
pub fn print_usage() {
    eprintln!("Usage: offline-cache [--config PATH] <COMMAND>");
    eprintln!();
    eprintln!("Commands:");
    eprintln!("  install                      Pre-cache the asset list, then activate");
    eprintln!("  fetch <URL|PATH> [-o FILE]   Fetch network-first with cache fallback");
    eprintln!("  serve [OPTIONS]              Run the caching proxy");
    eprintln!("  buckets                      List cache buckets");
    eprintln!("  prune                        Delete buckets per the retention policy");
    eprintln!("  config                       Print the effective configuration");
    eprintln!();
    eprintln!("Serve options:");
    eprintln!("  --host <HOST>                Bind address (default: 127.0.0.1)");
    eprintln!("  --port <PORT>                Bind port (default: 9780)");
    eprintln!("  --upstream <URL>             Origin to forward to (default: cache origin)");
    eprintln!();
    eprintln!("Global options:");
    eprintln!("  --config <PATH>              Config file (default: $OFFLINE_CACHE_CONFIG or");
    eprintln!("                               the user config dir)");
    eprintln!("  -h, --help                   Show this help");
    eprintln!();
    eprintln!("Logging is controlled by RUST_LOG (default: info).");
}

fn take_value<'a>(
    args: &'a [String],
    i: &mut usize,
    flag: &str,
) -> Result<&'a String, String> {
    *i += 1;
    args.get(*i).ok_or_else(|| format!("{flag} requires a value"))
}

/// Parses arguments, excluding the program name.
///
/// # Errors
///
/// Returns a message describing the first unusable argument.
pub fn parse_args(args: &[String]) -> Result<CliArgs, String> {
    let mut config = None;
    let mut command_name: Option<&str> = None;
    let mut positional = Vec::new();
    let mut output = None;
    let mut host = None;
    let mut port = None;
    let mut upstream = None;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                return Ok(CliArgs {
                    config,
                    command: Command::Help,
                });
            }
            "--config" => config = Some(PathBuf::from(take_value(args, &mut i, "--config")?)),
            "-o" | "--output" => output = Some(PathBuf::from(take_value(args, &mut i, "--output")?)),
            "--host" => host = Some(take_value(args, &mut i, "--host")?.clone()),
            "--port" => {
                let value = take_value(args, &mut i, "--port")?;
                port = Some(
                    value
                        .parse::<u16>()
                        .map_err(|_| format!("invalid port: {value}"))?,
                );
            }
            "--upstream" => upstream = Some(take_value(args, &mut i, "--upstream")?.clone()),
            flag if flag.starts_with('-') => return Err(format!("unknown option: {flag}")),
            word => {
                if command_name.is_none() {
                    command_name = Some(word);
                } else {
                    positional.push(word.to_string());
                }
            }
        }
        i += 1;
    }

    let Some(name) = command_name else {
        return Ok(CliArgs {
            config,
            command: Command::Help,
        });
    };

    let serve_flags = host.is_some() || port.is_some() || upstream.is_some();
    if name != "serve" && serve_flags {
        return Err(format!("--host, --port and --upstream only apply to serve, not {name}"));
    }
    if name != "fetch" && output.is_some() {
        return Err("--output only applies to fetch".to_string());
    }

    let command = match name {
        "install" => Command::Install,
        "fetch" => {
            let mut rest = positional.drain(..);
            let target = rest.next().ok_or("fetch requires a URL or path")?;
            if let Some(extra) = rest.next() {
                return Err(format!("unexpected argument: {extra}"));
            }
            return Ok(CliArgs {
                config,
                command: Command::Fetch { target, output },
            });
        }
        "serve" => Command::Serve {
            host,
            port,
            upstream,
        },
        "buckets" => Command::Buckets,
        "prune" => Command::Prune,
        "config" => Command::Config,
        other => return Err(format!("unknown command: {other}")),
    };
    if let Some(extra) = positional.first() {
        return Err(format!("unexpected argument: {extra}"));
    }
    Ok(CliArgs { config, command })
}

/// Resolves a fetch target: absolute URLs are used as-is, anything else is
/// joined onto the cache origin.
fn fetch_target(config: &AppConfig, target: &str) -> crate::Result<Url> {
    match Url::parse(target) {
        Ok(url) => Ok(url),
        Err(_) => resolve(&config.cache.origin_url()?, target),
    }
}

fn build_cache(config: &AppConfig) -> crate::Result<OfflineAssetCache> {
    OfflineAssetCache::new(
        config.cache.clone(),
        HttpNetwork::new()?,
        open_store(&config.storage),
    )
}

async fn install(config: &AppConfig) -> crate::Result<()> {
    let cache = build_cache(config)?;
    let progress = BarProgress::new(config.cache.assets.len());
    let report = cache.install(&progress).await;
    progress.finish();
    let report = report?;
    let deleted = cache.activate().await?;
    print_install_report(&report, &deleted);
    Ok(())
}

async fn fetch(config: &AppConfig, target: &str, output: Option<PathBuf>) -> crate::Result<()> {
    let cache = build_cache(config)?;
    let url = fetch_target(config, target)?;
    let request = Request::get(url.clone());
    let (source, response) = match cache.fetch(&request).await {
        FetchOutcome::Network(response) => (ResponseSource::Network, response),
        FetchOutcome::Cache(response) => (ResponseSource::Cache, response),
        FetchOutcome::Unavailable(e) => {
            eprintln!("{url} is offline and not cached");
            return Err(e);
        }
    };
    print_fetch_result(url.as_str(), source, &response);
    if let Some(path) = output {
        tokio::fs::write(&path, &response.body).await?;
        println!("Wrote {}", path.display());
    }
    Ok(())
}

async fn buckets(config: &AppConfig) -> crate::Result<()> {
    let store = open_store(&config.storage);
    let names = store.bucket_names().await?;
    if names.is_empty() {
        println!("No cache buckets.");
        return Ok(());
    }
    for name in names {
        let entries = store.keys(&name).await?.len();
        let marker = if name == config.cache.cache_name { "*" } else { " " };
        println!("{marker} {name} ({entries} entries)");
    }
    Ok(())
}

async fn prune(config: &AppConfig) -> crate::Result<()> {
    let cache = build_cache(config)?;
    let deleted = cache.activate().await?;
    if deleted.is_empty() {
        println!("Nothing to prune.");
    } else {
        for name in &deleted {
            println!("Deleted {name}");
        }
    }
    Ok(())
}

#[cfg(feature = "server")]
async fn serve(
    mut config: AppConfig,
    host: Option<String>,
    port: Option<u16>,
    upstream: Option<String>,
) -> crate::Result<()> {
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    if upstream.is_some() {
        config.server.upstream = upstream;
    }

    let cache = Arc::new(build_cache(&config)?);
    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("Interrupted, shutting down");
        }
        signal.cancel();
    });

    crate::server::run(cache, &config, shutdown).await
}

#[cfg(not(feature = "server"))]
async fn serve(
    _config: AppConfig,
    _host: Option<String>,
    _port: Option<u16>,
    _upstream: Option<String>,
) -> crate::Result<()> {
    Err(crate::Error::InvalidConfig("server support not compiled in".to_string()))
}

/// Runs a parsed command line.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded or the command fails.
pub async fn run(args: CliArgs) -> crate::Result<()> {
    if args.command == Command::Help {
        print_usage();
        return Ok(());
    }

    let config = AppConfig::load(args.config.as_deref())?;
    match args.command {
        Command::Install => install(&config).await,
        Command::Fetch { target, output } => fetch(&config, &target, output).await,
        Command::Serve {
            host,
            port,
            upstream,
        } => serve(config, host, port, upstream).await,
        Command::Buckets => buckets(&config).await,
        Command::Prune => prune(&config).await,
        Command::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
        Command::Help => Ok(()),
    }
}
