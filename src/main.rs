use anyhow::Context;
use clap::error::ErrorKind;
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;

use rebindd::addr::Address;
use rebindd::manager::RebindManager;

#[derive(Parser, Debug)]
#[command(name = "rebindd", about = "DNS rebinding attack server")]
struct CliArgs {
    /// The base URI to serve rebind offers under
    #[arg(short = 'b', long = "base-uri")]
    base_uri: String,
    /// Verbose output (-v warn, -vv info, -vvv debug)
    #[arg(short = 'v', long = "verbose", action = ArgAction::Count)]
    verbose: u8,
    /// Address to bind the DNS listeners to
    #[arg(long = "dns-bind")]
    dns_bind: String,
    /// Address(es) to bind the main HTTP listener to
    #[arg(long = "http-bind", required = true)]
    http_bind: Vec<String>,
    /// The pool of IP addresses to use for HTTP requests
    #[arg(long = "http-pool", required = true)]
    http_pool: Vec<String>,
    /// A mapping of internal/external IPs to use when binding to addresses
    #[arg(long = "http-bind-map")]
    http_bind_map: Vec<String>,
}

fn parse_addrs(raw: &[String], what: &str) -> anyhow::Result<Vec<Address>> {
    raw.iter()
        .map(|r| Address::parse(r).with_context(|| format!("couldn't parse {what} \"{r}\"")))
        .collect()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = match CliArgs::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    let level = match args.verbose {
        0 => log::Level::Error,
        1 => log::Level::Warn,
        2 => log::Level::Info,
        _ => log::Level::Debug,
    };
    simple_logger::init_with_level(level)?;

    let binds = parse_addrs(&args.http_bind, "HTTP bind address")?;
    let mut pool_addrs = parse_addrs(&args.http_pool, "HTTP pool IP")?;

    // Operator bind-maps rewrite the advertised side of matching pool
    // entries before the pool goes into service.
    for map in &args.http_bind_map {
        let (raw_internal, raw_external) = map
            .split_once('/')
            .with_context(|| format!("invalid --http-bind-map \"{map}\""))?;
        let internal = Address::parse(raw_internal)
            .with_context(|| format!("couldn't parse bind-map internal IP \"{raw_internal}\""))?;
        let external = Address::parse(raw_external)
            .with_context(|| format!("couldn't parse bind-map external IP \"{raw_external}\""))?;
        for addr in pool_addrs.iter_mut() {
            if addr.internal_ip.is_some() && addr.internal_ip == internal.internal_ip {
                addr.external_ip = external.external_ip;
            }
        }
    }

    let root = CancellationToken::new();
    let mgr = RebindManager::new(args.base_uri.clone(), pool_addrs, root.clone());
    let dns_handle = mgr.listen(&args.dns_bind, &binds).await?;

    tokio::signal::ctrl_c().await?;
    log::info!("interrupt received, shutting down");
    root.cancel();
    let _ = dns_handle.await;
    Ok(())
}
