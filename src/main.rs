use clap::Parser;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

use sdns::{Config, Error, Proxy, RuleSet, self_ip, telemetry};

#[derive(Parser)]
#[command(name = "sdns")]
#[command(version, about = "Local DNS override proxy with upstream failover", long_about = None)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "sdns.toml")]
    config: PathBuf,

    /// Match NAME against the rules and exit without serving
    #[arg(short, long, value_name = "NAME")]
    test: Option<String>,

    /// Log level, overrides the config file
    #[arg(long)]
    log_level: Option<String>,
}

struct Loaded {
    config: Config,
    rules: RuleSet,
    self_ip: Ipv4Addr,
}

fn load(config: Config) -> Result<Loaded, Error> {
    let self_ip = match config.self_addr {
        Some(ip) => ip,
        None => self_ip::discover(&config.probe_targets)?,
    };
    let rules = RuleSet::compile(config.rules.clone())?;

    Ok(Loaded {
        config,
        rules,
        self_ip,
    })
}

/// Print the rule match for `name`; success only on a match.
fn test_rule(loaded: &Loaded, name: &str) -> ExitCode {
    let check = loaded.rules.check(name, loaded.self_ip);
    println!("{}", check.line);

    if check.matched {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn serve(loaded: Loaded) -> Result<(), Error> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async {
        let proxy = Proxy::bind(&loaded.config, loaded.rules, loaded.self_ip).await?;
        proxy.run().await
    })
}

fn main() -> ExitCode {
    let args = Args::parse();

    let config = Config::load(&args.config);
    let level = args
        .log_level
        .as_deref()
        .or_else(|| config.as_ref().ok().map(|c| c.log_level.as_str()))
        .unwrap_or("info");
    telemetry::init(level);

    let loaded = match config.and_then(load) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("load config failed: {}", e);
            return ExitCode::FAILURE;
        }
    };

    if let Some(name) = args.test.as_deref() {
        return test_rule(&loaded, name);
    }

    info!(
        config = %args.config.display(),
        rules = loaded.rules.len(),
        self_ip = %loaded.self_ip,
        "starting sdns"
    );

    match serve(loaded) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("failed to serve: {}", e);
            ExitCode::FAILURE
        }
    }
}
