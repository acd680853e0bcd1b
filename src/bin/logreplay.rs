use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use logreplay::config::{BasicAuth, ReplayTarget, Rules};
use logreplay::processor::count::Count;
use logreplay::processor::indexer::Indexer;
use logreplay::processor::logstash::Logstash;
use logreplay::processor::replay::Replay;
use logreplay::processor::{Compound, Processor};
use logreplay::source::{self, SourceOptions};
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::Rng;
use tokio::runtime::Builder;
use tokio::time;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, util::SubscriberInitExt};

/// Upper bound on the graceful drain at the end of a run.
const FINISH_TIMEOUT: Duration = Duration::from_secs(100);

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Rules(#[from] logreplay::config::Error),
    #[error(transparent)]
    Source(#[from] logreplay::source::Error),
    #[error(transparent)]
    Logstash(#[from] logreplay::processor::logstash::Error),
}

#[derive(Parser, Debug)]
#[clap(version, about, long_about = None)]
struct Cli {
    /// The log files to replay; stdin when empty. A `.gz` suffix selects
    /// gzip decompression.
    log_files: Vec<PathBuf>,
    /// More verbose output
    #[clap(short, long)]
    verbose: bool,
    /// Show per-line parse errors
    #[clap(long)]
    show_errors: bool,
    /// Only process the first LIMIT lines
    #[clap(long)]
    limit: Option<u64>,
    /// Pattern for lines to ignore (matched against the request)
    #[clap(long, default_value = logreplay::config::DEFAULT_IGNORE)]
    regex_ignore: String,
    /// Pattern for lines of type asset (matched against the request)
    #[clap(long, default_value = logreplay::config::DEFAULT_ASSET)]
    regex_asset: String,
    /// Pattern for lines of type ajax (matched against the request)
    #[clap(long, default_value = logreplay::config::DEFAULT_AJAX)]
    regex_ajax: String,
    /// Pattern for lines of type search (matched against the request)
    #[clap(long, default_value = logreplay::config::DEFAULT_SEARCH)]
    regex_search: String,
    /// The base url to replay against
    #[clap(long, default_value = "http://127.0.0.1")]
    base_url: String,
    /// Http basic auth username
    #[clap(long)]
    username: Option<String>,
    /// Http basic auth password
    #[clap(long, default_value = "")]
    password: String,
    /// The url of the bulk index endpoint
    #[clap(long, default_value = "http://127.0.0.1:9200")]
    es_url: String,
    /// Optional logstash host:port to ship entries to over UDP
    #[clap(long)]
    logstash_url: Option<String>,
    /// Optional address to bind the prometheus exporter to
    #[clap(long)]
    prometheus_addr: Option<SocketAddr>,
}

async fn inner_main(cli: Cli) -> Result<(), Error> {
    if let Some(addr) = cli.prometheus_addr {
        let builder = PrometheusBuilder::new().with_http_listener(addr);
        tokio::spawn(async move {
            builder
                .install()
                .expect("failed to install prometheus recorder");
        });
    }

    let rules = Rules::new(
        &cli.regex_ignore,
        &cli.regex_asset,
        &cli.regex_ajax,
        &cli.regex_search,
    )?;

    let target = ReplayTarget {
        base_url: cli.base_url.clone(),
        auth: cli.username.as_ref().map(|username| BasicAuth {
            username: username.clone(),
            password: cli.password.clone(),
        }),
    };

    let seed: u64 = rand::rng().random();
    let indexer = Indexer::new(&cli.es_url);
    let replay = Replay::new(&target, indexer.handle(), seed);

    let mut members = vec![
        Processor::Replay(replay),
        Processor::Count(Count::new()),
    ];
    if let Some(logstash_url) = &cli.logstash_url {
        members.push(Processor::Logstash(Logstash::connect(logstash_url).await?));
    }
    let processors = Compound::new(members);

    let options = SourceOptions {
        limit: cli.limit,
        show_errors: cli.show_errors,
        verbose: cli.verbose,
    };
    let totals = source::replay_files(&cli.log_files, &processors, &rules, options).await?;

    let stdout = io::stdout();
    processors.print_results(&mut stdout.lock())?;
    info!(
        processed = totals.processed,
        ignored = totals.ignored,
        errors = totals.errors,
        "replay complete"
    );

    // Errors during the drain are reported but do not fail the run.
    let deadline = time::Instant::now() + FINISH_TIMEOUT;
    if let Err(err) = processors.finish(FINISH_TIMEOUT).await {
        error!("{err}");
    }
    if time::timeout_at(deadline, indexer.finish()).await.is_err() {
        error!("indexer did not drain before the deadline");
    }
    info!("done");
    Ok(())
}

fn main() -> Result<(), Error> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose {
            "logreplay=debug,info"
        } else {
            "info"
        })
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(io::stderr)
        .finish()
        .init();

    let version = env!("CARGO_PKG_VERSION");
    info!("Starting logreplay {version} run.");

    let runtime = Builder::new_multi_thread()
        .enable_io()
        .enable_time()
        .build()?;
    runtime.block_on(inner_main(cli))
}
