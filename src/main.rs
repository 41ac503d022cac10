use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};

use listx_rs::cancel::CancelToken;
use listx_rs::config::Settings;
use listx_rs::engine::trailing::TrailingParams;
use listx_rs::market_data::adapters::kucoin::KucoinAdapter;
use listx_rs::market_data::adapters::paper::PaperAdapter;
use listx_rs::market_data::adapters::ExchangeAdapter;
use listx_rs::market_data::feed::AdaptiveFeedFactory;
use listx_rs::market_data::metadata::{refresh_metadata, spawn_refresh_loop};
use listx_rs::reactor::router::{ListingEvent, Router};
use listx_rs::reactor::Reactor;
use listx_rs::telemetry;

#[derive(Debug, Parser)]
#[command(name = "listx", about = "Listing reactor with a trailing-stop exit")]
struct Cli {
    /// TOML settings file (optional)
    #[arg(long, default_value = "listx.toml")]
    config: PathBuf,

    /// Overrides the configured tracing filter
    #[arg(long)]
    log_filter: Option<String>,

    /// Serve Prometheus metrics on this port
    #[arg(long)]
    metrics_port: Option<u16>,
}

fn print_help() {
    println!("Available commands:");
    println!("  react <SYMBOL> <token name...>  - React to a listing on every exchange");
    println!("  cancel <SYMBOL>                 - Sell out a running reaction now");
    println!("  active                          - List running reactions");
    println!("  balance <TOKEN>                 - Show paper balance");
    println!("  refresh                         - Reload pairs and tokens");
    println!("  quit, q                         - Exit");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env

    let cli = Cli::parse();
    let mut settings = Settings::load(Some(cli.config.as_path()))?;
    if let Some(filter) = cli.log_filter {
        settings.log_filter = filter;
    }
    if cli.metrics_port.is_some() {
        settings.metrics_port = cli.metrics_port;
    }

    telemetry::init_tracing(&settings.log_filter)?;
    if let Some(port) = settings.metrics_port {
        telemetry::init_metrics(port)?;
    }

    // Live KuCoin market data, simulated orders and balances
    let kucoin = Arc::new(KucoinAdapter::new(&settings.kucoin.rest_url, settings.kucoin.fallback_increment)?);
    let paper = Arc::new(PaperAdapter::over("kucoin-paper", kucoin));
    for (token, amount) in &settings.paper.balances {
        paper.set_balance(token, *amount);
    }

    let shutdown = CancelToken::new();
    let refresher = spawn_refresh_loop(paper.clone(), settings.kucoin.refresh_interval(), shutdown.clone());

    let feeds = Arc::new(AdaptiveFeedFactory::new(settings.feed.clone()));
    let reactor = Arc::new(Reactor::new(
        feeds,
        settings.reaction.clone(),
        TrailingParams::from(&settings.strategy),
    ));
    let exchanges: Vec<Arc<dyn ExchangeAdapter>> = vec![paper.clone()];
    let router = Router::new(Arc::clone(&reactor), exchanges);

    println!("Trading {} per reaction in {}", settings.reaction.sell_amount, settings.reaction.quote_token);
    print_help();

    // CLI loop
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        print!("\nLISTX> ");
        io::stdout().flush()?;

        let Some(input) = lines.next_line().await? else { break };
        let mut parts = input.split_whitespace();
        let command = parts.next().unwrap_or_default().to_lowercase();

        match command.as_str() {
            "" => {}
            "help" | "h" => print_help(),
            "react" => {
                let symbol = parts.next().map(str::to_uppercase);
                let token_name = parts.collect::<Vec<_>>().join(" ");
                match symbol {
                    Some(symbol) if !token_name.is_empty() => {
                        let event = ListingEvent { symbol, token_name };
                        for handle in router.dispatch(&event) {
                            tokio::spawn(async move {
                                match handle.await {
                                    Ok(Ok(report)) => println!(
                                        "\n[{}] {} exited ({}): entry {} exit {:?}, sold {} for {}",
                                        report.exchange,
                                        report.symbol,
                                        report.exit_reason,
                                        report.entry_price,
                                        report.exit_price,
                                        report.filled_base,
                                        report.filled_quote
                                    ),
                                    Ok(Err(e)) => println!("\nReaction aborted: {e}"),
                                    Err(e) => println!("\nReaction task failed: {e}"),
                                }
                            });
                        }
                    }
                    _ => println!("Usage: react <SYMBOL> <token name...>"),
                }
            }
            "cancel" => match parts.next() {
                Some(symbol) => {
                    let symbol = symbol.to_uppercase();
                    let hit = router
                        .exchanges()
                        .iter()
                        .filter(|ex| reactor.cancel(ex.name(), &symbol))
                        .count();
                    println!("Cancelled {hit} reaction(s) for {symbol}");
                }
                None => println!("Usage: cancel <SYMBOL>"),
            },
            "active" => {
                let active = reactor.active();
                if active.is_empty() {
                    println!("No running reactions");
                }
                for (exchange, symbol) in active {
                    println!("  {exchange}: {symbol}");
                }
            }
            "balance" => match parts.next() {
                Some(token) => {
                    let token = token.to_uppercase();
                    match paper.balance(&token).await {
                        Ok(b) => println!("{token}: total {} available {}", b.total, b.available),
                        Err(e) => println!("Balance lookup failed: {e}"),
                    }
                }
                None => println!("Usage: balance <TOKEN>"),
            },
            "refresh" => match refresh_metadata(paper.as_ref()).await {
                Ok(outcome) => println!("Refresh: {outcome:?}"),
                Err(e) => println!("Refresh failed: {e}"),
            },
            "quit" | "q" => break,
            other => println!("Unknown command '{other}', type 'help'"),
        }
    }

    // running reactions sell out before we leave
    for (exchange, symbol) in reactor.active() {
        reactor.cancel(&exchange, &symbol);
    }
    let drained = tokio::time::timeout(Duration::from_secs(15), async {
        while !reactor.active().is_empty() {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    })
    .await;
    if drained.is_err() {
        println!("Some reactions did not finish in time");
    }

    shutdown.cancel();
    refresher.await?;
    Ok(())
}
