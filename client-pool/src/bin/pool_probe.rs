use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_pool::{setup_logger, Address, ChainApi, ClientPool, PoolConfig, ProxyConfig};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;

/// Query a pool of Blockbook endpoints from the command line.
#[derive(Parser)]
#[command(name = "pool-probe", version)]
struct Args {
    /// TOML pool configuration
    #[arg(short, long, conflicts_with = "endpoint")]
    config: Option<PathBuf>,

    /// Endpoint base URL, repeatable (falls back to BLOCKBOOK_ENDPOINTS)
    #[arg(short, long)]
    endpoint: Vec<String>,

    /// Outbound proxy, `ip:port[:user:pass]` or a URL
    #[arg(short, long)]
    proxy: Option<String>,

    #[arg(long, default_value = "logs")]
    log_dir: PathBuf,

    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Backend status
    Info,
    /// Current best block
    BestBlock,
    /// Fetch a transaction
    Tx { txid: String },
    /// Fee estimate in sat/byte
    Fee {
        #[arg(default_value_t = 6)]
        blocks: u32,
    },
    /// Unspent outputs of addresses
    Utxos {
        #[arg(required = true)]
        addresses: Vec<String>,
    },
    /// Print block and transaction notifications until Ctrl+C
    Watch { addresses: Vec<String> },
}

fn load_config(args: &Args) -> Result<PoolConfig> {
    let mut config = if let Some(path) = &args.config {
        PoolConfig::from_path(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?
    } else if !args.endpoint.is_empty() {
        PoolConfig::new("probe", args.endpoint.clone())
    } else {
        PoolConfig::from_env("probe").context("No --config, --endpoint or BLOCKBOOK_ENDPOINTS")?
    };

    if let Some(proxy) = &args.proxy {
        config.proxy = Some(ProxyConfig::parse(proxy).context("Invalid --proxy")?);
    }
    Ok(config)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn watch(pool: &ClientPool, addresses: &[String]) -> Result<()> {
    let mut blocks = pool.block_notify();
    let mut txs = pool.transaction_notify();
    for addr in addresses {
        pool.listen_address(&Address::new(addr.as_str())).await;
    }
    info!(addresses = addresses.len(), "Watching for notifications, Ctrl+C to stop");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            block = blocks.recv() => match block {
                Ok(block) => print_json(&block)?,
                Err(e) => bail!("Block notifications ended: {}", e),
            },
            tx = txs.recv() => match tx {
                Ok(tx) => print_json(&tx)?,
                Err(e) => bail!("Transaction notifications ended: {}", e),
            },
        }
    }
    Ok(())
}

async fn execute(pool: &ClientPool, command: Command) -> Result<()> {
    match command {
        Command::Info => print_json(&pool.get_info().await?),
        Command::BestBlock => print_json(&pool.get_best_block().await?),
        Command::Tx { txid } => print_json(&pool.get_transaction(&txid).await?),
        Command::Fee { blocks } => print_json(&serde_json::json!({
            "blocks": blocks,
            "sat_per_byte": pool.estimate_fee(blocks).await?,
        })),
        Command::Utxos { addresses } => {
            let addrs: Vec<Address> = addresses.iter().map(|a| Address::new(a.as_str())).collect();
            print_json(&pool.get_utxos(&addrs).await?)
        }
        Command::Watch { addresses } => watch(pool, &addresses).await,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    let args = Args::parse();
    let _guard = setup_logger(&args.log_dir, args.verbose)?;

    let config = load_config(&args)?;
    let pool = ClientPool::new(&config).context("Failed to build client pool")?;
    pool.start()?;
    info!(endpoints = ?pool.manager().endpoints(), "Pool started");

    let result = execute(&pool, args.command).await;
    pool.close().await;
    result
}
