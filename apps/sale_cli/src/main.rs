use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use client_core::{
    config::{load_contract_directory, load_settings},
    ChainLink, ContractGateway, JsonRpcClient, NodeWallet, SessionController, SessionView,
};
use shared::{
    domain::{short_address, PurchaseOutcome},
    units::{format_ether, format_units, ETHER_DECIMALS},
};
use tracing::info;

#[derive(Parser, Debug)]
struct Cli {
    /// Overrides the node url from settings.
    #[arg(long)]
    rpc_url: Option<String>,
    /// Overrides the deployment file from settings.
    #[arg(long)]
    contracts: Option<PathBuf>,
    /// Print the session view as JSON.
    #[arg(long)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show price, progress and balance for the node's first account.
    Status,
    /// Buy tokens at the current price.
    Buy { amount: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();
    let cli = Cli::parse();

    let mut settings = load_settings();
    if let Some(rpc_url) = cli.rpc_url {
        settings.rpc_url = rpc_url;
    }
    if let Some(contracts) = cli.contracts {
        settings.contracts_path = contracts;
    }

    let directory = load_contract_directory(&settings.contracts_path)?;
    let rpc = Arc::new(JsonRpcClient::new(settings.rpc_url()?));
    info!(
        rpc_url = %rpc.url(),
        networks = ?directory.networks().collect::<Vec<_>>(),
        "sale_cli: starting"
    );

    let wallet = Arc::new(NodeWallet::new(Arc::clone(&rpc)));
    let gateway = Arc::new(
        ContractGateway::new(directory, rpc)
            .with_receipt_poll_interval(settings.receipt_poll_interval()),
    );
    let session = SessionController::new(
        ChainLink::new(wallet),
        gateway,
        settings.session_options(),
    );

    let connected = session.connect().await;
    if let Err(err) = connected {
        print_view(&session.view(), cli.json)?;
        return Err(err).context("failed to connect");
    }

    match cli.command {
        Command::Status => print_view(&session.view(), cli.json)?,
        Command::Buy { amount } => {
            let outcome = session.buy(&amount).await;
            match &outcome {
                Ok(PurchaseOutcome::Confirmed(hash)) => println!("purchase confirmed: {hash}"),
                Ok(PurchaseOutcome::Rejected(reason)) => println!("purchase rejected: {reason}"),
                Ok(PurchaseOutcome::Reverted(reason)) => println!("purchase reverted: {reason}"),
                Err(_) => {}
            }
            print_view(&session.view(), cli.json)?;
            outcome.context("purchase failed")?;
        }
    }

    session.disconnect().await;
    Ok(())
}

fn print_view(view: &SessionView, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(view)?);
        return Ok(());
    }

    match view.identity.account {
        Some(account) => println!("account:  {}", short_address(&account)),
        None => println!("account:  not connected"),
    }
    if let Some(network_id) = view.identity.network_id {
        println!("network:  {network_id}");
    }
    println!("phase:    {:?}", view.phase);

    if let Some(sale) = &view.sale {
        println!("price:    {} ETH", format_ether(sale.price_wei, 3));
        println!(
            "sold:     {} / {} tokens ({:.2}%)",
            format_units(sale.tokens_sold_wei, ETHER_DECIMALS, 0),
            format_units(sale.max_tokens_wei, ETHER_DECIMALS, 0),
            sale.progress_percent()
        );
        if let Some(balance) = sale.account_balance_wei {
            println!("balance:  {} tokens", format_ether(balance, 2));
        }
    }
    if let Some(error) = &view.error {
        println!("error:    {}", error.message);
    }
    Ok(())
}
