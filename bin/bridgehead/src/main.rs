//! bridgehead deploys the Bridgehead protocol contracts and keeps the chain's diamond up to date.

mod cli;

use anyhow::{Context, Result};
use bridgehead_deploy::{
    Deployer, DeployerSettings, ENV_BINDINGS, FacetCut, JsonRpcChainClient, UpgradeOptions,
    UpgradeOutcome,
};
use clap::Parser;
use comfy_table::Table;

use cli::{AddressFormat, AddressesArgs, Cli, Command, UpgradeArgs};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize the logger.
    tracing_subscriber::fmt()
        .with_max_level(cli.verbosity)
        .init();

    let mut settings = DeployerSettings::load(cli.config.as_deref())?;

    // Persist a generated salt before anything is sent, to the file the next
    // run loads.
    if settings.salt.is_none() {
        settings.salt_or_generate();
        if matches!(cli.command, Command::Deploy | Command::Upgrade(_)) {
            settings.save_to_file(&DeployerSettings::settings_file(cli.config.as_deref()))?;
        }
    }

    let deployer = Deployer::connect(settings)?;

    match cli.command {
        Command::Deploy => deploy(&deployer).await,
        Command::Plan => plan(&deployer),
        Command::Upgrade(args) => upgrade(&deployer, args).await,
        Command::Addresses(args) => addresses(&deployer, args),
    }
}

async fn deploy(deployer: &Deployer<JsonRpcChainClient>) -> Result<()> {
    tracing::info!("Starting deployment process...");
    let (report, registry) = deployer.deploy().await.context("Deployment failed")?;

    tracing::info!(
        groups = report.groups.len(),
        transactions = report.transactions_sent(),
        skipped = report.skipped.len(),
        "✓ Deployment complete!"
    );
    for line in registry.env_lines(ENV_BINDINGS) {
        tracing::info!("{line}");
    }
    Ok(())
}

fn plan(deployer: &Deployer<JsonRpcChainClient>) -> Result<()> {
    let plan = deployer.plan()?;
    let registry = deployer.load_registry()?;

    let mut table = Table::new();
    table.set_header(vec!["Group", "Step", "Status"]);
    for (group, layer) in plan.layers()?.into_iter().enumerate() {
        for name in layer {
            let recorded = plan
                .get(name)
                .is_some_and(|step| step.is_recorded(&registry));
            table.add_row(vec![
                group.to_string(),
                name.to_string(),
                if recorded { "recorded" } else { "pending" }.to_string(),
            ]);
        }
    }
    println!("{table}");
    Ok(())
}

async fn upgrade(deployer: &Deployer<JsonRpcChainClient>, args: UpgradeArgs) -> Result<()> {
    let options = UpgradeOptions {
        init_version: args.init_version,
        init_calldata: args.init_calldata,
        dry_run: args.dry_run,
    };

    match deployer.upgrade(&options).await.context("Upgrade failed")? {
        UpgradeOutcome::UpToDate => tracing::info!("Diamond facets are up to date, nothing to do"),
        UpgradeOutcome::Planned { cuts, init } => {
            print_cuts(&cuts);
            tracing::info!(%init, "Dry run, diamond cut not sent");
        }
        UpgradeOutcome::Applied {
            cuts,
            init,
            receipt,
        } => {
            print_cuts(&cuts);
            tracing::info!(
                %init,
                tx_hash = %receipt.tx_hash,
                block = receipt.block_number,
                "✓ Upgrade applied!"
            );
        }
    }
    Ok(())
}

fn print_cuts(cuts: &[FacetCut]) {
    let mut table = Table::new();
    table.set_header(vec!["Action", "Facet", "Selectors"]);
    for cut in cuts {
        let selectors: Vec<String> = cut.selectors.iter().map(ToString::to_string).collect();
        table.add_row(vec![
            cut.action.to_string(),
            cut.facet.to_string(),
            selectors.join("\n"),
        ]);
    }
    println!("{table}");
}

fn addresses(deployer: &Deployer<JsonRpcChainClient>, args: AddressesArgs) -> Result<()> {
    let registry = deployer.load_registry()?;

    match args.format {
        AddressFormat::Table => {
            let mut table = Table::new();
            table.set_header(vec!["Name", "Address", "Kind"]);
            for record in registry.iter() {
                table.add_row(vec![
                    record.name.clone(),
                    record.address.to_string(),
                    record.kind.to_string(),
                ]);
            }
            println!("{table}");
        }
        AddressFormat::Env => {
            for line in registry.env_lines(ENV_BINDINGS) {
                println!("{line}");
            }
        }
    }

    if let Some(path) = args.out {
        deployer
            .store()
            .export_env(&registry, ENV_BINDINGS, &path)?;
        tracing::info!(path = %path.display(), "Env file written");
    }
    Ok(())
}
