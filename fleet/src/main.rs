//! Sequencer Fleet CLI

use alloy_primitives::B256;
use clap::{Arg, ArgAction, ArgMatches, Command};
use seqctl_fleet::{
    actions::{Action, Controller, Registry, Request},
    config::{self, ConnectionMode},
    discovery::{self, kubernetes, ClusterApi, ClusterProvider},
    repository::{self, Repository},
    rpc::{self, HttpConnector},
    Config, Context, NetworkView,
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc};
use thiserror::Error;
use tracing::{error, info};

/// Returns the version of the crate.
pub const fn crate_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Flag for verbose output
const VERBOSE_FLAG: &str = "verbose";

/// Path to the YAML configuration
const CONFIG_FLAG: &str = "config";

const LIST_CMD: &str = "list";
const GET_CMD: &str = "get";
const MEMBERSHIP_CMD: &str = "membership";
const ACTIONS_CMD: &str = "actions";
const RUN_CMD: &str = "run";

/// Errors that can occur when running a command.
#[derive(Error, Debug)]
enum Error {
    #[error("config error: {0}")]
    Config(#[from] config::Error),
    #[error("cluster error: {0}")]
    Discovery(#[from] discovery::Error),
    #[error("rpc error: {0}")]
    Rpc(#[from] rpc::Error),
    #[error(transparent)]
    Fleet(#[from] seqctl_fleet::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid block hash: {0}")]
    InvalidHash(String),
}

type Fleet = ClusterProvider<kubernetes::Client, HttpConnector>;

/// Build the controller (and the repository behind it) from the configuration.
async fn controller(path: Option<&PathBuf>) -> Result<Controller<Fleet>, Error> {
    let config = match path {
        Some(path) => Config::load(path)?,
        None => {
            let config = Config::default();
            config.validate()?;
            config
        }
    };
    let api = kubernetes::Client::detect(&config.kubernetes)?;
    let mut connector = HttpConnector::new(config.rpc_timeout());
    if config.connection_mode.resolve(api.in_cluster()) == ConnectionMode::Proxy {
        connector = connector.with_tls(api.tls())?;
        if let Some(token) = api.token().await? {
            connector = connector.with_bearer_token(&token)?;
        }
    }
    info!(
        api_server = api.api_server(),
        in_cluster = api.in_cluster(),
        "connected to cluster"
    );
    let provider = ClusterProvider::new(api, connector, &config)?;
    let repository = Arc::new(Repository::new(
        provider,
        repository::Config::from(&config),
    ));
    Ok(Controller::new(
        repository,
        Registry::default(),
        config.action_timeout(),
    ))
}

fn print(value: &impl Serialize) -> Result<(), Error> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn list(ctx: &Context, controller: &Controller<Fleet>) -> Result<(), Error> {
    let networks = controller.repository().list_networks(ctx).await?;
    let views = networks
        .values()
        .map(|network| network.view())
        .collect::<Vec<NetworkView>>();
    print(&views)
}

async fn get(ctx: &Context, controller: &Controller<Fleet>, matches: &ArgMatches) -> Result<(), Error> {
    let name = matches.get_one::<String>("network").unwrap();
    let network = controller.repository().get_network(ctx, name).await?;
    match matches.get_one::<String>("sequencer") {
        Some(id) => {
            let sequencer =
                network
                    .sequencer(id)
                    .ok_or_else(|| seqctl_fleet::Error::SequencerNotFound {
                        network: name.clone(),
                        sequencer: id.clone(),
                    })?;
            print(&sequencer.view())
        }
        None => print(&network.view()),
    }
}

async fn membership(
    ctx: &Context,
    controller: &Controller<Fleet>,
    matches: &ArgMatches,
) -> Result<(), Error> {
    let network = matches.get_one::<String>("network").unwrap();
    print(&controller.membership(ctx, network).await?)
}

#[derive(Serialize)]
struct ActionInfo {
    name: &'static str,
    description: &'static str,
    disruptive: bool,
}

fn actions(registry: &Registry) -> Result<(), Error> {
    let infos = registry
        .actions()
        .iter()
        .map(|action| ActionInfo {
            name: action.name(),
            description: action.description(),
            disruptive: action.disruptive(),
        })
        .collect::<Vec<_>>();
    print(&infos)
}

async fn run(ctx: &Context, controller: &Controller<Fleet>, matches: &ArgMatches) -> Result<(), Error> {
    let action: Action = controller
        .registry()
        .lookup(matches.get_one::<String>("action").unwrap())?;
    let hash = matches
        .get_one::<String>("hash")
        .map(|raw| {
            raw.parse::<B256>()
                .map_err(|_| Error::InvalidHash(raw.clone()))
        })
        .transpose()?;
    let request = Request {
        network: matches.get_one::<String>("network").unwrap().clone(),
        sequencer: matches.get_one::<String>("sequencer").unwrap().clone(),
        target: matches.get_one::<String>("target").cloned(),
        hash,
    };
    print(&controller.execute(ctx, action, &request).await?)
}

fn network_arg() -> Arg {
    Arg::new("network")
        .long("network")
        .required(true)
        .help("Name of the network")
        .value_parser(clap::value_parser!(String))
}

fn sequencer_arg() -> Arg {
    Arg::new("sequencer")
        .long("sequencer")
        .help("ID of the sequencer")
        .value_parser(clap::value_parser!(String))
}

/// Entrypoint for the Sequencer Fleet CLI
#[tokio::main]
async fn main() -> std::process::ExitCode {
    // Define application
    let matches = Command::new("seqctl")
        .version(crate_version())
        .about("Discover, monitor, and control fleets of conductor-managed sequencers.")
        .arg(
            Arg::new(VERBOSE_FLAG)
                .short('v')
                .long(VERBOSE_FLAG)
                .global(true)
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new(CONFIG_FLAG)
                .long(CONFIG_FLAG)
                .global(true)
                .help("Path to YAML config file (defaults apply when omitted)")
                .value_parser(clap::value_parser!(PathBuf)),
        )
        .subcommand(
            Command::new(LIST_CMD).about("Discover every network and print its current status."),
        )
        .subcommand(
            Command::new(GET_CMD)
                .about("Print the status of a network (or one of its sequencers).")
                .arg(network_arg())
                .arg(sequencer_arg()),
        )
        .subcommand(
            Command::new(MEMBERSHIP_CMD)
                .about("Print the consensus membership of a network, as reported by its leader.")
                .arg(network_arg()),
        )
        .subcommand(Command::new(ACTIONS_CMD).about("List the available actions."))
        .subcommand(
            Command::new(RUN_CMD)
                .about("Run an action against a sequencer.")
                .arg(
                    Arg::new("action")
                        .required(true)
                        .help("Name of the action (see `actions`)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(network_arg())
                .arg(sequencer_arg().required(true))
                .arg(
                    Arg::new("target")
                        .long("target")
                        .help("Sequencer to transfer leadership to (transfer-leader)")
                        .value_parser(clap::value_parser!(String)),
                )
                .arg(
                    Arg::new("hash")
                        .long("hash")
                        .help("Block hash to resume sequencing from (force-active)")
                        .value_parser(clap::value_parser!(String)),
                ),
        )
        .get_matches();

    // Create logger
    let level = if matches.get_flag(VERBOSE_FLAG) {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    // Cancel in-flight calls on interrupt
    let ctx = Context::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                ctx.cancel();
            }
        });
    }

    // Listing actions needs no cluster access
    if matches.subcommand_name() == Some(ACTIONS_CMD) {
        return match actions(&Registry::default()) {
            Ok(()) => std::process::ExitCode::SUCCESS,
            Err(e) => {
                error!(error=?e, "failed to list actions");
                std::process::ExitCode::FAILURE
            }
        };
    }

    // Parse subcommands
    let controller = match controller(matches.get_one::<PathBuf>(CONFIG_FLAG)).await {
        Ok(controller) => controller,
        Err(e) => {
            error!(error=?e, "failed to initialize");
            return std::process::ExitCode::FAILURE;
        }
    };
    let result = match matches.subcommand() {
        Some((LIST_CMD, _)) => list(&ctx, &controller).await,
        Some((GET_CMD, matches)) => get(&ctx, &controller, matches).await,
        Some((MEMBERSHIP_CMD, matches)) => membership(&ctx, &controller, matches).await,
        Some((RUN_CMD, matches)) => run(&ctx, &controller, matches).await,
        Some((cmd, _)) => {
            error!(cmd, "invalid subcommand");
            return std::process::ExitCode::FAILURE;
        }
        None => {
            error!("no subcommand provided");
            return std::process::ExitCode::FAILURE;
        }
    };
    match result {
        Ok(()) => std::process::ExitCode::SUCCESS,
        Err(e) => {
            error!(error=%e, "command failed");
            std::process::ExitCode::FAILURE
        }
    }
}
