use anyhow::{Context, bail};
use std::sync::Arc;
use tensor_kvstore::client::{KvClient, PartitionBook};
use tensor_kvstore::config::StoreConfig;
use tensor_kvstore::membership::{ServerNamebook, read_ip_config};
use tensor_kvstore::network::TcpTransport;
use tensor_kvstore::server::{KvServer, TensorInit};
use tensor_kvstore::storage::shared::LocalSharedMemory;
use tensor_kvstore::tensor::{DType, Tensor};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(String::as_str) {
        Some("server") => run_server(parse_server_args(&args[2..])?).await,
        Some("client") => run_client(parse_client_args(&args[2..])?).await,
        _ => {
            eprintln!(
                "Usage: {} server --config <ip_config> --machine <id> --clients <n> [--tensor name=ROWSxCOLS]... [--store-config <json>]",
                args[0]
            );
            eprintln!(
                "       {} client --config <ip_config> --name <tensor> --rows <n> [--cols <n>] [--machine <id>] [--shutdown] [--store-config <json>]",
                args[0]
            );
            eprintln!(
                "Example: {} server --config ip_config.txt --machine 0 --clients 2 --tensor feat=1000x16",
                args[0]
            );
            std::process::exit(1);
        }
    }
}

struct TensorArg {
    name: String,
    rows: usize,
    cols: usize,
}

struct ServerArgs {
    config: String,
    store_config: Option<String>,
    machine: u32,
    clients: usize,
    tensors: Vec<TensorArg>,
}

struct ClientArgs {
    config: String,
    store_config: Option<String>,
    name: String,
    rows: usize,
    cols: usize,
    machine: Option<u32>,
    shutdown: bool,
}

fn flag_value<'a>(args: &'a [String], i: usize) -> anyhow::Result<&'a str> {
    args.get(i + 1)
        .map(String::as_str)
        .with_context(|| format!("{} needs a value", args[i]))
}

/// `name=ROWSxCOLS`
fn parse_tensor_arg(arg: &str) -> anyhow::Result<TensorArg> {
    let (name, dims) = arg
        .split_once('=')
        .with_context(|| format!("invalid tensor '{}', expected name=ROWSxCOLS", arg))?;
    let (rows, cols) = dims
        .split_once('x')
        .with_context(|| format!("invalid tensor dims '{}', expected ROWSxCOLS", dims))?;
    Ok(TensorArg {
        name: name.to_string(),
        rows: rows.parse()?,
        cols: cols.parse()?,
    })
}

fn parse_server_args(args: &[String]) -> anyhow::Result<ServerArgs> {
    let mut config = None;
    let mut store_config = None;
    let mut machine = None;
    let mut clients = None;
    let mut tensors = Vec::new();

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                config = Some(flag_value(args, i)?.to_string());
                i += 2;
            }
            "--store-config" => {
                store_config = Some(flag_value(args, i)?.to_string());
                i += 2;
            }
            "--machine" => {
                machine = Some(flag_value(args, i)?.parse()?);
                i += 2;
            }
            "--clients" => {
                clients = Some(flag_value(args, i)?.parse()?);
                i += 2;
            }
            "--tensor" => {
                tensors.push(parse_tensor_arg(flag_value(args, i)?)?);
                i += 2;
            }
            other => bail!("unknown server option '{}'", other),
        }
    }

    Ok(ServerArgs {
        config: config.context("--config is required")?,
        store_config,
        machine: machine.context("--machine is required")?,
        clients: clients.context("--clients is required")?,
        tensors,
    })
}

fn parse_client_args(args: &[String]) -> anyhow::Result<ClientArgs> {
    let mut config = None;
    let mut store_config = None;
    let mut name = None;
    let mut rows = None;
    let mut cols = 1;
    let mut machine = None;
    let mut shutdown = false;

    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                config = Some(flag_value(args, i)?.to_string());
                i += 2;
            }
            "--store-config" => {
                store_config = Some(flag_value(args, i)?.to_string());
                i += 2;
            }
            "--name" => {
                name = Some(flag_value(args, i)?.to_string());
                i += 2;
            }
            "--rows" => {
                rows = Some(flag_value(args, i)?.parse()?);
                i += 2;
            }
            "--cols" => {
                cols = flag_value(args, i)?.parse()?;
                i += 2;
            }
            "--machine" => {
                machine = Some(flag_value(args, i)?.parse()?);
                i += 2;
            }
            "--shutdown" => {
                shutdown = true;
                i += 1;
            }
            other => bail!("unknown client option '{}'", other),
        }
    }

    Ok(ClientArgs {
        config: config.context("--config is required")?,
        store_config,
        name: name.context("--name is required")?,
        rows: rows.context("--rows is required")?,
        cols,
        machine,
        shutdown,
    })
}

fn load_store_config(path: Option<&str>) -> anyhow::Result<StoreConfig> {
    match path {
        Some(path) => Ok(StoreConfig::from_json_file(path)?),
        None => Ok(StoreConfig::default()),
    }
}

/// Round-robin layout shared by the server and client commands: global id
/// `g` lives on machine `g % machines` at local row `g / machines`.
fn owned_rows(rows: usize, machines: usize, machine: usize) -> usize {
    (rows + machines - 1 - machine) / machines
}

async fn run_server(args: ServerArgs) -> anyhow::Result<()> {
    let namebook = read_ip_config(&args.config)?;
    let machines = namebook.machine_count();
    if args.machine as usize >= machines {
        bail!(
            "machine {} is not in {} ({} machines)",
            args.machine,
            args.config,
            machines
        );
    }

    let shared = LocalSharedMemory::new();
    let config = load_store_config(args.store_config.as_deref())?;
    let mut handles = Vec::new();

    for rank in namebook.replicas_of(args.machine) {
        let entry = namebook
            .get(rank)
            .with_context(|| format!("no server rank {}", rank))?
            .to_string();
        let mut server = KvServer::new(
            rank,
            &entry,
            args.clients,
            Box::new(TcpTransport::new(config.clone())),
            shared.clone(),
            config.clone(),
        )?;

        let first = rank == namebook.replicas_of(args.machine).start;
        for tensor in &args.tensors {
            let local = owned_rows(tensor.rows, machines, args.machine as usize);
            let (data, g2l) = if first {
                let map = (0..tensor.rows).map(|g| (g / machines) as i64).collect();
                (
                    TensorInit::Values(Tensor::zeros(&[local, tensor.cols], DType::Float32)?),
                    TensorInit::Values(Tensor::vector_i64(map)),
                )
            } else {
                (
                    TensorInit::Shape {
                        shape: vec![local, tensor.cols],
                        dtype: DType::Float32,
                    },
                    TensorInit::Shape {
                        shape: vec![tensor.rows],
                        dtype: DType::Int64,
                    },
                )
            };
            server.init_data(&tensor.name, data)?;
            server.set_global2local(&tensor.name, g2l)?;
            tracing::info!(
                "Server {} holds {} rows of {} ({} columns)",
                rank,
                local,
                tensor.name,
                tensor.cols
            );
        }

        handles.push(tokio::spawn(async move { server.start().await }));
    }

    tracing::info!(
        "Machine {} running {} replicas for {} clients",
        args.machine,
        handles.len(),
        args.clients
    );

    let mut failed = false;
    for handle in handles {
        if let Err(e) = handle.await? {
            tracing::error!("Server stopped with error: {}", e);
            failed = true;
        }
    }
    if failed {
        bail!("one or more servers on machine {} failed", args.machine);
    }
    Ok(())
}

fn expected_rows(ids: &[u64], cols: usize) -> anyhow::Result<Tensor> {
    let values = ids
        .iter()
        .flat_map(|&g| (0..cols).map(move |c| (g as usize * cols + c) as f32))
        .collect();
    Ok(Tensor::from_f32(vec![ids.len(), cols], values)?)
}

async fn run_client(args: ClientArgs) -> anyhow::Result<()> {
    let namebook: ServerNamebook = read_ip_config(&args.config)?;
    let machines = namebook.machine_count();
    let config = load_store_config(args.store_config.as_deref())?;

    let mut client = KvClient::new(
        namebook,
        Box::new(TcpTransport::new(config.clone())),
        Arc::new(LocalSharedMemory::default()),
        config,
    );
    if let Some(machine) = args.machine {
        client = client.with_machine_id(machine);
    }

    client.connect().await?;
    print!("{}", client.describe());

    let book = (0..args.rows).map(|g| (g % machines) as u32).collect();
    client.set_partition_book(&args.name, PartitionBook::Table(book))?;

    let ids: Vec<u64> = (0..args.rows as u64).collect();
    client
        .push(&args.name, &ids, &expected_rows(&ids, args.cols)?)
        .await?;
    client.barrier().await?;

    let reversed: Vec<u64> = ids.iter().rev().copied().collect();
    let pulled = client.pull(&args.name, &reversed).await?;
    if pulled != expected_rows(&reversed, args.cols)? {
        bail!("pulled rows of '{}' do not match what was pushed", args.name);
    }
    tracing::info!(
        "Client {:?} verified {} rows of '{}'",
        client.get_id(),
        args.rows,
        args.name
    );

    // Nobody shuts the cluster down while others are still verifying.
    client.barrier().await?;
    if args.shutdown {
        client.shut_down().await?;
    }
    Ok(())
}
