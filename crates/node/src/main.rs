use umbrad_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

#[allow(unused_macros)]
macro_rules! log_trace {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Trace, $($arg)*);
    }};
}

pub mod chain_service;
pub mod engine;
pub mod ingest;
pub mod mempool;
pub mod p2p;
pub mod peer_book;

use std::fs::{self, File};
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fs2::FileExt;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use umbrad_chainstate::genesis::genesis_block;
use umbrad_chainstate::ChainState;
use umbrad_consensus::params::{chain_params, ChainParams, Network};
use umbrad_consensus::{Hash256, Policy};
use umbrad_primitives::block::XThinnerBlock;
use umbrad_storage::memory::MemoryStore;
use umbrad_storage::KeyValueStore;

use crate::chain_service::{BlockFetcher, ChainService};
use crate::engine::ConsensusEngine;
use crate::ingest::BlockIngest;
use crate::mempool::Mempool;
use crate::p2p::{FramedStream, PeerRegistry};
use crate::peer_book::PeerBook;

const USER_AGENT: &str = concat!("/umbrad:", env!("CARGO_PKG_VERSION"), "/");
const BANLIST_FILE_NAME: &str = "banlist.json";
const LOCK_FILE_NAME: &str = ".lock";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Backend::Memory),
            "fjall" => Some(Backend::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
struct Config {
    network: Network,
    backend: Backend,
    data_dir: PathBuf,
    listen: bool,
    listen_addr: Option<SocketAddr>,
    add_peers: Vec<String>,
    log_level: logging::Level,
    log_format: logging::Format,
    log_timestamps: bool,
    policy: Policy,
}

#[derive(Debug)]
enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

fn default_data_dir(network: Network) -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    let base = home.join(".umbrad");
    match network {
        Network::Mainnet => base,
        Network::Testnet => base.join("testnet"),
        Network::Regtest => base.join("regtest"),
    }
}

fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut network = Network::Mainnet;
    let mut backend = Backend::Fjall;
    let mut data_dir: Option<PathBuf> = None;
    let mut listen = true;
    let mut listen_addr: Option<SocketAddr> = None;
    let mut add_peers: Vec<String> = Vec::new();
    let mut log_level = logging::Level::Info;
    let mut log_format = logging::Format::Text;
    let mut log_timestamps = true;
    let mut policy = Policy::default();

    let mut args = raw_args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            "--testnet" => {
                network = Network::Testnet;
            }
            "--regtest" => {
                network = Network::Regtest;
            }
            "--backend" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --backend\n{}", usage()))?;
                backend = Backend::parse(&value)
                    .ok_or_else(|| format!("invalid backend '{value}'\n{}", usage()))?;
            }
            "--data-dir" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --data-dir\n{}", usage()))?;
                data_dir = Some(PathBuf::from(value));
            }
            "--listen" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --listen\n{}", usage()))?;
                listen_addr = Some(
                    value
                        .parse::<SocketAddr>()
                        .map_err(|_| format!("invalid address for --listen\n{}", usage()))?,
                );
            }
            "--nolisten" => {
                listen = false;
            }
            "--addpeer" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --addpeer\n{}", usage()))?;
                add_peers.push(value);
            }
            "--log-level" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-level\n{}", usage()))?;
                log_level = logging::Level::parse(&value)
                    .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?;
            }
            "--log-format" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --log-format\n{}", usage()))?;
                log_format = logging::Format::parse(&value)
                    .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?;
            }
            "--no-log-timestamps" => {
                log_timestamps = false;
            }
            "--max-banscore" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --max-banscore\n{}", usage()))?;
                policy.max_banscore = value
                    .parse::<u32>()
                    .map_err(|_| format!("invalid value for --max-banscore\n{}", usage()))?;
            }
            "--ban-duration" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --ban-duration\n{}", usage()))?;
                policy.ban_duration_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid value for --ban-duration\n{}", usage()))?;
            }
            "--mempool-max-mb" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --mempool-max-mb\n{}", usage()))?;
                let mb = value
                    .parse::<usize>()
                    .map_err(|_| format!("invalid value for --mempool-max-mb\n{}", usage()))?;
                policy.mempool_max_bytes = mb * 1024 * 1024;
            }
            "--inflight-ttl" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --inflight-ttl\n{}", usage()))?;
                policy.inflight_ttl_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid value for --inflight-ttl\n{}", usage()))?;
            }
            "--orphan-ttl" => {
                let value = args
                    .next()
                    .ok_or_else(|| format!("missing value for --orphan-ttl\n{}", usage()))?;
                policy.orphan_ttl_secs = value
                    .parse::<u64>()
                    .map_err(|_| format!("invalid value for --orphan-ttl\n{}", usage()))?;
            }
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = data_dir.unwrap_or_else(|| default_data_dir(network));
    Ok(CliAction::Run(Config {
        network,
        backend,
        data_dir,
        listen,
        listen_addr,
        add_peers,
        log_level,
        log_format,
        log_timestamps,
        policy,
    }))
}

fn usage() -> String {
    [
        "umbrad - umbra network full node",
        "",
        "USAGE:",
        "  umbrad [OPTIONS]",
        "",
        "OPTIONS:",
        "  --testnet               Use the test network",
        "  --regtest               Use the regression test network",
        "  --data-dir <path>       Data directory (default: ~/.umbrad)",
        "  --backend <name>        Datastore backend: fjall|memory (default: fjall)",
        "  --listen <addr>         Listen address for peer streams",
        "  --nolisten              Do not accept inbound peer streams",
        "  --addpeer <host:port>   Add a peer to connect to (repeatable)",
        "  --log-level <level>     error|warn|info|debug|trace (default: info)",
        "  --log-format <format>   text|json (default: text)",
        "  --no-log-timestamps     Omit timestamps from text logs",
        "  --max-banscore <n>      Ban threshold (default: 100)",
        "  --ban-duration <secs>   Ban duration in seconds (default: 86400)",
        "  --mempool-max-mb <n>    Mempool cap in megabytes (default: 300)",
        "  --inflight-ttl <secs>   Inflight block request TTL (default: 300)",
        "  --orphan-ttl <secs>     Orphan block retention (default: 600)",
        "  --help, -h              Print this help",
        "  --version, -V           Print version",
    ]
    .join("\n")
}

pub async fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("umbrad {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run(config).await,
    }
}

async fn run(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });

    let params = chain_params(config.network);
    log_info!(
        "Starting umbrad {} on {}",
        env!("CARGO_PKG_VERSION"),
        params.network.as_str()
    );

    fs::create_dir_all(&config.data_dir)
        .map_err(|err| format!("failed to create data dir: {err}"))?;
    let lock_path = config.data_dir.join(LOCK_FILE_NAME);
    let lock_file =
        File::create(&lock_path).map_err(|err| format!("failed to create lock file: {err}"))?;
    lock_file.try_lock_exclusive().map_err(|_| {
        format!(
            "data directory {} is locked by another instance",
            config.data_dir.display()
        )
    })?;

    match config.backend {
        Backend::Memory => {
            let store = Arc::new(MemoryStore::new());
            run_node(store, config, params).await
        }
        Backend::Fjall => {
            let store = Arc::new(
                umbrad_storage::fjall::FjallStore::open(config.data_dir.join("db"))
                    .map_err(|err| format!("failed to open datastore: {err}"))?,
            );
            run_node(store, config, params).await
        }
    }
}

async fn run_node<S>(store: Arc<S>, config: Config, params: ChainParams) -> Result<(), String>
where
    S: KeyValueStore + Send + Sync + 'static,
{
    let chain = Arc::new(
        ChainState::new_with_cache_capacity(
            store,
            params.clone(),
            config.policy.max_nullifiers,
            config.policy.max_txo_roots,
        )
        .map_err(|err| err.to_string())?,
    );
    chain
        .init_genesis(&genesis_block(&params))
        .map_err(|err| format!("genesis init failed: {err}"))?;
    let tip = chain
        .best_block()
        .ok_or_else(|| "missing chain tip after init".to_string())?;
    log_info!(
        "Chain tip: {} (height: {})",
        umbrad_consensus::hash256_to_hex(&tip.hash),
        tip.height
    );

    let mempool = Arc::new(Mutex::new(Mempool::new(config.policy.mempool_max_bytes)));
    let peer_book = Arc::new(PeerBook::new(&config.policy));
    let banlist_path = config.data_dir.join(BANLIST_FILE_NAME);
    match peer_book.load_banlist(&banlist_path) {
        Ok(0) => {}
        Ok(count) => log_info!("Loaded {} banned peer(s)", count),
        Err(err) => log_warn!("Failed to load banlist: {err}"),
    }

    let registry = Arc::new(PeerRegistry::new());
    let mut peer_names: Vec<String> = config.add_peers.clone();
    peer_names.extend(params.seed_addrs.iter().map(|seed| seed.to_string()));
    for peer in &peer_names {
        match peer.to_socket_addrs() {
            Ok(addrs) => {
                for addr in addrs {
                    registry.register(addr);
                }
            }
            Err(err) => log_warn!("Cannot resolve peer {peer}: {err}"),
        }
    }
    log_info!("Known peers: {}", registry.count());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let engine = Arc::new(ConsensusEngine::new(request_tx));
    let client = Arc::new(chain_service::ChainServiceClient::new(
        params.chain_service_protocol(),
        peer_book.clone(),
        shutdown_rx.clone(),
    ));
    let ingest = BlockIngest::new(
        chain,
        mempool,
        engine,
        client,
        peer_book.clone(),
        registry.clone(),
        config.policy.clone(),
        shutdown_rx.clone(),
    );

    let fetcher: BlockFetcher = {
        let ingest = ingest.clone();
        Arc::new(move |block_id: &Hash256| ingest.fetch_block(block_id))
    };
    let service = Arc::new(ChainService::new(fetcher));

    tokio::spawn(ingest.clone().run_request_loop(request_rx));
    tokio::spawn(ingest.clone().run_orphan_sweeper());

    if config.listen {
        let listen_addr = config.listen_addr.unwrap_or_else(|| {
            format!("0.0.0.0:{}", params.default_port)
                .parse()
                .expect("default listen address")
        });
        let listener = TcpListener::bind(listen_addr)
            .await
            .map_err(|err| format!("failed to bind {listen_addr}: {err}"))?;
        log_info!("Listening on {} as {}", listen_addr, USER_AGENT);
        tokio::spawn(serve_peers(
            listener,
            params.clone(),
            service,
            ingest.clone(),
            registry,
            peer_book.clone(),
            shutdown_rx,
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| err.to_string())?;
    log_info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Err(err) = peer_book.save_banlist(&banlist_path) {
        log_warn!("Failed to save banlist: {err}");
    }
    Ok(())
}

/// Accept loop for inbound peer streams. The first frame names the
/// protocol; chain-service streams are served from our block fetcher and
/// relay streams feed compact blocks into the ingest pipeline.
async fn serve_peers<S, C>(
    listener: TcpListener,
    params: ChainParams,
    service: Arc<ChainService>,
    ingest: Arc<BlockIngest<S, C>>,
    registry: Arc<PeerRegistry>,
    peer_book: Arc<PeerBook>,
    shutdown: watch::Receiver<bool>,
) where
    S: KeyValueStore + Send + Sync + 'static,
    C: engine::Consensus,
{
    let chain_service_protocol = params.chain_service_protocol();
    let block_relay_protocol = params.block_relay_protocol();
    let mut shutdown_accept = shutdown.clone();
    loop {
        let accepted = tokio::select! {
            _ = shutdown_accept.changed() => return,
            accepted = listener.accept() => accepted,
        };
        let (stream, remote_addr) = match accepted {
            Ok(pair) => pair,
            Err(err) => {
                log_error!("accept failed: {err}");
                continue;
            }
        };

        let chain_service_protocol = chain_service_protocol.clone();
        let block_relay_protocol = block_relay_protocol.clone();
        let service = service.clone();
        let ingest = ingest.clone();
        let registry = registry.clone();
        let peer_book = peer_book.clone();
        let shutdown = shutdown.clone();

        tokio::spawn(async move {
            let mut framed = FramedStream::new(stream);
            let protocol = match framed.read_protocol().await {
                Ok(protocol) => protocol,
                Err(err) => {
                    log_debug!("peer {} sent no protocol: {err}", remote_addr);
                    return;
                }
            };
            let result = if protocol == chain_service_protocol {
                service.handle_stream(&mut framed, shutdown).await
            } else if protocol == block_relay_protocol {
                handle_relay_stream(&ingest, &registry, &peer_book, &mut framed, remote_addr, shutdown)
                    .await
            } else {
                log_debug!("peer {} spoke unknown protocol {}", remote_addr, protocol);
                return;
            };
            if let Err(err) = result {
                log_debug!("peer {} stream closed: {err}", remote_addr);
            }
        });
    }
}

/// A relay stream starts with the peer's chain-service listen port, then
/// carries one compact block announcement per frame.
async fn handle_relay_stream<S, C>(
    ingest: &Arc<BlockIngest<S, C>>,
    registry: &Arc<PeerRegistry>,
    peer_book: &Arc<PeerBook>,
    framed: &mut FramedStream,
    remote_addr: SocketAddr,
    shutdown: watch::Receiver<bool>,
) -> Result<(), String>
where
    S: KeyValueStore + Send + Sync + 'static,
    C: engine::Consensus,
{
    let hello = framed.read_frame().await?;
    if hello.len() != 2 {
        return Err("malformed relay hello".to_string());
    }
    let service_port = u16::from_le_bytes([hello[0], hello[1]]);
    let peer_addr = SocketAddr::new(remote_addr.ip(), service_port);
    if peer_book.is_banned(peer_addr) {
        return Err(format!("peer {peer_addr} is banned"));
    }
    registry.register(peer_addr);

    let mut shutdown = shutdown;
    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => return Ok(()),
            frame = framed.read_frame() => frame?,
        };
        let compact =
            XThinnerBlock::consensus_decode(&frame).map_err(|err| err.to_string())?;
        registry.touch(peer_addr);
        log_debug!(
            "Received block announcement {} from {}",
            umbrad_consensus::hash256_to_hex(&compact.block_id()),
            peer_addr
        );
        if let Err(err) = ingest.clone().handle_incoming_block(&compact, peer_addr).await {
            log_debug!(
                "Block {} from {} not accepted: {}",
                umbrad_consensus::hash256_to_hex(&compact.block_id()),
                peer_addr,
                err
            );
        }
        if peer_book.is_banned(peer_addr) {
            let (behavioral, transient) = peer_book.banscore(peer_addr);
            registry.remove(peer_addr);
            return Err(format!(
                "peer {peer_addr} banned (score {behavioral}+{transient})"
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliAction, String> {
        parse_args_from(args.iter().map(|arg| arg.to_string()))
    }

    #[test]
    fn defaults_to_mainnet_fjall() {
        let CliAction::Run(config) = parse(&[]).expect("parse") else {
            panic!("expected run action");
        };
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.backend, Backend::Fjall);
        assert!(config.listen);
        assert_eq!(config.policy.max_banscore, 100);
        assert_eq!(config.policy.inflight_ttl_secs, 300);
    }

    #[test]
    fn parses_network_and_policy_overrides() {
        let CliAction::Run(config) = parse(&[
            "--regtest",
            "--backend",
            "memory",
            "--nolisten",
            "--addpeer",
            "127.0.0.1:29901",
            "--max-banscore",
            "50",
            "--orphan-ttl",
            "120",
        ])
        .expect("parse") else {
            panic!("expected run action");
        };
        assert_eq!(config.network, Network::Regtest);
        assert_eq!(config.backend, Backend::Memory);
        assert!(!config.listen);
        assert_eq!(config.add_peers, vec!["127.0.0.1:29901".to_string()]);
        assert_eq!(config.policy.max_banscore, 50);
        assert_eq!(config.policy.orphan_ttl_secs, 120);
    }

    #[test]
    fn rejects_unknown_arguments() {
        let err = parse(&["--bogus"]).expect_err("must fail");
        assert!(err.contains("unknown argument"));
        let err = parse(&["--backend", "sqlite"]).expect_err("must fail");
        assert!(err.contains("invalid backend"));
    }

    #[test]
    fn help_and_version_short_circuit() {
        assert!(matches!(parse(&["--help"]), Ok(CliAction::PrintHelp)));
        assert!(matches!(
            parse(&["--regtest", "-V"]),
            Ok(CliAction::PrintVersion)
        ));
    }
}
