//! ironcoin CLI
//!
//! Thin command-line surface over the node library: wallet generation,
//! balance queries, sending, mining, chain info, and running a P2P node.

use clap::{Parser, Subcommand};
use ironcoin::core::{ChainParams, Blockchain};
use ironcoin::crypto::KeyPair;
use ironcoin::mining::{Mempool, Miner};
use ironcoin::network::{Node, NodeConfig};
use ironcoin::storage::{ChainStore, JsonStore};
use ironcoin::wallet::Wallet;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;

#[derive(Parser)]
#[command(name = "ironcoin")]
#[command(version = "0.1.0")]
#[command(about = "A minimalistic UTXO-based cryptocurrency node", long_about = None)]
struct Cli {
    /// Data directory for chain storage
    #[arg(short, long, default_value = ".ironcoin")]
    data_dir: PathBuf,

    /// Use the local-testing network with a trivial difficulty target
    #[arg(long)]
    regtest: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new wallet and print its address and private key
    NewWallet,

    /// Show the balance of an address
    Balance {
        #[arg(short, long)]
        address: String,
    },

    /// Send coins
    Send {
        /// Sender's private key (hex)
        #[arg(short, long)]
        key: String,

        #[arg(short, long)]
        to: String,

        /// Amount in base units
        #[arg(short, long)]
        amount: u64,

        /// Fee in base units
        #[arg(short, long, default_value = "100000")]
        fee: u64,
    },

    /// Mine blocks to an address
    Mine {
        #[arg(short, long)]
        address: String,

        #[arg(short, long, default_value = "1")]
        count: u32,
    },

    /// Show chain information
    ChainInfo,

    /// Run a P2P node
    Node {
        /// Listening port (defaults to the network port)
        #[arg(short, long)]
        port: Option<u16>,

        /// Peers to connect to at startup (host:port)
        #[arg(short, long)]
        connect: Vec<String>,

        /// Mine to this address while running
        #[arg(short, long)]
        mine_to: Option<String>,
    },
}

fn params_for(cli: &Cli) -> ChainParams {
    if cli.regtest {
        ChainParams::regtest()
    } else {
        ChainParams::mainnet()
    }
}

fn load_chain(store: &JsonStore, params: ChainParams) -> Blockchain {
    match store.load(params.clone()) {
        Ok(Some(chain)) => chain,
        Ok(None) => Blockchain::new(params),
        Err(e) => {
            eprintln!("Failed to load chain: {}", e);
            std::process::exit(1);
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let params = params_for(&cli);
    let store = JsonStore::new(&cli.data_dir);

    match cli.command {
        Commands::NewWallet => {
            let wallet = Wallet::new();
            println!("Address:     {}", wallet.address());
            println!("Private key: {}", wallet.key_pair().private_key_hex());
        }

        Commands::Balance { address } => {
            let chain = load_chain(&store, params);
            println!("Balance:   {}", chain.balance(&address));
            println!("Spendable: {}", chain.spendable_balance(&address));
        }

        Commands::Send {
            key,
            to,
            amount,
            fee,
        } => {
            let key = match KeyPair::from_private_key_hex(&key) {
                Ok(key) => key,
                Err(e) => {
                    eprintln!("Bad private key: {}", e);
                    std::process::exit(1);
                }
            };
            let chain = load_chain(&store, params);
            let wallet = Wallet::from_key(key);
            match wallet.send_to(&chain, &to, amount, fee) {
                Ok(tx) => {
                    let mut mempool = Mempool::new();
                    match mempool.add_transaction(tx, &chain) {
                        Ok(txid) => println!("Transaction {} ready for broadcast", txid),
                        Err(e) => {
                            eprintln!("Transaction rejected: {}", e);
                            std::process::exit(1);
                        }
                    }
                }
                Err(e) => {
                    eprintln!("Failed to build transaction: {}", e);
                    std::process::exit(1);
                }
            }
        }

        Commands::Mine { address, count } => {
            let mut chain = load_chain(&store, params);
            let mut mempool = Mempool::new();
            let miner = Miner::new(&address);
            let cancel = AtomicBool::new(false);

            for _ in 0..count {
                match miner.mine(&mut chain, &mut mempool, &cancel) {
                    Ok(Some((block, stats))) => {
                        println!(
                            "Mined block {} at height {} ({} attempts, {:.0} H/s)",
                            block.hash(),
                            block.height,
                            stats.hash_attempts,
                            stats.hash_rate
                        );
                    }
                    Ok(None) => break,
                    Err(e) => {
                        eprintln!("Mining failed: {}", e);
                        std::process::exit(1);
                    }
                }
            }
            if let Err(e) = store.save(&chain) {
                eprintln!("Failed to save chain: {}", e);
                std::process::exit(1);
            }
        }

        Commands::ChainInfo => {
            let chain = load_chain(&store, params);
            let info = chain.info();
            println!("Height:               {}", info.height);
            println!("Tip:                  {}", info.tip_hash);
            println!("UTXOs:                {}", info.utxo_count);
            println!("Total coins:          {}", info.total_coins);
            println!("Chain work:           {}", info.chain_work);
            println!("Next target (bits):   {:#010x}", info.next_bits);
            println!("Current subsidy:      {}", info.current_subsidy);
            println!("Blocks until halving: {}", info.blocks_until_halving);
        }

        Commands::Node {
            port,
            connect,
            mine_to,
        } => {
            let chain = load_chain(&store, params.clone());
            let mut config = NodeConfig::new(params);
            if let Some(port) = port {
                config.port = port;
            }
            config.bootstrap_peers = connect;
            config.mine_to = mine_to;

            let mut node = Node::with_chain(config, chain);
            if let Err(e) = node.start().await {
                eprintln!("Node failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
