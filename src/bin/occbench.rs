//! Runs an occdb bank benchmark. A set of accounts is created with an initial
//! balance, and a block of random transfers between them is executed through
//! the parallel scheduler. Transfers that would overdraw an account fail with
//! an application error, and every so often an audit transaction sums up all
//! balances. The same block is then executed one transaction at a time on a
//! fresh engine, and the receipts and final states are compared. For example:
//!
//! cargo run --bin occbench -- --accounts 100 --transfers 10000
//!
//! Scheduler settings are read from the configuration file, and can be
//! overridden with OCCDB_ environment variables, e.g. OCCDB_WORKERS=4.

#![warn(clippy::all)]

use clap::Parser as _;
use occdb::encoding::Value as _;
use occdb::error::Result;
use occdb::storage::engine::prefix_range;
use occdb::storage::{Engine, Memory};
use occdb::{errdata, errinput, Config, Error, Scheduler, Transaction, View};
use rand::{Rng as _, SeedableRng as _};
use serde::Deserialize;

fn main() -> Result<()> {
    let command = Command::parse();
    let settings = Settings::new(&command.config)?;

    let loglevel = settings.log_level.parse::<simplelog::LevelFilter>()?;
    let mut logconfig = simplelog::ConfigBuilder::new();
    if loglevel != simplelog::LevelFilter::Debug {
        logconfig.add_filter_allow_str("occdb");
    }
    simplelog::SimpleLogger::init(loglevel, logconfig.build())?;

    command.run(settings.scheduler_config())
}

/// Handles command-line parsing.
#[derive(clap::Parser)]
#[command(about = "Runs an occdb bank transfer benchmark.", version)]
struct Command {
    /// Configuration file path.
    #[arg(short = 'c', long, default_value = "config/occdb.yaml")]
    config: String,

    /// Number of accounts.
    #[arg(short, long, default_value = "100")]
    accounts: u64,

    /// Initial account balance.
    #[arg(short, long, default_value = "100")]
    balance: u64,

    /// Max amount to transfer.
    #[arg(short, long, default_value = "50")]
    max_transfer: u64,

    /// Number of transfers in the block.
    #[arg(short = 'n', long, default_value = "10000")]
    transfers: usize,

    /// Insert an audit after this many transfers (0 disables audits).
    #[arg(long, default_value = "1000")]
    audit_every: usize,

    /// Seed to use for random number generation.
    #[arg(short, long, default_value = "16791084677885396490")]
    seed: u64,
}

impl Command {
    /// Runs the benchmark.
    fn run(self, config: Config) -> Result<()> {
        if self.accounts < 2 {
            return errinput!("at least 2 accounts required");
        }
        let block = self.generate();
        println!(
            "Executing {} txns on {} accounts with {} workers and {} validation workers",
            block.len(),
            self.accounts,
            config.workers,
            config.validation_workers
        );

        let scheduler = Scheduler::new(self.setup(), config)?;
        let start = std::time::Instant::now();
        let receipts = scheduler.process_all(&block)?;
        let elapsed = start.elapsed().as_secs_f64();
        let stats = scheduler.stats();
        println!(
            "Parallel:   {:.3}s ({:.0} txns/s), {}",
            elapsed,
            block.len() as f64 / elapsed,
            stats
        );

        // Execute each transaction in its own batch, which is sequential.
        let sequential = Scheduler::new(
            self.setup(),
            Config { workers: 1, validation_workers: 1, max_iterations: 1 },
        )?;
        let start = std::time::Instant::now();
        let mut expect = Vec::with_capacity(block.len());
        for txn in &block {
            for receipt in sequential.process_all(std::slice::from_ref(txn))? {
                expect.push(receipt.result);
            }
        }
        let elapsed = start.elapsed().as_secs_f64();
        println!("Sequential: {:.3}s ({:.0} txns/s)", elapsed, block.len() as f64 / elapsed);

        // Verify the outcomes and final state. Transfers may only fail with
        // application errors.
        for (receipt, expect) in receipts.iter().zip(&expect) {
            if let Err(err) = &receipt.result {
                if !err.is_deterministic() {
                    return errdata!("txn {} failed: {err}", receipt.index);
                }
            }
            if &receipt.result != expect {
                return errdata!(
                    "txn {} result {:?} differs from sequential {:?}",
                    receipt.index,
                    receipt.result,
                    expect
                );
            }
        }
        let state = Self::dump(&scheduler)?;
        if state != Self::dump(&sequential)? {
            return errdata!("final state differs from sequential execution");
        }

        let total: u64 = state
            .iter()
            .filter(|(key, _)| key.starts_with(b"account/"))
            .map(|(_, value)| u64::decode(value))
            .sum::<Result<u64>>()?;
        if total != self.accounts * self.balance {
            return errdata!("total balance {total} differs from {}", self.accounts * self.balance);
        }
        let failed = receipts.iter().filter(|r| r.result.is_err()).count();
        println!(
            "Verified {} receipts ({failed} failed transfers), total balance {total}",
            receipts.len()
        );
        Ok(())
    }

    /// Creates an engine with the initial account balances.
    fn setup(&self) -> Memory {
        (0..self.accounts).map(|id| (Txn::account(id), self.balance.encode())).collect()
    }

    /// Generates the block.
    fn generate(&self) -> Vec<Txn> {
        let mut rng = rand::rngs::StdRng::seed_from_u64(self.seed);
        let mut block = Vec::with_capacity(self.transfers);
        for i in 0..self.transfers {
            if self.audit_every > 0 && i > 0 && i % self.audit_every == 0 {
                block.push(Txn::Audit);
            }
            let from = rng.gen_range(0..self.accounts);
            let to = (from + rng.gen_range(1..self.accounts)) % self.accounts;
            let amount = rng.gen_range(1..=self.max_transfer.max(1));
            block.push(Txn::Transfer { from, to, amount });
        }
        block
    }

    /// Returns all key/value pairs in a scheduler's engine.
    fn dump(scheduler: &Scheduler<Memory>) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        scheduler.engine().read().scan(..).collect()
    }
}

/// A bank transaction.
enum Txn {
    /// Transfers an amount between two accounts, failing on overdraft.
    Transfer { from: u64, to: u64, amount: u64 },
    /// Sums all account balances, and records the total.
    Audit,
}

impl Txn {
    fn account(id: u64) -> Vec<u8> {
        format!("account/{id:08}").into_bytes()
    }
}

impl<E: Engine> Transaction<E> for Txn {
    fn execute(&self, view: &mut View<E>) -> Result<Vec<u8>> {
        match self {
            Txn::Transfer { from, to, amount } => {
                let (from, to) = (Self::account(*from), Self::account(*to));
                let from_balance = u64::maybe_decode(view.get(&from)?)?.unwrap_or(0);
                if from_balance < *amount {
                    return Err(Error::Application(format!(
                        "insufficient balance {from_balance} for transfer of {amount}"
                    )));
                }
                let to_balance = u64::maybe_decode(view.get(&to)?)?.unwrap_or(0);
                view.set(&from, (from_balance - amount).encode());
                view.set(&to, (to_balance + amount).encode());
                Ok((from_balance - amount).encode())
            }
            Txn::Audit => {
                let mut total = 0u64;
                for item in view.iterator(prefix_range(b"account/"))? {
                    let (_, value) = item?;
                    total += u64::decode(&value)?;
                }
                view.set(b"audit/total", total.encode());
                Ok(total.encode())
            }
        }
    }
}

/// Benchmark settings, loaded from the configuration file and environment.
#[derive(Debug, Deserialize)]
struct Settings {
    log_level: String,
    workers: usize,
    validation_workers: usize,
    max_iterations: usize,
}

impl Settings {
    fn new(file: &str) -> Result<Self> {
        let defaults = Config::default();
        Ok(config::Config::builder()
            .set_default("log_level", "info")?
            .set_default("workers", defaults.workers as i64)?
            .set_default("validation_workers", defaults.validation_workers as i64)?
            .set_default("max_iterations", defaults.max_iterations as i64)?
            .add_source(config::File::with_name(file))
            .add_source(config::Environment::with_prefix("OCCDB"))
            .build()?
            .try_deserialize()?)
    }

    fn scheduler_config(&self) -> Config {
        Config {
            workers: self.workers,
            validation_workers: self.validation_workers,
            max_iterations: self.max_iterations,
        }
    }
}
