//! Finds the primes in a range by partitioning it across a fleet of
//! in-process farms.
use std::{sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use demesne::{
    cloud::InMemoryCloud,
    codec::Codec,
    config::Config,
    engine::EngineRegistry,
    farm::Farm,
    init,
    villein::{patterns, JobStruct, Villein},
};
use dotenvy::dotenv;
use tracing::{info, warn};

#[derive(Parser, Debug)]
pub struct Cli {
    #[command(flatten)]
    pub options: Config,

    /// Lower bound of the search range, inclusive.
    #[arg(long, default_value_t = 2)]
    pub lo: u64,

    /// Upper bound of the search range, inclusive.
    #[arg(long, default_value_t = 500)]
    pub hi: u64,

    /// Number of farms to host.
    #[arg(long, default_value_t = 3)]
    pub farm_count: usize,

    /// VMs to spawn on each farm.
    #[arg(long, default_value_t = 2)]
    pub vms_per_farm: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    init::tracing();
    let args = Cli::parse();
    anyhow::ensure!(args.lo <= args.hi, "empty range: {} > {}", args.lo, args.hi);

    let cloud = Arc::new(InMemoryCloud::new(Codec::from(&args.options)));

    // Host the fleet in-process. Each farm binds, announces itself and
    // serves until dropped.
    let mut fleet = Vec::with_capacity(args.farm_count);
    for _ in 0..args.farm_count {
        fleet.push(
            Farm::start(cloud.clone(), &args.options, EngineRegistry::with_defaults()).await?,
        );
    }

    let villein = Villein::connect(cloud).await?;
    let farms = patterns::allocate_farms(&villein, args.farm_count, Duration::from_secs(2)).await;
    info!(allocated = farms.len(), "farms allocated");

    let vms =
        patterns::scatter_spawn_vm(&farms, "calc", args.vms_per_farm, Duration::from_secs(2)).await;
    anyhow::ensure!(!vms.is_empty(), "no VMs granted");
    info!(vms = vms.len(), "vms spawned");

    // One contiguous slice of the range per VM.
    let span = args.hi - args.lo + 1;
    let chunk = (span + vms.len() as u64 - 1) / vms.len() as u64;
    let batch = vms.iter().cloned().enumerate().map(|(i, vm)| {
        let lo = args.lo + chunk * i as u64;
        let hi = (lo + chunk - 1).min(args.hi);
        (vm, JobStruct::new(format!("primes({lo}, {hi})")))
    });

    let outcomes = patterns::scatter_submit_job(batch, Duration::from_secs(30)).await;

    let mut primes: Vec<u64> = Vec::new();
    for (vm, job) in &outcomes {
        match (&job.result, &job.fault) {
            (Some(value), None) => primes.extend(
                value
                    .to_string()
                    .split(',')
                    .filter(|part| !part.is_empty())
                    .filter_map(|part| part.trim().parse::<u64>().ok()),
            ),
            _ => warn!(vm = %vm.vm_id(), status = ?job.status, "branch did not complete"),
        }
    }
    primes.sort_unstable();

    info!(
        count = primes.len(),
        "primes in [{}, {}]: {primes:?}", args.lo, args.hi
    );

    patterns::scatter_terminate_vm(vms).await;
    Ok(())
}
