//! Coordination patterns over many farms and VMs.
//!
//! These are the reusable shapes a villein composes a distributed
//! computation from: allocate a working set of farms from the presence
//! feed, scatter a request across the set in parallel, and gather the
//! per-branch outcomes keyed by the remote that produced them.
//!
//! Every pattern is partial-success: a refused, missing or silent remote
//! costs the caller that one branch, never the batch. Allocation returns
//! whatever it found when the deadline elapses; submission records a
//! per-job fault inline instead of raising.
use std::collections::{hash_map::Entry, HashMap, HashSet};
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, warn};

use crate::{
    cloud::{PeerId, PeerKind},
    villein::{FarmProxy, JobStruct, Villein, VmProxy},
};

/// Collect up to `want` available farms, waiting on the presence feed
/// until enough are found or `deadline` elapses.
///
/// The feed is subscribed before the roster snapshot is taken, so an
/// announcement can never fall between the two. A farm that announces
/// itself unavailable while allocation is still running is dropped from
/// the working set again.
pub async fn allocate_farms(villein: &Villein, want: usize, deadline: Duration) -> HashSet<FarmProxy> {
    let mut feed = villein.presences();
    let mut allocated: HashMap<PeerId, FarmProxy> = HashMap::new();

    let seed = |allocated: &mut HashMap<PeerId, FarmProxy>| {
        for farm in villein.known_farms() {
            if farm.presence().available {
                allocated.insert(farm.peer().clone(), farm);
            }
        }
    };
    seed(&mut allocated);

    let end = tokio::time::Instant::now() + deadline;
    while allocated.len() < want {
        let presence = match tokio::time::timeout_at(end, feed.recv()).await {
            Ok(Ok(presence)) => presence,
            Ok(Err(RecvError::Lagged(missed))) => {
                // Missed announcements; recover from a fresh snapshot.
                debug!(missed, "presence feed lagged");
                seed(&mut allocated);
                continue;
            }
            Ok(Err(RecvError::Closed)) | Err(_) => break,
        };

        if presence.kind != PeerKind::Farm {
            continue;
        }
        if !presence.available {
            allocated.remove(&presence.peer);
            continue;
        }
        match allocated.entry(presence.peer.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().refresh(presence),
            Entry::Vacant(entry) => {
                entry.insert(villein.farm_proxy(presence));
            }
        }
    }

    if allocated.len() < want {
        debug!(want, got = allocated.len(), "allocation deadline elapsed");
    }
    allocated.into_values().take(want).collect()
}

/// Ask every farm in the set for `per_farm` VMs in parallel, returning the
/// proxies of the ones that were granted. Refusals are logged and skipped.
pub async fn scatter_spawn_vm(
    farms: &HashSet<FarmProxy>,
    language: &str,
    per_farm: usize,
    deadline: Duration,
) -> Vec<VmProxy> {
    let attempts = farms
        .iter()
        .flat_map(|farm| std::iter::repeat(farm).take(per_farm))
        .map(|farm| async move {
            farm.spawn_vm(language, deadline)
                .await
                .map_err(|fault| (farm.peer().clone(), fault))
        });

    join_all(attempts)
        .await
        .into_iter()
        .filter_map(|granted| match granted {
            Ok(vm) => Some(vm),
            Err((farm, fault)) => {
                warn!(%farm, %fault, "spawn refused");
                None
            }
        })
        .collect()
}

/// Submit one job per VM in parallel and gather the outcomes keyed by the
/// VM that ran them.
///
/// Infallible by construction: a branch whose VM faults or never answers
/// comes back with the fault recorded on its job, alongside the successes.
pub async fn scatter_submit_job(
    batch: impl IntoIterator<Item = (VmProxy, JobStruct)>,
    deadline: Duration,
) -> HashMap<VmProxy, JobStruct> {
    let branches = batch.into_iter().map(|(vm, job)| async move {
        let job = vm.submit_job(job, deadline).await;
        (vm, job)
    });
    join_all(branches).await.into_iter().collect()
}

/// Tear a batch of VMs down without waiting for acknowledgements.
pub async fn scatter_terminate_vm(vms: impl IntoIterator<Item = VmProxy>) {
    join_all(vms.into_iter().map(|vm| async move { vm.fire_terminate().await })).await;
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        cloud::{Cloud, InMemoryCloud},
        config::Config,
        engine::EngineRegistry,
        farm::Farm,
        job::JobStatus,
        packet::VmId,
    };

    const SHORT: Duration = Duration::from_millis(200);
    const LONG: Duration = Duration::from_secs(5);

    async fn start_farms(cloud: &Arc<InMemoryCloud>, count: usize) -> Vec<Farm> {
        let mut farms = Vec::with_capacity(count);
        for _ in 0..count {
            farms.push(
                Farm::start(
                    cloud.clone(),
                    &Config::default(),
                    EngineRegistry::with_defaults(),
                )
                .await
                .unwrap(),
            );
        }
        farms
    }

    fn is_prime(n: u64) -> bool {
        n >= 2 && (2..n).take_while(|d| d * d <= n).all(|d| n % d != 0)
    }

    #[tokio::test]
    async fn allocation_is_partial_not_failing() {
        let cloud = Arc::new(InMemoryCloud::default());
        let _farms = start_farms(&cloud, 2).await;
        let villein = Villein::connect(cloud).await.unwrap();

        // Asking for more farms than exist yields what there is.
        let allocated = allocate_farms(&villein, 5, SHORT).await;
        assert_eq!(allocated.len(), 2);
    }

    #[tokio::test]
    async fn allocation_picks_up_late_announcements() {
        let cloud = Arc::new(InMemoryCloud::default());
        let villein = Villein::connect(cloud.clone()).await.unwrap();

        let late = tokio::spawn({
            let cloud = cloud.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                start_farms(&cloud, 1).await
            }
        });

        let allocated = allocate_farms(&villein, 1, LONG).await;
        assert_eq!(allocated.len(), 1);
        drop(late.await.unwrap());
    }

    #[tokio::test]
    async fn a_farm_turning_unavailable_is_dropped_again() {
        let cloud = Arc::new(InMemoryCloud::default());
        let farm = Farm::start(
            cloud.clone(),
            &Config {
                vm_capacity: 1,
                ..Default::default()
            },
            EngineRegistry::with_defaults(),
        )
        .await
        .unwrap();
        let villein = Villein::connect(cloud).await.unwrap();

        let allocation = tokio::spawn({
            let villein = villein.clone();
            // Wants two, so it keeps listening past the initial seed.
            async move { allocate_farms(&villein, 2, Duration::from_millis(300)).await }
        });

        // Fill the farm's only slot while allocation is still waiting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        farm.spawn_vm("calc").await.unwrap();

        let allocated = allocation.await.unwrap();
        assert!(allocated.is_empty());
    }

    #[tokio::test]
    async fn one_silent_vm_costs_one_branch_not_the_batch() {
        let cloud = Arc::new(InMemoryCloud::default());
        let _farms = start_farms(&cloud, 2).await;
        let villein = Villein::connect(cloud.clone()).await.unwrap();

        let allocated = allocate_farms(&villein, 2, SHORT).await;
        let mut vms = scatter_spawn_vm(&allocated, "calc", 1, LONG).await;
        assert_eq!(vms.len(), 2);

        // A VM on a peer that is bound but never answers.
        let silent_peer = crate::cloud::PeerId::fresh("farm");
        let _inbox = cloud.bind(&silent_peer).await.unwrap();
        vms.push(VmProxy::new(villein.clone(), silent_peer, VmId::fresh()));

        let batch = vms
            .iter()
            .cloned()
            .map(|vm| (vm, JobStruct::new("20 + 52;")));
        let outcomes = scatter_submit_job(batch, Duration::from_millis(300)).await;
        assert_eq!(outcomes.len(), 3);

        let timed_out = outcomes
            .values()
            .filter(|job| job.status == JobStatus::Timeout)
            .count();
        let succeeded = outcomes.values().filter(|job| job.was_successful()).count();
        assert_eq!(timed_out, 1);
        assert_eq!(succeeded, 2);
        for job in outcomes.values().filter(|job| job.was_successful()) {
            assert_eq!(job.result.as_ref().unwrap().to_string(), "72");
        }
    }

    #[tokio::test]
    async fn partitioned_primes_match_a_sequential_scan() {
        let cloud = Arc::new(InMemoryCloud::default());
        let _farms = start_farms(&cloud, 3).await;
        let villein = Villein::connect(cloud).await.unwrap();

        let allocated = allocate_farms(&villein, 3, SHORT).await;
        let vms = scatter_spawn_vm(&allocated, "calc", 1, LONG).await;
        assert_eq!(vms.len(), 3);

        let ranges = [(2u64, 17u64), (18, 33), (34, 50)];
        let batch = vms
            .iter()
            .cloned()
            .zip(ranges)
            .map(|(vm, (lo, hi))| (vm, JobStruct::new(format!("primes({lo}, {hi})"))));
        let outcomes = scatter_submit_job(batch, LONG).await;

        let mut found: Vec<u64> = outcomes
            .values()
            .inspect(|job| assert!(job.was_successful(), "branch failed: {:?}", job.fault))
            .flat_map(|job| {
                job.result
                    .as_ref()
                    .map(|value| value.to_string())
                    .unwrap_or_default()
                    .split(',')
                    .filter(|part| !part.is_empty())
                    .map(|part| part.trim().parse().unwrap())
                    .collect::<Vec<u64>>()
            })
            .collect();
        found.sort_unstable();

        let expected: Vec<u64> = (2..=50).filter(|n| is_prime(*n)).collect();
        assert_eq!(found, expected);

        scatter_terminate_vm(vms).await;
    }

    #[tokio::test]
    async fn spawn_refusals_are_skipped_not_fatal() {
        let cloud = Arc::new(InMemoryCloud::default());
        let _farm = Farm::start(
            cloud.clone(),
            &Config {
                vm_capacity: 1,
                ..Default::default()
            },
            EngineRegistry::with_defaults(),
        )
        .await
        .unwrap();
        let villein = Villein::connect(cloud).await.unwrap();

        let allocated = allocate_farms(&villein, 1, SHORT).await;
        // Two asks against one slot: exactly one is granted.
        let vms = scatter_spawn_vm(&allocated, "calc", 2, LONG).await;
        assert_eq!(vms.len(), 1);
    }
}
