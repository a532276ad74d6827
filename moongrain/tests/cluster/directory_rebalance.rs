//! Directory partitions follow the ring as silos join and die.

use std::collections::HashSet;

use moongrain::directory::GrainDirectory;
use moongrain::GrainId;

use crate::harness::{run_local_test, sleep_secs, Location, TestCluster, COUNTER};

const GRAINS: i64 = 24;

async fn activate_all(cluster: &TestCluster) {
    for key in 0..GRAINS {
        let _: u64 = cluster
            .silo(0)
            .grain(COUNTER, key)
            .call("increment", &1u64)
            .await
            .unwrap();
    }
}

async fn assert_single_activations(cluster: &TestCluster, expected: usize) {
    let stats = cluster
        .silo(0)
        .get_detailed_grain_statistics(Some(&[COUNTER]))
        .await;
    let distinct: HashSet<&GrainId> = stats.iter().map(|s| &s.grain).collect();
    assert_eq!(stats.len(), expected, "{stats:?}");
    assert_eq!(distinct.len(), expected);
}

#[test]
fn test_grains_reachable_after_host_dies() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        activate_all(&cluster).await;
        let victim = cluster.silo(2).address().clone();
        let lost = cluster.silo(2).local_activation_count();

        cluster.silo(2).kill();
        sleep_secs(10).await;
        let survivors = &cluster.silos[..2];

        for key in 0..GRAINS {
            let (host, _): Location = survivors[key as usize % 2]
                .grain(COUNTER, key)
                .call("whereami", &())
                .await
                .unwrap();
            assert_ne!(host, victim);
        }
        // Survivors keep their activations; the victim's restart from zero.
        let mut restarted = 0;
        for key in 0..GRAINS {
            let value: u64 = cluster.silo(0).grain(COUNTER, key).call("get", &()).await.unwrap();
            if value == 0 {
                restarted += 1;
            }
        }
        assert_eq!(restarted, lost);
        assert_single_activations(&cluster, GRAINS as usize).await;
    });
}

#[test]
fn test_records_for_dead_silo_are_purged() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        activate_all(&cluster).await;
        let victim = cluster.silo(1).address().clone();

        cluster.silo(1).kill();
        sleep_secs(10).await;

        for silo in [cluster.silo(0), cluster.silo(2)] {
            let partition = silo.directory_partition().unwrap().partition().all();
            assert!(partition.iter().all(|record| record.silo != victim), "{partition:?}");
        }
    });
}

#[test]
fn test_joining_silo_takes_over_its_range() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        activate_all(&cluster).await;

        let joined = cluster.start_silo(11_200).await;
        cluster.settle().await;

        // Every silo resolves every grain to the same activation, whoever
        // owns the directory range now.
        for key in 0..GRAINS {
            let grain = GrainId::new(COUNTER, key);
            let mut seen = HashSet::new();
            for silo in &cluster.silos {
                let record = silo.directory().lookup(&grain).await.unwrap();
                seen.insert(record.map(|r| r.activation_id));
            }
            assert_eq!(seen.len(), 1, "{grain}: {seen:?}");
            assert!(!seen.contains(&None));
        }

        let owned_by_new: usize = (0..GRAINS)
            .filter(|key| {
                joined.view().ring().owner_of(&GrainId::new(COUNTER, *key))
                    == Some(joined.address())
            })
            .count();
        assert_eq!(joined.directory_partition().unwrap().partition().len(), owned_by_new);
        assert_single_activations(&cluster, GRAINS as usize).await;
    });
}

#[test]
fn test_graceful_stop_hands_off_partition() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        activate_all(&cluster).await;
        let leaving = cluster.silo(2).address().clone();
        let moved = cluster.silo(2).local_activation_count();

        cluster.silo(2).stop().await.unwrap();
        cluster.settle().await;

        let remaining: usize = cluster.silos[..2]
            .iter()
            .map(|silo| silo.directory_partition().unwrap().partition().len())
            .sum();
        assert_eq!(remaining, GRAINS as usize - moved);
        for silo in &cluster.silos[..2] {
            let partition = silo.directory_partition().unwrap().partition().all();
            assert!(partition.iter().all(|record| record.silo != leaving));
        }

        for key in 0..GRAINS {
            let _: u64 = cluster.silo(1).grain(COUNTER, key).call("get", &()).await.unwrap();
        }
        assert_single_activations(&cluster, GRAINS as usize).await;
    });
}
