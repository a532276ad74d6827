//! Failure detection and the suspicion quorum, driven through whole silos.

use moongrain::membership::{MembershipOptions, MembershipTable, QuorumPolicy, SiloStatus};
use moongrain::SiloState;

use crate::harness::{run_local_test, sleep_secs, TestCluster};

#[test]
fn test_killed_silo_declared_dead_by_quorum() {
    run_local_test(async {
        let mut cluster = TestCluster::with_membership(MembershipOptions {
            quorum: QuorumPolicy::Absolute(3),
            ..MembershipOptions::for_simulation()
        });
        cluster.start(5).await;
        let victim = cluster.silo(4).address().clone();

        cluster.silo(4).kill();
        sleep_secs(10).await;

        let data = cluster.table.read_all().await.unwrap();
        let entry = data.entry(&victim).unwrap();
        assert_eq!(entry.status, SiloStatus::Dead);
        assert!(entry.suspect_votes.len() >= 3, "{:?}", entry.suspect_votes);

        for silo in &cluster.silos[..4] {
            assert_eq!(silo.view().status(&victim), Some(SiloStatus::Dead));
            assert_eq!(silo.get_hosts(true).len(), 4);
            assert_eq!(silo.state(), SiloState::Running);
        }
    });
}

#[test]
fn test_single_suspecter_cannot_evict() {
    run_local_test(async {
        let mut cluster = TestCluster::with_membership(MembershipOptions {
            num_probed_silos: 1,
            quorum: QuorumPolicy::Absolute(2),
            ..MembershipOptions::for_simulation()
        });
        cluster.start(3).await;
        let victim = cluster.silo(2).address().clone();

        cluster.silo(2).kill();
        sleep_secs(8).await;

        // Only the ring predecessor probes the victim; its repeated votes
        // count once.
        let data = cluster.table.read_all().await.unwrap();
        let entry = data.entry(&victim).unwrap();
        assert_eq!(entry.status, SiloStatus::Active);
        assert_eq!(entry.suspect_votes.len(), 1);
    });
}

#[test]
fn test_two_probers_reach_quorum() {
    run_local_test(async {
        let mut cluster = TestCluster::with_membership(MembershipOptions {
            num_probed_silos: 2,
            quorum: QuorumPolicy::Absolute(2),
            ..MembershipOptions::for_simulation()
        });
        cluster.start(4).await;
        let victim = cluster.silo(1).address().clone();

        cluster.silo(1).kill();
        sleep_secs(10).await;

        let data = cluster.table.read_all().await.unwrap();
        assert_eq!(data.entry(&victim).unwrap().status, SiloStatus::Dead);
    });
}

#[test]
fn test_graceful_stop_marks_row_dead() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        let leaving = cluster.silo(2).address().clone();

        cluster.silo(2).stop().await.unwrap();
        assert_eq!(cluster.silo(2).state(), SiloState::Stopped);
        cluster.settle().await;

        let data = cluster.table.read_all().await.unwrap();
        let entry = data.entry(&leaving).unwrap();
        assert_eq!(entry.status, SiloStatus::Dead);
        assert!(entry.suspect_votes.is_empty());
        for silo in &cluster.silos[..2] {
            assert_eq!(silo.get_hosts(true).len(), 2);
        }
    });
}

#[test]
fn test_isolated_silo_terminates_itself() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        let isolated = cluster.silo(0).address().clone();

        cluster.transport.isolate(&isolated);
        sleep_secs(10).await;

        let data = cluster.table.read_all().await.unwrap();
        assert_eq!(data.entry(&isolated).unwrap().status, SiloStatus::Dead);
        // The table is still readable, so the silo learns of its own death.
        assert_eq!(cluster.silo(0).state(), SiloState::Stopped);
        assert_eq!(cluster.silo(1).state(), SiloState::Running);
    });
}

#[test]
fn test_restarted_silo_gets_new_generation() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        let old = cluster.silo(1).address().clone();
        cluster.silo(1).kill();
        sleep_secs(10).await;

        let config = moongrain::SiloConfig::builder(moongrain::SiloAddress::new(
            old.ip,
            old.port,
            old.generation + 1,
        ))
        .simulation()
        .build();
        let restarted = moongrain::Silo::start(&cluster.config, config).await.unwrap();
        cluster.settle().await;

        let hosts = cluster.silo(0).get_hosts(true);
        assert!(hosts.contains_key(restarted.address()));
        assert!(!hosts.contains_key(&old));
        assert_eq!(cluster.silo(0).view().status(&old), Some(SiloStatus::Dead));
    });
}
