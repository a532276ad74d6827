//! At most one activation per grain, whichever silo calls first.

use moongrain::directory::GrainDirectory;
use moongrain::transactions::TransactionError;
use moongrain::{GrainError, GrainId, GrainType, SiloAddress};

use crate::harness::{run_local_test, Location, TestCluster, ACCOUNT, BANK, COUNTER};

#[test]
fn test_concurrent_first_calls_share_one_activation() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;

        let a = cluster.silo(0).grain(COUNTER, "shared");
        let b = cluster.silo(1).grain(COUNTER, "shared");
        let c = cluster.silo(2).grain(COUNTER, "shared");
        let (ra, rb, rc) = tokio::join!(
            a.call::<_, u64>("increment", &1u64),
            b.call::<_, u64>("increment", &1u64),
            c.call::<_, u64>("increment", &1u64),
        );
        let mut totals = vec![ra.unwrap(), rb.unwrap(), rc.unwrap()];
        totals.sort_unstable();
        assert_eq!(totals, vec![1, 2, 3]);

        let mut locations = Vec::new();
        for silo in &cluster.silos {
            let here: Location = silo.grain(COUNTER, "shared").call("whereami", &()).await.unwrap();
            locations.push(here);
        }
        assert!(locations.windows(2).all(|w| w[0] == w[1]), "{locations:?}");

        let stats = cluster
            .silo(0)
            .get_detailed_grain_statistics(Some(&[COUNTER]))
            .await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].activation_id, locations[0].1);
        assert_eq!(stats[0].grain_type_name, "counter");
    });
}

#[test]
fn test_shared_directory_keeps_single_activation() {
    run_local_test(async {
        let mut cluster = TestCluster::with_shared_directory();
        cluster.start(3).await;
        assert!(cluster.silo(0).directory_partition().is_none());

        let a = cluster.silo(0).grain(COUNTER, "shared");
        let b = cluster.silo(2).grain(COUNTER, "shared");
        let (ra, rb) = tokio::join!(
            a.call::<_, u64>("increment", &1u64),
            b.call::<_, u64>("increment", &1u64),
        );
        assert_eq!(ra.unwrap() + rb.unwrap(), 3);

        let total: u64 = cluster.silo(1).grain(COUNTER, "shared").call("get", &()).await.unwrap();
        assert_eq!(total, 2);
        assert_eq!(cluster.silo(1).get_total_activation_count().await, 1);
    });
}

#[test]
fn test_many_grains_each_activated_once() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;

        for round in 0..3usize {
            for key in 0..10i64 {
                let silo = cluster.silo((key as usize + round) % 3);
                let _: u64 = silo.grain(COUNTER, key).call("increment", &1u64).await.unwrap();
            }
        }
        for key in 0..10i64 {
            let total: u64 = cluster.silo(0).grain(COUNTER, key).call("get", &()).await.unwrap();
            assert_eq!(total, 3, "counter {key}");
        }
        assert_eq!(cluster.silo(1).get_total_activation_count().await, 10);
    });
}

#[test]
fn test_deactivate_then_reactivate_with_fresh_state() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        let grain = cluster.silo(0).grain(COUNTER, "cycle");

        let _: u64 = grain.call("increment", &5u64).await.unwrap();
        let (_, first): Location = grain.call("whereami", &()).await.unwrap();
        let _: () = grain.call("deactivate", &()).await.unwrap();

        let value: u64 = grain.call("get", &()).await.unwrap();
        assert_eq!(value, 0);
        let (_, second): Location = grain.call("whereami", &()).await.unwrap();
        assert_ne!(first, second);
    });
}

#[test]
fn test_unknown_grain_type_rejected() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;
        let result = cluster
            .silo(0)
            .grain(GrainType(0xDEAD), "x")
            .call::<_, u64>("get", &())
            .await;
        assert!(matches!(result, Err(GrainError::UnknownGrainType { .. })));
    });
}

#[test]
fn test_unknown_method_reaches_caller() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        let result = cluster
            .silo(1)
            .grain(COUNTER, "x")
            .call::<_, u64>("explode", &())
            .await;
        assert!(matches!(
            result,
            Err(GrainError::UnknownMethod { method, .. }) if method == "explode"
        ));
    });
}

#[test]
fn test_stateless_worker_runs_on_calling_silo() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        for silo in &cluster.silos {
            let here: SiloAddress = silo.grain(BANK, 0i64).call("where", &()).await.unwrap();
            assert_eq!(&here, silo.address());
        }
        // Workers bypass the directory.
        let record = cluster
            .silo(0)
            .directory()
            .lookup(&GrainId::new(BANK, 0i64))
            .await
            .unwrap();
        assert!(record.is_none());
    });
}

#[test]
fn test_join_required_outside_transaction() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;
        let result = cluster
            .silo(0)
            .grain(ACCOUNT, "alice")
            .call::<_, ()>("withdraw", &10i64)
            .await;
        assert!(matches!(
            result,
            Err(GrainError::Transaction(TransactionError::NotSupported { .. }))
        ));
    });
}

#[test]
fn test_management_lists_hosts() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        let hosts = cluster.silo(2).get_hosts(true);
        assert_eq!(hosts.len(), 3);
        for silo in &cluster.silos {
            assert!(hosts.contains_key(silo.address()));
        }
    });
}
