//! Multi-grain transactions commit everywhere or nowhere.

use moongrain::transactions::StateKey;
use moongrain::{GrainError, GrainId, Silo};

use crate::harness::{run_local_test, sleep_secs, TestCluster, ACCOUNT, BANK};

async fn deposit(silo: &Silo, account: &str, amount: i64) {
    let _: () = silo.grain(ACCOUNT, account).call("deposit", &amount).await.unwrap();
}

async fn balance(silo: &Silo, account: &str) -> i64 {
    silo.grain(ACCOUNT, account).call("balance", &()).await.unwrap()
}

async fn transfer(silo: &Silo, from: &str, to: &str, amount: i64) -> Result<(), GrainError> {
    silo.grain(BANK, 0i64)
        .call("transfer", &(from.to_string(), to.to_string(), amount))
        .await
}

#[test]
fn test_transfer_commits_on_every_participant() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        deposit(cluster.silo(0), "alice", 100).await;

        transfer(cluster.silo(1), "alice", "bob", 30).await.unwrap();

        assert_eq!(balance(cluster.silo(2), "alice").await, 70);
        assert_eq!(balance(cluster.silo(2), "bob").await, 30);
        assert!(cluster.log.committed() >= 2);

        let stored = cluster
            .storage
            .snapshot(&StateKey::new(GrainId::new(ACCOUNT, "bob"), "balance"));
        assert_eq!(stored.committed, Some(serde_json::json!(30)));
        assert!(stored.pending.is_none());
    });
}

#[test]
fn test_failed_debit_rolls_back_credit() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        deposit(cluster.silo(0), "alice", 10).await;

        let result = transfer(cluster.silo(0), "alice", "bob", 50).await;
        assert!(result.is_err());

        assert_eq!(balance(cluster.silo(1), "alice").await, 10);
        assert_eq!(balance(cluster.silo(1), "bob").await, 0);
    });
}

#[test]
fn test_prepare_failure_aborts_both_accounts() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        deposit(cluster.silo(0), "alice", 100).await;
        let committed = cluster.log.committed();

        let bob = GrainId::new(ACCOUNT, "bob");
        cluster
            .faults
            .set_probability(format!("storage.prepare/{bob}"), 1.0);
        let result = transfer(cluster.silo(1), "alice", "bob", 40).await;
        assert!(
            matches!(result, Err(GrainError::Transaction(_))),
            "{result:?}"
        );
        assert!(cluster.faults.fired(&format!("storage.prepare/{bob}")) > 0);
        assert_eq!(cluster.log.committed(), committed);

        cluster.faults.clear();
        assert_eq!(balance(cluster.silo(0), "alice").await, 100);
        assert_eq!(balance(cluster.silo(0), "bob").await, 0);
        let stored = cluster
            .storage
            .snapshot(&StateKey::new(GrainId::new(ACCOUNT, "alice"), "balance"));
        assert!(stored.pending.is_none());

        transfer(cluster.silo(1), "alice", "bob", 40).await.unwrap();
        assert_eq!(balance(cluster.silo(0), "bob").await, 40);
    });
}

#[test]
fn test_concurrent_transfers_conserve_total() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        deposit(cluster.silo(0), "alice", 100).await;

        let (first, second) = tokio::join!(
            transfer(cluster.silo(1), "alice", "bob", 60),
            transfer(cluster.silo(2), "alice", "carol", 60),
        );
        // Insufficient funds or a write conflict stops at least one.
        assert!(first.is_err() || second.is_err());

        let alice = balance(cluster.silo(0), "alice").await;
        let bob = balance(cluster.silo(0), "bob").await;
        let carol = balance(cluster.silo(0), "carol").await;
        assert!(alice >= 0);
        assert_eq!(alice + bob + carol, 100);
    });
}

#[test]
fn test_committed_balance_survives_host_crash() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        deposit(cluster.silo(0), "alice", 100).await;
        transfer(cluster.silo(0), "alice", "bob", 25).await.unwrap();

        let alice = GrainId::new(ACCOUNT, "alice");
        let stats = cluster
            .silo(0)
            .get_detailed_grain_statistics(Some(&[ACCOUNT]))
            .await;
        let host = stats
            .iter()
            .find(|s| s.grain == alice)
            .map(|s| s.silo.clone())
            .unwrap();
        let index = cluster
            .silos
            .iter()
            .position(|silo| silo.address() == &host)
            .unwrap();
        let survivor = cluster.silo((index + 1) % 3).clone();

        cluster.silo(index).kill();
        sleep_secs(10).await;

        assert_eq!(balance(&survivor, "alice").await, 75);
        assert_eq!(balance(&survivor, "bob").await, 25);
    });
}
