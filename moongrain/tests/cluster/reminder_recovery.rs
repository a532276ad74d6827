//! Reminder ownership follows the ring; ticks keep coming when the owner
//! dies.

use std::time::Duration;

use moongrain::reminders::ReminderHandle;
use moongrain::{GrainId, Silo, SiloState, TimeProvider};

use crate::harness::{addr, run_local_test, sleep_secs, TestCluster, ALARM};

async fn arm(silo: &Silo, key: i64, name: &str) -> ReminderHandle {
    silo.grain(ALARM, key)
        .call("arm", &(name.to_string(), 500u64, 1_000u64))
        .await
        .unwrap()
}

fn armed_everywhere(cluster: &TestCluster) -> Vec<(GrainId, String)> {
    let mut all: Vec<_> = cluster
        .silos
        .iter()
        .filter(|silo| silo.state() == SiloState::Running)
        .flat_map(|silo| silo.reminders().armed())
        .collect();
    all.sort();
    all
}

fn assert_armed_once(cluster: &TestCluster, expected: usize) {
    let armed = armed_everywhere(cluster);
    let mut distinct = armed.clone();
    distinct.dedup();
    assert_eq!(armed.len(), expected, "{armed:?}");
    assert_eq!(distinct.len(), expected, "{armed:?}");
}

#[test]
fn test_reminder_ticks_reach_grain() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        arm(cluster.silo(0), 1, "wake").await;

        sleep_secs(5).await;

        let ticks = cluster.ticks.borrow().clone();
        assert!(ticks.len() >= 4, "{ticks:?}");
        assert!(ticks.iter().all(|t| t.name == "wake"));
        assert!(ticks.windows(2).all(|w| w[0].at < w[1].at), "{ticks:?}");

        let names: Vec<String> = cluster
            .silo(1)
            .grain(ALARM, 1i64)
            .call("list", &())
            .await
            .unwrap();
        assert_eq!(names, vec!["wake".to_string()]);
    });
}

#[test]
fn test_unregister_stops_ticks() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        let handle = arm(cluster.silo(1), 2, "once").await;
        sleep_secs(3).await;

        let _: () = cluster.silo(0).grain(ALARM, 2i64).call("disarm", &handle).await.unwrap();
        sleep_secs(1).await;
        let seen = cluster.ticks.borrow().len();
        assert!(seen > 0);

        sleep_secs(5).await;
        assert_eq!(cluster.ticks.borrow().len(), seen);
        assert!(cluster.reminder_table.is_empty());
        assert_armed_once(&cluster, 0);
    });
}

#[test]
fn test_each_reminder_armed_once_as_cluster_grows() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        for key in 0..10i64 {
            arm(cluster.silo(key as usize % 3), key, "poll").await;
        }
        sleep_secs(2).await;
        assert_armed_once(&cluster, 10);

        cluster.start_silo(11_300).await;
        cluster.settle().await;
        assert_armed_once(&cluster, 10);
    });
}

#[test]
fn test_reminders_survive_owner_kill() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(3).await;
        for key in 0..6i64 {
            arm(cluster.silo(0), key, "heartbeat").await;
        }
        sleep_secs(3).await;

        let victim = cluster
            .silos
            .iter()
            .position(|silo| !silo.reminders().armed().is_empty())
            .unwrap();
        let victim_address = cluster.silo(victim).address().clone();
        cluster.silo(victim).kill();
        let killed_at = cluster.time.timer();

        sleep_secs(15).await;

        assert_armed_once(&cluster, 6);
        // Every reminder ticked after the kill, including those the victim
        // owned, and no tick ran on the dead silo.
        let ticks = cluster.ticks.borrow();
        for key in 0..6i64 {
            let grain = GrainId::new(ALARM, key);
            let late = ticks
                .iter()
                .filter(|t| t.grain == grain && t.at > killed_at + Duration::from_secs(5))
                .count();
            assert!(late >= 3, "{grain} ticked {late} times after the kill");
        }
        assert!(ticks
            .iter()
            .filter(|t| t.at > killed_at)
            .all(|t| t.silo != victim_address));
    });
}

#[test]
fn test_reminder_fires_after_whole_cluster_restart() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(2).await;
        arm(cluster.silo(0), 7, "survivor").await;
        sleep_secs(2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;

        // Mid-period: the last tick was 800ms ago.
        for silo in cluster.silos.clone() {
            silo.kill();
        }
        let stopped_at = cluster.time.timer();
        sleep_secs(30).await;

        let restarted_at = cluster.time.timer();
        for port in [11_111, 11_112] {
            cluster.start_silo_at(addr(port).with_generation(2)).await;
        }
        cluster.settle().await;
        sleep_secs(3).await;

        let ticks = cluster.ticks.borrow();
        assert!(ticks.iter().all(|t| t.at <= stopped_at || t.at > restarted_at));
        let after: Vec<Duration> = ticks
            .iter()
            .filter(|t| t.at > restarted_at)
            .map(|t| t.at - restarted_at)
            .collect();
        assert!(after.len() >= 3, "{after:?}");
        // One period once the new silos have read each other's rows.
        let period = Duration::from_secs(1);
        let deadline = cluster.membership.table_refresh_interval + period;
        assert!(after[0] <= deadline, "first tick {:?} after restart", after[0]);
        drop(ticks);
        assert_armed_once(&cluster, 1);
    });
}
