//! Turn scheduling inside one activation: one turn at a time unless the
//! grain or the method interleaves, queued calls honor cancellation, and a
//! call that can never be served gives up at the response deadline.

use std::time::Duration;

use moongrain::transport::TransportError;
use moongrain::{GrainCancellationToken, GrainError, GrainType, Silo};

use crate::harness::{run_local_test, TestCluster, REENTRANT_SLEEPER, SLEEPER};

async fn hold(silo: &Silo, grain_type: GrainType, ms: u64) {
    let _: () = silo.grain(grain_type, 1i64).call("hold", &ms).await.unwrap();
}

async fn max_running(silo: &Silo, grain_type: GrainType) -> usize {
    silo.grain(grain_type, 1i64).call("max_running", &()).await.unwrap()
}

#[test]
fn test_non_reentrant_turns_run_one_at_a_time() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;
        let silo = cluster.silo(0).clone();

        let started = tokio::time::Instant::now();
        tokio::join!(
            hold(&silo, SLEEPER, 200),
            hold(&silo, SLEEPER, 200),
            hold(&silo, SLEEPER, 200),
        );

        assert!(started.elapsed() >= Duration::from_millis(600));
        assert_eq!(max_running(&silo, SLEEPER).await, 1);
    });
}

#[test]
fn test_reentrant_turns_overlap() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;
        let silo = cluster.silo(0).clone();

        let started = tokio::time::Instant::now();
        tokio::join!(
            hold(&silo, REENTRANT_SLEEPER, 200),
            hold(&silo, REENTRANT_SLEEPER, 200),
            hold(&silo, REENTRANT_SLEEPER, 200),
        );

        assert!(started.elapsed() < Duration::from_millis(400));
        assert_eq!(max_running(&silo, REENTRANT_SLEEPER).await, 3);
    });
}

#[test]
fn test_always_interleave_method_runs_during_a_turn() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;
        let silo = cluster.silo(0).clone();

        let peek = async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            let running: usize = silo.grain(SLEEPER, 1i64).call("peek", &()).await.unwrap();
            (running, tokio::time::Instant::now())
        };
        let busy = async {
            hold(&silo, SLEEPER, 1_000).await;
            tokio::time::Instant::now()
        };
        let ((running, peeked_at), held_until) = tokio::join!(peek, busy);

        assert_eq!(running, 1);
        assert!(peeked_at < held_until);
    });
}

#[test]
fn test_cancelled_queued_call_never_runs() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;
        let silo = cluster.silo(0).clone();
        let token = GrainCancellationToken::new();
        let queued = silo.grain(SLEEPER, 1i64).with_cancellation(token.clone());

        let (_, cancelled, ()) = tokio::join!(
            hold(&silo, SLEEPER, 1_000),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                queued.call::<_, ()>("hold", &0u64).await
            },
            async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                token.cancel();
            },
        );

        assert!(matches!(cancelled, Err(GrainError::Cancelled)), "{cancelled:?}");
        let holds: u64 = silo.grain(SLEEPER, 1i64).call("holds", &()).await.unwrap();
        assert_eq!(holds, 1);
    });
}

#[test]
fn test_non_reentrant_self_call_times_out() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;
        let silo = cluster.silo(0).clone();

        let started = tokio::time::Instant::now();
        let result = silo.grain(SLEEPER, 1i64).call::<_, u64>("call_self", &()).await;
        assert!(
            matches!(result, Err(GrainError::Transport(TransportError::Timeout { .. }))),
            "{result:?}"
        );
        assert!(started.elapsed() < Duration::from_secs(30));

        // The activation is not wedged.
        let holds: u64 = silo.grain(SLEEPER, 1i64).call("holds", &()).await.unwrap();
        assert_eq!(holds, 0);
    });
}

#[test]
fn test_reentrant_self_call_succeeds() {
    run_local_test(async {
        let mut cluster = TestCluster::new();
        cluster.start(1).await;

        let holds: u64 = cluster
            .silo(0)
            .grain(REENTRANT_SLEEPER, 1i64)
            .call("call_self", &())
            .await
            .unwrap();
        assert_eq!(holds, 0);
    });
}
