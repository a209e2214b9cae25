//! Failure detection, elections, and epoch conflict scenarios.

use flint_cluster::{key_slot, ClientState, ClusterHealth, RouteDecision};

use crate::helpers::TestCluster;

/// Three slot-serving masters plus a replica of the first, fully meshed.
fn master_trio_with_replica() -> (TestCluster, [usize; 4]) {
    let mut cluster = TestCluster::new(4);
    cluster.meet(0, 1);
    cluster.meet(0, 2);
    cluster.meet(0, 3);
    cluster.run_for(4000);

    cluster.engine(0).cluster_addslots(&[100]).unwrap();
    cluster.engine(1).cluster_addslots(&[200]).unwrap();
    cluster.engine(2).cluster_addslots(&[300]).unwrap();
    cluster.run_for(2000);

    // node 3 replicates node 0
    let m1 = cluster.id(0);
    let now = cluster.now;
    cluster.engine(3).cluster_replicate(m1, now).unwrap();
    let contact = cluster.now;
    cluster.engine(3).data_mut().set_master_contact(contact);
    cluster.run_for(2000);

    (cluster, [0, 1, 2, 3])
}

fn own_config_epoch(cluster: &TestCluster, i: usize) -> u64 {
    let id = cluster.id(i);
    cluster.engine_ref(i).node(&id).unwrap().config_epoch
}

#[test]
fn epoch_collision_resolves_to_distinct_epochs() {
    let mut cluster = TestCluster::new(2);
    // both start with configEpoch 0; the first exchange collides
    assert_eq!(own_config_epoch(&cluster, 0), 0);
    cluster.meet(0, 1);
    cluster.run_for(3000);

    let (epoch_a, id_a) = (own_config_epoch(&cluster, 0), cluster.id(0));
    let (epoch_b, id_b) = (own_config_epoch(&cluster, 1), cluster.id(1));

    assert_ne!(epoch_a, epoch_b, "collision must resolve");
    // the lexicographically greater identity yielded and took epoch 1
    let (greater_epoch, smaller_epoch) = if id_a > id_b {
        (epoch_a, epoch_b)
    } else {
        (epoch_b, epoch_a)
    };
    assert_eq!(greater_epoch, 1);
    assert_eq!(smaller_epoch, 0);
    assert!(cluster.engine_ref(0).current_epoch() >= 1);
    assert!(cluster.engine_ref(1).current_epoch() >= 1);
}

#[test]
fn dead_master_is_failed_by_quorum() {
    let (mut cluster, [m1, m2, _, _]) = master_trio_with_replica();
    let m1_id = cluster.id(m1);

    cluster.kill(m1);
    cluster.run_for(4000);

    // the survivors agree on FAIL, not just PFAIL
    let view = cluster.engine_ref(m2).node(&m1_id).unwrap();
    assert!(view.failed(), "expected FAIL after quorum, flags: {}", view.flags);
}

#[test]
fn replica_wins_election_and_takes_over() {
    let (mut cluster, [m1, m2, m3, r]) = master_trio_with_replica();
    let r_id = cluster.id(r);

    cluster.kill(m1);
    // failure detection, FAIL propagation, election delay, vote, takeover
    cluster.run_for(8000);

    // the replica promoted itself and claimed the failed master's slot
    assert!(cluster.engine_ref(r).myself_is_master());
    assert_eq!(cluster.engine_ref(r).slot_owner(100), Some(r_id));

    // the new configuration beat the old master's epoch
    let new_epoch = cluster.engine_ref(r).node(&r_id).unwrap().config_epoch;
    assert!(new_epoch >= 1, "promotion must carry a new configEpoch");

    // the other masters learned the takeover and redirect to the winner
    for i in [m2, m3] {
        assert_eq!(
            cluster.engine_ref(i).slot_owner(100),
            Some(r_id),
            "node {i} should see the new owner"
        );
        let key = format!("{{{}}}k", tag_for(100));
        let set = ["SET", key.as_str(), "1"];
        let args: Vec<&[u8]> = set.iter().map(|s| s.as_bytes()).collect();
        let decision = cluster
            .engine_ref(i)
            .route(&args, &ClientState::default());
        assert_eq!(
            decision,
            RouteDecision::Moved {
                slot: 100,
                node: r_id
            }
        );
    }

    assert_eq!(cluster.engine_ref(r).state(), ClusterHealth::Ok);
}

#[test]
fn manual_failover_promotes_without_failure() {
    let (mut cluster, [m1, _, _, r]) = master_trio_with_replica();
    let m1_id = cluster.id(m1);
    let r_id = cluster.id(r);

    // keep offsets in sync so the handshake completes instantly
    cluster.engine(m1).data_mut().set_offset(500);
    cluster.engine(r).data_mut().set_offset(500);

    let now = cluster.now;
    cluster.engine(r).cluster_failover(false, false, now).unwrap();
    cluster.run_for(4000);

    assert!(cluster.engine_ref(r).myself_is_master());
    assert_eq!(cluster.engine_ref(r).slot_owner(100), Some(r_id));
    // the old master followed the new configuration and demoted
    let old = cluster.engine_ref(m1).myself_is_master();
    assert!(!old, "old master should reconfigure as a replica");
    assert_eq!(
        cluster.engine_ref(m1).node(&m1_id).unwrap().replicates,
        Some(r_id)
    );
}

#[test]
fn replica_migrates_to_orphaned_master() {
    let mut cluster = TestCluster::new(5);
    for j in 1..5 {
        cluster.meet(0, j);
    }
    cluster.run_for(4000);

    // masters 0 and 1 serve slots; replicas 2 and 3 back node 0; node 4
    // backs node 1, then dies, leaving node 1 orphaned
    cluster.engine(0).cluster_addslots(&[100]).unwrap();
    cluster.engine(1).cluster_addslots(&[200]).unwrap();
    cluster.run_for(2000);

    let m0 = cluster.id(0);
    let m1 = cluster.id(1);
    for r in [2usize, 3] {
        let now = cluster.now;
        cluster.engine(r).cluster_replicate(m0, now).unwrap();
        let contact = cluster.now;
        cluster.engine(r).data_mut().set_master_contact(contact);
    }
    let now = cluster.now;
    cluster.engine(4).cluster_replicate(m1, now).unwrap();
    cluster.run_for(2000);

    cluster.kill(4);
    // node 4 must be seen as FAIL before node 1 counts as orphaned
    cluster.run_for(6000);

    let migrated: Vec<usize> = [2usize, 3]
        .into_iter()
        .filter(|&r| {
            cluster
                .engine_ref(r)
                .node(&cluster.id(r))
                .unwrap()
                .replicates
                == Some(m1)
        })
        .collect();
    assert_eq!(
        migrated.len(),
        1,
        "exactly one replica should migrate to the orphaned master"
    );
}

fn tag_for(slot: u16) -> String {
    (0u32..)
        .map(|i| format!("t{i}"))
        .find(|t| key_slot(t.as_bytes()) == slot)
        .expect("some tag hits the slot")
}
