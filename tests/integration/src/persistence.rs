//! Persistence scenarios: the node view surviving restarts.

use tempfile::tempdir;

use crate::helpers::TestCluster;

#[test]
fn restart_preserves_topology_and_epochs() {
    let dir = tempdir().unwrap();
    let mut cluster = TestCluster::new_persistent(3, dir.path());
    cluster.meet(0, 1);
    cluster.meet(0, 2);
    cluster.run_for(4000);

    cluster.engine(0).cluster_addslots(&[0, 100]).unwrap();
    cluster.engine(1).cluster_addslots(&[200]).unwrap();
    let m0 = cluster.id(0);
    let now = cluster.now;
    cluster.engine(2).cluster_replicate(m0, now).unwrap();
    cluster.run_for(2000);

    let id_before = cluster.id(0);
    let epoch_before = cluster.engine_ref(0).current_epoch();
    let m1 = cluster.id(1);

    cluster.restart(0);

    // identity, peers, slot bindings and epochs all came back from disk
    assert_eq!(cluster.id(0), id_before);
    assert_eq!(cluster.engine_ref(0).current_epoch(), epoch_before);
    assert_eq!(cluster.engine_ref(0).known_nodes(), 3);
    assert_eq!(cluster.engine_ref(0).slot_owner(0), Some(id_before));
    assert_eq!(cluster.engine_ref(0).slot_owner(100), Some(id_before));
    assert_eq!(cluster.engine_ref(0).slot_owner(200), Some(m1));
    let replica = cluster.id(2);
    assert_eq!(
        cluster.engine_ref(0).node(&replica).unwrap().replicates,
        Some(m0)
    );

    // and the restarted node rejoins the mesh
    cluster.run_for(3000);
    assert!(cluster
        .engine_ref(1)
        .node(&id_before)
        .unwrap()
        .link
        .is_connected());
}

#[test]
fn restart_preserves_reshard_markers() {
    let dir = tempdir().unwrap();
    let mut cluster = TestCluster::new_persistent(2, dir.path());
    cluster.meet(0, 1);
    cluster.run_for(3000);

    cluster.engine(0).cluster_addslots(&[42]).unwrap();
    let b = cluster.id(1);
    cluster.engine(0).cluster_setslot_migrating(42, b).unwrap();
    let now = cluster.now;
    cluster.engine(0).before_sleep(now).unwrap();

    cluster.restart(0);
    assert_eq!(cluster.engine_ref(0).migrating_to(42), Some(b));
}
