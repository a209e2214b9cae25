//! Routing scenarios: slot ownership, redirections, cross-slot checks.

use flint_cluster::{key_slot, ClientState, RouteDecision};

use crate::helpers::TestCluster;

fn argv<'a>(parts: &'a [&'a str]) -> Vec<&'a [u8]> {
    parts.iter().map(|s| s.as_bytes()).collect()
}

/// Finds a hash tag whose slot is exactly `slot`.
fn tag_for_slot(slot: u16) -> String {
    (0u32..)
        .map(|i| format!("t{i}"))
        .find(|t| key_slot(t.as_bytes()) == slot)
        .expect("some tag hits the slot")
}

#[test]
fn keyslot_and_clusterdown_progression() {
    let mut cluster = TestCluster::new(1);
    cluster.engine(0).cluster_addslots(&[0, 1, 2, 3]).unwrap();
    cluster.run_for(3000);

    assert_eq!(key_slot(b"foo"), 12182);

    // slot 12182 is unowned: not served
    let client = ClientState::default();
    let decision = cluster.engine_ref(0).route(&argv(&["GET", "foo"]), &client);
    assert_eq!(decision, RouteDecision::ClusterDown { unbound: true });
    assert_eq!(
        decision.redirect(cluster.engine_ref(0)).unwrap(),
        "CLUSTERDOWN Hash slot not served"
    );

    // once the slot is bound the request is served
    cluster.engine(0).cluster_addslots(&[12182]).unwrap();
    cluster.run_for(500);
    assert_eq!(
        cluster.engine_ref(0).route(&argv(&["GET", "foo"]), &client),
        RouteDecision::Serve
    );
}

#[test]
fn moved_redirection_points_at_gossiped_owner() {
    let mut cluster = TestCluster::new(2);
    cluster.meet(0, 1);
    cluster.run_for(2000);

    // B claims slot 5000 and the claim travels to A by gossip
    cluster.engine(1).cluster_addslots(&[5000]).unwrap();
    cluster.run_for(3000);

    let b = cluster.id(1);
    assert_eq!(cluster.engine_ref(0).slot_owner(5000), Some(b));

    let tag = tag_for_slot(5000);
    let key = format!("{{{tag}}}x");
    let set = ["SET", key.as_str(), "1"];
    let client = ClientState::default();
    let decision = cluster.engine_ref(0).route(&argv(&set), &client);
    assert_eq!(
        decision,
        RouteDecision::Moved {
            slot: 5000,
            node: b
        }
    );
    assert_eq!(
        decision.redirect(cluster.engine_ref(0)).unwrap(),
        format!("MOVED 5000 {}:6379", cluster.host(1))
    );
}

#[test]
fn crossslot_rejected_on_any_node() {
    let mut cluster = TestCluster::new(1);
    let slots: Vec<u16> = (0..flint_cluster::SLOT_COUNT).collect();
    cluster.engine(0).cluster_addslots(&slots).unwrap();
    cluster.run_for(3000);

    assert_ne!(key_slot(b"a"), key_slot(b"b"));
    let client = ClientState::default();
    let decision = cluster
        .engine_ref(0)
        .route(&argv(&["MSET", "{a}1", "1", "{b}2", "2"]), &client);
    assert_eq!(decision, RouteDecision::CrossSlot);
}

#[test]
fn reshard_handshake_redirects_with_ask() {
    let mut cluster = TestCluster::new(2);
    cluster.meet(0, 1);
    cluster.run_for(2000);

    let slot = key_slot(b"foo");
    cluster.engine(0).cluster_addslots(&[slot]).unwrap();
    cluster.run_for(1000);
    let a = cluster.id(0);
    let b = cluster.id(1);

    // operator marks the migration on both ends
    cluster.engine(1).cluster_setslot_importing(slot, a).unwrap();
    cluster.engine(0).cluster_setslot_migrating(slot, b).unwrap();

    // source still serves keys it has, ASKs for the ones it does not
    cluster.engine(0).data_mut().add_key(bytes::Bytes::from_static(b"foo"));
    let client = ClientState::default();
    assert_eq!(
        cluster.engine_ref(0).route(&argv(&["GET", "foo"]), &client),
        RouteDecision::Serve
    );
    cluster.engine(0).data_mut().remove_key(b"foo");
    assert_eq!(
        cluster.engine_ref(0).route(&argv(&["GET", "foo"]), &client),
        RouteDecision::Ask { slot, node: b }
    );

    // target only admits the key behind ASKING
    assert!(matches!(
        cluster.engine_ref(1).route(&argv(&["GET", "foo"]), &client),
        RouteDecision::Moved { .. }
    ));
    let asking = ClientState {
        asking: true,
        ..Default::default()
    };
    assert_eq!(
        cluster.engine_ref(1).route(&argv(&["GET", "foo"]), &asking),
        RouteDecision::Serve
    );

    // closing the slot on the target with a fresh epoch converges both
    cluster.engine(1).cluster_setslot_node(slot, b, 5000).unwrap();
    cluster.run_for(3000);
    assert_eq!(cluster.engine_ref(0).slot_owner(slot), Some(b));
    assert_eq!(
        cluster.engine_ref(0).route(&argv(&["GET", "foo"]), &client),
        RouteDecision::Moved { slot, node: b }
    );
}
