//! Membership scenarios: MEET handshakes and gossip discovery.

use crate::helpers::TestCluster;

#[test]
fn meet_completes_handshake_both_ways() {
    let mut cluster = TestCluster::new(2);
    let a = cluster.id(0);
    let b = cluster.id(1);

    cluster.meet(0, 1);
    cluster.run_for(1000); // well under one node timeout

    // both tables carry the peer under its real identity
    assert!(cluster.knows(0, b), "A learned B's identity");
    assert!(cluster.knows(1, a), "B learned A's identity");

    // both show up as masters on either side
    assert!(cluster.engine_ref(0).node(&b).unwrap().is_master());
    assert!(cluster.engine_ref(1).node(&a).unwrap().is_master());

    // no handshake leftovers, and NODES lists exactly two entries
    for i in 0..2 {
        assert_eq!(cluster.engine_ref(i).known_nodes(), 2);
        let nodes = cluster.engine_ref(i).cluster_nodes();
        let lines: Vec<&str> = nodes
            .lines()
            .filter(|l| !l.starts_with("vars"))
            .collect();
        assert_eq!(lines.len(), 2, "unexpected NODES output:\n{nodes}");
        assert!(!nodes.contains("handshake"), "handshake should be done");
    }
}

#[test]
fn gossip_spreads_membership_transitively() {
    let mut cluster = TestCluster::new(3);
    // only pairwise meets: 0-1 and 0-2; node 1 and 2 must find each
    // other through gossip
    cluster.meet(0, 1);
    cluster.meet(0, 2);
    cluster.run_for(5000);

    for i in 0..3 {
        assert_eq!(
            cluster.engine_ref(i).known_nodes(),
            3,
            "node {i} should know the whole mesh"
        );
    }
    let b = cluster.id(1);
    let c = cluster.id(2);
    assert!(cluster.knows(2, b));
    assert!(cluster.knows(1, c));
}

#[test]
fn forget_blacklists_against_gossip_readd() {
    let mut cluster = TestCluster::new(3);
    cluster.meet(0, 1);
    cluster.meet(0, 2);
    cluster.run_for(3000);

    let b = cluster.id(1);
    let now = cluster.now;
    cluster.engine(0).cluster_forget(b, now).unwrap();
    assert!(!cluster.knows(0, b));

    // nodes 1 and 2 still gossip about b; the blacklist must keep it out
    cluster.run_for(3000);
    assert!(
        !cluster.knows(0, b),
        "forgotten node must not return via gossip within the blacklist TTL"
    );
}

#[test]
fn handshake_to_dead_address_expires() {
    let mut cluster = TestCluster::new(2);
    cluster.kill(1);
    cluster.meet(0, 1);
    assert_eq!(cluster.engine_ref(0).known_nodes(), 2);

    // handshake lifetime is max(node_timeout, 1s)
    cluster.run_for(2500);
    assert_eq!(
        cluster.engine_ref(0).known_nodes(),
        1,
        "unanswered handshake entry should be reaped"
    );
}
