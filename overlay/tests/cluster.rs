mod common;

use common::Cluster;
use intersect_overlay::{
    client::Client,
    node::{Config, Status},
    CommitteeId, Error, Transaction,
};
use std::time::Duration;

fn id(s: &str) -> CommitteeId {
    CommitteeId::from(s)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_start_binds_committees() {
    let mut cluster = Cluster::new();
    let i = cluster.spawn().await;
    let host = cluster.hosts[i].clone();
    cluster.client.start(&host, &id("a"), &id("b")).await.unwrap();

    let info = cluster.client.info(&host, Some(&id("a"))).await.unwrap();
    assert_eq!(info.committee_id, Some(id("a")));
    let info = cluster.client.info(&host, Some(&id("b"))).await.unwrap();
    assert_eq!(info.committee_id, Some(id("b")));
    let info = cluster.client.info(&host, Some(&id("c"))).await.unwrap();
    assert_eq!(info.committee_id, None);
    let info = cluster.client.info(&host, None).await.unwrap();
    assert_eq!(info.committee_id, Some(id("a")));

    match cluster.client.val_key(&host, &id("c")).await {
        Err(Error::Remote(msg)) => assert_eq!(msg, "peer not in quorum c"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(cluster.client.status(&host).await.unwrap(), "dual_sided");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_deployed_committees_share_state() {
    let (cluster, topology) = Cluster::deployed(5, 1).await;
    for c in ["0", "1", "2", "3", "4"] {
        assert_eq!(cluster.validators(c), 4);
        assert_eq!(cluster.holders(c).await.len(), 4);
    }

    // Submit through the peer bridging (0, 2)
    let bridge = topology.bridging(&id("0"), &id("2"))[0];
    let tx = Transaction::new(id("2"), "k", "v");
    cluster.client.submit(&cluster.hosts[bridge], &tx).await.unwrap();
    assert_eq!(cluster.nodes[bridge].metrics().served.get(), 1);
    assert_eq!(cluster.nodes[bridge].metrics().forwarded.get(), 0);

    for holder in cluster.holders("2").await {
        let value = cluster.client.get(&cluster.hosts[holder], &tx).await.unwrap();
        assert_eq!(value, "v");
    }
    assert_eq!(
        cluster.runtime.network().value(&id("2"), "k"),
        Some("v".to_string())
    );
    assert_eq!(cluster.runtime.network().value(&id("0"), "k"), None);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_committee_keys_and_ips() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    let host = &cluster.hosts[0];

    let keys = cluster.client.committee_val_keys(host, &id("0")).await.unwrap();
    let applied = cluster.runtime.network().members(&id("0")).unwrap();
    assert_eq!(keys.len(), 4);
    assert!(keys.iter().all(|key| applied.validators.contains(key)));
    let own = cluster.client.val_key(host, &id("0")).await.unwrap();
    assert!(keys.contains(&own));

    let mut ips = cluster.client.committee_ips(host, &id("0")).await.unwrap();
    ips.sort();
    let attached: Vec<String> = cluster.runtime.network().nodes(&id("0")).into_iter().collect();
    assert_eq!(ips, attached);

    match cluster.client.committee_val_keys(host, &id("3")).await {
        Err(Error::Remote(msg)) => assert_eq!(msg, "peer not in quorum 3"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(matches!(
        cluster.client.committee_ips(host, &id("3")).await,
        Err(Error::Remote(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_requests() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    let host = &cluster.hosts[0];

    let body = cluster
        .client
        .forward(host, "/submit", &serde_json::json!({ "key": 1 }))
        .await
        .unwrap();
    assert!(body.starts_with("ERROR: "), "{body}");
    let body = cluster
        .client
        .forward(host, "/add+validator", &serde_json::json!([]))
        .await
        .unwrap();
    assert!(body.starts_with("ERROR: "), "{body}");
    assert_eq!(cluster.validators("0"), 4);

    match cluster
        .client
        .get_text(host, "/quorum+info?include_self=maybe")
        .await
    {
        Err(Error::Remote(msg)) => assert!(msg.contains("query string"), "{msg}"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_forwarding() {
    let (mut cluster, topology) = Cluster::deployed(5, 1).await;

    // The peer bridging (0, 1) holds neither "3" nor "4"
    let entry = topology.bridging(&id("0"), &id("1"))[0];
    let tx = Transaction::new(id("3"), "k", "forwarded");
    cluster.client.submit(&cluster.hosts[entry], &tx).await.unwrap();
    assert_eq!(cluster.nodes[entry].metrics().forwarded.get(), 1);
    assert_eq!(
        cluster.client.get(&cluster.hosts[entry], &tx).await.unwrap(),
        "forwarded"
    );
    let holder = cluster.holders("3").await[0];
    assert_eq!(
        cluster.client.get(&cluster.hosts[holder], &tx).await.unwrap(),
        "forwarded"
    );
    assert_eq!(cluster.client.blocks(&cluster.hosts[entry], &tx).await.unwrap(), 1);

    // Forwarded errors come back unmodified
    let missing = Transaction::new(id("3"), "missing", "");
    match cluster.client.get(&cluster.hosts[entry], &missing).await {
        Err(Error::Remote(msg)) => assert_eq!(msg, "key not found: missing"),
        other => panic!("unexpected: {other:?}"),
    }

    // A node with an empty view cannot route
    let stranger = cluster.spawn().await;
    match cluster.client.submit(&cluster.hosts[stranger], &tx).await {
        Err(Error::Remote(msg)) => assert_eq!(msg, "no known peer in quorum 3"),
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_independent_committees_isolated() {
    let mut cluster = Cluster::new();
    let first = cluster.spawn().await;
    let second = cluster.spawn().await;
    let (h1, h2) = (cluster.hosts[first].clone(), cluster.hosts[second].clone());
    cluster.client.start(&h1, &id("a"), &id("x")).await.unwrap();
    cluster.client.start(&h2, &id("b"), &id("y")).await.unwrap();
    for (host, c) in [(&h1, "a"), (&h2, "b")] {
        let body = intersect_overlay::wire::Genesis {
            validators: vec![cluster.client.val_key(host, &id(c)).await.unwrap()],
            users: vec![cluster.client.user_key(host, &id(c)).await.unwrap()],
        };
        cluster.client.genesis(host, &id(c), &body).await.unwrap();
    }

    let tx = Transaction::new(id("a"), "k", "v");
    cluster.client.submit(&h1, &tx).await.unwrap();
    assert_eq!(cluster.client.get(&h1, &tx).await.unwrap(), "v");
    let on_b = Transaction::new(id("b"), "k", "");
    match cluster.client.get(&h2, &on_b).await {
        Err(Error::Remote(msg)) => assert_eq!(msg, "key not found: k"),
        other => panic!("unexpected: {other:?}"),
    }
    assert!(cluster.client.get(&h2, &tx).await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_intersection_map() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    let table = cluster.client.intersection_map(&cluster.hosts[3]).await.unwrap();
    let pairs: usize = table.values().map(|row| row.len()).sum();
    assert_eq!(pairs, 10);
    for row in table.values() {
        for peers in row.values() {
            assert_eq!(peers.len(), 1);
        }
    }

    let selection = cluster.client.min_intersection(&cluster.hosts[3]).await.unwrap();
    assert_eq!(selection.pair(), Some(&(id("0"), id("1"))));
    assert_eq!(selection.peers[&id("0")].len(), 4);
    assert_eq!(selection.peers[&id("1")].len(), 4);
    let selection = cluster.client.max_intersection(&cluster.hosts[3]).await.unwrap();
    assert_eq!(selection.max_intersection, Some((id("0"), id("1"))));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_least_populated() {
    let (mut cluster, _) = Cluster::deployed(5, 1).await;
    let joiner = cluster.spawn().await;
    let host = cluster.hosts[joiner].clone();
    cluster
        .client
        .request_join(&host, &cluster.hosts[0])
        .await
        .unwrap();

    assert_eq!(cluster.nodes[joiner].committees().await, vec![id("0"), id("1")]);
    assert_eq!(cluster.nodes[joiner].status(), Status::DualSided);
    assert_eq!(cluster.validators("0"), 5);
    assert_eq!(cluster.validators("1"), 5);
    for c in ["2", "3", "4"] {
        assert_eq!(cluster.validators(c), 4);
    }

    // Existing members learned about the joiner
    let holder = cluster.holders("0").await[0];
    let table = cluster
        .client
        .quorum_info(&cluster.hosts[holder], Some(&id("0")), false)
        .await
        .unwrap();
    assert!(table[&id("0")].iter().any(|p| p.address() == host));

    // The joiner serves its committees and routes to the others
    let tx = Transaction::new(id("4"), "k", "v");
    cluster.client.submit(&host, &tx).await.unwrap();
    let tx = Transaction::new(id("0"), "k", "v");
    cluster.client.submit(&host, &tx).await.unwrap();
    assert_eq!(cluster.nodes[joiner].metrics().joins.get(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leave_refused_at_minimum() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    match cluster.client.request_leave(&cluster.hosts[0]).await {
        Err(Error::Remote(msg)) => assert!(msg.contains("below quorum"), "{msg}"),
        other => panic!("unexpected: {other:?}"),
    }
    for c in ["0", "1", "2", "3", "4"] {
        assert_eq!(cluster.validators(c), 4);
    }
    assert_eq!(cluster.nodes[0].status(), Status::DualSided);
    assert_eq!(cluster.nodes[0].metrics().refused_leaves.get(), 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_then_leave() {
    let (mut cluster, _) = Cluster::deployed(5, 1).await;
    let joiner = cluster.spawn().await;
    let host = cluster.hosts[joiner].clone();
    cluster
        .client
        .request_join(&host, &cluster.hosts[0])
        .await
        .unwrap();
    assert_eq!(cluster.validators("0"), 5);

    cluster.client.request_leave(&host).await.unwrap();
    assert_eq!(cluster.nodes[joiner].status(), Status::Terminated);
    assert!(cluster.nodes[joiner].committees().await.is_empty());
    assert_eq!(cluster.validators("0"), 4);
    assert_eq!(cluster.validators("1"), 4);

    // Nobody routes to the departed peer any more
    for holder in cluster.holders("0").await {
        let table = cluster
            .client
            .quorum_info(&cluster.hosts[holder], Some(&id("0")), false)
            .await
            .unwrap();
        assert!(table[&id("0")].iter().all(|p| p.address() != host));
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leave_moves_replacement() {
    let (mut cluster, topology) = Cluster::deployed(5, 1).await;
    let joiner = cluster.spawn().await;
    cluster
        .client
        .request_join(&cluster.hosts[joiner], &cluster.hosts[0])
        .await
        .unwrap();
    assert_eq!(cluster.validators("0"), 5);
    assert_eq!(cluster.validators("1"), 5);

    // (0, 1) now has two peers against one for (2, 3), so one of them takes the leaver's place
    let leaver = topology.bridging(&id("2"), &id("3"))[0];
    cluster
        .client
        .request_leave(&cluster.hosts[leaver])
        .await
        .unwrap();
    assert_eq!(cluster.nodes[leaver].status(), Status::Terminated);
    for c in ["0", "1", "2", "3", "4"] {
        assert_eq!(cluster.validators(c), 4, "committee {c}");
    }

    let moved: Vec<usize> = cluster
        .holders("2")
        .await
        .into_iter()
        .filter(|i| *i == 0 || *i == joiner)
        .collect();
    assert_eq!(moved.len(), 1);
    assert_eq!(
        cluster.nodes[moved[0]].committees().await,
        vec![id("2"), id("3")]
    );
    assert_eq!(cluster.holders("0").await.len(), 4);
    assert_eq!(cluster.holders("1").await.len(), 4);

    // Committee "2" still serves through the moved peer
    let tx = Transaction::new(id("2"), "k", "v");
    cluster
        .client
        .submit(&cluster.hosts[moved[0]], &tx)
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leave_tied_pair_stays() {
    let (mut cluster, _) = Cluster::deployed(5, 1).await;
    let first = cluster.spawn().await;
    cluster
        .client
        .request_join(&cluster.hosts[first], &cluster.hosts[0])
        .await
        .unwrap();
    let second = cluster.spawn().await;
    cluster
        .client
        .request_join(&cluster.hosts[second], &cluster.hosts[0])
        .await
        .unwrap();
    assert_eq!(cluster.nodes[second].committees().await, vec![id("0"), id("2")]);
    assert_eq!(cluster.validators("0"), 6);

    // (0, 1) only ties (0, 2), so nobody is moved
    cluster
        .client
        .request_leave(&cluster.hosts[second])
        .await
        .unwrap();
    assert_eq!(cluster.nodes[second].status(), Status::Terminated);
    assert_eq!(cluster.validators("0"), 5);
    assert_eq!(cluster.validators("1"), 5);
    assert_eq!(cluster.validators("2"), 4);
    assert_eq!(cluster.nodes[0].committees().await, vec![id("0"), id("1")]);
    assert_eq!(cluster.nodes[first].committees().await, vec![id("0"), id("1")]);
    assert_eq!(cluster.holders("2").await.len(), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leave_refused_for_replacement_pair() {
    // (0, 1) is the most populated pair and both of its committees sit at the minimum
    let (cluster, _) =
        Cluster::with_pairs(&[(0, 1), (0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]).await;
    assert_eq!(cluster.validators("0"), 4);
    assert_eq!(cluster.validators("2"), 3);

    match cluster.client.request_leave(&cluster.hosts[6]).await {
        Err(Error::Remote(msg)) => {
            assert_eq!(msg, "leave would drop committee 0 below quorum")
        }
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(cluster.nodes[6].status(), Status::DualSided);
    assert_eq!(cluster.nodes[6].metrics().refused_leaves.get(), 1);
    assert_eq!(cluster.validators("0"), 4);
    assert_eq!(cluster.validators("1"), 4);
    assert_eq!(cluster.validators("2"), 3);
    assert_eq!(cluster.validators("3"), 3);
    assert_eq!(cluster.holders("0").await, vec![0, 1, 2, 3]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_torn_down_on_failed_side() {
    // The least populated pair is (0, 2), and committee "2" has too few members to join
    let (mut cluster, _) =
        Cluster::with_pairs(&[(0, 1), (0, 1), (0, 2), (0, 3), (1, 2), (1, 3), (2, 3)]).await;
    let joiner = cluster.spawn().await;
    match cluster
        .client
        .request_join(&cluster.hosts[joiner], &cluster.hosts[0])
        .await
    {
        Err(Error::Remote(msg)) => assert_eq!(msg, "insufficient members: 3 < 4"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(cluster.nodes[joiner].status(), Status::Unstarted);
    assert!(cluster.nodes[joiner].committees().await.is_empty());

    // The side that did join was stopped again
    assert_eq!(cluster.runtime.network().nodes(&id("0")).len(), 4);
    assert_eq!(cluster.validators("0"), 4);
    assert_eq!(cluster.validators("2"), 3);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_join_degraded_without_admission() {
    let (mut cluster, _) = Cluster::deployed(5, 1).await;
    cluster.runtime.network().stall(&id("1"));
    let joiner = cluster.spawn().await;
    match cluster
        .client
        .request_join(&cluster.hosts[joiner], &cluster.hosts[0])
        .await
    {
        Err(Error::Remote(msg)) => assert!(msg.contains("Committee update failed!"), "{msg}"),
        other => panic!("unexpected: {other:?}"),
    }

    // Running on both sides, but only a validator of "0"
    assert_eq!(cluster.nodes[joiner].status(), Status::DualSided);
    assert_eq!(cluster.nodes[joiner].committees().await, vec![id("0"), id("1")]);
    assert_eq!(cluster.validators("0"), 5);
    assert_eq!(cluster.validators("1"), 4);
    assert_eq!(cluster.nodes[joiner].metrics().joins.get(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_leave_rolled_back() {
    let (mut cluster, _) = Cluster::deployed(5, 1).await;
    let joiner = cluster.spawn().await;
    let host = cluster.hosts[joiner].clone();
    cluster
        .client
        .request_join(&host, &cluster.hosts[0])
        .await
        .unwrap();
    assert_eq!(cluster.validators("0"), 5);
    assert_eq!(cluster.validators("1"), 5);

    // Removal from "1" cannot complete, so the removal from "0" is reverted
    cluster.runtime.network().stall(&id("1"));
    match cluster.client.request_leave(&host).await {
        Err(Error::Remote(msg)) => assert!(msg.contains("Committee update failed!"), "{msg}"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(cluster.nodes[joiner].status(), Status::DualSided);
    assert_eq!(cluster.nodes[joiner].committees().await, vec![id("0"), id("1")]);
    let own = cluster.client.val_key(&host, &id("0")).await.unwrap();
    let applied = cluster.runtime.network().members(&id("0")).unwrap();
    assert!(applied.validators.contains(&own));
    assert_eq!(cluster.validators("0"), 5);
    assert_eq!(cluster.validators("1"), 5);
    assert_eq!(cluster.nodes[joiner].metrics().leaves.get(), 0);

    // Once "1" applies changes again the leave goes through
    cluster.runtime.network().resume(&id("1"));
    cluster.client.request_leave(&host).await.unwrap();
    assert_eq!(cluster.validators("0"), 4);
    assert_eq!(cluster.validators("1"), 4);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_vacate_side() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    let host = &cluster.hosts[0];
    let vacated = cluster.client.vacate(host, &id("0")).await.unwrap();
    assert!(!vacated.terminal);
    assert_eq!(cluster.client.status(host).await.unwrap(), "single_sided");
    let info = cluster.client.info(host, None).await.unwrap();
    assert_eq!(info.committee_id, Some(id("1")));

    // Removing the departed keys is up to the survivors
    assert_eq!(cluster.validators("0"), 4);

    let vacated = cluster.client.vacate(host, &id("1")).await.unwrap();
    assert!(vacated.terminal);
    assert_eq!(cluster.client.status(host).await.unwrap(), "terminated");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_refresh_restores_view() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    let node = &cluster.nodes[0];
    let before = node.with_view(|view| view.neighbors(&id("0")));
    assert_eq!(before.len(), 3);
    node.with_view(|view| {
        for peer in &before[1..] {
            view.remove(&id("0"), &peer.address());
        }
    });
    assert_eq!(node.with_view(|view| view.neighbors(&id("0")).len()), 1);

    cluster.client.refresh(&cluster.hosts[0]).await.unwrap();
    assert_eq!(node.with_view(|view| view.neighbors(&id("0"))), before);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stalled_update_fails() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    cluster.runtime.network().stall(&id("0"));
    let notice = intersect_overlay::wire::ValidatorNotice {
        quorum_id: id("0"),
        val_key: "val-new".into(),
        user_key: None,
    };
    match cluster.client.add_validator(&cluster.hosts[0], &notice).await {
        Err(Error::Remote(msg)) => assert_eq!(msg, "Committee update failed!"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(cluster.validators("0"), 4);

    // Ordinary requests of this client time out before the remote retries finish, but a
    // validator change waits for the remote answer
    let impatient = Client::new(&Config {
        request_timeout: Duration::from_millis(250),
        ..common::config()
    })
    .unwrap();
    match impatient.add_validator(&cluster.hosts[0], &notice).await {
        Err(Error::Remote(msg)) => assert_eq!(msg, "Committee update failed!"),
        other => panic!("unexpected: {other:?}"),
    }
    assert_eq!(cluster.validators("0"), 4);

    cluster.runtime.network().resume(&id("0"));
    cluster
        .client
        .add_validator(&cluster.hosts[0], &notice)
        .await
        .unwrap();
    assert_eq!(cluster.validators("0"), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_metrics_endpoint() {
    let (cluster, _) = Cluster::deployed(5, 1).await;
    let body = cluster
        .client
        .get_text(&cluster.hosts[0], "/metrics")
        .await
        .unwrap();
    assert!(body.contains("overlay_known_peers 9"));
}
