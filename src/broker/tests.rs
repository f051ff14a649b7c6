use super::Broker;
use super::message::Message;
use super::queue::{Disposition, Queue, QueueKind};
use crate::client::{AckRecord, Connection, ConnectionId};
use crate::persistence::testing::FaultyKv;
use crate::persistence::{KvStore, SledKv, Store};
use crate::transport::message::{
    Action, ActionType, BondRequest, CONTROL_DEST, ConnectionConfigure, QueueError, REPLICA_DEST,
    ReplicaAction, ReplicaActionType, STAT_DEST, Stat, WireMessage,
};
use crate::utils::Error;
use bytes::Bytes;
use prost::Message as _;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::sync::mpsc::{self, UnboundedReceiver};

fn broker() -> Broker {
    Broker::new(Store::temporary().unwrap())
}

fn connect(broker: &mut Broker) -> (ConnectionId, UnboundedReceiver<Bytes>) {
    let (tx, rx) = mpsc::unbounded_channel::<Bytes>();
    (broker.register(Connection::new(tx)), rx)
}

fn publish(dest: &str, payload: &str) -> Bytes {
    WireMessage::new(dest, payload.to_string()).to_bytes()
}

fn action(kind: ActionType, payload: &str) -> Bytes {
    Action::new(kind)
        .with_payload(payload.to_string())
        .into_message()
        .to_bytes()
}

fn ack(id: u64) -> Bytes {
    Action::new(ActionType::Ack).with_id(id).into_message().to_bytes()
}

fn configure(cfg: ConnectionConfigure) -> Bytes {
    Action::new(ActionType::Configure)
        .with_payload(cfg.encode_to_vec())
        .into_message()
        .to_bytes()
}

fn with_acks(inflight: u32) -> Bytes {
    configure(ConnectionConfigure {
        ack: Some(true),
        inflight: Some(inflight),
        ..Default::default()
    })
}

fn received(rx: &mut UnboundedReceiver<Bytes>) -> Vec<WireMessage> {
    let mut out = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        out.push(WireMessage::decode(frame).unwrap());
    }
    out
}

fn payloads(msgs: &[WireMessage]) -> Vec<String> {
    msgs.iter()
        .map(|m| String::from_utf8(m.payload.to_vec()).unwrap())
        .collect()
}

fn queue_errors(msgs: &[WireMessage]) -> Vec<QueueError> {
    msgs.iter()
        .filter(|m| m.destination == CONTROL_DEST)
        .map(|m| Action::decode(m.payload.clone()).unwrap())
        .filter(|a| a.kind() == Ok(ActionType::QueueError))
        .map(|a| QueueError::decode(a.payload.unwrap()).unwrap())
        .collect()
}

fn ranges(broker: &Broker, name: &str) -> Vec<(u64, u64)> {
    broker
        .queue(name)
        .unwrap()
        .durable_index()
        .ranges
        .iter()
        .map(|r| (r.start, r.count))
        .collect()
}

#[test]
fn test_durable_orders_ack_flow() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    let (consumer, mut crx) = connect(&mut broker);

    broker.handle_frame(producer, &publish("orders", "A")).unwrap();
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 1);
    assert_eq!(ranges(&broker, "orders"), vec![(0, 1)]);

    broker.handle_frame(consumer, &with_acks(1)).unwrap();
    broker
        .handle_frame(consumer, &action(ActionType::Subscribe, "orders"))
        .unwrap();

    let got = received(&mut crx);
    assert_eq!(payloads(&got), vec!["A"]);
    let id = got[0].id.unwrap();
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 1);

    broker.handle_frame(consumer, &ack(id)).unwrap();
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 0);
    assert!(ranges(&broker, "orders").is_empty());
}

#[test]
fn test_jobs_partial_durable_transition_loses_nothing() {
    let kv = FaultyKv::new();
    let mut broker = Broker::new(kv.store());
    broker.make_queue("jobs", QueueKind::Transient, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    broker.handle_frame(producer, &publish("jobs", "job-A")).unwrap();
    broker.handle_frame(producer, &publish("jobs", "job-B")).unwrap();

    kv.fail_values_containing(b"job-B");
    assert!(broker.make_queue("jobs", QueueKind::Durable, None).is_err());

    let queue = broker.queue("jobs").unwrap();
    assert_eq!(queue.kind(), QueueKind::Transient);
    let backlog: Vec<&Bytes> = queue.backlog().map(Message::payload).collect();
    assert_eq!(backlog, vec![&Bytes::from("job-A"), &Bytes::from("job-B")]);

    let stored = broker.store().read_message(&Store::message_key("jobs", 0)).unwrap();
    assert_eq!(stored.unwrap().payload, Bytes::from("job-A"));

    // retry once the store recovers; A is not written twice
    kv.heal();
    broker.make_queue("jobs", QueueKind::Durable, None).unwrap();
    let queue = broker.queue("jobs").unwrap();
    assert_eq!(queue.kind(), QueueKind::Durable);
    assert_eq!(queue.backlog_len(), 0);
    assert_eq!(queue.durable_size(), 2);
    assert_eq!(ranges(&broker, "jobs"), vec![(0, 2)]);
}

#[test]
fn test_round_robin_visits_each_subscriber_once() {
    for k in 1..=4 {
        let mut broker = broker();
        broker.make_queue("work", QueueKind::Transient, None).unwrap();
        let (producer, _prx) = connect(&mut broker);
        let mut consumers = Vec::new();
        for _ in 0..k {
            let (id, rx) = connect(&mut broker);
            broker.subscribe(id, "work").unwrap();
            consumers.push(rx);
        }

        for i in 0..(2 * k) {
            broker
                .handle_frame(producer, &publish("work", &i.to_string()))
                .unwrap();
        }

        for (n, rx) in consumers.iter_mut().enumerate() {
            let expected = vec![n.to_string(), (n + k).to_string()];
            assert_eq!(payloads(&received(rx)), expected, "k={k} subscriber {n}");
        }
    }
}

#[test]
fn test_refused_everywhere_is_held_in_backlog() {
    let mut broker = broker();
    broker.make_queue("work", QueueKind::Transient, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    let (a, mut arx) = connect(&mut broker);
    let (b, mut brx) = connect(&mut broker);
    for id in [a, b] {
        broker.handle_frame(id, &with_acks(1)).unwrap();
        broker.subscribe(id, "work").unwrap();
    }

    for p in ["1", "2", "3"] {
        broker.handle_frame(producer, &publish("work", p)).unwrap();
    }

    assert_eq!(payloads(&received(&mut arx)), vec!["1"]);
    assert_eq!(payloads(&received(&mut brx)), vec!["2"]);
    assert_eq!(broker.queue("work").unwrap().backlog_len(), 1);
}

#[test]
fn test_refused_everywhere_is_stored_for_durable() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    let (a, mut arx) = connect(&mut broker);
    broker.handle_frame(a, &with_acks(1)).unwrap();
    broker.subscribe(a, "orders").unwrap();

    broker.handle_frame(producer, &publish("orders", "1")).unwrap();
    broker.handle_frame(producer, &publish("orders", "2")).unwrap();

    assert_eq!(payloads(&received(&mut arx)), vec!["1"]);
    let queue = broker.queue("orders").unwrap();
    // "1" is stored while in flight, "2" because nobody took it
    assert_eq!(queue.durable_size(), 2);
    assert_eq!(queue.backlog_len(), 0);
}

#[test]
fn test_broadcast_queue_writes_to_all_and_stores_nothing() {
    let mut broker = broker();
    broker.make_queue("news", QueueKind::Broadcast, None).unwrap();
    let (producer, _prx) = connect(&mut broker);

    let msg = Message::decode(&publish("news", "nobody")).unwrap();
    assert_eq!(broker.deliver(&msg).unwrap(), Disposition::Broadcast(0));

    let (a, mut arx) = connect(&mut broker);
    let (b, mut brx) = connect(&mut broker);
    broker.handle_frame(b, &with_acks(1)).unwrap();
    broker.subscribe(a, "news").unwrap();
    broker.subscribe(b, "news").unwrap();

    broker.handle_frame(producer, &publish("news", "hello")).unwrap();

    assert_eq!(payloads(&received(&mut arx)), vec!["hello"]);
    let to_b = received(&mut brx);
    assert_eq!(payloads(&to_b), vec!["hello"]);
    assert_eq!(to_b[0].id, None);

    let queue = broker.queue("news").unwrap();
    assert_eq!(queue.backlog_len(), 0);
    assert_eq!(queue.durable_size(), 0);
    assert!(broker.store().read_queue("news").unwrap().is_none());
}

#[test]
fn test_broadcast_skips_dead_subscriber() {
    let mut broker = broker();
    broker.make_queue("news", QueueKind::Broadcast, None).unwrap();
    let (a, mut arx) = connect(&mut broker);
    let (b, brx) = connect(&mut broker);
    let (c, mut crx) = connect(&mut broker);
    for conn in [a, b, c] {
        broker.subscribe(conn, "news").unwrap();
    }
    drop(brx);

    let msg = Message::decode(&publish("news", "hello")).unwrap();
    assert_eq!(broker.deliver(&msg).unwrap(), Disposition::Broadcast(2));
    assert_eq!(payloads(&received(&mut arx)), vec!["hello"]);
    assert_eq!(payloads(&received(&mut crx)), vec!["hello"]);
}

#[test]
fn test_durable_drain_one_at_a_time() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    let expected: Vec<String> = (0..50).map(|i| format!("m{i}")).collect();
    for p in &expected {
        broker.handle_frame(producer, &publish("orders", p)).unwrap();
    }

    let (consumer, mut crx) = connect(&mut broker);
    broker.handle_frame(consumer, &with_acks(1)).unwrap();
    assert_eq!(broker.subscribe(consumer, "orders").unwrap(), 1);

    let mut seen = Vec::new();
    loop {
        let got = received(&mut crx);
        if got.is_empty() {
            break;
        }
        assert_eq!(got.len(), 1);
        assert_eq!(broker.queue("orders").unwrap().lease_count(), 1);
        seen.extend(payloads(&got));
        broker.handle_frame(consumer, &ack(got[0].id.unwrap())).unwrap();
    }

    assert_eq!(seen, expected);
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 0);
    assert_eq!(broker.queue("orders").unwrap().lease_count(), 0);
}

#[test]
fn test_flush_without_acks_erases_each_message() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    for p in ["A", "B", "C"] {
        broker.handle_frame(producer, &publish("orders", p)).unwrap();
    }

    let (consumer, mut crx) = connect(&mut broker);
    assert_eq!(broker.subscribe(consumer, "orders").unwrap(), 3);
    assert_eq!(payloads(&received(&mut crx)), vec!["A", "B", "C"]);
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 0);
}

#[test]
fn test_flush_with_acks_keeps_outstanding_messages() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    for p in ["A", "B", "C"] {
        broker.handle_frame(producer, &publish("orders", p)).unwrap();
    }

    let (consumer, mut crx) = connect(&mut broker);
    broker.handle_frame(consumer, &with_acks(2)).unwrap();
    assert_eq!(broker.subscribe(consumer, "orders").unwrap(), 2);

    let got = received(&mut crx);
    assert_eq!(payloads(&got), vec!["A", "B"]);
    let queue = broker.queue("orders").unwrap();
    assert_eq!(queue.durable_size(), 3);
    assert_eq!(queue.lease_count(), 2);

    // acking frees one slot, which pulls in "C"
    broker.handle_frame(consumer, &ack(got[0].id.unwrap())).unwrap();
    assert_eq!(payloads(&received(&mut crx)), vec!["C"]);
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 2);
    assert_eq!(ranges(&broker, "orders"), vec![(1, 2)]);
}

#[test]
fn test_disconnect_requeues_unacked_exactly_once() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut broker);
    broker.handle_frame(producer, &publish("orders", "A")).unwrap();

    let (first, mut frx) = connect(&mut broker);
    let (second, mut srx) = connect(&mut broker);
    for id in [first, second] {
        broker.handle_frame(id, &with_acks(1)).unwrap();
        broker.subscribe(id, "orders").unwrap();
    }
    assert_eq!(payloads(&received(&mut frx)), vec!["A"]);
    // leased to `first`, so `second` is not offered the same record
    assert!(received(&mut srx).is_empty());

    broker.disconnect(first);
    assert!(!broker.queue("orders").unwrap().subscribers().contains(&first));
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 1);
    broker.cleanup();

    let again = received(&mut srx);
    assert_eq!(payloads(&again), vec!["A"]);
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 1);

    broker.handle_frame(second, &ack(again[0].id.unwrap())).unwrap();
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 0);
    assert!(received(&mut srx).is_empty());
}

#[test]
fn test_disconnect_requeues_into_transient_backlog() {
    let mut broker = broker();
    broker.make_queue("jobs", QueueKind::Transient, None).unwrap();
    let (consumer, mut crx) = connect(&mut broker);
    broker.handle_frame(consumer, &with_acks(1)).unwrap();
    broker.subscribe(consumer, "jobs").unwrap();

    let (producer, _prx) = connect(&mut broker);
    broker.handle_frame(producer, &publish("jobs", "A")).unwrap();
    assert_eq!(payloads(&received(&mut crx)), vec!["A"]);
    assert_eq!(broker.queue("jobs").unwrap().backlog_len(), 0);

    broker.disconnect(consumer);
    assert_eq!(broker.queue("jobs").unwrap().backlog_len(), 0);
    broker.cleanup();
    assert_eq!(broker.queue("jobs").unwrap().backlog_len(), 1);

    // a second cleanup has nothing left to requeue
    broker.cleanup();
    assert_eq!(broker.queue("jobs").unwrap().backlog_len(), 1);
}

#[test]
fn test_unknown_queue_is_reported() {
    let mut broker = broker();
    let (producer, mut prx) = connect(&mut broker);

    broker.handle_frame(producer, &publish("missing", "A")).unwrap();
    broker
        .handle_frame(producer, &action(ActionType::Subscribe, "missing"))
        .unwrap();

    let errors = queue_errors(&received(&mut prx));
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].queue, "missing");
    assert!(errors[0].error.contains("no such queue"));
    assert!(broker.connection(&producer).is_some());
}

#[test]
fn test_implicit_queues_are_created_transient() {
    let mut broker = broker().with_implicit_queues(true);
    let (producer, mut prx) = connect(&mut broker);

    broker.handle_frame(producer, &publish("auto", "A")).unwrap();
    assert!(received(&mut prx).is_empty());
    let queue = broker.queue("auto").unwrap();
    assert_eq!(queue.kind(), QueueKind::Transient);
    assert_eq!(queue.backlog_len(), 1);
}

#[test]
fn test_bad_actions_keep_connection_open() {
    let mut broker = broker();
    let (conn, mut rx) = connect(&mut broker);

    let garbage = WireMessage::new(CONTROL_DEST, vec![0xffu8, 0xff]).to_bytes();
    broker.handle_frame(conn, &garbage).unwrap();

    let unknown = Action {
        r#type: 99,
        payload: None,
        id: None,
    };
    broker
        .handle_frame(conn, &unknown.into_message().to_bytes())
        .unwrap();

    let errors = queue_errors(&received(&mut rx));
    assert_eq!(errors.len(), 2);
    assert_eq!(errors[0].error, "unparseable action");
    assert_eq!(errors[1].error, "unknown action type 99");
}

#[test]
fn test_undecodable_frame_is_an_error() {
    let mut broker = broker();
    let (conn, _rx) = connect(&mut broker);
    assert!(matches!(
        broker.handle_frame(conn, &[0xff, 0xff]),
        Err(Error::Decode(_))
    ));
}

#[test]
fn test_ack_of_unknown_or_missing_id_is_not_fatal() {
    let mut broker = broker();
    let (conn, mut rx) = connect(&mut broker);
    broker.handle_frame(conn, &ack(42)).unwrap();
    broker
        .handle_frame(conn, &Action::new(ActionType::Ack).into_message().to_bytes())
        .unwrap();
    assert!(received(&mut rx).is_empty());
    assert!(broker.connection(&conn).is_some());
}

#[test]
fn test_confirm_follows_accepted_publish() {
    let mut broker = broker();
    broker.make_queue("jobs", QueueKind::Transient, None).unwrap();
    let (producer, mut prx) = connect(&mut broker);
    broker
        .handle_frame(
            producer,
            &Action::new(ActionType::RequestConfirm).into_message().to_bytes(),
        )
        .unwrap();

    let mut wire = WireMessage::new("jobs", "A");
    wire.confirm_id = Some(42);
    broker.handle_frame(producer, &wire.to_bytes()).unwrap();
    broker.handle_frame(producer, &publish("jobs", "B")).unwrap();

    let confirms: Vec<Action> = received(&mut prx)
        .into_iter()
        .map(|m| Action::decode(m.payload).unwrap())
        .collect();
    assert_eq!(confirms.len(), 2);
    assert_eq!(confirms[0].kind(), Ok(ActionType::Confirm));
    assert_eq!(confirms[0].id, Some(42));
    assert_eq!(confirms[1].id, Some(0));
}

#[test]
fn test_stat_reports_sizes() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (conn, mut rx) = connect(&mut broker);
    broker.handle_frame(conn, &publish("orders", "A")).unwrap();
    broker.handle_frame(conn, &publish("orders", "B")).unwrap();

    broker
        .handle_frame(conn, &action(ActionType::RequestStat, "orders"))
        .unwrap();
    broker
        .handle_frame(conn, &action(ActionType::RequestStat, "missing"))
        .unwrap();

    let replies = received(&mut rx);
    assert!(replies.iter().all(|m| m.destination == STAT_DEST));
    let orders = Stat::decode(replies[0].payload.clone()).unwrap();
    assert!(orders.exists);
    assert_eq!(orders.durable_size, Some(2));
    assert_eq!(orders.transient_size, Some(0));
    let missing = Stat::decode(replies[1].payload.clone()).unwrap();
    assert!(!missing.exists);
    assert_eq!(missing.durable_size, None);
}

#[test]
fn test_bond_broadcasts_into_target() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    broker.make_queue("orders-live", QueueKind::Broadcast, None).unwrap();
    let (conn, mut rx) = connect(&mut broker);
    let (listener, mut lrx) = connect(&mut broker);

    let req = BondRequest {
        queue: "orders".into(),
        destination: "orders-live".into(),
    };
    let bond = Action::new(ActionType::Bond)
        .with_payload(req.encode_to_vec())
        .into_message()
        .to_bytes();
    broker.handle_frame(conn, &bond).unwrap();
    broker.subscribe(listener, "orders-live").unwrap();

    broker.handle_frame(conn, &publish("orders", "A")).unwrap();

    assert_eq!(payloads(&received(&mut lrx)), vec!["A"]);
    assert_eq!(broker.queue("orders").unwrap().durable_size(), 1);
    assert_eq!(broker.queue("orders-live").unwrap().bonded_from(), ["orders"]);
    assert!(queue_errors(&received(&mut rx)).is_empty());
}

#[test]
fn test_bond_into_itself_is_refused() {
    let mut broker = broker();
    broker.make_queue("jobs", QueueKind::Transient, None).unwrap();
    let (conn, mut rx) = connect(&mut broker);
    let (consumer, mut crx) = connect(&mut broker);
    broker.subscribe(consumer, "jobs").unwrap();

    let req = BondRequest {
        queue: "jobs".into(),
        destination: "jobs".into(),
    };
    let bond = Action::new(ActionType::Bond)
        .with_payload(req.encode_to_vec())
        .into_message()
        .to_bytes();
    broker.handle_frame(conn, &bond).unwrap();

    let errors = queue_errors(&received(&mut rx));
    assert_eq!(errors.len(), 1);
    assert_eq!(errors[0].queue, "jobs");
    assert!(broker.queue("jobs").unwrap().broadcasts_into().is_empty());

    broker.handle_frame(conn, &publish("jobs", "A")).unwrap();
    assert_eq!(payloads(&received(&mut crx)), vec!["A"]);
}

#[test]
fn test_bond_to_missing_queue_is_reported() {
    let mut broker = broker();
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    assert!(matches!(
        broker.bond("orders", "nowhere"),
        Err(Error::UnknownQueue(name)) if name == "nowhere"
    ));
}

#[test]
fn test_ephemeral_queue_dies_with_owner() {
    let mut broker = broker();
    let (owner, mut orx) = connect(&mut broker);
    let (other, _xrx) = connect(&mut broker);

    broker
        .handle_frame(owner, &action(ActionType::MakeEphemeralQueue, "reply-1"))
        .unwrap();
    assert!(received(&mut orx).is_empty());
    assert_eq!(broker.queue("reply-1").unwrap().owner(), Some(owner));
    broker.subscribe(other, "reply-1").unwrap();

    broker.disconnect(owner);
    assert!(broker.queue("reply-1").is_some());
    broker.cleanup();

    assert!(broker.queue("reply-1").is_none());
    let subs = &broker.connection(&other).unwrap().subscriptions;
    assert!(subs.is_empty());
    // never written to the declaration list
    assert!(broker.store().read_declarations().unwrap().is_empty());
}

#[test]
fn test_taps_see_every_delivery() {
    let mut broker = broker();
    broker.make_queue("jobs", QueueKind::Transient, None).unwrap();
    let (tap, mut trx) = connect(&mut broker);
    let (producer, _prx) = connect(&mut broker);
    broker
        .handle_frame(
            tap,
            &configure(ConnectionConfigure {
                tap: Some(true),
                ..Default::default()
            }),
        )
        .unwrap();
    assert!(broker.is_tap(&tap));

    broker.handle_frame(producer, &publish("jobs", "A")).unwrap();
    assert_eq!(payloads(&received(&mut trx)), vec!["A"]);
    // the tap did not consume it
    assert_eq!(broker.queue("jobs").unwrap().backlog_len(), 1);

    drop(trx);
    broker.handle_frame(producer, &publish("jobs", "B")).unwrap();
    assert!(!broker.is_tap(&tap));
    assert!(!broker.connection(&tap).unwrap().tap);
}

#[test]
fn test_replica_feed_receives_reserves_and_messages() {
    let mut master = broker();
    let (replica, mut rrx) = connect(&mut master);
    let start = ReplicaAction::start().into_message().to_bytes();
    master.handle_frame(replica, &start).unwrap();
    assert!(master.is_replica(&replica));
    assert!(master.connection(&replica).unwrap().replica);

    master.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut master);
    master.handle_frame(producer, &publish("orders", "A")).unwrap();

    let feed = received(&mut rrx);
    assert_eq!(feed.len(), 2);
    assert_eq!(feed[0].destination, REPLICA_DEST);
    let reserve = ReplicaAction::decode(feed[0].payload.clone()).unwrap();
    assert_eq!(reserve.r#type, ReplicaActionType::Reserve as i32);
    assert_eq!(feed[1].destination, "orders");

    // replay the feed into a second broker
    let mut mirror = broker();
    let (upstream, _urx) = connect(&mut mirror);
    for msg in &feed {
        mirror.handle_frame(upstream, &msg.to_bytes()).unwrap();
    }
    let queue = mirror.queue("orders").unwrap();
    assert_eq!(queue.kind(), QueueKind::Durable);
    assert_eq!(queue.durable_size(), 1);
}

#[test]
fn test_failed_replica_is_dropped() {
    let mut master = broker();
    let (replica, rrx) = connect(&mut master);
    master
        .handle_frame(replica, &ReplicaAction::start().into_message().to_bytes())
        .unwrap();
    drop(rrx);

    master.make_queue("orders", QueueKind::Durable, None).unwrap();
    assert!(!master.is_replica(&replica));
    assert!(!master.connection(&replica).unwrap().replica);
}

#[test]
fn test_declarations_are_loaded_on_restart() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("db");
    {
        let mut broker = Broker::new(Store::open(&path).unwrap());
        broker.make_queue("orders", QueueKind::Durable, None).unwrap();
        broker.make_queue("news", QueueKind::Broadcast, None).unwrap();
        let (producer, _prx) = connect(&mut broker);
        broker.handle_frame(producer, &publish("orders", "A")).unwrap();
        broker.handle_frame(producer, &publish("orders", "B")).unwrap();
        broker.flush_store().unwrap();
    }

    let mut broker = Broker::new(Store::open(&path).unwrap());
    broker.load().unwrap();
    assert_eq!(broker.queue("news").unwrap().kind(), QueueKind::Broadcast);
    let orders = broker.queue("orders").unwrap();
    assert_eq!(orders.kind(), QueueKind::Durable);
    assert_eq!(orders.durable_size(), 2);

    // new appends continue after the stored range
    let (producer, _prx) = connect(&mut broker);
    broker.handle_frame(producer, &publish("orders", "C")).unwrap();
    assert_eq!(ranges(&broker, "orders"), vec![(0, 3)]);
}

#[test]
fn test_corrupt_declarations_abort_load() {
    let kv = Arc::new(SledKv::temporary().unwrap());
    kv.put(b"!config", &[0xff, 0xff, 0xff]).unwrap();
    let mut broker = Broker::new(Store::with_backend(kv));
    assert!(matches!(broker.load(), Err(Error::Corrupt { .. })));
}

#[test]
fn test_illegal_kind_changes_fail() {
    let store = Store::temporary().unwrap();
    let mut news = Queue::open("news", QueueKind::Broadcast, store.clone()).unwrap();
    assert!(matches!(
        news.change_kind(QueueKind::Durable),
        Err(Error::KindChange { .. })
    ));

    let mut orders = Queue::open("orders", QueueKind::Durable, store.clone()).unwrap();
    assert!(orders.change_kind(QueueKind::Durable).is_ok());
    assert!(orders.change_kind(QueueKind::Transient).is_err());
    assert_eq!(orders.kind(), QueueKind::Durable);

    let mut jobs = Queue::open("jobs", QueueKind::Transient, store).unwrap();
    assert!(jobs.change_kind(QueueKind::Broadcast).is_err());
    assert!(jobs.change_kind(QueueKind::Ephemeral).is_err());
    assert_eq!(jobs.kind(), QueueKind::Transient);
}

#[test]
fn test_ack_defects_are_reported() {
    let store = Store::temporary().unwrap();
    let rec = |queue: &str, kind: QueueKind| AckRecord {
        message: Message::new(WireMessage::new(queue, "A")),
        queue: queue.to_string(),
        kind,
    };

    let mut orders = Queue::open("orders", QueueKind::Durable, store.clone()).unwrap();
    assert!(matches!(orders.acked(&rec("orders", QueueKind::Durable)), Err(Error::Inconsistent(_))));

    let mut news = Queue::open("news", QueueKind::Broadcast, store.clone()).unwrap();
    assert!(matches!(news.acked(&rec("news", QueueKind::Broadcast)), Err(Error::Inconsistent(_))));

    let mut jobs = Queue::open("jobs", QueueKind::Transient, store).unwrap();
    assert!(jobs.acked(&rec("jobs", QueueKind::Transient)).is_ok());
}

#[test]
fn test_ack_after_promotion_to_durable_is_accepted() {
    let mut broker = broker();
    broker.make_queue("jobs", QueueKind::Transient, None).unwrap();
    let (consumer, mut crx) = connect(&mut broker);
    broker.handle_frame(consumer, &with_acks(1)).unwrap();
    broker.subscribe(consumer, "jobs").unwrap();
    let (producer, _prx) = connect(&mut broker);
    broker.handle_frame(producer, &publish("jobs", "A")).unwrap();
    let got = received(&mut crx);
    assert_eq!(payloads(&got), vec!["A"]);

    broker.make_queue("jobs", QueueKind::Durable, None).unwrap();
    let rec = AckRecord {
        message: Message::new(WireMessage::new("jobs", "A")),
        queue: "jobs".to_string(),
        kind: QueueKind::Transient,
    };
    assert!(broker.queues.get_mut("jobs").unwrap().acked(&rec).is_ok());

    broker.handle_frame(consumer, &ack(got[0].id.unwrap())).unwrap();
    assert_eq!(broker.connection(&consumer).unwrap().unacked_len(), 0);
    assert_eq!(broker.queue("jobs").unwrap().durable_size(), 0);
}

#[test]
fn test_erase_of_unknown_index_is_inconsistent() {
    let mut orders = Queue::open("orders", QueueKind::Durable, Store::temporary().unwrap()).unwrap();
    let msg = Message::new(WireMessage::new("orders", "A"));
    assert_eq!(orders.write_durable(&msg).unwrap(), 0);
    assert!(msg.is_durable());

    assert!(matches!(orders.erase_durable(7), Err(Error::Inconsistent(_))));
    assert_eq!(orders.durable_size(), 1);
    orders.erase_durable(0).unwrap();
    assert_eq!(orders.durable_size(), 0);
}

#[test]
fn test_failed_store_write_keeps_message_in_memory() {
    let kv = FaultyKv::new();
    let mut broker = Broker::new(kv.store());
    broker.make_queue("orders", QueueKind::Durable, None).unwrap();
    let (producer, _prx) = connect(&mut broker);

    kv.fail_writes(true);
    broker.handle_frame(producer, &publish("orders", "A")).unwrap();
    let queue = broker.queue("orders").unwrap();
    assert_eq!(queue.durable_size(), 0);
    assert_eq!(queue.backlog_len(), 1);

    kv.heal();
    let (consumer, mut crx) = connect(&mut broker);
    broker.subscribe(consumer, "orders").unwrap();
    assert_eq!(payloads(&received(&mut crx)), vec!["A"]);
}
