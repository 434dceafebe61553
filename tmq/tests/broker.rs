use std::num::NonZeroU16;
use std::sync::Arc;

use futures::channel::mpsc;
use futures::StreamExt;
use parking_lot::Mutex;

use tmq::broker::{Broker, Handle};
use tmq::conf::Settings;
use tmq::hook::{DefaultHookManager, HookResult, Parameter, Type};
use tmq::types::{
    Connect, ConnectAckReason, LastWill, Outgoing, Packet, Publish, Rx, SubscribeReturnCode, TopicFilter,
};
use tmq::utils::timestamp_millis;
use tmq::{MqttError, QoS, Reason};

fn pid(id: u16) -> NonZeroU16 {
    NonZeroU16::new(id).unwrap()
}

fn connect_with(broker: &Broker, connect: Connect, outbound_len: usize) -> (Handle, Rx) {
    let (tx, mut rx) = tokio::sync::mpsc::channel(outbound_len);
    let h = broker.on_connect(&connect, tx).unwrap();
    assert!(matches!(rx.try_recv(), Ok(Outgoing::Packet(Packet::ConnectAck { .. }))));
    (h, rx)
}

fn connect(broker: &Broker, connect: Connect) -> (Handle, Rx) {
    connect_with(broker, connect, 64)
}

fn subscribe(broker: &Broker, h: &Handle, filter: &str, qos: QoS) {
    let topic_filters = vec![(TopicFilter::from(filter.to_string()), qos)];
    broker.on_packet(h, Packet::Subscribe { packet_id: pid(1), topic_filters }).unwrap();
}

fn drain(rx: &mut Rx) -> Vec<Outgoing> {
    let mut out = Vec::new();
    while let Ok(o) = rx.try_recv() {
        out.push(o);
    }
    out
}

fn publishes(rx: &mut Rx) -> Vec<Publish> {
    drain(rx)
        .into_iter()
        .filter_map(|o| match o {
            Outgoing::Packet(Packet::Publish(p)) => Some(p),
            _ => None,
        })
        .collect()
}

#[test]
fn test_persistent_session_redelivers_with_dup() {
    let broker = Broker::builder().build();
    let (c1, mut rx) = connect(&broker, Connect::new("c1", false, 0));
    subscribe(&broker, &c1, "sensors/+/temp", QoS::AtLeastOnce);
    drain(&mut rx);

    let (p, mut prx) = connect(&broker, Connect::new("p", true, 0));
    broker
        .on_packet(&p, Publish::new("sensors/room1/temp", "21.5", QoS::AtLeastOnce).packet_id(7).into())
        .unwrap();
    assert_eq!(drain(&mut prx), vec![Outgoing::Packet(Packet::PublishAck { packet_id: pid(7) })]);
    let first = publishes(&mut rx);
    assert_eq!(first.len(), 1);
    assert!(!first[0].dup);

    broker.on_close(&c1, Reason::ConnectRemoteClose);
    assert!(broker.session("c1").is_some());

    let (tx, mut rx) = tokio::sync::mpsc::channel(64);
    let c1 = broker.on_connect(&Connect::new("c1", false, 0), tx).unwrap();
    assert!(c1.session_present);
    let out = drain(&mut rx);
    assert_eq!(
        out[0],
        Outgoing::Packet(Packet::ConnectAck { return_code: ConnectAckReason::ConnectionAccepted, session_present: true })
    );
    assert_eq!(out.len(), 2);
    match &out[1] {
        Outgoing::Packet(Packet::Publish(again)) => {
            assert!(again.dup);
            assert_eq!(again.payload, "21.5");
            assert_eq!(again.packet_id, first[0].packet_id);
        }
        o => panic!("unexpected {:?}", o),
    }

    broker.on_packet(&c1, Packet::PublishAck { packet_id: first[0].packet_id.unwrap() }).unwrap();
    assert_eq!(c1.session.inflight_len(), 0);
    assert_eq!(broker.stats.acked.count(), 1);
}

#[test]
fn test_overload_isolation() {
    let settings = Settings::from_toml("[mqtt]\nmax_inflight = 1\nmax_mqueue_len = 2\n").unwrap();
    let hooks = DefaultHookManager::new();
    let dropped = Arc::new(Mutex::new(Vec::new()));
    let dropped1 = dropped.clone();
    hooks
        .add_fn(Type::MessageDropped, 0, move |param, acc| {
            if let Parameter::MessageDropped(to, p, r) = param {
                dropped1.lock().push((to.to_string(), p.payload.clone(), r.clone()));
            }
            (true, acc)
        })
        .unwrap();
    let broker = Broker::builder().settings(settings).hooks(hooks).build();

    let (a, mut arx) = connect(&broker, Connect::new("a", true, 0));
    let (b, mut brx) = connect(&broker, Connect::new("b", true, 0));
    subscribe(&broker, &a, "t", QoS::AtLeastOnce);
    subscribe(&broker, &b, "t", QoS::AtLeastOnce);
    drain(&mut arx);
    drain(&mut brx);
    let (p, _prx) = connect(&broker, Connect::new("p", true, 0));

    for (i, payload) in ["1", "2", "3"].into_iter().enumerate() {
        let publish = Publish::new("t", payload, QoS::AtLeastOnce).packet_id(i as u16 + 1);
        broker.on_packet(&p, publish.into()).unwrap();
        let got = publishes(&mut brx);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].payload, payload);
        broker.on_packet(&b, Packet::PublishAck { packet_id: got[0].packet_id.unwrap() }).unwrap();
    }

    assert_eq!(publishes(&mut arx).len(), 1);
    assert_eq!(a.session.inflight_len(), 1);
    assert_eq!(a.session.queue_len(), 1);
    assert_eq!(*dropped.lock(), vec![("a".to_string(), bytes::Bytes::from("3"), Reason::MessageQueueFull)]);
    assert_eq!(broker.stats.dropped.count(), 1);
    assert_eq!(broker.stats.forwards.count(), 5);
}

#[test]
fn test_retained_round_trip() {
    let broker = Broker::builder().build();
    let (p, _prx) = connect(&broker, Connect::new("p", true, 0));
    broker.on_packet(&p, Publish::new("a/b", "old", QoS::AtMostOnce).retain(true).into()).unwrap();
    broker.on_packet(&p, Publish::new("a/b", "x", QoS::AtLeastOnce).retain(true).packet_id(1).into()).unwrap();
    assert_eq!(broker.router.retain().count(), 1);

    let (s1, mut rx1) = connect(&broker, Connect::new("s1", true, 0));
    subscribe(&broker, &s1, "a/+", QoS::AtLeastOnce);
    let out = drain(&mut rx1);
    assert!(matches!(&out[0], Outgoing::Packet(Packet::SubscribeAck { .. })));
    assert_eq!(out.len(), 2);
    match &out[1] {
        Outgoing::Packet(Packet::Publish(r)) => {
            assert!(r.retain);
            assert_eq!(r.payload, "x");
            assert_eq!(r.qos, QoS::AtLeastOnce);
        }
        o => panic!("unexpected {:?}", o),
    }

    broker.on_packet(&p, Publish::new("a/b", "", QoS::AtMostOnce).retain(true).into()).unwrap();
    assert_eq!(broker.router.retain().count(), 0);
    let live = publishes(&mut rx1);
    assert_eq!(live.len(), 1);
    assert!(!live[0].retain);

    let (s2, mut rx2) = connect(&broker, Connect::new("s2", true, 0));
    subscribe(&broker, &s2, "a/#", QoS::AtLeastOnce);
    assert!(publishes(&mut rx2).is_empty());
}

#[test]
fn test_qos2_exactly_once() {
    let broker = Broker::builder().build();
    let (s, mut srx) = connect(&broker, Connect::new("s", true, 0));
    subscribe(&broker, &s, "t", QoS::ExactlyOnce);
    drain(&mut srx);
    let (p, mut prx) = connect(&broker, Connect::new("p", true, 0));

    let publish = Publish::new("t", "once", QoS::ExactlyOnce).packet_id(5);
    broker.on_packet(&p, publish.clone().into()).unwrap();
    broker.on_packet(&p, publish.clone().dup(true).into()).unwrap();
    assert_eq!(
        drain(&mut prx),
        vec![
            Outgoing::Packet(Packet::PublishReceived { packet_id: pid(5) }),
            Outgoing::Packet(Packet::PublishReceived { packet_id: pid(5) }),
        ]
    );
    assert_eq!(broker.stats.in_inflights.count(), 1);
    broker.on_packet(&p, Packet::PublishRelease { packet_id: pid(5) }).unwrap();
    assert_eq!(drain(&mut prx), vec![Outgoing::Packet(Packet::PublishComplete { packet_id: pid(5) })]);
    assert_eq!(broker.stats.in_inflights.count(), 0);

    let got = publishes(&mut srx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].qos, QoS::ExactlyOnce);
    let out_pid = got[0].packet_id.unwrap();

    broker.on_packet(&s, Packet::PublishReceived { packet_id: out_pid }).unwrap();
    broker.on_packet(&s, Packet::PublishReceived { packet_id: out_pid }).unwrap();
    assert_eq!(
        drain(&mut srx),
        vec![
            Outgoing::Packet(Packet::PublishRelease { packet_id: out_pid }),
            Outgoing::Packet(Packet::PublishRelease { packet_id: out_pid }),
        ]
    );
    broker.on_packet(&s, Packet::PublishComplete { packet_id: out_pid }).unwrap();
    broker.on_packet(&s, Packet::PublishComplete { packet_id: out_pid }).unwrap();
    assert_eq!(s.session.inflight_len(), 0);
    assert_eq!(broker.stats.acked.count(), 1);
    assert!(drain(&mut srx).is_empty());
}

#[test]
fn test_hook_vetoes() {
    let hooks = DefaultHookManager::new();
    hooks
        .subscribe_policy(|_s, topic_filter, qos| {
            if topic_filter.starts_with("test/nosubscribe") {
                SubscribeReturnCode::Failure
            } else {
                SubscribeReturnCode::Success(qos.less_value(QoS::AtLeastOnce))
            }
        })
        .unwrap();
    hooks
        .add_fn(Type::MessagePublish, 0, |param, acc| match param {
            Parameter::MessagePublish(_, p) if p.topic.starts_with("blocked/") => {
                (false, Some(HookResult::PublishRefused))
            }
            _ => (true, acc),
        })
        .unwrap();
    let broker = Broker::builder().hooks(hooks).build();

    let (s, mut rx) = connect(&broker, Connect::new("s", true, 0));
    let topic_filters = vec![
        ("test/nosubscribe".into(), QoS::AtLeastOnce),
        ("blocked/#".into(), QoS::ExactlyOnce),
    ];
    broker.on_packet(&s, Packet::Subscribe { packet_id: pid(3), topic_filters }).unwrap();
    assert_eq!(
        drain(&mut rx),
        vec![Outgoing::Packet(Packet::SubscribeAck {
            packet_id: pid(3),
            status: vec![SubscribeReturnCode::Failure, SubscribeReturnCode::Success(QoS::AtLeastOnce)],
        })]
    );
    assert_eq!(broker.router.registry().routes().count(), 1);
    assert_eq!(s.session.subscriptions().len(), 1);

    let (p, mut prx) = connect(&broker, Connect::new("p", true, 0));
    broker.on_packet(&p, Publish::new("blocked/x", "no", QoS::AtLeastOnce).packet_id(2).into()).unwrap();
    assert_eq!(drain(&mut prx), vec![Outgoing::Packet(Packet::PublishAck { packet_id: pid(2) })]);
    assert!(drain(&mut rx).is_empty());
    assert_eq!(broker.stats.dropped.count(), 1);
}

#[test]
fn test_takeover_publishes_last_will() {
    let broker = Broker::builder().build();
    let (w, mut wrx) = connect(&broker, Connect::new("w", true, 0));
    subscribe(&broker, &w, "will/#", QoS::AtMostOnce);
    drain(&mut wrx);

    let will = LastWill { qos: QoS::AtMostOnce, retain: false, topic: "will/c1".into(), message: "bye".into() };
    let (h1, mut rx1) = connect(&broker, Connect::new("c1", false, 0).last_will(will));
    let (tx, _rx2) = tokio::sync::mpsc::channel(64);
    let h2 = broker.on_connect(&Connect::new("c1", false, 0), tx).unwrap();
    assert!(h2.session_present);
    assert!(Arc::ptr_eq(&h1.session, &h2.session));
    assert_eq!(drain(&mut rx1), vec![Outgoing::Close(Reason::ConnectTakenOver)]);

    let wills = publishes(&mut wrx);
    assert_eq!(wills.len(), 1);
    assert_eq!(wills[0].topic, "will/c1");
    assert_eq!(wills[0].payload, "bye");

    broker.on_close(&h1, Reason::ConnectRemoteClose);
    assert!(h2.session.is_attached());
    assert_eq!(broker.stats.connections.count(), 2);
}

#[test]
fn test_keepalive_expiry() {
    let broker = Broker::builder().build();
    let (w, mut wrx) = connect(&broker, Connect::new("w", true, 0));
    subscribe(&broker, &w, "will/#", QoS::AtMostOnce);
    drain(&mut wrx);

    let will = LastWill { qos: QoS::AtMostOnce, retain: false, topic: "will/c1".into(), message: "lost".into() };
    let (_c1, mut rx) = connect(&broker, Connect::new("c1", true, 10).last_will(will));
    broker.tick(timestamp_millis() + 5_000);
    assert!(drain(&mut rx).is_empty());

    broker.tick(timestamp_millis() + 60_000);
    assert_eq!(drain(&mut rx), vec![Outgoing::Close(Reason::ConnectKeepaliveTimeout)]);
    assert!(broker.session("c1").is_none());
    assert!(broker.session("w").is_some());
    assert_eq!(publishes(&mut wrx).len(), 1);
}

#[test]
fn test_inflight_never_exceeds_window() {
    let settings = Settings::from_toml("[mqtt]\nmax_inflight = 2\nretry_interval = \"1s\"\n").unwrap();
    let broker = Broker::builder().settings(settings).build();
    let (s, mut rx) = connect(&broker, Connect::new("s", true, 0));
    subscribe(&broker, &s, "t", QoS::AtLeastOnce);
    drain(&mut rx);
    let (p, _prx) = connect(&broker, Connect::new("p", true, 0));

    for i in 1..=5u16 {
        broker.on_packet(&p, Publish::new("t", format!("m{i}"), QoS::AtLeastOnce).packet_id(i).into()).unwrap();
        assert!(s.session.inflight_len() <= 2);
    }
    assert_eq!(s.session.queue_len(), 3);
    let sent = publishes(&mut rx);
    assert_eq!(sent.len(), 2);

    broker.tick(timestamp_millis() + 1_500);
    let retried = publishes(&mut rx);
    assert_eq!(retried.len(), 2);
    assert!(retried.iter().all(|p| p.dup));

    broker.on_packet(&s, Packet::PublishAck { packet_id: sent[0].packet_id.unwrap() }).unwrap();
    let next = publishes(&mut rx);
    assert_eq!(next.len(), 1);
    assert_eq!(next[0].payload, "m3");
    assert_eq!(s.session.inflight_len(), 2);
    assert_eq!(broker.stats_json()["out_inflights.max"], 2);
}

#[test]
fn test_replaced_connection_cannot_subscribe() {
    let broker = Broker::builder().build();
    let (old, _old_rx) = connect(&broker, Connect::new("c1", true, 0));
    let (new, mut new_rx) = connect(&broker, Connect::new("c1", true, 0));
    assert!(!Arc::ptr_eq(&old.session, &new.session));

    let topic_filters = vec![(TopicFilter::from("secret"), QoS::AtMostOnce)];
    assert_eq!(
        broker.on_packet(&old, Packet::Subscribe { packet_id: pid(1), topic_filters }),
        Err(MqttError::ConnectionClosed)
    );
    assert_eq!(broker.router.registry().routes().count(), 0);

    let (p, _prx) = connect(&broker, Connect::new("p", true, 0));
    broker.on_packet(&p, Publish::new("secret", "leak", QoS::AtMostOnce).into()).unwrap();
    assert!(publishes(&mut new_rx).is_empty());

    //the old connection task ending leaves the new session's routes alone
    subscribe(&broker, &new, "t", QoS::AtMostOnce);
    broker.on_close(&old, Reason::ConnectRemoteClose);
    assert_eq!(broker.router.registry().routes().count(), 1);
    broker.on_packet(&p, Publish::new("t", "hi", QoS::AtMostOnce).into()).unwrap();
    assert_eq!(publishes(&mut new_rx).len(), 1);

    broker.on_disconnect(&new);
    assert_eq!(broker.router.registry().routes().count(), 0);
    assert_eq!(broker.stats.subscriptions.count(), 0);
}

#[test]
fn test_slow_qos0_reader_fills_its_queue() {
    let settings = Settings::from_toml("[mqtt]\nmax_inflight = 1\nmax_mqueue_len = 2\n").unwrap();
    let broker = Broker::builder().settings(settings).build();
    let (slow, mut slow_rx) = connect_with(&broker, Connect::new("slow", true, 0), 1);
    let (fast, mut fast_rx) = connect(&broker, Connect::new("fast", true, 0));
    subscribe(&broker, &slow, "t", QoS::AtMostOnce);
    subscribe(&broker, &fast, "t", QoS::AtMostOnce);
    drain(&mut fast_rx);
    let (p, _prx) = connect(&broker, Connect::new("p", true, 0));

    //the SUBACK is still unread, the slow reader's channel is full
    for i in 0..3 {
        broker.on_packet(&p, Publish::new("t", format!("m{i}"), QoS::AtMostOnce).into()).unwrap();
    }
    assert_eq!(publishes(&mut fast_rx).len(), 3);
    assert_eq!(slow.session.queue_len(), 2);
    assert_eq!(broker.stats.dropped.count(), 1);

    assert!(matches!(slow_rx.try_recv(), Ok(Outgoing::Packet(Packet::SubscribeAck { .. }))));
    broker.tick(timestamp_millis());
    let got = publishes(&mut slow_rx);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].payload, "m0");
    assert_eq!(slow.session.queue_len(), 1);
}

fn spawn_conn(
    broker: &Broker,
) -> (mpsc::UnboundedSender<Packet>, mpsc::UnboundedReceiver<Packet>, tokio::task::JoinHandle<tmq::Result<()>>) {
    let (in_tx, in_rx) = mpsc::unbounded::<Packet>();
    let (out_tx, out_rx) = mpsc::unbounded::<Packet>();
    let join = tokio::spawn(tmq::server::serve(broker.clone(), in_rx.map(Ok::<_, std::io::Error>), out_tx));
    (in_tx, out_rx, join)
}

#[tokio::test]
async fn test_serve_end_to_end() {
    let broker = Broker::builder().build();

    let (sub_in, mut sub_out, sub_join) = spawn_conn(&broker);
    sub_in.unbounded_send(Connect::new("sub", true, 30).into()).unwrap();
    sub_in
        .unbounded_send(Packet::Subscribe {
            packet_id: pid(1),
            topic_filters: vec![("sensors/+/temp".into(), QoS::AtLeastOnce)],
        })
        .unwrap();
    assert!(matches!(sub_out.next().await, Some(Packet::ConnectAck { session_present: false, .. })));
    assert_eq!(
        sub_out.next().await,
        Some(Packet::SubscribeAck { packet_id: pid(1), status: vec![SubscribeReturnCode::Success(QoS::AtLeastOnce)] })
    );

    let (pub_in, mut pub_out, pub_join) = spawn_conn(&broker);
    pub_in.unbounded_send(Connect::new("pub", true, 30).into()).unwrap();
    pub_in
        .unbounded_send(Publish::new("sensors/room1/temp", "21.5", QoS::AtLeastOnce).packet_id(3).into())
        .unwrap();
    assert!(matches!(pub_out.next().await, Some(Packet::ConnectAck { .. })));
    assert_eq!(pub_out.next().await, Some(Packet::PublishAck { packet_id: pid(3) }));

    let delivered = match sub_out.next().await {
        Some(Packet::Publish(p)) => p,
        o => panic!("unexpected {:?}", o),
    };
    assert_eq!(delivered.payload, "21.5");
    sub_in.unbounded_send(Packet::PublishAck { packet_id: delivered.packet_id.unwrap() }).unwrap();

    drop(pub_in);
    pub_join.await.unwrap().unwrap();
    sub_in.unbounded_send(Packet::Disconnect).unwrap();
    sub_join.await.unwrap().unwrap();

    assert!(broker.sessions.is_empty());
    assert_eq!(broker.stats.acked.count(), 1);
    assert_eq!(broker.stats.connections.count(), 0);
    assert_eq!(broker.router.registry().routes().count(), 0);
}
