//! Request/response correlation with competing clients and servers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use strata_channel::{ChannelError, ChannelOptions, Message, MessageChannel};
use strata_icc::{AdmissionPolicy, MultiWriterQueue};

const ECHO: i32 = 1;
const ORDER: i32 = 2;

fn queue_pair() -> (MultiWriterQueue, MultiWriterQueue) {
    (
        MultiWriterQueue::heap(1 << 20, AdmissionPolicy::BestEffort).unwrap(),
        MultiWriterQueue::heap(1 << 20, AdmissionPolicy::BestEffort).unwrap(),
    )
}

fn options() -> ChannelOptions {
    ChannelOptions {
        request_timeout: Duration::from_secs(5),
        poll_interval: Duration::from_micros(20),
    }
}

/// Answers each request via `handle`; exits once `stop` is set and the
/// inbound queue is drained.
fn spawn_server(
    mut channel: MessageChannel,
    stop: Arc<AtomicBool>,
    handle: impl Fn(&MessageChannel, &Message) + Send + 'static,
) -> JoinHandle<u64> {
    thread::spawn(move || {
        let mut served = 0;
        loop {
            match channel.next_message(&[]) {
                Ok(Some(req)) => {
                    handle(&channel, &req);
                    served += 1;
                }
                Ok(None) if stop.load(Ordering::Relaxed) => break,
                Ok(None) => thread::sleep(Duration::from_micros(20)),
                Err(e) => panic!("server read failed: {e}"),
            }
        }
        served
    })
}

fn echo(channel: &MessageChannel, req: &Message) {
    channel.publish(&req.reply(req.body.clone())).unwrap();
}

#[test]
fn eight_clients_three_servers_echo() {
    const CLIENTS: usize = 8;
    const REQUESTS: usize = 200;

    let (requests, responses) = queue_pair();
    let stop = Arc::new(AtomicBool::new(false));

    let servers: Vec<_> = (0..3)
        .map(|_| {
            let channel = MessageChannel::server(&requests, &responses, options());
            spawn_server(channel, Arc::clone(&stop), echo)
        })
        .collect();

    let clients: Vec<_> = (0..CLIENTS)
        .map(|c| {
            let mut channel = MessageChannel::client(&requests, &responses, options());
            thread::spawn(move || {
                let mut rng = fastrand::Rng::with_seed(c as u64);
                for i in 0..REQUESTS {
                    let len = rng.usize(0..24);
                    let mut body = format!("client-{c}-req-{i}-").into_bytes();
                    body.extend((0..len).map(|_| rng.alphanumeric() as u8));

                    let reply = channel.request(&Message::new(ECHO, body.clone())).unwrap();
                    assert_eq!(reply.kind, ECHO);
                    assert_eq!(reply.body, body, "client {c} got someone else's reply");
                }
            })
        })
        .collect();

    for c in clients {
        c.join().unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    let served: u64 = servers.into_iter().map(|s| s.join().unwrap()).sum();

    // every server sees every request
    assert_eq!(served, 3 * (CLIENTS * REQUESTS) as u64);
}

#[test]
fn fan_out_collects_every_server() {
    let (requests, responses) = queue_pair();
    let stop = Arc::new(AtomicBool::new(false));

    let servers: Vec<_> = (0..3u8)
        .map(|id| {
            let channel = MessageChannel::server(&requests, &responses, options());
            spawn_server(channel, Arc::clone(&stop), move |ch, req| {
                ch.publish(&req.reply(vec![id])).unwrap();
            })
        })
        .collect();

    let mut client = MessageChannel::client(&requests, &responses, options());
    let replies = client
        .request_all(&Message::new(ECHO, "who is there"), Duration::from_millis(300))
        .unwrap();

    stop.store(true, Ordering::Relaxed);
    for s in servers {
        s.join().unwrap();
    }

    let mut ids: Vec<u8> = replies.iter().map(|r| r.body[0]).collect();
    ids.sort_unstable();
    assert_eq!(ids, [0, 1, 2]);
    assert!(replies.windows(2).all(|w| w[0].reference == w[1].reference));
}

#[test]
fn ack_nack_across_threads() {
    let (requests, responses) = queue_pair();
    let stop = Arc::new(AtomicBool::new(false));

    let server = spawn_server(
        MessageChannel::server(&requests, &responses, options()),
        Arc::clone(&stop),
        |ch, req| {
            let qty: u32 = String::from_utf8_lossy(&req.body).parse().unwrap();
            if qty <= 100 {
                ch.update_ack(req).unwrap();
            } else {
                ch.nack(req, "quantity above limit").unwrap();
            }
        },
    );

    let mut client = MessageChannel::client(&requests, &responses, options());
    let timeout = Duration::from_secs(2);
    client.request_and_check_ack(&Message::new(ORDER, "10"), timeout).unwrap();
    client.request_and_check_ack(&Message::new(ORDER, "100"), timeout).unwrap();
    let err = client
        .request_and_check_ack(&Message::new(ORDER, "101"), timeout)
        .unwrap_err();
    assert!(matches!(err, ChannelError::Rejected(reason) if reason == "quantity above limit"));

    stop.store(true, Ordering::Relaxed);
    assert_eq!(server.join().unwrap(), 3);
}

#[test]
fn subscribers_filter_by_kind() {
    let (updates, unused) = queue_pair();
    let publisher = MessageChannel::client(&updates, &unused, options());
    let mut quotes = MessageChannel::server(&updates, &unused, options());
    let mut fills = MessageChannel::server(&updates, &unused, options());

    for i in 0..40 {
        let kind = 10 + i % 4;
        publisher.publish(&Message::new(kind, vec![i as u8])).unwrap();
    }

    let mut got_quotes = Vec::new();
    while let Some(m) = quotes.next_message(&[11]).unwrap() {
        got_quotes.push(m.body[0]);
    }
    let mut got_fills = 0;
    while let Some(m) = fills.next_message(&[12, 13]).unwrap() {
        assert!(m.kind == 12 || m.kind == 13);
        got_fills += 1;
    }

    assert_eq!(got_quotes, (0..40).filter(|i| i % 4 == 1).collect::<Vec<u8>>());
    assert_eq!(got_fills, 20);
}

#[test]
fn no_server_times_out() {
    let (requests, responses) = queue_pair();
    let mut client = MessageChannel::client(&requests, &responses, options());
    let err = client
        .request_sync(&Message::new(ECHO, "anyone"), Duration::from_millis(10))
        .unwrap_err();
    match err {
        ChannelError::Timeout { waited, .. } => assert_eq!(waited, Duration::from_millis(10)),
        other => panic!("expected timeout, got {other}"),
    }
}
