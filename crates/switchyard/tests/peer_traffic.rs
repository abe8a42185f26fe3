//! End-to-end traffic between peers sharing dispatchers.

use std::net::TcpListener;
use std::os::unix::net::UnixListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use rstest::rstest;
use serde_json::{Value, json};
use tempfile::TempDir;

use switchyard::{
    BusAddress, BusConnection, BusEndpoint, CallingThread, ConnectionOptions, DeliveryQueue,
    DispatchStatus, Dispatcher, MatchRule, Message, StreamConnection,
};

const PATH: &str = "/org/example/Peer";
const INTERFACE: &str = "org.example.Peer";
const TIMEOUT: Duration = Duration::from_secs(5);

fn attach(dispatcher: &Dispatcher, connection: &Arc<StreamConnection>) {
    dispatcher
        .add_connection(Arc::clone(connection) as Arc<dyn BusConnection>)
        .expect("attach connection");
}

/// Serves `Ping` on one accepted stream, attached to its own dispatcher.
fn serve_ping(server: StreamConnection) -> (Dispatcher, Arc<StreamConnection>) {
    let dispatcher = Dispatcher::create(true).expect("server dispatcher");
    let connection = Arc::new(server);
    connection.add_method_handler(PATH, Some(INTERFACE), "Ping", CallingThread::Dispatcher, |call| {
        Ok(json!({ "pong": call.body().clone() }))
    });
    attach(&dispatcher, &connection);
    (dispatcher, connection)
}

#[rstest]
fn peers_answering_each_others_signals_do_not_deadlock() {
    let dispatcher = Dispatcher::create(true).expect("dispatcher");
    let (left, right) = StreamConnection::pair().expect("pair");
    let (emitter, responder) = (Arc::new(left), Arc::new(right));

    let acknowledged = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&acknowledged);
    emitter.add_method_handler(PATH, Some(INTERFACE), "Ack", CallingThread::Dispatcher, move |_| {
        counter.fetch_add(1, Ordering::AcqRel);
        Ok(Value::Null)
    });

    // Inline handlers must not block the dispatch thread, so they call back
    // asynchronously.
    let inline_peer = Arc::clone(&responder);
    responder.add_signal_handler(
        MatchRule::signal().member("Changed"),
        CallingThread::Dispatcher,
        move |_| {
            let call = Message::method_call(PATH, INTERFACE, "Ack");
            inline_peer
                .call(call, TIMEOUT, CallingThread::Dispatcher, |_| {})
                .expect("inline acknowledgement");
        },
    );
    // Designated handlers run on this thread and may block on the reply.
    let designated_peer = Arc::clone(&responder);
    responder.add_signal_handler(
        MatchRule::signal().member("Changed"),
        CallingThread::current(),
        move |_| {
            let reply = designated_peer
                .call_blocking(Message::method_call(PATH, INTERFACE, "Ack"), TIMEOUT)
                .expect("designated acknowledgement");
            assert!(!reply.is_error(), "unexpected error reply: {reply:?}");
        },
    );

    attach(&dispatcher, &emitter);
    attach(&dispatcher, &responder);
    for sequence in 0..2 {
        emitter
            .emit_signal(PATH, INTERFACE, "Changed", json!(sequence))
            .expect("emit");
    }

    let deadline = Instant::now() + TIMEOUT;
    let done = DeliveryQueue::pump_until(deadline, || acknowledged.load(Ordering::Acquire) == 4);
    assert!(done, "saw {} acknowledgements", acknowledged.load(Ordering::Acquire));
    dispatcher.stop().expect("stop");
}

#[rstest]
fn connections_created_from_unix_addresses_reach_the_server() {
    let dir = TempDir::new().expect("tempdir");
    let socket = dir.path().join("bus.sock");
    let listener = UnixListener::bind(&socket).expect("bind listener");
    let acceptor = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        serve_ping(StreamConnection::from_unix(stream, ConnectionOptions::default()).expect("server"))
    });

    let client_dispatcher = Dispatcher::create(true).expect("client dispatcher");
    let endpoint = BusEndpoint::unix(socket.to_str().expect("utf-8 path"));
    let client = client_dispatcher
        .create_connection(endpoint)
        .expect("connect");
    let (_server_dispatcher, _server) = acceptor.join().expect("acceptor thread");

    let reply = client
        .call_blocking(
            Message::method_call(PATH, INTERFACE, "Ping").with_body(json!(7)),
            TIMEOUT,
        )
        .expect("reply");
    assert_eq!(reply.body(), &json!({ "pong": 7 }));
    assert_eq!(client_dispatcher.connection_count(), 1);
}

#[rstest]
fn later_address_alternatives_are_tried_in_order() {
    let dir = TempDir::new().expect("tempdir");
    let missing = dir.path().join("absent.sock");
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local address").port();
    let acceptor = thread::spawn(move || {
        let (stream, _) = listener.accept().expect("accept");
        serve_ping(StreamConnection::from_tcp(stream, ConnectionOptions::default()).expect("server"))
    });

    let address: BusAddress = format!(
        "unix:path={};tcp:host=127.0.0.1,port={port}",
        missing.to_str().expect("utf-8 path")
    )
    .parse()
    .expect("address");
    let client_dispatcher = Dispatcher::create(true).expect("client dispatcher");
    let client = client_dispatcher.create_connection(address).expect("connect");
    let (_server_dispatcher, _server) = acceptor.join().expect("acceptor thread");

    let reply = client
        .call_blocking(Message::method_call(PATH, INTERFACE, "Ping"), TIMEOUT)
        .expect("reply");
    assert!(!reply.is_error());
}

#[rstest]
fn dropping_a_peer_fails_calls_in_flight() {
    let dispatcher = Dispatcher::create(true).expect("dispatcher");
    let (left, right) = StreamConnection::pair().expect("pair");
    let caller = Arc::new(left);
    attach(&dispatcher, &caller);

    let (sender, receiver) = crossbeam_channel::bounded(1);
    caller
        .call(
            Message::method_call(PATH, INTERFACE, "Never"),
            Duration::from_secs(30),
            CallingThread::Dispatcher,
            move |reply| {
                let _sent = sender.send(reply);
            },
        )
        .expect("call");
    drop(right);

    let reply = receiver.recv_timeout(TIMEOUT).expect("synthesised reply");
    assert_eq!(reply.error_name(), Some(switchyard::DISCONNECTED_ERROR));
    assert!(!caller.is_connected());
}

#[rstest]
fn the_engine_flushes_writes_queued_before_attachment() {
    const SIGNALS: usize = 64;
    let (left, right) = StreamConnection::pair().expect("pair");
    let (sender, receiver) = (Arc::new(left), Arc::new(right));
    let delivered = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&delivered);
    receiver.add_signal_handler(
        MatchRule::signal().member("Chunk"),
        CallingThread::Dispatcher,
        move |_| {
            counter.fetch_add(1, Ordering::AcqRel);
        },
    );

    let payload = json!("x".repeat(16 * 1024));
    for _ in 0..SIGNALS {
        sender
            .emit_signal(PATH, INTERFACE, "Chunk", payload.clone())
            .expect("emit");
    }
    assert_eq!(sender.dispatch_status(), DispatchStatus::NeedWrite);

    let dispatcher = Dispatcher::create(true).expect("dispatcher");
    attach(&dispatcher, &sender);
    attach(&dispatcher, &receiver);

    let deadline = Instant::now() + TIMEOUT;
    while delivered.load(Ordering::Acquire) < SIGNALS && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(delivered.load(Ordering::Acquire), SIGNALS);
    assert_eq!(sender.dispatch_status(), DispatchStatus::Idle);
    dispatcher.stop().expect("stop");
}
