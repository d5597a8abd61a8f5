use std::{
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread::spawn,
    time::Duration,
};

use reactor_sockets::{
    ActiveSocket, ContextBuilder, EventQueue, Inet4Address, IoReactor, PassiveSocket, SocketContext,
    SocketOptions,
};

fn setup() -> (IoReactor, EventQueue, SocketContext<IoReactor>) {
    _ = pretty_env_logger::try_init();

    let reactor = IoReactor::new().unwrap();

    let queue = EventQueue::new("tcp");

    let context = ContextBuilder::new()
        .default_queue(queue.clone())
        .reactor(reactor.clone());

    (reactor, queue, context)
}

fn connected_pair(
    context: &SocketContext<IoReactor>,
) -> (ActiveSocket<Inet4Address>, ActiveSocket<Inet4Address>) {
    let mut listener = PassiveSocket::<Inet4Address>::new(context);

    assert!(listener.set_reuse_address(true));
    assert!(listener.bind(&Inet4Address::localhost()));
    assert!(listener.listen(4));

    let client = ActiveSocket::new(context);

    assert!(client.connect(&listener.bound_address().unwrap(), || {}));

    let server = listener.accept().unwrap();

    assert_eq!(server.remote_address(), client.getsockname());

    (client, server)
}

/// Drive the reactor and the queue from this thread until `done` or the
/// iteration limit is hit.
fn pump<F: Fn() -> bool>(reactor: &IoReactor, queue: &EventQueue, done: F) {
    pump_for(200, reactor, queue, done)
}

fn pump_for<F: Fn() -> bool>(rounds: usize, reactor: &IoReactor, queue: &EventQueue, done: F) {
    for _ in 0..rounds {
        queue.run_pending();

        if done() {
            return;
        }

        reactor.poll_once(Duration::from_millis(50)).unwrap();
    }

    panic!("condition not reached");
}

#[test]
fn test_tcp() {
    let (reactor, queue, context) = setup();

    let (client, server) = connected_pair(&context);

    let received = Arc::new(Mutex::new(vec![]));
    let eof = Arc::new(AtomicBool::new(false));

    let callback_received = received.clone();
    let callback_eof = eof.clone();

    assert!(server.set_on_read(move |socket| {
        let (len, buffer) = socket.read();

        if len > 0 {
            callback_received
                .lock()
                .unwrap()
                .extend_from_slice(&buffer[..len as usize]);

            return;
        }

        drop(buffer);

        callback_eof.store(true, Ordering::SeqCst);

        socket.close();
    }));

    assert!(client.async_write(b"hello "));

    let mut writer = client.clone();

    std::fmt::Write::write_fmt(&mut writer, format_args!("{}", "world")).unwrap();

    pump(&reactor, &queue, || received.lock().unwrap().len() == 11);

    assert_eq!(&received.lock().unwrap()[..], b"hello world");
    assert_eq!(client.pending_writes(), 0);

    // peer close shows up as a zero length read
    client.close();

    assert!(!client.is_valid());

    pump(&reactor, &queue, || eof.load(Ordering::SeqCst));

    assert!(!server.is_valid());
    assert!(!server.has_read_subscription());
    assert_eq!(reactor.subscriptions(), 0);
}

#[test]
fn test_deferred_close() {
    let (reactor, queue, context) = setup();

    let (client, server) = connected_pair(&context);

    let closed = Arc::new(AtomicUsize::new(0));

    let callback_closed = closed.clone();

    client.set_on_close(move |_| {
        callback_closed.fetch_add(1, Ordering::SeqCst);
    });

    assert!(client.async_write(b"first"));
    assert!(client.async_write(b"second"));

    client.close();

    assert!(client.close_requested());
    assert!(client.is_valid());

    pump(&reactor, &queue, || !client.is_valid());

    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert!(!client.close_requested());

    let mut received = vec![];

    loop {
        let (len, buffer) = server.read();

        if len <= 0 {
            break;
        }

        received.extend_from_slice(&buffer[..len as usize]);
    }

    assert_eq!(received, b"firstsecond");
}

#[test]
#[allow(let_underscore_lock)]
fn test_large_async_write_same_queue() {
    let (reactor, queue, context) = setup();

    let (client, server) = connected_pair(&context);

    let data = vec![7u8; 8 * 1024 * 1024];

    let received = Arc::new(AtomicUsize::new(0));

    let callback_received = received.clone();

    assert!(server.set_on_read(move |socket| loop {
        let (len, _) = socket.read();

        if len <= 0 {
            return;
        }

        callback_received.fetch_add(len as usize, Ordering::SeqCst);

        if socket.available_bytes() == 0 {
            return;
        }
    }));

    assert!(client.async_write(&data));

    // the write and the reader share one queue and one thread
    pump_for(5000, &reactor, &queue, || {
        received.load(Ordering::SeqCst) == data.len()
    });

    assert_eq!(client.pending_writes(), 0);
}

#[test]
fn test_failed_writes_complete_deferred_close() {
    let (reactor, queue, context) = setup();

    let (client, server) = connected_pair(&context);

    let closed = Arc::new(AtomicUsize::new(0));

    let callback_closed = closed.clone();

    client.set_on_close(move |_| {
        callback_closed.fetch_add(1, Ordering::SeqCst);
    });

    server.close();

    let data = vec![1u8; 1024 * 1024];

    assert!(client.async_write(&data));
    assert!(client.async_write(&data));

    client.close();

    assert!(client.close_requested());

    // both writes end with EPIPE or ECONNRESET and still count as completions
    pump(&reactor, &queue, || !client.is_valid());

    assert_eq!(client.pending_writes(), 0);
    assert!(!client.close_requested());
    assert_eq!(closed.load(Ordering::SeqCst), 1);
}

#[futures_test::test]
async fn test_queue_run() {
    let (reactor, queue, context) = setup();

    let (client, server) = connected_pair(&context);

    let stop = Arc::new(AtomicBool::new(false));

    let background_reactor = reactor.clone();
    let background_stop = stop.clone();

    let handle = spawn(move || {
        while !background_stop.load(Ordering::SeqCst) {
            background_reactor
                .poll_once(Duration::from_millis(10))
                .unwrap();
        }
    });

    let received = Arc::new(Mutex::new(vec![]));

    let callback_received = received.clone();
    let callback_queue = queue.clone();

    server.set_on_read(move |socket| {
        let (len, buffer) = socket.read();

        assert!(len > 0);

        let mut received = callback_received.lock().unwrap();

        received.extend_from_slice(&buffer[..len as usize]);

        if received.len() == 11 {
            callback_queue.close();
        }
    });

    assert_eq!(client.send(b"hello world"), 11);

    assert!(queue.run().await > 0);

    stop.store(true, Ordering::SeqCst);

    handle.join().unwrap();

    assert_eq!(&received.lock().unwrap()[..], b"hello world");

    // closed queue refuses new work
    assert!(!client.async_write(b"late"));
    assert_eq!(client.pending_writes(), 0);
}
