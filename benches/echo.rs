use std::thread::spawn;

use anyhow::anyhow;
use criterion::*;
use reactor_sockets::{
    ActiveSocket, ContextBuilder, EventQueue, Inet4Address, IoReactor, PassiveSocket, SocketContext,
};

fn setup_server(context: SocketContext<IoReactor>) -> anyhow::Result<Inet4Address> {
    let mut listener = PassiveSocket::<Inet4Address>::new(&context);

    if !listener.bind(&Inet4Address::localhost()) || !listener.listen(16) {
        return Err(anyhow!("could not start echo server"));
    }

    let address = listener
        .bound_address()
        .ok_or_else(|| anyhow!("listener has no address"))?;

    spawn(move || {
        while let Some(conn) = listener.accept() {
            spawn(move || loop {
                let data = {
                    let (len, buffer) = conn.read();

                    if len <= 0 {
                        break;
                    }

                    buffer[..len as usize].to_vec()
                };

                if conn.send(&data) < 0 {
                    break;
                }
            });
        }
    });

    Ok(address)
}

fn read_exact(conn: &ActiveSocket<Inet4Address>, mut remaining: usize) -> anyhow::Result<()> {
    while remaining > 0 {
        let (len, _) = conn.read();

        if len <= 0 {
            return Err(anyhow!("echo connection closed"));
        }

        remaining = remaining.saturating_sub(len as usize);
    }

    Ok(())
}

fn echo_send(conn: &ActiveSocket<Inet4Address>) -> anyhow::Result<()> {
    if conn.send(b"hello world") != 11 {
        return Err(anyhow!("short send"));
    }

    read_exact(conn, 11)
}

fn echo_async_write(conn: &ActiveSocket<Inet4Address>, queue: &EventQueue) -> anyhow::Result<()> {
    if !conn.async_write(b"hello world") {
        return Err(anyhow!("async write refused"));
    }

    queue.run_pending();

    read_exact(conn, 11)
}

fn connect(context: &SocketContext<IoReactor>, address: &Inet4Address) -> anyhow::Result<ActiveSocket<Inet4Address>> {
    let conn = ActiveSocket::new(context);

    if !conn.connect(address, || {}) {
        return Err(anyhow!("could not connect to {}", address));
    }

    Ok(conn)
}

fn bench_echo(c: &mut Criterion) {
    _ = pretty_env_logger::try_init();

    let queue = EventQueue::new("bench");

    let context = ContextBuilder::new()
        .default_queue(queue.clone())
        .reactor(IoReactor::new().unwrap());

    let address = setup_server(context.clone()).unwrap();

    let conn = connect(&context, &address).unwrap();

    c.bench_function("echo send", |b| b.iter(|| echo_send(&conn).unwrap()));

    c.bench_function("echo async_write", |b| {
        b.iter(|| echo_async_write(&conn, &queue).unwrap())
    });
}

criterion_group!(benches, bench_echo);
criterion_main!(benches);
