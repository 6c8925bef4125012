//! Cross-component scenarios over the loopback interface.

use anyhow::Result;
use parking_lot::Mutex;
use poseidon::fiber::{FiberFuture, FiberScheduler};
use poseidon::net::NetworkDriver;
use poseidon::socket::{
    AbstractSocket, ListenSocket, SocketAddress, StreamSession, StreamSocket, UdpSession,
    UdpSocket,
};
use poseidon::task::AtomicAsyncState;
use poseidon::time::{Timer, TimerCtl, TimerDriver};
use poseidon::utils::ByteQueue;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEADLINE: Duration = Duration::from_secs(10);

fn pump_until(driver: &NetworkDriver, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done() {
        assert!(Instant::now() < deadline, "test deadline exceeded");
        driver.thread_loop();
    }
}

struct EchoServer;

impl StreamSession for EchoServer {
    fn on_stream(&self, sock: &StreamSocket<Self>, data: &mut ByteQueue, _eof: bool) {
        let bytes = data.take_all();
        if !bytes.is_empty() {
            sock.send(&bytes);
            sock.shut_down();
        }
    }
}

struct EchoClient {
    received: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl EchoClient {
    fn new() -> Self {
        Self {
            received: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }
}

impl StreamSession for EchoClient {
    fn on_connected(&self, sock: &StreamSocket<Self>) {
        assert!(sock.send(b"hello"));
    }

    fn on_stream(&self, _sock: &StreamSocket<Self>, data: &mut ByteQueue, _eof: bool) {
        self.received.lock().extend_from_slice(&data.take_all());
    }

    fn on_closed(&self, _sock: &StreamSocket<Self>, _err: Option<i32>) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[test]
fn test_tcp_echo() -> Result<()> {
    let driver = Arc::new(NetworkDriver::new()?);

    // The accept table holds the strong references; the driver only
    // ever holds weak ones.
    let children: Arc<Mutex<Vec<Arc<dyn AbstractSocket>>>> = Arc::new(Mutex::new(Vec::new()));

    let addr: SocketAddress = "[::1]:0".parse().unwrap();
    let listener = ListenSocket::bind(&addr, {
        let children = children.clone();
        move |fd, _peer| {
            let sock = StreamSocket::from_accepted(fd, EchoServer);
            children.lock().push(sock.clone() as Arc<dyn AbstractSocket>);
            Some(sock as Arc<dyn AbstractSocket>)
        }
    })?;
    driver.insert(listener.clone())?;

    let server_addr = listener.local_address();
    let client = StreamSocket::connect(&server_addr, EchoClient::new())?;
    driver.insert(client.clone())?;

    pump_until(&driver, || client.session().closed.load(Ordering::SeqCst));

    assert_eq!(client.session().received.lock().as_slice(), b"hello");
    Ok(())
}

struct PacketCollector {
    packets: Mutex<Vec<(SocketAddress, Vec<u8>)>>,
}

impl UdpSession for PacketCollector {
    fn on_packet(&self, _sock: &UdpSocket<Self>, peer: SocketAddress, data: &[u8]) {
        self.packets.lock().push((peer, data.to_vec()));
    }
}

struct QuietPeer;

impl UdpSession for QuietPeer {
    fn on_packet(&self, _sock: &UdpSocket<Self>, _peer: SocketAddress, _data: &[u8]) {}
}

#[test]
fn test_udp_round_trip() -> Result<()> {
    let driver = Arc::new(NetworkDriver::new()?);
    let loopback: SocketAddress = "[::1]:0".parse().unwrap();

    let server = UdpSocket::bind(
        &loopback,
        PacketCollector {
            packets: Mutex::new(Vec::new()),
        },
    )?;
    driver.insert(server.clone())?;

    let client = UdpSocket::bind(&loopback, QuietPeer)?;
    driver.insert(client.clone())?;

    let target = server.local_address();
    for n in 1..=3u32 {
        assert!(client.send_to(&target, format!("packet {}", n).as_bytes()));
    }

    pump_until(&driver, || server.session().packets.lock().len() >= 3);

    let packets = server.session().packets.lock();
    let client_port = client.local_address().port();
    for (n, (peer, payload)) in packets.iter().enumerate() {
        assert_eq!(payload, format!("packet {}", n + 1).as_bytes());
        assert_eq!(peer.port(), client_port);
    }
    Ok(())
}

struct WakeTimer {
    ctl: TimerCtl,
    futr: Arc<FiberFuture>,
}

impl Timer for WakeTimer {
    fn ctl(&self) -> &TimerCtl {
        &self.ctl
    }

    fn on_tick(&self, _now_ms: i64) {
        self.futr.mark_ready();
    }
}

struct ParkingFiber {
    state: AtomicAsyncState,
    sched: Arc<FiberScheduler>,
    futr: Arc<FiberFuture>,
    observed_ready: AtomicBool,
}

impl poseidon::fiber::Fiber for ParkingFiber {
    fn state(&self) -> &AtomicAsyncState {
        &self.state
    }

    fn execute(&self) {
        self.sched.check_and_yield(Some(&self.futr), None).unwrap();
        self.observed_ready
            .store(self.futr.is_ready(), Ordering::SeqCst);
    }
}

#[test]
fn test_timer_satisfies_fiber_future() -> Result<()> {
    let sched = Arc::new(FiberScheduler::new());
    let timers = Arc::new(TimerDriver::new());
    let futr = Arc::new(FiberFuture::new());

    {
        let timers = timers.clone();
        std::thread::spawn(move || loop {
            timers.thread_loop();
        });
    }

    let timer = Arc::new(WakeTimer {
        ctl: TimerCtl::new(),
        futr: futr.clone(),
    });
    timers.insert(
        &(timer.clone() as Arc<dyn Timer>),
        Duration::from_millis(30),
        Duration::ZERO,
    )?;

    let fiber = Arc::new(ParkingFiber {
        state: AtomicAsyncState::new(),
        sched: sched.clone(),
        futr,
        observed_ready: AtomicBool::new(false),
    });
    sched.launch(fiber.clone())?;

    let deadline = Instant::now() + DEADLINE;
    while sched.size() > 0 {
        assert!(Instant::now() < deadline, "scheduler failed to drain");
        sched.thread_loop();
    }

    assert!(fiber.observed_ready.load(Ordering::SeqCst));
    Ok(())
}
