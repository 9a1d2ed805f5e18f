use std::{
  fs::{self, File},
  io::Write,
  net::{Shutdown, SocketAddr},
  sync::{
    Arc, Mutex,
    atomic::{AtomicBool, Ordering},
  },
  thread,
  time::{Duration, Instant},
};

use murmur::{
  AsyncSocket, Completion, CompletionHandler, CompletionPort, DisconnectFlags,
  Event, Overlapped, PortConfig, TcpSocket, TransmitFile, TransmitPacket,
};

#[derive(Default)]
struct Recorder {
  results: Mutex<Vec<Result<usize, i32>>>,
}

impl Recorder {
  fn count(&self) -> usize {
    self.results.lock().unwrap().len()
  }

  fn last(&self) -> Option<Result<usize, i32>> {
    self.results.lock().unwrap().last().copied()
  }
}

impl CompletionHandler for Recorder {
  fn completed(&self, completion: Completion, _: &Arc<Overlapped>) {
    let result = completion
      .into_result()
      .map_err(|err| err.raw_os_error().unwrap_or(-1));
    self.results.lock().unwrap().push(result);
  }
}

fn armed() -> (Arc<Recorder>, Arc<Overlapped>) {
  let recorder = Arc::new(Recorder::default());
  let op = Overlapped::with_handler(&recorder, None);
  (recorder, op)
}

fn drive_until(port: &CompletionPort, mut done: impl FnMut() -> bool) {
  let deadline = Instant::now() + Duration::from_secs(5);
  while !done() {
    assert!(Instant::now() < deadline, "timed out waiting for completions");
    port.drain_one(Some(Duration::from_millis(10)));
  }
}

fn connected_pair(port: &CompletionPort) -> (TcpSocket, TcpSocket) {
  let listener =
    TcpSocket::bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
  port.attach(&listener);
  let addr = listener.local_addr().unwrap();

  let (accepted, accept_op) = armed();
  listener.accept(&accept_op).unwrap();

  let client = TcpSocket::new(&addr).unwrap();
  port.attach(&client);
  let (connected, connect_op) = armed();
  client.connect(addr, None, &connect_op).unwrap();

  drive_until(port, || accepted.count() == 1 && connected.count() == 1);
  assert_eq!(accepted.last(), Some(Ok(0)));
  assert_eq!(connected.last(), Some(Ok(0)));
  client.connection_established().unwrap();

  let server = TcpSocket::from_accepted(accept_op.take_accepted().unwrap());
  port.attach(&server);
  server.connection_established().unwrap();
  assert_eq!(server.peer_addr().unwrap(), client.local_addr().unwrap());

  (server, client)
}

fn recv_exact(port: &CompletionPort, socket: &TcpSocket, len: usize) -> Vec<u8> {
  let (recorder, op) = armed();
  let mut data = Vec::new();

  while data.len() < len {
    op.reset();
    socket.recv(vec![vec![0; 4096]], &op).unwrap();
    let before = recorder.count();
    drive_until(port, || recorder.count() > before);

    let n = recorder.last().unwrap().unwrap();
    assert!(n > 0, "peer closed after {} bytes", data.len());
    let buf = op.take_buffers().remove(0);
    data.extend_from_slice(&buf[..n]);
  }
  data
}

#[test]
fn test_connect_with_first_send() {
  let port = CompletionPort::new();
  let listener =
    TcpSocket::bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
  port.attach(&listener);
  let addr = listener.local_addr().unwrap();

  let (accepted, accept_op) = armed();
  listener.accept(&accept_op).unwrap();

  let client = TcpSocket::new(&addr).unwrap();
  port.attach(&client);
  let (connected, connect_op) = armed();
  client.connect(addr, Some(b"hello".to_vec()), &connect_op).unwrap();

  drive_until(&port, || accepted.count() == 1 && connected.count() == 1);
  assert_eq!(connected.last(), Some(Ok(5)));
  assert_eq!(connect_op.take_buffers(), vec![b"hello".to_vec()]);

  let server = TcpSocket::from_accepted(accept_op.take_accepted().unwrap());
  port.attach(&server);
  assert_eq!(recv_exact(&port, &server, 5), b"hello");
}

#[test]
fn test_scatter_send() {
  let port = CompletionPort::new();
  let (server, client) = connected_pair(&port);

  let (sent, op) = armed();
  client
    .send(vec![b"ab".to_vec(), Vec::new(), b"cde".to_vec()], &op)
    .unwrap();

  assert_eq!(recv_exact(&port, &server, 5), b"abcde");
  drive_until(&port, || sent.count() == 1);
  assert_eq!(sent.last(), Some(Ok(5)));
}

#[test]
fn test_connect_refused() {
  let addr: SocketAddr = {
    let probe =
      TcpSocket::bind_listener("127.0.0.1:0".parse().unwrap(), 1).unwrap();
    probe.local_addr().unwrap()
  };

  let port = CompletionPort::new();
  let client = TcpSocket::new(&addr).unwrap();
  port.attach(&client);
  let (connected, op) = armed();

  // Loopback may refuse synchronously or through the completion.
  match client.connect(addr, None, &op) {
    Ok(()) => {
      drive_until(&port, || connected.count() == 1);
      assert_eq!(connected.last(), Some(Err(libc::ECONNREFUSED)));
    }
    Err(err) => {
      assert_eq!(err.raw_os_error(), Some(libc::ECONNREFUSED));
      assert!(!op.is_in_flight());
    }
  }
}

struct ReissueRecv {
  socket: Arc<TcpSocket>,
  recv_op: Arc<Overlapped>,
}

impl CompletionHandler for ReissueRecv {
  fn completed(&self, _: Completion, _: &Arc<Overlapped>) {
    self.socket.recv(vec![vec![0; 64]], &self.recv_op).unwrap();
  }
}

#[test]
fn test_flush_skips_requests_issued_by_handlers() {
  let port = CompletionPort::new();
  let (server, _client) = connected_pair(&port);
  let server = Arc::new(server);

  let (received, recv_op) = armed();
  let reissue =
    Arc::new(ReissueRecv { socket: Arc::clone(&server), recv_op: recv_op.clone() });
  let trigger = Overlapped::with_handler(&reissue, None);

  port.post(&trigger, Completion::success(0));
  assert_eq!(port.flush(), 1);
  assert!(recv_op.is_in_flight());
  assert_eq!(received.count(), 0);

  // Closing the socket cancels the receive and still delivers it.
  drop(reissue);
  let server = Arc::try_unwrap(server).unwrap();
  server.close();
  assert_eq!(port.flush(), 1);
  assert_eq!(received.last(), Some(Err(libc::ECANCELED)));
  assert!(!recv_op.is_in_flight());
}

#[test]
fn test_disconnect_reaches_peer() {
  let port = CompletionPort::new();
  let (server, client) = connected_pair(&port);

  let (disconnected, op) = armed();
  client.disconnect(DisconnectFlags::new(Shutdown::Write), &op).unwrap();

  let (received, recv_op) = armed();
  server.recv(vec![vec![0; 16]], &recv_op).unwrap();

  drive_until(&port, || disconnected.count() == 1 && received.count() == 1);
  assert_eq!(disconnected.last(), Some(Ok(0)));
  // End of stream.
  assert_eq!(received.last(), Some(Ok(0)));
}

#[test]
fn test_cancel_writes_unblocks_disconnect() {
  let port = CompletionPort::new();
  let (server, client) = connected_pair(&port);

  // The server never reads, so this send cannot finish.
  let (sent, send_op) = armed();
  client.send(vec![vec![b'x'; 32 << 20]], &send_op).unwrap();
  for _ in 0..10 {
    port.drain_one(Some(Duration::from_millis(10)));
  }
  assert_eq!(sent.count(), 0);

  let (received, recv_op) = armed();
  client.recv(vec![vec![0; 16]], &recv_op).unwrap();

  assert_eq!(client.cancel_writes(), 1);
  drive_until(&port, || sent.count() == 1);
  assert_eq!(sent.last(), Some(Err(libc::ECANCELED)));
  assert!(recv_op.is_in_flight());

  let (disconnected, op) = armed();
  client.disconnect(DisconnectFlags::default(), &op).unwrap();
  drive_until(&port, || disconnected.count() == 1 && received.count() == 1);
  assert_eq!(disconnected.last(), Some(Ok(0)));
  // The local shutdown ends the pending receive.
  assert_eq!(received.last(), Some(Ok(0)));
  assert_eq!(client.cancel_writes(), 0);
  drop(server);
}

#[test]
fn test_disconnect_for_reuse_allows_reconnect() {
  let port = CompletionPort::new();
  let (_server, client) = connected_pair(&port);
  let first_peer = client.peer_addr().unwrap();

  let (disconnected, op) = armed();
  client
    .disconnect(DisconnectFlags::new(Shutdown::Both).reuse(true), &op)
    .unwrap();
  drive_until(&port, || disconnected.count() == 1);
  assert_eq!(disconnected.last(), Some(Ok(0)));

  // The same descriptor connects to a different listener.
  let listener =
    TcpSocket::bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
  port.attach(&listener);
  let addr = listener.local_addr().unwrap();
  let (accepted, accept_op) = armed();
  listener.accept(&accept_op).unwrap();

  let (connected, connect_op) = armed();
  client.connect(addr, Some(b"again".to_vec()), &connect_op).unwrap();
  drive_until(&port, || accepted.count() == 1 && connected.count() == 1);
  assert_eq!(connected.last(), Some(Ok(5)));

  client.connection_established().unwrap();
  assert_eq!(client.peer_addr().unwrap(), addr);
  assert_ne!(client.peer_addr().unwrap(), first_peer);

  let server = TcpSocket::from_accepted(accept_op.take_accepted().unwrap());
  port.attach(&server);
  assert_eq!(recv_exact(&port, &server, 5), b"again");
}

#[test]
fn test_concurrent_drains_complete_each_send_once() {
  const SENDS: usize = 200;
  const DRAINERS: usize = 4;

  let port = CompletionPort::new();
  let (server, client) = connected_pair(&port);

  let sent = Arc::new(Recorder::default());
  let ops: Vec<_> =
    (0..SENDS).map(|_| Overlapped::with_handler(&sent, None)).collect();

  let drainers: Vec<_> = (0..DRAINERS)
    .map(|_| {
      let port = port.clone();
      let sent = Arc::clone(&sent);
      thread::spawn(move || {
        let deadline = Instant::now() + Duration::from_secs(5);
        while sent.count() < SENDS && Instant::now() < deadline {
          port.drain_one(Some(Duration::from_millis(5)));
        }
      })
    })
    .collect();

  for (i, op) in ops.iter().enumerate() {
    client.send(vec![format!("{i:08}").into_bytes()], op).unwrap();
  }
  for drainer in drainers {
    drainer.join().unwrap();
  }

  assert_eq!(sent.count(), SENDS);
  assert!(sent.results.lock().unwrap().iter().all(|r| *r == Ok(8)));
  assert_eq!(port.flush(), 0);

  // Sends on one handle complete in issue order.
  let expected: Vec<u8> =
    (0..SENDS).flat_map(|i| format!("{i:08}").into_bytes()).collect();
  assert_eq!(recv_exact(&port, &server, expected.len()), expected);
}

#[test]
fn test_transmit_file_with_head_and_tail() {
  let port = CompletionPort::new();
  let (server, client) = connected_pair(&port);

  let content: Vec<u8> = (0..100_000).map(|_| fastrand::u8(..)).collect();
  let path = std::env::temp_dir().join(format!(
    "murmur-transmit-{}-{}",
    std::process::id(),
    fastrand::u64(..)
  ));
  File::create(&path).unwrap().write_all(&content).unwrap();
  let file = Arc::new(File::open(&path).unwrap());

  let (sent, op) = armed();
  op.set_offset(10);
  let transmit = TransmitFile {
    bytes_to_write: Some(50_000),
    bytes_per_send: 8192,
    head: Some(b"HEAD".to_vec()),
    tail: Some(b"TAIL".to_vec()),
    ..TransmitFile::new(file)
  };
  client.transmit_file(transmit, &op).unwrap();

  let mut expected = b"HEAD".to_vec();
  expected.extend_from_slice(&content[10..50_010]);
  expected.extend_from_slice(b"TAIL");

  assert_eq!(recv_exact(&port, &server, expected.len()), expected);
  drive_until(&port, || sent.count() == 1);
  assert_eq!(sent.last(), Some(Ok(expected.len())));
  assert_eq!(op.take_buffers(), vec![b"HEAD".to_vec(), b"TAIL".to_vec()]);

  fs::remove_file(&path).unwrap();
}

#[test]
fn test_transmit_packets_in_order() {
  let port = CompletionPort::new();
  let (server, client) = connected_pair(&port);

  let path = std::env::temp_dir().join(format!(
    "murmur-packets-{}-{}",
    std::process::id(),
    fastrand::u64(..)
  ));
  fs::write(&path, b"0123456789").unwrap();
  let file = Arc::new(File::open(&path).unwrap());

  let (sent, op) = armed();
  let packets = vec![
    TransmitPacket::Memory(b"<".to_vec()),
    TransmitPacket::File { file: file.clone(), offset: 2, len: Some(3) },
    TransmitPacket::Memory(b"|".to_vec()),
    TransmitPacket::File { file, offset: 7, len: None },
    TransmitPacket::Memory(b">".to_vec()),
  ];
  client.transmit_packets(packets, 0, &op).unwrap();

  assert_eq!(recv_exact(&port, &server, 9), b"<234|789>");
  drive_until(&port, || sent.count() == 1);
  assert_eq!(sent.last(), Some(Ok(9)));

  fs::remove_file(&path).unwrap();
}

#[test]
fn test_wait_on_operation_event() {
  let port = CompletionPort::new();
  let (server, client) = connected_pair(&port);

  let recorder = Arc::new(Recorder::default());
  let op = Overlapped::with_handler(&recorder, Some(Arc::new(Event::new())));
  server.recv(vec![vec![0; 16]], &op).unwrap();

  let stop = Arc::new(AtomicBool::new(false));
  let driver = {
    let port = port.clone();
    let stop = Arc::clone(&stop);
    thread::spawn(move || {
      while !stop.load(Ordering::Acquire) {
        port.drain_one(Some(Duration::from_millis(10)));
      }
    })
  };

  assert!(op.wait(Some(Duration::from_millis(20))).unwrap().is_none());

  let (_sent, send_op) = armed();
  client.send(vec![b"ping".to_vec()], &send_op).unwrap();

  let result = op.wait(Some(Duration::from_secs(5))).unwrap();
  assert_eq!(result.unwrap().unwrap(), 4);

  stop.store(true, Ordering::Release);
  driver.join().unwrap();
  assert_eq!(&op.take_buffers()[0][..4], b"ping");
}

#[test]
fn test_throughput_report() {
  let port =
    CompletionPort::with_config(PortConfig::new().throughput_threshold(Some(5)));
  let (recorder, op) = armed();

  for _ in 0..6 {
    op.reset();
    port.post(&op, Completion::success(1));
    assert_eq!(port.flush(), 1);
  }

  assert_eq!(recorder.count(), 6);
  assert!(port.last_throughput().is_some_and(|rate| rate > 0.0));
}

#[test]
fn test_throughput_disabled() {
  let port =
    CompletionPort::with_config(PortConfig::new().throughput_threshold(None));
  let (recorder, op) = armed();

  for _ in 0..20 {
    op.reset();
    port.post(&op, Completion::success(0));
    port.flush();
  }

  assert_eq!(recorder.count(), 20);
  assert!(port.last_throughput().is_none());
}

#[test]
#[should_panic(expected = "already attached")]
fn test_attach_twice_panics() {
  let first = CompletionPort::new();
  let second = CompletionPort::new();
  let socket = TcpSocket::new_v4().unwrap();
  first.attach(&socket);
  second.attach(&socket);
}
