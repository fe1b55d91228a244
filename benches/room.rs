use babbler::{ChatServer, Connection, LocalConn, ServerConfig};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

fn bench_server() -> ChatServer {
  // A generous idle timeout keeps the sweep out of the measurements.
  ChatServer::new(ServerConfig::default().with_room_idle_timeout(Duration::from_secs(60)))
}

/// Receive `n` visible (non-heartbeat) messages.
async fn recv_n(conn: &LocalConn, n: usize) {
  for _ in 0..n {
    loop {
      let msg = conn.recv().await.expect("recv failed");
      if !msg.is_empty() {
        break;
      }
    }
  }
}

fn room_creation(c: &mut Criterion) {
  let mut group = c.benchmark_group("room_creation");
  let rt = Runtime::new().unwrap();

  group.bench_function("create_single_room", |b| {
    b.to_async(&rt).iter(|| async {
      let server = bench_server();
      black_box(server.create_room("room1").await.unwrap());
      server.close().await.unwrap();
    });
  });

  group.bench_function("create_100_rooms", |b| {
    b.to_async(&rt).iter(|| async {
      let server = bench_server();
      for i in 0..100 {
        black_box(server.create_room(&format!("room{}", i)).await.unwrap());
      }
      server.close().await.unwrap();
    });
  });

  group.finish();
}

fn room_admission(c: &mut Criterion) {
  let mut group = c.benchmark_group("room_admission");
  let rt = Runtime::new().unwrap();

  for members in [2, 10, 50] {
    group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, &members| {
      b.to_async(&rt).iter(|| async {
        let server = bench_server();
        server.create_room("room1").await.unwrap();
        let room = server.get_room("room1").await.unwrap();

        let mut clients = Vec::new();
        for i in 0..members {
          let (near, far) = LocalConn::pair();
          room.admit(&format!("user{}", i), Arc::new(near)).await.unwrap();
          clients.push(far);
        }

        let mut users = Vec::new();
        room.list_users(&mut users).await;
        black_box(users);

        server.close().await.unwrap();
      });
    });
  }

  group.finish();
}

fn broadcast_fanout(c: &mut Criterion) {
  let mut group = c.benchmark_group("room_broadcast_fanout");
  let rt = Runtime::new().unwrap();

  for members in [2, 10, 50] {
    group.bench_with_input(BenchmarkId::from_parameter(members), &members, |b, &members| {
      b.to_async(&rt).iter(|| async {
        let server = bench_server();
        server.create_room("room1").await.unwrap();
        let room = server.get_room("room1").await.unwrap();

        let mut clients = Vec::new();
        for i in 0..members {
          let (near, far) = LocalConn::pair();
          room.admit(&format!("user{}", i), Arc::new(near)).await.unwrap();
          clients.push(far);
        }

        // The first member sees every join announcement.
        let probe = &clients[0];
        recv_n(probe, members).await;

        // Push one full backlog through and wait until the probe saw
        // all of it, so the whole fan-out is inside the measurement.
        for i in 0..8 {
          room.broadcast(&format!("message {}", i), "user0").await;
        }
        recv_n(probe, 8).await;

        server.close().await.unwrap();
      });
    });
  }

  group.finish();
}

fn room_lookup(c: &mut Criterion) {
  let mut group = c.benchmark_group("room_lookup");
  let rt = Runtime::new().unwrap();

  for num_rooms in [10, 100, 1000] {
    group.bench_with_input(
      BenchmarkId::from_parameter(num_rooms),
      &num_rooms,
      |b, &num_rooms| {
        b.to_async(&rt).iter(|| async {
          let server = bench_server();
          for i in 0..num_rooms {
            server.create_room(&format!("room{}", i)).await.unwrap();
          }

          black_box(server.get_room("room5").await.unwrap());

          server.close().await.unwrap();
        });
      },
    );
  }

  group.finish();
}

criterion_group!(benches, room_creation, room_admission, broadcast_fanout, room_lookup);
criterion_main!(benches);
