use babbler::{ChatServer, LocalConn, ServerConfig};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use std::sync::Arc;
use tokio::runtime::Runtime;

fn token_minting(c: &mut Criterion) {
  let mut group = c.benchmark_group("token_minting");
  let rt = Runtime::new().unwrap();

  let server = rt.block_on(async { ChatServer::new(ServerConfig::default()) });

  group.bench_function("request_single", |b| {
    b.to_async(&rt).iter(|| async {
      black_box(server.request_token("user123", "room456").await.unwrap());
    });
  });

  group.bench_function("request_batch_100", |b| {
    b.to_async(&rt).iter(|| async {
      for i in 0..100 {
        black_box(
          server
            .request_token(&format!("user{}", i), &format!("room{}", i))
            .await
            .unwrap(),
        );
      }
    });
  });

  rt.block_on(async { server.close().await.unwrap() });
  group.finish();
}

fn token_redemption(c: &mut Criterion) {
  let mut group = c.benchmark_group("token_redemption");
  let rt = Runtime::new().unwrap();

  group.bench_function("mint_and_connect", |b| {
    b.to_async(&rt).iter(|| async {
      let server = ChatServer::new(ServerConfig::default());
      server.create_room("room1").await.unwrap();

      let token = server.request_token("user123", "room1").await.unwrap();
      let (near, _far) = LocalConn::pair();
      black_box(server.connect(&token, Arc::new(near)).await.unwrap());

      server.close().await.unwrap();
    });
  });

  group.bench_function("redeem_consumed_token", |b| {
    b.to_async(&rt).iter(|| async {
      let server = ChatServer::new(ServerConfig::default());
      server.create_room("room1").await.unwrap();

      let token = server.request_token("user123", "room1").await.unwrap();
      let (near, _far) = LocalConn::pair();
      server.connect(&token, Arc::new(near)).await.unwrap();

      // The second redemption hits the tombstone path.
      let (near, _far) = LocalConn::pair();
      black_box(server.connect(&token, Arc::new(near)).await.unwrap_err());

      server.close().await.unwrap();
    });
  });

  group.finish();
}

criterion_group!(benches, token_minting, token_redemption);
criterion_main!(benches);
