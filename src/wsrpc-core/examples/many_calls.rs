use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;
use wsrpc_core::{ClientOptions, JsonRpcClient};

async fn start_server() -> anyhow::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    tokio::spawn(async move {
        while let Ok((tcp, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(ws) = accept_async(tcp).await else {
                    return;
                };
                println!("OPENED");
                let (mut sink, mut stream) = ws.split();
                while let Some(Ok(msg)) = stream.next().await {
                    let Message::Text(text) = msg else {
                        continue;
                    };
                    let Ok(request) = serde_json::from_str::<Value>(text.as_str()) else {
                        continue;
                    };
                    let reply = json!({
                        "jsonrpc": "2.0",
                        "id": request["id"],
                        "result": request["params"],
                    });
                    if sink.send(Message::text(reply.to_string())).await.is_err() {
                        break;
                    }
                }
            });
        }
    });

    Ok(addr)
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    // 1. start server
    let addr = start_server().await?;

    // 2. start client
    let target = Url::parse(&format!("ws://{addr}"))?;
    let options = ClientOptions::new().with_timeout(Duration::from_millis(10_000));
    let client = Arc::new(JsonRpcClient::new(target, options)?);
    client.open().await?;

    let n = 55000;
    let start_at = Instant::now();

    let futures = (0..n)
        .map(|i| {
            let client = client.clone();
            tokio::spawn(async move { client.call("ping", vec![json!(i)], None).await })
        })
        .collect::<Vec<_>>();

    let failed = join_all(futures)
        .await
        .into_iter()
        .filter(|r| !matches!(r, Ok(Ok(_))))
        .count();

    println!(
        "{} requests per second, {} failed",
        n as f64 / start_at.elapsed().as_secs_f64(),
        failed
    );

    client.close().await;
    Ok(())
}
