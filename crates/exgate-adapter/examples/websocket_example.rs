/*
[INPUT]:  Scripted frames from an in-memory endpoint
[OUTPUT]: Subscription confirmation and routed stream messages on stdout
[POS]:    Examples - exchange, client and channel registry together
[UPDATE]: When WebSocket API changes
*/

use std::sync::Arc;

use async_trait::async_trait;
use exgate_adapter::*;
use serde_json::json;

const URL: &str = "wss://stream.example.com/stream";

/// Routes combined-stream payloads by their "stream" field
struct Router {
    chans: Arc<ChanRegistry>,
}

#[async_trait]
impl WsHandler for Router {
    async fn on_message(&self, url: &str, msg: WsMsg) {
        if let Some(stream) = msg.get("stream").cloned() {
            self.chans.write_out(&chan_key(url, &stream), msg).await;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== exgate WebSocket Example ===\n");

    // Swap MemoryConnector out (leave `connector` unset) to dial for real.
    let connector = Arc::new(MemoryConnector::new());
    let chans = Arc::new(ChanRegistry::new());
    let exchange = WsExchange::with_chans(
        WsConfig::default().with_connector(connector.clone()),
        chans.clone(),
        Arc::new(Router {
            chans: chans.clone(),
        }),
    );

    let client = exchange.get_client(URL, "spot").await?;
    let key = chan_key(URL, "btcusdt@trade");
    let trades = chans.subscribe::<WsMsg, _, _, _>(&key, ["example"], OutChan::new, None)?;
    println!("✓ Subscribed {key}");

    let job = WsJob::new("1").with_method(|_url: &str, msg: &WsMsg, job: &WsJob| {
        println!("✓ Job {} confirmed: {msg:?}", job.id);
    });
    client
        .write(
            &json!({"method": "SUBSCRIBE", "params": ["btcusdt@trade"], "id": 1}),
            Some(job),
        )
        .await?;

    if let Some(peer) = connector.peer(URL) {
        peer.send_text(r#"{"result":null,"id":1}"#);
        peer.send_text(r#"[{"stream":"btcusdt@trade","p":"100.5"},{"stream":"btcusdt@trade","p":"101"}]"#);
    }

    for _ in 0..2 {
        if let Some(msg) = trades.recv().await {
            println!("  {key}: price {}", msg["p"]);
        }
    }

    chans.del_refs(&key, ["example"]);
    let closed = exchange.close_all().await;
    println!("\n✓ Closed {closed} client(s)");
    Ok(())
}
