// mock_chzzk: A mock CHZZK chat server for testing collector sessions.
//
// Protocol behavior:
// - Waits for the client connect envelope (cmd:100), answers cmd:10100,
//   then replays the scripted frames in order as text messages.
// - A client PONG (cmd:10000) is recorded but not answered.
// - Can be told to ping the client (cmd:0) before the script, to exercise
//   the ping/pong path.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A scripted mock CHZZK chat server.
pub struct MockChzzkServer {
    addr: SocketAddr,
    /// Every text frame received from clients, in arrival order.
    received: Arc<Mutex<Vec<String>>>,
    _task: tokio::task::JoinHandle<()>,
}

impl MockChzzkServer {
    /// Start the mock on a random port; `script` is replayed to each client
    /// after the connect handshake.  When `ping_first` is set the server
    /// sends a `cmd:0` ping before the script.
    pub async fn start(
        script: Vec<String>,
        ping_first: bool,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));

        let script = Arc::new(script);
        let received_for_task = received.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let script = script.clone();
                        let received = received_for_task.clone();
                        tokio::spawn(async move {
                            let _ =
                                Self::handle_connection(stream, &script, ping_first, received)
                                    .await;
                        });
                    }
                    Err(_) => break,
                }
            }
        });

        Ok(Self {
            addr,
            received,
            _task: task,
        })
    }

    /// The `ws://` URL a session should connect to.
    pub fn url(&self) -> String {
        format!("ws://{}/chat", self.addr)
    }

    /// Snapshot of every text frame received so far.
    pub async fn received_frames(&self) -> Vec<String> {
        self.received.lock().await.clone()
    }

    /// Count of client keepalive PONGs (cmd:10000) received so far.
    pub async fn pong_count(&self) -> usize {
        self.received
            .lock()
            .await
            .iter()
            .filter(|text| {
                serde_json::from_str::<Value>(text)
                    .ok()
                    .and_then(|v| v.get("cmd").and_then(Value::as_i64))
                    == Some(10000)
            })
            .count()
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        script: &[String],
        ping_first: bool,
        received: Arc<Mutex<Vec<String>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();
        let mut connected = false;

        while let Some(msg) = read.next().await {
            let text = match msg? {
                Message::Text(text) => text.to_string(),
                Message::Close(_) => break,
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                _ => continue,
            };
            received.lock().await.push(text.clone());

            let command = serde_json::from_str::<Value>(&text)
                .ok()
                .and_then(|v| v.get("cmd").and_then(Value::as_i64));
            if command == Some(100) && !connected {
                connected = true;
                write
                    .send(Message::Text(r#"{"ver":"3","cmd":10100,"bdy":{}}"#.into()))
                    .await?;
                if ping_first {
                    write
                        .send(Message::Text(r#"{"ver":"3","cmd":0}"#.into()))
                        .await?;
                }
                for scripted in script {
                    write.send(Message::Text(scripted.clone().into())).await?;
                }
            }
        }
        Ok(())
    }
}
