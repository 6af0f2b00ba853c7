#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use clangaroo::protocol::framing::{read_frame, write_frame};
use serde_json::{json, Value};
use tokio::io::{split, BufReader, DuplexStream, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

type Responder = Box<dyn Fn(&str, &Value) -> Value + Send + Sync>;

/// In-process stand-in for clangd, speaking the framed protocol over a duplex pipe.
pub struct FakeEngine {
    /// Methods received, requests and notifications alike, in arrival order.
    pub received: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl FakeEngine {
    /// Start the engine; `respond(method, params)` produces each result.
    /// Returns the client-side pipe halves.
    pub fn start(
        respond: impl Fn(&str, &Value) -> Value + Send + Sync + 'static,
    ) -> (Self, ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (client_read, client_write) = split(client_io);
        let (server_read, server_write) = split(server_io);
        let received = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(
            BufReader::new(server_read),
            server_write,
            Box::new(respond),
            received.clone(),
        ));
        (Self { received, task }, client_read, client_write)
    }

    pub fn count(&self, method: &str) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.as_str() == method)
            .count()
    }
}

impl Drop for FakeEngine {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(
    mut reader: BufReader<ReadHalf<DuplexStream>>,
    mut writer: WriteHalf<DuplexStream>,
    respond: Responder,
    received: Arc<Mutex<Vec<String>>>,
) {
    while let Ok(Some(frame)) = read_frame(&mut reader).await {
        let Ok(message) = serde_json::from_slice::<Value>(&frame) else {
            continue;
        };
        let method = message["method"].as_str().unwrap_or_default().to_string();
        received.lock().unwrap().push(method.clone());
        let Some(id) = message.get("id") else {
            continue;
        };
        let result = match method.as_str() {
            "initialize" => json!({
                "capabilities": {
                    "hoverProvider": true,
                    "definitionProvider": true,
                    "referencesProvider": true,
                    "callHierarchyProvider": true
                },
                "offsetEncoding": "utf-8"
            }),
            "shutdown" => Value::Null,
            _ => respond(&method, &message["params"]),
        };
        let reply = json!({ "jsonrpc": "2.0", "id": id, "result": result });
        let body = serde_json::to_vec(&reply).unwrap();
        if write_frame(&mut writer, &body).await.is_err() {
            return;
        }
    }
}

/// A hover result as clangd renders it.
pub fn hover_markdown(signature: &str, doc: &str) -> Value {
    json!({
        "contents": {
            "kind": "markdown",
            "value": format!("### function `x`\n\n---\n```cpp\n{signature}\n```\n\n{doc}")
        }
    })
}
