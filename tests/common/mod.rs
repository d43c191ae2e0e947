#![allow(dead_code)]

use bravia_quad::{BraviaClient, ClientConfig};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

/// What the mock device does with one request
pub enum Action {
    Reply(Value),
    Delayed(Duration, Value),
    Ignore,
}

type Script = Arc<dyn Fn(&Value) -> Action + Send + Sync>;

#[derive(Clone, Debug)]
enum Control {
    Push(String),
    Drop,
}

/// Scripted stand-in for the soundbar on a loopback port
pub struct MockDevice {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<Value>>>,
    connections: Arc<AtomicUsize>,
    control: broadcast::Sender<Control>,
    accept: JoinHandle<()>,
}

impl MockDevice {
    pub async fn start<F>(script: F) -> Self
    where
        F: Fn(&Value) -> Action + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let script: Script = Arc::new(script);
        let requests = Arc::new(Mutex::new(Vec::new()));
        let connections = Arc::new(AtomicUsize::new(0));
        let (control, _) = broadcast::channel(16);

        let accept = {
            let requests = requests.clone();
            let connections = connections.clone();
            let control = control.clone();
            tokio::spawn(async move {
                while let Ok((socket, _)) = listener.accept().await {
                    let control_rx = control.subscribe();
                    connections.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(socket, script.clone(), requests.clone(), control_rx));
                }
            })
        };

        Self {
            addr,
            requests,
            connections,
            control,
            accept,
        }
    }

    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Every request received so far, across connections
    pub fn requests(&self) -> Vec<Value> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, feature: &str) -> Vec<Value> {
        self.requests()
            .into_iter()
            .filter(|r| r["feature"] == feature)
            .collect()
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Write a raw line to every open connection
    pub fn push_line(&self, line: &str) {
        let _ = self.control.send(Control::Push(format!("{}\n", line)));
    }

    pub fn notify(&self, feature: &str, value: Value) {
        let frame = json!({"feature": feature, "type": "notify", "value": value});
        self.push_line(&frame.to_string());
    }

    /// Close every open connection from the device side
    pub fn drop_connections(&self) {
        let _ = self.control.send(Control::Drop);
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.accept.abort();
        let _ = self.control.send(Control::Drop);
    }
}

async fn serve(
    socket: TcpStream,
    script: Script,
    requests: Arc<Mutex<Vec<Value>>>,
    mut control: broadcast::Receiver<Control>,
) {
    let (read, mut write) = socket.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = out_rx.recv().await {
            if write.write_all(line.as_bytes()).await.is_err() {
                break;
            }
        }
    });

    let mut lines = BufReader::new(read).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                requests.lock().unwrap().push(request.clone());

                let reply = |value: Value| {
                    let mut frame = json!({"id": request["id"], "type": "result", "value": value});
                    frame["feature"] = request["feature"].clone();
                    format!("{}\n", frame)
                };
                match script(&request) {
                    Action::Reply(value) => {
                        let _ = out_tx.send(reply(value));
                    }
                    Action::Delayed(delay, value) => {
                        let out_tx = out_tx.clone();
                        let line = reply(value);
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let _ = out_tx.send(line);
                        });
                    }
                    Action::Ignore => {}
                }
            }
            ctl = control.recv() => match ctl {
                Ok(Control::Push(line)) => {
                    let _ = out_tx.send(line);
                }
                Ok(Control::Drop) | Err(broadcast::error::RecvError::Closed) => break,
                Err(broadcast::error::RecvError::Lagged(_)) => {}
            },
        }
    }

    writer.abort();
}

/// Stateful soundbar model: gets return the stored value, sets store and ACK
///
/// Without a subwoofer, bass levels outside 0..=2 are answered with `"ERR"`.
#[derive(Clone)]
pub struct Soundbar {
    values: Arc<Mutex<HashMap<String, Value>>>,
    subwoofer: bool,
}

impl Soundbar {
    pub fn new(subwoofer: bool, bass: i64) -> Self {
        let values = HashMap::from([
            ("main.power".to_string(), json!("off")),
            ("main.volumestep".to_string(), json!(20)),
            ("main.rearvolumestep".to_string(), json!(0)),
            ("main.bassstep".to_string(), json!(bass)),
            ("main.input".to_string(), json!("tv")),
            ("audio.voiceenhancer".to_string(), json!("upoff")),
            ("audio.drangecomp".to_string(), json!("auto")),
            ("audio.aav".to_string(), json!("off")),
        ]);
        Self {
            values: Arc::new(Mutex::new(values)),
            subwoofer,
        }
    }

    pub fn value(&self, feature: &str) -> Option<Value> {
        self.values.lock().unwrap().get(feature).cloned()
    }

    /// Answer one request against the model
    pub fn answer(&self, request: &Value) -> Value {
        let feature = request["feature"].as_str().unwrap_or_default().to_string();
        let mut values = self.values.lock().unwrap();
        match request["type"].as_str() {
            Some("set") => {
                let value = request["value"].clone();
                if feature == "main.bassstep" && !self.subwoofer {
                    let level = value.as_i64().unwrap_or(i64::MIN);
                    if !(0..=2).contains(&level) {
                        return json!("ERR");
                    }
                }
                values.insert(feature, value);
                json!("ACK")
            }
            _ => values.get(&feature).cloned().unwrap_or(json!("off")),
        }
    }

    pub fn script(&self) -> impl Fn(&Value) -> Action + Send + Sync + 'static {
        let bar = self.clone();
        move |request| Action::Reply(bar.answer(request))
    }
}

/// Config with short timeouts, fast reconnects and no polling
pub fn test_config() -> ClientConfig {
    ClientConfig::default()
        .with_request_timeout(Duration::from_millis(500))
        .with_connect_timeout(Duration::from_secs(1))
        .with_reconnect_backoff(Duration::from_millis(20), Duration::from_millis(100))
        .with_poll_targets(Vec::new())
}

/// Connect a client and wait until the device has accepted it
pub async fn connected(device: &MockDevice, config: ClientConfig) -> BraviaClient {
    let client = BraviaClient::new(config);
    client.connect(&device.address()).await.unwrap();
    wait_until(|| device.connections() >= 1).await;
    client
}

/// Poll `condition` until it holds, panicking after two seconds
pub async fn wait_until(condition: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached in time"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
