use std::collections::VecDeque;
use std::env;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, trace, warn};
use regex::Regex;
use serde_derive::Deserialize;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::{BrowserError, BrowserErrorKind, BrowsingSurface};

/// Sign-in window dimensions.
const WINDOW_WIDTH: u32 = 450;
const WINDOW_HEIGHT: u32 = 600;

/// How long the browser gets to start up and announce its DevTools
/// endpoint. The login itself is human-paced and never times out.
const LAUNCH_TIMEOUT: Duration = Duration::from_secs(30);

/// Polling interval and cap while waiting for the sign-in page target to
/// show up after launch.
const TARGET_POLL_INTERVAL: Duration = Duration::from_millis(200);
const TARGET_POLL_ATTEMPTS: u32 = 50;

const ENV_BROWSER_BINARY: &str = "SSO2AWS_CHROME";

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Browsing surface backed by a locally installed Chrome or Chromium,
/// driven over the DevTools protocol. The browser runs against its own
/// user data directory, so the IdP session survives between runs and a
/// second sign-on usually needs no password at all.
pub struct ChromeBrowser {
    binary: Option<PathBuf>,
}

impl ChromeBrowser {
    pub fn new(binary: Option<PathBuf>) -> Self {
        ChromeBrowser { binary }
    }

    fn binary(&self) -> Result<PathBuf, BrowserError> {
        if let Some(ref binary) = self.binary {
            return Ok(binary.clone());
        }

        if let Ok(binary) = env::var(ENV_BROWSER_BINARY) {
            return Ok(binary.into());
        }

        find_browser_binary().ok_or_else(|| {
            BrowserError::new(
                BrowserErrorKind::Launch,
                &format!(
                    "no Chrome or Chromium binary found. Install one or point {} at it",
                    ENV_BROWSER_BINARY
                ),
            )
        })
    }

    fn user_data_dir(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(env::temp_dir)
            .join("sso2aws")
            .join("browser-profile")
    }

    async fn launch(&self, start_url: &str) -> Result<(Child, String), BrowserError> {
        let binary = self.binary()?;
        let user_data_dir = self.user_data_dir();

        debug!(
            "chrome.launch binary={} profile={}",
            binary.display(),
            user_data_dir.display()
        );

        let mut child = Command::new(&binary)
            .arg(format!("--app={}", start_url))
            .arg("--remote-debugging-port=0")
            .arg(format!("--user-data-dir={}", user_data_dir.display()))
            .arg(format!("--window-size={},{}", WINDOW_WIDTH, WINDOW_HEIGHT))
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                BrowserError::new(
                    BrowserErrorKind::Launch,
                    &format!("could not start {}: {}", binary.display(), e),
                )
            })?;

        let stderr = child.stderr.take().ok_or_else(|| {
            BrowserError::new(BrowserErrorKind::Launch, "browser stderr not captured")
        })?;

        let ws_url = tokio::time::timeout(LAUNCH_TIMEOUT, devtools_url(stderr))
            .await
            .map_err(|_| {
                BrowserError::new(
                    BrowserErrorKind::Launch,
                    "browser did not announce a DevTools endpoint in time",
                )
            })??;

        Ok((child, ws_url))
    }
}

impl BrowsingSurface for ChromeBrowser {
    async fn capture_request_body(
        &self,
        start_url: &str,
        target_url: &str,
    ) -> Result<Vec<u8>, BrowserError> {
        let (mut child, ws_url) = self.launch(start_url).await?;

        debug!("chrome.devtools {}", ws_url);

        let result = match CdpConnection::connect(&ws_url).await {
            Ok(mut cdp) => {
                let result = capture(&mut cdp, target_url).await;

                // best effort only: the browser may already be gone
                let _ = cdp.call("Browser.close", json!({}), None).await;

                result
            }
            Err(e) => Err(e),
        };

        // the window is single use, dispose of it no matter how we fared
        let _ = child.kill().await;

        result
    }
}

/// Reads the child's stderr until Chrome prints its
/// "DevTools listening on ws://..." line.
async fn devtools_url(stderr: tokio::process::ChildStderr) -> Result<String, BrowserError> {
    let re = Regex::new(r"DevTools listening on (ws://\S+)").unwrap();
    let mut lines = BufReader::new(stderr).lines();

    while let Some(line) = lines.next_line().await.map_err(|e| {
        BrowserError::new(BrowserErrorKind::Launch, &format!("browser stderr: {}", e))
    })? {
        trace!("chrome.stderr {}", line);

        if let Some(captures) = re.captures(&line) {
            return Ok(captures[1].into());
        }
    }

    Err(BrowserError::new(
        BrowserErrorKind::Launch,
        "browser exited before announcing a DevTools endpoint",
    ))
}

/// Attaches to the sign-in page and intercepts the SAML post.
async fn capture(cdp: &mut CdpConnection, target_url: &str) -> Result<Vec<u8>, BrowserError> {
    cdp.call("Target.setDiscoverTargets", json!({ "discover": true }), None)
        .await?;

    let target_id = wait_for_page_target(cdp).await?;

    let session_id = cdp
        .call(
            "Target.attachToTarget",
            json!({ "targetId": &target_id, "flatten": true }),
            None,
        )
        .await?
        .get("sessionId")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| protocol_error("attachToTarget returned no session"))?;

    // pause only requests for the SAML consumer endpoint; everything else
    // proceeds untouched
    cdp.call(
        "Fetch.enable",
        json!({
            "patterns": [{ "urlPattern": format!("{}*", target_url), "requestStage": "Request" }]
        }),
        Some(&session_id),
    )
    .await?;

    loop {
        let event = cdp.next_message().await?;

        match event.method.as_deref() {
            Some("Fetch.requestPaused")
                if event.session_id.as_deref() == Some(session_id.as_str()) =>
            {
                let request_id = event.params["requestId"]
                    .as_str()
                    .map(String::from)
                    .ok_or_else(|| protocol_error("requestPaused without requestId"))?;
                let url = event.params["request"]["url"].as_str().unwrap_or("");

                if !url.starts_with(target_url) {
                    trace!("chrome.continue {}", url);
                    cdp.call(
                        "Fetch.continueRequest",
                        json!({ "requestId": &request_id }),
                        Some(&session_id),
                    )
                    .await?;
                    continue;
                }

                debug!("chrome.intercepted {}", url);

                let body = event.params["request"]["postData"]
                    .as_str()
                    .map(|data| data.as_bytes().to_vec());

                // the real post must never reach AWS; the assertion is all
                // we came for
                let aborted = cdp
                    .call(
                        "Fetch.failRequest",
                        json!({ "requestId": &request_id, "errorReason": "Aborted" }),
                        Some(&session_id),
                    )
                    .await;
                if let Err(e) = aborted {
                    warn!("could not abort the intercepted request: {}", e);
                }

                return body.ok_or_else(|| {
                    BrowserError::new(
                        BrowserErrorKind::Decode,
                        "the intercepted request carried no body",
                    )
                });
            }
            Some("Target.targetDestroyed")
                if event.params["targetId"].as_str() == Some(target_id.as_str()) =>
            {
                return Err(BrowserError::new(
                    BrowserErrorKind::Cancelled,
                    "the sign-in window was closed before the login completed",
                ));
            }
            _ => {}
        }
    }
}

/// The page opened by `--app=<url>` takes a moment to register as a
/// debuggable target.
async fn wait_for_page_target(cdp: &mut CdpConnection) -> Result<String, BrowserError> {
    for _ in 0..TARGET_POLL_ATTEMPTS {
        let targets = cdp.call("Target.getTargets", json!({}), None).await?;

        if let Some(infos) = targets.get("targetInfos").and_then(Value::as_array) {
            let page = infos.iter().find(|info| {
                info.get("type").and_then(Value::as_str) == Some("page")
            });

            if let Some(page) = page {
                if let Some(target_id) = page.get("targetId").and_then(Value::as_str) {
                    return Ok(target_id.into());
                }
            }
        }

        tokio::time::sleep(TARGET_POLL_INTERVAL).await;
    }

    Err(protocol_error("no sign-in page target appeared"))
}

fn protocol_error(message: &str) -> BrowserError {
    BrowserError::new(BrowserErrorKind::Protocol, message)
}

#[derive(Debug, Deserialize)]
struct CdpMessage {
    id: Option<u64>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<CdpCallError>,
    #[serde(rename = "sessionId")]
    session_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CdpCallError {
    code: i64,
    message: String,
}

/// Minimal DevTools protocol client: sequential calls, with events that
/// arrive in between queued for the capture loop.
struct CdpConnection {
    sink: WsSink,
    source: WsSource,
    queued: VecDeque<CdpMessage>,
    next_id: u64,
}

impl CdpConnection {
    async fn connect(ws_url: &str) -> Result<Self, BrowserError> {
        let (stream, _) = connect_async(ws_url).await.map_err(|e| {
            protocol_error(&format!("could not connect to the DevTools endpoint: {}", e))
        })?;

        let (sink, source) = stream.split();

        Ok(CdpConnection {
            sink,
            source,
            queued: VecDeque::new(),
            next_id: 1,
        })
    }

    async fn call(
        &mut self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, BrowserError> {
        let id = self.next_id;
        self.next_id += 1;

        let mut message = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            message["sessionId"] = json!(session_id);
        }

        trace!("cdp.call {} id={}", method, id);

        self.sink
            .send(Message::Text(message.to_string()))
            .await
            .map_err(|e| protocol_error(&format!("could not send {}: {}", method, e)))?;

        loop {
            let message = self.read_message().await?;

            if message.id == Some(id) {
                if let Some(error) = message.error {
                    return Err(protocol_error(&format!(
                        "{} failed with code {}: {}",
                        method, error.code, error.message
                    )));
                }

                return Ok(message.result.unwrap_or(Value::Null));
            }

            // an event or an unrelated response; keep it for the caller
            self.queued.push_back(message);
        }
    }

    async fn next_message(&mut self) -> Result<CdpMessage, BrowserError> {
        if let Some(queued) = self.queued.pop_front() {
            return Ok(queued);
        }

        self.read_message().await
    }

    async fn read_message(&mut self) -> Result<CdpMessage, BrowserError> {
        loop {
            let frame = self.source.next().await.ok_or_else(|| {
                BrowserError::new(
                    BrowserErrorKind::Cancelled,
                    "the browser closed the DevTools connection",
                )
            })?;

            match frame {
                Ok(Message::Text(text)) => {
                    trace!("cdp.recv {}", text);

                    return serde_json::from_str(&text).map_err(|e| {
                        protocol_error(&format!("unreadable DevTools message: {}", e))
                    });
                }
                Ok(Message::Close(_)) => {
                    return Err(BrowserError::new(
                        BrowserErrorKind::Cancelled,
                        "the browser closed the DevTools connection",
                    ));
                }
                Ok(_) => continue,
                Err(e) => {
                    return Err(protocol_error(&format!("DevTools socket error: {}", e)));
                }
            }
        }
    }
}

fn find_browser_binary() -> Option<PathBuf> {
    let names: &[&str] = if cfg!(target_os = "windows") {
        &["chrome.exe", "msedge.exe"]
    } else {
        &[
            "google-chrome",
            "google-chrome-stable",
            "chromium",
            "chromium-browser",
        ]
    };

    if let Some(paths) = env::var_os("PATH") {
        for dir in env::split_paths(&paths) {
            for name in names {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    return Some(candidate);
                }
            }
        }
    }

    let fixed: &[&str] = if cfg!(target_os = "macos") {
        &[
            "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
            "/Applications/Chromium.app/Contents/MacOS/Chromium",
        ]
    } else if cfg!(target_os = "windows") {
        &[
            "C:\\Program Files\\Google\\Chrome\\Application\\chrome.exe",
            "C:\\Program Files (x86)\\Google\\Chrome\\Application\\chrome.exe",
        ]
    } else {
        &[]
    };

    fixed
        .iter()
        .map(PathBuf::from)
        .find(|candidate| candidate.is_file())
}
