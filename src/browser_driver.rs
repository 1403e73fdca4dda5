//! Browser driver adapter — the named interface behind which a real
//! headless browser lives. The driver's own internals (CDP protocol
//! details, DOM recording) are out of scope; this module only owns
//! enough surface for the browser pool and the execution worker to
//! launch, drive and tear down a session.
//!
//! Sessions are keyed by `browserId` and owned by the driver itself rather
//! than handed back to the caller: every operation after `launch` takes
//! just the id. This keeps the port's surface free of a concrete
//! `chromiumoxide` type, so a fake can implement the full trait without
//! a real browser underneath it.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::input::{
    DispatchKeyEventParams, DispatchKeyEventType, DispatchMouseEventParams,
    DispatchMouseEventType, MouseButton,
};
use chromiumoxide::cdp::browser_protocol::page::{
    EventScreencastFrame, ScreencastFrameAckParams, SetDeviceMetricsOverrideParams,
    StartScreencastParams, StartScreencastParamsFormat, StopScreencastParams,
};
use chromiumoxide::cdp::js_protocol::runtime::EventConsoleApiCalled;
use chromiumoxide::handler::viewport::Viewport;
use chromiumoxide::Page;
use futures::{Stream, StreamExt};
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;

const DEFAULT_VIEWPORT_WIDTH: u32 = 1280;
const DEFAULT_VIEWPORT_HEIGHT: u32 = 720;
const SCREENCAST_TARGET_FPS: u32 = 15;
const MAX_CONSOLE_LOGS: usize = 1000;

/// One input event the authoring UI forwards over a session namespace,
/// mirroring spec §4.6's event list verbatim so the WS layer can deserialize
/// straight into this type.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InputEvent {
    MouseDown { x: f64, y: f64, button: String },
    MouseMove { x: f64, y: f64 },
    Wheel { delta_x: f64, delta_y: f64 },
    KeyDown { key: String, code: String },
    KeyUp { key: String, code: String },
    SetViewportSize { width: u32, height: u32 },
    ChangeTab { tab_id: String },
    AddTab,
    CloseTab { tab_id: String },
    ExtractListData { schema: serde_json::Value },
    Settings { settings: serde_json::Value },
    Rerender,
}

/// One decoded screencast frame, ready to embed as base64 in a WS message.
#[derive(Debug, Clone)]
pub struct ScreencastFrame {
    pub png_bytes: Vec<u8>,
    pub session_id: u32,
}

pub type ScreencastStream = Pin<Box<dyn Stream<Item = ScreencastFrame> + Send>>;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("failed to launch browser: {0}")]
    LaunchFailed(String),
    #[error("browser operation failed: {0}")]
    OperationFailed(String),
    #[error("browser not available: {0}")]
    NotAvailable(String),
}

impl From<chromiumoxide::error::CdpError> for DriverError {
    fn from(e: chromiumoxide::error::CdpError) -> Self {
        DriverError::OperationFailed(e.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct ConsoleEntry {
    pub level: String,
    pub text: String,
    pub timestamp: Instant,
}

/// A live, driven browser session, held only by the driver implementation.
struct DriverSession {
    #[allow(dead_code)]
    browser: Browser,
    #[allow(dead_code)]
    handler_task: JoinHandle<()>,
    #[allow(dead_code)]
    console_task: Option<JoinHandle<()>>,
    page: Page,
    #[allow(dead_code)]
    console_logs: Arc<StdMutex<VecDeque<ConsoleEntry>>>,
    screencast_task: Option<JoinHandle<()>>,
    screencast_tx: watch::Sender<Option<ScreencastFrame>>,
}

impl DriverSession {
    async fn setup_console_listener(&mut self) -> Result<(), DriverError> {
        let mut console_events = self.page.event_listener::<EventConsoleApiCalled>().await?;
        let console_logs = self.console_logs.clone();

        let task = tokio::spawn(async move {
            while let Some(event) = console_events.next().await {
                let level = format!("{:?}", event.r#type).to_lowercase();
                let text = event
                    .args
                    .iter()
                    .map(|arg| {
                        if let Some(value) = &arg.value {
                            match value {
                                serde_json::Value::String(s) => s.clone(),
                                other => other.to_string(),
                            }
                        } else if let Some(desc) = &arg.description {
                            desc.clone()
                        } else if let Some(unser) = &arg.unserializable_value {
                            unser.inner().clone()
                        } else {
                            String::from("[unknown]")
                        }
                    })
                    .collect::<Vec<_>>()
                    .join(" ");

                if let Ok(mut logs) = console_logs.lock() {
                    if logs.len() >= MAX_CONSOLE_LOGS {
                        logs.pop_front();
                    }
                    logs.push_back(ConsoleEntry {
                        level,
                        text,
                        timestamp: Instant::now(),
                    });
                }
            }
        });

        self.console_task = Some(task);
        Ok(())
    }

    /// Starts the CDP screencast and forwards decoded frames into a
    /// `watch` channel: a `watch` sender only ever retains the latest
    /// value, which is exactly spec §4.6's "drop outbound frames once a
    /// queue exceeds one pending frame" rule without any extra bookkeeping.
    async fn setup_screencast(&mut self) -> Result<(), DriverError> {
        let mut frames = self.page.event_listener::<EventScreencastFrame>().await?;
        self.page
            .execute(
                StartScreencastParams::builder()
                    .format(StartScreencastParamsFormat::Png)
                    .max_width(DEFAULT_VIEWPORT_WIDTH as i64)
                    .max_height(DEFAULT_VIEWPORT_HEIGHT as i64)
                    .every_nth_frame((60 / SCREENCAST_TARGET_FPS).max(1) as i64)
                    .build(),
            )
            .await?;

        let page = self.page.clone();
        let tx = self.screencast_tx.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = frames.next().await {
                let session_id = event.session_id.0 as u32;
                if let Ok(png_bytes) = BASE64.decode(&event.data) {
                    let _ = tx.send(Some(ScreencastFrame { png_bytes, session_id }));
                }
                let _ = page
                    .execute(ScreencastFrameAckParams::new(event.session_id.clone()))
                    .await;
            }
        });
        self.screencast_task = Some(task);
        Ok(())
    }
}

/// Production port over a real headless browser, keyed by `browserId`.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, browser_id: &str) -> Result<(), DriverError>;
    async fn goto(&self, browser_id: &str, url: &str) -> Result<(), DriverError>;
    async fn screenshot(&self, browser_id: &str) -> Result<Vec<u8>, DriverError>;
    async fn close(&self, browser_id: &str) -> Result<(), DriverError>;

    /// Forwards one input event from the session namespace to the driven
    /// page. `ExtractListData`/`Settings`/`Rerender` are handled by the
    /// workflow interpreter rather than the CDP input domain; the driver
    /// only needs to accept them without erroring.
    async fn inject_input(&self, browser_id: &str, input: InputEvent) -> Result<(), DriverError>;

    /// A live stream of screencast frames for this session. Each call
    /// returns an independent subscription backed by the same underlying
    /// `watch` channel, so late subscribers only ever see the latest frame.
    async fn subscribe_screencast(&self, browser_id: &str) -> Result<ScreencastStream, DriverError>;
}

#[derive(Default)]
pub struct ChromiumoxideDriver {
    sessions: Mutex<HashMap<String, DriverSession>>,
}

#[async_trait]
impl BrowserDriver for ChromiumoxideDriver {
    async fn launch(&self, browser_id: &str) -> Result<(), DriverError> {
        let user_data_dir = format!("/tmp/robotium-chrome-{browser_id}");

        let config = BrowserConfig::builder()
            .new_headless_mode()
            .no_sandbox()
            .arg("--disable-gpu")
            .arg("--disable-software-rasterizer")
            .user_data_dir(&user_data_dir)
            .viewport(Viewport {
                width: DEFAULT_VIEWPORT_WIDTH,
                height: DEFAULT_VIEWPORT_HEIGHT,
                device_scale_factor: Some(1.0),
                emulating_mobile: false,
                is_landscape: true,
                has_touch: false,
            })
            .build()
            .map_err(DriverError::LaunchFailed)?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        let task_browser_id = browser_id.to_string();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    tracing::warn!(browser_id = %task_browser_id, "CDP handler error: {e}");
                }
            }
        });

        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| DriverError::LaunchFailed(e.to_string()))?;

        let (screencast_tx, _) = watch::channel(None);
        let mut session = DriverSession {
            browser,
            handler_task,
            console_task: None,
            page,
            console_logs: Arc::new(StdMutex::new(VecDeque::with_capacity(MAX_CONSOLE_LOGS))),
            screencast_task: None,
            screencast_tx,
        };
        if let Err(e) = session.setup_console_listener().await {
            tracing::warn!(browser_id = %browser_id, error = %e, "failed to set up console listener");
        }
        if let Err(e) = session.setup_screencast().await {
            tracing::warn!(browser_id = %browser_id, error = %e, "failed to start screencast");
        }

        self.sessions
            .lock()
            .await
            .insert(browser_id.to_string(), session);
        Ok(())
    }

    async fn goto(&self, browser_id: &str, url: &str) -> Result<(), DriverError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(browser_id)
            .ok_or_else(|| DriverError::NotAvailable(browser_id.to_string()))?;
        session.page.goto(url).await?;
        Ok(())
    }

    async fn screenshot(&self, browser_id: &str) -> Result<Vec<u8>, DriverError> {
        use chromiumoxide::page::ScreenshotParams;
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(browser_id)
            .ok_or_else(|| DriverError::NotAvailable(browser_id.to_string()))?;
        session
            .page
            .screenshot(ScreenshotParams::builder().build())
            .await
            .map_err(DriverError::from)
    }

    async fn close(&self, browser_id: &str) -> Result<(), DriverError> {
        if let Some(session) = self.sessions.lock().await.remove(browser_id) {
            if let Some(task) = &session.screencast_task {
                task.abort();
            }
            let _ = session.page.execute(StopScreencastParams::default()).await;
        }
        let user_data_dir = format!("/tmp/robotium-chrome-{browser_id}");
        if let Err(e) = tokio::fs::remove_dir_all(&user_data_dir).await {
            tracing::debug!(path = %user_data_dir, error = %e, "no browser data dir to clean up");
        }
        Ok(())
    }

    async fn inject_input(&self, browser_id: &str, input: InputEvent) -> Result<(), DriverError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(browser_id)
            .ok_or_else(|| DriverError::NotAvailable(browser_id.to_string()))?;

        match input {
            InputEvent::MouseDown { x, y, button } => {
                let button = match button.as_str() {
                    "right" => MouseButton::Right,
                    "middle" => MouseButton::Middle,
                    _ => MouseButton::Left,
                };
                session
                    .page
                    .execute(
                        DispatchMouseEventParams::builder()
                            .r#type(DispatchMouseEventType::MousePressed)
                            .x(x)
                            .y(y)
                            .button(button)
                            .click_count(1)
                            .build()
                            .map_err(DriverError::OperationFailed)?,
                    )
                    .await?;
            }
            InputEvent::MouseMove { x, y } => {
                session
                    .page
                    .execute(
                        DispatchMouseEventParams::builder()
                            .r#type(DispatchMouseEventType::MouseMoved)
                            .x(x)
                            .y(y)
                            .build()
                            .map_err(DriverError::OperationFailed)?,
                    )
                    .await?;
            }
            InputEvent::Wheel { delta_x, delta_y } => {
                session
                    .page
                    .execute(
                        DispatchMouseEventParams::builder()
                            .r#type(DispatchMouseEventType::MouseWheel)
                            .x(0.0)
                            .y(0.0)
                            .delta_x(delta_x)
                            .delta_y(delta_y)
                            .build()
                            .map_err(DriverError::OperationFailed)?,
                    )
                    .await?;
            }
            InputEvent::KeyDown { key, code } => {
                session
                    .page
                    .execute(
                        DispatchKeyEventParams::builder()
                            .r#type(DispatchKeyEventType::KeyDown)
                            .key(key)
                            .code(code)
                            .build()
                            .map_err(DriverError::OperationFailed)?,
                    )
                    .await?;
            }
            InputEvent::KeyUp { key, code } => {
                session
                    .page
                    .execute(
                        DispatchKeyEventParams::builder()
                            .r#type(DispatchKeyEventType::KeyUp)
                            .key(key)
                            .code(code)
                            .build()
                            .map_err(DriverError::OperationFailed)?,
                    )
                    .await?;
            }
            InputEvent::SetViewportSize { width, height } => {
                session
                    .page
                    .execute(
                        SetDeviceMetricsOverrideParams::builder()
                            .width(width as i64)
                            .height(height as i64)
                            .device_scale_factor(1.0)
                            .mobile(false)
                            .build()
                            .map_err(DriverError::OperationFailed)?,
                    )
                    .await?;
            }
            // Tab/data-extraction/settings/rerender events are handled by
            // the workflow interpreter and the WS namespace router, not by
            // the CDP input domain; the driver just needs to accept them.
            InputEvent::ChangeTab { .. }
            | InputEvent::AddTab
            | InputEvent::CloseTab { .. }
            | InputEvent::ExtractListData { .. }
            | InputEvent::Settings { .. }
            | InputEvent::Rerender => {}
        }
        Ok(())
    }

    async fn subscribe_screencast(&self, browser_id: &str) -> Result<ScreencastStream, DriverError> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(browser_id)
            .ok_or_else(|| DriverError::NotAvailable(browser_id.to_string()))?;
        let stream = WatchStream::new(session.screencast_tx.subscribe()).filter_map(|frame| async move { frame });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// A driver fake that never touches a real browser: `launch` just
    /// records the id, and `goto`/`screenshot` succeed against any id that
    /// has been launched and not yet closed.
    #[derive(Default)]
    pub struct FakeDriver {
        pub launched: Mutex<HashSet<String>>,
        pub closed: Mutex<Vec<String>>,
        pub fail_launch: Mutex<bool>,
        pub screenshot_bytes: Mutex<Vec<u8>>,
        pub injected_inputs: Mutex<Vec<(String, String)>>,
    }

    impl FakeDriver {
        pub fn set_fail_launch(&self, fail: bool) {
            *self.fail_launch.lock().unwrap() = fail;
        }
    }

    #[async_trait]
    impl BrowserDriver for FakeDriver {
        async fn launch(&self, browser_id: &str) -> Result<(), DriverError> {
            if *self.fail_launch.lock().unwrap() {
                return Err(DriverError::LaunchFailed("forced failure".into()));
            }
            self.launched.lock().unwrap().insert(browser_id.to_string());
            Ok(())
        }

        async fn goto(&self, browser_id: &str, _url: &str) -> Result<(), DriverError> {
            if !self.launched.lock().unwrap().contains(browser_id) {
                return Err(DriverError::NotAvailable(browser_id.to_string()));
            }
            Ok(())
        }

        async fn screenshot(&self, browser_id: &str) -> Result<Vec<u8>, DriverError> {
            if !self.launched.lock().unwrap().contains(browser_id) {
                return Err(DriverError::NotAvailable(browser_id.to_string()));
            }
            Ok(self.screenshot_bytes.lock().unwrap().clone())
        }

        async fn close(&self, browser_id: &str) -> Result<(), DriverError> {
            self.launched.lock().unwrap().remove(browser_id);
            self.closed.lock().unwrap().push(browser_id.to_string());
            Ok(())
        }

        async fn inject_input(&self, browser_id: &str, input: InputEvent) -> Result<(), DriverError> {
            if !self.launched.lock().unwrap().contains(browser_id) {
                return Err(DriverError::NotAvailable(browser_id.to_string()));
            }
            let label = match input {
                InputEvent::MouseDown { .. } => "mouse_down",
                InputEvent::MouseMove { .. } => "mouse_move",
                InputEvent::Wheel { .. } => "wheel",
                InputEvent::KeyDown { .. } => "key_down",
                InputEvent::KeyUp { .. } => "key_up",
                InputEvent::SetViewportSize { .. } => "set_viewport_size",
                InputEvent::ChangeTab { .. } => "change_tab",
                InputEvent::AddTab => "add_tab",
                InputEvent::CloseTab { .. } => "close_tab",
                InputEvent::ExtractListData { .. } => "extract_list_data",
                InputEvent::Settings { .. } => "settings",
                InputEvent::Rerender => "rerender",
            };
            self.injected_inputs
                .lock()
                .unwrap()
                .push((browser_id.to_string(), label.to_string()));
            Ok(())
        }

        async fn subscribe_screencast(&self, browser_id: &str) -> Result<ScreencastStream, DriverError> {
            if !self.launched.lock().unwrap().contains(browser_id) {
                return Err(DriverError::NotAvailable(browser_id.to_string()));
            }
            Ok(Box::pin(futures::stream::empty()))
        }
    }

    #[tokio::test]
    async fn fake_driver_rejects_operations_before_launch() {
        let driver = FakeDriver::default();
        assert!(driver.goto("browser-1", "https://example.com").await.is_err());
    }

    #[tokio::test]
    async fn fake_driver_allows_operations_after_launch() {
        let driver = FakeDriver::default();
        driver.launch("browser-1").await.unwrap();
        assert!(driver.goto("browser-1", "https://example.com").await.is_ok());
        driver.close("browser-1").await.unwrap();
        assert!(driver.goto("browser-1", "https://example.com").await.is_err());
    }

    #[tokio::test]
    async fn inject_input_is_rejected_before_launch() {
        let driver = FakeDriver::default();
        let result = driver
            .inject_input("browser-1", InputEvent::AddTab)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn inject_input_records_events_after_launch() {
        let driver = FakeDriver::default();
        driver.launch("browser-1").await.unwrap();
        driver
            .inject_input(
                "browser-1",
                InputEvent::MouseMove { x: 10.0, y: 20.0 },
            )
            .await
            .unwrap();

        let recorded = driver.injected_inputs.lock().unwrap().clone();
        assert_eq!(recorded, vec![("browser-1".to_string(), "mouse_move".to_string())]);
    }

    #[tokio::test]
    async fn subscribe_screencast_requires_a_launched_session() {
        let driver = FakeDriver::default();
        assert!(driver.subscribe_screencast("browser-1").await.is_err());
        driver.launch("browser-1").await.unwrap();
        assert!(driver.subscribe_screencast("browser-1").await.is_ok());
    }
}
