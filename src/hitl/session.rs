//! HITL session state and the browser-streaming data types. Transport
//! framing (the actual WebSocket) is out of scope here; this module models
//! the data the session hands to whatever transport the caller owns.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `HITLSession.status` transitions: `waiting_admin -> in_progress ->
/// {solved | failed | expired}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    WaitingAdmin,
    InProgress,
    Solved,
    Failed,
    Expired,
}

/// Why a failed/expired HITL session resolved the way it did, surfaced in
/// the resulting `captcha_required` `TierResult.metadata["hitl_status"]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HitlFailureSubtype {
    AdminTimeout,
    SolveTimeout,
    HarvestingError,
    BrowserCrash,
}

impl HitlFailureSubtype {
    pub fn as_str(self) -> &'static str {
        match self {
            HitlFailureSubtype::AdminTimeout => "admin_timeout",
            HitlFailureSubtype::SolveTimeout => "solve_timeout",
            HitlFailureSubtype::HarvestingError => "harvesting_error",
            HitlFailureSubtype::BrowserCrash => "browser_crash",
        }
    }
}

#[derive(Debug, Clone)]
pub struct HITLSession {
    pub session_id: Uuid,
    pub task_uuid: Uuid,
    pub url: String,
    pub domain: String,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub admin_connected_at: Option<DateTime<Utc>>,
    pub solved_at: Option<DateTime<Utc>>,
}

impl HITLSession {
    pub fn new(task_uuid: Uuid, url: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            task_uuid,
            url: url.into(),
            domain: domain.into(),
            status: SessionStatus::WaitingAdmin,
            created_at: Utc::now(),
            admin_connected_at: None,
            solved_at: None,
        }
    }

    pub fn mark_admin_connected(&mut self) {
        self.status = SessionStatus::InProgress;
        self.admin_connected_at = Some(Utc::now());
    }

    pub fn mark_solved(&mut self) {
        self.status = SessionStatus::Solved;
        self.solved_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self) {
        self.status = SessionStatus::Failed;
    }

    pub fn mark_expired(&mut self) {
        self.status = SessionStatus::Expired;
    }

    /// Time an admin waited before connecting, `None` while still waiting.
    pub fn wait_time(&self) -> Option<chrono::Duration> {
        self.admin_connected_at.map(|connected| connected - self.created_at)
    }

    /// Time spent solving once an admin connected.
    pub fn solve_time(&self) -> Option<chrono::Duration> {
        match (self.admin_connected_at, self.solved_at) {
            (Some(connected), Some(solved)) => Some(solved - connected),
            _ => None,
        }
    }
}

/// Server-to-client frame header: 4-byte BE frame number, 4-byte BE
/// timestamp (ms, mod 2^32). JPEG bytes are carried separately in `jpeg`
/// rather than concatenated, since the transport layer owns on-wire framing;
/// this is just the pre-framing payload.
#[derive(Debug, Clone)]
pub struct BrowserFrame {
    pub frame_number: u32,
    pub timestamp_ms: u32,
    pub jpeg: bytes::Bytes,
}

impl BrowserFrame {
    pub fn new(frame_number: u32, jpeg: bytes::Bytes) -> Self {
        let timestamp_ms = (Utc::now().timestamp_millis() as u64 % u32::MAX as u64) as u32;
        Self {
            frame_number,
            timestamp_ms,
            jpeg,
        }
    }

    /// 8-byte header, for a transport that wants to prefix the JPEG payload
    /// itself.
    pub fn header_bytes(&self) -> [u8; 8] {
        let mut header = [0u8; 8];
        header[0..4].copy_from_slice(&self.frame_number.to_be_bytes());
        header[4..8].copy_from_slice(&self.timestamp_ms.to_be_bytes());
        header
    }
}

/// Client-to-server input event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientInputEvent {
    MouseMove { x: f64, y: f64 },
    MouseClick { x: f64, y: f64, button: MouseButton, #[serde(rename = "clickCount")] click_count: u32 },
    MouseDown { x: f64, y: f64, button: MouseButton },
    MouseUp { x: f64, y: f64, button: MouseButton },
    KeyDown { key: String, code: String, modifiers: Vec<String> },
    KeyUp { key: String, code: String, modifiers: Vec<String> },
    KeyPress { text: String },
    Scroll { x: f64, y: f64, #[serde(rename = "deltaX")] delta_x: f64, #[serde(rename = "deltaY")] delta_y: f64 },
    Ping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    Left,
    Right,
    Middle,
}

/// Periodic JSON status message: `{event, data, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusMessage {
    pub event: String,
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl StatusMessage {
    pub fn new(event: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    pub fn pong() -> Self {
        Self::new("pong", serde_json::json!({}))
    }
}

/// Wraps the CDP-style `captureScreenshot`/`dispatchMouseEvent`/
/// `dispatchKeyEvent` primitives that a full-browser tier exposes. Like the
/// stronger tiers themselves, the concrete browser driver is a
/// caller-supplied black box; the crate only defines the seam.
#[async_trait]
pub trait BrowserHandle: Send + Sync {
    async fn capture_frame(&self) -> Result<bytes::Bytes, BrowserHandleError>;
    async fn dispatch_input(&self, event: ClientInputEvent) -> Result<(), BrowserHandleError>;
    /// Current document body, used by the solve-detection poll.
    async fn current_document(&self) -> Result<String, BrowserHandleError>;
    /// Cookies, user agent, and proxy context for harvesting.
    async fn harvest_context(&self) -> Result<HarvestContext, BrowserHandleError>;
}

#[derive(Debug, Clone)]
pub struct HarvestContext {
    pub cookies: Vec<crate::ticket_store::Cookie>,
    pub user_agent: Option<String>,
    pub proxy_url: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum BrowserHandleError {
    #[error("browser crashed: {0}")]
    Crashed(String),
    #[error("browser driver error: {0}")]
    Driver(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_time_is_none_until_admin_connects() {
        let session = HITLSession::new(Uuid::new_v4(), "https://example.com/", "example.com");
        assert!(session.wait_time().is_none());
    }

    #[test]
    fn solve_time_requires_both_timestamps() {
        let mut session = HITLSession::new(Uuid::new_v4(), "https://example.com/", "example.com");
        session.mark_admin_connected();
        assert!(session.solve_time().is_none());
        session.mark_solved();
        assert!(session.solve_time().is_some());
    }

    #[test]
    fn frame_header_encodes_big_endian_frame_number() {
        let frame = BrowserFrame::new(7, bytes::Bytes::from_static(b"\xff\xd8"));
        let header = frame.header_bytes();
        assert_eq!(&header[0..4], &7u32.to_be_bytes());
    }

    #[test]
    fn input_event_round_trips_through_json() {
        let event = ClientInputEvent::MouseClick {
            x: 10.0,
            y: 20.0,
            button: MouseButton::Left,
            click_count: 1,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"mouse_click\""));
        let round_tripped: ClientInputEvent = serde_json::from_str(&json).unwrap();
        assert!(matches!(round_tripped, ClientInputEvent::MouseClick { .. }));
    }
}
