//! Observers registered by the command line front end.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

use chrono::Utc;
use parking_lot::Mutex;
use pinhole_proxy::{
    ConnectionInfo, Direction, EventListener, HttpRequest, HttpResponse, ObserverError,
    ProxyError, Upstream, WebSocketFrame,
};
use serde_json::{json, Value};

/// Logs a one-line summary of every exchange.
#[derive(Debug, Default)]
pub struct LoggingListener;

impl EventListener for LoggingListener {
    fn on_response(
        &self,
        conn: &ConnectionInfo,
        upstream: &Upstream,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<(), ObserverError> {
        tracing::info!(
            conn = conn.id,
            "{} {} -> {} ({} bytes)",
            request.method,
            upstream.url(request.origin_form()),
            response.status,
            response.body.len()
        );
        Ok(())
    }

    fn on_message(
        &self,
        conn: &ConnectionInfo,
        upgrade: &HttpRequest,
        direction: Direction,
        frame: &WebSocketFrame,
    ) -> Result<(), ObserverError> {
        tracing::debug!(
            conn = conn.id,
            target = %upgrade.target,
            ?direction,
            opcode = ?frame.opcode,
            len = frame.payload.len(),
            "WebSocket frame"
        );
        Ok(())
    }

    fn on_error(&self, conn: &ConnectionInfo, error: &ProxyError) -> Result<(), ObserverError> {
        tracing::warn!(conn = conn.id, client = %conn.client_addr, "{}", error);
        Ok(())
    }
}

/// Appends every event as one JSON object per line.
pub struct JsonLinesRecorder<W: Write + Send> {
    out: Mutex<W>,
}

impl JsonLinesRecorder<BufWriter<File>> {
    /// Opens (appending) or creates `path`.
    pub fn create(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write + Send> JsonLinesRecorder<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: Mutex::new(out),
        }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner()
    }

    fn write(&self, conn: &ConnectionInfo, event: &str, mut record: Value) -> Result<(), ObserverError> {
        record["event"] = json!(event);
        record["conn"] = json!(conn.id);
        record["client"] = json!(conn.client_addr.to_string());
        record["time"] = json!(Utc::now().to_rfc3339());

        let mut out = self.out.lock();
        serde_json::to_writer(&mut *out, &record).map_err(|e| ObserverError::new(e.to_string()))?;
        out.write_all(b"\n")
            .and_then(|_| out.flush())
            .map_err(|e| ObserverError::new(e.to_string()))
    }
}

impl<W: Write + Send> EventListener for JsonLinesRecorder<W> {
    fn on_request(
        &self,
        conn: &ConnectionInfo,
        upstream: &Upstream,
        request: &HttpRequest,
    ) -> Result<(), ObserverError> {
        self.write(
            conn,
            "request",
            json!({
                "method": request.method,
                "url": upstream.url(request.origin_form()),
                "body_len": request.body.len(),
            }),
        )
    }

    fn on_response(
        &self,
        conn: &ConnectionInfo,
        upstream: &Upstream,
        request: &HttpRequest,
        response: &HttpResponse,
    ) -> Result<(), ObserverError> {
        self.write(
            conn,
            "response",
            json!({
                "url": upstream.url(request.origin_form()),
                "status": response.status,
                "content_type": response.headers.get("content-type"),
                "body_len": response.body.len(),
            }),
        )
    }

    fn on_message(
        &self,
        conn: &ConnectionInfo,
        upgrade: &HttpRequest,
        direction: Direction,
        frame: &WebSocketFrame,
    ) -> Result<(), ObserverError> {
        self.write(
            conn,
            "message",
            json!({
                "target": upgrade.target,
                "direction": direction,
                "opcode": frame.opcode.as_u8(),
                "text": frame.as_text(),
            }),
        )
    }

    fn on_error(&self, conn: &ConnectionInfo, error: &ProxyError) -> Result<(), ObserverError> {
        self.write(conn, "error", json!({ "error": error.to_string() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pinhole_proxy::Scheme;

    #[test]
    fn recorder_writes_one_line_per_event() {
        let recorder = JsonLinesRecorder::new(Vec::new());
        let conn = ConnectionInfo::new("127.0.0.1:40000".parse().unwrap());
        let upstream = Upstream::new(Scheme::Https, "api.example.test", 443);
        let request = HttpRequest::new("POST", "/v1/items").with_body("{}");
        let response = HttpResponse::new(201).with_header("Content-Type", "application/json");

        recorder.on_request(&conn, &upstream, &request).unwrap();
        recorder
            .on_response(&conn, &upstream, &request, &response)
            .unwrap();
        recorder
            .on_message(&conn, &request, Direction::ClientToServer, &WebSocketFrame::text("hi"))
            .unwrap();

        let output = String::from_utf8(recorder.into_inner()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["event"], "request");
        assert_eq!(lines[0]["url"], "https://api.example.test/v1/items");
        assert_eq!(lines[1]["status"], 201);
        assert_eq!(lines[1]["content_type"], "application/json");
        assert_eq!(lines[2]["direction"], "client_to_server");
        assert_eq!(lines[2]["text"], "hi");
    }

    #[test]
    fn logging_listener_never_fails() {
        let conn = ConnectionInfo::new("127.0.0.1:40001".parse().unwrap());
        let error = ProxyError::Tls("handshake".into());
        assert!(LoggingListener.on_error(&conn, &error).is_ok());
    }
}
