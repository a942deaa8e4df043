use serde_json::Value as JsonValue;

/// A uniform tagged event emitted from either dispatch path. The pipeline
/// relays `Data`/`Done` as SSE frames when streaming, or waits for a single
/// `Complete` otherwise; `Error` ends either path.
#[derive(Debug, Clone)]
pub enum UpstreamEvent {
    Data(JsonValue),
    Done,
    Complete(JsonValue),
    Error { status: u16, body: JsonValue },
}
