use serde::Serialize;
use tokio::sync::mpsc;

/// Events emitted to the client during one chat turn, in generation order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ChatEvent {
    TextDelta {
        delta: String,
    },
    ReasoningDelta {
        delta: String,
    },
    ToolCall {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        id: String,
        output: String,
    },
    Error {
        message: String,
    },
    Finish {
        conversation_id: String,
        message_id: Option<String>,
    },
}

/// Write side of the turn's event stream.
///
/// Text deltas are smoothed to word granularity: partial tokens are buffered
/// until a whitespace boundary and the tail is flushed at stream end. A send
/// failure means the receiver is gone; the sink then reports itself closed
/// and drops everything further.
pub struct EventSink {
    tx: mpsc::Sender<ChatEvent>,
    text_buffer: String,
    closed: bool,
}

impl EventSink {
    pub fn new(tx: mpsc::Sender<ChatEvent>) -> Self {
        Self {
            tx,
            text_buffer: String::new(),
            closed: false,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Buffer a text fragment, emitting complete words.
    pub async fn text_delta(&mut self, fragment: &str) {
        self.text_buffer.push_str(fragment);

        let boundary = self
            .text_buffer
            .char_indices()
            .rev()
            .find(|(_, c)| c.is_whitespace())
            .map(|(i, c)| i + c.len_utf8());
        if let Some(end) = boundary {
            let ready: String = self.text_buffer.drain(..end).collect();
            self.emit(ChatEvent::TextDelta { delta: ready }).await;
        }
    }

    pub async fn reasoning_delta(&mut self, fragment: &str) {
        self.flush_text().await;
        self.emit(ChatEvent::ReasoningDelta {
            delta: fragment.to_string(),
        })
        .await;
    }

    /// Send a non-text event, flushing any buffered partial word first so
    /// ordering is preserved.
    pub async fn send(&mut self, event: ChatEvent) {
        self.flush_text().await;
        self.emit(event).await;
    }

    /// Emit whatever partial word is still buffered.
    pub async fn flush_text(&mut self) {
        if self.text_buffer.is_empty() {
            return;
        }
        let tail = std::mem::take(&mut self.text_buffer);
        self.emit(ChatEvent::TextDelta { delta: tail }).await;
    }

    async fn emit(&mut self, event: ChatEvent) {
        if self.closed {
            return;
        }
        if self.tx.send(event).await.is_err() {
            self.closed = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn drain(rx: &mut mpsc::Receiver<ChatEvent>) -> Vec<ChatEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn deltas(events: &[ChatEvent]) -> Vec<&str> {
        events
            .iter()
            .filter_map(|e| match e {
                ChatEvent::TextDelta { delta } => Some(delta.as_str()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn partial_tokens_wait_for_a_word_boundary() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        sink.text_delta("Hel").await;
        sink.text_delta("lo wor").await;
        sink.text_delta("ld").await;
        sink.flush_text().await;

        let events = drain(&mut rx).await;
        assert_eq!(deltas(&events), vec!["Hello ", "world"]);
    }

    #[tokio::test]
    async fn tail_without_whitespace_is_flushed_at_end() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        sink.text_delta("done").await;
        assert!(drain(&mut rx).await.is_empty());

        sink.flush_text().await;
        assert_eq!(deltas(&drain(&mut rx).await), vec!["done"]);
    }

    #[tokio::test]
    async fn non_text_events_flush_buffered_text_first() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        sink.text_delta("calling").await;
        sink.send(ChatEvent::ToolCall {
            id: "t1".to_string(),
            name: "get_weather".to_string(),
            input: serde_json::json!({}),
        })
        .await;

        let events = drain(&mut rx).await;
        assert!(matches!(events[0], ChatEvent::TextDelta { .. }));
        assert!(matches!(events[1], ChatEvent::ToolCall { .. }));
    }

    #[tokio::test]
    async fn multibyte_whitespace_is_a_valid_boundary() {
        let (tx, mut rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);

        sink.text_delta("hello\u{a0}world").await;
        assert_eq!(deltas(&drain(&mut rx).await), vec!["hello\u{a0}"]);

        sink.text_delta("\u{3000}\u{2028}tail").await;
        sink.flush_text().await;
        assert_eq!(
            deltas(&drain(&mut rx).await),
            vec!["world\u{3000}\u{2028}", "tail"]
        );
    }

    #[tokio::test]
    async fn dropped_receiver_closes_the_sink() {
        let (tx, rx) = mpsc::channel(16);
        let mut sink = EventSink::new(tx);
        drop(rx);

        sink.text_delta("hello world ").await;
        assert!(sink.is_closed());
    }

    #[test]
    fn events_serialize_with_kebab_case_tags() {
        let event = ChatEvent::ReasoningDelta {
            delta: "step".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "reasoning-delta");
    }
}
