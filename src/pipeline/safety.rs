//! 内容安全层：敏感词替换、变体匹配与 PII 掩码，流式输出采用滑动窗口缓冲。
//!
//! Content-safety layer.
//!
//! Applies, in order: exact sensitive-term replacement (case-insensitive,
//! per-term or default mask), pattern-based variant replacement (catches
//! spaced or punctuated obfuscations of a term), then PII masking (fixed
//! regex→mask pairs for phone numbers, emails, national ids and card
//! numbers).
//!
//! Unary calls are filtered over the full input and/or output. Streaming
//! calls go through a sliding-window buffer sized to at least the longest
//! configured pattern: whenever the buffer exceeds the window, the safe
//! prefix (buffer length minus window) is filtered and emitted while the
//! remainder is retained, so a pattern is never split across an emission
//! boundary; the remaining buffer is filtered and flushed at stream end.
//!
//! Policy on violation: `Replace` masks and continues, `Block` aborts with
//! one fixed block message surfaced as a normal response (never an error),
//! `LogOnly` emits unmodified text and records a warning.

use async_trait::async_trait;
use futures::StreamExt;
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{synthetic_stream, ChatHandler, DeltaStream};
use crate::config::{PipelineConfig, SafetyPolicy, SafetyRule};
use crate::types::{ChatDelta, ChatRequest, ChatResponse, MessageRole};
use crate::Result;

/// Fixed message surfaced when the Block policy fires.
pub const BLOCK_MESSAGE: &str = "This content was blocked by the configured safety policy.";

/// Finish reason attached to blocked responses.
pub const BLOCK_FINISH_REASON: &str = "content_filter";

const DEFAULT_MASK: &str = "***";

/// Separators tolerated inside an obfuscated term ("s e c r e t",
/// "s.e.c.r.e.t"). Bounded so the longest possible match stays bounded.
const OBFUSCATION_GAP: &str = r"[\s\.\-_\*]{0,2}";

static PII_PATTERNS: Lazy<Vec<(Regex, &'static str, &'static str)>> = Lazy::new(|| {
    vec![
        (
            Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap(),
            "[EMAIL]",
            "email",
        ),
        (
            Regex::new(r"\b(?:\+?\d{1,3}[-\s]?)?(?:\(\d{3}\)|\d{3})[-\s]?\d{3,4}[-\s]?\d{4}\b")
                .unwrap(),
            "[PHONE]",
            "phone",
        ),
        (
            // US SSN-style and 18-digit national id formats.
            Regex::new(r"\b(?:\d{3}-\d{2}-\d{4}|\d{17}[\dXx])\b").unwrap(),
            "[ID]",
            "national_id",
        ),
        (
            Regex::new(r"\b\d{4}[-\s]?\d{4}[-\s]?\d{4}[-\s]?\d{4}\b").unwrap(),
            "[CARD]",
            "card_number",
        ),
    ]
});

struct TermRule {
    exact: Regex,
    variant: Regex,
    mask: String,
    label: String,
}

/// Compiled filter applied by both the unary and the streaming path.
pub struct ContentFilter {
    terms: Vec<TermRule>,
    mask_pii: bool,
}

/// Result of filtering one piece of text.
pub struct FilterOutcome {
    pub text: String,
    pub violations: Vec<String>,
}

impl ContentFilter {
    pub fn new(rules: &[SafetyRule], mask_pii: bool) -> Self {
        let terms = rules
            .iter()
            .filter(|r| !r.term.trim().is_empty())
            .map(|rule| {
                let escaped = regex::escape(&rule.term);
                let spaced: String = rule
                    .term
                    .chars()
                    .map(|c| regex::escape(&c.to_string()))
                    .collect::<Vec<_>>()
                    .join(OBFUSCATION_GAP);
                TermRule {
                    exact: Regex::new(&format!("(?i){}", escaped)).unwrap(),
                    variant: Regex::new(&format!("(?i){}", spaced)).unwrap(),
                    mask: rule.mask.clone().unwrap_or_else(|| DEFAULT_MASK.to_string()),
                    label: rule.term.clone(),
                }
            })
            .collect();
        Self { terms, mask_pii }
    }

    /// Minimum streaming window (in chars) that guarantees no configured
    /// pattern can span an emission boundary. Term variants stretch to at
    /// most three bytes per character; PII patterns are bounded by the
    /// fixed floor.
    pub fn window_chars(&self) -> usize {
        let longest_term = self
            .terms
            .iter()
            .map(|t| t.label.chars().count() * 3)
            .max()
            .unwrap_or(0);
        longest_term.max(64)
    }

    /// Byte ranges of every match currently present in `text`, with labels.
    fn spans(&self, text: &str) -> Vec<(usize, usize, String)> {
        let mut spans = Vec::new();
        for rule in &self.terms {
            for m in rule.exact.find_iter(text) {
                spans.push((m.start(), m.end(), rule.label.clone()));
            }
            for m in rule.variant.find_iter(text) {
                spans.push((m.start(), m.end(), format!("{} (variant)", rule.label)));
            }
        }
        if self.mask_pii {
            for (pattern, _, label) in PII_PATTERNS.iter() {
                for m in pattern.find_iter(text) {
                    spans.push((m.start(), m.end(), (*label).to_string()));
                }
            }
        }
        spans
    }

    /// Filter `text` fully: exact terms, then variants, then PII.
    pub fn apply(&self, text: &str) -> FilterOutcome {
        let violations: Vec<String> = self.spans(text).into_iter().map(|(_, _, l)| l).collect();
        if violations.is_empty() {
            return FilterOutcome {
                text: text.to_string(),
                violations,
            };
        }
        let mut out = text.to_string();
        for rule in &self.terms {
            out = rule.exact.replace_all(&out, rule.mask.as_str()).to_string();
            out = rule
                .variant
                .replace_all(&out, rule.mask.as_str())
                .to_string();
        }
        if self.mask_pii {
            for (pattern, mask, _) in PII_PATTERNS.iter() {
                out = pattern.replace_all(&out, *mask).to_string();
            }
        }
        FilterOutcome {
            text: out,
            violations,
        }
    }

    pub fn has_violation(&self, text: &str) -> bool {
        !self.spans(text).is_empty()
    }
}

/// What one buffer advance produced.
struct Emission {
    raw: String,
    masked: String,
    violations: Vec<String>,
}

/// Sliding-window buffer for the streaming path.
struct StreamingFilter {
    filter: Arc<ContentFilter>,
    window: usize,
    buf: String,
}

impl StreamingFilter {
    fn new(filter: Arc<ContentFilter>) -> Self {
        let window = filter.window_chars();
        Self {
            filter,
            window,
            buf: String::new(),
        }
    }

    /// Append a chunk; emit the buffer's safe prefix once it exceeds the
    /// window. The cut never lands inside a match: any span overlapping the
    /// tentative boundary pulls the cut back to the span start.
    fn push(&mut self, chunk: &str) -> Emission {
        self.buf.push_str(chunk);
        let spans = self.filter.spans(&self.buf);
        let violations: Vec<String> = spans.iter().map(|(_, _, l)| l.clone()).collect();

        let char_count = self.buf.chars().count();
        if char_count <= self.window {
            return Emission {
                raw: String::new(),
                masked: String::new(),
                violations,
            };
        }

        let keep_from_char = char_count - self.window;
        let mut cut = self
            .buf
            .char_indices()
            .nth(keep_from_char)
            .map(|(i, _)| i)
            .unwrap_or(self.buf.len());
        // Pull the cut back until no span crosses it (overlapping spans can
        // cascade, so iterate to a fixpoint).
        loop {
            let mut changed = false;
            for (start, end, _) in &spans {
                if *start < cut && *end > cut {
                    cut = *start;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        // Never cut inside an alphanumeric run: a digit run split at the
        // boundary could match a bounded pattern in the prefix alone even
        // though the full text continues the run. Bounded walk-back so a
        // pathological all-alphanumeric stream still makes progress.
        let mut guard = 0;
        while cut > 0 && guard < 160 {
            let prev = self.buf[..cut].chars().next_back();
            let next = self.buf[cut..].chars().next();
            match (prev, next) {
                (Some(p), Some(n)) if p.is_alphanumeric() && n.is_alphanumeric() => {
                    cut -= p.len_utf8();
                    guard += 1;
                }
                _ => break,
            }
        }

        let raw = self.buf[..cut].to_string();
        let masked = self.filter.apply(&raw).text;
        self.buf.drain(..cut);
        Emission {
            raw,
            masked,
            violations,
        }
    }

    /// Filter and drain whatever the buffer still holds.
    fn flush(&mut self) -> Emission {
        let raw = std::mem::take(&mut self.buf);
        let outcome = self.filter.apply(&raw);
        Emission {
            raw,
            masked: outcome.text,
            violations: outcome.violations,
        }
    }
}

pub struct SafetyLayer {
    inner: Arc<dyn ChatHandler>,
    filter: Arc<ContentFilter>,
    policy: SafetyPolicy,
    filter_input: bool,
    filter_output: bool,
}

impl SafetyLayer {
    pub fn new(inner: Arc<dyn ChatHandler>, config: &PipelineConfig) -> Self {
        Self {
            inner,
            filter: Arc::new(ContentFilter::new(&config.sensitive_terms, config.mask_pii)),
            policy: config.safety_policy,
            filter_input: config.filter_input,
            filter_output: config.filter_output,
        }
    }

    fn blocked_response() -> ChatResponse {
        ChatResponse {
            content: BLOCK_MESSAGE.to_string(),
            role: MessageRole::Assistant,
            finish_reason: Some(BLOCK_FINISH_REASON.to_string()),
            tool_calls: Vec::new(),
            usage: None,
        }
    }

    /// Apply the input policy in place. `Err`-free: blocking surfaces as a
    /// synthetic response through the caller.
    fn screen_input(&self, request: &mut ChatRequest) -> Option<ChatResponse> {
        if !self.filter_input {
            return None;
        }
        match self.policy {
            SafetyPolicy::Replace => {
                for message in &mut request.messages {
                    let outcome = self.filter.apply(&message.content);
                    if !outcome.violations.is_empty() {
                        debug!(violations = ?outcome.violations, "masked request content");
                        message.content = outcome.text;
                    }
                }
                None
            }
            SafetyPolicy::Block => {
                let violated = request
                    .messages
                    .iter()
                    .any(|m| self.filter.has_violation(&m.content));
                violated.then(Self::blocked_response)
            }
            SafetyPolicy::LogOnly => {
                for message in &request.messages {
                    let outcome = self.filter.apply(&message.content);
                    if !outcome.violations.is_empty() {
                        warn!(
                            violations = ?outcome.violations,
                            "request content matched safety rules"
                        );
                    }
                }
                None
            }
        }
    }

    fn screen_output(&self, response: ChatResponse) -> ChatResponse {
        if !self.filter_output {
            return response;
        }
        match self.policy {
            SafetyPolicy::Replace => {
                let outcome = self.filter.apply(&response.content);
                if outcome.violations.is_empty() {
                    response
                } else {
                    debug!(violations = ?outcome.violations, "masked response content");
                    ChatResponse {
                        content: outcome.text,
                        ..response
                    }
                }
            }
            SafetyPolicy::Block => {
                if self.filter.has_violation(&response.content) {
                    Self::blocked_response()
                } else {
                    response
                }
            }
            SafetyPolicy::LogOnly => {
                if self.filter.has_violation(&response.content) {
                    warn!("response content matched safety rules");
                }
                response
            }
        }
    }

    fn filter_stream(&self, stream: DeltaStream) -> DeltaStream {
        struct State {
            inner: DeltaStream,
            filter: StreamingFilter,
            policy: SafetyPolicy,
            pending: VecDeque<Result<ChatDelta>>,
            pending_role: Option<MessageRole>,
            finished: bool,
        }

        impl State {
            fn content_delta(&mut self, text: String) -> ChatDelta {
                ChatDelta {
                    role: self.pending_role.take(),
                    content: text,
                    finish_reason: None,
                    usage: None,
                }
            }

            fn queue_emission(&mut self, emission: Emission) {
                let text = match self.policy {
                    SafetyPolicy::Replace => emission.masked,
                    SafetyPolicy::LogOnly => {
                        if !emission.violations.is_empty() {
                            warn!(
                                violations = ?emission.violations,
                                "streamed content matched safety rules"
                            );
                        }
                        emission.raw
                    }
                    // Block never reaches here; violations abort earlier.
                    SafetyPolicy::Block => emission.raw,
                };
                if !text.is_empty() {
                    let delta = self.content_delta(text);
                    self.pending.push_back(Ok(delta));
                }
            }

            fn block_now(&mut self) {
                self.pending.clear();
                self.pending.push_back(Ok(ChatDelta {
                    role: Some(MessageRole::Assistant),
                    content: BLOCK_MESSAGE.to_string(),
                    finish_reason: Some(BLOCK_FINISH_REASON.to_string()),
                    usage: None,
                }));
                self.finished = true;
            }

            fn on_delta(&mut self, delta: ChatDelta) {
                if let Some(role) = delta.role {
                    self.pending_role = Some(role);
                }
                if !delta.content.is_empty() {
                    let emission = self.filter.push(&delta.content);
                    if self.policy == SafetyPolicy::Block && !emission.violations.is_empty() {
                        self.block_now();
                        return;
                    }
                    self.queue_emission(emission);
                }
                if delta.finish_reason.is_some() || delta.usage.is_some() {
                    self.on_end();
                    if !self.finished {
                        self.pending.push_back(Ok(ChatDelta {
                            role: None,
                            content: String::new(),
                            finish_reason: delta.finish_reason,
                            usage: delta.usage,
                        }));
                    }
                }
            }

            fn on_end(&mut self) {
                let emission = self.filter.flush();
                if self.policy == SafetyPolicy::Block && !emission.violations.is_empty() {
                    self.block_now();
                    return;
                }
                self.queue_emission(emission);
            }
        }

        let state = State {
            inner: stream,
            filter: StreamingFilter::new(self.filter.clone()),
            policy: self.policy,
            pending: VecDeque::new(),
            pending_role: None,
            finished: false,
        };

        Box::pin(futures::stream::unfold(state, |mut st| async move {
            loop {
                if let Some(item) = st.pending.pop_front() {
                    return Some((item, st));
                }
                if st.finished {
                    return None;
                }
                match st.inner.next().await {
                    Some(Ok(delta)) => st.on_delta(delta),
                    Some(Err(e)) => {
                        st.finished = true;
                        return Some((Err(e), st));
                    }
                    None => {
                        st.on_end();
                        st.finished = true;
                        if st.pending.is_empty() {
                            return None;
                        }
                    }
                }
            }
        }))
    }
}

#[async_trait]
impl ChatHandler for SafetyLayer {
    async fn chat(&self, request: ChatRequest, cancel: CancellationToken) -> Result<ChatResponse> {
        let mut request = request;
        if let Some(blocked) = self.screen_input(&mut request) {
            return Ok(blocked);
        }
        let response = self.inner.chat(request, cancel).await?;
        Ok(self.screen_output(response))
    }

    async fn chat_stream(
        &self,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> Result<DeltaStream> {
        let mut request = request;
        if let Some(blocked) = self.screen_input(&mut request) {
            return Ok(synthetic_stream(blocked));
        }
        let stream = self.inner.chat_stream(request, cancel).await?;
        if !self.filter_output {
            return Ok(stream);
        }
        Ok(self.filter_stream(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ping, ScriptedBackend};
    use crate::types::Message;
    use futures::StreamExt;

    fn config(policy: SafetyPolicy, terms: &[&str]) -> PipelineConfig {
        PipelineConfig {
            safety_enabled: true,
            safety_policy: policy,
            sensitive_terms: terms.iter().map(|t| SafetyRule::term(*t)).collect(),
            ..Default::default()
        }
    }

    fn layer(backend: Arc<ScriptedBackend>, policy: SafetyPolicy, terms: &[&str]) -> SafetyLayer {
        SafetyLayer::new(backend, &config(policy, terms))
    }

    async fn collect_text(stream: DeltaStream) -> String {
        stream
            .filter_map(|d| async move { d.ok() })
            .map(|d| d.content)
            .collect::<Vec<_>>()
            .await
            .join("")
    }

    #[tokio::test]
    async fn replace_masks_output_terms_case_insensitively() {
        let backend = Arc::new(ScriptedBackend::always_ok("the SeCrEt plan"));
        let layer = layer(backend, SafetyPolicy::Replace, &["secret"]);

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "the *** plan");
    }

    #[tokio::test]
    async fn replace_masks_obfuscated_variants() {
        let backend = Arc::new(ScriptedBackend::always_ok("the s.e.c.r.e.t plan"));
        let layer = layer(backend, SafetyPolicy::Replace, &["secret"]);

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert!(!response.content.to_lowercase().contains("s.e.c.r.e.t"));
        assert!(response.content.contains("***"));
    }

    #[tokio::test]
    async fn replace_masks_input_before_forwarding() {
        let backend = Arc::new(ScriptedBackend::always_ok("ok"));
        let layer = layer(backend.clone(), SafetyPolicy::Replace, &["classified"]);

        layer
            .chat(
                ChatRequest::new(vec![Message::user("share the classified data")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let seen = backend.last_request().unwrap();
        assert_eq!(seen.messages[0].content, "share the *** data");
    }

    #[tokio::test]
    async fn pii_is_masked_with_type_specific_masks() {
        let backend = Arc::new(ScriptedBackend::always_ok(
            "write to alice@example.com or call 555-123-4567, card 4111-1111-1111-1111",
        ));
        let layer = layer(backend, SafetyPolicy::Replace, &[]);

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert!(response.content.contains("[EMAIL]"));
        assert!(response.content.contains("[PHONE]") || response.content.contains("[CARD]"));
        assert!(!response.content.contains("alice@example.com"));
        assert!(!response.content.contains("4111-1111-1111-1111"));
    }

    #[tokio::test]
    async fn custom_masks_are_honored() {
        let backend = Arc::new(ScriptedBackend::always_ok("project nimbus is live"));
        let mut cfg = config(SafetyPolicy::Replace, &[]);
        cfg.sensitive_terms = vec![SafetyRule::term("nimbus").with_mask("[REDACTED]")];
        let layer = SafetyLayer::new(backend, &cfg);

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "project [REDACTED] is live");
    }

    #[tokio::test]
    async fn block_policy_replaces_response_with_block_message() {
        let backend = Arc::new(ScriptedBackend::always_ok("the secret plan"));
        let layer = layer(backend, SafetyPolicy::Block, &["secret"]);

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, BLOCK_MESSAGE);
        assert_eq!(response.finish_reason.as_deref(), Some(BLOCK_FINISH_REASON));
    }

    #[tokio::test]
    async fn block_policy_on_input_short_circuits_the_backend() {
        let backend = Arc::new(ScriptedBackend::always_ok("never"));
        let layer = layer(backend.clone(), SafetyPolicy::Block, &["secret"]);

        let response = layer
            .chat(
                ChatRequest::new(vec![Message::user("tell me the secret")]),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(response.content, BLOCK_MESSAGE);
        assert_eq!(backend.calls(), 0);
    }

    #[tokio::test]
    async fn log_only_passes_content_unchanged() {
        let backend = Arc::new(ScriptedBackend::always_ok("the secret plan"));
        let layer = layer(backend, SafetyPolicy::LogOnly, &["secret"]);

        let response = layer.chat(ping(), CancellationToken::new()).await.unwrap();
        assert_eq!(response.content, "the secret plan");
    }

    #[tokio::test]
    async fn streaming_filter_matches_unary_filtering_for_any_chunking() {
        let text = "public intro, then the secret appears, s e c r e t variant, \
                    mail bob@example.com, and a long tail of harmless prose to push \
                    the buffer past its window size again and again and again.";
        let reference = {
            let filter = ContentFilter::new(&[SafetyRule::term("secret")], true);
            filter.apply(text).text
        };

        for chunk_size in [1usize, 2, 3, 7, 11, 50] {
            let chunks: Vec<ChatDelta> = text
                .chars()
                .collect::<Vec<_>>()
                .chunks(chunk_size)
                .map(|c| ChatDelta::content(c.iter().collect::<String>()))
                .chain(std::iter::once(ChatDelta::finish("stop")))
                .collect();
            let backend =
                Arc::new(ScriptedBackend::always_ok("x").with_stream_deltas(vec![chunks]));
            let layer = layer(backend, SafetyPolicy::Replace, &["secret"]);

            let stream = layer
                .chat_stream(ping(), CancellationToken::new())
                .await
                .unwrap();
            let filtered = collect_text(stream).await;
            assert_eq!(filtered, reference, "chunk size {}", chunk_size);
        }
    }

    #[tokio::test]
    async fn streaming_preserves_finish_reason() {
        let backend = Arc::new(ScriptedBackend::always_ok("x").with_stream_deltas(vec![vec![
            ChatDelta::content("all clear"),
            ChatDelta::finish("stop"),
        ]]));
        let layer = layer(backend, SafetyPolicy::Replace, &["secret"]);

        let stream = layer
            .chat_stream(ping(), CancellationToken::new())
            .await
            .unwrap();
        let deltas: Vec<ChatDelta> = stream.map(|d| d.unwrap()).collect().await;
        assert!(deltas
            .iter()
            .any(|d| d.finish_reason.as_deref() == Some("stop")));
        let text: String = deltas.iter().map(|d| d.content.as_str()).collect();
        assert_eq!(text, "all clear");
    }

    #[tokio::test]
    async fn streaming_block_aborts_with_block_message() {
        let backend = Arc::new(ScriptedBackend::always_ok("x").with_stream_deltas(vec![vec![
            ChatDelta::content("here is the sec"),
            ChatDelta::content("ret you wanted"),
            ChatDelta::content(" and much more text afterwards"),
            ChatDelta::finish("stop"),
        ]]));
        let layer = layer(backend, SafetyPolicy::Block, &["secret"]);

        let stream = layer
            .chat_stream(ping(), CancellationToken::new())
            .await
            .unwrap();
        let deltas: Vec<ChatDelta> = stream.map(|d| d.unwrap()).collect().await;
        let last = deltas.last().unwrap();
        assert_eq!(last.content, BLOCK_MESSAGE);
        assert_eq!(last.finish_reason.as_deref(), Some(BLOCK_FINISH_REASON));
    }

    #[test]
    fn window_covers_longest_configured_term() {
        let filter = ContentFilter::new(
            &[
                SafetyRule::term("short"),
                SafetyRule::term("a-very-long-sensitive-term-indeed"),
            ],
            true,
        );
        assert!(filter.window_chars() >= "a-very-long-sensitive-term-indeed".len());
    }
}
