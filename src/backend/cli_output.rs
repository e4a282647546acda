//! Post-processing of CLI tool output: auth detection, output cleaning,
//! thinking extraction, and token estimation.
//!
//! CLI tools emit anything from clean line-delimited JSON event streams to
//! banner-laden plain text. Everything here degrades gracefully: cleaning
//! never fails, it just returns less.

use super::BackendResult;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;

/// Provider-specific keywords that indicate an authentication prompt.
fn auth_indicators(provider: &str) -> &'static [&'static str] {
    match provider {
        "codex" => &["sign in", "not authenticated", "authentication required"],
        "gemini" => &["authenticate", "login required", "gcloud auth"],
        "claude" => &["login", "auth", "not authenticated"],
        "opencode" => &["authenticate"],
        "qwen" => &["qwen-oauth", "login"],
        "kimi" => &["login", "token expired"],
        _ => &[],
    }
}

const GENERIC_AUTH_INDICATORS: &[&str] = &[
    "authorization",
    "authenticate",
    "login required",
    "not logged in",
    "credentials",
    "token expired",
    "unauthorized",
];

/// Banner lines stripped from plain-text CLI output.
const BANNER_MARKERS: &[&str] = &[
    "loading",
    "initializing",
    "connecting",
    "thinking...",
    "processing...",
    "mcp:",
    "--------",
    "workdir:",
    "model:",
    "provider:",
    "approval:",
    "sandbox:",
    "reasoning effort:",
    "reasoning summaries:",
    "session id:",
    "tokens used",
    "loaded cached credentials",
    "credentials loaded",
];

fn auth_url_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(?i)https?://[^\s"'<>]+(?:auth|login|oauth|sign-in|authorize)[^\s"'<>]*"#)
            .expect("auth url pattern")
    })
}

fn cjk_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"[\u{4e00}-\u{9fff}\u{3040}-\u{309f}\u{30a0}-\u{30ff}\u{ac00}-\u{d7af}]")
            .expect("cjk pattern")
    })
}

/// Find an authentication URL in command output.
pub fn extract_auth_url(output: &str) -> Option<String> {
    auth_url_pattern()
        .find(output)
        .map(|m| m.as_str().to_string())
}

/// Whether the output looks like an authentication prompt for the provider.
pub fn is_auth_required(output: &str, provider: &str) -> bool {
    if output.is_empty() {
        return false;
    }
    let lower = output.to_lowercase();
    auth_indicators(provider)
        .iter()
        .chain(GENERIC_AUTH_INDICATORS.iter())
        .any(|keyword| lower.contains(keyword))
}

/// Whether auth URLs should be auto-opened, from the environment toggle.
pub fn should_auto_open_auth() -> bool {
    match std::env::var("LLM_GATEWAY_AUTO_OPEN_AUTH") {
        Ok(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => false,
    }
}

/// Best-effort browser open of an auth URL. Returns whether a launcher was
/// spawned; output and exit status are not awaited.
pub fn open_auth_url(url: &str) -> bool {
    for launcher in ["xdg-open", "open"] {
        if std::process::Command::new(launcher)
            .arg(url)
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .spawn()
            .is_ok()
        {
            return true;
        }
    }
    false
}

/// Token estimate with a CJK-aware heuristic: CJK characters weigh ~1.5
/// characters per token, everything else ~4.
pub fn estimate_tokens(text: &str) -> i64 {
    if text.is_empty() {
        return 0;
    }
    let cjk = cjk_pattern().find_iter(text).count() as f64;
    let other = text.chars().count() as f64 - cjk;
    (cjk / 1.5 + other / 4.0) as i64
}

/// Pull `<thinking>…</thinking>`, `<antThinking>…</antThinking>`, and
/// `[Thinking]…[/Thinking]` blocks out of the text. Returns the cleaned
/// text and the joined thinking trace.
pub fn extract_thinking(text: &str) -> (String, Option<String>) {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        vec![
            Regex::new(r"(?is)<thinking>(.*?)</thinking>").expect("thinking pattern"),
            Regex::new(r"(?is)<antThinking>(.*?)</antThinking>").expect("antThinking pattern"),
            Regex::new(r"(?is)\[Thinking\](.*?)\[/Thinking\]").expect("bracket pattern"),
        ]
    });

    let mut cleaned = text.to_string();
    let mut parts: Vec<String> = Vec::new();
    for pattern in patterns {
        for capture in pattern.captures_iter(&cleaned.clone()) {
            if let Some(inner) = capture.get(1) {
                parts.push(inner.as_str().trim().to_string());
            }
        }
        cleaned = pattern.replace_all(&cleaned, "").to_string();
    }

    let thinking = if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n---\n\n"))
    };
    (cleaned.trim().to_string(), thinking)
}

/// Clean raw CLI output down to the response text, separating thinking.
///
/// First tries a line-delimited JSON event scan (Codex-style streams):
/// `item.completed`/`agent_message` and `text` events contribute response
/// text, `thinking` events contribute the trace, tool metadata is ignored.
/// Falls back to thinking-block extraction plus banner-line stripping.
pub fn clean_cli_output(output: &str) -> (String, Option<String>) {
    let mut text_parts: Vec<String> = Vec::new();
    let mut thinking_parts: Vec<String> = Vec::new();

    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(data) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        let Some(obj) = data.as_object() else {
            continue;
        };

        match obj.get("type").and_then(|t| t.as_str()) {
            Some("item.completed") => {
                let item = &data["item"];
                match item["type"].as_str() {
                    Some("agent_message") => {
                        if let Some(text) = item["text"].as_str() {
                            text_parts.push(text.to_string());
                        }
                    }
                    Some("thinking") => {
                        if let Some(text) = item["text"].as_str() {
                            thinking_parts.push(text.to_string());
                        }
                    }
                    _ => {}
                }
            }
            Some("thinking") => {
                if let Some(text) = data["text"].as_str() {
                    thinking_parts.push(text.to_string());
                }
            }
            Some("text") => {
                let part = &data["part"];
                match part["type"].as_str() {
                    Some("text") => {
                        if let Some(text) = part["text"].as_str() {
                            if !text.is_empty() {
                                text_parts.push(text.to_string());
                            }
                        }
                    }
                    Some("thinking") => {
                        if let Some(text) = part["text"].as_str() {
                            if !text.is_empty() {
                                thinking_parts.push(text.to_string());
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => {}
        }
    }

    if !text_parts.is_empty() {
        let thinking = if thinking_parts.is_empty() {
            None
        } else {
            Some(thinking_parts.join("\n\n---\n\n"))
        };
        return (text_parts.join("\n"), thinking);
    }

    // Plain-text path: thinking blocks first, then banner stripping.
    let (cleaned, thinking) = extract_thinking(output);
    let lines: Vec<&str> = cleaned
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            !BANNER_MARKERS.iter().any(|marker| lower.contains(marker))
        })
        .collect();
    (lines.join("\n").trim().to_string(), thinking)
}

fn snip(text: &str, limit: usize) -> &str {
    let text = text.trim();
    if text.len() <= limit {
        return text;
    }
    // Keep the tail; the latest lines carry the diagnostic.
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Convert a finished CLI process into a [`BackendResult`].
pub fn process_cli_output(
    stdout: &str,
    stderr: &str,
    exit_code: i32,
    latency_ms: f64,
    input_text: &str,
    provider: &str,
) -> BackendResult {
    let stdout = stdout.trim();
    let stderr = stderr.trim();
    let combined = format!("{}\n{}", stdout, stderr);

    // An auth URL anywhere in the output is a distinguished failure.
    if let Some(url) = extract_auth_url(&combined) {
        let opened = should_auto_open_auth() && open_auth_url(&url);
        let message = if opened {
            format!("Authentication required. Browser opened automatically.\n{}", url)
        } else {
            format!("Authentication required. Please open this URL:\n{}", url)
        };
        let mut result = BackendResult::fail(message).with_latency(latency_ms);
        result.insert_metadata("auth_required", serde_json::json!(true));
        result.insert_metadata("auth_url", serde_json::json!(url));
        return result;
    }

    if (exit_code != 0 || (stdout.is_empty() && stderr.is_empty()))
        && is_auth_required(&combined, provider)
    {
        let mut result = BackendResult::fail(format!(
            "Authentication required for {}. Please re-authenticate and retry.",
            provider
        ))
        .with_latency(latency_ms);
        result.insert_metadata("auth_required", serde_json::json!(true));
        return result;
    }

    let (response, thinking) = clean_cli_output(stdout);

    if !response.is_empty() {
        let input_tokens = estimate_tokens(input_text);
        let output_tokens = estimate_tokens(&response);
        let mut result = BackendResult::ok(response)
            .with_latency(latency_ms)
            .with_tokens(input_tokens + output_tokens);
        result.insert_metadata("exit_code", serde_json::json!(exit_code));
        result.insert_metadata("input_tokens", serde_json::json!(input_tokens));
        result.insert_metadata("output_tokens", serde_json::json!(output_tokens));
        result.insert_metadata("tokens_estimated", serde_json::json!(true));
        result.thinking = thinking;
        result.raw_output = Some(stdout.to_string());
        return result;
    }

    if exit_code != 0 {
        let mut detail = Vec::new();
        if !stderr.is_empty() {
            detail.push(format!("stderr:\n{}", snip(stderr, 1200)));
        }
        if !stdout.is_empty() && snip(stdout, 1200) != snip(stderr, 1200) {
            detail.push(format!("stdout:\n{}", snip(stdout, 1200)));
        }
        let message = if detail.is_empty() {
            format!("CLI exited with code {}", exit_code)
        } else {
            format!("CLI exited with code {}\n{}", exit_code, detail.join("\n\n"))
        };
        return BackendResult::fail(message).with_latency(latency_ms);
    }

    // Clean exit with empty output counts as an empty completion.
    let input_tokens = estimate_tokens(input_text);
    let mut result = BackendResult::ok("")
        .with_latency(latency_ms)
        .with_tokens(input_tokens);
    result.insert_metadata("exit_code", serde_json::json!(exit_code));
    result.insert_metadata("tokens_estimated", serde_json::json!(true));
    result.raw_output = Some(stdout.to_string());
    result
}
