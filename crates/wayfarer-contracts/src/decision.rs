use serde::Serialize;
use serde_json::Value;

/// Commentary used when a navigation decision carries none of its own.
pub const FALLBACK_COMMENTARY: &str = "Tour guide commentary";

const DATA_PREFIX: &str = "data: ";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NavigationDecision {
    #[serde(rename = "panoId")]
    pub pano_id: String,
    pub heading: f64,
    pub commentary: String,
}

/// Outcome of parsing a model reply: either a full navigation instruction or
/// a decision-shaped object that only carried commentary.
#[derive(Debug, Clone, PartialEq)]
pub enum Extraction {
    Navigate(NavigationDecision),
    Commentary(String),
}

/// Scans an event-stream payload for the model's final answer.
///
/// Lines carrying the data marker are parsed as JSON envelopes; lines that
/// fail to parse are skipped. The first `node_finished` event with a
/// non-empty `answer`/`text`/`result` output wins. A `workflow_finished`
/// event with outputs ends the scan whether or not it carries an answer,
/// so later events never override it. No qualifying event is a normal
/// "no answer yet" outcome, not an error.
pub fn extract_final_answer(payload: &str) -> Option<String> {
    for line in payload.lines() {
        let Some(rest) = line.strip_prefix(DATA_PREFIX) else {
            continue;
        };
        let Ok(envelope) = serde_json::from_str::<Value>(rest.trim()) else {
            continue;
        };
        let outputs = envelope.get("data").and_then(|data| data.get("outputs"));
        match envelope.get("event").and_then(Value::as_str) {
            Some("node_finished") => {
                if let Some(outputs) = outputs {
                    if let Some(answer) = first_output(outputs, &["answer", "text", "result"]) {
                        return Some(answer);
                    }
                }
            }
            Some("workflow_finished") => {
                if let Some(outputs) = outputs {
                    return first_output(outputs, &["answer", "text"]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Best-effort parse of a navigation decision out of a free-text answer.
///
/// Tolerates a single markdown code fence around the JSON; when the cleaned
/// text does not parse, falls back to the first brace-delimited fragment.
/// The fragment match is knowingly naive about nested objects. A parsed
/// object without a `panoId` still yields its commentary when present.
pub fn decision_from_answer(answer: &str) -> Option<Extraction> {
    let cleaned = strip_code_fence(answer);
    let parsed = serde_json::from_str::<Value>(cleaned.trim())
        .ok()
        .or_else(|| {
            let fragment = first_json_fragment(answer)?;
            serde_json::from_str::<Value>(fragment).ok()
        })?;

    let commentary = parsed
        .get("commentary")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let Some(pano_id) = parsed
        .get("panoId")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|id| !id.is_empty())
    else {
        return commentary.map(Extraction::Commentary);
    };

    Some(Extraction::Navigate(NavigationDecision {
        pano_id: pano_id.to_string(),
        heading: parsed.get("heading").and_then(Value::as_f64).unwrap_or(0.0),
        commentary: commentary.unwrap_or_else(|| FALLBACK_COMMENTARY.to_string()),
    }))
}

/// Full extraction: final answer out of the stream, then a decision out of
/// the answer. Absent at either stage means absent overall; the raw answer
/// is still reachable through [`extract_final_answer`] for callers that want
/// to surface unparsed text.
pub fn extract_decision(payload: &str) -> Option<Extraction> {
    let answer = extract_final_answer(payload)?;
    decision_from_answer(&answer)
}

fn first_output(outputs: &Value, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| {
        outputs
            .get(*key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .map(str::to_string)
    })
}

fn strip_code_fence(answer: &str) -> &str {
    let trimmed = answer.trim();
    let body = if let Some(rest) = trimmed.strip_prefix("```json") {
        rest
    } else if let Some(rest) = trimmed.strip_prefix("```") {
        rest
    } else {
        return trimmed;
    };
    let body = body.trim_start();
    let body = body.trim_end();
    body.strip_suffix("```").map(str::trim_end).unwrap_or(body)
}

fn first_json_fragment(answer: &str) -> Option<&str> {
    let start = answer.find('{')?;
    let end = start + answer[start..].find('}')?;
    Some(&answer[start..=end])
}

#[cfg(test)]
mod tests {
    use super::{
        decision_from_answer, extract_decision, extract_final_answer, Extraction,
        NavigationDecision, FALLBACK_COMMENTARY,
    };

    fn sse_line(event: &str, outputs: serde_json::Value) -> String {
        format!(
            "data: {}",
            serde_json::json!({"event": event, "data": {"outputs": outputs}})
        )
    }

    #[test]
    fn first_qualifying_node_event_wins() {
        let payload = [
            "data: not-json".to_string(),
            sse_line("node_started", serde_json::json!({})),
            sse_line("node_finished", serde_json::json!({"answer": "first"})),
            sse_line("node_finished", serde_json::json!({"answer": "second"})),
        ]
        .join("\n");
        assert_eq!(extract_final_answer(&payload).as_deref(), Some("first"));
    }

    #[test]
    fn node_event_without_outputs_does_not_stop_the_scan() {
        let payload = [
            "data: {\"event\": \"node_finished\"}".to_string(),
            sse_line("node_finished", serde_json::json!({"text": ""})),
            sse_line("node_finished", serde_json::json!({"result": "from result"})),
        ]
        .join("\n");
        assert_eq!(
            extract_final_answer(&payload).as_deref(),
            Some("from result")
        );
    }

    #[test]
    fn workflow_finished_terminates_the_scan_even_when_empty() {
        let payload = [
            sse_line("workflow_finished", serde_json::json!({})),
            sse_line("node_finished", serde_json::json!({"answer": "too late"})),
        ]
        .join("\n");
        assert_eq!(extract_final_answer(&payload), None);

        let payload = [
            sse_line("workflow_finished", serde_json::json!({"text": "done"})),
            sse_line("node_finished", serde_json::json!({"answer": "too late"})),
        ]
        .join("\n");
        assert_eq!(extract_final_answer(&payload).as_deref(), Some("done"));
    }

    #[test]
    fn malformed_lines_are_skipped_not_fatal() {
        let payload = format!(
            "event: ping\ndata: {{broken\n\n{}",
            sse_line("node_finished", serde_json::json!({"answer": "ok"}))
        );
        assert_eq!(extract_final_answer(&payload).as_deref(), Some("ok"));
    }

    #[test]
    fn fenced_json_decision_parses_with_fallback_commentary() {
        let answer = "```json\n{\"panoId\":\"abc\",\"heading\":90}\n```";
        assert_eq!(
            decision_from_answer(answer),
            Some(Extraction::Navigate(NavigationDecision {
                pano_id: "abc".to_string(),
                heading: 90.0,
                commentary: FALLBACK_COMMENTARY.to_string(),
            }))
        );
    }

    #[test]
    fn bare_fence_without_language_tag_is_stripped() {
        let answer = "```\n{\"panoId\":\"xyz\",\"heading\":45,\"commentary\":\"turn here\"}\n```";
        assert_eq!(
            decision_from_answer(answer),
            Some(Extraction::Navigate(NavigationDecision {
                pano_id: "xyz".to_string(),
                heading: 45.0,
                commentary: "turn here".to_string(),
            }))
        );
    }

    #[test]
    fn brace_fragment_is_recovered_from_surrounding_prose() {
        let answer = "Let's head north. {\"panoId\":\"n1\",\"heading\":0} Onward!";
        assert!(matches!(
            decision_from_answer(answer),
            Some(Extraction::Navigate(decision)) if decision.pano_id == "n1"
        ));
    }

    #[test]
    fn text_without_json_yields_absent() {
        assert_eq!(decision_from_answer("just a lovely view"), None);
        assert_eq!(decision_from_answer(""), None);
    }

    #[test]
    fn commentary_only_object_yields_commentary_without_target() {
        assert_eq!(
            decision_from_answer("{\"commentary\":\"nice view\"}"),
            Some(Extraction::Commentary("nice view".to_string()))
        );
    }

    #[test]
    fn object_with_neither_target_nor_commentary_is_absent() {
        assert_eq!(decision_from_answer("{\"mood\":\"calm\"}"), None);
    }

    #[test]
    fn heading_defaults_to_zero() {
        let answer = "{\"panoId\":\"abc\",\"commentary\":\"go\"}";
        assert_eq!(
            decision_from_answer(answer),
            Some(Extraction::Navigate(NavigationDecision {
                pano_id: "abc".to_string(),
                heading: 0.0,
                commentary: "go".to_string(),
            }))
        );
    }

    #[test]
    fn extract_decision_runs_end_to_end_over_a_stream() {
        let answer = "```json\n{\"panoId\":\"abc\",\"heading\":90}\n```";
        let payload = sse_line("node_finished", serde_json::json!({"answer": answer}));
        assert!(matches!(
            extract_decision(&payload),
            Some(Extraction::Navigate(decision)) if decision.pano_id == "abc" && decision.heading == 90.0
        ));
    }

    #[test]
    fn stream_without_answer_yields_absent_decision() {
        assert_eq!(extract_decision("data: {\"event\": \"ping\"}"), None);
    }
}
