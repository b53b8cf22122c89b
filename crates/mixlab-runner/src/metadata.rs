//! Derives run metadata (time windows and links) from the event log.

use chrono::{DateTime, Duration as TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use mixlab_core::tree::{self, Segment, SetPolicy, TreePath};

use crate::error::RunError;
use crate::events::{self, parse_event_time};

/// Format the analyzer queries with.
pub const QUERY_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
/// Format substituted into link templates.
pub const URL_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

/// Places the timestamp of the last event matching `matcher` at `target`,
/// shifted by `delta_secs` in the stable view.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMatch {
    #[serde(rename = "match")]
    pub matcher: Value,
    pub target: String,
    #[serde(default)]
    pub delta_secs: i64,
}

impl EventMatch {
    pub fn tag(event: &str, target: &str, delta_secs: i64) -> Self {
        Self {
            matcher: json!({ "event": event }),
            target: target.to_string(),
            delta_secs,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkTemplate {
    pub name: String,
    /// Text with `{start}` and `{end}` placeholders.
    pub template: String,
    /// Interval supplying the placeholders: `stable`, `complete`, or any
    /// extracted interval path such as `messages`.
    #[serde(default = "default_link_interval")]
    pub interval: String,
}

fn default_link_interval() -> String {
    "stable".to_string()
}

fn default_events() -> Vec<EventMatch> {
    vec![
        EventMatch::tag(events::WAIT_FOR_CLEAR_FINISHED, "times.start", 0),
        EventMatch::tag(events::INTERNAL_RUN_FINISHED, "times.end", 0),
        EventMatch::tag(events::PUBLISHER_DEPLOY_START, "messages.start", 0),
        EventMatch::tag(events::PUBLISHER_MESSAGES_FINISHED, "messages.end", 0),
    ]
}

fn default_complete() -> String {
    "times".to_string()
}

fn default_stable() -> String {
    "messages".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataSpec {
    #[serde(default = "default_events")]
    pub events: Vec<EventMatch>,
    #[serde(default)]
    pub links: Vec<LinkTemplate>,
    /// Interval whose unshifted bounds form the complete window.
    #[serde(default = "default_complete")]
    pub complete: String,
    /// Interval whose shifted bounds form the stable window.
    #[serde(default = "default_stable")]
    pub stable: String,
}

impl Default for MetadataSpec {
    fn default() -> Self {
        Self {
            events: default_events(),
            links: Vec::new(),
            complete: default_complete(),
            stable: default_stable(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Interval {
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
}

impl Interval {
    fn bounds(&self) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        match (self.start, self.end) {
            (Some(start), Some(end)) if end > start => Some((start, end)),
            _ => None,
        }
    }

    fn shifted(&self, start_delta: i64, end_delta: i64) -> Self {
        Self {
            start: self.start.map(|t| t + TimeDelta::seconds(start_delta)),
            end: self.end.map(|t| t + TimeDelta::seconds(end_delta)),
        }
    }
}

/// Extracted timestamps, split into `start`/`end` pairs and single points.
#[derive(Debug, Default)]
struct Extracted {
    intervals: BTreeMap<String, (Interval, i64, i64)>,
    points: BTreeMap<String, (DateTime<Utc>, i64)>,
}

fn matches(event: &Value, matcher: &Value) -> bool {
    tree::partial_compare(event, matcher)
}

fn extract(events: &[Value], spec: &MetadataSpec) -> Result<Extracted, RunError> {
    let mut out = Extracted::default();
    for m in &spec.events {
        let Some(ts) = events
            .iter()
            .rev()
            .filter(|e| matches(e, &m.matcher))
            .find_map(|e| e.get("timestamp").and_then(Value::as_str))
        else {
            debug!(target_path = %m.target, "no event matched");
            continue;
        };
        let ts = parse_event_time(ts)?;
        let path = TreePath::from(m.target.as_str());
        let segments = path.segments();
        match segments.split_last() {
            Some((Segment::Key(last), parent)) if last == "start" || last == "end" => {
                let key = TreePath::from(parent.to_vec()).to_string();
                let entry = out.intervals.entry(key).or_default();
                if last == "start" {
                    entry.0.start = Some(ts);
                    entry.1 = m.delta_secs;
                } else {
                    entry.0.end = Some(ts);
                    entry.2 = m.delta_secs;
                }
            }
            _ => {
                out.points.insert(m.target.clone(), (ts, m.delta_secs));
            }
        }
    }
    Ok(out)
}

fn window(start: DateTime<Utc>, end: DateTime<Utc>, format: &str) -> Value {
    json!({
        "start": start.format(format).to_string(),
        "end": end.format(format).to_string(),
    })
}

fn put(tree: &mut Value, path: &str, value: Value) -> Result<(), RunError> {
    tree::set(
        tree,
        path,
        value,
        SetPolicy {
            replace_leaf: true,
            replace_nondict_stems: false,
        },
    )?;
    Ok(())
}

/// Time windows, points and links derived from `events`.
///
/// A tag that never occurred drops the interval it feeds; intervals whose
/// shifted end does not exceed their shifted start are dropped too.
pub fn extract_metadata(events: &[Value], spec: &MetadataSpec) -> Result<Value, RunError> {
    let extracted = extract(events, spec)?;
    let mut out = Value::Object(Map::new());
    let mut stable_views: BTreeMap<String, (DateTime<Utc>, DateTime<Utc>)> = BTreeMap::new();

    for (path, (interval, start_delta, end_delta)) in &extracted.intervals {
        let shifted = interval.shifted(*start_delta, *end_delta);
        match shifted.bounds() {
            Some((start, end)) => {
                put(&mut out, path, window(start, end, QUERY_TIME_FORMAT))?;
                stable_views.insert(path.clone(), (start, end));
            }
            None => debug!(interval = %path, "dropping incomplete or empty interval"),
        }
    }
    for (path, (ts, delta)) in &extracted.points {
        let ts = *ts + TimeDelta::seconds(*delta);
        put(
            &mut out,
            path,
            Value::String(ts.format(QUERY_TIME_FORMAT).to_string()),
        )?;
    }

    let complete = extracted
        .intervals
        .get(&spec.complete)
        .and_then(|(i, _, _)| i.bounds());
    if let Some((start, end)) = complete {
        put(&mut out, "complete", window(start, end, URL_TIME_FORMAT))?;
    }
    let stable = stable_views.get(&spec.stable).copied();
    if let Some((start, end)) = stable {
        put(&mut out, "stable", window(start, end, URL_TIME_FORMAT))?;
    }

    let mut links = Map::new();
    for link in &spec.links {
        let bounds = match link.interval.as_str() {
            "stable" => stable,
            "complete" => complete,
            other => stable_views.get(other).copied(),
        };
        let Some((start, end)) = bounds else {
            debug!(link = %link.name, interval = %link.interval, "no interval for link");
            continue;
        };
        let url = link
            .template
            .replace("{start}", &start.format(URL_TIME_FORMAT).to_string())
            .replace("{end}", &end.format(URL_TIME_FORMAT).to_string());
        links.insert(link.name.clone(), Value::String(url));
    }
    if !links.is_empty() {
        put(&mut out, "links", Value::Object(links))?;
    }
    Ok(out)
}

/// Sections of the run metadata that do not come from the event log.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetadataContext {
    pub experiment: Value,
    pub stack: Value,
    pub params: Value,
    pub metadata: Value,
}

/// The full run metadata: extracted windows plus the static sections.
pub fn build_run_metadata(
    events: &[Value],
    spec: &MetadataSpec,
    context: &MetadataContext,
) -> Result<Value, RunError> {
    let mut out = extract_metadata(events, spec)?;
    for (key, value) in [
        ("experiment", &context.experiment),
        ("stack", &context.stack),
        ("params", &context.params),
        ("metadata", &context.metadata),
    ] {
        let value = if value.is_null() {
            Value::Object(Map::new())
        } else {
            value.clone()
        };
        put(&mut out, key, value)?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tag: &str, ts: &str) -> Value {
        json!({ "timestamp": ts, "event": tag })
    }

    fn scenario_events() -> Vec<Value> {
        vec![
            event("run_start", "2024-05-01T09:59:58Z"),
            event("wait_for_clear_finished", "2024-05-01T10:00:00Z"),
            event("publisher_deploy_start", "2024-05-01T10:03:00Z"),
            event("publisher_messages_finished", "2024-05-01T10:10:00Z"),
            event("internal_run_finished", "2024-05-01T10:10:30Z"),
        ]
    }

    #[test]
    fn standard_windows_from_event_log() {
        let meta = extract_metadata(&scenario_events(), &MetadataSpec::default()).expect("meta");
        assert_eq!(meta["times"]["start"], "2024-05-01T10:00:00");
        assert_eq!(meta["times"]["end"], "2024-05-01T10:10:30");
        assert_eq!(meta["messages"]["start"], "2024-05-01T10:03:00");
        assert_eq!(meta["messages"]["end"], "2024-05-01T10:10:00");
        assert_eq!(meta["complete"]["start"], "2024-05-01T10:00:00.000Z");
        assert_eq!(meta["stable"]["end"], "2024-05-01T10:10:00.000Z");
    }

    #[test]
    fn deltas_shift_stable_window_only() {
        let mut spec = MetadataSpec::default();
        spec.events[2].delta_secs = 60;
        spec.events[3].delta_secs = -30;
        spec.events[1].delta_secs = 15;
        let meta = extract_metadata(&scenario_events(), &spec).expect("meta");
        assert_eq!(meta["messages"]["start"], "2024-05-01T10:04:00");
        assert_eq!(meta["messages"]["end"], "2024-05-01T10:09:30");
        assert_eq!(meta["complete"]["end"], "2024-05-01T10:10:30.000Z");
        assert_eq!(meta["times"]["end"], "2024-05-01T10:10:45");
    }

    #[test]
    fn missing_tag_and_inverted_interval_are_dropped() {
        let events: Vec<Value> = scenario_events()
            .into_iter()
            .filter(|e| e["event"] != "internal_run_finished")
            .collect();
        let mut spec = MetadataSpec::default();
        spec.events[2].delta_secs = 3600;
        let meta = extract_metadata(&events, &spec).expect("meta");
        assert!(meta.get("times").is_none());
        assert!(meta.get("messages").is_none());
        assert!(meta.get("complete").is_none());
        assert!(meta.get("stable").is_none());
    }

    #[test]
    fn last_matching_event_wins() {
        let mut events = scenario_events();
        events.push(event("publisher_messages_finished", "2024-05-01T10:12:00Z"));
        let meta = extract_metadata(&events, &MetadataSpec::default()).expect("meta");
        assert_eq!(meta["messages"]["end"], "2024-05-01T10:12:00");
    }

    #[test]
    fn custom_match_fields_and_links() {
        let mut events = scenario_events();
        events.push(json!({
            "timestamp": "2024-05-01T10:05:00Z",
            "event": "deployment",
            "phase": "finished",
            "service": "store",
        }));
        let mut spec = MetadataSpec::default();
        spec.events.push(EventMatch {
            matcher: json!({"event": "deployment", "phase": "finished", "service": "store"}),
            target: "store.ready".to_string(),
            delta_secs: 0,
        });
        spec.links.push(LinkTemplate {
            name: "grafana".to_string(),
            template: "https://grafana/d/x?from={start}&to={end}".to_string(),
            interval: "stable".to_string(),
        });
        let meta = extract_metadata(&events, &spec).expect("meta");
        assert_eq!(meta["store"]["ready"], "2024-05-01T10:05:00");
        assert_eq!(
            meta["links"]["grafana"],
            "https://grafana/d/x?from=2024-05-01T10:03:00.000Z&to=2024-05-01T10:10:00.000Z"
        );
    }

    #[test]
    fn full_metadata_carries_static_sections() {
        let context = MetadataContext {
            experiment: json!({"experiment_name": "regression", "experiment_class": "waku"}),
            stack: json!({"statefulsets": ["nodes"], "nodes_per_statefulset": [10]}),
            params: Value::Null,
            metadata: json!({"subdir": "regression/run_20240501_100000"}),
        };
        let meta = build_run_metadata(&scenario_events(), &MetadataSpec::default(), &context)
            .expect("meta");
        assert_eq!(meta["experiment"]["experiment_class"], "waku");
        assert_eq!(meta["stack"]["nodes_per_statefulset"][0], 10);
        assert_eq!(meta["params"], json!({}));
        assert_eq!(meta["times"]["start"], "2024-05-01T10:00:00");
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: MetadataSpec = serde_json::from_value(json!({
            "links": [{"name": "logs", "template": "{start}/{end}"}]
        }))
        .expect("spec");
        assert_eq!(spec.events.len(), 4);
        assert_eq!(spec.links[0].interval, "stable");
    }
}
