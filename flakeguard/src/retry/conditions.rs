//! Retry conditions and time windows
//!
//! A policy's conditions are ANDed: every condition must match for the
//! policy to apply. Missing subjects (no error text, no context key) never
//! match.
//!
//! Time windows use UTC `HH:MM` bounds; a window whose end is before its
//! start wraps past midnight (`22:00-06:00`).

use std::collections::HashMap;
use std::sync::{OnceLock, RwLock};

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What a condition inspects
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionKind {
    /// Error text of the failure
    ErrorPattern,
    /// Test name
    TestPattern,
    /// Current UTC time of day (`HH:MM`)
    TimeWindow,
    /// Failure rate of the test's flaky pattern
    FailureRate,
    /// `environment` context entry (or the entry named by `field`)
    Environment,
    /// Context entry named by `field`
    Custom,
}

impl std::fmt::Display for ConditionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ErrorPattern => write!(f, "error_pattern"),
            Self::TestPattern => write!(f, "test_pattern"),
            Self::TimeWindow => write!(f, "time_window"),
            Self::FailureRate => write!(f, "failure_rate"),
            Self::Environment => write!(f, "environment"),
            Self::Custom => write!(f, "custom"),
        }
    }
}

/// Comparison applied to the subject
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    Contains,
    Regex,
    #[serde(rename = ">", alias = "greater_than")]
    GreaterThan,
    #[serde(rename = "<", alias = "less_than")]
    LessThan,
    /// Inclusive; value is `[low, high]`
    Between,
}

impl std::fmt::Display for ConditionOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Equals => write!(f, "equals"),
            Self::Contains => write!(f, "contains"),
            Self::Regex => write!(f, "regex"),
            Self::GreaterThan => write!(f, ">"),
            Self::LessThan => write!(f, "<"),
            Self::Between => write!(f, "between"),
        }
    }
}

/// One condition of a retry policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryCondition {
    #[serde(rename = "type")]
    pub kind: ConditionKind,
    pub operator: ConditionOperator,
    pub value: Value,
    /// Context key for `custom` and `environment`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
}

impl RetryCondition {
    pub fn new(kind: ConditionKind, operator: ConditionOperator, value: Value) -> Self {
        Self {
            kind,
            operator,
            value,
            field: None,
        }
    }

    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }

    /// Static problems: uncompilable regex, malformed bounds
    pub fn problems(&self) -> Vec<String> {
        let mut problems = Vec::new();
        match self.operator {
            ConditionOperator::Regex => match self.value.as_str() {
                Some(pattern) => {
                    if let Err(e) = Regex::new(pattern) {
                        problems.push(format!("{} regex does not compile: {}", self.kind, e));
                    }
                }
                None => problems.push(format!("{} regex value must be a string", self.kind)),
            },
            ConditionOperator::Between => {
                if bounds(&self.value).is_none() {
                    problems.push(format!(
                        "{} between value must be a two-element array",
                        self.kind
                    ));
                }
            }
            _ => {}
        }
        if self.kind == ConditionKind::TimeWindow {
            for v in as_values(&self.value) {
                if v.as_str().and_then(parse_hhmm).is_none() {
                    problems.push(format!("time_window value {} is not HH:MM", v));
                }
            }
        }
        if self.kind == ConditionKind::Custom && self.field.is_none() {
            problems.push("custom condition requires a field".to_string());
        }
        problems
    }

    /// Whether the condition holds for a retry request
    pub fn matches(&self, ctx: &ConditionContext<'_>) -> bool {
        let subject = match self.kind {
            ConditionKind::ErrorPattern => ctx.error_text.map(|e| Subject::Text(e.to_string())),
            ConditionKind::TestPattern => Some(Subject::Text(ctx.test_name.to_string())),
            ConditionKind::TimeWindow => {
                return time_condition_matches(self.operator, &self.value, ctx.now)
            }
            ConditionKind::FailureRate => ctx.failure_rate.map(Subject::Number),
            ConditionKind::Environment => ctx
                .context
                .get(self.field.as_deref().unwrap_or("environment"))
                .and_then(Subject::from_value),
            ConditionKind::Custom => self
                .field
                .as_deref()
                .and_then(|f| ctx.context.get(f))
                .and_then(Subject::from_value),
        };
        match subject {
            Some(subject) => subject.compare(self.operator, &self.value),
            None => false,
        }
    }
}

/// Inputs a condition may read
#[derive(Debug, Clone)]
pub struct ConditionContext<'a> {
    pub test_name: &'a str,
    pub error_text: Option<&'a str>,
    pub failure_rate: Option<f64>,
    pub context: &'a HashMap<String, Value>,
    pub now: DateTime<Utc>,
}

/// First condition that does not match, if any
pub fn first_unmatched<'c>(
    conditions: &'c [RetryCondition],
    ctx: &ConditionContext<'_>,
) -> Option<&'c RetryCondition> {
    conditions.iter().find(|c| !c.matches(ctx))
}

enum Subject {
    Text(String),
    Number(f64),
}

impl Subject {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => Some(Self::Text(s.clone())),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::Bool(b) => Some(Self::Text(b.to_string())),
            _ => None,
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    fn as_text(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Number(n) => n.to_string(),
        }
    }

    fn compare(&self, op: ConditionOperator, value: &Value) -> bool {
        match op {
            ConditionOperator::Equals => match (self, value) {
                (_, Value::Number(n)) => self.as_number() == n.as_f64(),
                (_, other) => value_text(other).is_some_and(|v| self.as_text() == v),
            },
            ConditionOperator::Contains => {
                value_text(value).is_some_and(|v| self.as_text().contains(&v))
            }
            ConditionOperator::Regex => value
                .as_str()
                .and_then(compiled)
                .is_some_and(|re| re.is_match(&self.as_text())),
            ConditionOperator::GreaterThan => {
                matches!((self.as_number(), value_number(value)), (Some(s), Some(v)) if s > v)
            }
            ConditionOperator::LessThan => {
                matches!((self.as_number(), value_number(value)), (Some(s), Some(v)) if s < v)
            }
            ConditionOperator::Between => match (self.as_number(), bounds(value)) {
                (Some(s), Some((lo, hi))) => {
                    match (value_number(lo), value_number(hi)) {
                        (Some(lo), Some(hi)) => lo <= s && s <= hi,
                        _ => false,
                    }
                }
                _ => false,
            },
        }
    }
}

/// Compiled condition regexes, keyed by source; invalid patterns cache as `None`
type RegexCache = RwLock<HashMap<String, Option<Regex>>>;

const REGEX_CACHE_CAPACITY: usize = 256;

fn regex_cache() -> &'static RegexCache {
    static CACHE: OnceLock<RegexCache> = OnceLock::new();
    CACHE.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Compile `pattern` once per process
fn compiled(pattern: &str) -> Option<Regex> {
    let cache = regex_cache();
    if let Ok(map) = cache.read() {
        if let Some(entry) = map.get(pattern) {
            return entry.clone();
        }
    }
    let regex = Regex::new(pattern).ok();
    if let Ok(mut map) = cache.write() {
        if map.len() >= REGEX_CACHE_CAPACITY {
            map.clear();
        }
        map.insert(pattern.to_string(), regex.clone());
    }
    regex
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn bounds(value: &Value) -> Option<(&Value, &Value)> {
    match value.as_array().map(Vec::as_slice) {
        Some([lo, hi]) => Some((lo, hi)),
        _ => None,
    }
}

fn as_values(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

// ── Time of day ──

/// Minutes since midnight for `HH:MM`
pub fn parse_hhmm(s: &str) -> Option<u32> {
    let (h, m) = s.trim().split_once(':')?;
    if h.is_empty() || h.len() > 2 || m.len() != 2 {
        return None;
    }
    let (h, m): (u32, u32) = (h.parse().ok()?, m.parse().ok()?);
    (h < 24 && m < 60).then_some(h * 60 + m)
}

fn minute_of_day(now: DateTime<Utc>) -> u32 {
    now.hour() * 60 + now.minute()
}

/// Whether `minute` falls in `[start, end)`, wrapping past midnight when `end < start`
fn in_range(minute: u32, start: u32, end: u32) -> bool {
    if start <= end {
        start <= minute && minute < end
    } else {
        minute >= start || minute < end
    }
}

fn time_condition_matches(op: ConditionOperator, value: &Value, now: DateTime<Utc>) -> bool {
    let minute = minute_of_day(now);
    let parse = |v: &Value| v.as_str().and_then(parse_hhmm);
    match op {
        ConditionOperator::Between => match bounds(value) {
            Some((lo, hi)) => match (parse(lo), parse(hi)) {
                (Some(start), Some(end)) => in_range(minute, start, end),
                _ => false,
            },
            None => false,
        },
        ConditionOperator::GreaterThan => parse(value).is_some_and(|v| minute > v),
        ConditionOperator::LessThan => parse(value).is_some_and(|v| minute < v),
        ConditionOperator::Equals => parse(value).is_some_and(|v| minute == v),
        ConditionOperator::Contains | ConditionOperator::Regex => false,
    }
}

/// Effect of a time window on retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowAction {
    /// Retries only inside allow windows
    #[default]
    Allow,
    /// No retries inside deny windows
    Deny,
}

/// A daily `HH:MM-HH:MM` window, optionally limited to some weekdays
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: String,
    pub end: String,
    /// Empty means every day
    #[serde(default)]
    pub days: Vec<Weekday>,
    #[serde(default)]
    pub action: WindowAction,
}

impl TimeWindow {
    pub fn new(start: impl Into<String>, end: impl Into<String>, action: WindowAction) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
            days: Vec::new(),
            action,
        }
    }

    pub fn on_days(mut self, days: Vec<Weekday>) -> Self {
        self.days = days;
        self
    }

    pub fn problems(&self) -> Vec<String> {
        [("start", &self.start), ("end", &self.end)]
            .into_iter()
            .filter(|(_, v)| parse_hhmm(v).is_none())
            .map(|(name, v)| format!("time window {} '{}' is not HH:MM", name, v))
            .collect()
    }

    /// Whether `now` falls inside the window.
    ///
    /// For a window wrapping midnight, the part after midnight belongs to
    /// the day the window started.
    pub fn contains(&self, now: DateTime<Utc>) -> bool {
        let (Some(start), Some(end)) = (parse_hhmm(&self.start), parse_hhmm(&self.end)) else {
            return false;
        };
        let minute = minute_of_day(now);
        if !in_range(minute, start, end) {
            return false;
        }
        if self.days.is_empty() {
            return true;
        }
        let wrapped = start > end && minute < end;
        let day = if wrapped {
            now.weekday().pred()
        } else {
            now.weekday()
        };
        self.days.contains(&day)
    }
}

/// Check a policy's windows: inside no deny window, and inside an allow
/// window when any exist. `Err` carries the denial reason.
pub fn window_permits(windows: &[TimeWindow], now: DateTime<Utc>) -> Result<(), String> {
    if let Some(deny) = windows
        .iter()
        .find(|w| w.action == WindowAction::Deny && w.contains(now))
    {
        return Err(format!(
            "Inside retry blackout window {}-{}",
            deny.start, deny.end
        ));
    }
    let mut allows = windows
        .iter()
        .filter(|w| w.action == WindowAction::Allow)
        .peekable();
    if allows.peek().is_none() {
        return Ok(());
    }
    if allows.any(|w| w.contains(now)) {
        Ok(())
    } else {
        Err("Outside allowed retry time windows".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        // 2026-03-04 is a Wednesday
        Utc.with_ymd_and_hms(2026, 3, 4, h, m, 0).unwrap()
    }

    fn ctx<'a>(
        error: Option<&'a str>,
        context: &'a HashMap<String, Value>,
        now: DateTime<Utc>,
    ) -> ConditionContext<'a> {
        ConditionContext {
            test_name: "test_checkout_flow",
            error_text: error,
            failure_rate: Some(0.35),
            context,
            now,
        }
    }

    #[test]
    fn test_error_pattern_operators() {
        let empty = HashMap::new();
        let c = ctx(Some("Connection reset by peer"), &empty, at(12, 0));
        let contains = RetryCondition::new(
            ConditionKind::ErrorPattern,
            ConditionOperator::Contains,
            json!("reset"),
        );
        assert!(contains.matches(&c));
        let regex = RetryCondition::new(
            ConditionKind::ErrorPattern,
            ConditionOperator::Regex,
            json!("(?i)^connection"),
        );
        assert!(regex.matches(&c));
        let equals = RetryCondition::new(
            ConditionKind::ErrorPattern,
            ConditionOperator::Equals,
            json!("timeout"),
        );
        assert!(!equals.matches(&c));

        let no_error = ctx(None, &empty, at(12, 0));
        assert!(!contains.matches(&no_error));
    }

    #[test]
    fn test_regex_compiled_once_per_pattern() {
        let pattern = "^ETIMEDOUT after [0-9]+ms$";
        let first = compiled(pattern).unwrap();
        assert!(regex_cache().read().unwrap().contains_key(pattern));
        let second = compiled(pattern).unwrap();
        assert_eq!(first.as_str(), second.as_str());
        assert!(second.is_match("ETIMEDOUT after 3000ms"));

        assert!(compiled("(unclosed").is_none());
        assert!(matches!(regex_cache().read().unwrap().get("(unclosed"), Some(None)));
    }

    #[test]
    fn test_numeric_operators_on_failure_rate() {
        let empty = HashMap::new();
        let c = ctx(None, &empty, at(12, 0));
        let gt: RetryCondition = serde_json::from_value(json!({
            "type": "failure_rate", "operator": ">", "value": 0.3
        }))
        .unwrap();
        assert!(gt.matches(&c));
        let lt: RetryCondition = serde_json::from_value(json!({
            "type": "failure_rate", "operator": "less_than", "value": 0.3
        }))
        .unwrap();
        assert!(!lt.matches(&c));
        let between = RetryCondition::new(
            ConditionKind::FailureRate,
            ConditionOperator::Between,
            json!([0.2, 0.5]),
        );
        assert!(between.matches(&c));
    }

    #[test]
    fn test_environment_and_custom_fields() {
        let mut context = HashMap::new();
        context.insert("environment".to_string(), json!("staging"));
        context.insert("runner_cores".to_string(), json!(8));
        let c = ctx(None, &context, at(12, 0));

        let env = RetryCondition::new(
            ConditionKind::Environment,
            ConditionOperator::Equals,
            json!("staging"),
        );
        assert!(env.matches(&c));
        let custom = RetryCondition::new(
            ConditionKind::Custom,
            ConditionOperator::GreaterThan,
            json!(4),
        )
        .with_field("runner_cores");
        assert!(custom.matches(&c));
        let missing = RetryCondition::new(
            ConditionKind::Custom,
            ConditionOperator::Equals,
            json!("x"),
        )
        .with_field("absent");
        assert!(!missing.matches(&c));
    }

    #[test]
    fn test_time_window_condition_wraps_midnight() {
        let empty = HashMap::new();
        let night = RetryCondition::new(
            ConditionKind::TimeWindow,
            ConditionOperator::Between,
            json!(["22:00", "06:00"]),
        );
        assert!(night.matches(&ctx(None, &empty, at(23, 30))));
        assert!(night.matches(&ctx(None, &empty, at(5, 59))));
        assert!(!night.matches(&ctx(None, &empty, at(6, 0))));
        assert!(!night.matches(&ctx(None, &empty, at(12, 0))));
    }

    #[test]
    fn test_problems() {
        let bad_regex = RetryCondition::new(
            ConditionKind::ErrorPattern,
            ConditionOperator::Regex,
            json!("(unclosed"),
        );
        assert_eq!(bad_regex.problems().len(), 1);
        let bad_time = RetryCondition::new(
            ConditionKind::TimeWindow,
            ConditionOperator::Between,
            json!(["9am", "17:00"]),
        );
        assert_eq!(bad_time.problems().len(), 1);
        let custom = RetryCondition::new(ConditionKind::Custom, ConditionOperator::Equals, json!(1));
        assert_eq!(custom.problems().len(), 1);
    }

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(parse_hhmm("00:00"), Some(0));
        assert_eq!(parse_hhmm("9:05"), Some(545));
        assert_eq!(parse_hhmm("23:59"), Some(1439));
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("12:5"), None);
        assert_eq!(parse_hhmm("noon"), None);
    }

    #[test]
    fn test_window_permits() {
        let business = TimeWindow::new("09:00", "17:00", WindowAction::Allow);
        assert!(window_permits(&[business.clone()], at(10, 0)).is_ok());
        assert!(window_permits(&[business.clone()], at(18, 0)).is_err());

        let blackout = TimeWindow::new("12:00", "13:00", WindowAction::Deny);
        let both = [business, blackout];
        let err = window_permits(&both, at(12, 30)).unwrap_err();
        assert!(err.contains("blackout"));
        assert!(window_permits(&[], at(3, 0)).is_ok());
    }

    #[test]
    fn test_window_days_use_start_day_after_midnight() {
        let tuesday_night =
            TimeWindow::new("22:00", "02:00", WindowAction::Allow).on_days(vec![Weekday::Tue]);
        // Wednesday 01:00 belongs to Tuesday's window
        assert!(tuesday_night.contains(at(1, 0)));
        // Wednesday 23:00 starts Wednesday's window
        assert!(!tuesday_night.contains(at(23, 0)));
    }
}
