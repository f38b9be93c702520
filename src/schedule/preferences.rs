//! Availability window resolution.
//!
//! Stored preferences are a versioned JSON document owned by the user
//! profile. This module parses that document and resolves it into a
//! canonical [`SchedulePreferences`], recovering from any malformed part
//! with defaults and a logged warning. Nothing here is ever fatal.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{NaiveTime, Timelike};
use chrono_tz::Tz;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use tracing::warn;

use crate::civil;

/// Current preferences document version.
pub const PREFERENCES_VERSION: u32 = 1;

static TIME_OF_DAY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{1,2}):(\d{2})(?::(\d{2}))?$").expect("static regex is valid")
});

// ── Time of day ─────────────────────────────────────────────────────

/// A local wall-clock time with minute precision.
///
/// Ordering is identical to comparing zero-padded `"HH:mm"` strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LocalTime {
    hour: u8,
    minute: u8,
}

impl LocalTime {
    pub fn new(hour: u32, minute: u32) -> Option<Self> {
        (hour < 24 && minute < 60).then_some(Self {
            hour: hour as u8,
            minute: minute as u8,
        })
    }

    pub fn hour(&self) -> u32 {
        self.hour as u32
    }

    pub fn minute(&self) -> u32 {
        self.minute as u32
    }

    /// Truncates seconds.
    pub fn from_naive(time: NaiveTime) -> Self {
        Self {
            hour: time.hour() as u8,
            minute: time.minute() as u8,
        }
    }

    pub fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour(), self.minute(), 0).unwrap_or_default()
    }
}

impl fmt::Display for LocalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

impl FromStr for LocalTime {
    type Err = String;

    /// Accepts `H:mm`, `HH:mm` and `HH:mm:ss`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let caps = TIME_OF_DAY
            .captures(s.trim())
            .ok_or_else(|| format!("invalid time of day '{s}'"))?;
        let hour: u32 = caps[1].parse().map_err(|_| format!("invalid hour in '{s}'"))?;
        let minute: u32 = caps[2].parse().map_err(|_| format!("invalid minute in '{s}'"))?;
        if let Some(sec) = caps.get(3) {
            let sec: u32 = sec.as_str().parse().unwrap_or(60);
            if sec >= 60 {
                return Err(format!("invalid second in '{s}'"));
            }
        }
        LocalTime::new(hour, minute).ok_or_else(|| format!("time of day out of range '{s}'"))
    }
}

impl Serialize for LocalTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LocalTime {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ── Windows and DND ─────────────────────────────────────────────────

/// Named scheduling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowSlot {
    Morning,
    Midday,
    Evening,
}

impl WindowSlot {
    pub const ALL: [WindowSlot; 3] = [WindowSlot::Morning, WindowSlot::Midday, WindowSlot::Evening];

    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSlot::Morning => "morning",
            WindowSlot::Midday => "midday",
            WindowSlot::Evening => "evening",
        }
    }

    /// Window applied when the slot is absent from the stored document.
    pub fn default_window(&self) -> Option<TimeWindow> {
        match self {
            WindowSlot::Morning => TimeWindow::from_hm((7, 0), (9, 0)),
            WindowSlot::Midday => None,
            WindowSlot::Evening => TimeWindow::from_hm((18, 0), (20, 0)),
        }
    }
}

impl fmt::Display for WindowSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowSlot {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "morning" => Ok(WindowSlot::Morning),
            "midday" | "noon" | "afternoon" => Ok(WindowSlot::Midday),
            "evening" | "night" => Ok(WindowSlot::Evening),
            other => Err(format!("unknown window slot: {other}")),
        }
    }
}

/// A local time-of-day interval during which a task may be scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: LocalTime,
    pub end: LocalTime,
}

impl TimeWindow {
    fn from_hm(start: (u32, u32), end: (u32, u32)) -> Option<Self> {
        Some(Self {
            start: LocalTime::new(start.0, start.1)?,
            end: LocalTime::new(end.0, end.1)?,
        })
    }
}

/// A local time-of-day interval during which nothing may be scheduled.
///
/// Half-open: `start` is inside, `end` is not. A range whose start is after
/// its end wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DndRange {
    pub start: LocalTime,
    pub end: LocalTime,
}

impl DndRange {
    pub fn new(start: LocalTime, end: LocalTime) -> Self {
        Self { start, end }
    }

    pub fn wraps_midnight(&self) -> bool {
        self.start > self.end
    }

    pub fn contains(&self, time: LocalTime) -> bool {
        if self.wraps_midnight() {
            time >= self.start || time < self.end
        } else {
            time >= self.start && time < self.end
        }
    }
}

/// Resolved windows, one optional interval per slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Windows {
    pub morning: Option<TimeWindow>,
    pub midday: Option<TimeWindow>,
    pub evening: Option<TimeWindow>,
}

impl Windows {
    pub fn get(&self, slot: WindowSlot) -> Option<&TimeWindow> {
        match slot {
            WindowSlot::Morning => self.morning.as_ref(),
            WindowSlot::Midday => self.midday.as_ref(),
            WindowSlot::Evening => self.evening.as_ref(),
        }
    }

    fn set(&mut self, slot: WindowSlot, window: Option<TimeWindow>) {
        match slot {
            WindowSlot::Morning => self.morning = window,
            WindowSlot::Midday => self.midday = window,
            WindowSlot::Evening => self.evening = window,
        }
    }
}

/// Canonical, defaulted schedule preferences.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchedulePreferences {
    pub timezone: Tz,
    pub windows: Windows,
    pub dnd_ranges: Vec<DndRange>,
}

impl Default for SchedulePreferences {
    fn default() -> Self {
        let mut windows = Windows::default();
        for slot in WindowSlot::ALL {
            windows.set(slot, slot.default_window());
        }
        Self {
            timezone: Tz::UTC,
            windows,
            dnd_ranges: Vec::new(),
        }
    }
}

impl SchedulePreferences {
    /// Whether a local time falls inside any DND range.
    pub fn in_dnd(&self, time: LocalTime) -> bool {
        self.dnd_ranges.iter().any(|r| r.contains(time))
    }
}

// ── Stored document ─────────────────────────────────────────────────

/// A `{start, end}` pair as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDocument {
    pub start: String,
    pub end: String,
}

impl RangeDocument {
    pub fn new(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            start: start.into(),
            end: end.into(),
        }
    }
}

/// Per-slot window settings as stored.
///
/// Each slot is tri-state: key absent (unset, gets the default), explicit
/// `null` (not configured, never scheduled), or a range.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowsDocument {
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub morning: Option<Option<serde_json::Value>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub midday: Option<Option<serde_json::Value>>,
    #[serde(default, deserialize_with = "present", skip_serializing_if = "Option::is_none")]
    pub evening: Option<Option<serde_json::Value>>,
}

impl WindowsDocument {
    fn slot(&self, slot: WindowSlot) -> &Option<Option<serde_json::Value>> {
        match slot {
            WindowSlot::Morning => &self.morning,
            WindowSlot::Midday => &self.midday,
            WindowSlot::Evening => &self.evening,
        }
    }

    /// Builder: configure a slot.
    pub fn with(mut self, slot: WindowSlot, range: RangeDocument) -> Self {
        let value = serde_json::to_value(range).ok();
        self.set_raw(slot, Some(value));
        self
    }

    /// Builder: explicitly disable a slot.
    pub fn without(mut self, slot: WindowSlot) -> Self {
        self.set_raw(slot, Some(None));
        self
    }

    fn set_raw(&mut self, slot: WindowSlot, value: Option<Option<serde_json::Value>>) {
        match slot {
            WindowSlot::Morning => self.morning = value,
            WindowSlot::Midday => self.midday = value,
            WindowSlot::Evening => self.evening = value,
        }
    }
}

/// Distinguishes an explicit `null` from an absent key.
fn present<'de, D>(deserializer: D) -> Result<Option<Option<serde_json::Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<serde_json::Value>::deserialize(deserializer).map(Some)
}

/// Versioned preferences document, the stored form of [`SchedulePreferences`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferencesDocument {
    #[serde(default)]
    pub version: Option<u32>,
    #[serde(default)]
    pub timezone: Option<String>,
    #[serde(default)]
    pub windows: Option<WindowsDocument>,
    #[serde(default, alias = "dnd_ranges", alias = "dnd")]
    pub dnd_ranges: Vec<serde_json::Value>,
}

impl PreferencesDocument {
    pub fn new(timezone: impl Into<String>) -> Self {
        Self {
            version: Some(PREFERENCES_VERSION),
            timezone: Some(timezone.into()),
            windows: None,
            dnd_ranges: Vec::new(),
        }
    }

    pub fn with_windows(mut self, windows: WindowsDocument) -> Self {
        self.windows = Some(windows);
        self
    }

    pub fn with_dnd(mut self, start: &str, end: &str) -> Self {
        if let Ok(v) = serde_json::to_value(RangeDocument::new(start, end)) {
            self.dnd_ranges.push(v);
        }
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Resolve stored preferences, recovering from every malformed part.
pub fn resolve_preferences(raw: Option<&str>) -> SchedulePreferences {
    resolve_with_warnings(raw).0
}

/// Like [`resolve_preferences`], also returning the recovered problems.
pub fn resolve_with_warnings(raw: Option<&str>) -> (SchedulePreferences, Vec<String>) {
    let mut warnings = Vec::new();
    let doc = match raw.map(str::trim) {
        None | Some("") | Some("null") => PreferencesDocument::default(),
        Some(text) => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(value) => lenient_document(value, &mut warnings),
            Err(e) => {
                warnings.push(format!("unparsable preferences document: {e}"));
                PreferencesDocument::default()
            }
        },
    };
    let prefs = resolve_document(&doc, &mut warnings);
    for w in &warnings {
        warn!(problem = %w, "Recovered malformed schedule preferences");
    }
    (prefs, warnings)
}

/// Pull each top-level field out on its own, so a wrong-typed field only
/// loses itself.
fn lenient_document(value: serde_json::Value, warnings: &mut Vec<String>) -> PreferencesDocument {
    let serde_json::Value::Object(mut map) = value else {
        warnings.push("preferences document is not an object".to_string());
        return PreferencesDocument::default();
    };
    let mut doc = PreferencesDocument::default();

    if let Some(value) = map.remove("version") {
        match serde_json::from_value::<Option<u32>>(value) {
            Ok(version) => doc.version = version,
            Err(e) => warnings.push(format!("version: {e}; ignored")),
        }
    }

    if let Some(value) = map.remove("timezone") {
        match serde_json::from_value::<Option<String>>(value) {
            Ok(timezone) => doc.timezone = timezone,
            Err(e) => warnings.push(format!("timezone: {e}; using UTC")),
        }
    }

    match map.remove("windows") {
        None | Some(serde_json::Value::Null) => {}
        Some(value @ serde_json::Value::Object(_)) => match serde_json::from_value(value) {
            Ok(windows) => doc.windows = Some(windows),
            Err(e) => warnings.push(format!("windows: {e}; using defaults")),
        },
        Some(_) => warnings.push("windows: expected an object; using defaults".to_string()),
    }

    let dnd = ["dndRanges", "dnd_ranges", "dnd"]
        .iter()
        .find_map(|key| map.remove(*key));
    match dnd {
        None | Some(serde_json::Value::Null) => {}
        Some(serde_json::Value::Array(ranges)) => doc.dnd_ranges = ranges,
        Some(_) => warnings.push("dnd ranges: expected a list; dropped".to_string()),
    }

    doc
}

fn resolve_document(doc: &PreferencesDocument, warnings: &mut Vec<String>) -> SchedulePreferences {
    if let Some(v) = doc.version.filter(|v| *v > PREFERENCES_VERSION) {
        warnings.push(format!("preferences version {v} is newer than {PREFERENCES_VERSION}"));
    }

    let timezone = match doc.timezone.as_deref() {
        None => Tz::UTC,
        Some(name) => civil::parse_tz(name).unwrap_or_else(|| {
            warnings.push(format!("unknown timezone '{name}', using UTC"));
            Tz::UTC
        }),
    };

    let empty = WindowsDocument::default();
    let windows_doc = doc.windows.as_ref().unwrap_or(&empty);
    let mut windows = Windows::default();
    for slot in WindowSlot::ALL {
        let window = match windows_doc.slot(slot) {
            None => slot.default_window(),
            Some(None) => None,
            Some(Some(value)) => match parse_range(value) {
                Ok(bounds) => bounds.map(|(start, end)| TimeWindow { start, end }),
                Err(e) => {
                    warnings.push(format!("{slot} window: {e}; using default"));
                    slot.default_window()
                }
            },
        };
        windows.set(slot, window);
    }

    let mut dnd_ranges = Vec::with_capacity(doc.dnd_ranges.len());
    for (i, value) in doc.dnd_ranges.iter().enumerate() {
        match parse_range(value) {
            Ok(Some((start, end))) => dnd_ranges.push(DndRange::new(start, end)),
            Ok(None) => {}
            Err(e) => warnings.push(format!("dnd range #{i}: {e}; dropped")),
        }
    }

    SchedulePreferences {
        timezone,
        windows,
        dnd_ranges,
    }
}

type Bounds = Option<(LocalTime, LocalTime)>;

/// `Ok(None)` for a JSON null inside a list, `Err` for anything malformed.
fn parse_range(value: &serde_json::Value) -> Result<Bounds, String> {
    if value.is_null() {
        return Ok(None);
    }
    let range: RangeDocument =
        serde_json::from_value(value.clone()).map_err(|e| format!("malformed range ({e})"))?;
    let start: LocalTime = range.start.parse()?;
    let end: LocalTime = range.end.parse()?;
    Ok(Some((start, end)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> LocalTime {
        s.parse().unwrap()
    }

    #[test]
    fn local_time_parses_and_pads() {
        assert_eq!(t("7:05").to_string(), "07:05");
        assert_eq!(t("07:05:30").to_string(), "07:05");
        assert!("24:00".parse::<LocalTime>().is_err());
        assert!("12:60".parse::<LocalTime>().is_err());
        assert!("noon".parse::<LocalTime>().is_err());
    }

    #[test]
    fn local_time_orders_like_padded_strings() {
        let mut times = vec![t("9:00"), t("10:00"), t("07:30"), t("23:59"), t("0:00")];
        times.sort();
        let rendered: Vec<String> = times.iter().map(|x| x.to_string()).collect();
        let mut strings = rendered.clone();
        strings.sort();
        assert_eq!(rendered, strings);
    }

    #[test]
    fn dnd_wrapping_midnight_uses_or() {
        let range = DndRange::new(t("22:00"), t("06:00"));
        assert!(range.wraps_midnight());
        assert!(range.contains(t("22:00")));
        assert!(range.contains(t("23:30")));
        assert!(range.contains(t("00:00")));
        assert!(range.contains(t("05:59")));
        assert!(!range.contains(t("06:00")));
        assert!(!range.contains(t("21:30")));
        assert!(!range.contains(t("12:00")));
    }

    #[test]
    fn dnd_same_day_uses_and() {
        let range = DndRange::new(t("12:00"), t("13:00"));
        assert!(range.contains(t("12:30")));
        assert!(!range.contains(t("11:59")));
        assert!(!range.contains(t("13:00")));
        // Degenerate range matches nothing.
        assert!(!DndRange::new(t("08:00"), t("08:00")).contains(t("08:00")));
    }

    #[test]
    fn missing_preferences_get_defaults() {
        let (prefs, warnings) = resolve_with_warnings(None);
        assert!(warnings.is_empty());
        assert_eq!(prefs.timezone, Tz::UTC);
        assert_eq!(prefs.windows.morning.unwrap().start, t("07:00"));
        assert_eq!(prefs.windows.morning.unwrap().end, t("09:00"));
        assert!(prefs.windows.midday.is_none());
        assert_eq!(prefs.windows.evening.unwrap().start, t("18:00"));
        assert!(prefs.dnd_ranges.is_empty());
    }

    #[test]
    fn garbage_document_recovers_with_warning() {
        let (prefs, warnings) = resolve_with_warnings(Some("{not json"));
        assert_eq!(warnings.len(), 1);
        assert_eq!(prefs, SchedulePreferences::default());

        let (prefs, warnings) = resolve_with_warnings(Some(r#"{"windows": "morning please"}"#));
        assert!(!warnings.is_empty());
        assert!(prefs.windows.morning.is_some());
    }

    #[test]
    fn explicit_null_disables_slot_but_absent_defaults() {
        let doc = PreferencesDocument::new("Europe/Berlin").with_windows(
            WindowsDocument::default()
                .without(WindowSlot::Morning)
                .with(WindowSlot::Midday, RangeDocument::new("12:00", "13:00")),
        );
        let prefs = resolve_preferences(Some(&doc.to_json()));
        assert_eq!(prefs.timezone, chrono_tz::Europe::Berlin);
        assert!(prefs.windows.morning.is_none());
        assert_eq!(prefs.windows.midday.unwrap().start, t("12:00"));
        // Evening key absent -> default.
        assert_eq!(prefs.windows.evening.unwrap().start, t("18:00"));
    }

    #[test]
    fn malformed_pieces_are_recovered_individually() {
        let raw = r#"{
            "version": 1,
            "timezone": "Nowhere/Special",
            "windows": {"morning": {"start": "25:00", "end": "09:00"}, "midday": {"start": "11:30", "end": "12:30"}},
            "dndRanges": [{"start": "22:00", "end": "06:00"}, {"start": "oops"}, null]
        }"#;
        let (prefs, warnings) = resolve_with_warnings(Some(raw));
        assert_eq!(prefs.timezone, Tz::UTC);
        assert_eq!(prefs.windows.morning.unwrap().start, t("07:00"));
        assert_eq!(prefs.windows.midday.unwrap().start, t("11:30"));
        assert_eq!(prefs.dnd_ranges.len(), 1);
        assert_eq!(warnings.len(), 3);
    }

    #[test]
    fn snake_case_dnd_alias_is_accepted() {
        let raw = r#"{"timezone": "UTC", "dnd_ranges": [{"start": "13:00", "end": "14:00"}]}"#;
        let prefs = resolve_preferences(Some(raw));
        assert!(prefs.in_dnd(t("13:15")));
        assert!(!prefs.in_dnd(t("14:00")));
    }

    #[test]
    fn document_roundtrips_tri_state() {
        let doc = PreferencesDocument::new("UTC")
            .with_windows(WindowsDocument::default().without(WindowSlot::Evening))
            .with_dnd("22:00", "06:00");
        let json = doc.to_json();
        assert!(json.contains(r#""evening":null"#));
        assert!(!json.contains("morning"));
        let parsed: PreferencesDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, doc);
    }

    #[test]
    fn wrong_typed_field_keeps_the_rest() {
        let cases = [
            r#"{"timezone": "America/New_York", "dndRanges": {"start": "22:00", "end": "06:00"}}"#,
            r#"{"timezone": "America/New_York", "version": "1"}"#,
            r#"{"timezone": "America/New_York", "windows": [{"start": "05:00", "end": "06:00"}]}"#,
        ];
        for raw in cases {
            let (prefs, warnings) = resolve_with_warnings(Some(raw));
            assert_eq!(prefs.timezone, chrono_tz::America::New_York, "{raw}");
            assert_eq!(warnings.len(), 1, "{raw}: {warnings:?}");
            assert_eq!(prefs.windows.morning.unwrap().start, t("07:00"));
            assert!(prefs.dnd_ranges.is_empty());
        }

        let raw = r#"{
            "timezone": "Europe/Berlin",
            "windows": {"morning": {"start": "06:00", "end": "07:00"}},
            "dndRanges": "all night"
        }"#;
        let (prefs, warnings) = resolve_with_warnings(Some(raw));
        assert_eq!(prefs.timezone, chrono_tz::Europe::Berlin);
        assert_eq!(prefs.windows.morning.unwrap().start, t("06:00"));
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn non_object_document_falls_back_to_defaults() {
        let (prefs, warnings) = resolve_with_warnings(Some("[1, 2]"));
        assert_eq!(warnings.len(), 1);
        assert_eq!(prefs, SchedulePreferences::default());
    }
}
