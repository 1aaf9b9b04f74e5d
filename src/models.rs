use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Local grouping a task lives in at extraction time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ListName {
    Today,
    Upcoming,
    Anytime,
    Someday,
}

impl ListName {
    pub fn all() -> Vec<ListName> {
        vec![
            ListName::Today,
            ListName::Upcoming,
            ListName::Anytime,
            ListName::Someday,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ListName::Today => "Today",
            ListName::Upcoming => "Upcoming",
            ListName::Anytime => "Anytime",
            ListName::Someday => "Someday",
        }
    }

    /// Value for the `when` parameter of a Things `add` command.
    pub fn things_when(&self, due_date: Option<NaiveDate>) -> String {
        match self {
            ListName::Today => "today".to_string(),
            ListName::Upcoming => due_date
                .map(|d| d.format("%Y-%m-%d").to_string())
                .unwrap_or_else(|| "anytime".to_string()),
            ListName::Anytime => "anytime".to_string(),
            ListName::Someday => "someday".to_string(),
        }
    }
}

impl fmt::Display for ListName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListName {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "today" => Ok(ListName::Today),
            "upcoming" => Ok(ListName::Upcoming),
            "anytime" => Ok(ListName::Anytime),
            "someday" => Ok(ListName::Someday),
            other => Err(format!("unknown list name: {other}")),
        }
    }
}

/// Which lists a cycle covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncScope {
    All,
    List(ListName),
}

impl SyncScope {
    pub fn lists(&self) -> Vec<ListName> {
        match self {
            SyncScope::All => ListName::all(),
            SyncScope::List(name) => vec![*name],
        }
    }
}

impl FromStr for SyncScope {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.trim().eq_ignore_ascii_case("all") {
            return Ok(SyncScope::All);
        }
        value.parse::<ListName>().map(SyncScope::List)
    }
}

impl fmt::Display for SyncScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncScope::All => f.write_str("all"),
            SyncScope::List(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct LocalTask {
    pub local_id: String,
    pub title: String,
    pub notes: Option<String>,
    pub list_name: ListName,
    pub due_date: Option<NaiveDate>,
    pub due_time: Option<NaiveTime>,
    pub completed: bool,
    pub created_at: Option<DateTime<Utc>>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RemoteTask {
    pub remote_id: String,
    pub title: String,
    pub list_id: String,
    pub due: Option<DateTime<Utc>>,
    pub completed: bool,
    pub completed_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl RemoteTask {
    /// Calendar date of the due timestamp, read without timezone shifting.
    pub fn due_date(&self) -> Option<NaiveDate> {
        self.due.map(|due| due.date_naive())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RemoteList {
    pub id: String,
    pub title: String,
}

/// Body of a remote insert.
#[derive(Clone, Debug, PartialEq)]
pub struct NewRemoteTask {
    pub title: String,
    pub notes: Option<String>,
    pub due: Option<DateTime<Utc>>,
}

/// Fields changed by a remote patch. `None` leaves a field untouched.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemotePatch {
    pub completed: Option<bool>,
    pub due: Option<Option<DateTime<Utc>>>,
}

impl RemotePatch {
    pub fn complete() -> Self {
        Self {
            completed: Some(true),
            due: None,
        }
    }

    pub fn due(due: Option<DateTime<Utc>>) -> Self {
        Self {
            completed: None,
            due: Some(due),
        }
    }
}

/// Fire-and-forget command applied to the local task manager.
#[derive(Clone, Debug, PartialEq)]
pub enum LocalCommand {
    Create {
        title: String,
        notes: Option<String>,
        due_date: Option<NaiveDate>,
        list: ListName,
    },
    UpdateDue {
        local_id: String,
        due_date: Option<NaiveDate>,
    },
    Complete {
        local_id: String,
    },
}

impl LocalCommand {
    pub fn describe(&self) -> String {
        match self {
            LocalCommand::Create { title, .. } => format!("create \"{title}\""),
            LocalCommand::UpdateDue { local_id, due_date } => format!(
                "update {local_id} due {}",
                due_date
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| "none".to_string())
            ),
            LocalCommand::Complete { local_id } => format!("complete {local_id}"),
        }
    }
}

/// Remote due timestamp for a local date and optional time of day.
///
/// The remote service keeps only the date part, so the value is written as a
/// UTC timestamp to keep the calendar date stable across timezones.
pub fn remote_due(date: Option<NaiveDate>, time: Option<NaiveTime>) -> Option<DateTime<Utc>> {
    let date = date?;
    let time = time.unwrap_or(NaiveTime::MIN);
    Some(date.and_time(time).and_utc())
}

pub fn parse_date(value: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(value.trim(), "%Y-%m-%d").ok()
}

pub fn parse_time(value: &str) -> Option<NaiveTime> {
    let trimmed = value.trim();
    let parts: Vec<&str> = trimmed.split(':').collect();
    match parts.as_slice() {
        [hour, minute] => NaiveTime::from_hms_opt(hour.parse().ok()?, minute.parse().ok()?, 0),
        [hour, minute, second] => NaiveTime::from_hms_opt(
            hour.parse().ok()?,
            minute.parse().ok()?,
            second.parse().ok()?,
        ),
        _ => None,
    }
}

/// Parses an RFC 3339 timestamp as returned by the remote service.
pub fn parse_remote_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_parses_names_case_insensitively() {
        assert_eq!("all".parse::<SyncScope>(), Ok(SyncScope::All));
        assert_eq!(
            "Someday".parse::<SyncScope>(),
            Ok(SyncScope::List(ListName::Someday))
        );
        assert!("inbox".parse::<SyncScope>().is_err());
        assert_eq!(SyncScope::All.lists().len(), 4);
    }

    #[test]
    fn remote_due_keeps_calendar_date() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 20).unwrap();
        let due = remote_due(Some(date), None).unwrap();
        assert_eq!(due.date_naive(), date);
        assert_eq!(due.to_rfc3339(), "2025-06-20T00:00:00+00:00");

        let time = NaiveTime::from_hms_opt(23, 30, 0).unwrap();
        let due = remote_due(Some(date), Some(time)).unwrap();
        assert_eq!(due.date_naive(), date);
        assert_eq!(remote_due(None, Some(time)), None);
    }

    #[test]
    fn parses_remote_timestamps() {
        let parsed = parse_remote_timestamp("2025-06-20T00:00:00.000Z").unwrap();
        assert_eq!(parsed.date_naive(), NaiveDate::from_ymd_opt(2025, 6, 20).unwrap());
        assert_eq!(parse_remote_timestamp("tomorrow"), None);
    }

    #[test]
    fn upcoming_when_uses_due_date() {
        let date = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        assert_eq!(ListName::Upcoming.things_when(Some(date)), "2025-07-01");
        assert_eq!(ListName::Upcoming.things_when(None), "anytime");
        assert_eq!(ListName::Today.things_when(Some(date)), "today");
    }

    #[test]
    fn parses_clock_times() {
        assert_eq!(parse_time("9:05"), NaiveTime::from_hms_opt(9, 5, 0));
        assert_eq!(parse_time("18:00:30"), NaiveTime::from_hms_opt(18, 0, 30));
        assert_eq!(parse_time("25:00"), None);
        assert_eq!(parse_time("noon"), None);
    }
}
