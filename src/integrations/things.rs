use crate::config::ThingsConfig;
use crate::models::{parse_date, parse_time, ListName, LocalCommand, LocalTask};
use crate::sync::{LocalSink, LocalSinkError, LocalSource, LocalSourceError};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use std::io;
use std::process::Command;
use std::sync::mpsc::{self, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

const FIELD_SEP: char = '\u{1f}';
const RECORD_SEP: char = '\u{1e}';

const SCRIPT_HELPERS: &str = r#"
on pad(n)
    return text -2 thru -1 of ("0" & (n as integer))
end pad

on fmt(d)
    if d is missing value then return ""
    return ((year of d) as integer as string) & "-" & my pad(month of d as integer) & "-" & my pad(day of d) & " " & my pad(hours of d) & ":" & my pad(minutes of d)
end fmt

on render(theTodos)
    set fs to (ASCII character 31)
    set rs to (ASCII character 30)
    set out to ""
    tell application "Things3"
        repeat with t in theTodos
            set n to notes of t
            if n is missing value then set n to ""
            set out to out & (id of t) & fs & (name of t) & fs & n & fs & ((status of t) as string) & fs & my fmt(due date of t) & fs & my fmt(creation date of t) & rs
        end repeat
    end tell
    return out
end render
"#;

/// Reads tasks from Things 3 through `osascript`.
pub struct ThingsSource {
    osascript: String,
}

impl ThingsSource {
    pub fn new(config: &ThingsConfig) -> Self {
        Self {
            osascript: config.osascript.clone(),
        }
    }

    fn run_script(&self, script: &str) -> Result<String, LocalSourceError> {
        let output = Command::new(&self.osascript)
            .arg("-e")
            .arg(script)
            .output()
            .map_err(|e| LocalSourceError(format!("failed to run {}: {e}", self.osascript)))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LocalSourceError(format!(
                "AppleScript error: {}",
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .trim_end_matches(['\n', '\r'])
            .to_string())
    }
}

impl LocalSource for ThingsSource {
    fn snapshot(&self, list: ListName) -> Result<Vec<LocalTask>, LocalSourceError> {
        let output = self.run_script(&list_script(list))?;
        let tasks = parse_snapshot(&output, list);
        tracing::debug!(list = %list, count = tasks.len(), "read Things list");
        Ok(tasks)
    }

    fn completed_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<LocalTask>, LocalSourceError> {
        let days = (Utc::now() - cutoff).num_days().max(0) + 1;
        let output = self.run_script(&logbook_script(days))?;
        // Logbook entries keep no list; the engine matches them by mapping.
        Ok(parse_snapshot(&output, ListName::Anytime)
            .into_iter()
            .filter(|task| task.completed)
            .collect())
    }
}

fn list_script(list: ListName) -> String {
    format!(
        "{SCRIPT_HELPERS}\ntell application \"Things3\" to set theTodos to to dos of list \"{}\"\nreturn my render(theTodos)",
        list.as_str()
    )
}

fn logbook_script(days: i64) -> String {
    format!(
        "{SCRIPT_HELPERS}\nset cutoff to (current date) - ({days} * days)\ntell application \"Things3\" to set theTodos to (to dos of list \"Logbook\" whose completion date > cutoff)\nreturn my render(theTodos)"
    )
}

/// Parses the record stream written by the extraction script. Malformed
/// records are skipped.
pub fn parse_snapshot(output: &str, list: ListName) -> Vec<LocalTask> {
    output
        .split(RECORD_SEP)
        .filter(|record| !record.trim().is_empty())
        .filter_map(|record| {
            let task = parse_record(record, list);
            if task.is_none() {
                tracing::warn!(list = %list, record = %record.replace(FIELD_SEP, "|"), "skipping malformed Things record");
            }
            task
        })
        .collect()
}

fn parse_record(record: &str, list: ListName) -> Option<LocalTask> {
    let fields: Vec<&str> = record.trim_start_matches(['\n', '\r']).split(FIELD_SEP).collect();
    let [id, name, notes, status, due, created] = fields.as_slice() else {
        return None;
    };
    let id = id.trim();
    if id.is_empty() {
        return None;
    }
    let (due_date, due_time) = match parse_things_datetime(due) {
        Some(dt) if dt.time() == NaiveTime::MIN => (Some(dt.date()), None),
        Some(dt) => (Some(dt.date()), Some(dt.time())),
        None => (None, None),
    };
    let created_at = parse_things_datetime(created).and_then(|dt| {
        Local
            .from_local_datetime(&dt)
            .earliest()
            .map(|local| local.with_timezone(&Utc))
    });
    Some(LocalTask {
        local_id: id.to_string(),
        title: name.trim().to_string(),
        notes: Some(notes.trim().to_string()).filter(|n| !n.is_empty()),
        list_name: list,
        due_date,
        due_time,
        completed: matches!(status.trim(), "completed" | "canceled"),
        created_at,
    })
}

/// `YYYY-MM-DD HH:MM` in local time.
fn parse_things_datetime(value: &str) -> Option<NaiveDateTime> {
    let (date, time) = value.trim().split_once(' ')?;
    Some(parse_date(date)?.and_time(parse_time(time)?))
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

/// `things:///` URL for a command. Updates need the Things auth token.
pub fn command_url(command: &LocalCommand, auth_token: &str) -> Result<String, LocalSinkError> {
    let mut params: Vec<(&str, String)> = Vec::new();
    let action = match command {
        LocalCommand::Create {
            title,
            notes,
            due_date,
            list,
        } => {
            params.push(("title", title.clone()));
            if let Some(notes) = notes.as_deref().filter(|n| !n.trim().is_empty()) {
                params.push(("notes", notes.to_string()));
            }
            params.push(("when", list.things_when(*due_date)));
            if let Some(due) = due_date {
                params.push(("deadline", format_date(*due)));
            }
            params.push(("reveal", "false".to_string()));
            "add"
        }
        LocalCommand::UpdateDue { local_id, due_date } => {
            push_update_auth(&mut params, local_id, auth_token)?;
            params.push(("deadline", due_date.map(format_date).unwrap_or_default()));
            "update"
        }
        LocalCommand::Complete { local_id } => {
            push_update_auth(&mut params, local_id, auth_token)?;
            params.push(("completed", "true".to_string()));
            "update"
        }
    };
    let query: Vec<String> = params
        .iter()
        .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
        .collect();
    Ok(format!("things:///{action}?{}", query.join("&")))
}

fn push_update_auth(
    params: &mut Vec<(&str, String)>,
    local_id: &str,
    auth_token: &str,
) -> Result<(), LocalSinkError> {
    if auth_token.trim().is_empty() {
        return Err(LocalSinkError(
            "Things auth token missing: set things.auth_token or THINGS_AUTH_TOKEN".to_string(),
        ));
    }
    params.push(("id", local_id.to_string()));
    params.push(("auth-token", auth_token.trim().to_string()));
    Ok(())
}

type Opener = Box<dyn Fn(&str) -> io::Result<()> + Send>;

/// Applies commands by opening `things:///` URLs on a background thread,
/// one at a time with a pause in between. Dropping the sink waits for the
/// queue to drain.
pub struct ThingsSink {
    auth_token: String,
    sender: Option<Sender<(String, String)>>,
    worker: Option<JoinHandle<()>>,
}

impl ThingsSink {
    pub fn spawn(config: &ThingsConfig) -> Self {
        Self::with_opener(
            config.auth_token.clone(),
            Duration::from_millis(config.command_delay_ms),
            Box::new(|url: &str| open::that(url)),
        )
    }

    fn with_opener(auth_token: String, delay: Duration, opener: Opener) -> Self {
        let (sender, receiver) = mpsc::channel::<(String, String)>();
        let worker = thread::spawn(move || {
            for (description, url) in receiver {
                match opener(&url) {
                    Ok(()) => tracing::debug!(command = %description, "opened Things URL"),
                    Err(err) => {
                        tracing::warn!(command = %description, error = %err, "Things command failed")
                    }
                }
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        });
        Self {
            auth_token,
            sender: Some(sender),
            worker: Some(worker),
        }
    }

    /// Waits for every queued command to be handed to Things.
    pub fn finish(mut self) {
        self.drain();
    }

    fn drain(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!("Things command worker panicked");
            }
        }
    }
}

impl LocalSink for ThingsSink {
    fn send(&self, command: LocalCommand) -> Result<(), LocalSinkError> {
        let url = command_url(&command, &self.auth_token)?;
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| LocalSinkError("Things command worker stopped".to_string()))?;
        sender
            .send((command.describe(), url))
            .map_err(|_| LocalSinkError("Things command worker stopped".to_string()))
    }
}

impl Drop for ThingsSink {
    fn drop(&mut self) {
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn record(fields: [&str; 6]) -> String {
        let mut out = fields.join(&FIELD_SEP.to_string());
        out.push(RECORD_SEP);
        out
    }

    #[test]
    fn parses_script_output() {
        let output = format!(
            "{}{}{}\n",
            record(["A1", " Buy milk ", "", "open", "", "2025-05-30 08:15"]),
            record(["A2", "Dentist", "Bring card", "open", "2025-06-20 00:00", ""]),
            record(["A3", "Call", "", "completed", "2025-06-02 14:30", "2025-05-01 10:00"]),
        );
        let tasks = parse_snapshot(&output, ListName::Today);
        assert_eq!(tasks.len(), 3);

        assert_eq!(tasks[0].title, "Buy milk");
        assert_eq!(tasks[0].notes, None);
        assert_eq!(tasks[0].due_date, None);
        assert!(tasks[0].created_at.is_some());
        assert_eq!(tasks[0].list_name, ListName::Today);

        assert_eq!(tasks[1].due_date, NaiveDate::from_ymd_opt(2025, 6, 20));
        assert_eq!(tasks[1].due_time, None);
        assert_eq!(tasks[1].notes.as_deref(), Some("Bring card"));
        assert_eq!(tasks[1].created_at, None);

        assert!(tasks[2].completed);
        assert_eq!(tasks[2].due_time, NaiveTime::from_hms_opt(14, 30, 0));
    }

    #[test]
    fn skips_malformed_records() {
        let output = format!(
            "broken{RECORD_SEP}{}{}",
            record(["", "No id", "", "open", "", ""]),
            record(["B1", "Fine", "", "canceled", "", ""]),
        );
        let tasks = parse_snapshot(&output, ListName::Someday);
        assert_eq!(tasks.len(), 1);
        assert!(tasks[0].completed);
        assert!(parse_snapshot("", ListName::Today).is_empty());
    }

    #[test]
    fn scripts_target_the_requested_list() {
        assert!(list_script(ListName::Upcoming).contains("to dos of list \"Upcoming\""));
        assert!(logbook_script(3).contains("(3 * days)"));
    }

    #[test]
    fn builds_add_urls() {
        let url = command_url(
            &LocalCommand::Create {
                title: "Call dentist & book".to_string(),
                notes: Some("ask about x-ray".to_string()),
                due_date: NaiveDate::from_ymd_opt(2025, 6, 20),
                list: ListName::Upcoming,
            },
            "",
        )
        .unwrap();
        assert_eq!(
            url,
            "things:///add?title=Call%20dentist%20%26%20book&notes=ask%20about%20x-ray&when=2025-06-20&deadline=2025-06-20&reveal=false"
        );
    }

    #[test]
    fn update_urls_need_auth_token() {
        let complete = LocalCommand::Complete {
            local_id: "ABC".to_string(),
        };
        assert!(command_url(&complete, " ").is_err());
        assert_eq!(
            command_url(&complete, "tok").unwrap(),
            "things:///update?id=ABC&auth-token=tok&completed=true"
        );

        let clear = LocalCommand::UpdateDue {
            local_id: "ABC".to_string(),
            due_date: None,
        };
        assert_eq!(
            command_url(&clear, "tok").unwrap(),
            "things:///update?id=ABC&auth-token=tok&deadline="
        );
    }

    #[test]
    fn sink_opens_queued_urls_in_order() {
        let opened = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&opened);
        let sink = ThingsSink::with_opener(
            "tok".to_string(),
            Duration::ZERO,
            Box::new(move |url: &str| {
                seen.lock().unwrap().push(url.to_string());
                Ok(())
            }),
        );
        sink.send(LocalCommand::Complete {
            local_id: "A".to_string(),
        })
        .unwrap();
        sink.send(LocalCommand::Complete {
            local_id: "B".to_string(),
        })
        .unwrap();
        sink.finish();

        let opened = opened.lock().unwrap();
        assert_eq!(opened.len(), 2);
        assert!(opened[0].contains("id=A"));
        assert!(opened[1].contains("id=B"));
    }

    #[test]
    fn opener_failures_do_not_stop_the_worker() {
        let count = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&count);
        let sink = ThingsSink::with_opener(
            String::new(),
            Duration::ZERO,
            Box::new(move |_url: &str| {
                *seen.lock().unwrap() += 1;
                Err(io::Error::new(io::ErrorKind::NotFound, "open not found"))
            }),
        );
        for title in ["One", "Two"] {
            sink.send(LocalCommand::Create {
                title: title.to_string(),
                notes: None,
                due_date: None,
                list: ListName::Today,
            })
            .unwrap();
        }
        drop(sink);
        assert_eq!(*count.lock().unwrap(), 2);
    }
}
