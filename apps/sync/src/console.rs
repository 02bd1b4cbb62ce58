//! Line-oriented command console for driving a session from a terminal.

use std::fmt::Write as _;

use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::collection::{DeletedFilter, ListQuery, SortDirection, SortField};
use crate::draft::lock;
use crate::errors::SyncError;
use crate::session::SyncSession;

pub const HELP: &str = "\
commands:
  set <path> <value>     edit a field (value is JSON, or a bare string)
  undo | redo
  show [path]            print the draft or one field
  status                 dirty/conflict/autosave/queue state
  save                   save now, skipping the quiet period
  reload                 discard local edits and fetch the server copy
  open <draft-id>        switch to another draft
  files                  list the visible page
  page <n>
  sort <name|created|updated> [asc|desc]
  deleted <exclude|include|only>
  search [term]          no term clears the search
  flush                  replay the offline queue
  offline | online       toggle connectivity
  quit";

#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    Set { path: String, value: Value },
    Undo,
    Redo,
    Show(Option<String>),
    Status,
    Save,
    Reload,
    Open(Uuid),
    Files,
    Page(u32),
    Sort(SortField, SortDirection),
    Deleted(DeletedFilter),
    Search(Option<String>),
    Flush,
    Online(bool),
    Help,
    Quit,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CommandError {
    #[error("unknown command `{0}` (try `help`)")]
    Unknown(String),
    #[error("usage: {0}")]
    Usage(&'static str),
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse_command(line: &str) -> Result<Option<ConsoleCommand>, CommandError> {
    let line = line.trim();
    let (verb, rest) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb {
        "" => return Ok(None),
        "set" => {
            let (path, raw) = rest
                .split_once(char::is_whitespace)
                .ok_or(CommandError::Usage("set <path> <value>"))?;
            let raw = raw.trim();
            // Bare words are taken as strings so `set contact.name Jane Doe` works.
            let value = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            ConsoleCommand::Set {
                path: path.to_string(),
                value,
            }
        }
        "undo" => ConsoleCommand::Undo,
        "redo" => ConsoleCommand::Redo,
        "show" => ConsoleCommand::Show(non_empty(rest)),
        "status" => ConsoleCommand::Status,
        "save" => ConsoleCommand::Save,
        "reload" => ConsoleCommand::Reload,
        "open" => ConsoleCommand::Open(
            rest.parse()
                .map_err(|_| CommandError::Usage("open <draft-id>"))?,
        ),
        "files" | "ls" => ConsoleCommand::Files,
        "page" => ConsoleCommand::Page(
            rest.parse()
                .ok()
                .filter(|page| *page >= 1)
                .ok_or(CommandError::Usage("page <n>, n >= 1"))?,
        ),
        "sort" => parse_sort(rest)?,
        "deleted" => ConsoleCommand::Deleted(match rest {
            "exclude" => DeletedFilter::Exclude,
            "include" => DeletedFilter::Include,
            "only" => DeletedFilter::Only,
            _ => return Err(CommandError::Usage("deleted <exclude|include|only>")),
        }),
        "search" => ConsoleCommand::Search(non_empty(rest)),
        "flush" => ConsoleCommand::Flush,
        "offline" => ConsoleCommand::Online(false),
        "online" => ConsoleCommand::Online(true),
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(CommandError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn non_empty(s: &str) -> Option<String> {
    (!s.is_empty()).then(|| s.to_string())
}

fn parse_sort(rest: &str) -> Result<ConsoleCommand, CommandError> {
    const USAGE: &str = "sort <name|created|updated> [asc|desc]";
    let mut words = rest.split_whitespace();
    let field = match words.next() {
        Some("name") => SortField::Name,
        Some("created") => SortField::CreatedAt,
        Some("updated") => SortField::UpdatedAt,
        _ => return Err(CommandError::Usage(USAGE)),
    };
    let direction = match words.next() {
        None | Some("asc") => SortDirection::Asc,
        Some("desc") => SortDirection::Desc,
        Some(_) => return Err(CommandError::Usage(USAGE)),
    };
    Ok(ConsoleCommand::Sort(field, direction))
}

/// Runs a command against the session and returns the text to print.
pub async fn execute(session: &SyncSession, command: ConsoleCommand) -> Result<String, SyncError> {
    let output = match command {
        ConsoleCommand::Set { path, value } => {
            lock(session.draft()).mutate(&path, value)?;
            String::new()
        }
        ConsoleCommand::Undo => history_step(lock(session.draft()).undo(), "undo"),
        ConsoleCommand::Redo => history_step(lock(session.draft()).redo(), "redo"),
        ConsoleCommand::Show(path) => {
            let draft = lock(session.draft());
            let value = match &path {
                Some(path) => draft.get(path).cloned().unwrap_or(Value::Null),
                None => draft.document().content.clone(),
            };
            serde_json::to_string_pretty(&value)?
        }
        ConsoleCommand::Status => status_line(session),
        ConsoleCommand::Save => {
            session.autosave().save_now();
            "saving".to_string()
        }
        ConsoleCommand::Reload => {
            session.reload_draft().await?;
            "reloaded from server".to_string()
        }
        ConsoleCommand::Open(id) => {
            session.open_draft(id).await?;
            format!("opened {id}")
        }
        ConsoleCommand::Files => render_files(session),
        ConsoleCommand::Page(page) => {
            let query = ListQuery {
                page,
                ..session.view().query().clone()
            };
            session.navigate(query).await?;
            render_files(session)
        }
        ConsoleCommand::Sort(field, direction) => {
            let mut query = session.view().query().clone();
            query.sort.field = field;
            query.sort.direction = direction;
            query.page = 1;
            session.navigate(query).await?;
            render_files(session)
        }
        ConsoleCommand::Deleted(deleted) => {
            let mut query = session.view().query().clone();
            query.filter.deleted = deleted;
            query.page = 1;
            session.navigate(query).await?;
            render_files(session)
        }
        ConsoleCommand::Search(term) => {
            let mut query = session.view().query().clone();
            query.search = term;
            query.page = 1;
            session.navigate(query).await?;
            render_files(session)
        }
        ConsoleCommand::Flush => {
            let report = session.flush_queue().await;
            format!(
                "replayed {}, retrying {}, dropped {}, conflicts {}, rejected {}",
                report.replayed.len(),
                report.retried.len(),
                report.dropped.len(),
                report.conflicts.len(),
                report.rejected.len()
            )
        }
        ConsoleCommand::Online(online) => {
            session.connectivity().set_online(online);
            let state = if online { "online" } else { "offline" };
            state.to_string()
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => String::new(),
    };
    Ok(output)
}

fn history_step(moved: bool, what: &str) -> String {
    if moved {
        String::new()
    } else {
        format!("nothing to {what}")
    }
}

fn status_line(session: &SyncSession) -> String {
    let draft = lock(session.draft());
    let document = draft.document();
    let mut out = String::new();
    let _ = write!(
        out,
        "draft {} v{} | dirty: {} | undo {}/{}",
        document
            .id
            .map_or_else(|| "(unsaved)".to_string(), |id| id.to_string()),
        document.marker.map_or(0, |m| m.version),
        draft.is_dirty(),
        draft.history_index(),
        draft.history_len(),
    );
    if let Some(conflict) = draft.conflict() {
        let _ = write!(out, " | conflict ({:?}): {}", conflict.kind, conflict.message);
    }
    let _ = write!(
        out,
        "\nautosave: {:?} | {} | queued: {}",
        session.autosave().status(),
        if session.connectivity().is_online() { "online" } else { "offline" },
        session.queue().len()
    );
    out
}

fn render_files(session: &SyncSession) -> String {
    let view = session.view();
    let query = view.query();
    let mut out = format!(
        "page {} ({} total, sort {} {}, deleted {})",
        query.page,
        view.total(),
        query.sort.field.as_str(),
        query.sort.direction.as_str(),
        query.filter.deleted.as_str()
    );
    for record in view.records() {
        let _ = write!(
            out,
            "\n  {}  {}  v{}{}",
            record.id,
            record.name,
            record.marker.version,
            if record.deleted_at.is_some() { "  [deleted]" } else { "" }
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parsed(line: &str) -> ConsoleCommand {
        parse_command(line).unwrap().unwrap()
    }

    #[test]
    fn test_set_accepts_json_or_bare_text() {
        assert_eq!(
            parsed("set contact.name Jane Doe"),
            ConsoleCommand::Set {
                path: "contact.name".to_string(),
                value: json!("Jane Doe")
            }
        );
        assert_eq!(
            parsed("set skill.0 {\"name\": \"Rust\"}"),
            ConsoleCommand::Set {
                path: "skill.0".to_string(),
                value: json!({"name": "Rust"})
            }
        );
        assert_eq!(
            parse_command("set contact.name"),
            Err(CommandError::Usage("set <path> <value>"))
        );
    }

    #[test]
    fn test_collection_commands() {
        assert_eq!(parsed("page 3"), ConsoleCommand::Page(3));
        assert!(parse_command("page 0").is_err());
        assert_eq!(
            parsed("sort name"),
            ConsoleCommand::Sort(SortField::Name, SortDirection::Asc)
        );
        assert_eq!(
            parsed("sort updated desc"),
            ConsoleCommand::Sort(SortField::UpdatedAt, SortDirection::Desc)
        );
        assert_eq!(parsed("deleted only"), ConsoleCommand::Deleted(DeletedFilter::Only));
        assert_eq!(parsed("search"), ConsoleCommand::Search(None));
        assert_eq!(
            parsed("search  cover letter "),
            ConsoleCommand::Search(Some("cover letter".to_string()))
        );
    }

    #[test]
    fn test_blank_and_unknown_lines() {
        assert_eq!(parse_command("   "), Ok(None));
        assert_eq!(
            parse_command("frobnicate now"),
            Err(CommandError::Unknown("frobnicate".to_string()))
        );
        assert!(parse_command("open not-a-uuid").is_err());
        assert_eq!(parsed("offline"), ConsoleCommand::Online(false));
        assert_eq!(parsed("exit"), ConsoleCommand::Quit);
    }
}
