use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::Document;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub path: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn from_issues(issues: Vec<ValidationIssue>) -> Self {
        Self {
            passed: issues.is_empty(),
            issues,
        }
    }

    /// One-line summary for logs and user-facing notices.
    pub fn summary(&self) -> String {
        self.issues
            .iter()
            .map(|i| format!("{}: {}", i.path, i.reason))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Accepts or rejects a document before autosave transmits it.
pub trait DocumentValidator: Send + Sync {
    fn validate(&self, document: &Document) -> ValidationReport;
}

/// Structural checks for a profile document.
///
/// FAIL conditions:
/// - `contact.name` missing or blank
/// - `contact.email` present, non-blank, and not shaped like an address
/// - an `experience` entry with a blank `company` or `role`
/// - an `experience` entry whose dates don't parse or end before they start
pub struct ProfileValidator;

impl DocumentValidator for ProfileValidator {
    fn validate(&self, document: &Document) -> ValidationReport {
        let content = &document.content;
        let mut issues = Vec::new();

        let name = content.pointer("/contact/name").and_then(Value::as_str);
        if name.map_or(true, |n| n.trim().is_empty()) {
            issues.push(issue("contact.name", "Name is required"));
        }

        if let Some(email) = content.pointer("/contact/email").and_then(Value::as_str) {
            if !email.trim().is_empty() && !looks_like_email(email.trim()) {
                issues.push(issue(
                    "contact.email",
                    &format!("'{email}' is not a valid email address"),
                ));
            }
        }

        if let Some(entries) = content.get("experience").and_then(Value::as_array) {
            for (i, entry) in entries.iter().enumerate() {
                check_experience(i, entry, &mut issues);
            }
        }

        ValidationReport::from_issues(issues)
    }
}

fn check_experience(index: usize, entry: &Value, issues: &mut Vec<ValidationIssue>) {
    for field in ["company", "role"] {
        let value = entry.get(field).and_then(Value::as_str);
        if value.map_or(true, |v| v.trim().is_empty()) {
            issues.push(issue(
                &format!("experience.{index}.{field}"),
                &format!("{field} is required"),
            ));
        }
    }

    let start = date_field(entry, "date_start");
    let end = date_field(entry, "date_end");
    let parsed_start = start.map(|s| (s, parse_date(s)));
    let parsed_end = end.map(|s| (s, parse_date(s)));

    for (field, parsed) in [("date_start", parsed_start), ("date_end", parsed_end)] {
        if let Some((raw, None)) = parsed {
            issues.push(issue(
                &format!("experience.{index}.{field}"),
                &format!("'{raw}' is not a date (expected YYYY-MM or YYYY-MM-DD)"),
            ));
        }
    }

    if let (Some((_, Some(start))), Some((_, Some(end)))) = (parsed_start, parsed_end) {
        if end < start {
            issues.push(issue(
                &format!("experience.{index}.date_end"),
                "End date is before start date",
            ));
        }
    }
}

/// A blank date string counts as "not set".
fn date_field<'a>(entry: &'a Value, field: &str) -> Option<&'a str> {
    entry
        .get(field)
        .and_then(Value::as_str)
        .filter(|s| !s.trim().is_empty())
}

/// Accepts `YYYY-MM-DD` and `YYYY-MM` (treated as the first of the month).
fn parse_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .or_else(|_| NaiveDate::parse_from_str(&format!("{raw}-01"), "%Y-%m-%d"))
        .ok()
}

fn looks_like_email(email: &str) -> bool {
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && !email.contains(char::is_whitespace)
        && domain
            .split_once('.')
            .map_or(false, |(host, tld)| !host.is_empty() && !tld.is_empty())
}

fn issue(path: &str, reason: &str) -> ValidationIssue {
    ValidationIssue {
        path: path.to_string(),
        reason: reason.to_string(),
    }
}
