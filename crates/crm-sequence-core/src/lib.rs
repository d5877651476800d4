use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, UtcOffset};
use ulid::Ulid;

pub const MINUTE_MS: i64 = 60_000;

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum SequenceError {
    #[error("validation error: {0}")]
    Validation(String),
    #[error("resolution error: {0}")]
    Resolution(String),
    #[error("configuration error: {0}")]
    Configuration(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct SequenceId(pub Ulid);

impl Display for SequenceId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct TaskId(pub Ulid);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct EmailId(pub Ulid);

impl Display for EmailId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    AutoEmail,
    ManualEmail,
    PhoneCall,
    LinkedinConnect,
    LinkedinMessage,
    LinkedinViewProfile,
    LinkedinInteractPost,
    Task,
}

impl StepKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoEmail => "auto_email",
            Self::ManualEmail => "manual_email",
            Self::PhoneCall => "phone_call",
            Self::LinkedinConnect => "linkedin_connect",
            Self::LinkedinMessage => "linkedin_message",
            Self::LinkedinViewProfile => "linkedin_view_profile",
            Self::LinkedinInteractPost => "linkedin_interact_post",
            Self::Task => "task",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "auto_email" => Some(Self::AutoEmail),
            "manual_email" => Some(Self::ManualEmail),
            "phone_call" => Some(Self::PhoneCall),
            "linkedin_connect" => Some(Self::LinkedinConnect),
            "linkedin_message" => Some(Self::LinkedinMessage),
            "linkedin_view_profile" => Some(Self::LinkedinViewProfile),
            "linkedin_interact_post" => Some(Self::LinkedinInteractPost),
            "task" => Some(Self::Task),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_email(self) -> bool {
        matches!(self, Self::AutoEmail | Self::ManualEmail)
    }

    #[must_use]
    pub fn is_task(self) -> bool {
        !self.is_email()
    }

    /// Default human-readable task title for a task-like step kind.
    #[must_use]
    pub fn default_task_title(self) -> &'static str {
        match self {
            Self::PhoneCall => "Call contact",
            Self::LinkedinConnect => "Connect on LinkedIn",
            Self::LinkedinMessage => "Send LinkedIn message",
            Self::LinkedinViewProfile => "View LinkedIn profile",
            Self::LinkedinInteractPost => "Interact with LinkedIn post",
            Self::Task => "Follow up",
            Self::AutoEmail | Self::ManualEmail => "Send email",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Low,
    Normal,
    High,
}

impl TaskPriority {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "low" => Some(Self::Low),
            "normal" => Some(Self::Normal),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

impl Default for TaskPriority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EmailStatus {
    NotGenerated,
    Generated,
    Sent,
    Rejected,
    Cancelled,
}

impl EmailStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotGenerated => "not_generated",
            Self::Generated => "generated",
            Self::Sent => "sent",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "not_generated" => Some(Self::NotGenerated),
            "generated" => Some(Self::Generated),
            "sent" => Some(Self::Sent),
            "rejected" => Some(Self::Rejected),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Cancelled,
    Deleted,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Deleted => "deleted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "cancelled" => Some(Self::Cancelled),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// One unit of a sequence: a delay-gated email or task template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Step {
    pub id: String,
    pub kind: StepKind,
    pub delay_minutes: u32,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub note: Option<String>,
    #[serde(default)]
    pub priority: Option<TaskPriority>,
}

/// An ordered, reusable outreach workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sequence {
    pub id: SequenceId,
    pub name: String,
    pub steps: Vec<Step>,
}

impl Sequence {
    /// Validates sequence structure before it is stored.
    ///
    /// # Errors
    /// Returns [`SequenceError::Validation`] when the name is empty or step
    /// ids collide.
    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.name.trim().is_empty() {
            return Err(SequenceError::Validation(
                "sequence name MUST be non-empty".to_string(),
            ));
        }

        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if step.id.trim().is_empty() {
                return Err(SequenceError::Validation(
                    "step id MUST be non-empty".to_string(),
                ));
            }
            if !seen.insert(step.id.as_str()) {
                return Err(SequenceError::Validation(format!(
                    "duplicate step id: {}",
                    step.id
                )));
            }
        }

        Ok(())
    }
}

/// The enrollment of one contact in one sequence. Its presence is the sole
/// authority for "is this contact still active in this sequence".
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Membership {
    pub sequence_id: SequenceId,
    pub contact_id: String,
    pub owner_id: Option<String>,
    pub created_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScheduledEmail {
    pub id: EmailId,
    pub sequence_id: SequenceId,
    pub contact_id: String,
    pub step_index: u32,
    pub status: EmailStatus,
    pub scheduled_send_ms: i64,
    pub created_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SequenceTask {
    pub id: TaskId,
    pub sequence_id: Option<SequenceId>,
    pub contact_id: Option<String>,
    pub contact_name: Option<String>,
    pub company: Option<String>,
    pub step_index: Option<u32>,
    pub is_sequence_task: bool,
    pub task_type: StepKind,
    pub title: String,
    pub note: Option<String>,
    pub priority: TaskPriority,
    pub status: TaskStatus,
    pub due_ms: Option<i64>,
    pub due_date: Option<String>,
    pub due_time: Option<String>,
    pub owner_id: Option<String>,
    pub assigned_to: Option<String>,
    pub created_by: Option<String>,
    pub created_ms: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Contact {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub email: Option<String>,
}

impl Contact {
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
            .trim()
            .to_string()
    }
}

/// Which moment the cumulative step delay is measured from.
///
/// The live completion path and the batch reconciler historically disagree
/// on this; both strategies stay available and the caller picks one.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum DelayAnchor {
    AtCompletion,
    AtEnrollment,
}

impl DelayAnchor {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AtCompletion => "anchor_at_completion",
            Self::AtEnrollment => "anchor_at_enrollment",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EngineConfig {
    pub default_owner: String,
}

impl EngineConfig {
    /// Validates engine configuration.
    ///
    /// # Errors
    /// Returns [`SequenceError::Configuration`] when the default owner is
    /// empty.
    pub fn validate(&self) -> Result<(), SequenceError> {
        if self.default_owner.trim().is_empty() {
            return Err(SequenceError::Configuration(
                "default_owner MUST be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Highest step index already reached by a contact, derived from that
/// contact's scheduled-email records for one sequence.
///
/// A step counts as reached when its email was sent, or is past its
/// scheduled send time without being rejected or cancelled. `None` means no
/// step has been reached yet. The result never decreases as more emails
/// transition to `sent`; it is a materialized view recomputed on demand.
#[must_use]
pub fn resolve_progress(emails: &[ScheduledEmail], now_ms: i64) -> Option<u32> {
    emails
        .iter()
        .filter(|email| {
            email.status == EmailStatus::Sent
                || (email.scheduled_send_ms <= now_ms
                    && email.status != EmailStatus::Rejected
                    && email.status != EmailStatus::Cancelled)
        })
        .map(|email| email.step_index)
        .max()
}

/// Outcome of the find-next-step walk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextStep {
    /// A task-like step to materialize.
    Task {
        index: u32,
        step: Step,
        delay_ms: i64,
    },
    /// An email-like step with no record yet; only the live advancer may
    /// materialize it.
    Email {
        index: u32,
        step: Step,
        delay_ms: i64,
    },
    /// Waiting on an email record the walker is not allowed to create.
    Blocked { email_index: u32 },
    /// Every remaining step is resolved; the sequence is finished.
    Complete,
}

/// Walks the steps after `current` and finds the next actionable step.
///
/// Paused steps are skipped and contribute no delay. Email-like steps that
/// already have a record are walked past (their delay still accumulates).
/// An email-like step without a record halts the walk: as
/// [`NextStep::Blocked`] when `tasks_only` (the reconciler never creates
/// email records), otherwise as [`NextStep::Email`].
#[must_use]
pub fn find_next_step(
    steps: &[Step],
    current: Option<u32>,
    emails: &[ScheduledEmail],
    tasks_only: bool,
) -> NextStep {
    let start = current.map_or(0, |index| index + 1);
    let mut cumulative_delay_ms = 0_i64;

    for (index, step) in (0_u32..).zip(steps) {
        if index < start {
            continue;
        }
        if step.paused {
            continue;
        }

        cumulative_delay_ms += i64::from(step.delay_minutes) * MINUTE_MS;

        if step.kind.is_task() {
            return NextStep::Task {
                index,
                step: step.clone(),
                delay_ms: cumulative_delay_ms,
            };
        }

        if emails.iter().any(|email| email.step_index == index) {
            continue;
        }

        if tasks_only {
            return NextStep::Blocked { email_index: index };
        }
        return NextStep::Email {
            index,
            step: step.clone(),
            delay_ms: cumulative_delay_ms,
        };
    }

    NextStep::Complete
}

/// Best-effort timestamp parse used for legacy due dates.
///
/// Layered: bare epoch digits, `M/D/YYYY`, `YYYY-MM-DD`, then RFC3339.
/// Never errors; anything unparsable is `None` and the caller decides
/// whether unknown sorts last or is excluded.
#[must_use]
pub fn parse_flexible_ms(date: &str, time_of_day: Option<&str>) -> Option<i64> {
    let date = date.trim();
    if date.is_empty() {
        return None;
    }

    if date.chars().all(|ch| ch.is_ascii_digit()) {
        let raw: i64 = date.parse().ok()?;
        // Values this large are already milliseconds; shorter ones are seconds.
        let base = if date.len() >= 12 { raw } else { raw * 1_000 };
        return Some(base + parse_time_of_day_ms(time_of_day));
    }

    if let Some(base) = parse_slash_date_ms(date) {
        return Some(base + parse_time_of_day_ms(time_of_day));
    }

    if let Some(base) = parse_dash_date_ms(date) {
        return Some(base + parse_time_of_day_ms(time_of_day));
    }

    if let Ok(parsed) = OffsetDateTime::parse(date, &time::format_description::well_known::Rfc3339)
    {
        return Some(to_unix_ms(parsed));
    }

    None
}

fn parse_slash_date_ms(date: &str) -> Option<i64> {
    let mut parts = date.split('/');
    let month: u8 = parts.next()?.trim().parse().ok()?;
    let day: u8 = parts.next()?.trim().parse().ok()?;
    let year: i32 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    calendar_midnight_ms(year, month, day)
}

fn parse_dash_date_ms(date: &str) -> Option<i64> {
    let mut parts = date.split('-');
    let year: i32 = parts.next()?.trim().parse().ok()?;
    let month: u8 = parts.next()?.trim().parse().ok()?;
    let day: u8 = parts.next()?.trim().parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    calendar_midnight_ms(year, month, day)
}

fn calendar_midnight_ms(year: i32, month: u8, day: u8) -> Option<i64> {
    let month = Month::try_from(month).ok()?;
    let date = Date::from_calendar_date(year, month, day).ok()?;
    Some(to_unix_ms(date.midnight().assume_utc()))
}

fn parse_time_of_day_ms(time_of_day: Option<&str>) -> i64 {
    let Some(raw) = time_of_day else {
        return 0;
    };

    let mut parts = raw.trim().split(':');
    let hours: i64 = parts
        .next()
        .and_then(|part| part.parse().ok())
        .unwrap_or(0);
    let minutes: i64 = parts
        .next()
        .and_then(|part| part.parse().ok())
        .unwrap_or(0);
    if !(0..24).contains(&hours) || !(0..60).contains(&minutes) {
        return 0;
    }
    (hours * 60 + minutes) * MINUTE_MS
}

/// Scheduled moment of a task: the direct epoch field when present, else the
/// legacy date/time string pair through the flexible parser.
#[must_use]
pub fn task_scheduled_ms(task: &SequenceTask) -> Option<i64> {
    if let Some(due_ms) = task.due_ms {
        return Some(due_ms);
    }
    task.due_date
        .as_deref()
        .and_then(|date| parse_flexible_ms(date, task.due_time.as_deref()))
}

/// Grouping key for duplicate detection: the contact id when present, else a
/// normalized name + company + owner composite for legacy rows.
#[must_use]
pub fn dedup_group_key(task: &SequenceTask) -> String {
    if let Some(contact_id) = task.contact_id.as_deref() {
        let trimmed = contact_id.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    format!(
        "{}|{}|{}",
        normalize_for_key(task.contact_name.as_deref()),
        normalize_for_key(task.company.as_deref()),
        task.owner_id.as_deref().unwrap_or("")
    )
}

fn normalize_for_key(value: Option<&str>) -> String {
    value
        .unwrap_or("")
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DedupPlan {
    pub keep: TaskId,
    pub delete: Vec<TaskId>,
}

/// Plans duplicate removal for one group of pending tasks that all claim
/// the same contact.
///
/// The keeper is the earliest by `(scheduled, created, id)` with unknown
/// scheduled times sorting last. Only members scheduled at-or-after the
/// keeper are deleted; a member scheduled strictly earlier is left alone.
#[must_use]
pub fn plan_dedup(group: &[SequenceTask]) -> Option<DedupPlan> {
    if group.len() < 2 {
        return None;
    }

    let mut ordered: Vec<(i64, i64, String, TaskId)> = group
        .iter()
        .map(|task| {
            (
                task_scheduled_ms(task).unwrap_or(i64::MAX),
                task.created_ms,
                task.id.to_string(),
                task.id,
            )
        })
        .collect();
    ordered.sort();

    let (keep_scheduled, _, _, keep) = ordered[0].clone();
    let delete = ordered
        .iter()
        .skip(1)
        .filter(|(scheduled, _, _, _)| *scheduled >= keep_scheduled)
        .map(|(_, _, _, id)| *id)
        .collect();

    Some(DedupPlan { keep, delete })
}

/// Parses an RFC3339 timestamp into unix milliseconds.
///
/// # Errors
/// Returns [`SequenceError::Validation`] when parsing fails.
pub fn rfc3339_to_ms(value: &str) -> Result<i64, SequenceError> {
    let parsed = OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
        .map_err(|err| SequenceError::Validation(format!("invalid RFC3339 timestamp: {err}")))?;
    Ok(to_unix_ms(parsed))
}

/// Formats unix milliseconds as an RFC3339 UTC timestamp.
///
/// # Errors
/// Returns [`SequenceError::Validation`] when the value is out of range or
/// formatting fails.
pub fn ms_to_rfc3339(value: i64) -> Result<String, SequenceError> {
    let nanos = i128::from(value) * 1_000_000;
    let parsed = OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .map_err(|err| SequenceError::Validation(format!("timestamp out of range: {err}")))?;
    parsed
        .to_offset(UtcOffset::UTC)
        .format(&time::format_description::well_known::Rfc3339)
        .map_err(|err| SequenceError::Validation(format!("failed to format timestamp: {err}")))
}

#[must_use]
pub fn now_ms() -> i64 {
    to_unix_ms(OffsetDateTime::now_utc())
}

#[must_use]
#[allow(clippy::cast_possible_truncation)]
fn to_unix_ms(value: OffsetDateTime) -> i64 {
    (value.unix_timestamp_nanos() / 1_000_000) as i64
}
