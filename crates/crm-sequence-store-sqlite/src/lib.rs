#![allow(clippy::missing_errors_doc)]
#![allow(clippy::uninlined_format_args)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use crm_sequence_core::{
    dedup_group_key, find_next_step, ms_to_rfc3339, plan_dedup, resolve_progress, Contact,
    DelayAnchor, EmailId, EmailStatus, EngineConfig, Membership, NextStep, ScheduledEmail,
    Sequence, SequenceId, SequenceTask, Step, StepKind, TaskId, TaskPriority, TaskStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use ulid::Ulid;

const CRM_MIGRATION_VERSION: i64 = 1;

/// Per-transaction write limits of the backing store, applied to the two
/// batch passes. Chunks commit sequentially, never in parallel.
const BACKFILL_CHUNK_SIZE: usize = 25;
const DEDUP_CHUNK_SIZE: usize = 450;

const SCHEMA_CRM_V1: &str = r"
CREATE TABLE IF NOT EXISTS sequences (
  id TEXT PRIMARY KEY,
  name TEXT NOT NULL,
  steps_json TEXT NOT NULL,
  created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS contacts (
  id TEXT PRIMARY KEY,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  company TEXT,
  email TEXT
);

CREATE TABLE IF NOT EXISTS legacy_contacts (
  id TEXT PRIMARY KEY,
  first_name TEXT NOT NULL,
  last_name TEXT NOT NULL,
  company TEXT,
  email TEXT
);

CREATE TABLE IF NOT EXISTS memberships (
  sequence_id TEXT NOT NULL,
  contact_id TEXT NOT NULL,
  owner_id TEXT,
  created_ms INTEGER NOT NULL,
  PRIMARY KEY (sequence_id, contact_id)
);

CREATE TABLE IF NOT EXISTS scheduled_emails (
  id TEXT PRIMARY KEY,
  sequence_id TEXT NOT NULL,
  contact_id TEXT NOT NULL,
  step_index INTEGER NOT NULL CHECK (step_index >= 0),
  status TEXT NOT NULL CHECK (
    status IN ('not_generated', 'generated', 'sent', 'rejected', 'cancelled')
  ),
  scheduled_send_ms INTEGER NOT NULL,
  created_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_scheduled_emails_sequence_contact
  ON scheduled_emails(sequence_id, contact_id, step_index);

CREATE TABLE IF NOT EXISTS tasks (
  id TEXT PRIMARY KEY,
  sequence_id TEXT,
  contact_id TEXT,
  contact_name TEXT,
  company TEXT,
  step_index INTEGER CHECK (step_index >= 0 OR step_index IS NULL),
  is_sequence_task INTEGER NOT NULL DEFAULT 0 CHECK (is_sequence_task IN (0, 1)),
  task_type TEXT NOT NULL CHECK (
    task_type IN (
      'auto_email',
      'manual_email',
      'phone_call',
      'linkedin_connect',
      'linkedin_message',
      'linkedin_view_profile',
      'linkedin_interact_post',
      'task'
    )
  ),
  title TEXT NOT NULL,
  note TEXT,
  priority TEXT NOT NULL CHECK (priority IN ('low', 'normal', 'high')),
  status TEXT NOT NULL CHECK (status IN ('pending', 'completed', 'cancelled', 'deleted')),
  due_ms INTEGER,
  due_date TEXT,
  due_time TEXT,
  owner_id TEXT,
  assigned_to TEXT,
  created_by TEXT,
  created_ms INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_tasks_sequence_contact_step
  ON tasks(sequence_id, contact_id, step_index);
CREATE INDEX IF NOT EXISTS idx_tasks_status_flag
  ON tasks(status, is_sequence_task);
";

pub struct SqliteCrmStore {
    conn: Connection,
    config: EngineConfig,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct AdvanceReport {
    pub contract_version: String,
    pub success: bool,
    pub next_step_kind: Option<StepKind>,
    pub task_id: Option<TaskId>,
    pub email_id: Option<EmailId>,
    pub scheduled_ms: Option<i64>,
    pub scheduled_at: Option<String>,
    pub message: Option<String>,
}

impl AdvanceReport {
    fn no_advance(message: impl Into<String>) -> Self {
        Self {
            contract_version: "advance_report.v1".to_string(),
            success: false,
            next_step_kind: None,
            task_id: None,
            email_id: None,
            scheduled_ms: None,
            scheduled_at: None,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct BackfillReport {
    pub contract_version: String,
    pub dry_run: bool,
    pub memberships_scanned: usize,
    pub tasks_to_create: usize,
    pub tasks_created: usize,
    pub skipped: usize,
    pub skipped_reasons: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DedupOptions {
    pub apply: bool,
    pub only_flagged: bool,
    pub max_deletes: Option<usize>,
}

impl Default for DedupOptions {
    fn default() -> Self {
        Self {
            apply: false,
            only_flagged: true,
            max_deletes: None,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct DedupReport {
    pub contract_version: String,
    pub apply: bool,
    pub contacts_with_duplicates: usize,
    pub tasks_to_delete: usize,
    pub tasks_deleted: usize,
    pub capped: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReportScope {
    Owner(String),
    Admin,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TaskPreviewRow {
    pub id: TaskId,
    pub title: String,
    pub task_type: StepKind,
    pub status: TaskStatus,
    pub owner_id: Option<String>,
    pub due_at: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct TaskReport {
    pub contract_version: String,
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_type: BTreeMap<String, usize>,
    pub by_owner: BTreeMap<String, usize>,
    pub preview: Vec<TaskPreviewRow>,
}

impl SqliteCrmStore {
    /// Opens the backing store. Store unavailability is a fatal
    /// precondition; nothing is retried here.
    pub fn open(path: &Path, config: EngineConfig) -> Result<Self> {
        config
            .validate()
            .map_err(|err| anyhow!("invalid engine configuration: {err}"))?;

        let conn = Connection::open(path)
            .with_context(|| format!("failed to open sqlite database at {}", path.display()))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to configure sqlite pragmas")?;

        Ok(Self { conn, config })
    }

    pub fn migrate(&self) -> Result<()> {
        self.conn
            .execute_batch(
                "CREATE TABLE IF NOT EXISTS schema_migrations (
                    version INTEGER PRIMARY KEY,
                    applied_at TEXT NOT NULL
                );",
            )
            .context("failed to ensure schema_migrations exists")?;

        self.conn
            .execute_batch(SCHEMA_CRM_V1)
            .context("failed to apply crm schema")?;

        let now = ms_to_rfc3339(crm_sequence_core::now_ms())
            .map_err(|err| anyhow!(err.to_string()))?;
        self.conn
            .execute(
                "INSERT OR IGNORE INTO schema_migrations(version, applied_at) VALUES (?1, ?2)",
                params![CRM_MIGRATION_VERSION, now],
            )
            .context("failed to register crm schema migration")?;

        Ok(())
    }

    pub fn upsert_sequence(&self, sequence: &Sequence) -> Result<()> {
        sequence
            .validate()
            .map_err(|err| anyhow!("invalid sequence: {err}"))?;

        let steps_json =
            serde_json::to_string(&sequence.steps).context("failed to serialize steps")?;
        let now = ms_to_rfc3339(crm_sequence_core::now_ms())
            .map_err(|err| anyhow!(err.to_string()))?;

        self.conn
            .execute(
                "INSERT INTO sequences(id, name, steps_json, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                   name = excluded.name,
                   steps_json = excluded.steps_json",
                params![sequence.id.to_string(), sequence.name, steps_json, now],
            )
            .context("failed to upsert sequence")?;

        Ok(())
    }

    pub fn get_sequence(&self, sequence_id: SequenceId) -> Result<Option<Sequence>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT name, steps_json FROM sequences WHERE id = ?1",
                params![sequence_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .context("failed to query sequence")?;

        let Some((name, steps_json)) = row else {
            return Ok(None);
        };

        let steps: Vec<Step> =
            serde_json::from_str(&steps_json).context("invalid stored steps JSON")?;
        Ok(Some(Sequence {
            id: sequence_id,
            name,
            steps,
        }))
    }

    pub fn list_sequences(&self) -> Result<Vec<Sequence>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, steps_json FROM sequences ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            let id_raw: String = row.get(0)?;
            let name: String = row.get(1)?;
            let steps_json: String = row.get(2)?;
            Ok((id_raw, name, steps_json))
        })?;

        let mut sequences = Vec::new();
        for row in rows {
            let (id_raw, name, steps_json) = row.context("failed reading sequence row")?;
            let id = SequenceId(parse_ulid(&id_raw)?);
            let steps: Vec<Step> = serde_json::from_str(&steps_json)
                .with_context(|| format!("invalid stored steps JSON for sequence {id_raw}"))?;
            sequences.push(Sequence { id, name, steps });
        }

        Ok(sequences)
    }

    pub fn upsert_contact(&self, contact: &Contact) -> Result<()> {
        self.upsert_contact_in(contact, "contacts")
    }

    /// Writes into the legacy person collection; reads fall back to it when
    /// the primary collection misses.
    pub fn upsert_legacy_contact(&self, contact: &Contact) -> Result<()> {
        self.upsert_contact_in(contact, "legacy_contacts")
    }

    fn upsert_contact_in(&self, contact: &Contact, table: &str) -> Result<()> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO {table}(id, first_name, last_name, company, email)
                     VALUES (?1, ?2, ?3, ?4, ?5)
                     ON CONFLICT(id) DO UPDATE SET
                       first_name = excluded.first_name,
                       last_name = excluded.last_name,
                       company = excluded.company,
                       email = excluded.email"
                ),
                params![
                    contact.id,
                    contact.first_name,
                    contact.last_name,
                    contact.company,
                    contact.email
                ],
            )
            .with_context(|| format!("failed to upsert contact into {table}"))?;
        Ok(())
    }

    /// Resolves a contact id against the primary collection, then the
    /// legacy fallback collection.
    pub fn resolve_contact(&self, contact_id: &str) -> Result<Option<Contact>> {
        for table in ["contacts", "legacy_contacts"] {
            let found = self
                .conn
                .query_row(
                    &format!(
                        "SELECT id, first_name, last_name, company, email
                         FROM {table} WHERE id = ?1"
                    ),
                    params![contact_id],
                    parse_contact_row,
                )
                .optional()
                .with_context(|| format!("failed to query {table}"))?;

            if found.is_some() {
                return Ok(found);
            }
        }
        Ok(None)
    }

    pub fn enroll(&self, membership: &Membership) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO memberships(sequence_id, contact_id, owner_id, created_ms)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(sequence_id, contact_id) DO UPDATE SET
                   owner_id = excluded.owner_id,
                   created_ms = excluded.created_ms",
                params![
                    membership.sequence_id.to_string(),
                    membership.contact_id,
                    membership.owner_id,
                    membership.created_ms
                ],
            )
            .context("failed to enroll membership")?;
        Ok(())
    }

    pub fn remove_membership(&self, sequence_id: SequenceId, contact_id: &str) -> Result<bool> {
        let removed = self
            .conn
            .execute(
                "DELETE FROM memberships WHERE sequence_id = ?1 AND contact_id = ?2",
                params![sequence_id.to_string(), contact_id],
            )
            .context("failed to remove membership")?;
        Ok(removed > 0)
    }

    pub fn get_membership(
        &self,
        sequence_id: SequenceId,
        contact_id: &str,
    ) -> Result<Option<Membership>> {
        self.conn
            .query_row(
                "SELECT sequence_id, contact_id, owner_id, created_ms
                 FROM memberships WHERE sequence_id = ?1 AND contact_id = ?2",
                params![sequence_id.to_string(), contact_id],
                parse_membership_row,
            )
            .optional()
            .context("failed to query membership")
    }

    pub fn list_memberships(&self) -> Result<Vec<Membership>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_id, contact_id, owner_id, created_ms
             FROM memberships ORDER BY sequence_id ASC, contact_id ASC",
        )?;
        let rows = stmt.query_map([], parse_membership_row)?;
        collect_rows(rows)
    }

    pub fn insert_email(&self, email: &ScheduledEmail) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO scheduled_emails(
                    id, sequence_id, contact_id, step_index, status,
                    scheduled_send_ms, created_ms
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    email.id.to_string(),
                    email.sequence_id.to_string(),
                    email.contact_id,
                    i64::from(email.step_index),
                    email.status.as_str(),
                    email.scheduled_send_ms,
                    email.created_ms
                ],
            )
            .context("failed to insert scheduled email")?;
        Ok(())
    }

    pub fn get_email(&self, email_id: EmailId) -> Result<Option<ScheduledEmail>> {
        self.conn
            .query_row(
                "SELECT id, sequence_id, contact_id, step_index, status,
                        scheduled_send_ms, created_ms
                 FROM scheduled_emails WHERE id = ?1",
                params![email_id.to_string()],
                parse_email_row,
            )
            .optional()
            .context("failed to query scheduled email")
    }

    pub fn list_emails_for(
        &self,
        sequence_id: SequenceId,
        contact_id: &str,
    ) -> Result<Vec<ScheduledEmail>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sequence_id, contact_id, step_index, status,
                    scheduled_send_ms, created_ms
             FROM scheduled_emails
             WHERE sequence_id = ?1 AND contact_id = ?2
             ORDER BY step_index ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![sequence_id.to_string(), contact_id], parse_email_row)?;
        collect_rows(rows)
    }

    pub fn list_all_emails(&self) -> Result<Vec<ScheduledEmail>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, sequence_id, contact_id, step_index, status,
                    scheduled_send_ms, created_ms
             FROM scheduled_emails ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], parse_email_row)?;
        collect_rows(rows)
    }

    /// Mutates email status on behalf of the external send pipeline.
    pub fn set_email_status(&self, email_id: EmailId, status: EmailStatus) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE scheduled_emails SET status = ?2 WHERE id = ?1",
                params![email_id.to_string(), status.as_str()],
            )
            .context("failed to update email status")?;
        if updated == 0 {
            return Err(anyhow!("scheduled email not found: {email_id}"));
        }
        Ok(())
    }

    pub fn insert_task(&self, task: &SequenceTask) -> Result<()> {
        insert_task_with(&self.conn, task)
    }

    pub fn get_task(&self, task_id: TaskId) -> Result<Option<SequenceTask>> {
        self.conn
            .query_row(
                &format!("{TASK_SELECT} WHERE id = ?1"),
                params![task_id.to_string()],
                parse_task_row,
            )
            .optional()
            .context("failed to query task")
    }

    pub fn complete_task(&self, task_id: TaskId) -> Result<()> {
        let updated = self
            .conn
            .execute(
                "UPDATE tasks SET status = 'completed' WHERE id = ?1",
                params![task_id.to_string()],
            )
            .context("failed to complete task")?;
        if updated == 0 {
            return Err(anyhow!("task not found: {task_id}"));
        }
        Ok(())
    }

    fn list_pending_tasks(&self, only_flagged: bool) -> Result<Vec<SequenceTask>> {
        let query = if only_flagged {
            format!("{TASK_SELECT} WHERE status = 'pending' AND is_sequence_task = 1 ORDER BY id ASC")
        } else {
            format!("{TASK_SELECT} WHERE status = 'pending' ORDER BY id ASC")
        };
        let mut stmt = self.conn.prepare(&query)?;
        let rows = stmt.query_map([], parse_task_row)?;
        collect_rows(rows)
    }

    fn task_exists_for_step(
        &self,
        sequence_id: SequenceId,
        contact_id: &str,
        step_index: u32,
    ) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM tasks
                 WHERE sequence_id = ?1 AND contact_id = ?2 AND step_index = ?3
                   AND is_sequence_task = 1 AND status IN ('pending', 'completed')
                 LIMIT 1",
                params![sequence_id.to_string(), contact_id, i64::from(step_index)],
                |row| row.get(0),
            )
            .optional()
            .context("failed to probe for existing step task")?;
        Ok(found.is_some())
    }

    /// Advances one contact after a sequence task was completed.
    ///
    /// The membership is re-checked immediately before any write so a
    /// removed contact is never resurrected. All failure shapes short of a
    /// missing task are reported, not raised, matching the event-endpoint
    /// contract.
    pub fn advance_from_task(
        &self,
        task_id: TaskId,
        anchor: DelayAnchor,
        now_ms: i64,
    ) -> Result<AdvanceReport> {
        let Some(task) = self.get_task(task_id)? else {
            return Err(anyhow!("task not found: {task_id}"));
        };

        let (Some(sequence_id), Some(contact_id)) = (task.sequence_id, task.contact_id.clone())
        else {
            return Ok(AdvanceReport::no_advance(
                "no next step created: task is not part of a sequence",
            ));
        };

        let Some(membership) = self.get_membership(sequence_id, &contact_id)? else {
            return Ok(AdvanceReport::no_advance(
                "no next step created: membership removed",
            ));
        };

        let Some(sequence) = self.get_sequence(sequence_id)? else {
            return Ok(AdvanceReport::no_advance(
                "no next step created: sequence not found",
            ));
        };

        let emails = self.list_emails_for(sequence_id, &contact_id)?;
        // Progress is derived from emails; the just-completed task's own
        // step also counts as reached so the walk starts past it.
        let current = match (resolve_progress(&emails, now_ms), task.step_index) {
            (Some(from_emails), Some(own)) => Some(from_emails.max(own)),
            (Some(from_emails), None) => Some(from_emails),
            (None, own) => own,
        };

        let next = find_next_step(&sequence.steps, current, &emails, false);
        let base_ms = match anchor {
            DelayAnchor::AtCompletion => now_ms,
            DelayAnchor::AtEnrollment => membership.created_ms,
        };

        match next {
            NextStep::Complete => Ok(AdvanceReport::no_advance("sequence complete")),
            NextStep::Blocked { email_index } => Ok(AdvanceReport::no_advance(format!(
                "waiting for email step {email_index} to be created"
            ))),
            NextStep::Email {
                index,
                step,
                delay_ms,
            } => {
                let Some(contact) = self.resolve_contact(&contact_id)? else {
                    return Ok(AdvanceReport::no_advance(
                        "no next step created: contact not found",
                    ));
                };
                let has_email = contact
                    .email
                    .as_deref()
                    .is_some_and(|value| !value.trim().is_empty());
                if !has_email {
                    return Ok(AdvanceReport::no_advance(
                        "no next step created: contact has no email address",
                    ));
                }

                let scheduled_send_ms = base_ms + delay_ms;
                let email = ScheduledEmail {
                    id: EmailId(Ulid::new()),
                    sequence_id,
                    contact_id: contact.id.clone(),
                    step_index: index,
                    status: EmailStatus::NotGenerated,
                    scheduled_send_ms,
                    created_ms: now_ms,
                };
                self.insert_email(&email)?;

                Ok(AdvanceReport {
                    contract_version: "advance_report.v1".to_string(),
                    success: true,
                    next_step_kind: Some(step.kind),
                    task_id: None,
                    email_id: Some(email.id),
                    scheduled_ms: Some(scheduled_send_ms),
                    scheduled_at: Some(
                        ms_to_rfc3339(scheduled_send_ms).map_err(|err| anyhow!(err.to_string()))?,
                    ),
                    message: None,
                })
            }
            NextStep::Task {
                index,
                step,
                delay_ms,
            } => {
                if self.task_exists_for_step(sequence_id, &contact_id, index)? {
                    return Ok(AdvanceReport::no_advance("task already exists"));
                }

                let Some(contact) = self.resolve_contact(&contact_id)? else {
                    return Ok(AdvanceReport::no_advance(
                        "no next step created: contact not found",
                    ));
                };

                let due_ms = base_ms + delay_ms;
                let record =
                    self.step_task_record(sequence_id, &contact, &membership, &step, index, due_ms, now_ms);
                self.insert_task(&record)?;

                Ok(AdvanceReport {
                    contract_version: "advance_report.v1".to_string(),
                    success: true,
                    next_step_kind: Some(step.kind),
                    task_id: Some(record.id),
                    email_id: None,
                    scheduled_ms: Some(due_ms),
                    scheduled_at: Some(
                        ms_to_rfc3339(due_ms).map_err(|err| anyhow!(err.to_string()))?,
                    ),
                    message: None,
                })
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn step_task_record(
        &self,
        sequence_id: SequenceId,
        contact: &Contact,
        membership: &Membership,
        step: &Step,
        step_index: u32,
        due_ms: i64,
        now_ms: i64,
    ) -> SequenceTask {
        let owner = membership
            .owner_id
            .clone()
            .unwrap_or_else(|| self.config.default_owner.clone());

        SequenceTask {
            id: TaskId(Ulid::new()),
            sequence_id: Some(sequence_id),
            contact_id: Some(contact.id.clone()),
            contact_name: Some(contact.display_name()),
            company: contact.company.clone(),
            step_index: Some(step_index),
            is_sequence_task: true,
            task_type: step.kind,
            title: step
                .note
                .clone()
                .unwrap_or_else(|| step.kind.default_task_title().to_string()),
            note: step.note.clone(),
            priority: step.priority.unwrap_or_default(),
            status: TaskStatus::Pending,
            due_ms: Some(due_ms),
            due_date: None,
            due_time: None,
            owner_id: Some(owner.clone()),
            assigned_to: Some(owner.clone()),
            created_by: Some(owner),
            created_ms: now_ms,
        }
    }

    /// Full-population reconciliation: recreates task records that a missed
    /// live advance should have produced. Never creates email records; an
    /// unmaterialized email step is recorded as a wait, since email
    /// creation has its own external trigger.
    pub fn run_backfill(
        &mut self,
        dry_run: bool,
        anchor: DelayAnchor,
        now_ms: i64,
    ) -> Result<BackfillReport> {
        let sequences: BTreeMap<String, Sequence> = self
            .list_sequences()?
            .into_iter()
            .map(|sequence| (sequence.id.to_string(), sequence))
            .collect();

        let memberships = self.list_memberships()?;

        let mut emails_by_member: BTreeMap<String, Vec<ScheduledEmail>> = BTreeMap::new();
        for email in self.list_all_emails()? {
            let key = format!("{}_{}", email.sequence_id, email.contact_id);
            emails_by_member.entry(key).or_default().push(email);
        }

        // Existing sequence tasks of any status act as the seen-set so a
        // re-run never recreates what the previous run (or the live path)
        // already materialized.
        let mut seen = self.sequence_task_keys()?;

        let mut queue: Vec<SequenceTask> = Vec::new();
        let mut skipped_reasons: Vec<String> = Vec::new();
        let memberships_scanned = memberships.len();
        let empty: Vec<ScheduledEmail> = Vec::new();

        for membership in &memberships {
            let sequence_key = membership.sequence_id.to_string();
            let Some(sequence) = sequences.get(&sequence_key) else {
                skipped_reasons.push("sequence not found".to_string());
                continue;
            };

            let member_key = format!("{}_{}", sequence_key, membership.contact_id);
            let emails = emails_by_member.get(&member_key).unwrap_or(&empty);

            let current = resolve_progress(emails, now_ms);
            match find_next_step(&sequence.steps, current, emails, true) {
                NextStep::Complete => {
                    skipped_reasons.push("no pending task steps".to_string());
                }
                NextStep::Blocked { email_index } | NextStep::Email {
                    index: email_index, ..
                } => {
                    skipped_reasons.push(format!(
                        "Waiting for email step {email_index} to be created"
                    ));
                }
                NextStep::Task {
                    index,
                    step,
                    delay_ms,
                } => {
                    let task_key =
                        format!("{}_{}_{}", sequence_key, membership.contact_id, index);
                    if seen.contains(&task_key) {
                        skipped_reasons.push("task already exists".to_string());
                        continue;
                    }

                    let Some(contact) = self.resolve_contact(&membership.contact_id)? else {
                        skipped_reasons.push("contact not found".to_string());
                        continue;
                    };

                    let base_ms = match anchor {
                        DelayAnchor::AtEnrollment => membership.created_ms,
                        DelayAnchor::AtCompletion => now_ms,
                    };
                    queue.push(self.step_task_record(
                        membership.sequence_id,
                        &contact,
                        membership,
                        &step,
                        index,
                        base_ms + delay_ms,
                        now_ms,
                    ));
                    seen.insert(task_key);
                }
            }
        }

        let tasks_to_create = queue.len();
        let mut tasks_created = 0_usize;
        if !dry_run {
            for chunk in queue.chunks(BACKFILL_CHUNK_SIZE) {
                let tx = self
                    .conn
                    .transaction()
                    .context("failed to start backfill chunk transaction")?;
                for task in chunk {
                    insert_task_with(&tx, task)?;
                }
                tx.commit().context("failed to commit backfill chunk")?;
                tasks_created += chunk.len();
            }
        }

        let skipped = skipped_reasons.len();
        skipped_reasons.truncate(10);

        Ok(BackfillReport {
            contract_version: "backfill_report.v1".to_string(),
            dry_run,
            memberships_scanned,
            tasks_to_create,
            tasks_created,
            skipped,
            skipped_reasons,
        })
    }

    fn sequence_task_keys(&self) -> Result<BTreeSet<String>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_id, contact_id, step_index FROM tasks
             WHERE is_sequence_task = 1
               AND sequence_id IS NOT NULL
               AND contact_id IS NOT NULL
               AND step_index IS NOT NULL",
        )?;
        let rows = stmt.query_map([], |row| {
            let sequence_id: String = row.get(0)?;
            let contact_id: String = row.get(1)?;
            let step_index: i64 = row.get(2)?;
            Ok(format!("{sequence_id}_{contact_id}_{step_index}"))
        })?;

        let mut keys = BTreeSet::new();
        for row in rows {
            keys.insert(row.context("failed reading task key row")?);
        }
        Ok(keys)
    }

    /// Restores the at-most-one-pending invariant by deleting duplicate
    /// pending step records. Dry-run by default; deletes are chunked and
    /// committed sequentially.
    pub fn run_dedup(&mut self, options: &DedupOptions) -> Result<DedupReport> {
        let pending = self.list_pending_tasks(options.only_flagged)?;

        let mut groups: BTreeMap<String, Vec<SequenceTask>> = BTreeMap::new();
        for task in pending {
            groups.entry(dedup_group_key(&task)).or_default().push(task);
        }

        let mut contacts_with_duplicates = 0_usize;
        let mut deletes: Vec<TaskId> = Vec::new();
        for group in groups.values() {
            if let Some(plan) = plan_dedup(group) {
                if !plan.delete.is_empty() {
                    contacts_with_duplicates += 1;
                    deletes.extend(plan.delete);
                }
            }
        }

        let mut capped = false;
        if let Some(max_deletes) = options.max_deletes {
            if deletes.len() > max_deletes {
                deletes.truncate(max_deletes);
                capped = true;
            }
        }

        let tasks_to_delete = deletes.len();
        let mut tasks_deleted = 0_usize;
        if options.apply {
            for chunk in deletes.chunks(DEDUP_CHUNK_SIZE) {
                let tx = self
                    .conn
                    .transaction()
                    .context("failed to start dedup chunk transaction")?;
                for task_id in chunk {
                    tx.execute(
                        "DELETE FROM tasks WHERE id = ?1",
                        params![task_id.to_string()],
                    )
                    .context("failed to delete duplicate task")?;
                }
                tx.commit().context("failed to commit dedup chunk")?;
                tasks_deleted += chunk.len();
            }
        }

        Ok(DedupReport {
            contract_version: "dedup_report.v1".to_string(),
            apply: options.apply,
            contacts_with_duplicates,
            tasks_to_delete,
            tasks_deleted,
            capped,
        })
    }

    /// Read-only aggregation of task records for ops visibility.
    pub fn task_report(&self, scope: &ReportScope, limit: usize) -> Result<TaskReport> {
        let tasks = match scope {
            ReportScope::Admin => {
                let mut stmt = self
                    .conn
                    .prepare(&format!("{TASK_SELECT} ORDER BY id ASC"))?;
                let rows = stmt.query_map([], parse_task_row)?;
                collect_rows(rows)?
            }
            ReportScope::Owner(owner) => {
                let mut stmt = self.conn.prepare(&format!(
                    "{TASK_SELECT} WHERE is_sequence_task = 1 AND owner_id = ?1 ORDER BY id ASC"
                ))?;
                let rows = stmt.query_map(params![owner], parse_task_row)?;
                collect_rows(rows)?
            }
        };

        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_owner: BTreeMap<String, usize> = BTreeMap::new();
        for task in &tasks {
            *by_status.entry(task.status.as_str().to_string()).or_default() += 1;
            *by_type
                .entry(task.task_type.as_str().to_string())
                .or_default() += 1;
            let owner = task.owner_id.clone().unwrap_or_else(|| "none".to_string());
            *by_owner.entry(owner).or_default() += 1;
        }

        let mut preview = Vec::new();
        for task in tasks.iter().take(limit) {
            let due_at = match task.due_ms {
                Some(due_ms) => {
                    Some(ms_to_rfc3339(due_ms).map_err(|err| anyhow!(err.to_string()))?)
                }
                None => None,
            };
            preview.push(TaskPreviewRow {
                id: task.id,
                title: task.title.clone(),
                task_type: task.task_type,
                status: task.status,
                owner_id: task.owner_id.clone(),
                due_at,
            });
        }

        Ok(TaskReport {
            contract_version: "task_report.v1".to_string(),
            total: tasks.len(),
            by_status,
            by_type,
            by_owner,
            preview,
        })
    }
}

const TASK_SELECT: &str = "SELECT
    id, sequence_id, contact_id, contact_name, company, step_index,
    is_sequence_task, task_type, title, note, priority, status,
    due_ms, due_date, due_time, owner_id, assigned_to, created_by, created_ms
 FROM tasks";

fn insert_task_with(conn: &Connection, task: &SequenceTask) -> Result<()> {
    conn.execute(
        "INSERT INTO tasks(
            id, sequence_id, contact_id, contact_name, company, step_index,
            is_sequence_task, task_type, title, note, priority, status,
            due_ms, due_date, due_time, owner_id, assigned_to, created_by, created_ms
         ) VALUES (
            ?1, ?2, ?3, ?4, ?5, ?6,
            ?7, ?8, ?9, ?10, ?11, ?12,
            ?13, ?14, ?15, ?16, ?17, ?18, ?19
         )",
        params![
            task.id.to_string(),
            task.sequence_id.map(|id| id.to_string()),
            task.contact_id,
            task.contact_name,
            task.company,
            task.step_index.map(i64::from),
            i64::from(task.is_sequence_task),
            task.task_type.as_str(),
            task.title,
            task.note,
            task.priority.as_str(),
            task.status.as_str(),
            task.due_ms,
            task.due_date,
            task.due_time,
            task.owner_id,
            task.assigned_to,
            task.created_by,
            task.created_ms
        ],
    )
    .context("failed to insert task")?;
    Ok(())
}

fn collect_rows<T, F>(rows: rusqlite::MappedRows<'_, F>) -> Result<Vec<T>>
where
    F: FnMut(&rusqlite::Row<'_>) -> rusqlite::Result<T>,
{
    let mut items = Vec::new();
    for row in rows {
        items.push(row.context("failed reading result row")?);
    }
    Ok(items)
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

fn column_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_ulid_column(index: usize, raw: &str) -> rusqlite::Result<Ulid> {
    Ulid::from_string(raw).map_err(|err| column_error(index, format!("invalid ULID {raw}: {err}")))
}

fn parse_step_index_column(index: usize, raw: i64) -> rusqlite::Result<u32> {
    u32::try_from(raw).map_err(|_| column_error(index, format!("invalid step_index: {raw}")))
}

fn parse_contact_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Contact> {
    Ok(Contact {
        id: row.get(0)?,
        first_name: row.get(1)?,
        last_name: row.get(2)?,
        company: row.get(3)?,
        email: row.get(4)?,
    })
}

fn parse_membership_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Membership> {
    let sequence_raw: String = row.get(0)?;
    Ok(Membership {
        sequence_id: SequenceId(parse_ulid_column(0, &sequence_raw)?),
        contact_id: row.get(1)?,
        owner_id: row.get(2)?,
        created_ms: row.get(3)?,
    })
}

fn parse_email_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledEmail> {
    let id_raw: String = row.get(0)?;
    let sequence_raw: String = row.get(1)?;
    let step_index_raw: i64 = row.get(3)?;
    let status_raw: String = row.get(4)?;

    let status = EmailStatus::parse(&status_raw)
        .ok_or_else(|| column_error(4, format!("invalid email status: {status_raw}")))?;

    Ok(ScheduledEmail {
        id: EmailId(parse_ulid_column(0, &id_raw)?),
        sequence_id: SequenceId(parse_ulid_column(1, &sequence_raw)?),
        contact_id: row.get(2)?,
        step_index: parse_step_index_column(3, step_index_raw)?,
        status,
        scheduled_send_ms: row.get(5)?,
        created_ms: row.get(6)?,
    })
}

fn parse_task_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SequenceTask> {
    let id_raw: String = row.get(0)?;
    let sequence_raw: Option<String> = row.get(1)?;
    let step_index_raw: Option<i64> = row.get(5)?;
    let is_sequence_task_raw: i64 = row.get(6)?;
    let task_type_raw: String = row.get(7)?;
    let priority_raw: String = row.get(10)?;
    let status_raw: String = row.get(11)?;

    let sequence_id = match sequence_raw {
        Some(raw) => Some(SequenceId(parse_ulid_column(1, &raw)?)),
        None => None,
    };
    let step_index = match step_index_raw {
        Some(raw) => Some(parse_step_index_column(5, raw)?),
        None => None,
    };
    let task_type = StepKind::parse(&task_type_raw)
        .ok_or_else(|| column_error(7, format!("invalid task type: {task_type_raw}")))?;
    let priority = TaskPriority::parse(&priority_raw)
        .ok_or_else(|| column_error(10, format!("invalid priority: {priority_raw}")))?;
    let status = TaskStatus::parse(&status_raw)
        .ok_or_else(|| column_error(11, format!("invalid task status: {status_raw}")))?;

    Ok(SequenceTask {
        id: TaskId(parse_ulid_column(0, &id_raw)?),
        sequence_id,
        contact_id: row.get(2)?,
        contact_name: row.get(3)?,
        company: row.get(4)?,
        step_index,
        is_sequence_task: is_sequence_task_raw != 0,
        task_type,
        title: row.get(8)?,
        note: row.get(9)?,
        priority,
        status,
        due_ms: row.get(12)?,
        due_date: row.get(13)?,
        due_time: row.get(14)?,
        owner_id: row.get(15)?,
        assigned_to: row.get(16)?,
        created_by: row.get(17)?,
        created_ms: row.get(18)?,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use crm_sequence_core::MINUTE_MS;
    use proptest::prelude::*;
    use std::path::PathBuf;

    fn must<T, E: std::fmt::Display>(result: Result<T, E>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("expected Ok(..), got error: {err}"),
        }
    }

    fn must_some<T>(value: Option<T>) -> T {
        match value {
            Some(inner) => inner,
            None => panic!("expected Some(..), got None"),
        }
    }

    struct TempStore {
        store: SqliteCrmStore,
        path: PathBuf,
    }

    impl Drop for TempStore {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    fn open_temp_store() -> TempStore {
        let path = std::env::temp_dir().join(format!("crm-sequence-{}.sqlite3", Ulid::new()));
        let store = must(SqliteCrmStore::open(
            &path,
            EngineConfig {
                default_owner: "owner-fallback".to_string(),
            },
        ));
        must(store.migrate());
        TempStore { store, path }
    }

    fn email_step(id: &str, delay_minutes: u32) -> Step {
        Step {
            id: id.to_string(),
            kind: StepKind::AutoEmail,
            delay_minutes,
            paused: false,
            note: None,
            priority: None,
        }
    }

    fn task_step(id: &str, kind: StepKind, delay_minutes: u32) -> Step {
        Step {
            id: id.to_string(),
            kind,
            delay_minutes,
            paused: false,
            note: None,
            priority: None,
        }
    }

    fn fixture_contact(id: &str, email: Option<&str>) -> Contact {
        Contact {
            id: id.to_string(),
            first_name: "Jordan".to_string(),
            last_name: "Reyes".to_string(),
            company: Some("Northwind".to_string()),
            email: email.map(str::to_string),
        }
    }

    fn seed_sequence(store: &SqliteCrmStore, steps: Vec<Step>) -> SequenceId {
        let sequence = Sequence {
            id: SequenceId(Ulid::new()),
            name: "Outbound push".to_string(),
            steps,
        };
        must(store.upsert_sequence(&sequence));
        sequence.id
    }

    fn seed_membership(
        store: &SqliteCrmStore,
        sequence_id: SequenceId,
        contact_id: &str,
        owner: Option<&str>,
        created_ms: i64,
    ) {
        must(store.enroll(&Membership {
            sequence_id,
            contact_id: contact_id.to_string(),
            owner_id: owner.map(str::to_string),
            created_ms,
        }));
    }

    fn seed_sent_email(
        store: &SqliteCrmStore,
        sequence_id: SequenceId,
        contact_id: &str,
        step_index: u32,
    ) -> EmailId {
        let email = ScheduledEmail {
            id: EmailId(Ulid::new()),
            sequence_id,
            contact_id: contact_id.to_string(),
            step_index,
            status: EmailStatus::Sent,
            scheduled_send_ms: 1_000,
            created_ms: 1_000,
        };
        must(store.insert_email(&email));
        email.id
    }

    fn seed_step_task(
        store: &SqliteCrmStore,
        sequence_id: SequenceId,
        contact_id: &str,
        step_index: u32,
        status: TaskStatus,
    ) -> TaskId {
        let task = SequenceTask {
            id: TaskId(Ulid::new()),
            sequence_id: Some(sequence_id),
            contact_id: Some(contact_id.to_string()),
            contact_name: Some("Jordan Reyes".to_string()),
            company: Some("Northwind".to_string()),
            step_index: Some(step_index),
            is_sequence_task: true,
            task_type: StepKind::PhoneCall,
            title: "Call contact".to_string(),
            note: None,
            priority: TaskPriority::Normal,
            status,
            due_ms: Some(2_000),
            due_date: None,
            due_time: None,
            owner_id: Some("owner-1".to_string()),
            assigned_to: Some("owner-1".to_string()),
            created_by: Some("owner-1".to_string()),
            created_ms: 1_500,
        };
        must(store.insert_task(&task));
        task.id
    }

    fn pending_task_count(store: &SqliteCrmStore) -> usize {
        must(store.list_pending_tasks(true)).len()
    }

    #[test]
    fn advance_creates_next_task_after_completion() {
        let temp = open_temp_store();
        let now_ms = 100_000;
        let sequence_id = seed_sequence(
            &temp.store,
            vec![
                email_step("s0", 0),
                task_step("s1", StepKind::PhoneCall, 0),
                task_step("s2", StepKind::LinkedinConnect, 5),
            ],
        );
        must(temp.store.upsert_contact(&fixture_contact(
            "contact-1",
            Some("jordan@northwind.example"),
        )));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);
        seed_sent_email(&temp.store, sequence_id, "contact-1", 0);
        let task_id =
            seed_step_task(&temp.store, sequence_id, "contact-1", 1, TaskStatus::Pending);

        must(temp.store.complete_task(task_id));
        let report = must(
            temp.store
                .advance_from_task(task_id, DelayAnchor::AtCompletion, now_ms),
        );

        assert!(report.success);
        assert_eq!(report.next_step_kind, Some(StepKind::LinkedinConnect));
        assert_eq!(report.scheduled_ms, Some(now_ms + 5 * MINUTE_MS));
        let created = must_some(must(temp.store.get_task(must_some(report.task_id))));
        assert_eq!(created.step_index, Some(2));
        assert_eq!(created.owner_id, Some("owner-1".to_string()));
        assert_eq!(created.status, TaskStatus::Pending);
    }

    #[test]
    fn advance_falls_back_to_default_owner() {
        let temp = open_temp_store();
        let sequence_id = seed_sequence(
            &temp.store,
            vec![
                task_step("s0", StepKind::PhoneCall, 0),
                task_step("s1", StepKind::Task, 1),
            ],
        );
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", None, 10);
        let task_id =
            seed_step_task(&temp.store, sequence_id, "contact-1", 0, TaskStatus::Completed);

        let report = must(
            temp.store
                .advance_from_task(task_id, DelayAnchor::AtCompletion, 50_000),
        );

        assert!(report.success);
        let created = must_some(must(temp.store.get_task(must_some(report.task_id))));
        assert_eq!(created.owner_id, Some("owner-fallback".to_string()));
        assert_eq!(created.assigned_to, Some("owner-fallback".to_string()));
    }

    #[test]
    fn advance_materializes_missing_email() {
        let temp = open_temp_store();
        let now_ms = 200_000;
        let sequence_id = seed_sequence(
            &temp.store,
            vec![
                task_step("s0", StepKind::PhoneCall, 0),
                email_step("s1", 10),
            ],
        );
        must(temp.store.upsert_contact(&fixture_contact(
            "contact-1",
            Some("jordan@northwind.example"),
        )));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);
        let task_id =
            seed_step_task(&temp.store, sequence_id, "contact-1", 0, TaskStatus::Completed);

        let report = must(
            temp.store
                .advance_from_task(task_id, DelayAnchor::AtCompletion, now_ms),
        );

        assert!(report.success);
        assert_eq!(report.next_step_kind, Some(StepKind::AutoEmail));
        let email = must_some(must(temp.store.get_email(must_some(report.email_id))));
        assert_eq!(email.status, EmailStatus::NotGenerated);
        assert_eq!(email.step_index, 1);
        assert_eq!(email.scheduled_send_ms, now_ms + 10 * MINUTE_MS);
    }

    #[test]
    fn advance_requires_contact_email_for_email_steps() {
        let temp = open_temp_store();
        let sequence_id = seed_sequence(
            &temp.store,
            vec![task_step("s0", StepKind::PhoneCall, 0), email_step("s1", 10)],
        );
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);
        let task_id =
            seed_step_task(&temp.store, sequence_id, "contact-1", 0, TaskStatus::Completed);

        let report = must(
            temp.store
                .advance_from_task(task_id, DelayAnchor::AtCompletion, 50_000),
        );

        assert!(!report.success);
        let message = must_some(report.message);
        assert!(message.contains("no email address"), "message={message}");
        assert!(must(temp.store.list_emails_for(sequence_id, "contact-1")).is_empty());
    }

    #[test]
    fn advance_aborts_when_membership_removed() {
        let temp = open_temp_store();
        let sequence_id = seed_sequence(
            &temp.store,
            vec![
                task_step("s0", StepKind::PhoneCall, 0),
                task_step("s1", StepKind::Task, 1),
            ],
        );
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);
        let task_id =
            seed_step_task(&temp.store, sequence_id, "contact-1", 0, TaskStatus::Completed);
        let tasks_before = pending_task_count(&temp.store);

        must(temp.store.remove_membership(sequence_id, "contact-1"));
        let report = must(
            temp.store
                .advance_from_task(task_id, DelayAnchor::AtCompletion, 50_000),
        );

        assert!(!report.success);
        let message = must_some(report.message);
        assert!(message.contains("no next step created"), "message={message}");
        assert_eq!(pending_task_count(&temp.store), tasks_before);
        assert!(must(temp.store.list_emails_for(sequence_id, "contact-1")).is_empty());
    }

    #[test]
    fn advance_reports_existing_task_instead_of_duplicating() {
        let temp = open_temp_store();
        let sequence_id = seed_sequence(
            &temp.store,
            vec![
                task_step("s0", StepKind::PhoneCall, 0),
                task_step("s1", StepKind::Task, 1),
            ],
        );
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);
        let task_id =
            seed_step_task(&temp.store, sequence_id, "contact-1", 0, TaskStatus::Completed);
        seed_step_task(&temp.store, sequence_id, "contact-1", 1, TaskStatus::Pending);
        let tasks_before = pending_task_count(&temp.store);

        let report = must(
            temp.store
                .advance_from_task(task_id, DelayAnchor::AtCompletion, 50_000),
        );

        assert!(!report.success);
        assert_eq!(report.message, Some("task already exists".to_string()));
        assert_eq!(pending_task_count(&temp.store), tasks_before);
    }

    #[test]
    fn advance_reports_sequence_complete() {
        let temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);
        let task_id =
            seed_step_task(&temp.store, sequence_id, "contact-1", 0, TaskStatus::Completed);

        let report = must(
            temp.store
                .advance_from_task(task_id, DelayAnchor::AtCompletion, 50_000),
        );

        assert!(!report.success);
        assert_eq!(report.message, Some("sequence complete".to_string()));
    }

    #[test]
    fn backfill_creates_missing_tasks_and_reruns_clean() {
        let mut temp = open_temp_store();
        let now_ms = 500_000;
        let sequence_id = seed_sequence(
            &temp.store,
            vec![email_step("s0", 0), task_step("s1", StepKind::PhoneCall, 5)],
        );
        for contact_id in ["contact-1", "contact-2"] {
            must(temp.store.upsert_contact(&fixture_contact(contact_id, None)));
            seed_membership(&temp.store, sequence_id, contact_id, Some("owner-1"), 10_000);
            seed_sent_email(&temp.store, sequence_id, contact_id, 0);
        }

        let first = must(
            temp.store
                .run_backfill(false, DelayAnchor::AtEnrollment, now_ms),
        );
        assert_eq!(first.memberships_scanned, 2);
        assert_eq!(first.tasks_to_create, 2);
        assert_eq!(first.tasks_created, 2);

        // Second apply run is a no-op: the seen-set already contains both keys.
        let second = must(
            temp.store
                .run_backfill(false, DelayAnchor::AtEnrollment, now_ms),
        );
        assert_eq!(second.tasks_to_create, 0);
        assert_eq!(second.tasks_created, 0);
        assert!(second
            .skipped_reasons
            .iter()
            .all(|reason| reason == "task already exists"));
        assert_eq!(pending_task_count(&temp.store), 2);
    }

    #[test]
    fn backfill_anchors_due_time_at_enrollment() {
        let mut temp = open_temp_store();
        let enrolled_ms = 10_000;
        let sequence_id = seed_sequence(
            &temp.store,
            vec![email_step("s0", 0), task_step("s1", StepKind::PhoneCall, 5)],
        );
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), enrolled_ms);
        seed_sent_email(&temp.store, sequence_id, "contact-1", 0);

        must(
            temp.store
                .run_backfill(false, DelayAnchor::AtEnrollment, 900_000),
        );

        let pending = must(temp.store.list_pending_tasks(true));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].due_ms, Some(enrolled_ms + 5 * MINUTE_MS));
    }

    #[test]
    fn backfill_records_waiting_for_email_step() {
        let mut temp = open_temp_store();
        let sequence_id = seed_sequence(
            &temp.store,
            vec![email_step("s0", 0), task_step("s1", StepKind::PhoneCall, 5)],
        );
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);

        let report = must(
            temp.store
                .run_backfill(true, DelayAnchor::AtEnrollment, 50_000),
        );

        assert_eq!(report.tasks_to_create, 0);
        assert_eq!(report.skipped, 1);
        assert_eq!(
            report.skipped_reasons,
            vec!["Waiting for email step 0 to be created".to_string()]
        );
    }

    #[test]
    fn backfill_records_contact_not_found() {
        let mut temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        seed_membership(&temp.store, sequence_id, "ghost-contact", Some("owner-1"), 10);

        let report = must(
            temp.store
                .run_backfill(true, DelayAnchor::AtEnrollment, 50_000),
        );

        assert_eq!(report.tasks_to_create, 0);
        assert_eq!(report.skipped_reasons, vec!["contact not found".to_string()]);
    }

    #[test]
    fn backfill_dry_run_writes_nothing() {
        let mut temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
        seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 10);

        let report = must(
            temp.store
                .run_backfill(true, DelayAnchor::AtEnrollment, 50_000),
        );

        assert!(report.dry_run);
        assert_eq!(report.tasks_to_create, 1);
        assert_eq!(report.tasks_created, 0);
        assert_eq!(pending_task_count(&temp.store), 0);
    }

    #[test]
    fn dedup_keeps_earliest_scheduled_duplicate() {
        let mut temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        let later = seed_dup_task(&temp.store, sequence_id, Some(100), 50);
        let earlier = seed_dup_task(&temp.store, sequence_id, Some(90), 60);

        let report = must(temp.store.run_dedup(&DedupOptions {
            apply: true,
            only_flagged: true,
            max_deletes: None,
        }));

        assert_eq!(report.contacts_with_duplicates, 1);
        assert_eq!(report.tasks_to_delete, 1);
        assert_eq!(report.tasks_deleted, 1);
        assert!(must(temp.store.get_task(later)).is_none());
        assert!(must(temp.store.get_task(earlier)).is_some());
    }

    #[test]
    fn dedup_restores_at_most_one_pending_per_contact() {
        let mut temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        for due in [300, 200, 100] {
            seed_dup_task(&temp.store, sequence_id, Some(due), due);
        }

        must(temp.store.run_dedup(&DedupOptions {
            apply: true,
            only_flagged: true,
            max_deletes: None,
        }));

        let pending = must(temp.store.list_pending_tasks(true));
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].due_ms, Some(100));
    }

    #[test]
    fn dedup_dry_run_deletes_nothing() {
        let mut temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        seed_dup_task(&temp.store, sequence_id, Some(100), 50);
        seed_dup_task(&temp.store, sequence_id, Some(90), 60);

        let report = must(temp.store.run_dedup(&DedupOptions::default()));

        assert!(!report.apply);
        assert_eq!(report.tasks_to_delete, 1);
        assert_eq!(report.tasks_deleted, 0);
        assert_eq!(pending_task_count(&temp.store), 2);
    }

    #[test]
    fn dedup_respects_max_deletes_cap() {
        let mut temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        for due in [400, 300, 200, 100] {
            seed_dup_task(&temp.store, sequence_id, Some(due), due);
        }

        let report = must(temp.store.run_dedup(&DedupOptions {
            apply: true,
            only_flagged: true,
            max_deletes: Some(1),
        }));

        assert!(report.capped);
        assert_eq!(report.tasks_deleted, 1);
        assert_eq!(pending_task_count(&temp.store), 3);
    }

    #[test]
    fn dedup_groups_legacy_tasks_without_contact_id() {
        let mut temp = open_temp_store();
        for created in [10, 20] {
            let task = SequenceTask {
                id: TaskId(Ulid::new()),
                sequence_id: None,
                contact_id: None,
                contact_name: Some("Ada  Lovelace".to_string()),
                company: Some("Analytical Engines".to_string()),
                step_index: None,
                is_sequence_task: true,
                task_type: StepKind::Task,
                title: "Follow up".to_string(),
                note: None,
                priority: TaskPriority::Normal,
                status: TaskStatus::Pending,
                due_ms: Some(1_000),
                due_date: None,
                due_time: None,
                owner_id: Some("owner-1".to_string()),
                assigned_to: None,
                created_by: None,
                created_ms: created,
            };
            must(temp.store.insert_task(&task));
        }

        let report = must(temp.store.run_dedup(&DedupOptions::default()));
        assert_eq!(report.contacts_with_duplicates, 1);
        assert_eq!(report.tasks_to_delete, 1);
    }

    fn seed_dup_task(
        store: &SqliteCrmStore,
        sequence_id: SequenceId,
        due_ms: Option<i64>,
        created_ms: i64,
    ) -> TaskId {
        let task = SequenceTask {
            id: TaskId(Ulid::new()),
            sequence_id: Some(sequence_id),
            contact_id: Some("contact-1".to_string()),
            contact_name: Some("Jordan Reyes".to_string()),
            company: Some("Northwind".to_string()),
            step_index: Some(0),
            is_sequence_task: true,
            task_type: StepKind::PhoneCall,
            title: "Call contact".to_string(),
            note: None,
            priority: TaskPriority::Normal,
            status: TaskStatus::Pending,
            due_ms,
            due_date: None,
            due_time: None,
            owner_id: Some("owner-1".to_string()),
            assigned_to: Some("owner-1".to_string()),
            created_by: Some("owner-1".to_string()),
            created_ms,
        };
        must(store.insert_task(&task));
        task.id
    }

    #[test]
    fn contact_resolution_falls_back_to_legacy_collection() {
        let temp = open_temp_store();
        must(temp
            .store
            .upsert_legacy_contact(&fixture_contact("old-contact", Some("old@x.example"))));

        let resolved = must_some(must(temp.store.resolve_contact("old-contact")));
        assert_eq!(resolved.email, Some("old@x.example".to_string()));
        assert!(must(temp.store.resolve_contact("missing")).is_none());
    }

    #[test]
    fn contact_resolution_prefers_primary_collection() {
        let temp = open_temp_store();
        must(temp
            .store
            .upsert_legacy_contact(&fixture_contact("contact-1", Some("legacy@x.example"))));
        must(temp
            .store
            .upsert_contact(&fixture_contact("contact-1", Some("primary@x.example"))));

        let resolved = must_some(must(temp.store.resolve_contact("contact-1")));
        assert_eq!(resolved.email, Some("primary@x.example".to_string()));
    }

    #[test]
    fn sequence_round_trips_through_steps_json() {
        let temp = open_temp_store();
        let mut step = task_step("s0", StepKind::LinkedinMessage, 30);
        step.note = Some("Mention the webinar".to_string());
        step.priority = Some(TaskPriority::High);
        let sequence = Sequence {
            id: SequenceId(Ulid::new()),
            name: "Warm follow-up".to_string(),
            steps: vec![step],
        };

        must(temp.store.upsert_sequence(&sequence));
        let loaded = must_some(must(temp.store.get_sequence(sequence.id)));
        assert_eq!(loaded, sequence);
    }

    #[test]
    fn task_report_counts_and_previews() {
        let temp = open_temp_store();
        let sequence_id =
            seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);
        let completed =
            seed_step_task(&temp.store, sequence_id, "contact-1", 0, TaskStatus::Completed);
        seed_step_task(&temp.store, sequence_id, "contact-2", 0, TaskStatus::Pending);

        let report = must(temp.store.task_report(&ReportScope::Admin, 1));
        assert_eq!(report.total, 2);
        assert_eq!(report.by_status.get("pending"), Some(&1));
        assert_eq!(report.by_status.get("completed"), Some(&1));
        assert_eq!(report.by_type.get("phone_call"), Some(&2));
        assert_eq!(report.by_owner.get("owner-1"), Some(&2));
        assert_eq!(report.preview.len(), 1);

        let scoped = must(
            temp.store
                .task_report(&ReportScope::Owner("owner-none".to_string()), 10),
        );
        assert_eq!(scoped.total, 0);
        let _ = completed;
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(48))]

        #[test]
        fn prop_dedup_leaves_exactly_the_earliest_pending_task(
            rows in prop::collection::vec(
                (prop::option::of(0_i64..10_000), 0_i64..10_000),
                2..12,
            )
        ) {
            let mut temp = open_temp_store();
            let sequence_id =
                seed_sequence(&temp.store, vec![task_step("s0", StepKind::PhoneCall, 0)]);

            let mut seeded = Vec::new();
            for (due_ms, created_ms) in rows {
                let id = seed_dup_task(&temp.store, sequence_id, due_ms, created_ms);
                seeded.push((due_ms.unwrap_or(i64::MAX), created_ms, id.to_string(), id));
            }
            seeded.sort();
            let expected_keeper = seeded[0].3;

            let report = must(temp.store.run_dedup(&DedupOptions {
                apply: true,
                only_flagged: true,
                max_deletes: None,
            }));
            prop_assert_eq!(report.tasks_deleted, seeded.len() - 1);

            let pending = must(temp.store.list_pending_tasks(true));
            prop_assert_eq!(pending.len(), 1);
            prop_assert_eq!(pending[0].id, expected_keeper);

            let rerun = must(temp.store.run_dedup(&DedupOptions::default()));
            prop_assert_eq!(rerun.tasks_to_delete, 0);
        }

        #[test]
        fn prop_backfill_rerun_creates_nothing_new(
            delays in prop::collection::vec(0_u32..120, 1..5)
        ) {
            let mut temp = open_temp_store();
            let steps = delays
                .iter()
                .enumerate()
                .map(|(position, delay)| {
                    task_step(&format!("s{position}"), StepKind::PhoneCall, *delay)
                })
                .collect();
            let sequence_id = seed_sequence(&temp.store, steps);
            must(temp.store.upsert_contact(&fixture_contact("contact-1", None)));
            seed_membership(&temp.store, sequence_id, "contact-1", Some("owner-1"), 0);

            let first = must(temp.store.run_backfill(false, DelayAnchor::AtEnrollment, 5_000));
            prop_assert_eq!(first.tasks_created, 1);

            let second = must(temp.store.run_backfill(false, DelayAnchor::AtEnrollment, 5_000));
            prop_assert_eq!(second.tasks_created, 0);
            prop_assert_eq!(pending_task_count(&temp.store), 1);
        }
    }
}
