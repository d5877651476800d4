//! Stable command surface for the sequence progression engine.
//!
//! Host automations (send pipelines, nightly jobs) should embed behavior
//! through:
//! - [`run_cli`] for full parsed CLI execution.
//! - [`run_command_with_db`] for direct [`Command`] execution against a DB path.
//! - [`run_command`] for execution against an existing [`SqliteCrmStore`].

use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use crm_sequence_core::{
    now_ms, rfc3339_to_ms, Contact, DelayAnchor, EmailId, EmailStatus, EngineConfig, Membership,
    Sequence, SequenceId, TaskId,
};
use crm_sequence_store_sqlite::{DedupOptions, ReportScope, SqliteCrmStore};
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "crm")]
#[command(about = "Sales sequence progression CLI")]
pub struct Cli {
    #[arg(long, default_value = "./crm_sequence.sqlite3")]
    db: PathBuf,

    /// Owner recorded on created tasks when the membership has none.
    #[arg(long, default_value = "unassigned")]
    default_owner: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Sequence {
        #[command(subcommand)]
        command: Box<SequenceCommand>,
    },
    Contact {
        #[command(subcommand)]
        command: Box<ContactCommand>,
    },
    Enroll(EnrollArgs),
    Unenroll(UnenrollArgs),
    Advance(AdvanceArgs),
    Task {
        #[command(subcommand)]
        command: Box<TaskCommand>,
    },
    Email {
        #[command(subcommand)]
        command: Box<EmailCommand>,
    },
    Backfill(BackfillArgs),
    Dedup(DedupArgs),
    Report(ReportArgs),
}

#[derive(Debug, Subcommand)]
pub enum SequenceCommand {
    Load(SequenceLoadArgs),
    Show(SequenceShowArgs),
    List,
}

#[derive(Debug, Args)]
pub struct SequenceLoadArgs {
    #[arg(long)]
    file: PathBuf,
}

#[derive(Debug, Args)]
pub struct SequenceShowArgs {
    #[arg(long)]
    sequence_id: String,
}

#[derive(Debug, Subcommand)]
pub enum ContactCommand {
    Add(ContactAddArgs),
}

#[derive(Debug, Args)]
pub struct ContactAddArgs {
    #[arg(long)]
    id: String,
    #[arg(long)]
    first_name: String,
    #[arg(long)]
    last_name: String,
    #[arg(long)]
    company: Option<String>,
    #[arg(long)]
    email: Option<String>,
    /// Store in the legacy contact table instead of the primary one.
    #[arg(long)]
    legacy: bool,
}

#[derive(Debug, Args)]
pub struct EnrollArgs {
    #[arg(long)]
    sequence_id: String,
    #[arg(long)]
    contact_id: String,
    #[arg(long)]
    owner: Option<String>,
    /// RFC3339 enrollment moment; defaults to now. The enrollment anchor
    /// measures step delays from this time.
    #[arg(long)]
    enrolled_at: Option<String>,
}

#[derive(Debug, Args)]
pub struct UnenrollArgs {
    #[arg(long)]
    sequence_id: String,
    #[arg(long)]
    contact_id: String,
}

#[derive(Debug, Args)]
pub struct AdvanceArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long, value_enum, default_value_t = AnchorArg::Completion)]
    anchor: AnchorArg,
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    Complete(TaskCompleteArgs),
}

#[derive(Debug, Args)]
pub struct TaskCompleteArgs {
    #[arg(long)]
    task_id: String,
    #[arg(long, value_enum, default_value_t = AnchorArg::Completion)]
    anchor: AnchorArg,
}

#[derive(Debug, Subcommand)]
pub enum EmailCommand {
    MarkSent(EmailMarkSentArgs),
}

#[derive(Debug, Args)]
pub struct EmailMarkSentArgs {
    #[arg(long)]
    email_id: String,
}

#[derive(Debug, Args)]
pub struct BackfillArgs {
    /// Commit the planned tasks. Without this flag the run is a dry run.
    #[arg(long)]
    apply: bool,
    #[arg(long, value_enum, default_value_t = AnchorArg::Enrollment)]
    anchor: AnchorArg,
}

#[derive(Debug, Args)]
pub struct DedupArgs {
    /// Commit the planned deletions. Without this flag the run is a dry run.
    #[arg(long)]
    apply: bool,
    /// Scan every pending task, not just sequence-flagged ones.
    #[arg(long)]
    all_tasks: bool,
    #[arg(long)]
    max_deletes: Option<usize>,
}

#[derive(Debug, Args)]
pub struct ReportArgs {
    #[arg(long)]
    owner: Option<String>,
    #[arg(long)]
    admin: bool,
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AnchorArg {
    Completion,
    Enrollment,
}

impl AnchorArg {
    fn to_anchor(self) -> DelayAnchor {
        match self {
            Self::Completion => DelayAnchor::AtCompletion,
            Self::Enrollment => DelayAnchor::AtEnrollment,
        }
    }
}

/// Executes the parsed top-level CLI command graph.
///
/// # Errors
/// Returns an error when store open, migration, or command execution fails.
pub fn run_cli(cli: Cli) -> Result<()> {
    let config = EngineConfig {
        default_owner: cli.default_owner,
    };
    let mut store = SqliteCrmStore::open(&cli.db, config)?;
    store.migrate()?;
    run_command(cli.command, &mut store)
}

/// Executes a parsed command using the provided `SQLite` DB path.
///
/// # Errors
/// Returns an error when store open/migrate fails or the requested command
/// fails.
pub fn run_command_with_db(
    db_path: &std::path::Path,
    default_owner: &str,
    command: Command,
) -> Result<()> {
    let config = EngineConfig {
        default_owner: default_owner.to_string(),
    };
    let mut store = SqliteCrmStore::open(db_path, config)?;
    store.migrate()?;
    run_command(command, &mut store)
}

/// Executes a parsed command against an existing store handle.
///
/// # Errors
/// Returns an error when validation, persistence, or reconciliation fails.
pub fn run_command(command: Command, store: &mut SqliteCrmStore) -> Result<()> {
    match command {
        Command::Sequence { command } => run_sequence(*command, store),
        Command::Contact { command } => run_contact(*command, store),
        Command::Enroll(args) => {
            let sequence_id = parse_sequence_id(&args.sequence_id)?;
            if store.get_sequence(sequence_id)?.is_none() {
                return Err(anyhow!("sequence not found: {}", args.sequence_id));
            }
            if store.resolve_contact(&args.contact_id)?.is_none() {
                return Err(anyhow!("contact not found: {}", args.contact_id));
            }

            let created_ms = match args.enrolled_at.as_deref() {
                Some(raw) => rfc3339_to_ms(raw)
                    .map_err(|err| anyhow!("invalid --enrolled-at value: {err}"))?,
                None => now_ms(),
            };
            let membership = Membership {
                sequence_id,
                contact_id: args.contact_id,
                owner_id: args.owner,
                created_ms,
            };
            store.enroll(&membership)?;
            println!("{}", serde_json::to_string_pretty(&membership)?);
            Ok(())
        }
        Command::Unenroll(args) => {
            let sequence_id = parse_sequence_id(&args.sequence_id)?;
            if !store.remove_membership(sequence_id, &args.contact_id)? {
                return Err(anyhow!(
                    "membership not found for contact {} in sequence {}",
                    args.contact_id,
                    args.sequence_id
                ));
            }
            let payload = MembershipChangePayload {
                contract_version: "membership_change.v1".to_string(),
                sequence_id,
                contact_id: args.contact_id,
                enrolled: false,
            };
            println!("{}", serde_json::to_string_pretty(&payload)?);
            Ok(())
        }
        Command::Advance(args) => {
            let task_id = parse_task_id(&args.task_id)?;
            let report = store.advance_from_task(task_id, args.anchor.to_anchor(), now_ms())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Task { command } => run_task(*command, store),
        Command::Email { command } => run_email(*command, store),
        Command::Backfill(args) => {
            let report = store.run_backfill(!args.apply, args.anchor.to_anchor(), now_ms())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Dedup(args) => {
            let report = store.run_dedup(&DedupOptions {
                apply: args.apply,
                only_flagged: !args.all_tasks,
                max_deletes: args.max_deletes,
            })?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
        Command::Report(args) => {
            let scope = match (args.admin, args.owner) {
                (true, _) => ReportScope::Admin,
                (false, Some(owner)) => ReportScope::Owner(owner),
                (false, None) => {
                    return Err(anyhow!("either --owner <id> or --admin is required"));
                }
            };
            let report = store.task_report(&scope, args.limit)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_sequence(command: SequenceCommand, store: &SqliteCrmStore) -> Result<()> {
    match command {
        SequenceCommand::Load(args) => {
            let raw = std::fs::read_to_string(&args.file)
                .with_context(|| format!("failed reading sequence file {}", args.file.display()))?;
            let sequence: Sequence = serde_json::from_str(&raw)
                .with_context(|| format!("sequence file {} must be valid JSON", args.file.display()))?;
            store.upsert_sequence(&sequence)?;
            println!("{}", serde_json::to_string_pretty(&sequence)?);
            Ok(())
        }
        SequenceCommand::Show(args) => {
            let sequence_id = parse_sequence_id(&args.sequence_id)?;
            let Some(sequence) = store.get_sequence(sequence_id)? else {
                return Err(anyhow!("sequence not found: {}", args.sequence_id));
            };
            println!("{}", serde_json::to_string_pretty(&sequence)?);
            Ok(())
        }
        SequenceCommand::List => {
            let sequences = store.list_sequences()?;
            println!("{}", serde_json::to_string_pretty(&sequences)?);
            Ok(())
        }
    }
}

fn run_contact(command: ContactCommand, store: &SqliteCrmStore) -> Result<()> {
    match command {
        ContactCommand::Add(args) => {
            let contact = Contact {
                id: args.id,
                first_name: args.first_name,
                last_name: args.last_name,
                company: args.company,
                email: args.email,
            };
            if args.legacy {
                store.upsert_legacy_contact(&contact)?;
            } else {
                store.upsert_contact(&contact)?;
            }
            println!("{}", serde_json::to_string_pretty(&contact)?);
            Ok(())
        }
    }
}

fn run_task(command: TaskCommand, store: &SqliteCrmStore) -> Result<()> {
    match command {
        TaskCommand::Complete(args) => {
            let task_id = parse_task_id(&args.task_id)?;
            store.complete_task(task_id)?;
            let report = store.advance_from_task(task_id, args.anchor.to_anchor(), now_ms())?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(())
        }
    }
}

fn run_email(command: EmailCommand, store: &SqliteCrmStore) -> Result<()> {
    match command {
        EmailCommand::MarkSent(args) => {
            let email_id = parse_email_id(&args.email_id)?;
            store.set_email_status(email_id, EmailStatus::Sent)?;
            let Some(email) = store.get_email(email_id)? else {
                return Err(anyhow!("scheduled email not found: {}", args.email_id));
            };
            println!("{}", serde_json::to_string_pretty(&email)?);
            Ok(())
        }
    }
}

fn parse_sequence_id(raw: &str) -> Result<SequenceId> {
    Ok(SequenceId(parse_ulid(raw)?))
}

fn parse_task_id(raw: &str) -> Result<TaskId> {
    Ok(TaskId(parse_ulid(raw)?))
}

fn parse_email_id(raw: &str) -> Result<EmailId> {
    Ok(EmailId(parse_ulid(raw)?))
}

fn parse_ulid(raw: &str) -> Result<Ulid> {
    Ulid::from_string(raw).with_context(|| format!("invalid ULID: {raw}"))
}

#[derive(Debug, serde::Serialize, serde::Deserialize, PartialEq, Eq)]
pub struct MembershipChangePayload {
    contract_version: String,
    sequence_id: SequenceId,
    contact_id: String,
    enrolled: bool,
}

#[cfg(test)]
mod tests {
    #![allow(clippy::too_many_lines)]

    use super::*;
    use crm_sequence_core::{StepKind, TaskStatus};
    use std::fs;

    fn must<T>(result: Result<T>) -> T {
        match result {
            Ok(value) => value,
            Err(err) => panic!("test failure: {err}"),
        }
    }

    fn execute_cli(args: Vec<String>) -> Result<()> {
        let cli = Cli::try_parse_from(args)?;
        run_cli(cli)
    }

    fn fixture_sequence_json(sequence_id: &str) -> String {
        format!(
            r#"{{
  "id": "{sequence_id}",
  "name": "Intro outreach",
  "steps": [
    {{ "id": "s1", "kind": "phone_call", "delay_minutes": 0 }},
    {{ "id": "s2", "kind": "auto_email", "delay_minutes": 10 }}
  ]
}}"#
        )
    }

    #[test]
    fn parse_ulid_rejects_garbage() {
        assert!(parse_ulid("not-a-ulid").is_err());
    }

    #[test]
    fn report_requires_owner_or_admin() {
        let db_path = std::env::temp_dir().join(format!("crm-cli-scope-{}.sqlite3", Ulid::new()));
        let result = execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path.display().to_string(),
            "report".to_string(),
        ]);
        assert!(result.is_err());
        let _ = fs::remove_file(&db_path);
    }

    #[test]
    fn cli_end_to_end_load_enroll_backfill_complete() {
        let db_path = std::env::temp_dir().join(format!("crm-cli-e2e-{}.sqlite3", Ulid::new()));
        let db_path_str = db_path.display().to_string();
        let sequence_id = "01J0SQQP7M70P6Y3R4T8D8G8M2";

        let sequence_file = std::env::temp_dir().join(format!("crm-cli-seq-{}.json", Ulid::new()));
        must(
            fs::write(&sequence_file, fixture_sequence_json(sequence_id)).map_err(Into::into),
        );

        must(execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "sequence".to_string(),
            "load".to_string(),
            "--file".to_string(),
            sequence_file.display().to_string(),
        ]));

        must(execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "contact".to_string(),
            "add".to_string(),
            "--id".to_string(),
            "contact-1".to_string(),
            "--first-name".to_string(),
            "Ada".to_string(),
            "--last-name".to_string(),
            "Lovelace".to_string(),
            "--email".to_string(),
            "ada@example.com".to_string(),
        ]));

        must(execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "enroll".to_string(),
            "--sequence-id".to_string(),
            sequence_id.to_string(),
            "--contact-id".to_string(),
            "contact-1".to_string(),
            "--owner".to_string(),
            "owner-1".to_string(),
        ]));

        must(execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "backfill".to_string(),
            "--apply".to_string(),
        ]));

        let store = must(SqliteCrmStore::open(
            &db_path,
            EngineConfig {
                default_owner: "unassigned".to_string(),
            },
        ));
        must(store.migrate());
        let report = must(store.task_report(&ReportScope::Admin, 10));
        assert_eq!(report.total, 1);
        assert_eq!(report.preview[0].task_type, StepKind::PhoneCall);
        let task_id = report.preview[0].id;

        must(execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "task".to_string(),
            "complete".to_string(),
            "--task-id".to_string(),
            task_id.to_string(),
        ]));

        let completed = match must(store.get_task(task_id)) {
            Some(value) => value,
            None => panic!("completed task should still exist"),
        };
        assert_eq!(completed.status, TaskStatus::Completed);

        // Completing the call step materializes the follow-up email record.
        let emails = must(store.list_all_emails());
        assert_eq!(emails.len(), 1);
        assert_eq!(emails[0].step_index, 1);

        must(execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path_str.clone(),
            "report".to_string(),
            "--owner".to_string(),
            "owner-1".to_string(),
        ]));

        let _ = fs::remove_file(&db_path);
        let _ = fs::remove_file(&sequence_file);
    }

    #[test]
    fn unenroll_without_membership_is_an_error() {
        let db_path = std::env::temp_dir().join(format!("crm-cli-unenroll-{}.sqlite3", Ulid::new()));
        let result = execute_cli(vec![
            "crm".to_string(),
            "--db".to_string(),
            db_path.display().to_string(),
            "unenroll".to_string(),
            "--sequence-id".to_string(),
            "01J0SQQP7M70P6Y3R4T8D8G8M2".to_string(),
            "--contact-id".to_string(),
            "missing".to_string(),
        ]);
        assert!(result.is_err());
        let _ = fs::remove_file(&db_path);
    }
}
