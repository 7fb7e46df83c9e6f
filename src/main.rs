use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;

use escola_gate::auth::{hash_password, Authenticator, OperatorSession, Role};
use escola_gate::camera::LineCamera;
use escola_gate::codec::{self, QrCodec};
use escola_gate::config::Config;
use escola_gate::directory::{demo_roster, Directory};
use escola_gate::err::{breaks, proceeds, Error, Maybe, Nothing, Payload};
use escola_gate::gate::Gate;
use escola_gate::io::{FileStorage, SharedStorage};
use escola_gate::ledger::Ledger;
use escola_gate::models::{
    AccessRecord, AccessType, NewStudent, Student, StudentPatch, StudentStatus,
};
use escola_gate::scanner::{ScanError, ScanOutcome};

#[derive(Parser)]
#[command(
    name = "escola-gate",
    version,
    about = "School gate access control with student QR codes"
)]
struct Cli {
    /// Operator session token from `login`.
    #[arg(long, env = "ESCOLA_SESSION", global = true, hide_env_values = true)]
    session: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    Login {
        username: String,
        #[arg(long)]
        password: String,
        #[arg(long, value_enum)]
        role: RoleArg,
    },
    Logout,
    /// Print a PBKDF2 hash usable as ESCOLA_ADMIN_HASH / ESCOLA_GATEKEEPER_HASH.
    HashPassword { password: String },
    #[command(subcommand)]
    Student(StudentCommand),
    /// Issue a student's QR code as `qrcode-<registration>.svg`.
    Qr {
        id: String,
        /// Directory the image is written to.
        #[arg(long, default_value = ".")]
        out: PathBuf,
        /// Also draw the code on stderr.
        #[arg(long)]
        terminal: bool,
    },
    #[command(subcommand)]
    Log(LogCommand),
    /// Read QR payloads from stdin, one line per captured frame.
    Scan {
        #[arg(long)]
        exit: bool,
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
}

#[derive(Subcommand)]
enum StudentCommand {
    List,
    Show { id: String },
    Find { registration: String },
    Add {
        #[arg(long)]
        name: String,
        #[arg(long)]
        registration: String,
        #[arg(long)]
        course: String,
        #[arg(long)]
        grade: String,
        #[arg(long, default_value = "active")]
        status: StudentStatus,
        #[arg(long)]
        photo: Option<String>,
    },
    Update {
        id: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        registration: Option<String>,
        #[arg(long)]
        course: Option<String>,
        #[arg(long)]
        grade: Option<String>,
        #[arg(long)]
        status: Option<StudentStatus>,
        #[arg(long)]
        photo: Option<String>,
    },
    Remove { id: String },
}

#[derive(Subcommand)]
enum LogCommand {
    List,
    Student { id: String },
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    Remove { id: String },
    Clear,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Admin,
    Gatekeeper,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Admin => Role::Admin,
            RoleArg::Gatekeeper => Role::Gatekeeper,
        }
    }
}

#[derive(Serialize)]
struct Roster {
    students: Vec<Student>,
}

#[derive(Serialize)]
struct AccessLog {
    records: Vec<AccessRecord>,
}

#[derive(Serialize)]
struct Removed {
    id: String,
    removed: bool,
}

#[derive(Serialize)]
struct Cleared {
    cleared: bool,
}

#[derive(Serialize)]
struct LoggedOut {
    dropped: bool,
}

#[derive(Serialize)]
struct HashedPassword {
    hash: String,
}

#[derive(Serialize)]
struct IssuedCode {
    student_id: String,
    payload: String,
    image: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // before anything reads the environment
    let env_file = dotenv::dotenv().ok();
    env_logger::init();
    if let Some(path) = env_file {
        log::debug!("Loaded environment from {}", path.display());
    }
    let cli = Cli::parse();
    let config = Config::from_env()?;

    let storage: SharedStorage = Arc::new(FileStorage::prepare(&config.data_dir)?);
    if config.seed_demo {
        Directory::new(storage.clone()).seed_if_empty(demo_roster())?;
    }
    log::debug!("Using data directory {}", config.data_dir.display());

    if !run(cli, &config, storage).await {
        std::process::exit(1);
    }
    Ok(())
}

struct Context<'a> {
    config: &'a Config,
    storage: SharedStorage,
    token: Option<&'a str>,
}

impl Context<'_> {
    fn authenticator(&self) -> Result<Authenticator, Error> {
        let operators = Authenticator::default_operators(
            self.config.admin_hash.clone(),
            self.config.gatekeeper_hash.clone(),
        )?;
        Ok(Authenticator::new(
            self.storage.clone(),
            operators,
            self.config.session_ttl,
        ))
    }

    fn require(&self, role: Role) -> Result<OperatorSession, Error> {
        self.authenticator()?.authorize(self.token, role)
    }

    fn directory(&self) -> Directory {
        Directory::new(self.storage.clone())
    }

    fn ledger(&self) -> Ledger {
        Ledger::new(self.storage.clone())
    }
}

async fn run(cli: Cli, config: &Config, storage: SharedStorage) -> bool {
    let ctx = Context {
        config,
        storage,
        token: cli.session.as_deref(),
    };
    match cli.command {
        Command::Login {
            username,
            password,
            role,
        } => emit(login(&ctx, &username, &password, role.into())),
        Command::Logout => emit(logout(&ctx)),
        Command::HashPassword { password } => emit(
            hash_password(&password).and_then(|hash| proceeds(HashedPassword { hash })),
        ),
        Command::Student(command) => match command {
            StudentCommand::List => emit(list_students(&ctx)),
            StudentCommand::Show { id } => emit(show_student(&ctx, &id)),
            StudentCommand::Find { registration } => emit(find_student(&ctx, &registration)),
            StudentCommand::Add {
                name,
                registration,
                course,
                grade,
                status,
                photo,
            } => emit(add_student(
                &ctx,
                NewStudent {
                    name,
                    registration,
                    course,
                    grade,
                    status,
                    photo,
                },
            )),
            StudentCommand::Update {
                id,
                name,
                registration,
                course,
                grade,
                status,
                photo,
            } => emit(update_student(
                &ctx,
                &id,
                StudentPatch {
                    name,
                    registration,
                    course,
                    grade,
                    status,
                    photo,
                },
            )),
            StudentCommand::Remove { id } => emit(remove_student(&ctx, id)),
        },
        Command::Qr { id, out, terminal } => emit(issue_code(&ctx, &id, &out, terminal)),
        Command::Log(command) => match command {
            LogCommand::List => emit(list_records(&ctx, None)),
            LogCommand::Student { id } => emit(list_records(&ctx, Some(&id))),
            LogCommand::Recent { limit } => emit(recent_records(&ctx, limit)),
            LogCommand::Remove { id } => emit(remove_record(&ctx, id)),
            LogCommand::Clear => emit(clear_records(&ctx)),
        },
        Command::Scan { exit, count } => scan(&ctx, exit, count).await,
    }
}

fn emit<T: Serialize>(payload: Payload<T>) -> bool {
    let maybe = payload.unwrap_or_else(Nothing);
    let fine = maybe.is_fine();
    print(&maybe);
    fine
}

fn print<T: Serialize>(maybe: &Maybe<T>) {
    match serde_json::to_string_pretty(maybe) {
        Ok(json) => println!("{}", json),
        Err(err) => log::error!("Could not serialize result: {}", err),
    }
}

fn login(ctx: &Context, username: &str, password: &str, role: Role) -> Payload<OperatorSession> {
    let session = ctx.authenticator()?.login(username, password, role)?;
    proceeds(session)
}

fn logout(ctx: &Context) -> Payload<LoggedOut> {
    let token = match ctx.token {
        Some(token) => token,
        None => return breaks(Error::InvalidSession),
    };
    let dropped = ctx.authenticator()?.logout(token)?;
    proceeds(LoggedOut { dropped })
}

fn list_students(ctx: &Context) -> Payload<Roster> {
    ctx.require(Role::Gatekeeper)?;
    proceeds(Roster {
        students: ctx.directory().list()?,
    })
}

fn show_student(ctx: &Context, id: &str) -> Payload<Student> {
    ctx.require(Role::Gatekeeper)?;
    match ctx.directory().get_by_id(id)? {
        Some(student) => proceeds(student),
        None => breaks(Error::not_found(format!("Student `{}` does not exist!", id))),
    }
}

fn find_student(ctx: &Context, registration: &str) -> Payload<Student> {
    ctx.require(Role::Gatekeeper)?;
    match ctx.directory().get_by_registration(registration)? {
        Some(student) => proceeds(student),
        None => breaks(Error::not_found(format!(
            "No student with registration `{}`",
            registration
        ))),
    }
}

fn add_student(ctx: &Context, fields: NewStudent) -> Payload<Student> {
    ctx.require(Role::Admin)?;
    proceeds(ctx.directory().create(fields)?)
}

fn update_student(ctx: &Context, id: &str, patch: StudentPatch) -> Payload<Student> {
    ctx.require(Role::Admin)?;
    match ctx.directory().update(id, patch)? {
        Some(student) => proceeds(student),
        None => breaks(Error::not_found(format!("Student `{}` does not exist!", id))),
    }
}

fn remove_student(ctx: &Context, id: String) -> Payload<Removed> {
    ctx.require(Role::Admin)?;
    let removed = ctx.directory().delete(&id)?;
    proceeds(Removed { id, removed })
}

fn issue_code(ctx: &Context, id: &str, out: &Path, terminal: bool) -> Payload<IssuedCode> {
    ctx.require(Role::Admin)?;
    let student = match ctx.directory().get_by_id(id)? {
        Some(student) => student,
        None => return breaks(Error::not_found(format!("Student `{}` does not exist!", id))),
    };
    let payload = QrCodec::new(ctx.config.qr_validity).encode(&student)?;
    let image = codec::write_image(out, &student.registration, &payload)?;
    if terminal {
        eprintln!("{}", codec::render_terminal(&codec::symbol(&payload)?));
    }
    proceeds(IssuedCode {
        student_id: student.id,
        payload,
        image,
    })
}

fn list_records(ctx: &Context, student_id: Option<&str>) -> Payload<AccessLog> {
    ctx.require(Role::Gatekeeper)?;
    let records = match student_id {
        Some(id) => ctx.ledger().list_by_student(id)?,
        None => ctx.ledger().list()?,
    };
    proceeds(AccessLog { records })
}

fn recent_records(ctx: &Context, limit: usize) -> Payload<AccessLog> {
    ctx.require(Role::Gatekeeper)?;
    proceeds(AccessLog {
        records: ctx.ledger().list_recent(limit)?,
    })
}

fn remove_record(ctx: &Context, id: String) -> Payload<Removed> {
    ctx.require(Role::Admin)?;
    let removed = ctx.ledger().remove(&id)?;
    proceeds(Removed { id, removed })
}

fn clear_records(ctx: &Context) -> Payload<Cleared> {
    ctx.require(Role::Admin)?;
    ctx.ledger().clear()?;
    proceeds(Cleared { cleared: true })
}

async fn scan(ctx: &Context<'_>, exit: bool, count: usize) -> bool {
    let operator = match ctx.require(Role::Gatekeeper) {
        Ok(operator) => operator,
        Err(err) => return emit::<ScanOutcome>(Err(err)),
    };
    let access_type = if exit { AccessType::Exit } else { AccessType::Entry };
    log::info!(
        "{} scanning for {} ({} reads)",
        operator.display_name,
        access_type,
        count
    );

    let mut gate = Gate::new(
        LineCamera::new(tokio::io::stdin()),
        ctx.directory(),
        ctx.ledger(),
        ctx.config.camera.clone(),
        access_type,
    )
    .audit_denied(ctx.config.audit_denied);

    let mut all_fine = true;
    for _ in 0..count {
        let outcome = match gate.scan_once().await {
            Some(outcome) => outcome,
            None => break,
        };
        let stream_ended = matches!(
            &outcome,
            ScanOutcome::Error {
                error: ScanError::CameraInitFailure { .. }
            }
        );
        all_fine &= emit(proceeds(outcome));
        if stream_ended {
            all_fine = false;
            break;
        }
    }
    all_fine
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_from_dotenv_reaches_the_cli() {
        let dir = tempfile::tempdir().unwrap();
        let env_file = dir.path().join(".env");
        std::fs::write(&env_file, "ESCOLA_SESSION=token-from-dotenv\n").unwrap();

        dotenv::from_path(&env_file).unwrap();
        let cli = Cli::try_parse_from(["escola-gate", "logout"]).unwrap();
        assert_eq!(cli.session.as_deref(), Some("token-from-dotenv"));
    }

    #[test]
    fn qr_writes_to_the_working_directory_by_default() {
        let cli = Cli::try_parse_from(["escola-gate", "qr", "3"]).unwrap();
        match cli.command {
            Command::Qr { id, out, terminal } => {
                assert_eq!(id, "3");
                assert_eq!(out, PathBuf::from("."));
                assert!(!terminal);
            }
            _ => panic!("expected the qr command"),
        }
    }
}
