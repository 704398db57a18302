use chrono::{NaiveDate, NaiveTime};
use clap::{Args, Parser, Subcommand};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use triage_core::store::{DoctorStore, PatientStore};
use triage_core::*;

#[derive(Parser)]
#[command(name = "triage")]
#[command(about = "Clinic triage and appointment orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Override data directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Use this config file instead of the default location
    #[arg(long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Manage patient records
    #[command(subcommand)]
    Patient(PatientCommand),

    /// Manage doctor records
    #[command(subcommand)]
    Doctor(DoctorCommand),

    /// Put a patient in the waiting queue
    Enqueue { patient: PatientId },

    /// Take a patient out of the waiting queue
    Withdraw { patient: PatientId },

    /// Show the triage board
    Queue,

    /// Attend the most urgent waiting patient
    Attend {
        /// Only use doctors of this specialty
        #[arg(long)]
        specialty: Option<String>,

        /// Stay until the attention completes
        #[arg(long)]
        wait: bool,
    },

    /// Manage appointments
    #[command(subcommand)]
    Appointment(AppointmentCommand),

    /// Finish an attention now
    Finish { appointment: AppointmentId },

    /// Show finished attentions, most recent first
    History {
        /// Only patients whose name contains this text
        #[arg(long, conflicts_with_all = ["latest", "id"])]
        search: Option<String>,

        /// Only the most recent record
        #[arg(long, conflicts_with = "id")]
        latest: bool,

        /// The record of one appointment
        #[arg(long)]
        id: Option<AppointmentId>,
    },

    /// Append the history to a CSV file
    Export { path: PathBuf },

    /// Summarize doctors, queue and pending attentions
    Status,
}

#[derive(Subcommand)]
enum PatientCommand {
    /// Register a patient
    Add {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        email: Option<String>,
        /// high (1), medium (2) or low (3)
        #[arg(long, default_value = "low")]
        priority: Priority,
    },
    /// List registered patients
    List,
    /// Change a patient's triage priority
    Priority { patient: PatientId, priority: Priority },
}

#[derive(Subcommand)]
enum DoctorCommand {
    /// Register a doctor
    Add {
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        #[arg(long)]
        specialty: String,
        #[arg(long)]
        office: u32,
    },
    /// List doctors and their availability
    List,
    /// Free a doctor, finishing the attention they hold
    Release { doctor: DoctorId },
}

#[derive(Args)]
struct ScheduleArgs {
    #[arg(long)]
    patient: PatientId,
    #[arg(long)]
    doctor: DoctorId,
    /// Date as YYYY-MM-DD
    #[arg(long)]
    date: NaiveDate,
    /// Time as HH:MM
    #[arg(long, value_parser = parse_time)]
    time: NaiveTime,
    #[arg(long, default_value = "")]
    reason: String,
}

#[derive(Subcommand)]
enum AppointmentCommand {
    /// Book an appointment
    Schedule(ScheduleArgs),
    /// Change a scheduled appointment
    Edit {
        appointment: AppointmentId,
        #[arg(long)]
        date: Option<NaiveDate>,
        #[arg(long, value_parser = parse_time)]
        time: Option<NaiveTime>,
        #[arg(long)]
        patient: Option<PatientId>,
        #[arg(long)]
        doctor: Option<DoctorId>,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Move a scheduled appointment to a new date and time
    Reschedule {
        appointment: AppointmentId,
        #[arg(long)]
        date: NaiveDate,
        #[arg(long, value_parser = parse_time)]
        time: NaiveTime,
    },
    /// Cancel an appointment
    Cancel { appointment: AppointmentId },
    /// List appointments
    List {
        /// Only this state (P, E, F, C or R)
        #[arg(long, value_parser = parse_state)]
        state: Option<AppointmentState>,
    },
}

fn parse_time(value: &str) -> std::result::Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(value, "%H:%M:%S"))
        .map_err(|_| format!("Invalid time: '{}'. Expected HH:MM", value))
}

fn parse_state(value: &str) -> std::result::Result<AppointmentState, String> {
    let mut chars = value.trim().chars();
    match (chars.next(), chars.next()) {
        (Some(code), None) => AppointmentState::from_code(code.to_ascii_uppercase()),
        _ => None,
    }
    .ok_or_else(|| format!("Invalid state: '{}'. Must be one of P, E, F, C, R", value))
}

/// Orchestrator over the data directory, held under an exclusive lock
struct Clinic {
    orchestrator: Orchestrator,
    snapshot_path: PathBuf,
    _lock: File,
}

impl Clinic {
    fn open(data_dir: &Path, config: &Config) -> Result<Self> {
        std::fs::create_dir_all(data_dir)?;

        let lock = OpenOptions::new()
            .create(true)
            .write(true)
            .open(data_dir.join("clinic.lock"))?;
        lock.lock_exclusive()?;

        let snapshot_path = data_dir.join("clinic.json");
        let snapshot = ClinicSnapshot::load(&snapshot_path)?;
        let history = HistoryStack::open(&data_dir.join("history.jsonl"))?;

        let orchestrator = OrchestratorBuilder::from_snapshot(snapshot)
            .config(config)
            .history(history)
            .build()?;
        orchestrator.recover()?;

        Ok(Self {
            orchestrator,
            snapshot_path,
            _lock: lock,
        })
    }

    fn save(&self) -> Result<()> {
        self.orchestrator.snapshot()?.save(&self.snapshot_path)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    triage_core::logging::init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    let data_dir = cli
        .data_dir
        .unwrap_or_else(|| config.data.data_dir.clone());

    let clinic = Clinic::open(&data_dir, &config)?;
    let outcome = dispatch(&clinic.orchestrator, cli.command).await;

    // Failed commands may still have changed state (re-queued patients)
    clinic.save()?;
    outcome
}

async fn dispatch(orch: &Orchestrator, command: Commands) -> Result<()> {
    match command {
        Commands::Patient(cmd) => cmd_patient(orch, cmd),
        Commands::Doctor(cmd) => cmd_doctor(orch, cmd),
        Commands::Enqueue { patient } => {
            let entry = orch.enqueue(patient)?;
            let position = orch
                .waiting()
                .iter()
                .position(|e| e.patient_id == patient)
                .map(|p| p + 1)
                .unwrap_or(0);
            println!(
                "✓ Patient {} queued at priority {} (position {})",
                entry.patient_id, entry.priority, position
            );
            Ok(())
        }
        Commands::Withdraw { patient } => {
            orch.withdraw(patient)?;
            println!("✓ Patient {} withdrawn from the queue", patient);
            Ok(())
        }
        Commands::Queue => cmd_queue(orch),
        Commands::Attend { specialty, wait } => cmd_attend(orch, specialty, wait).await,
        Commands::Appointment(cmd) => cmd_appointment(orch, cmd),
        Commands::Finish { appointment } => {
            let record = orch.finish_now(appointment)?;
            println!(
                "✓ Appointment {} finished: {} attended by {}",
                record.appointment_id, record.patient_name, record.doctor_name
            );
            Ok(())
        }
        Commands::History { search, latest, id } => cmd_history(orch, search, latest, id),
        Commands::Export { path } => {
            let count = orch.with_history(|h| export_history_csv(h.list(), &path))?;
            println!("✓ Exported {} history records", count);
            println!("  CSV: {}", path.display());
            Ok(())
        }
        Commands::Status => cmd_status(orch),
    }
}

fn cmd_patient(orch: &Orchestrator, cmd: PatientCommand) -> Result<()> {
    match cmd {
        PatientCommand::Add {
            first_name,
            last_name,
            phone,
            email,
            priority,
        } => {
            let patient = orch.patients().insert(NewPatient {
                first_name,
                last_name,
                phone,
                email,
                priority,
            })?;
            println!(
                "✓ Registered patient {}: {} ({})",
                patient.id,
                patient.full_name(),
                patient.priority
            );
        }
        PatientCommand::List => {
            for patient in orch.patients().list()? {
                println!(
                    "{:>4}  {:<28} {:<7} {}",
                    patient.id,
                    patient.full_name(),
                    patient.priority.label(),
                    if patient.in_attention { "in attention" } else { "" }
                );
            }
        }
        PatientCommand::Priority { patient, priority } => {
            let patient = orch.set_priority(patient, priority)?;
            println!(
                "✓ Patient {} ({}) is now {}",
                patient.id,
                patient.full_name(),
                patient.priority
            );
        }
    }
    Ok(())
}

fn cmd_doctor(orch: &Orchestrator, cmd: DoctorCommand) -> Result<()> {
    match cmd {
        DoctorCommand::Add {
            first_name,
            last_name,
            specialty,
            office,
        } => {
            let doctor = orch.registry().store().insert(NewDoctor {
                first_name,
                last_name,
                specialty,
                office,
            })?;
            println!(
                "✓ Registered doctor {}: {} ({}, office {})",
                doctor.id,
                doctor.full_name(),
                doctor.specialty,
                doctor.office
            );
        }
        DoctorCommand::List => {
            for doctor in orch.registry().list()? {
                println!(
                    "{:>4}  {:<28} {:<16} office {:<4} {}",
                    doctor.id,
                    doctor.full_name(),
                    doctor.specialty,
                    doctor.office,
                    if doctor.available { "available" } else { "busy" }
                );
            }
        }
        DoctorCommand::Release { doctor } => {
            if orch.release_doctor(doctor)? {
                println!("✓ Doctor {} released", doctor);
            } else {
                println!("Doctor {} was already available", doctor);
            }
        }
    }
    Ok(())
}

fn cmd_queue(orch: &Orchestrator) -> Result<()> {
    let rows = orch.triage_listing()?;
    if rows.is_empty() {
        println!("No patients waiting.");
        return Ok(());
    }

    let mut position = 0;
    for row in rows {
        let marker = if row.in_attention() {
            "in attention".to_string()
        } else {
            position += 1;
            format!("#{}", position)
        };
        println!(
            "{:<13} {:>4}  {:<28} {}",
            marker,
            row.patient.id,
            row.patient.full_name(),
            row.patient.priority
        );
    }
    Ok(())
}

async fn cmd_attend(orch: &Orchestrator, specialty: Option<String>, wait: bool) -> Result<()> {
    let mut events = orch.subscribe();
    let specialty = specialty.or_else(|| orch.policy().specialty.clone());
    let attention = orch.attend_next_for(specialty.as_deref())?;

    println!(
        "✓ Attending {} ({}) with {} in office {}",
        attention.patient.full_name(),
        attention.patient.priority,
        attention.doctor.full_name(),
        attention.doctor.office
    );
    println!(
        "  Appointment {} completes in {:.0}s",
        attention.appointment.id,
        attention.duration.as_secs_f64()
    );

    if !wait {
        println!(
            "  Run `triage finish {}` when the consultation ends",
            attention.appointment.id
        );
        return Ok(());
    }

    let id = attention.appointment.id;
    let deadline = attention.duration + Duration::from_secs(5);
    let finished = tokio::time::timeout(deadline, async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::AttentionFinished { appointment_id, .. }) if appointment_id == id => {
                    return true
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!("Missed {} engine events while waiting", missed);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    if finished {
        println!("✓ Appointment {} finished", id);
    } else {
        println!("Appointment {} still in attention", id);
    }
    Ok(())
}

fn cmd_appointment(orch: &Orchestrator, cmd: AppointmentCommand) -> Result<()> {
    match cmd {
        AppointmentCommand::Schedule(args) => {
            let appointment = orch.schedule(ScheduleRequest {
                date: args.date,
                time: args.time,
                patient_id: args.patient,
                doctor_id: args.doctor,
                reason: args.reason,
            })?;
            println!(
                "✓ Scheduled appointment {} on {} at {}",
                appointment.id,
                appointment.date,
                appointment.time.format("%H:%M")
            );
        }
        AppointmentCommand::Edit {
            appointment,
            date,
            time,
            patient,
            doctor,
            reason,
        } => {
            let updated = orch.edit(
                appointment,
                AppointmentEdit {
                    date,
                    time,
                    patient_id: patient,
                    doctor_id: doctor,
                    reason,
                },
            )?;
            println!("✓ Appointment {} updated", updated.id);
            print_appointment(&updated);
        }
        AppointmentCommand::Reschedule {
            appointment,
            date,
            time,
        } => {
            let (old, new) = orch.reschedule(appointment, date, time)?;
            println!(
                "✓ Appointment {} rescheduled as {} on {} at {}",
                old.id,
                new.id,
                new.date,
                new.time.format("%H:%M")
            );
        }
        AppointmentCommand::Cancel { appointment } => {
            let cancelled = orch.cancel(appointment)?;
            println!("✓ Appointment {} cancelled", cancelled.id);
        }
        AppointmentCommand::List { state } => {
            let appointments = match state {
                Some(state) => orch.appointments().list_in_state(state)?,
                None => orch.appointments().list()?,
            };
            for appointment in &appointments {
                print_appointment(appointment);
            }
        }
    }
    Ok(())
}

fn print_appointment(appointment: &Appointment) {
    println!(
        "{:>4}  {} {}  patient {:<4} doctor {:<4} {}  {}",
        appointment.id,
        appointment.date,
        appointment.time.format("%H:%M"),
        appointment.patient_id,
        appointment.doctor_id,
        appointment.state.code(),
        appointment.reason
    );
}

fn cmd_history(
    orch: &Orchestrator,
    search: Option<String>,
    latest: bool,
    id: Option<AppointmentId>,
) -> Result<()> {
    let records = if let Some(id) = id {
        vec![orch.find_history(id)?]
    } else if latest {
        orch.latest_history().into_iter().collect()
    } else if let Some(pattern) = search {
        orch.search_history(&pattern)
    } else {
        orch.history()
    };

    if records.is_empty() {
        println!("No history records.");
        return Ok(());
    }

    for record in records {
        println!(
            "{:>4}  {} {}  {:<28} {:<24} {:<12} {}",
            record.appointment_id,
            record.date,
            record.time.format("%H:%M"),
            record.patient_name,
            record.doctor_name,
            record.specialty,
            record.reason
        );
    }
    Ok(())
}

fn cmd_status(orch: &Orchestrator) -> Result<()> {
    let doctors = orch.registry().list()?;
    let free = doctors.iter().filter(|d| d.available).count();
    let waiting = orch.waiting().len();
    let in_attention = orch
        .appointments()
        .list_in_state(AppointmentState::InAttention)?;
    let history = orch.with_history(|h| h.len());

    println!("Doctors:      {} available / {} total", free, doctors.len());
    println!("Waiting:      {}", waiting);
    println!("In attention: {}", in_attention.len());
    println!("History:      {}", history);

    let unattended = orch.unattended()?;
    if !unattended.is_empty() {
        println!();
        println!("Attentions without a completion timer:");
        for appointment in unattended {
            let due = appointment
                .due_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "unknown".into());
            println!(
                "  appointment {} (patient {}, doctor {}) due {}",
                appointment.id, appointment.patient_id, appointment.doctor_id, due
            );
        }
    }
    Ok(())
}
