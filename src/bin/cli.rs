// Exam client simulation tool
// Runs scripted proctor/examinee sessions over the in-process loopback
// capability to validate the protocol and reconciliation logic end to end.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use colored::*;
use tokio::time::{sleep, Duration};

use examguard_client::backend::memory::InMemoryBackend;
use examguard_client::backend::Profile;
use examguard_client::capability::loopback::{LoopbackConnector, LoopbackNet};
use examguard_client::config::ProtocolConfig;
use examguard_client::session::{ExamineeController, ProctorController, SessionPhase};

#[derive(Parser)]
#[command(name = "examguard-sim")]
#[command(about = "Exam proctoring client simulation tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Simulate a monitored session: proctor plus examinees, chat both
    /// ways, then end the exam
    Session {
        /// Session join code
        #[arg(short, long, default_value = "EX42")]
        join_code: String,

        /// Number of examinees to join
        #[arg(short, long, default_value_t = 2)]
        examinees: u32,

        /// Deliver every data message twice to exercise dedup
        #[arg(long)]
        duplicate_delivery: bool,
    },

    /// Simulate kicking an examinee out of a session
    Kick {
        /// Session join code
        #[arg(short, long, default_value = "EX42")]
        join_code: String,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match &cli.command {
        Commands::Session { join_code, examinees, duplicate_delivery } => {
            run_session(join_code, *examinees, *duplicate_delivery).await;
        }
        Commands::Kick { join_code } => {
            run_kick(join_code).await;
        }
    }
}

fn proctor_profile() -> Profile {
    Profile {
        display_name: "Dr. Smith".to_string(),
        class_name: String::new(),
        username: "dr.smith".to_string(),
    }
}

async fn settle(proctor: &mut ProctorController, examinees: &mut [ExamineeController]) {
    // Give spawned best-effort tasks a chance, then drain everyone's
    // event queues.
    sleep(Duration::from_millis(10)).await;
    proctor.pump().await;
    for examinee in examinees.iter_mut() {
        examinee.pump().await;
    }
    proctor.pump().await;
}

async fn run_session(join_code: &str, examinee_count: u32, duplicate_delivery: bool) {
    println!("{}", "Starting simulated exam session...".cyan());
    println!("  Join code: {join_code}");
    println!("  Examinees: {examinee_count}");

    let net = LoopbackNet::new();
    net.set_duplicate_data_delivery(duplicate_delivery);
    let backend = Arc::new(InMemoryBackend::new(proctor_profile()));

    let mut proctor = ProctorController::new(
        backend.clone(),
        Arc::new(LoopbackConnector::new(net.clone())),
        ProtocolConfig::default(),
        "dr.smith",
    );
    if let Err(e) = proctor.join(join_code).await {
        println!("{} Proctor failed to join: {e}", "✗".red());
        return;
    }
    println!("{} Proctor joined as {}", "✓".green(), proctor.attendee_id());

    let mut examinees = Vec::new();
    for i in 1..=examinee_count {
        let mut examinee = ExamineeController::new(
            backend.clone(),
            Arc::new(LoopbackConnector::new(net.clone())),
            ProtocolConfig::default(),
            "guest",
        );
        let name = format!("Student {i}");
        match examinee.join(join_code, Some(&name)).await {
            Ok(()) => println!("{} {} joined as {}", "✓".green(), name, examinee.attendee_id()),
            Err(e) => {
                println!("{} {} failed to join: {e}", "✗".red(), name);
                return;
            }
        }
        examinees.push(examinee);
    }

    settle(&mut proctor, &mut examinees).await;
    println!(
        "  Proctor roster: {} student(s)",
        proctor.roster().student_count()
    );
    for (key, record) in proctor.roster().students() {
        println!("    {} -> {} (camera: {:?})", key, record.display_name(), record.camera_tile);
    }

    println!("{}", "Exchanging chat...".cyan());
    proctor
        .send_chat("The exam starts now. Good luck.")
        .await
        .expect("broadcast send");
    settle(&mut proctor, &mut examinees).await;

    if let Some(first) = examinees.first_mut() {
        first
            .send_chat("May I use scratch paper?")
            .await
            .expect("direct send");
    }
    settle(&mut proctor, &mut examinees).await;

    for (i, examinee) in examinees.iter().enumerate() {
        println!(
            "  Student {} chat log: {} message(s)",
            i + 1,
            examinee.chat().entries().len()
        );
    }
    println!("  Proctor chat log: {} message(s)", proctor.chat().entries().len());

    println!("{}", "Ending exam...".cyan());
    proctor.end_exam().await.expect("end exam");
    settle(&mut proctor, &mut examinees).await;

    for (i, examinee) in examinees.iter_mut().enumerate() {
        let phase = examinee.phase();
        let notice = examinee.take_notice().unwrap_or_default();
        let mark = if phase == SessionPhase::Idle { "✓".green() } else { "✗".red() };
        println!("  {} Student {} phase: {phase} ({notice})", mark, i + 1);
    }
    println!("{} Session complete", "✓".green());
}

async fn run_kick(join_code: &str) {
    println!("{}", "Simulating a kick...".cyan());

    let net = LoopbackNet::new();
    let backend = Arc::new(InMemoryBackend::new(proctor_profile()));

    let mut proctor = ProctorController::new(
        backend.clone(),
        Arc::new(LoopbackConnector::new(net.clone())),
        ProtocolConfig::default(),
        "dr.smith",
    );
    proctor.join(join_code).await.expect("proctor join");

    let mut examinee = ExamineeController::new(
        backend.clone(),
        Arc::new(LoopbackConnector::new(net.clone())),
        ProtocolConfig::default(),
        "guest",
    );
    examinee
        .join(join_code, Some("山田太郎"))
        .await
        .expect("examinee join");

    settle(&mut proctor, std::slice::from_mut(&mut examinee)).await;

    let target = examinee.attendee_id().to_string();
    println!("  Kicking {target}");
    proctor.kick_participant(&target, Some("examinee")).await.expect("kick send");

    settle(&mut proctor, std::slice::from_mut(&mut examinee)).await;

    if examinee.phase() == SessionPhase::Idle && examinee.was_force_removed() {
        println!(
            "{} Examinee removed: {}",
            "✓".green(),
            examinee.take_notice().unwrap_or_default()
        );
    } else {
        println!("{} Examinee still in phase {}", "✗".red(), examinee.phase());
    }

    proctor.pump().await;
    println!(
        "  Proctor roster now has {} student(s)",
        proctor.roster().student_count()
    );
    proctor.leave().await;
    println!("{} Done", "✓".green());
}
