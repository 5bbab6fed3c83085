// Examsy Portal CLI
// Operator tool for a running portal, plus offline scenario checks against an in-memory store

use clap::{Parser, Subcommand};
use colored::*;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::io::{self, Write};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::{connect_async, tungstenite::Message};

use examsy_portal::cache::MemoryCache;
use examsy_portal::config::{MonitorConfig, RemoteConfig, SyncConfig};
use examsy_portal::monitor::{
    client_capabilities, spawn_monitor, ClientGrants, MonitorPolicy, Signal,
};
use examsy_portal::portal::{self, LoginError, StudentLogin};
use examsy_portal::remote::{FetchFault, HttpRemoteStore, InMemoryRemote, RemoteStore, WriteBehavior};
use examsy_portal::{Action, Dataset, ExamSession, PortalError, Room, Student, StudentStatus, SyncEngine};

#[derive(Parser)]
#[command(name = "examsy-cli")]
#[command(about = "Examsy Portal CLI", long_about = None)]
struct Cli {
    /// Portal address (default: 127.0.0.1:8080)
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check portal health endpoint
    Health,

    /// Show the reconciled dataset served by the portal
    Dataset {
        /// Print the full JSON body
        #[arg(short, long)]
        json: bool,
    },

    /// Read a snapshot straight from the remote store
    Snapshot {
        /// Remote store endpoint
        #[arg(short, long)]
        endpoint: String,
    },

    /// Log a student in (marks them IN_PROGRESS)
    Login {
        #[arg(long)]
        nis: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        class: String,
        #[arg(long)]
        pin: String,
    },

    /// Change one student's status as admin or proctor
    SetStatus {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        /// Student NIS
        #[arg(long)]
        student: String,
        /// NOT_STARTED, IN_PROGRESS, COMPLETED or BLOCKED
        #[arg(long)]
        status: String,
    },

    /// Dispatch a raw action as staff
    Dispatch {
        #[arg(short, long)]
        username: String,
        #[arg(short, long)]
        password: String,
        /// Action JSON: {"action": "...", "payload": {...}}
        action: String,
        /// Stage as a debounced full sync instead of a direct write
        #[arg(long)]
        stage: bool,
    },

    /// Take an exam interactively over the exam WebSocket
    Exam {
        #[arg(long)]
        nis: String,
        #[arg(long)]
        password: String,
        #[arg(long)]
        class: String,
        #[arg(long)]
        pin: String,
        /// Report the camera as granted
        #[arg(long)]
        camera: bool,
    },

    /// Run offline scenarios against an in-memory remote store
    Validate {
        /// Run all scenarios
        #[arg(short, long)]
        all: bool,

        /// Run a specific scenario
        #[arg(short, long)]
        scenario: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match &cli.command {
        Commands::Health => {
            check_health(&cli.server).await;
        }
        Commands::Dataset { json } => {
            show_dataset(&cli.server, *json).await;
        }
        Commands::Snapshot { endpoint } => {
            read_snapshot(endpoint).await;
        }
        Commands::Login {
            nis,
            password,
            class,
            pin,
        } => {
            student_login(&cli.server, nis, password, class, pin).await;
        }
        Commands::SetStatus {
            username,
            password,
            student,
            status,
        } => {
            let status = match status.parse::<StudentStatus>() {
                Ok(status) => status,
                Err(e) => {
                    println!("{} {}", "✗".red(), e);
                    return;
                }
            };
            let action = json!({
                "action": "UPDATE_STUDENT_STATUS",
                "payload": { "id": student, "status": status },
            });
            dispatch(&cli.server, username, password, action, false).await;
        }
        Commands::Dispatch {
            username,
            password,
            action,
            stage,
        } => match serde_json::from_str::<Action>(action) {
            Ok(parsed) => {
                println!("  Action: {}", parsed.name().cyan());
                let body = match serde_json::to_value(&parsed) {
                    Ok(body) => body,
                    Err(e) => {
                        println!("{} Cannot encode action: {}", "✗".red(), e);
                        return;
                    }
                };
                dispatch(&cli.server, username, password, body, *stage).await;
            }
            Err(e) => {
                println!("{} Invalid action JSON: {}", "✗".red(), e);
            }
        },
        Commands::Exam {
            nis,
            password,
            class,
            pin,
            camera,
        } => {
            take_exam(&cli.server, nis, password, class, pin, *camera).await;
        }
        Commands::Validate { all, scenario } => {
            if *all {
                run_all_validations().await;
            } else if let Some(s) = scenario {
                run_scenario(s).await;
            } else {
                println!("{}", "Use --all or --scenario <name>".yellow());
                list_scenarios();
            }
        }
    }
}

async fn check_health(server: &str) {
    println!("{}", "Checking portal health...".cyan());

    let url = format!("http://{}/portal/health", server);
    let client = reqwest::Client::new();

    match client.get(&url).send().await {
        Ok(resp) => {
            let status = resp.status();
            if status.is_success() {
                println!("{} Health check passed", "✓".green());

                if let Ok(body) = resp.json::<serde_json::Value>().await {
                    println!("  Status: {}", body["status"].as_str().unwrap_or("unknown"));
                    println!("  Service: {}", body["service"].as_str().unwrap_or("unknown"));
                    println!("  Version: {}", body["version"].as_str().unwrap_or("unknown"));
                    println!("  Sync: {}", body["sync"].as_str().unwrap_or("unknown"));
                }
            } else {
                println!("{} Health check failed: {}", "✗".red(), status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to portal: {}", "✗".red(), e);
            println!("  Make sure the portal is running on {}", server);
        }
    }
}

async fn show_dataset(server: &str, full: bool) {
    println!("{}", "Fetching dataset...".cyan());

    let url = format!("http://{}/portal/dataset", server);
    let body = match reqwest::get(&url).await {
        Ok(resp) => match resp.json::<serde_json::Value>().await {
            Ok(body) => body,
            Err(e) => {
                println!("{} Unreadable response: {}", "✗".red(), e);
                return;
            }
        },
        Err(e) => {
            println!("{} Cannot connect to portal: {}", "✗".red(), e);
            return;
        }
    };

    if full {
        println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
        return;
    }

    let status = body["status"].as_str().unwrap_or("unknown");
    let marker = if status == "online" { "✓".green() } else { "!".yellow() };
    println!("{} Sync status: {}", marker, status);
    if body["isSyncing"].as_bool().unwrap_or(false) {
        println!("  {}", "Sync in progress".yellow());
    }
    println!("  Students: {}", body["counts"]["students"]);
    println!("  Sessions: {}", body["counts"]["sessions"]);
    println!("  Rooms:    {}", body["counts"]["rooms"]);

    if let Some(students) = body["data"]["students"].as_array() {
        println!("\n{}", "Students".bold());
        println!("{}", "─".repeat(60));
        for student in students {
            println!(
                "  {:<12} {:<24} {:<6} {}",
                student["id"].as_str().unwrap_or("-"),
                student["displayName"].as_str().unwrap_or("-"),
                student["classLabel"].as_str().unwrap_or("-"),
                colour_status(student["status"].as_str().unwrap_or("-")),
            );
        }
    }
}

fn colour_status(status: &str) -> ColoredString {
    match status {
        "IN_PROGRESS" => status.cyan(),
        "COMPLETED" => status.green(),
        "BLOCKED" => status.red().bold(),
        _ => status.normal(),
    }
}

async fn read_snapshot(endpoint: &str) {
    println!("{}", "Reading snapshot from remote store...".cyan());
    println!("  Endpoint: {}", endpoint);

    let config = RemoteConfig {
        endpoint: endpoint.to_string(),
        ..RemoteConfig::default()
    };
    let store = match HttpRemoteStore::new(config) {
        Ok(store) => store,
        Err(e) => {
            println!("{} {}", "✗".red(), e);
            return;
        }
    };

    match store.fetch_snapshot().await {
        Ok(dataset) => {
            let counts = dataset.counts();
            println!("{} Snapshot received", "✓".green());
            println!("  Students: {}", counts.students);
            println!("  Sessions: {}", counts.sessions);
            println!("  Rooms:    {}", counts.rooms);
            if dataset.is_empty() {
                println!(
                    "  {}",
                    "Empty snapshot: the portal would reject this if it already holds data".yellow()
                );
            }
            for session in dataset.sessions.iter().filter(|s| s.is_active) {
                println!(
                    "  Active session {} (class {}, {} min)",
                    session.label.cyan(),
                    session.class_label,
                    session.duration_minutes
                );
            }
        }
        Err(e) => {
            println!("{} Snapshot failed: {}", "✗".red(), e);
        }
    }
}

async fn student_login(server: &str, nis: &str, password: &str, class: &str, pin: &str) {
    println!("{}", "Logging in...".cyan());

    let url = format!("http://{}/portal/login/student", server);
    let body = json!({ "nis": nis, "password": password, "studentClass": class, "pin": pin });

    match reqwest::Client::new().post(&url).json(&body).send().await {
        Ok(resp) => {
            let ok = resp.status().is_success();
            let body = resp.json::<serde_json::Value>().await.unwrap_or_default();
            if ok {
                println!("{} Login accepted", "✓".green());
                println!("  Student: {}", body["data"]["student"]["displayName"]);
                println!("  Session: {}", body["data"]["session"]["label"]);
                println!("  Duration: {} min", body["data"]["session"]["durationMinutes"]);
            } else {
                println!("{} Login refused: {}", "✗".red(), body["message"]);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to portal: {}", "✗".red(), e);
        }
    }
}

async fn dispatch(server: &str, username: &str, password: &str, action: serde_json::Value, stage: bool) {
    let path = if stage { "stage" } else { "dispatch" };
    let url = format!("http://{}/portal/{}", server, path);

    let mut body = action;
    body["actor"] = json!({ "username": username, "password": password });

    match reqwest::Client::new().post(&url).json(&body).send().await {
        Ok(resp) => {
            let status = resp.status();
            let reply = resp.json::<serde_json::Value>().await.unwrap_or_default();
            if status.is_success() {
                let what = if stage { "Edit staged" } else { "Action applied" };
                println!("{} {}", "✓".green(), what);
            } else {
                println!("{} {} ({})", "✗".red(), reply["message"], status);
            }
        }
        Err(e) => {
            println!("{} Cannot connect to portal: {}", "✗".red(), e);
        }
    }
}

async fn take_exam(server: &str, nis: &str, password: &str, class: &str, pin: &str, camera: bool) {
    println!("\n{}", "Exam Mode".bold().green());
    println!("{}", "═".repeat(60).green());

    let url = format!("ws://{}/portal/exam", server);
    let (ws_stream, _) = match connect_async(&url).await {
        Ok(connection) => connection,
        Err(e) => {
            println!("{} Cannot connect to portal: {}", "✗".red(), e);
            return;
        }
    };
    println!("{} Connected to exam surface", "✓".green());

    let (mut write, mut read) = ws_stream.split();

    let start = json!({ "type": "Start", "nis": nis, "password": password, "studentClass": class, "pin": pin });
    if write.send(Message::Text(start.to_string())).await.is_err() {
        println!("{} Failed to send Start message", "✗".red());
        return;
    }

    match timeout(Duration::from_secs(10), read.next()).await {
        Ok(Some(Ok(Message::Text(text)))) => {
            let reply: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
            match reply["type"].as_str() {
                Some("Started") => {
                    println!("{} Exam started", "✓".green());
                    println!("  Session: {}", reply["ticket"]["session"]["label"]);
                    if let Some(doc) = reply["ticket"]["session"]["externalDocumentRef"].as_str() {
                        println!("  Document: {}", doc);
                    }
                }
                Some("Error") => {
                    println!("{} {}", "✗".red(), reply["message"]);
                    return;
                }
                _ => println!("Response: {}", text),
            }
        }
        Ok(_) => {
            println!("{} Connection closed", "✗".red());
            return;
        }
        Err(_) => {
            println!("{} Timeout waiting for the portal", "✗".red());
            return;
        }
    }

    let receive_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = read.next().await {
            if let Message::Text(text) = msg {
                print_exam_message(&text);
            }
        }
    });

    println!(
        "Type {} to accept the lockdown notice, {} for commands, {} to leave\n",
        "consent".cyan(),
        "help".cyan(),
        "quit".cyan()
    );

    loop {
        print!("{} ", "►".cyan());
        io::stdout().flush().ok();

        let mut input = String::new();
        if io::stdin().read_line(&mut input).is_err() {
            break;
        }

        let message = match input.trim() {
            "" => continue,
            "quit" | "exit" => break,
            "help" => {
                print_exam_help();
                continue;
            }
            "consent" => json!({ "type": "Consent", "fullscreen": true, "wakeLock": true, "camera": camera }),
            "resume" => json!({ "type": "Resume", "fullscreen": true }),
            "finish" => json!({ "type": "Finish" }),
            other => match other.parse::<Signal>() {
                Ok(signal) => json!({ "type": "Signal", "signal": signal }),
                Err(e) => {
                    println!("{} {}. Type 'help' for commands.", "✗".yellow(), e);
                    continue;
                }
            },
        };

        if write.send(Message::Text(message.to_string())).await.is_err() {
            println!("{} Connection lost", "✗".red());
            break;
        }
    }

    receive_task.abort();
    println!("Leaving exam; any remaining lockdown is released by the portal.");
}

fn print_exam_message(text: &str) {
    let message: serde_json::Value = serde_json::from_str(text).unwrap_or_default();
    match message["type"].as_str() {
        Some("State") => {
            let snapshot = &message["snapshot"];
            let state = snapshot["state"].as_str().unwrap_or("?");
            let remaining = snapshot["remainingSecs"].as_u64().unwrap_or(0);
            let line = format!(
                "{} | violations {}/{} | {:02}:{:02} left",
                state,
                snapshot["violations"],
                snapshot["maxViolations"],
                remaining / 60,
                remaining % 60
            );
            match state {
                "violated" => println!("\r{} {}", "◀".yellow(), line.yellow()),
                "terminated" => println!(
                    "\r{} {} ({})",
                    "◀".red(),
                    line.red().bold(),
                    snapshot["reason"].as_str().unwrap_or("-")
                ),
                _ => {}
            }
        }
        Some("Release") => println!("\r{} release {}", "◀".green(), message["capability"]),
        Some("Error") => println!("\r{} {}", "◀".red(), message["message"]),
        _ => println!("\r{} {}", "◀".green(), text.bright_white()),
    }
}

fn print_exam_help() {
    println!("\n{}", "Exam Commands".bold());
    println!("{}", "─".repeat(60));
    println!("  {}       accept the lockdown notice and arm the monitor", "consent".cyan());
    println!("  {}        report leaving the exam tab", "hidden".cyan());
    println!("  {}          report window focus loss", "blur".cyan());
    println!("  {}    report leaving full-screen", "fullscreen".cyan());
    println!("  {}          report a copy attempt", "copy".cyan());
    println!("  {}        acknowledge a violation and re-enter full-screen", "resume".cyan());
    println!("  {}        submit and end the attempt", "finish".cyan());
    println!("\n{}: quit, exit", "Commands".bold());
    println!();
}

fn list_scenarios() {
    println!("\n{}", "Available Validation Scenarios:".bold());
    println!("  {} - Student login with matching class and code", "login".cyan());
    println!("  {} - Login refused for a session of another class", "class-mismatch".cyan());
    println!("  {} - Proctor block terminates an armed attempt", "remote-block".cyan());
    println!("  {} - Three spaced violations terminate the attempt", "violations".cyan());
    println!("  {} - Unconfirmed write reverts on the next poll", "ambiguous-write".cyan());
    println!("  {} - Empty snapshot does not erase known students", "data-loss".cyan());
    println!("\nExample: examsy-cli validate --scenario remote-block");
}

async fn run_scenario(scenario: &str) {
    println!("\n{} {}", "Running scenario:".bold(), scenario.cyan());
    println!("{}", "─".repeat(60));

    let result = match scenario {
        "login" => validate_login().await,
        "class-mismatch" => validate_class_mismatch().await,
        "remote-block" => validate_remote_block().await,
        "violations" => validate_violations().await,
        "ambiguous-write" => validate_ambiguous_write().await,
        "data-loss" => validate_data_loss().await,
        _ => {
            println!("{} Unknown scenario: {}", "✗".red(), scenario);
            list_scenarios();
            return;
        }
    };

    if result {
        println!("\n{} Scenario passed", "✓".green().bold());
    } else {
        println!("\n{} Scenario failed", "✗".red().bold());
    }
}

async fn run_all_validations() {
    println!("\n{}", "Running All Validation Scenarios".bold().green());
    println!("{}\n", "═".repeat(60).green());

    let scenarios = [
        "login",
        "class-mismatch",
        "remote-block",
        "violations",
        "ambiguous-write",
        "data-loss",
    ];

    let mut passed = 0;
    for scenario in scenarios {
        print!("  {:<20}", scenario);
        io::stdout().flush().ok();
        let ok = match scenario {
            "login" => validate_login().await,
            "class-mismatch" => validate_class_mismatch().await,
            "remote-block" => validate_remote_block().await,
            "violations" => validate_violations().await,
            "ambiguous-write" => validate_ambiguous_write().await,
            _ => validate_data_loss().await,
        };
        if ok {
            passed += 1;
            println!("{}", "✓".green());
        } else {
            println!("{}", "✗".red());
        }
    }

    println!("\n{}", "═".repeat(60));
    let summary = format!("{}/{} scenarios passed", passed, scenarios.len());
    if passed == scenarios.len() {
        println!("{}", summary.green().bold());
    } else {
        println!("{}", summary.red().bold());
    }
}

fn sample_dataset(session_class: &str) -> Dataset {
    Dataset {
        students: vec![Student {
            id: "1234".to_string(),
            display_name: "Demo Student".to_string(),
            class_label: "7".to_string(),
            credential_secret: "secret".to_string(),
            status: StudentStatus::NotStarted,
            room_ref: Some("r-1".to_string()),
        }],
        sessions: vec![ExamSession {
            id: "s-1".to_string(),
            label: "Mathematics".to_string(),
            class_label: session_class.to_string(),
            access_code: "ABCD".to_string(),
            duration_minutes: 90,
            is_active: true,
            external_document_ref: None,
        }],
        rooms: vec![Room {
            id: "r-1".to_string(),
            label: "ROOM 1".to_string(),
            capacity: 30,
            proctor_username: Some("proctor1".to_string()),
            proctor_secret: Some("proctor123".to_string()),
        }],
    }
}

fn sample_login() -> StudentLogin {
    StudentLogin {
        student_id: "1234".to_string(),
        secret: "secret".to_string(),
        class_label: "7".to_string(),
        access_code: "ABCD".to_string(),
    }
}

fn offline_engine(dataset: Dataset) -> SyncEngine<InMemoryRemote, MemoryCache> {
    let sync = SyncConfig {
        fast_interval: Duration::from_millis(200),
        slow_interval: Duration::from_millis(500),
        debounce: Duration::from_millis(100),
    };
    SyncEngine::new(InMemoryRemote::new(dataset), MemoryCache::default(), sync)
}

async fn validate_login() -> bool {
    let engine = offline_engine(sample_dataset("7"));
    engine.bootstrap().await;

    match portal::start_session(&engine, &sample_login()).await {
        Ok(ticket) => {
            ticket.confirmed && engine.student_status("1234") == Some(StudentStatus::InProgress)
        }
        Err(e) => {
            println!("\n  {} {}", "✗".red(), e);
            false
        }
    }
}

async fn validate_class_mismatch() -> bool {
    let engine = offline_engine(sample_dataset("8"));
    engine.bootstrap().await;
    let before = engine.current_dataset();

    let refused = matches!(
        portal::start_session(&engine, &sample_login()).await,
        Err(PortalError::Login(LoginError::SessionClassMismatch { .. }))
    );
    refused && *engine.current_dataset() == *before
}

async fn validate_remote_block() -> bool {
    let engine = offline_engine(sample_dataset("7"));
    engine.bootstrap().await;
    engine.start_polling();

    let ticket = match portal::start_session(&engine, &sample_login()).await {
        Ok(ticket) => ticket,
        Err(_) => return false,
    };

    let grants = std::sync::Arc::new(ClientGrants::default());
    let policy = MonitorPolicy::new(&MonitorConfig::default(), ticket.session.duration());
    let monitor = spawn_monitor(
        ticket.student.id.clone(),
        ticket.session.id.clone(),
        policy,
        client_capabilities(grants, false, |_| {}),
        engine.clone(),
    );
    if monitor.consent().await.is_err() {
        return false;
    }

    // Another operator blocks the student directly on the remote store.
    let block = Action::UpdateStudentStatus {
        id: "1234".to_string(),
        status: StudentStatus::Blocked,
    };
    if engine.remote().apply_external(&block).is_err() {
        return false;
    }

    let mut snapshots = monitor.subscribe();
    let terminated = timeout(Duration::from_secs(5), async {
        loop {
            if snapshots.borrow_and_update().state.is_terminated() {
                return true;
            }
            if snapshots.changed().await.is_err() {
                return snapshots.borrow().state.is_terminated();
            }
        }
    })
    .await
    .unwrap_or(false);

    engine.stop_polling();
    terminated
}

async fn validate_violations() -> bool {
    let engine = offline_engine(sample_dataset("7"));
    engine.bootstrap().await;
    if portal::start_session(&engine, &sample_login()).await.is_err() {
        return false;
    }

    let config = MonitorConfig {
        cooldown: Duration::from_millis(200),
        ..MonitorConfig::default()
    };
    let policy = MonitorPolicy::new(&config, Duration::from_secs(60));
    let monitor = spawn_monitor(
        "1234",
        "s-1",
        policy,
        client_capabilities(std::sync::Arc::new(ClientGrants::default()), false, |_| {}),
        engine.clone(),
    );
    if monitor.consent().await.is_err() {
        return false;
    }

    let mut last = None;
    for _ in 0..3 {
        last = monitor.signal(Signal::FocusLost).await.ok();
        let _ = monitor.resume().await;
        sleep(Duration::from_millis(300)).await;
    }

    let terminated = last.map(|s| s.violations == 3 && s.state.is_terminated()).unwrap_or(false);
    terminated && engine.student_status("1234") == Some(StudentStatus::Blocked)
}

async fn validate_ambiguous_write() -> bool {
    let engine = offline_engine(sample_dataset("7"));
    engine.bootstrap().await;
    engine.remote().set_write_behavior(WriteBehavior::AmbiguousDropped);

    let admin = examsy_portal::Role::Admin;
    let action = Action::UpdateStudentStatus {
        id: "1234".to_string(),
        status: StudentStatus::Completed,
    };
    let assumed = matches!(engine.dispatch(&admin, action).await, Ok(true))
        && engine.student_status("1234") == Some(StudentStatus::Completed);

    engine.refresh().await;
    assumed && engine.student_status("1234") == Some(StudentStatus::NotStarted)
}

async fn validate_data_loss() -> bool {
    let engine = offline_engine(sample_dataset("7"));
    engine.bootstrap().await;
    engine.remote().push_fetch_fault(FetchFault::Empty);
    engine.refresh().await;
    engine.current_dataset().students.len() == 1
}
